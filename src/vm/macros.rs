//! Tracer shorthands over the [`Interpreter`](crate::vm::Interpreter). The
//! tracer's arguments are only evaluated while it is enabled.

#[macro_export]
macro_rules! vm_trace {
    ($interp:expr, $($format:tt)*) => {
        if $interp.tracer_enabled() {
            $interp.tracer().msg($crate::vm::tracer::TraceLevel::Trace, $interp.indent(), format_args!($($format)*))
        }
    }
}

#[macro_export]
macro_rules! vm_error {
    ($interp:expr, $($format:tt)*) => {
        if $interp.tracer_enabled() {
            $interp.tracer().msg($crate::vm::tracer::TraceLevel::Error, $interp.indent(), format_args!($($format)*))
        }
    }
}

/// `vm_event!(interp, Branch { mnemonic, target, taken })`
#[macro_export]
macro_rules! vm_event {
    ($interp:expr, $kind:ident { $($field:ident $(: $value:expr)?),* $(,)? }) => {
        if $interp.tracer_enabled() {
            $interp.tracer().event(
                $interp.indent(),
                $crate::vm::tracer::TraceEvent::$kind { $($field $(: $value)?),* },
            );
        }
    };
}

/// Pops a primitive and binds its payload, failing verification on any
/// other stack kind.
#[macro_export]
macro_rules! vm_expect_stack {
    (let $variant:ident ( $inner:ident $(as $t:ty)? ) = $v:expr, $instruction:expr) => {
        let $inner = match $v {
            $crate::value::StackValue::$variant($inner) => $inner,
            other => {
                return Err($crate::vm::error::VerificationError::UnexpectedOperand {
                    instruction: $instruction,
                    actual: $crate::types::ValueTypeDescriptor::Primitive(other.kind()),
                }
                .into())
            }
        };
        $(
            let $inner = $inner as $t;
        )?
    };
}
