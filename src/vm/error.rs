use crate::{
    types::{CallConv, PrimitiveKind, ValueTypeDescriptor},
    value::ObjectRef,
    vm::method::MethodHandle,
};
use std::fmt::{Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    #[error("Verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("Malformed bytecode: {0}")]
    Decode(#[from] DecodeError),

    #[error("Not implemented: {0}")]
    Unimplemented(#[from] UnimplementedError),

    #[error("Resolution failed: {0}")]
    Resolution(#[from] ResolutionError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VerificationError {
    #[error("Stack underflow")]
    StackUnderflow,

    #[error("Stack overflow past declared max stack {0}")]
    StackOverflow(usize),

    #[error("Invalid operands for {instruction}: {left:?}, {right:?}")]
    OperandMismatch {
        instruction: &'static str,
        left: ValueTypeDescriptor,
        right: ValueTypeDescriptor,
    },

    #[error("Invalid operand for {instruction}: {actual:?}")]
    UnexpectedOperand {
        instruction: &'static str,
        actual: ValueTypeDescriptor,
    },

    #[error("Cannot store {value:?} into a {target} location")]
    IncompatibleStore {
        target: PrimitiveKind,
        value: ValueTypeDescriptor,
    },

    #[error("Branch target {0} is outside the method body")]
    BranchOutOfRange(i64),

    #[error("Invalid local index {0}")]
    InvalidLocal(u16),

    #[error("Invalid argument index {0}")]
    InvalidArgument(u16),

    #[error("{0} executed outside of its handler")]
    MisplacedInstruction(&'static str),

    #[error("Execution ran past the end of the method body")]
    FellOffEnd,

    #[error("Method returned with {0} values on the stack")]
    UnbalancedReturn(usize),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Unknown opcode {byte:#04x} at IL_{offset:04x}")]
    UnknownOpcode { offset: usize, byte: u8 },

    #[error("Unknown prefixed opcode 0xfe {byte:#04x} at IL_{offset:04x}")]
    UnknownPrefixedOpcode { offset: usize, byte: u8 },

    #[error("Truncated operand at IL_{0:04x}")]
    Truncated(usize),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum UnimplementedError {
    #[error("calling convention {0:?}")]
    CallingConvention(CallConv),

    #[error("opcode {0}")]
    Opcode(&'static str),

    #[error("{target}: {detail}")]
    ArgumentClass { target: &'static str, detail: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("Token {token:#010x} could not be resolved as {kind}")]
    Token { token: u32, kind: &'static str },

    #[error("Method {0:?} has no body or native code")]
    NoCode(MethodHandle),

    #[error("{0}")]
    Host(String),
}

/// A fatal error together with where it was raised.
#[derive(Debug, Clone, PartialEq)]
pub struct FatalError {
    pub error: VmError,
    pub method: Option<String>,
    pub il_offset: Option<usize>,
}

impl Display for FatalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)?;
        match (&self.method, self.il_offset) {
            (Some(m), Some(o)) => write!(f, " (in {} at IL_{:04x})", m, o),
            (Some(m), None) => write!(f, " (in {})", m),
            _ => Ok(()),
        }
    }
}

impl std::error::Error for FatalError {}

/// Exceptions the core raises on its own behalf.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ManagedExceptionKind {
    NullReference,
    DivideByZero,
    Overflow,
    Arithmetic,
    IndexOutOfRange,
    InvalidCast,
    ArrayTypeMismatch,
    StackOverflow,
    OutOfMemory,
    InvalidProgram,
    TypeLoad,
    MissingMethod,
    ThreadInterrupted,
}

impl ManagedExceptionKind {
    pub fn type_name(self) -> &'static str {
        use ManagedExceptionKind::*;
        match self {
            NullReference => "System.NullReferenceException",
            DivideByZero => "System.DivideByZeroException",
            Overflow => "System.OverflowException",
            Arithmetic => "System.ArithmeticException",
            IndexOutOfRange => "System.IndexOutOfRangeException",
            InvalidCast => "System.InvalidCastException",
            ArrayTypeMismatch => "System.ArrayTypeMismatchException",
            StackOverflow => "System.StackOverflowException",
            OutOfMemory => "System.OutOfMemoryException",
            InvalidProgram => "System.InvalidProgramException",
            TypeLoad => "System.TypeLoadException",
            MissingMethod => "System.MissingMethodException",
            ThreadInterrupted => "System.Threading.ThreadInterruptedException",
        }
    }
}

/// How an invocation exits other than by returning.
#[derive(Debug, Clone, PartialEq)]
pub enum Unwind {
    /// A managed exception, catchable by interpreted code.
    Exception(ObjectRef),
    /// A verification or unimplemented-path failure. `finally` and `fault`
    /// blocks still run, but nothing catches it.
    Fatal(Box<FatalError>),
}

impl Unwind {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Unwind::Fatal(_))
    }

    /// Attaches the method and offset to a fatal error that lacks them.
    pub fn with_context(self, method: &str, il_offset: usize) -> Self {
        match self {
            Unwind::Fatal(mut f) if f.method.is_none() => {
                f.method = Some(method.to_string());
                f.il_offset = Some(il_offset);
                Unwind::Fatal(f)
            }
            other => other,
        }
    }
}

impl From<VmError> for Unwind {
    fn from(error: VmError) -> Self {
        Unwind::Fatal(Box::new(FatalError {
            error,
            method: None,
            il_offset: None,
        }))
    }
}

macro_rules! fatal_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Unwind {
                fn from(e: $t) -> Self {
                    VmError::from(e).into()
                }
            }
        )*
    };
}

fatal_from!(VerificationError, DecodeError, UnimplementedError, ResolutionError);

pub type ExecResult<T> = Result<T, Unwind>;
