use crate::{
    callconv::ArgRole,
    types::{
        rules::{self, TypeRules},
        PrimitiveKind, ValueTypeDescriptor,
    },
    value::{convert, ArithmeticError, NumberSign, StackValue},
    vm::{
        calls::CallKind,
        error::{DecodeError, ExecResult, ManagedExceptionKind, UnimplementedError, Unwind, VerificationError},
        frame::Frame,
        interpreter::{Flow, Interpreter, ReturnValue},
        opcodes::{self, BranchKind, Opcode, PrefixedOpcode},
        stack::copy_struct_out,
    },
};
use std::cmp::Ordering;

/// The relation tested by a comparison or conditional branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Relation {
    Eq,
    NeUn,
    Gt,
    GtUn,
    Ge,
    GeUn,
    Lt,
    LtUn,
    Le,
    LeUn,
}

impl Relation {
    fn of_branch(kind: BranchKind) -> Option<Self> {
        Some(match kind {
            BranchKind::Eq => Self::Eq,
            BranchKind::NeUn => Self::NeUn,
            BranchKind::Gt => Self::Gt,
            BranchKind::GtUn => Self::GtUn,
            BranchKind::Ge => Self::Ge,
            BranchKind::GeUn => Self::GeUn,
            BranchKind::Lt => Self::Lt,
            BranchKind::LtUn => Self::LtUn,
            BranchKind::Le => Self::Le,
            BranchKind::LeUn => Self::LeUn,
            BranchKind::Always | BranchKind::True | BranchKind::False => return None,
        })
    }

    /// Unsigned integer comparison, unordered float comparison.
    fn is_unsigned(self) -> bool {
        matches!(self, Self::NeUn | Self::GtUn | Self::GeUn | Self::LtUn | Self::LeUn)
    }

    /// `cgt.un` doubles as the "not null" test on object references.
    fn equality_only(self) -> bool {
        matches!(self, Self::Eq | Self::NeUn | Self::GtUn)
    }

    fn holds(self, order: Option<Ordering>) -> bool {
        use Ordering::*;
        match (self, order) {
            (Self::NeUn, o) => o != Some(Equal),
            (_, None) => self.is_unsigned(),
            (Self::Eq, Some(o)) => o == Equal,
            (Self::Gt | Self::GtUn, Some(o)) => o == Greater,
            (Self::Ge | Self::GeUn, Some(o)) => o != Less,
            (Self::Lt | Self::LtUn, Some(o)) => o == Less,
            (Self::Le | Self::LeUn, Some(o)) => o != Greater,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            Self::Eq => "ceq",
            Self::NeUn => "bne.un",
            Self::Gt => "cgt",
            Self::GtUn => "cgt.un",
            Self::Ge => "bge",
            Self::GeUn => "bge.un",
            Self::Lt => "clt",
            Self::LtUn => "clt.un",
            Self::Le => "ble",
            Self::LeUn => "ble.un",
        }
    }
}

impl Interpreter {
    pub(crate) fn execute(&self, frame: &mut Frame, code: &[u8], op: Opcode, at: usize) -> ExecResult<Flow> {
        use Opcode::*;

        macro_rules! push {
            ($val:expr) => {
                frame.stack.push($val)?
            };
        }
        macro_rules! pop {
            () => {
                frame.stack.pop_value()?
            };
        }
        macro_rules! unary {
            ($instruction:literal, $op:ident) => {{
                let value = pop!();
                match value.$op() {
                    Ok(v) => push!(v),
                    Err(e) => return Err(self.arithmetic_error(e, $instruction)),
                }
            }};
        }

        if !matches!(op, CallVirt(_)) {
            frame.constrained = None;
        }

        match op {
            Nop | Break => {}

            LdArg(i) => {
                let (desc, address) = frame.arg(i)?;
                self.load_location(frame, desc.ty, address)?;
            }
            LdArgA(i) => {
                let (_, address) = frame.arg(i)?;
                push!(StackValue::ManagedPtr(address as usize));
            }
            StArg(i) => {
                let (desc, address) = frame.arg(i)?;
                self.store_location(frame, desc.ty, address, "starg")?;
            }
            LdLoc(i) => {
                let (ty, address) = frame.local(i)?;
                self.load_location(frame, ty, address)?;
            }
            LdLocA(i) => {
                let (_, address) = frame.local(i)?;
                push!(StackValue::ManagedPtr(address as usize));
            }
            StLoc(i) => {
                let (ty, address) = frame.local(i)?;
                self.store_location(frame, ty, address, "stloc")?;
            }

            LdNull => push!(StackValue::null()),
            LdcI4(v) => push!(StackValue::Int32(v)),
            LdcI8(v) => push!(StackValue::Int64(v)),
            LdcR4(v) => push!(StackValue::Float(v)),
            LdcR8(v) => push!(StackValue::Double(v)),
            Dup => frame.stack.dup()?,
            Pop => {
                frame.stack.pop()?;
            }

            Jmp(_) => return Err(UnimplementedError::Opcode("jmp").into()),
            Call(token) => self.call(frame, at, token, CallKind::Call)?,
            CallVirt(token) => self.call(frame, at, token, CallKind::CallVirt)?,
            NewObj(token) => self.call(frame, at, token, CallKind::NewObj)?,
            CallI(token) => self.calli(frame, token)?,
            Ret => return self.ret(frame).map(Flow::Return),

            Branch(kind, target) => {
                let taken = self.branch_condition(frame, kind)?;
                vm_event!(
                    self,
                    Branch {
                        mnemonic: op.mnemonic(),
                        target: target as usize,
                        taken,
                    }
                );
                if taken {
                    self.jump(frame, code, at, target)?;
                }
            }
            Switch { count, table } => {
                let index = match pop!() {
                    StackValue::Int32(i) => i as u32 as u64,
                    StackValue::NativeInt(i) => i as u64,
                    other => {
                        return Err(VerificationError::UnexpectedOperand {
                            instruction: "switch",
                            actual: ValueTypeDescriptor::Primitive(other.kind()),
                        }
                        .into())
                    }
                };
                if index < count as u64 {
                    let target = opcodes::switch_target(code, table, index as u32, frame.ip)
                        .ok_or(DecodeError::Truncated(table as usize))?;
                    self.jump(frame, code, at, target)?;
                }
            }

            LdInd(kind) => {
                let address = self.pop_address(frame, "ldind")?;
                // SAFETY: the address was produced by managed code as a
                // pointer to a value of this kind.
                push!(unsafe { StackValue::load(address, kind) });
            }
            StInd(kind) => {
                frame.stack.normalize();
                let value = frame.stack.pop()?;
                let address = self.pop_address(frame, "stind")?;
                self.store_value(ValueTypeDescriptor::Primitive(kind), address, value, "stind", true)?;
            }

            Binary(op) => {
                let right = pop!();
                let left = pop!();
                match left.binary(op, right, self.config.type_rules) {
                    Ok(v) => push!(v),
                    Err(e) => return Err(self.arithmetic_error(e, op.mnemonic())),
                }
            }
            Shift(op) => {
                let amount = pop!();
                let value = pop!();
                if !rules::shift_allowed(value.kind(), amount.kind(), self.config.type_rules) {
                    return Err(VerificationError::OperandMismatch {
                        instruction: "shift",
                        left: ValueTypeDescriptor::Primitive(value.kind()),
                        right: ValueTypeDescriptor::Primitive(amount.kind()),
                    }
                    .into());
                }
                match value.shift(amount, op) {
                    Ok(v) => push!(v),
                    Err(e) => return Err(self.arithmetic_error(e, "shift")),
                }
            }
            Neg => unary!("neg", neg),
            Not => unary!("not", not),
            Conv(kind, mode) => {
                let value = pop!();
                match convert(value, kind, mode) {
                    Ok(v) => push!(v),
                    Err(e) => return Err(self.arithmetic_error(e, "conv")),
                }
            }
            CkFinite => {
                let value = pop!();
                match value {
                    StackValue::Float(f) if !f.is_finite() => {
                        return Err(self.exception(ManagedExceptionKind::Arithmetic))
                    }
                    StackValue::Double(d) if !d.is_finite() => {
                        return Err(self.exception(ManagedExceptionKind::Arithmetic))
                    }
                    StackValue::Float(_) | StackValue::Double(_) => push!(value),
                    other => {
                        return Err(VerificationError::UnexpectedOperand {
                            instruction: "ckfinite",
                            actual: ValueTypeDescriptor::Primitive(other.kind()),
                        }
                        .into())
                    }
                }
            }

            CpObj(token) => self.copy_object(frame, at, token)?,
            LdObj(token) => self.load_object(frame, at, token)?,
            StObj(token) => self.store_object(frame, at, token)?,
            LdStr(token) => self.load_string(frame, token)?,
            CastClass(token) => self.cast(frame, at, token, true)?,
            IsInst(token) => self.cast(frame, at, token, false)?,
            Box(token) => self.box_value(frame, at, token)?,
            Unbox(token) => self.unbox(frame, at, token, false)?,
            UnboxAny(token) => self.unbox(frame, at, token, true)?,
            Throw => self.throw(frame)?,

            LdFld(token) => self.load_field(frame, at, token, false)?,
            LdFldA(token) => self.load_field(frame, at, token, true)?,
            StFld(token) => self.store_field(frame, at, token)?,
            LdSFld(token) => self.load_static(frame, at, token, false)?,
            LdSFldA(token) => self.load_static(frame, at, token, true)?,
            StSFld(token) => self.store_static(frame, at, token)?,

            NewArr(token) => self.new_array(frame, at, token)?,
            LdLen => self.array_length(frame)?,
            LdElemA(token) => self.load_element_address(frame, at, token)?,
            LdElem(element) => self.load_element(frame, at, element)?,
            StElem(element) => self.store_element(frame, at, element)?,

            RefAnyVal(_) => return Err(UnimplementedError::Opcode("refanyval").into()),
            MkRefAny(_) => return Err(UnimplementedError::Opcode("mkrefany").into()),
            LdToken(token) => self.load_token(frame, token)?,

            EndFinally => self.end_finally(frame)?,
            Leave(target) => self.leave(frame, at as u32, target)?,

            Prefixed(prefixed) => self.execute_prefixed(frame, prefixed, at)?,
        }
        Ok(Flow::Continue)
    }

    fn execute_prefixed(&self, frame: &mut Frame, op: PrefixedOpcode, at: usize) -> ExecResult<()> {
        use PrefixedOpcode::*;
        match op {
            ArgList => {
                let cookie = frame
                    .hidden_arg(ArgRole::VarArgCookie)
                    .ok_or(VerificationError::MisplacedInstruction("arglist"))?;
                frame.stack.push(StackValue::NativeInt(cookie as isize))?;
            }
            Ceq => self.compare_and_push(frame, Relation::Eq)?,
            Cgt => self.compare_and_push(frame, Relation::Gt)?,
            CgtUn => self.compare_and_push(frame, Relation::GtUn)?,
            Clt => self.compare_and_push(frame, Relation::Lt)?,
            CltUn => self.compare_and_push(frame, Relation::LtUn)?,
            LdFtn(token) => self.load_function(frame, at, token, false)?,
            LdVirtFtn(token) => self.load_function(frame, at, token, true)?,
            LocAlloc => {
                // Unsigned operand; a negative native int can never fit.
                let size = match frame.stack.pop_value()? {
                    StackValue::Int32(i) => Some(i as u32 as usize),
                    StackValue::NativeInt(i) => usize::try_from(i).ok(),
                    other => {
                        return Err(VerificationError::UnexpectedOperand {
                            instruction: "localloc",
                            actual: ValueTypeDescriptor::Primitive(other.kind()),
                        }
                        .into())
                    }
                };
                let address = size
                    .and_then(|size| frame.localloc(size, self.config.localloc_limit))
                    .ok_or_else(|| self.exception(ManagedExceptionKind::StackOverflow))?;
                frame.stack.push(StackValue::NativeInt(address as isize))?;
            }
            EndFilter => self.end_filter(frame)?,
            Unaligned(_) | Volatile | Tail | No(_) | ReadOnly => {}
            InitObj(token) => self.init_object(frame, at, token)?,
            Constrained(token) => frame.constrained = Some(self.resolve_type(frame, at, token)?),
            CpBlk => {
                frame.stack.normalize();
                let size = frame.stack.pop_value()?.as_isize() as usize;
                let src = frame.stack.pop_value()?.as_ptr();
                let dest = frame.stack.pop_value()?.as_ptr();
                if size > 0 {
                    if src.is_null() || dest.is_null() {
                        return Err(self.exception(ManagedExceptionKind::NullReference));
                    }
                    // SAFETY: managed code vouches for both ranges.
                    unsafe { std::ptr::copy(src, dest, size) };
                }
            }
            InitBlk => {
                frame.stack.normalize();
                let size = frame.stack.pop_value()?.as_isize() as usize;
                let value = frame.stack.pop_value()?.as_isize() as u8;
                let dest = frame.stack.pop_value()?.as_ptr();
                if size > 0 {
                    if dest.is_null() {
                        return Err(self.exception(ManagedExceptionKind::NullReference));
                    }
                    // SAFETY: managed code vouches for the range.
                    unsafe { std::ptr::write_bytes(dest, value, size) };
                }
            }
            Rethrow => self.rethrow(frame, at as u32)?,
            SizeOf(token) => {
                let ty = self.resolve_type(frame, at, token)?;
                frame.stack.push(StackValue::Int32(ty.ty.size() as i32))?;
            }
            RefAnyType => return Err(UnimplementedError::Opcode("refanytype").into()),
        }
        Ok(())
    }

    /// Pushes the value of a local or argument. Large structs are pushed as
    /// aliases of their storage.
    fn load_location(&self, frame: &mut Frame, ty: ValueTypeDescriptor, address: *mut u8) -> ExecResult<()> {
        if ty.is_overflow() {
            frame.stack.push_alias(ty, address)?;
        } else {
            // SAFETY: `address` is the frame's storage for a value of `ty`.
            unsafe { frame.stack.push_value(ty, address)? };
        }
        Ok(())
    }

    fn store_location(
        &self,
        frame: &mut Frame,
        ty: ValueTypeDescriptor,
        address: *mut u8,
        instruction: &'static str,
    ) -> ExecResult<()> {
        frame.stack.normalize();
        let value = frame.stack.pop()?;
        self.store_value(ty, address, value, instruction, false)
    }

    /// Writes a popped stack entry to a location of type `target`. Reference
    /// stores into the heap go through the host's write barrier.
    pub(crate) fn store_value(
        &self,
        target: ValueTypeDescriptor,
        address: *mut u8,
        (ty, bits): (ValueTypeDescriptor, u64),
        instruction: &'static str,
        heap: bool,
    ) -> ExecResult<()> {
        match target {
            ValueTypeDescriptor::Primitive(kind) => {
                let ValueTypeDescriptor::Primitive(actual) = ty else {
                    return Err(VerificationError::IncompatibleStore { target: kind, value: ty }.into());
                };
                if !rules::store_allowed(kind.stack_normal(), actual, self.config.type_rules) {
                    return Err(VerificationError::IncompatibleStore { target: kind, value: ty }.into());
                }
                let value = StackValue::from_slot(actual, bits);
                // SAFETY: `address` is a location of type `target`.
                unsafe {
                    match value {
                        StackValue::ObjectRef(obj) if heap && kind == PrimitiveKind::Object => {
                            self.host.write_ref(address.cast(), obj)
                        }
                        _ => value.store(address, kind),
                    }
                }
            }
            _ => {
                if ty.struct_handle() != target.struct_handle() {
                    return Err(VerificationError::UnexpectedOperand {
                        instruction,
                        actual: ty,
                    }
                    .into());
                }
                // SAFETY: the entry was just popped, so out-of-line storage is
                // still readable; `address` holds `target.size()` bytes.
                unsafe { copy_struct_out(ty, bits, address) };
            }
        }
        Ok(())
    }

    /// Pops a managed or unmanaged pointer, raising on null.
    pub(crate) fn pop_address(&self, frame: &mut Frame, instruction: &'static str) -> ExecResult<*mut u8> {
        let address = match frame.stack.pop_value()? {
            StackValue::ManagedPtr(p) => p,
            StackValue::NativeInt(p) => p as usize,
            StackValue::Int64(p) if self.config.type_rules == TypeRules::Permissive => p as usize,
            other => {
                return Err(VerificationError::UnexpectedOperand {
                    instruction,
                    actual: ValueTypeDescriptor::Primitive(other.kind()),
                }
                .into())
            }
        };
        if address == 0 {
            return Err(self.exception(ManagedExceptionKind::NullReference));
        }
        Ok(address as *mut u8)
    }

    pub(crate) fn arithmetic_error(&self, error: ArithmeticError, instruction: &'static str) -> Unwind {
        match error {
            ArithmeticError::Overflow => self.exception(ManagedExceptionKind::Overflow),
            ArithmeticError::DivideByZero => self.exception(ManagedExceptionKind::DivideByZero),
            ArithmeticError::InvalidOperands(left, right) => VerificationError::OperandMismatch {
                instruction,
                left: ValueTypeDescriptor::Primitive(left),
                right: ValueTypeDescriptor::Primitive(right),
            }
            .into(),
            ArithmeticError::InvalidOperand(kind) => VerificationError::UnexpectedOperand {
                instruction,
                actual: ValueTypeDescriptor::Primitive(kind),
            }
            .into(),
        }
    }

    fn compare(&self, frame: &mut Frame, relation: Relation) -> ExecResult<bool> {
        let right = frame.stack.pop_value()?;
        let left = frame.stack.pop_value()?;
        if !rules::comparison_allowed(left.kind(), right.kind(), relation.equality_only(), self.config.type_rules) {
            return Err(VerificationError::OperandMismatch {
                instruction: relation.mnemonic(),
                left: ValueTypeDescriptor::Primitive(left.kind()),
                right: ValueTypeDescriptor::Primitive(right.kind()),
            }
            .into());
        }
        let sign = if relation.is_unsigned() {
            NumberSign::Unsigned
        } else {
            NumberSign::Signed
        };
        Ok(relation.holds(left.compare(right, sign)))
    }

    fn compare_and_push(&self, frame: &mut Frame, relation: Relation) -> ExecResult<()> {
        let result = self.compare(frame, relation)?;
        frame.stack.push(StackValue::Int32(result as i32))?;
        Ok(())
    }

    fn branch_condition(&self, frame: &mut Frame, kind: BranchKind) -> ExecResult<bool> {
        match (kind, Relation::of_branch(kind)) {
            (_, Some(relation)) => self.compare(frame, relation),
            (BranchKind::True, None) => Ok(!frame.stack.pop_value()?.is_zero()),
            (BranchKind::False, None) => Ok(frame.stack.pop_value()?.is_zero()),
            _ => Ok(true),
        }
    }

    /// Transfers control within the method. Backward jumps are where
    /// pending interrupts are observed.
    fn jump(&self, frame: &mut Frame, code: &[u8], at: usize, target: u32) -> ExecResult<()> {
        if target as usize >= code.len() {
            return Err(VerificationError::BranchOutOfRange(target as i64).into());
        }
        if target as usize <= at {
            self.check_interrupt()?;
        }
        frame.ip = target as usize;
        Ok(())
    }

    fn ret(&self, frame: &mut Frame) -> ExecResult<ReturnValue> {
        let ret = frame.method.ret;
        if ret == ValueTypeDescriptor::VOID {
            if !frame.stack.is_empty() {
                return Err(VerificationError::UnbalancedReturn(frame.stack.len()).into());
            }
            return Ok(ReturnValue::Void);
        }
        if frame.stack.len() != 1 {
            return Err(VerificationError::UnbalancedReturn(frame.stack.len()).into());
        }
        let value = frame.stack.pop()?;
        if let Some(buffer) = frame.hidden_arg(ArgRole::RetBuf) {
            self.store_value(ret, buffer as *mut u8, value, "ret", true)?;
            return Ok(ReturnValue::Struct);
        }
        if let Some(slot) = frame.ret_slot {
            self.store_value(ret, slot, value, "ret", false)?;
            return Ok(ReturnValue::Struct);
        }
        if ret.is_overflow() {
            return Err(VerificationError::UnexpectedOperand {
                instruction: "ret",
                actual: ret,
            }
            .into());
        }
        let mut bits = 0u64;
        self.store_value(ret, (&mut bits as *mut u64).cast(), value, "ret", false)?;
        Ok(ReturnValue::Scalar(bits))
    }
}
