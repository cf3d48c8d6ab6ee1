//! Mapping between native calling conventions and the interpreter's
//! canonical argument layout.
//!
//! Every target implements [`CallingConvention::classify_args`], which places
//! each canonical argument (receiver, hidden arguments, then declared
//! parameters) into integer registers, floating-point registers or caller
//! stack slots, and assigns it an offset in the packed argument block the
//! interpreter reads. Entry stubs and outbound marshaling are both derived
//! from that one table.
use crate::{
    types::{CallConv, MethodSignature, PrimitiveKind, SigType, TypeHandle, TypeInfo, SLOT_SIZE},
    utils::align_up,
    vm::error::{ExecResult, UnimplementedError},
};
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    sync::Arc,
};

pub mod amd64;
pub mod arm64;
pub mod ffi;
pub mod riscv64;
pub mod stub;

pub use amd64::{Amd64SysV, Amd64Windows};
pub use arm64::Arm64;
pub use riscv64::RiscV64;
pub use stub::{EntryStub, StubOp};

/// Position of an argument in the canonical order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArgRole {
    This,
    RetBuf,
    VarArgCookie,
    GenericContext,
    Param(u16),
}

impl Display for ArgRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgRole::This => f.write_str("this"),
            ArgRole::RetBuf => f.write_str("retbuf"),
            ArgRole::VarArgCookie => f.write_str("cookie"),
            ArgRole::GenericContext => f.write_str("instantiation"),
            ArgRole::Param(i) => write!(f, "arg{}", i),
        }
    }
}

/// How a value is passed, independent of where.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgClass {
    Int { size: u8 },
    Float { size: u8 },
    Struct(Arc<TypeInfo>),
}

impl ArgClass {
    pub const POINTER: Self = ArgClass::Int { size: SLOT_SIZE as u8 };

    pub fn of_primitive(kind: PrimitiveKind) -> Self {
        if kind.is_float() {
            ArgClass::Float {
                size: kind.size() as u8,
            }
        } else {
            ArgClass::Int {
                size: kind.size() as u8,
            }
        }
    }

    pub fn of(ty: SigType, type_info: &dyn Fn(TypeHandle) -> Arc<TypeInfo>) -> Self {
        match ty {
            SigType::Primitive(p) => Self::of_primitive(p),
            SigType::Struct(h) => {
                let info = type_info(h);
                match info.primitive {
                    Some(p) => Self::of_primitive(p),
                    None => ArgClass::Struct(info),
                }
            }
        }
    }

    pub fn size(&self) -> usize {
        match self {
            ArgClass::Int { size } | ArgClass::Float { size } => *size as usize,
            ArgClass::Struct(info) => info.size,
        }
    }
}

/// A signature reduced to what argument passing needs.
#[derive(Clone, Debug, PartialEq)]
pub struct NativeSignature {
    pub call_conv: CallConv,
    pub has_this: bool,
    pub generic_context: bool,
    pub params: Vec<ArgClass>,
    /// For vararg signatures, the number of declared (non-variadic) params.
    pub fixed_params: Option<usize>,
    pub ret: Option<ArgClass>,
}

impl NativeSignature {
    pub fn from_method(
        sig: &MethodSignature,
        type_info: &dyn Fn(TypeHandle) -> Arc<TypeInfo>,
    ) -> Self {
        Self {
            call_conv: sig.call_conv,
            has_this: sig.has_this,
            generic_context: sig.generic_context,
            params: sig.params.iter().map(|p| ArgClass::of(*p, type_info)).collect(),
            fixed_params: sig.fixed_params,
            ret: (!sig.ret.is_void()).then(|| ArgClass::of(sig.ret, type_info)),
        }
    }

    pub fn is_vararg(&self) -> bool {
        self.call_conv == CallConv::VarArg
    }

    /// Whether the parameter is in the variadic tail of a vararg call.
    pub fn is_variadic(&self, param: usize) -> bool {
        self.is_vararg() && self.fixed_params.is_some_and(|n| param >= n)
    }

    /// Canonical argument order: receiver, return buffer, vararg cookie,
    /// instantiation argument, declared parameters.
    pub fn canonical_args(&self, ret_buf: bool) -> Vec<(ArgRole, ArgClass)> {
        let mut out = vec![];
        if self.has_this {
            out.push((ArgRole::This, ArgClass::POINTER));
        }
        if ret_buf {
            out.push((ArgRole::RetBuf, ArgClass::POINTER));
        }
        if self.is_vararg() {
            out.push((ArgRole::VarArgCookie, ArgClass::POINTER));
        }
        if self.generic_context {
            out.push((ArgRole::GenericContext, ArgClass::POINTER));
        }
        for (i, p) in self.params.iter().enumerate() {
            out.push((ArgRole::Param(i as u16), p.clone()));
        }
        out
    }

    fn check_supported(&self, target: &'static str) -> Result<(), UnimplementedError> {
        match self.call_conv {
            CallConv::Default | CallConv::VarArg => Ok(()),
            other => {
                tracing::error!(target, ?other, "unsupported calling convention");
                Err(UnimplementedError::CallingConvention(other))
            }
        }
    }
}

/// Where one piece of an argument comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgSource {
    IntReg(u8),
    FpReg(u8),
    /// Byte offset into the caller's outgoing argument area.
    Stack(u32),
    /// Dedicated return-buffer register (x8 on arm64).
    RetBufReg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArgPart {
    pub source: ArgSource,
    /// Offset of this piece within the argument value.
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArgPlacement {
    pub role: ArgRole,
    pub class: ArgClass,
    pub parts: Vec<ArgPart>,
    /// The value is passed as a pointer to a caller-owned copy.
    pub by_reference: bool,
    /// Offset of the argument within the packed block.
    pub offset: usize,
}

impl ArgPlacement {
    fn new(role: ArgRole, class: ArgClass) -> Self {
        Self {
            role,
            class,
            parts: vec![],
            by_reference: false,
            offset: 0,
        }
    }

    /// Bytes the argument occupies in the packed block.
    pub fn block_size(&self) -> usize {
        if self.by_reference {
            SLOT_SIZE
        } else {
            align_up(self.class.size().max(1), SLOT_SIZE)
        }
    }

    fn part(mut self, source: ArgSource, offset: u32, size: u32) -> Self {
        self.parts.push(ArgPart {
            source,
            offset,
            size,
        });
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnSource {
    IntReg(u8),
    FpReg(u8),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReturnPlacement {
    Void,
    /// A primitive in one register.
    Scalar(ReturnSource),
    /// A struct returned in registers; the stub stages it through a buffer.
    Registers {
        size: usize,
        parts: Vec<(ReturnSource, u32, u32)>,
    },
    /// A struct written through the hidden return-buffer argument.
    Buffer,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArgLayout {
    pub target: &'static str,
    pub args: Vec<ArgPlacement>,
    pub ret: ReturnPlacement,
    pub block_size: usize,
    /// Bytes of outgoing stack the caller reserves, including any home area.
    pub stack_size: usize,
    /// The packed block is the caller's stack image (register args homed).
    pub args_in_caller_frame: bool,
}

impl ArgLayout {
    pub fn has_ret_buf(&self) -> bool {
        self.args.iter().any(|a| a.role == ArgRole::RetBuf)
    }

    pub fn index_of(&self, role: ArgRole) -> Option<usize> {
        self.args.iter().position(|a| a.role == role)
    }

    /// Assigns sequential, slot-aligned block offsets.
    fn pack_sequential(&mut self) {
        let mut cursor = 0;
        for arg in &mut self.args {
            let align = match &arg.class {
                ArgClass::Struct(info) if !arg.by_reference => info.alignment.max(SLOT_SIZE),
                _ => SLOT_SIZE,
            };
            cursor = align_up(cursor, align);
            arg.offset = cursor;
            cursor += arg.block_size();
        }
        self.block_size = align_up(cursor, SLOT_SIZE);
    }
}

impl Display for ArgLayout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let conv: TargetConvention = match self.target {
            "amd64-windows" => Amd64Windows.into(),
            "arm64" => Arm64.into(),
            "riscv64" => RiscV64.into(),
            _ => Amd64SysV.into(),
        };
        for arg in &self.args {
            write!(f, "{:>14} @{:<4}", arg.role.to_string(), arg.offset)?;
            for (i, part) in arg.parts.iter().enumerate() {
                if i > 0 {
                    write!(f, " +")?;
                }
                write!(f, " {}", conv.source_name(part.source))?;
                if part.size as usize != arg.block_size() || part.offset != 0 {
                    write!(f, "[{}..{}]", part.offset, part.offset + part.size)?;
                }
            }
            if arg.by_reference {
                write!(f, " (by reference)")?;
            }
            writeln!(f)?;
        }
        writeln!(f, "{:>14} {:?}", "return", self.ret)
    }
}

/// Tracks register and stack consumption while classifying arguments.
#[derive(Clone, Debug, Default)]
pub struct ArgState {
    pub int_used: u8,
    pub fp_used: u8,
    pub stack_used: u32,
    int_regs: u8,
    fp_regs: u8,
}

impl ArgState {
    pub fn new(int_regs: u8, fp_regs: u8) -> Self {
        Self {
            int_regs,
            fp_regs,
            ..Default::default()
        }
    }

    /// Takes `count` consecutive integer registers, starting at an even
    /// register if `pair_aligned`.
    pub fn take_int(&mut self, count: u8, pair_aligned: bool) -> Option<u8> {
        let start = if pair_aligned {
            align_up(self.int_used as usize, 2) as u8
        } else {
            self.int_used
        };
        if start + count > self.int_regs {
            return None;
        }
        self.int_used = start + count;
        Some(start)
    }

    pub fn take_fp(&mut self, count: u8) -> Option<u8> {
        if self.fp_used + count > self.fp_regs {
            return None;
        }
        let start = self.fp_used;
        self.fp_used += count;
        Some(start)
    }

    pub fn int_remaining(&self) -> u8 {
        self.int_regs - self.int_used
    }

    pub fn fp_remaining(&self) -> u8 {
        self.fp_regs - self.fp_used
    }

    pub fn exhaust_int(&mut self) {
        self.int_used = self.int_regs;
    }

    pub fn exhaust_fp(&mut self) {
        self.fp_used = self.fp_regs;
    }

    pub fn take_stack(&mut self, size: usize, align: usize) -> u32 {
        let offset = align_up(self.stack_used as usize, align.max(SLOT_SIZE));
        self.stack_used = (offset + align_up(size, SLOT_SIZE)) as u32;
        offset as u32
    }
}

/// Register state of a native call: what a compiled caller sets up before
/// the call instruction, or what a compiled callee reads.
#[derive(Debug, Default)]
pub struct NativeCallState {
    pub int_regs: Vec<u64>,
    pub fp_regs: Vec<u64>,
    /// Caller's outgoing argument area.
    pub stack: Vec<u64>,
    pub ret_buf_reg: Option<u64>,
    /// Caller-owned copies of by-reference struct arguments.
    owned: Vec<Box<[u64]>>,
}

impl NativeCallState {
    pub fn new(int_regs: u8, fp_regs: u8, stack_size: usize) -> Self {
        Self {
            int_regs: vec![0; int_regs as usize],
            fp_regs: vec![0; fp_regs as usize],
            stack: vec![0; align_up(stack_size, SLOT_SIZE) / SLOT_SIZE],
            ret_buf_reg: None,
            owned: vec![],
        }
    }

    pub fn stack_ptr(&mut self) -> *mut u8 {
        self.stack.as_mut_ptr().cast()
    }

    /// Reads `size` bytes at a byte offset into the stack area.
    pub fn read_stack(&self, offset: usize, size: usize) -> u64 {
        let bytes: &[u8] = unsafe {
            std::slice::from_raw_parts(self.stack.as_ptr().cast(), self.stack.len() * SLOT_SIZE)
        };
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(&bytes[offset..offset + size]);
        u64::from_le_bytes(buf)
    }

    pub fn write_stack(&mut self, offset: usize, bytes: &[u8]) {
        let len = self.stack.len() * SLOT_SIZE;
        let dest: &mut [u8] =
            unsafe { std::slice::from_raw_parts_mut(self.stack.as_mut_ptr().cast(), len) };
        dest[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn read_source(&self, source: ArgSource, size: usize) -> u64 {
        let raw = match source {
            ArgSource::IntReg(r) => self.int_regs[r as usize],
            ArgSource::FpReg(r) => self.fp_regs[r as usize],
            ArgSource::Stack(o) => return self.read_stack(o as usize, size),
            ArgSource::RetBufReg => self.ret_buf_reg.unwrap_or(0),
        };
        if size >= 8 {
            raw
        } else {
            raw & ((1u64 << (size * 8)) - 1)
        }
    }

    fn write_source(&mut self, source: ArgSource, bytes: &[u8]) {
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        let value = u64::from_le_bytes(buf);
        match source {
            ArgSource::IntReg(r) => self.int_regs[r as usize] = value,
            ArgSource::FpReg(r) => self.fp_regs[r as usize] = value,
            ArgSource::Stack(o) => self.write_stack(o as usize, bytes),
            ArgSource::RetBufReg => self.ret_buf_reg = Some(value),
        }
    }

    /// Reads an argument as the callee sees it, following the layout.
    pub fn read_arg(&self, arg: &ArgPlacement) -> Vec<u8> {
        let size = if arg.by_reference {
            SLOT_SIZE
        } else {
            arg.class.size()
        };
        let mut out = vec![0u8; size.max(SLOT_SIZE)];
        for part in &arg.parts {
            let v = self.read_source(part.source, part.size as usize);
            let start = part.offset as usize;
            out[start..start + part.size as usize]
                .copy_from_slice(&v.to_le_bytes()[..part.size as usize]);
        }
        out.truncate(size);
        out
    }
}

/// Values in the return registers after a native call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NativeReturn {
    pub int: [u64; 2],
    pub fp: [u64; 4],
}

impl NativeReturn {
    fn read(&self, source: ReturnSource) -> u64 {
        match source {
            ReturnSource::IntReg(r) => self.int[r as usize],
            ReturnSource::FpReg(r) => self.fp[r as usize],
        }
    }

    fn write(&mut self, source: ReturnSource, value: u64) {
        match source {
            ReturnSource::IntReg(r) => self.int[r as usize] = value,
            ReturnSource::FpReg(r) => self.fp[r as usize] = value,
        }
    }

    /// Scalar result, for primitive returns.
    pub fn scalar(&self, placement: &ReturnPlacement) -> u64 {
        match placement {
            ReturnPlacement::Scalar(s) => self.read(*s),
            _ => self.int[0],
        }
    }
}

/// Native code the interpreter can call, or that calls into entry stubs.
pub trait CompiledCode: Send + Sync {
    /// Runs the code with arguments already placed per the target convention.
    fn invoke(&self, call: &mut NativeCallState) -> ExecResult<NativeReturn>;
}

#[enum_dispatch]
pub trait CallingConvention {
    fn name(&self) -> &'static str;

    fn int_arg_registers(&self) -> u8;

    fn fp_arg_registers(&self) -> u8;

    fn int_reg_name(&self, reg: u8) -> &'static str;

    fn fp_reg_name(&self, reg: u8) -> String;

    /// Computes the placement of every canonical argument and the return value.
    fn classify_args(&self, sig: &NativeSignature) -> Result<ArgLayout, UnimplementedError>;

    fn source_name(&self, source: ArgSource) -> String {
        match source {
            ArgSource::IntReg(r) => self.int_reg_name(r).to_string(),
            ArgSource::FpReg(r) => self.fp_reg_name(r),
            ArgSource::Stack(o) => format!("[sp+{}]", o),
            ArgSource::RetBufReg => "retbuf-reg".to_string(),
        }
    }

    /// Builds the native-to-interpreter entry sequence for a method.
    fn emit_entry_stub(&self, layout: &ArgLayout) -> EntryStub {
        stub::build(self.name(), layout)
    }

    /// Packs canonical argument values into native registers and stack.
    /// `values[i]` holds the bytes of canonical argument `i` (by value).
    fn marshal_outbound_call(&self, layout: &ArgLayout, values: &[&[u8]]) -> NativeCallState {
        let mut state = NativeCallState::new(
            self.int_arg_registers(),
            self.fp_arg_registers(),
            layout.stack_size,
        );
        for (arg, value) in layout.args.iter().zip(values) {
            if arg.by_reference {
                let mut copy = vec![0u64; align_up(value.len(), SLOT_SIZE) / SLOT_SIZE]
                    .into_boxed_slice();
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        value.as_ptr(),
                        copy.as_mut_ptr().cast::<u8>(),
                        value.len(),
                    )
                };
                let address = copy.as_ptr() as u64;
                state.owned.push(copy);
                for part in &arg.parts {
                    state.write_source(part.source, &address.to_le_bytes());
                }
                continue;
            }
            for part in &arg.parts {
                let start = part.offset as usize;
                let end = (start + part.size as usize).min(value.len());
                state.write_source(part.source, &value[start.min(end)..end]);
            }
        }
        state
    }

    /// Copies a register-returned struct or scalar into `dest`.
    fn read_return(&self, layout: &ArgLayout, ret: &NativeReturn, dest: &mut [u8]) {
        match &layout.ret {
            ReturnPlacement::Void | ReturnPlacement::Buffer => {}
            ReturnPlacement::Scalar(s) => {
                let n = dest.len().min(8);
                dest[..n].copy_from_slice(&ret.read(*s).to_le_bytes()[..n]);
            }
            ReturnPlacement::Registers { parts, .. } => {
                for (source, offset, size) in parts {
                    let (o, s) = (*offset as usize, *size as usize);
                    dest[o..o + s].copy_from_slice(&ret.read(*source).to_le_bytes()[..s]);
                }
            }
        }
    }

    /// Loads a struct staged in `src` into return registers.
    fn write_return(&self, layout: &ArgLayout, src: &[u8], ret: &mut NativeReturn) {
        if let ReturnPlacement::Registers { parts, .. } = &layout.ret {
            for (source, offset, size) in parts {
                let (o, s) = (*offset as usize, *size as usize);
                let mut buf = [0u8; 8];
                buf[..s].copy_from_slice(&src[o..o + s]);
                ret.write(*source, u64::from_le_bytes(buf));
            }
        }
    }
}

#[enum_dispatch(CallingConvention)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetConvention {
    Amd64Windows(Amd64Windows),
    Amd64SysV(Amd64SysV),
    Arm64(Arm64),
    RiscV64(RiscV64),
}

impl TargetConvention {
    /// The convention of the platform this crate was built for.
    pub fn host() -> Self {
        if cfg!(all(target_arch = "x86_64", target_os = "windows")) {
            Amd64Windows.into()
        } else if cfg!(target_arch = "aarch64") {
            Arm64.into()
        } else if cfg!(target_arch = "riscv64") {
            RiscV64.into()
        } else {
            Amd64SysV.into()
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        Some(match name {
            "amd64-windows" | "win64" => Amd64Windows.into(),
            "amd64-sysv" | "sysv" | "x86_64" => Amd64SysV.into(),
            "arm64" | "aarch64" => Arm64.into(),
            "riscv64" => RiscV64.into(),
            _ => return None,
        })
    }

    pub fn all() -> [Self; 4] {
        [
            Amd64Windows.into(),
            Amd64SysV.into(),
            Arm64.into(),
            RiscV64.into(),
        ]
    }
}

impl Default for TargetConvention {
    fn default() -> Self {
        Self::host()
    }
}

impl Display for TargetConvention {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::types::FlatField;

    pub fn ints(n: usize) -> NativeSignature {
        NativeSignature {
            call_conv: CallConv::Default,
            has_this: false,
            generic_context: false,
            params: vec![ArgClass::Int { size: 4 }; n],
            fixed_params: None,
            ret: Some(ArgClass::Int { size: 8 }),
        }
    }

    pub fn strukt(fields: &[(u32, PrimitiveKind)]) -> ArgClass {
        ArgClass::Struct(Arc::new(TypeInfo::value_type(
            "S",
            fields
                .iter()
                .map(|&(offset, kind)| FlatField { offset, kind })
                .collect(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::{test_support::*, *};

    #[test]
    fn canonical_order_puts_hidden_args_before_params() {
        let mut sig = ints(1);
        sig.has_this = true;
        sig.generic_context = true;
        let roles: Vec<_> = sig.canonical_args(true).into_iter().map(|(r, _)| r).collect();
        assert_eq!(
            roles,
            vec![ArgRole::This, ArgRole::RetBuf, ArgRole::GenericContext, ArgRole::Param(0)]
        );
    }

    #[test]
    fn unmanaged_conventions_fail_fast() {
        let mut sig = ints(1);
        sig.call_conv = CallConv::StdCall;
        for conv in TargetConvention::all() {
            assert_eq!(
                conv.classify_args(&sig),
                Err(UnimplementedError::CallingConvention(CallConv::StdCall))
            );
        }
    }

    #[test]
    fn marshaled_args_read_back_identically() {
        let mut sig = ints(0);
        sig.params = vec![
            ArgClass::Int { size: 4 },
            ArgClass::Float { size: 8 },
            strukt(&[(0, PrimitiveKind::I8), (8, PrimitiveKind::I8), (16, PrimitiveKind::I8)]),
        ];
        let a = 7i32.to_le_bytes();
        let b = 2.5f64.to_le_bytes();
        let c: Vec<u8> = [1u64, 2, 3].iter().flat_map(|v| v.to_le_bytes()).collect();
        for conv in TargetConvention::all() {
            let layout = conv.classify_args(&sig).unwrap();
            let state = conv.marshal_outbound_call(&layout, &[&a, &b, &c]);
            assert_eq!(state.read_arg(&layout.args[0]), a.to_vec(), "{conv}");
            assert_eq!(state.read_arg(&layout.args[1]), b.to_vec(), "{conv}");
            let third = state.read_arg(&layout.args[2]);
            if layout.args[2].by_reference {
                let ptr = u64::from_le_bytes(third.try_into().unwrap()) as *const u8;
                let copy = unsafe { std::slice::from_raw_parts(ptr, 24) };
                assert_eq!(copy, &c[..], "{conv}");
            } else {
                assert_eq!(third, c, "{conv}");
            }
        }
    }
}
