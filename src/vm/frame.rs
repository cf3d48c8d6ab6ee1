//! Per-invocation state of an interpreted method.
use crate::{
    callconv::ArgRole,
    types::{PrimitiveKind, ValueTypeDescriptor, SLOT_SIZE},
    utils::align_up,
    value::StackValue,
    vm::{
        cache::{IlOffsetCache, ResolvedType},
        error::VerificationError,
        exceptions::ExceptionState,
        host::TokenScope,
        interpreter::{ArgBlock, ArgBlockKind},
        method::{ArgDescriptor, GenericContext, LocalDescriptor, MethodDescriptor},
        stack::{copy_struct_out, OperandStack},
    },
};
use std::sync::Arc;

/// Local variables: one slot per local, followed by the overflow region for
/// large-struct locals. A large local's slot holds the address of its value.
pub struct LocalBlock {
    slots: Box<[u64]>,
    count: usize,
}

impl LocalBlock {
    pub fn new(locals: &[LocalDescriptor], overflow_size: usize) -> Self {
        let count = locals.len();
        let mut slots = vec![0u64; count + overflow_size / SLOT_SIZE].into_boxed_slice();
        let region = slots.as_mut_ptr().wrapping_add(count) as usize;
        for (i, local) in locals.iter().enumerate() {
            if let Some(offset) = local.overflow_offset {
                slots[i] = (region + offset) as u64;
            }
        }
        Self { slots, count }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Address of the value of local `index`.
    pub fn address(&mut self, index: usize, ty: ValueTypeDescriptor) -> *mut u8 {
        if ty.is_overflow() {
            self.slots[index] as *mut u8
        } else {
            // SAFETY: callers check `index < count`.
            unsafe { self.slots.as_mut_ptr().add(index).cast() }
        }
    }

    pub(crate) fn slots_ptr(&mut self) -> *mut u64 {
        self.slots.as_mut_ptr()
    }
}

/// A value staged outside the operand stack: a call argument, a pending
/// return value, or an object under construction.
#[derive(Clone, Debug, PartialEq)]
pub struct ArgValue {
    /// Declared (not stack-normalized) type.
    pub ty: ValueTypeDescriptor,
    pub data: Vec<u64>,
}

impl ArgValue {
    pub fn zeroed(ty: ValueTypeDescriptor) -> Self {
        Self {
            ty,
            data: vec![0; align_up(ty.size().max(1), SLOT_SIZE) / SLOT_SIZE],
        }
    }

    /// Stores a stack value as `kind`, truncating or converting floats.
    pub fn primitive(kind: PrimitiveKind, value: StackValue) -> Self {
        let mut arg = Self::zeroed(ValueTypeDescriptor::Primitive(kind));
        // SAFETY: the buffer holds at least one slot.
        unsafe { value.store(arg.as_mut_ptr(), kind) };
        arg
    }

    /// Copies a popped stack entry into staging as type `ty`.
    ///
    /// # Safety
    /// For out-of-line structs `bits` must address a live value.
    pub unsafe fn from_stack(ty: ValueTypeDescriptor, stack_ty: ValueTypeDescriptor, bits: u64) -> Self {
        match ty {
            ValueTypeDescriptor::Primitive(kind) => {
                Self::primitive(kind, StackValue::from_slot(stack_ty.primitive().unwrap_or(kind), bits))
            }
            _ => {
                let mut arg = Self::zeroed(ty);
                copy_struct_out(stack_ty, bits, arg.as_mut_ptr());
                arg
            }
        }
    }

    pub fn native_int(value: usize) -> Self {
        Self {
            ty: ValueTypeDescriptor::NATIVE_INT,
            data: vec![value as u64],
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr().cast()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr().cast()
    }

    /// The value's own bytes.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the buffer covers at least `ty.size()` bytes.
        let all: &[u8] = unsafe {
            std::slice::from_raw_parts(self.data.as_ptr().cast(), self.data.len() * SLOT_SIZE)
        };
        match self.ty {
            ValueTypeDescriptor::Primitive(_) => all,
            ty => &all[..ty.size()],
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let size = match self.ty {
            ValueTypeDescriptor::Primitive(_) => self.data.len() * SLOT_SIZE,
            ty => ty.size(),
        };
        // SAFETY: the buffer covers at least `size` bytes.
        unsafe { std::slice::from_raw_parts_mut(self.data.as_mut_ptr().cast(), size) }
    }

    pub fn first_slot(&self) -> u64 {
        self.data[0]
    }
}

/// The variadic part of a vararg call; the cookie passed to the callee is
/// this record's address.
#[derive(Debug, Default)]
pub struct VarArgList {
    pub args: Vec<ArgValue>,
}

impl VarArgList {
    pub fn cookie(&self) -> usize {
        self as *const Self as usize
    }

    /// # Safety
    /// `cookie` must come from [`VarArgList::cookie`] of a list that is
    /// still staged by the caller.
    pub unsafe fn from_cookie<'a>(cookie: usize) -> Option<&'a VarArgList> {
        (cookie as *const VarArgList).as_ref()
    }
}

/// Everything the frame holds on behalf of a call it is making.
#[derive(Debug, Default)]
pub struct CallStaging {
    /// Arguments of the call in flight: IL order while being popped,
    /// canonical order once the callee is known.
    pub outbound: Vec<ArgValue>,
    /// Block handed to an interpreted callee: slot `i` holds canonical
    /// argument `i`, or the address of `outbound[i]` when it is out of line.
    pub block: Vec<u64>,
    pub varargs: Option<Box<VarArgList>>,
    /// Struct return buffer of the call in flight.
    pub ret: Option<ArgValue>,
    /// Object or value under construction by `newobj`.
    pub new_object: Option<ArgValue>,
}

impl CallStaging {
    pub fn clear(&mut self) {
        self.outbound.clear();
        self.block.clear();
        self.varargs = None;
        self.ret = None;
        self.new_object = None;
    }
}

pub struct Frame {
    pub method: Arc<MethodDescriptor>,
    pub context: GenericContext,
    pub ip: usize,
    pub stack: OperandStack,
    pub locals: LocalBlock,
    pub args: ArgBlock,
    pub ret_slot: Option<*mut u8>,
    pub exceptions: ExceptionState,
    pub staging: CallStaging,
    pub cache: Arc<IlOffsetCache>,
    /// Type named by a pending `constrained.` prefix.
    pub constrained: Option<Arc<ResolvedType>>,
    localloc: Vec<Box<[u64]>>,
    localloc_bytes: usize,
}

impl Frame {
    pub fn new(method: Arc<MethodDescriptor>, args: ArgBlock, ret_slot: Option<*mut u8>) -> Self {
        let stack = OperandStack::new(method.definition.max_stack as usize);
        let locals = LocalBlock::new(&method.locals, method.local_overflow_size);
        let cache = method.call_site_cache(GenericContext::NONE);
        Self {
            method,
            context: GenericContext::NONE,
            ip: 0,
            stack,
            locals,
            args,
            ret_slot,
            exceptions: ExceptionState::default(),
            staging: CallStaging::default(),
            cache,
            constrained: None,
            localloc: vec![],
            localloc_bytes: 0,
        }
    }

    /// Switches to the caches of an exact generic instantiation.
    pub fn set_context(&mut self, context: GenericContext) {
        self.context = context;
        self.cache = self.method.call_site_cache(context);
    }

    pub fn scope(&self) -> TokenScope {
        TokenScope {
            method: self.method.handle(),
            context: self.context,
        }
    }

    pub fn local(&mut self, index: u16) -> Result<(ValueTypeDescriptor, *mut u8), VerificationError> {
        let desc = *self
            .method
            .locals
            .get(index as usize)
            .ok_or(VerificationError::InvalidLocal(index))?;
        Ok((desc.ty, self.locals.address(index as usize, desc.ty)))
    }

    /// Descriptor and value address of IL argument `index`.
    pub fn arg(&self, index: u16) -> Result<(ArgDescriptor, *mut u8), VerificationError> {
        let canonical = *self
            .method
            .il_args
            .get(index as usize)
            .ok_or(VerificationError::InvalidArgument(index))?;
        let desc = self.method.args[canonical];
        Ok((desc, self.arg_address(&desc)))
    }

    pub fn hidden_arg(&self, role: ArgRole) -> Option<u64> {
        let desc = self.method.arg(role)?;
        let address = self.arg_address(desc);
        // SAFETY: hidden arguments are one slot wide.
        Some(unsafe { address.cast::<u64>().read_unaligned() })
    }

    pub(crate) fn arg_address(&self, desc: &ArgDescriptor) -> *mut u8 {
        let base = self.args.base;
        // SAFETY: the block was laid out by this method's descriptor.
        unsafe {
            match self.args.kind {
                ArgBlockKind::Native => {
                    let at = base.add(desc.native_offset);
                    if desc.native_by_ref {
                        at.cast::<*mut u8>().read_unaligned()
                    } else {
                        at
                    }
                }
                ArgBlockKind::Direct => {
                    let at = base.add(desc.direct_offset);
                    if desc.ty.is_overflow() {
                        at.cast::<*mut u8>().read_unaligned()
                    } else {
                        at
                    }
                }
            }
        }
    }

    /// Zeroed scratch memory living until the frame returns. `None` when
    /// the frame's budget is exhausted or the size does not fit it at all.
    pub fn localloc(&mut self, size: usize, limit: usize) -> Option<*mut u8> {
        let size = size.max(1).checked_next_multiple_of(SLOT_SIZE)?;
        let total = self.localloc_bytes.checked_add(size)?;
        if total > limit {
            return None;
        }
        self.localloc_bytes = total;
        let mut block = vec![0u64; size / SLOT_SIZE].into_boxed_slice();
        let ptr = block.as_mut_ptr().cast();
        self.localloc.push(block);
        Some(ptr)
    }

    pub fn method_name(&self) -> &str {
        self.method.name()
    }
}
