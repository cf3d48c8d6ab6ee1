//! Fields, objects, boxing, arrays and value-type block operations.
//!
//! Tokens are resolved through the frame's call-site cache. Anything that can
//! run a class constructor or allocate happens before operands are popped,
//! so no reference is held outside the operand stack or staging area across
//! a possible collection.
use crate::{
    types::{PrimitiveKind, TypeHandle, ValueTypeDescriptor},
    value::{ObjectRef, StackValue},
    vm::{
        cache::{CachedItem, FieldAccess, IlOffsetCache, ResolvedType},
        error::{ExecResult, ManagedExceptionKind, ResolutionError, VerificationError},
        frame::{ArgValue, Frame},
        gc::NoGcRegion,
        host::{ResolvedToken, TokenKind, TokenScope},
        interpreter::Interpreter,
        opcodes::{ElementType, Token},
    },
};
use std::sync::Arc;

fn token_error(token: Token, kind: TokenKind) -> ResolutionError {
    ResolutionError::Token {
        token,
        kind: kind.as_str(),
    }
}

impl Interpreter {
    pub(crate) fn resolve_type(&self, frame: &Frame, at: usize, token: Token) -> ExecResult<Arc<ResolvedType>> {
        self.resolve_type_in(&frame.cache, &frame.scope(), at as u32, token)
    }

    pub(crate) fn resolve_type_in(
        &self,
        cache: &IlOffsetCache,
        scope: &TokenScope,
        offset: u32,
        token: Token,
    ) -> ExecResult<Arc<ResolvedType>> {
        let item = self.cached(cache, offset, || match self.host.resolve_token(scope, token, TokenKind::Type)? {
            ResolvedToken::Type(handle) => {
                let info = self.host.type_info(handle);
                let ty = ValueTypeDescriptor::of_type(handle, &info);
                Ok(CachedItem::Type(Arc::new(ResolvedType { handle, info, ty })))
            }
            _ => Err(token_error(token, TokenKind::Type).into()),
        })?;
        match item {
            CachedItem::Type(ty) => Ok(ty),
            _ => Err(token_error(token, TokenKind::Type).into()),
        }
    }

    /// Resolves a field token. Static fields have their class initialized
    /// before the entry is committed.
    pub(crate) fn resolve_field_in(
        &self,
        cache: &IlOffsetCache,
        scope: &TokenScope,
        offset: u32,
        token: Token,
    ) -> ExecResult<CachedItem> {
        self.cached(cache, offset, || {
            let handle = match self.host.resolve_token(scope, token, TokenKind::Field)? {
                ResolvedToken::Field(handle) => handle,
                _ => return Err(token_error(token, TokenKind::Field).into()),
            };
            let info = self.host.field_info(handle, scope.context)?;
            let ty = info.ty.descriptor(|h| self.host.type_info(h));
            if info.is_static() {
                self.host.ensure_class_initialized(info.owner, self)?;
                Ok(CachedItem::StaticField(Arc::new(FieldAccess { info, ty })))
            } else {
                Ok(CachedItem::InstanceField(Arc::new(FieldAccess { info, ty })))
            }
        })
    }

    fn instance_field(&self, frame: &Frame, at: usize, token: Token) -> ExecResult<Arc<FieldAccess>> {
        match self.resolve_field_in(&frame.cache, &frame.scope(), at as u32, token)? {
            CachedItem::InstanceField(access) => Ok(access),
            _ => Err(token_error(token, TokenKind::Field).into()),
        }
    }

    fn static_field(&self, frame: &Frame, at: usize, token: Token) -> ExecResult<(Arc<FieldAccess>, *mut u8)> {
        match self.resolve_field_in(&frame.cache, &frame.scope(), at as u32, token)? {
            CachedItem::StaticField(access) => {
                let address = access
                    .info
                    .static_address
                    .ok_or_else(|| token_error(token, TokenKind::Field))?;
                Ok((access, address as *mut u8))
            }
            _ => Err(token_error(token, TokenKind::Field).into()),
        }
    }

    /// Base address a field access applies its offset to, for an object
    /// reference or pointer operand.
    fn field_base(&self, ty: ValueTypeDescriptor, bits: u64, instruction: &'static str) -> ExecResult<*mut u8> {
        match ty {
            ValueTypeDescriptor::Primitive(PrimitiveKind::Object) => {
                let obj = ObjectRef(bits as usize);
                if obj.is_null() {
                    return Err(self.exception(ManagedExceptionKind::NullReference));
                }
                Ok(self.host.field_data(obj))
            }
            ValueTypeDescriptor::Primitive(PrimitiveKind::ByRef | PrimitiveKind::NativeInt) => {
                if bits == 0 {
                    return Err(self.exception(ManagedExceptionKind::NullReference));
                }
                Ok(bits as *mut u8)
            }
            actual => Err(VerificationError::UnexpectedOperand { instruction, actual }.into()),
        }
    }

    pub(crate) fn load_field(&self, frame: &mut Frame, at: usize, token: Token, address: bool) -> ExecResult<()> {
        let access = self.instance_field(frame, at, token)?;
        let offset = access.info.offset;
        // The popped receiver is only held here until the field is read.
        let _no_gc = NoGcRegion::enter();
        let (ty, bits) = frame.stack.pop()?;
        if address {
            let base = self.field_base(ty, bits, "ldflda")?.wrapping_add(offset);
            let pointer = match ty {
                ValueTypeDescriptor::Primitive(PrimitiveKind::NativeInt) => StackValue::NativeInt(base as isize),
                _ => StackValue::ManagedPtr(base as usize),
            };
            frame.stack.push(pointer)?;
            return Ok(());
        }
        let scratch = bits.to_le_bytes();
        let src = match ty {
            ValueTypeDescriptor::InlineStruct { .. } => scratch.as_ptr().wrapping_add(offset),
            // The popped value stays readable until the next push.
            ValueTypeDescriptor::OverflowStruct { .. } => (bits as *const u8).wrapping_add(offset),
            _ => self.field_base(ty, bits, "ldfld")?.wrapping_add(offset) as *const u8,
        };
        // SAFETY: `src` addresses a field of type `access.ty`.
        unsafe { frame.stack.push_value(access.ty, src)? };
        Ok(())
    }

    pub(crate) fn store_field(&self, frame: &mut Frame, at: usize, token: Token) -> ExecResult<()> {
        let access = self.instance_field(frame, at, token)?;
        frame.stack.normalize();
        let _no_gc = NoGcRegion::enter();
        let value = frame.stack.pop()?;
        let (ty, bits) = frame.stack.pop()?;
        let dest = self.field_base(ty, bits, "stfld")?.wrapping_add(access.info.offset);
        let heap = ty != ValueTypeDescriptor::NATIVE_INT;
        self.store_value(access.ty, dest, value, "stfld", heap)
    }

    pub(crate) fn load_static(&self, frame: &mut Frame, at: usize, token: Token, address: bool) -> ExecResult<()> {
        let (access, location) = self.static_field(frame, at, token)?;
        if address {
            frame.stack.push(StackValue::ManagedPtr(location as usize))?;
        } else {
            // SAFETY: the host's static storage holds a value of the field type.
            unsafe { frame.stack.push_value(access.ty, location)? };
        }
        Ok(())
    }

    pub(crate) fn store_static(&self, frame: &mut Frame, at: usize, token: Token) -> ExecResult<()> {
        let (access, location) = self.static_field(frame, at, token)?;
        frame.stack.normalize();
        let value = frame.stack.pop()?;
        self.store_value(access.ty, location, value, "stsfld", true)
    }

    pub(crate) fn load_string(&self, frame: &mut Frame, token: Token) -> ExecResult<()> {
        match self.host.resolve_token(&frame.scope(), token, TokenKind::String)? {
            ResolvedToken::String(s) => {
                frame.stack.push(StackValue::ObjectRef(s))?;
                Ok(())
            }
            _ => Err(token_error(token, TokenKind::String).into()),
        }
    }

    fn pop_object(&self, frame: &mut Frame, instruction: &'static str) -> ExecResult<ObjectRef> {
        vm_expect_stack!(let ObjectRef(obj) = frame.stack.pop_value()?, instruction);
        Ok(obj)
    }

    /// `castclass` when `throws`, otherwise `isinst`.
    pub(crate) fn cast(&self, frame: &mut Frame, at: usize, token: Token, throws: bool) -> ExecResult<()> {
        let target = self.resolve_type(frame, at, token)?;
        let obj = self.pop_object(frame, if throws { "castclass" } else { "isinst" })?;
        let result = if obj.is_null() || self.host.is_assignable(self.host.object_type(obj), target.handle) {
            obj
        } else if throws {
            return Err(self.exception(ManagedExceptionKind::InvalidCast));
        } else {
            ObjectRef::NULL
        };
        frame.stack.push(StackValue::ObjectRef(result))?;
        Ok(())
    }

    pub(crate) fn box_value(&self, frame: &mut Frame, at: usize, token: Token) -> ExecResult<()> {
        let target = self.resolve_type(frame, at, token)?;
        if !target.info.is_value_type {
            return Ok(());
        }
        frame.stack.normalize();
        let (ty, bits) = frame.stack.pop()?;
        if target.ty.is_struct() && ty.struct_handle() != target.ty.struct_handle() {
            return Err(VerificationError::UnexpectedOperand {
                instruction: "box",
                actual: ty,
            }
            .into());
        }
        // Staged where the root scanner sees it: the allocation may collect.
        // SAFETY: a just-popped entry stays readable until the next push.
        frame.staging.new_object = Some(unsafe { ArgValue::from_stack(target.ty, ty, bits) });
        let boxed = self.host.allocate_object(target.handle);
        let staged = frame.staging.new_object.take();
        let boxed = boxed?;
        if let Some(staged) = staged {
            let _no_gc = NoGcRegion::enter();
            let size = target.ty.size();
            // SAFETY: a boxed value's payload holds `size` bytes.
            unsafe { std::ptr::copy_nonoverlapping(staged.as_ptr(), self.host.field_data(boxed), size) };
        }
        frame.stack.push(StackValue::ObjectRef(boxed))?;
        Ok(())
    }

    /// Whether a boxed `actual` may be unboxed as `target`: same type, or
    /// the same underlying primitive (enums and their underlying type).
    fn unbox_compatible(&self, actual: TypeHandle, target: &ResolvedType) -> bool {
        if actual == target.handle {
            return true;
        }
        let info = self.host.type_info(actual);
        info.is_value_type && info.primitive.is_some() && info.primitive == target.info.primitive
    }

    /// `unbox`, or `unbox.any` when `any`.
    pub(crate) fn unbox(&self, frame: &mut Frame, at: usize, token: Token, any: bool) -> ExecResult<()> {
        let target = self.resolve_type(frame, at, token)?;
        if any && !target.info.is_value_type {
            return self.cast(frame, at, token, true);
        }
        let _no_gc = NoGcRegion::enter();
        let obj = self.pop_object(frame, if any { "unbox.any" } else { "unbox" })?;
        if obj.is_null() {
            return Err(self.exception(ManagedExceptionKind::NullReference));
        }
        if !self.unbox_compatible(self.host.object_type(obj), &target) {
            return Err(self.exception(ManagedExceptionKind::InvalidCast));
        }
        let data = self.host.field_data(obj);
        if any {
            // SAFETY: the payload of a compatible box holds a `target.ty`.
            unsafe { frame.stack.push_value(target.ty, data)? };
        } else {
            frame.stack.push(StackValue::ManagedPtr(data as usize))?;
        }
        Ok(())
    }

    pub(crate) fn new_array(&self, frame: &mut Frame, at: usize, token: Token) -> ExecResult<()> {
        let element = self.resolve_type(frame, at, token)?;
        let length = match frame.stack.pop_value()? {
            StackValue::Int32(i) => i as i64,
            StackValue::NativeInt(i) => i as i64,
            other => {
                return Err(VerificationError::UnexpectedOperand {
                    instruction: "newarr",
                    actual: ValueTypeDescriptor::Primitive(other.kind()),
                }
                .into())
            }
        };
        if length < 0 {
            return Err(self.exception(ManagedExceptionKind::Overflow));
        }
        let array = self.host.allocate_array(element.handle, length as usize)?;
        frame.stack.push(StackValue::ObjectRef(array))?;
        Ok(())
    }

    pub(crate) fn array_length(&self, frame: &mut Frame) -> ExecResult<()> {
        let array = self.pop_object(frame, "ldlen")?;
        if array.is_null() {
            return Err(self.exception(ManagedExceptionKind::NullReference));
        }
        frame.stack.push(StackValue::NativeInt(self.host.array_length(array) as isize))?;
        Ok(())
    }

    /// Pops index and array, bounds-checks, and returns the element's
    /// address, the array and its element type. Callers hold a
    /// [`NoGcRegion`] for as long as they use the address.
    fn pop_element(
        &self,
        frame: &mut Frame,
        instruction: &'static str,
    ) -> ExecResult<(*mut u8, ObjectRef, TypeHandle, ValueTypeDescriptor)> {
        let index = match frame.stack.pop_value()? {
            StackValue::Int32(i) => i as i64,
            StackValue::NativeInt(i) => i as i64,
            other => {
                return Err(VerificationError::UnexpectedOperand {
                    instruction,
                    actual: ValueTypeDescriptor::Primitive(other.kind()),
                }
                .into())
            }
        };
        let array = self.pop_object(frame, instruction)?;
        if array.is_null() {
            return Err(self.exception(ManagedExceptionKind::NullReference));
        }
        if index < 0 || index as usize >= self.host.array_length(array) {
            return Err(self.exception(ManagedExceptionKind::IndexOutOfRange));
        }
        let element = self.host.array_element_type(array);
        let ty = ValueTypeDescriptor::of_type(element, &self.host.type_info(element));
        let address = self.host.array_data(array).wrapping_add(index as usize * ty.size());
        Ok((address, array, element, ty))
    }

    fn element_descriptor(&self, frame: &Frame, at: usize, element: ElementType) -> ExecResult<ValueTypeDescriptor> {
        Ok(match element {
            ElementType::Primitive(kind) => ValueTypeDescriptor::Primitive(kind),
            ElementType::Token(token) => self.resolve_type(frame, at, token)?.ty,
        })
    }

    pub(crate) fn load_element_address(&self, frame: &mut Frame, at: usize, token: Token) -> ExecResult<()> {
        let expected = self.resolve_type(frame, at, token)?;
        let _no_gc = NoGcRegion::enter();
        let (address, _, element, _) = self.pop_element(frame, "ldelema")?;
        if !self.unbox_compatible(element, &expected) {
            return Err(self.exception(ManagedExceptionKind::ArrayTypeMismatch));
        }
        frame.stack.push(StackValue::ManagedPtr(address as usize))?;
        Ok(())
    }

    pub(crate) fn load_element(&self, frame: &mut Frame, at: usize, element: ElementType) -> ExecResult<()> {
        let ty = self.element_descriptor(frame, at, element)?;
        let _no_gc = NoGcRegion::enter();
        let (address, _, _, actual) = self.pop_element(frame, "ldelem")?;
        if ty.size() > actual.size() {
            return Err(VerificationError::UnexpectedOperand {
                instruction: "ldelem",
                actual,
            }
            .into());
        }
        // SAFETY: the element slot holds at least `ty.size()` bytes.
        unsafe { frame.stack.push_value(ty, address)? };
        Ok(())
    }

    pub(crate) fn store_element(&self, frame: &mut Frame, at: usize, element: ElementType) -> ExecResult<()> {
        let ty = self.element_descriptor(frame, at, element)?;
        frame.stack.normalize();
        let _no_gc = NoGcRegion::enter();
        let value = frame.stack.pop()?;
        let (address, _, element, actual) = self.pop_element(frame, "stelem")?;
        if ty.size() > actual.size() {
            return Err(VerificationError::UnexpectedOperand {
                instruction: "stelem",
                actual,
            }
            .into());
        }
        if actual == ValueTypeDescriptor::OBJECT && value.1 != 0 {
            let stored = self.host.object_type(ObjectRef(value.1 as usize));
            if !self.host.is_assignable(stored, element) {
                return Err(self.exception(ManagedExceptionKind::ArrayTypeMismatch));
            }
        }
        self.store_value(ty, address, value, "stelem", true)
    }

    /// Pushes the runtime handle a metadata token names, as a native int.
    pub(crate) fn load_token(&self, frame: &mut Frame, token: Token) -> ExecResult<()> {
        let scope = frame.scope();
        let resolve = |kind| self.host.resolve_token(&scope, token, kind);
        let resolved = match token >> 24 {
            0x04 => resolve(TokenKind::Field)?,
            0x06 | 0x2B => resolve(TokenKind::Method)?,
            // Member references name either a method or a field.
            0x0A => resolve(TokenKind::Method).or_else(|_| resolve(TokenKind::Field))?,
            _ => resolve(TokenKind::Type)?,
        };
        let handle = match resolved {
            ResolvedToken::Type(h) => h.0 as isize,
            ResolvedToken::Method(m) | ResolvedToken::VarArgMethod { method: m, .. } => m.0 as isize,
            ResolvedToken::Field(f) => f.0 as isize,
            _ => return Err(token_error(token, TokenKind::Type).into()),
        };
        frame.stack.push(StackValue::NativeInt(handle))?;
        Ok(())
    }

    pub(crate) fn init_object(&self, frame: &mut Frame, at: usize, token: Token) -> ExecResult<()> {
        let ty = self.resolve_type(frame, at, token)?;
        let dest = self.pop_address(frame, "initobj")?;
        // SAFETY: managed code vouches for a location of the named type.
        unsafe { std::ptr::write_bytes(dest, 0, ty.ty.size()) };
        Ok(())
    }

    pub(crate) fn copy_object(&self, frame: &mut Frame, at: usize, token: Token) -> ExecResult<()> {
        let ty = self.resolve_type(frame, at, token)?;
        let src = self.pop_address(frame, "cpobj")?;
        let dest = self.pop_address(frame, "cpobj")?;
        // Round-trip through the stack so reference fields hit the barrier.
        // SAFETY: both addresses name locations of the named type.
        unsafe { frame.stack.push_value(ty.ty, src)? };
        let value = frame.stack.pop()?;
        self.store_value(ty.ty, dest, value, "cpobj", true)
    }

    pub(crate) fn load_object(&self, frame: &mut Frame, at: usize, token: Token) -> ExecResult<()> {
        let ty = self.resolve_type(frame, at, token)?;
        let src = self.pop_address(frame, "ldobj")?;
        // SAFETY: the address names a location of the named type.
        unsafe { frame.stack.push_value(ty.ty, src)? };
        Ok(())
    }

    pub(crate) fn store_object(&self, frame: &mut Frame, at: usize, token: Token) -> ExecResult<()> {
        let ty = self.resolve_type(frame, at, token)?;
        frame.stack.normalize();
        let value = frame.stack.pop()?;
        let dest = self.pop_address(frame, "stobj")?;
        self.store_value(ty.ty, dest, value, "stobj", true)
    }
}
