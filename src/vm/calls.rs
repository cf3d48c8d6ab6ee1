//! `call`, `callvirt`, `newobj`, `calli` and function pointers.
//!
//! Arguments are popped into the frame's staging area in IL order, then
//! rearranged into the canonical order the callee expects: receiver, return
//! buffer, vararg cookie, instantiation argument, declared parameters. The
//! staging area is visible to the root scanner for the whole call.
use crate::{
    callconv::{ffi::FfiCallee, ArgClass, ArgLayout, ArgRole, CallingConvention, CompiledCode, NativeSignature, ReturnPlacement},
    types::{rules, MethodSignature, PrimitiveKind, ValueTypeDescriptor, SLOT_SIZE},
    value::{ObjectRef, StackValue},
    vm::{
        cache::{CachedItem, CallSiteInfo, IlOffsetCache},
        error::{ExecResult, ManagedExceptionKind, ResolutionError, VerificationError},
        frame::{ArgValue, Frame, VarArgList},
        gc::NoGcRegion,
        host::{CallInfo, MethodCode, ResolvedToken, TokenKind},
        interpreter::{ArgBlock, Interpreter, ReturnValue},
        method::{GenericContext, GenericSource, MethodDescriptor, MethodFlags, MethodHandle},
        opcodes::Token,
    },
};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CallKind {
    Call,
    CallVirt,
    NewObj,
}

impl CallKind {
    fn mnemonic(self) -> &'static str {
        match self {
            CallKind::Call => "call",
            CallKind::CallVirt => "callvirt",
            CallKind::NewObj => "newobj",
        }
    }
}

impl Interpreter {
    /// Looks `offset` up in `cache`, resolving and committing on a miss.
    pub(crate) fn cached(
        &self,
        cache: &IlOffsetCache,
        offset: u32,
        resolve: impl FnOnce() -> ExecResult<CachedItem>,
    ) -> ExecResult<CachedItem> {
        if !self.config.use_call_site_cache {
            return resolve();
        }
        if let Some(item) = cache.get(offset) {
            self.metrics.record_cache_lookup(true);
            return Ok(item);
        }
        self.metrics.record_cache_lookup(false);
        let (item, won) = cache.insert(offset, resolve()?);
        if !won {
            self.metrics.record_cache_race();
        }
        Ok(item)
    }

    fn call_site(&self, call: CallInfo, site: Option<Arc<MethodSignature>>) -> CallSiteInfo {
        let host = &self.host;
        let sig = site.as_ref().unwrap_or(&call.signature);
        let params = sig.params.iter().map(|p| p.descriptor(|h| host.type_info(h))).collect();
        let ret = sig.ret.descriptor(|h| host.type_info(h));
        CallSiteInfo {
            call,
            params,
            ret,
            site_signature: site,
        }
    }

    pub(crate) fn resolve_call(&self, frame: &Frame, at: usize, token: Token) -> ExecResult<Arc<CallSiteInfo>> {
        let scope = frame.scope();
        let item = self.cached(&frame.cache, at as u32, || {
            let (method, site) = match self.host.resolve_token(&scope, token, TokenKind::Method)? {
                ResolvedToken::Method(method) => (method, None),
                ResolvedToken::VarArgMethod { method, site } => (method, Some(site)),
                _ => {
                    return Err(ResolutionError::Token {
                        token,
                        kind: TokenKind::Method.as_str(),
                    }
                    .into())
                }
            };
            let call = self.host.call_info(method, scope.context)?;
            Ok(CachedItem::Call(Arc::new(self.call_site(call, site))))
        })?;
        match item {
            CachedItem::Call(site) => Ok(site),
            _ => Err(ResolutionError::Token {
                token,
                kind: TokenKind::Method.as_str(),
            }
            .into()),
        }
    }

    /// Pops a call's arguments, receiver last, into IL order.
    fn pop_arguments(
        &self,
        frame: &mut Frame,
        has_this: bool,
        params: &[ValueTypeDescriptor],
        instruction: &'static str,
    ) -> ExecResult<Vec<ArgValue>> {
        let mut args = Vec::with_capacity(params.len() + 1);
        for &ty in params.iter().rev() {
            let (stack_ty, bits) = frame.stack.pop()?;
            match (ty, stack_ty) {
                (ValueTypeDescriptor::Primitive(kind), ValueTypeDescriptor::Primitive(actual)) => {
                    if !rules::store_allowed(kind.stack_normal(), actual, self.config.type_rules) {
                        return Err(VerificationError::IncompatibleStore { target: kind, value: stack_ty }.into());
                    }
                }
                (ValueTypeDescriptor::Primitive(kind), _) => {
                    return Err(VerificationError::IncompatibleStore { target: kind, value: stack_ty }.into())
                }
                _ if ty.struct_handle() != stack_ty.struct_handle() => {
                    return Err(VerificationError::UnexpectedOperand {
                        instruction,
                        actual: stack_ty,
                    }
                    .into())
                }
                _ => {}
            }
            // SAFETY: a just-popped entry stays readable until the next push.
            args.push(unsafe { ArgValue::from_stack(ty, stack_ty, bits) });
        }
        if has_this {
            let receiver = match frame.stack.pop()? {
                (ValueTypeDescriptor::Primitive(kind @ (PrimitiveKind::Object | PrimitiveKind::ByRef | PrimitiveKind::NativeInt)), bits) => {
                    StackValue::from_slot(kind, bits)
                }
                (actual, _) => {
                    return Err(VerificationError::UnexpectedOperand { instruction, actual }.into())
                }
            };
            args.push(ArgValue::primitive(receiver.kind(), receiver));
        }
        args.reverse();
        Ok(args)
    }

    pub(crate) fn call(&self, frame: &mut Frame, at: usize, token: Token, kind: CallKind) -> ExecResult<()> {
        let site = self.resolve_call(frame, at, token)?;
        let sig = site.site_signature.clone().unwrap_or_else(|| site.call.signature.clone());
        vm_trace!(self, "{} {}", kind.mnemonic(), site.call.name);

        frame.stack.normalize();
        frame.staging.clear();
        let pops_this = sig.has_this && kind != CallKind::NewObj;
        let args = self.pop_arguments(frame, pops_this, &site.params, kind.mnemonic())?;
        frame.staging.outbound = args;

        let mut target = site.call.method;
        let mut context = site.call.generic_context;
        match kind {
            CallKind::NewObj => self.construct(frame, &site)?,
            CallKind::CallVirt => {
                if let Some(resolved) = self.resolve_receiver(frame, &site)? {
                    target = resolved.method;
                    context = resolved.generic_context;
                }
            }
            CallKind::Call => {}
        }
        frame.constrained = None;

        let value = self.invoke_target(frame, &sig, target, context)?;
        if kind == CallKind::NewObj {
            self.push_new_object(frame)?;
        } else {
            self.push_return(frame, site.ret, value)?;
        }
        frame.staging.clear();
        Ok(())
    }

    /// Allocates the object (or zeroed value) a constructor runs on and
    /// passes it as the receiver.
    fn construct(&self, frame: &mut Frame, site: &CallSiteInfo) -> ExecResult<()> {
        let owner = site.call.owner;
        let info = self.host.type_info(owner);
        let receiver = if info.is_value_type {
            let ty = ValueTypeDescriptor::of_type(owner, &info);
            let value = frame.staging.new_object.insert(ArgValue::zeroed(ty));
            ArgValue::primitive(PrimitiveKind::ByRef, StackValue::ManagedPtr(value.as_mut_ptr() as usize))
        } else {
            self.host.ensure_class_initialized(owner, self)?;
            let obj = self.host.allocate_object(owner)?;
            frame.staging.new_object = Some(ArgValue::primitive(PrimitiveKind::Object, obj.into()));
            ArgValue::primitive(PrimitiveKind::Object, obj.into())
        };
        frame.staging.outbound.insert(0, receiver);
        Ok(())
    }

    fn push_new_object(&self, frame: &mut Frame) -> ExecResult<()> {
        let Some(value) = frame.staging.new_object.take() else {
            return Err(VerificationError::MisplacedInstruction("newobj").into());
        };
        match value.ty {
            ValueTypeDescriptor::Primitive(PrimitiveKind::Object) => {
                frame.stack.push(StackValue::ObjectRef(ObjectRef(value.first_slot() as usize)))?
            }
            // SAFETY: `value` holds a complete value of its type.
            ty => unsafe { frame.stack.push_value(ty, value.as_ptr())? },
        }
        Ok(())
    }

    /// Applies a pending `constrained.` prefix, null-checks the receiver
    /// and performs virtual dispatch. Returns the new target, if it changed.
    fn resolve_receiver(&self, frame: &mut Frame, site: &CallSiteInfo) -> ExecResult<Option<CallInfo>> {
        if !site.call.signature.has_this {
            return Ok(None);
        }
        if let Some(constrained) = frame.constrained.take() {
            let pointer = frame.staging.outbound[0].first_slot() as usize;
            if pointer == 0 {
                return Err(self.exception(ManagedExceptionKind::NullReference));
            }
            if constrained.info.is_value_type {
                let resolved = self.host.resolve_virtual(site.call.method, constrained.handle)?;
                let info = self.host.call_info(resolved, site.call.generic_context)?;
                if info.owner == constrained.handle {
                    vm_trace!(self, "constrained call resolved to {}", info.name);
                    return Ok(Some(info));
                }
                let boxed = self.host.allocate_object(constrained.handle)?;
                let _no_gc = NoGcRegion::enter();
                // Re-read: the allocation may have moved the referent.
                let src = frame.staging.outbound[0].first_slot() as usize as *const u8;
                // SAFETY: the receiver points at a value of the constrained type.
                unsafe { std::ptr::copy(src, self.host.field_data(boxed), constrained.info.size) };
                frame.staging.outbound[0] = ArgValue::primitive(PrimitiveKind::Object, boxed.into());
            } else {
                let _no_gc = NoGcRegion::enter();
                // SAFETY: the receiver points at a reference-typed location.
                let obj = unsafe { (pointer as *const usize).read_unaligned() };
                frame.staging.outbound[0] = ArgValue::primitive(PrimitiveKind::Object, ObjectRef(obj).into());
            }
        }

        let this = &frame.staging.outbound[0];
        if this.first_slot() == 0 {
            return Err(self.exception(ManagedExceptionKind::NullReference));
        }
        if !site.call.is_virtual || this.ty != ValueTypeDescriptor::OBJECT {
            return Ok(None);
        }
        let receiver = self.host.object_type(ObjectRef(this.first_slot() as usize));
        let resolved = self.host.resolve_virtual(site.call.method, receiver)?;
        if resolved == site.call.method {
            return Ok(None);
        }
        Ok(Some(self.host.call_info(resolved, site.call.generic_context)?))
    }

    /// Runs `target` with the staged IL-order arguments, by whichever code
    /// it currently has.
    fn invoke_target(
        &self,
        frame: &mut Frame,
        sig: &Arc<MethodSignature>,
        target: MethodHandle,
        context: GenericContext,
    ) -> ExecResult<ReturnValue> {
        if let Some(code) = self.registry.compiled(target) {
            let layout = match self.registry.descriptor(target) {
                Some(desc) if !sig.is_vararg() => desc.layout.clone(),
                _ => self.layout_for(sig)?,
            };
            return self.call_compiled(frame, sig, &layout, &*code, context);
        }
        if let Some(desc) = self.registry.descriptor(target) {
            return self.call_interpreted(frame, sig, &desc, context);
        }
        match self.host.method_code(target) {
            Some(MethodCode::Interpreted(def)) => {
                let desc = self.describe(def)?;
                self.call_interpreted(frame, sig, &desc, context)
            }
            Some(MethodCode::Compiled(code)) => {
                let layout = self.layout_for(sig)?;
                self.call_compiled(frame, sig, &layout, &*code, context)
            }
            Some(MethodCode::Native(callee)) => self.call_native(frame, sig, &callee),
            None => Err(ResolutionError::NoCode(target).into()),
        }
    }

    fn layout_for(&self, sig: &MethodSignature) -> ExecResult<ArgLayout> {
        let host = &self.host;
        let native = NativeSignature::from_method(sig, &|t| host.type_info(t));
        Ok(self.config.convention.classify_args(&native)?)
    }

    /// Rewrites the staged IL-order arguments into the canonical order given
    /// by `roles`. Parameters no role names travel in the vararg list.
    fn arrange(
        &self,
        frame: &mut Frame,
        sig: &MethodSignature,
        roles: &[ArgRole],
        context: GenericContext,
    ) -> ExecResult<()> {
        let staging = &mut frame.staging;
        let mut il = std::mem::take(&mut staging.outbound).into_iter();
        let mut this = if sig.has_this { il.next() } else { None };
        let mut params: Vec<Option<ArgValue>> = il.map(Some).collect();

        if sig.is_vararg() {
            let named: Vec<usize> = roles
                .iter()
                .filter_map(|r| match r {
                    ArgRole::Param(i) => Some(*i as usize),
                    _ => None,
                })
                .collect();
            let mut list = VarArgList::default();
            for (i, param) in params.iter_mut().enumerate() {
                if !named.contains(&i) {
                    if let Some(value) = param.take() {
                        list.args.push(value);
                    }
                }
            }
            staging.varargs = Some(Box::new(list));
        }

        let mut canonical = Vec::with_capacity(roles.len());
        for role in roles {
            let value = match *role {
                ArgRole::This => this.take(),
                ArgRole::RetBuf => {
                    let ret = sig.ret.descriptor(|h| self.host.type_info(h));
                    let buffer = staging.ret.insert(ArgValue::zeroed(ret));
                    Some(ArgValue::native_int(buffer.as_mut_ptr() as usize))
                }
                ArgRole::VarArgCookie => staging.varargs.as_ref().map(|list| ArgValue::native_int(list.cookie())),
                ArgRole::GenericContext => Some(ArgValue::native_int(context.0)),
                ArgRole::Param(i) => params.get_mut(i as usize).and_then(Option::take),
            };
            let value = value.ok_or_else(|| ResolutionError::Host(format!("no value for argument {}", role)))?;
            canonical.push(value);
        }
        staging.outbound = canonical;
        Ok(())
    }

    fn call_interpreted(
        &self,
        frame: &mut Frame,
        sig: &MethodSignature,
        desc: &Arc<MethodDescriptor>,
        context: GenericContext,
    ) -> ExecResult<ReturnValue> {
        if let Some(value) = self.try_getter(frame, desc)? {
            return Ok(value);
        }

        let roles: Vec<ArgRole> = desc.args.iter().map(|a| a.role).collect();
        self.arrange(frame, sig, &roles, context)?;
        let staging = &mut frame.staging;
        staging.block = staging
            .outbound
            .iter_mut()
            .map(|v| {
                if v.ty.is_overflow() {
                    v.as_mut_ptr() as u64
                } else {
                    v.first_slot()
                }
            })
            .collect();
        debug_assert_eq!(staging.block.len() * SLOT_SIZE, desc.direct_block_size);

        let ret_slot = if desc.ret.is_struct() && !desc.has(MethodFlags::HAS_RET_BUF) {
            Some(staging.ret.insert(ArgValue::zeroed(desc.ret)).as_mut_ptr())
        } else {
            None
        };
        let block = staging.block.as_mut_ptr().cast();
        self.interpret(desc, ArgBlock::direct(block), ret_slot)
    }

    /// Reads the field of a plain getter directly, skipping the callee's
    /// frame. `None` when the call has to run normally.
    fn try_getter(&self, frame: &mut Frame, desc: &Arc<MethodDescriptor>) -> ExecResult<Option<ReturnValue>> {
        let Some(getter) = desc.getter_field else {
            return Ok(None);
        };
        if desc.definition.generic_source != GenericSource::None {
            return Ok(None);
        }
        let this = &frame.staging.outbound[0];
        if this.ty != ValueTypeDescriptor::OBJECT || this.first_slot() == 0 {
            return Ok(None);
        }
        let obj = ObjectRef(this.first_slot() as usize);
        let cache = desc.call_site_cache(GenericContext::NONE);
        let scope = crate::vm::host::TokenScope {
            method: desc.handle(),
            context: GenericContext::NONE,
        };
        let access = match self.resolve_field_in(&cache, &scope, getter.offset, getter.token)? {
            CachedItem::InstanceField(access) => access,
            _ => return Ok(None),
        };
        if access.ty.is_overflow() {
            return Ok(None);
        }
        let bits = {
            let _no_gc = NoGcRegion::enter();
            // SAFETY: the field lies inside the object's field data.
            unsafe {
                let src = self.host.field_data(obj).add(access.info.offset);
                let mut bits = 0u64;
                std::ptr::copy_nonoverlapping(src, (&mut bits as *mut u64).cast(), access.ty.size());
                bits
            }
        };
        self.note_invocation(desc);
        self.metrics.record_getter_fast_path();
        vm_trace!(self, "getter fast path for {}", desc.name());
        Ok(Some(ReturnValue::Scalar(bits)))
    }

    fn call_compiled(
        &self,
        frame: &mut Frame,
        sig: &MethodSignature,
        layout: &ArgLayout,
        code: &dyn CompiledCode,
        context: GenericContext,
    ) -> ExecResult<ReturnValue> {
        let roles: Vec<ArgRole> = layout.args.iter().map(|a| a.role).collect();
        self.arrange(frame, sig, &roles, context)?;
        let convention = self.config.convention;
        let mut state = {
            let values: Vec<&[u8]> = frame.staging.outbound.iter().map(ArgValue::bytes).collect();
            convention.marshal_outbound_call(layout, &values)
        };
        let ret = code.invoke(&mut state)?;
        self.metrics.record_compiled_call();

        let ret_ty = sig.ret.descriptor(|h| self.host.type_info(h));
        Ok(match &layout.ret {
            ReturnPlacement::Void => ReturnValue::Void,
            ReturnPlacement::Buffer => ReturnValue::Struct,
            ReturnPlacement::Registers { .. } if ret_ty.is_overflow() => {
                let staged = frame.staging.ret.insert(ArgValue::zeroed(ret_ty));
                convention.read_return(layout, &ret, staged.bytes_mut());
                ReturnValue::Struct
            }
            _ => {
                let mut bytes = [0u8; SLOT_SIZE];
                let size = ret_ty.size().min(SLOT_SIZE);
                convention.read_return(layout, &ret, &mut bytes[..size]);
                ReturnValue::Scalar(u64::from_le_bytes(bytes))
            }
        })
    }

    fn call_native(&self, frame: &mut Frame, sig: &MethodSignature, callee: &FfiCallee) -> ExecResult<ReturnValue> {
        let mut roles = vec![];
        if sig.has_this {
            roles.push(ArgRole::This);
        }
        roles.extend((0..sig.params.len()).map(|i| ArgRole::Param(i as u16)));
        self.arrange(frame, sig, &roles, GenericContext::NONE)?;

        let args: Vec<*mut u8> = frame.staging.outbound.iter_mut().map(ArgValue::as_mut_ptr).collect();
        let ret_ty = sig.ret.descriptor(|h| self.host.type_info(h));
        let value = if ret_ty.is_overflow() {
            let staged = frame.staging.ret.insert(ArgValue::zeroed(ret_ty));
            // SAFETY: `args` follow the callee's declared parameters and the
            // staged buffer fits the return value.
            unsafe { callee.call(&args, staged.as_mut_ptr()) };
            ReturnValue::Struct
        } else {
            let mut bits = [0u64; 2];
            // SAFETY: as above; scalar returns fit in two slots.
            unsafe { callee.call(&args, bits.as_mut_ptr().cast()) };
            if ret_ty == ValueTypeDescriptor::VOID {
                ReturnValue::Void
            } else {
                ReturnValue::Scalar(bits[0])
            }
        };
        self.metrics.record_native_call();
        Ok(value)
    }

    /// Pushes a callee's result as a value of type `ret`.
    fn push_return(&self, frame: &mut Frame, ret: ValueTypeDescriptor, value: ReturnValue) -> ExecResult<()> {
        match (value, ret) {
            (ReturnValue::Void, _) => {}
            (ReturnValue::Scalar(bits), ValueTypeDescriptor::Primitive(kind)) => {
                // SAFETY: `bits` holds a value of `kind` in memory format.
                frame.stack.push(unsafe { StackValue::load((&bits as *const u64).cast(), kind) })?
            }
            (ReturnValue::Scalar(bits), ty) if !ty.is_overflow() => frame.stack.push_raw(ty, bits)?,
            (ReturnValue::Scalar(_), ty) => {
                return Err(VerificationError::UnexpectedOperand {
                    instruction: "call",
                    actual: ty,
                }
                .into())
            }
            (ReturnValue::Struct, ty) => {
                let Some(staged) = frame.staging.ret.take() else {
                    return Err(VerificationError::UnexpectedOperand {
                        instruction: "call",
                        actual: ty,
                    }
                    .into());
                };
                // SAFETY: the callee filled the staged buffer.
                unsafe { frame.stack.push_value(ty, staged.as_ptr())? };
            }
        }
        Ok(())
    }

    pub(crate) fn calli(&self, frame: &mut Frame, token: Token) -> ExecResult<()> {
        let scope = frame.scope();
        let sig = match self.host.resolve_token(&scope, token, TokenKind::Signature)? {
            ResolvedToken::Signature(sig) => sig,
            _ => {
                return Err(ResolutionError::Token {
                    token,
                    kind: TokenKind::Signature.as_str(),
                }
                .into())
            }
        };
        let host = &self.host;
        let params: Vec<ValueTypeDescriptor> =
            sig.params.iter().map(|p| p.descriptor(|h| host.type_info(h))).collect();
        let ret = sig.ret.descriptor(|h| host.type_info(h));

        frame.stack.normalize();
        frame.staging.clear();
        let pointer = frame.stack.pop_value()?.as_isize() as usize;
        if pointer == 0 {
            return Err(self.exception(ManagedExceptionKind::NullReference));
        }
        let args = self.pop_arguments(frame, sig.has_this, &params, "calli")?;
        frame.staging.outbound = args;

        let value = match self.registry.method_for_stub(pointer) {
            Some(method) => {
                vm_trace!(self, "calli through entry stub of {:?}", method);
                self.invoke_target(frame, &sig, method, GenericContext::NONE)?
            }
            None => {
                let classes = sig.params.iter().map(|p| ArgClass::of(*p, &|h| host.type_info(h)));
                let mut all = vec![];
                if sig.has_this {
                    all.push(ArgClass::POINTER);
                }
                all.extend(classes);
                let ret_class = (!sig.ret.is_void()).then(|| ArgClass::of(sig.ret, &|h| host.type_info(h)));
                let callee = FfiCallee::new(pointer, all, ret_class);
                self.call_native(frame, &sig, &callee)?
            }
        };
        self.push_return(frame, ret, value)?;
        frame.staging.clear();
        Ok(())
    }

    /// `ldftn` / `ldvirtftn`.
    pub(crate) fn load_function(&self, frame: &mut Frame, at: usize, token: Token, virtual_call: bool) -> ExecResult<()> {
        let site = self.resolve_call(frame, at, token)?;
        let mut target = site.call.method;
        if virtual_call {
            let obj = match frame.stack.pop_value()? {
                StackValue::ObjectRef(obj) => obj,
                other => {
                    return Err(VerificationError::UnexpectedOperand {
                        instruction: "ldvirtftn",
                        actual: ValueTypeDescriptor::Primitive(other.kind()),
                    }
                    .into())
                }
            };
            if obj.is_null() {
                return Err(self.exception(ManagedExceptionKind::NullReference));
            }
            if site.call.is_virtual {
                target = self.host.resolve_virtual(target, self.host.object_type(obj))?;
            }
        }
        let address = self.function_pointer(target)?;
        frame.stack.push(StackValue::NativeInt(address as isize))?;
        Ok(())
    }
}
