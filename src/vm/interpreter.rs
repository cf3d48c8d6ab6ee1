//! Method entry, the fetch/execute loop, and the surface hosts and native
//! code use to run interpreted methods.
use crate::{
    callconv::{stub::EntryStub, ArgRole, CallingConvention, NativeCallState, NativeReturn},
    types::{PrimitiveKind, ValueTypeDescriptor},
    value::{ObjectRef, StackValue},
    vm::{
        config::InterpreterConfig,
        error::{ExecResult, ManagedExceptionKind, ResolutionError, UnimplementedError, Unwind, VerificationError},
        frame::{ArgValue, Frame, VarArgList},
        gc::{self, FrameLink, RootVisitor},
        host::{Host, MethodCode},
        method::{GenericContext, GenericSource, MethodDefinition, MethodDescriptor, MethodFlags, MethodHandle},
        metrics::InterpreterMetrics,
        opcodes,
        registry::MethodRegistry,
        tiering::TieringManager,
        tracer::{TraceEvent, Tracer},
    },
};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgBlockKind {
    /// Laid out by an entry stub per the method's native layout.
    Native,
    /// Built by an interpreted caller: one slot per canonical argument.
    Direct,
}

/// Where an invocation's incoming arguments live.
#[derive(Clone, Copy, Debug)]
pub struct ArgBlock {
    pub kind: ArgBlockKind,
    pub base: *mut u8,
}

impl ArgBlock {
    pub fn native(base: *mut u8) -> Self {
        Self {
            kind: ArgBlockKind::Native,
            base,
        }
    }

    pub fn direct(base: *mut u8) -> Self {
        Self {
            kind: ArgBlockKind::Direct,
            base,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnValue {
    Void,
    /// A primitive or one-slot struct, in the memory format of the declared
    /// return type.
    Scalar(u64),
    /// Written to the caller's return buffer or return slot.
    Struct,
}

pub(crate) enum Flow {
    Continue,
    Return(ReturnValue),
}

pub struct Interpreter {
    pub(crate) host: Arc<dyn Host>,
    pub(crate) registry: Arc<MethodRegistry>,
    pub(crate) config: InterpreterConfig,
    pub(crate) metrics: InterpreterMetrics,
    tiering: Option<Arc<dyn TieringManager>>,
    tracer: Tracer,
    stubs: DashMap<MethodHandle, Arc<EntryStub>>,
}

impl Interpreter {
    pub fn new(host: Arc<dyn Host>, config: InterpreterConfig) -> Self {
        Self {
            host,
            registry: Arc::new(MethodRegistry::new()),
            config,
            metrics: InterpreterMetrics::new(),
            tiering: None,
            tracer: Tracer::disabled(),
            stubs: DashMap::new(),
        }
    }

    /// Shares descriptors and installed code with other interpreters.
    pub fn with_registry(mut self, registry: Arc<MethodRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_tiering(mut self, manager: Arc<dyn TieringManager>) -> Self {
        self.tiering = Some(manager);
        self
    }

    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn metrics(&self) -> &InterpreterMetrics {
        &self.metrics
    }

    #[inline(always)]
    pub fn tracer_enabled(&self) -> bool {
        self.tracer.is_enabled()
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn indent(&self) -> usize {
        gc::frame_depth()
    }

    /// Materializes a core-raised exception as an unwind.
    pub fn exception(&self, kind: ManagedExceptionKind) -> Unwind {
        self.metrics.record_exception_thrown();
        vm_trace!(self, "raising {}", kind.type_name());
        Unwind::Exception(self.host.new_exception(kind))
    }

    pub(crate) fn check_interrupt(&self) -> ExecResult<()> {
        match self.host.take_interrupt() {
            Some(exception) => {
                vm_trace!(self, "interrupt observed");
                Err(Unwind::Exception(exception))
            }
            None => Ok(()),
        }
    }

    /// The descriptor of an interpreted method, built on first use.
    pub fn descriptor(&self, method: MethodHandle) -> ExecResult<Arc<MethodDescriptor>> {
        if let Some(desc) = self.registry.descriptor(method) {
            return Ok(desc);
        }
        match self.host.method_code(method) {
            Some(MethodCode::Interpreted(def)) => self.describe(def),
            _ => Err(ResolutionError::NoCode(method).into()),
        }
    }

    pub(crate) fn describe(&self, def: Arc<MethodDefinition>) -> ExecResult<Arc<MethodDescriptor>> {
        let host = &self.host;
        self.registry.get_or_create(def.handle, || {
            MethodDescriptor::new(def, self.config.convention, &|t| host.type_info(t))
                .map_err(Unwind::from)
        })
    }

    /// The native-to-interpreter entry sequence for `method`, emitted once.
    pub fn entry_stub(&self, method: MethodHandle) -> ExecResult<Arc<EntryStub>> {
        if let Some(stub) = self.stubs.get(&method) {
            return Ok(stub.clone());
        }
        let desc = self.descriptor(method)?;
        let stub = Arc::new(self.config.convention.emit_entry_stub(&desc.layout));
        tracing::debug!(
            method = %desc.name(),
            target = self.config.convention.name(),
            ops = stub.ops.len(),
            "emitted entry stub"
        );
        Ok(self.stubs.entry(method).or_insert(stub).clone())
    }

    /// An address native code can call to reach `method`: the export itself
    /// for native methods, otherwise the method's entry stub.
    pub fn function_pointer(&self, method: MethodHandle) -> ExecResult<usize> {
        if self.registry.descriptor(method).is_none() {
            if let Some(MethodCode::Native(callee)) = self.host.method_code(method) {
                return Ok(callee.address);
            }
        }
        let stub = self.entry_stub(method)?;
        let address = Arc::as_ptr(&stub) as usize;
        self.registry.register_stub(address, method);
        Ok(address)
    }

    /// Enters `method` the way native code does: through its entry stub,
    /// with arguments already in `state` per the configured convention.
    pub fn invoke_native(&self, method: MethodHandle, state: &mut NativeCallState) -> ExecResult<NativeReturn> {
        let desc = self.descriptor(method)?;
        let stub = self.entry_stub(method)?;
        stub.invoke(self, &desc, state)
    }

    /// Calls `method` with primitive arguments (receiver first), returning
    /// its primitive result. References in `args` must be kept alive by the
    /// caller for the duration of the call.
    pub fn invoke(&self, method: MethodHandle, args: &[StackValue]) -> ExecResult<Option<StackValue>> {
        let desc = self.descriptor(method)?;
        let sig = desc.definition.signature.clone();
        if args.len() != sig.il_arg_count() {
            return Err(ResolutionError::Host(format!(
                "{} takes {} arguments, {} given",
                desc.name(),
                sig.il_arg_count(),
                args.len()
            ))
            .into());
        }
        if desc.ret.is_struct() {
            return Err(UnimplementedError::ArgumentClass {
                target: "invoke",
                detail: format!("struct return {:?}", desc.ret),
            }
            .into());
        }

        let this = usize::from(sig.has_this);
        let varargs = VarArgList::default();
        let mut staged = Vec::with_capacity(desc.args.len());
        for arg in &desc.args {
            let value = match (arg.role, arg.ty) {
                (ArgRole::This, _) => ArgValue::primitive(sig.this_kind, args[0]),
                (ArgRole::Param(i), ValueTypeDescriptor::Primitive(kind)) => {
                    ArgValue::primitive(kind, args[i as usize + this])
                }
                (ArgRole::Param(_), ty) => {
                    return Err(UnimplementedError::ArgumentClass {
                        target: "invoke",
                        detail: format!("struct argument {:?}", ty),
                    }
                    .into())
                }
                (ArgRole::VarArgCookie, _) => ArgValue::native_int(varargs.cookie()),
                (ArgRole::GenericContext | ArgRole::RetBuf, _) => ArgValue::native_int(0),
            };
            staged.push(value);
        }
        let mut block: Vec<u64> = staged.iter().map(ArgValue::first_slot).collect();

        let result = self.interpret(&desc, ArgBlock::direct(block.as_mut_ptr().cast()), None);
        if let Err(Unwind::Fatal(error)) = &result {
            tracing::error!(method = %desc.name(), %error, "invocation failed");
        }
        match (result?, desc.ret) {
            (ReturnValue::Scalar(bits), ValueTypeDescriptor::Primitive(kind)) if kind != PrimitiveKind::Void => {
                // SAFETY: `bits` holds a value of the declared return kind.
                Ok(Some(unsafe { StackValue::load((&bits as *const u64).cast(), kind) }))
            }
            _ => Ok(None),
        }
    }

    /// Runs one invocation of `method` over an argument block. Struct
    /// returns without a return buffer are written to `ret_slot`.
    pub fn interpret(
        &self,
        method: &Arc<MethodDescriptor>,
        args: ArgBlock,
        ret_slot: Option<*mut u8>,
    ) -> ExecResult<ReturnValue> {
        let depth = gc::frame_depth();
        if depth >= self.config.max_call_depth {
            tracing::warn!(method = %method.name(), depth, "interpreter call depth limit reached");
            return Err(self.exception(ManagedExceptionKind::StackOverflow));
        }
        self.metrics.record_invocation();
        self.note_invocation(method);

        let mut frame = Frame::new(method.clone(), args, ret_slot);
        let context = self.generic_context(&frame);
        if !context.is_none() {
            frame.set_context(context);
        }
        // SAFETY: `frame` stays in place until `_link` drops at the end of
        // this function.
        let _link = unsafe { FrameLink::push(&mut frame) };
        vm_event!(
            self,
            Enter {
                method: method.name(),
                signature: &method.definition.signature.to_string(),
            }
        );

        let synchronized = method.has(MethodFlags::SYNCHRONIZED);
        if synchronized {
            self.host.monitor_enter(self.monitor_object(&frame));
        }
        let mut result = self.run(&mut frame);
        if synchronized {
            // Re-read: a collection may have moved the receiver.
            self.host.monitor_exit(self.monitor_object(&frame));
            if result.is_ok() {
                if let Err(interrupt) = self.check_interrupt() {
                    result = Err(interrupt);
                }
            }
        }
        vm_event!(self, Exit { method: method.name() });
        result
    }

    /// Counts a call toward promotion. Runs for every invocation, including
    /// the ones served without a frame.
    pub(crate) fn note_invocation(&self, method: &Arc<MethodDescriptor>) {
        let Some(manager) = &self.tiering else {
            return;
        };
        let threshold = if !self.config.interpret_loop_methods && method.has(MethodFlags::MAY_HAVE_LOOP) {
            1
        } else {
            self.config.tiering_threshold
        };
        if method.tiering.record_call(threshold) {
            tracing::info!(
                method = %method.name(),
                calls = method.tiering.calls(),
                "requesting promotion"
            );
            self.metrics.record_promotion();
            manager.request_promotion(method);
        }
    }

    fn generic_context(&self, frame: &Frame) -> GenericContext {
        let def = &frame.method.definition;
        match def.generic_source {
            GenericSource::None => GenericContext::NONE,
            GenericSource::HiddenArg => {
                GenericContext(frame.hidden_arg(ArgRole::GenericContext).unwrap_or(0) as usize)
            }
            GenericSource::ThisType if def.signature.this_kind == PrimitiveKind::Object => {
                match frame.hidden_arg(ArgRole::This) {
                    Some(this) if this != 0 => {
                        let ty = self.host.object_type(ObjectRef(this as usize));
                        GenericContext(ty.0 as usize)
                    }
                    _ => GenericContext::NONE,
                }
            }
            GenericSource::ThisType => GenericContext::NONE,
        }
    }

    fn monitor_object(&self, frame: &Frame) -> ObjectRef {
        match frame.hidden_arg(ArgRole::This) {
            Some(this) if frame.method.definition.signature.this_kind == PrimitiveKind::Object => {
                ObjectRef(this as usize)
            }
            _ => self.host.type_object(frame.method.definition.owner),
        }
    }

    fn run(&self, frame: &mut Frame) -> ExecResult<ReturnValue> {
        let method = frame.method.clone();
        let code = method.code();
        loop {
            let at = frame.ip;
            match self.step(frame, code, at) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return(value)) => return Ok(value),
                Err(unwind) => {
                    let unwind = unwind.with_context(method.name(), at);
                    match &unwind {
                        Unwind::Fatal(error) => vm_error!(self, "{}", error),
                        Unwind::Exception(exception) => vm_event!(
                            self,
                            Exception {
                                exception,
                                method: method.name(),
                                offset: at,
                            }
                        ),
                    }
                    self.dispatch_exception(frame, unwind, at as u32, 0)?;
                }
            }
        }
    }

    fn step(&self, frame: &mut Frame, code: &[u8], at: usize) -> ExecResult<Flow> {
        if at >= code.len() {
            return Err(VerificationError::FellOffEnd.into());
        }
        let (op, next) = opcodes::decode(code, at)?;
        self.metrics.record_instruction();
        vm_event!(
            self,
            Instruction {
                offset: at,
                op: &op,
                height: frame.stack.len(),
            }
        );
        frame.ip = next;
        self.execute(frame, code, op, at)
    }

    /// Reports every reference held by interpreted frames on the calling
    /// thread. Only valid at a safe point.
    ///
    /// Each mutator thread scans itself, typically from the host's
    /// allocation path; frames running on other threads are not visited.
    /// See [`gc::scan_current_thread`].
    pub fn scan_roots(&self, visitor: &mut dyn RootVisitor) -> usize {
        let roots = gc::scan_current_thread(&*self.host, visitor);
        self.metrics.record_gc_scan();
        if self.tracer_enabled() {
            self.tracer.event(
                self.indent(),
                TraceEvent::RootScan {
                    frames: gc::frame_depth(),
                    roots,
                },
            );
        }
        roots
    }
}
