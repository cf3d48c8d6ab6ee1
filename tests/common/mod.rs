#![allow(dead_code)]
use dotnet_interp::{
    types::{MethodSignature, PrimitiveKind, SigType, TypeHandle},
    value::{ObjectRef, StackValue},
    vm::{
        opcodes::Token, standalone::METHOD_TABLE, ExecResult, ILBuilder, Interpreter, InterpreterConfig,
        LocalVar, MethodDefinition, MethodHandle, ObjectModel, StandaloneRuntime, Unwind,
    },
};
use std::sync::Arc;

pub const I4: SigType = SigType::Primitive(PrimitiveKind::I4);
pub const I8: SigType = SigType::Primitive(PrimitiveKind::I8);
pub const R4: SigType = SigType::Primitive(PrimitiveKind::R4);
pub const R8: SigType = SigType::Primitive(PrimitiveKind::R8);
pub const NATIVE_INT: SigType = SigType::Primitive(PrimitiveKind::NativeInt);
pub const OBJECT: SigType = SigType::Primitive(PrimitiveKind::Object);
pub const VOID: SigType = SigType::Primitive(PrimitiveKind::Void);

pub struct Fixture {
    pub runtime: Arc<StandaloneRuntime>,
    pub interp: Interpreter,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(InterpreterConfig::default())
    }

    pub fn with_config(config: InterpreterConfig) -> Self {
        let runtime = Arc::new(StandaloneRuntime::new());
        let interp = Interpreter::new(runtime.clone(), config);
        Self { runtime, interp }
    }

    /// Reserves a handle so bodies can call the method before it exists.
    pub fn reserve(&self) -> (MethodHandle, Token) {
        let handle = self.runtime.new_method_handle();
        (handle, METHOD_TABLE | handle.0)
    }

    /// Defines a static method whose body `build` emits.
    pub fn method(
        &self,
        name: &str,
        signature: MethodSignature,
        locals: Vec<LocalVar>,
        build: impl FnOnce(&mut ILBuilder),
    ) -> (MethodHandle, Token) {
        let (handle, _) = self.reserve();
        self.define(handle, name, signature, locals, build)
    }

    pub fn define(
        &self,
        handle: MethodHandle,
        name: &str,
        signature: MethodSignature,
        locals: Vec<LocalVar>,
        build: impl FnOnce(&mut ILBuilder),
    ) -> (MethodHandle, Token) {
        let object = self.runtime.core_types().object;
        self.install(body(handle, name, signature, locals, build).with_owner(object))
    }

    /// Defines a method of `owner`; constructors and instance methods go
    /// through here.
    pub fn method_on(
        &self,
        owner: TypeHandle,
        name: &str,
        signature: MethodSignature,
        locals: Vec<LocalVar>,
        build: impl FnOnce(&mut ILBuilder),
    ) -> (MethodHandle, Token) {
        let (handle, _) = self.reserve();
        self.install(body(handle, name, signature, locals, build).with_owner(owner))
    }

    pub fn install(&self, def: MethodDefinition) -> (MethodHandle, Token) {
        let handle = def.handle;
        (handle, self.runtime.define_method(def))
    }

    pub fn run(&self, method: MethodHandle, args: &[StackValue]) -> ExecResult<Option<StackValue>> {
        self.interp.invoke(method, args)
    }

    /// Name of the managed exception type `result` unwound with.
    pub fn exception_name<T: std::fmt::Debug>(&self, result: ExecResult<T>) -> String {
        match result {
            Err(Unwind::Exception(obj)) => self.runtime.type_name(self.runtime.object_type(obj)),
            other => panic!("expected a managed exception, got {:?}", other),
        }
    }

    pub fn string(&self, value: StackValue) -> Option<String> {
        match value {
            StackValue::ObjectRef(obj) => self.runtime.string_value(obj),
            _ => None,
        }
    }

    pub fn object_of(&self, ty: TypeHandle) -> ObjectRef {
        match self.runtime.allocate_object(ty) {
            Ok(obj) => obj,
            Err(e) => panic!("allocation failed: {:?}", e),
        }
    }
}

pub fn body(
    handle: MethodHandle,
    name: &str,
    signature: MethodSignature,
    locals: Vec<LocalVar>,
    build: impl FnOnce(&mut ILBuilder),
) -> MethodDefinition {
    let mut il = ILBuilder::new();
    build(&mut il);
    let (code, clauses) = il.finish();
    MethodDefinition::new(handle, name, signature)
        .with_body(code, clauses)
        .with_locals(locals)
        .with_max_stack(16)
}

pub fn static_sig(params: &[SigType], ret: SigType) -> MethodSignature {
    MethodSignature::static_method(params.to_vec(), ret)
}

pub fn instance_sig(params: &[SigType], ret: SigType) -> MethodSignature {
    MethodSignature::instance_method(params.to_vec(), ret)
}
