//! Interfaces the interpreter consumes from the rest of the runtime: the
//! metadata/type system and the object model. Both may run arbitrary code,
//! including class constructors and garbage collections.
use crate::{
    callconv::{ffi::FfiCallee, CompiledCode},
    types::{MethodSignature, SigType, TypeHandle, TypeInfo},
    value::ObjectRef,
    vm::{
        error::{ExecResult, ManagedExceptionKind, ResolutionError},
        interpreter::Interpreter,
        method::{FieldHandle, GenericContext, MethodDefinition, MethodHandle},
        opcodes::Token,
    },
};
use std::{
    fmt::{Display, Formatter},
    sync::Arc,
};

/// What a token is expected to name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Type,
    Method,
    Field,
    String,
    Signature,
}

impl Display for TokenKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TokenKind::Type => "type",
            TokenKind::Method => "method",
            TokenKind::Field => "field",
            TokenKind::String => "string",
            TokenKind::Signature => "signature",
        })
    }
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenKind::Type => "type",
            TokenKind::Method => "method",
            TokenKind::Field => "field",
            TokenKind::String => "string",
            TokenKind::Signature => "signature",
        }
    }
}

/// The method whose body contains the token, under its exact instantiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenScope {
    pub method: MethodHandle,
    pub context: GenericContext,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ResolvedToken {
    Type(TypeHandle),
    Method(MethodHandle),
    /// A vararg call site: the target plus the full signature at the site.
    VarArgMethod {
        method: MethodHandle,
        site: Arc<MethodSignature>,
    },
    Field(FieldHandle),
    /// Interned string, kept alive by the host.
    String(ObjectRef),
    Signature(Arc<MethodSignature>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldInfo {
    pub handle: FieldHandle,
    pub owner: TypeHandle,
    pub ty: SigType,
    /// Offset from the start of the owner's field data (instance fields).
    pub offset: usize,
    /// Address of the storage for static fields.
    pub static_address: Option<usize>,
}

impl FieldInfo {
    pub fn is_static(&self) -> bool {
        self.static_address.is_some()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CallInfo {
    pub method: MethodHandle,
    pub owner: TypeHandle,
    pub name: String,
    pub signature: Arc<MethodSignature>,
    pub is_virtual: bool,
    /// Instantiation argument to pass when the signature takes one.
    pub generic_context: GenericContext,
}

/// What runs when a method is called.
#[derive(Clone)]
pub enum MethodCode {
    Interpreted(Arc<MethodDefinition>),
    /// Code built against the runtime's entry convention.
    Compiled(Arc<dyn CompiledCode>),
    /// A plain exported native function.
    Native(Arc<FfiCallee>),
}

pub trait MetadataResolver: Send + Sync {
    fn resolve_token(
        &self,
        scope: &TokenScope,
        token: Token,
        kind: TokenKind,
    ) -> Result<ResolvedToken, ResolutionError>;

    fn type_info(&self, ty: TypeHandle) -> Arc<TypeInfo>;

    fn field_info(&self, field: FieldHandle, context: GenericContext) -> Result<FieldInfo, ResolutionError>;

    fn call_info(&self, method: MethodHandle, context: GenericContext) -> Result<CallInfo, ResolutionError>;

    fn method_code(&self, method: MethodHandle) -> Option<MethodCode>;

    /// Implementation of `method` for a receiver of runtime type `receiver`.
    fn resolve_virtual(&self, method: MethodHandle, receiver: TypeHandle) -> Result<MethodHandle, ResolutionError>;

    fn is_assignable(&self, from: TypeHandle, to: TypeHandle) -> bool;

    /// Runs the type's initializer if it has not run yet. May re-enter the
    /// interpreter.
    fn ensure_class_initialized(&self, ty: TypeHandle, interp: &Interpreter) -> ExecResult<()>;
}

pub trait ObjectModel: Send + Sync {
    /// May trigger a collection.
    fn allocate_object(&self, ty: TypeHandle) -> ExecResult<ObjectRef>;

    /// May trigger a collection.
    fn allocate_array(&self, element: TypeHandle, length: usize) -> ExecResult<ObjectRef>;

    fn object_type(&self, obj: ObjectRef) -> TypeHandle;

    /// Start of instance field data (or of the payload of a boxed value).
    fn field_data(&self, obj: ObjectRef) -> *mut u8;

    fn array_length(&self, array: ObjectRef) -> usize;

    fn array_element_type(&self, array: ObjectRef) -> TypeHandle;

    fn array_data(&self, array: ObjectRef) -> *mut u8;

    /// Materializes an exception the core raises on its own behalf.
    fn new_exception(&self, kind: ManagedExceptionKind) -> ObjectRef;

    /// The managed exception inside a wrapper for a foreign throw, if any.
    fn unwrap_exception(&self, exception: ObjectRef) -> Option<ObjectRef>;

    fn monitor_enter(&self, obj: ObjectRef);

    fn monitor_exit(&self, obj: ObjectRef);

    /// Object whose monitor guards static synchronized methods of `ty`.
    fn type_object(&self, ty: TypeHandle) -> ObjectRef;

    /// A pending interrupt to raise at the next observation point.
    fn take_interrupt(&self) -> Option<ObjectRef> {
        None
    }

    /// Stores a reference into the heap, applying any write barrier.
    ///
    /// # Safety
    /// `slot` must be a valid, aligned reference slot.
    unsafe fn write_ref(&self, slot: *mut usize, value: ObjectRef) {
        slot.write(value.0)
    }
}

/// Everything the interpreter needs from its embedding runtime.
pub trait Host: MetadataResolver + ObjectModel {}

impl<T: MetadataResolver + ObjectModel> Host for T {}
