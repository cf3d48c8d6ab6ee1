//! A self-contained host runtime: metadata tables, a heap that never frees,
//! monitors and class initialization. Used by the CLI and the test suites.
//!
//! Object layout: two header words (type handle, then array or string
//! length) followed by the field data. An [`ObjectRef`] is the address of
//! the first header word.
use crate::{
    callconv::{
        ffi::{FfiCallee, NativeLibraries, NativeLibraryError},
        ArgClass, CompiledCode,
    },
    types::{FlatField, MethodSignature, PrimitiveKind, SigType, TypeHandle, TypeInfo, SLOT_SIZE},
    utils::align_up,
    value::ObjectRef,
    vm::{
        error::{ExecResult, ManagedExceptionKind, ResolutionError, Unwind},
        gc::{self, RootVisitor},
        host::{CallInfo, FieldInfo, MetadataResolver, MethodCode, ObjectModel, ResolvedToken, TokenKind, TokenScope},
        interpreter::Interpreter,
        method::{FieldHandle, GenericContext, MethodDefinition, MethodHandle},
        opcodes::Token,
    },
};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};

const HEADER_SIZE: usize = 2 * SLOT_SIZE;

pub const TYPE_TABLE: u32 = 0x0200_0000;
pub const FIELD_TABLE: u32 = 0x0400_0000;
pub const METHOD_TABLE: u32 = 0x0600_0000;
pub const MEMBER_REF_TABLE: u32 = 0x0A00_0000;
pub const SIGNATURE_TABLE: u32 = 0x1100_0000;
pub const STRING_TABLE: u32 = 0x7000_0000;

/// Well-known types every runtime defines up front.
#[derive(Clone, Copy, Debug)]
pub struct CoreTypes {
    pub object: TypeHandle,
    pub value_type: TypeHandle,
    pub string: TypeHandle,
    pub array: TypeHandle,
    pub exception: TypeHandle,
    pub wrapped_exception: TypeHandle,
    pub runtime_type: TypeHandle,
}

struct TypeEntry {
    info: Arc<TypeInfo>,
    parent: Option<TypeHandle>,
    /// Element type, for array types.
    element: Option<TypeHandle>,
}

struct MethodEntry {
    call: CallInfo,
    code: Option<MethodCode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InitState {
    Uninitialized,
    Running(ThreadId),
    Done,
    Failed,
}

struct InitCell {
    state: Mutex<InitState>,
    done: Condvar,
}

#[derive(Default)]
struct Monitors {
    owners: Mutex<HashMap<usize, (ThreadId, u32)>>,
    released: Condvar,
}

/// A reference slot reported while the runtime was stressing the collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordedRoot {
    pub slot: usize,
    /// Contents of the slot when it was reported.
    pub value: usize,
    pub interior: bool,
    pub pinned: bool,
}

pub struct StandaloneRuntime {
    types: RwLock<Vec<TypeEntry>>,
    array_types: DashMap<TypeHandle, TypeHandle>,
    primitive_types: DashMap<PrimitiveKind, TypeHandle>,
    exception_types: DashMap<ManagedExceptionKind, TypeHandle>,
    type_objects: DashMap<TypeHandle, ObjectRef>,
    class_constructors: DashMap<TypeHandle, MethodHandle>,
    init_cells: DashMap<TypeHandle, Arc<InitCell>>,
    methods: DashMap<MethodHandle, MethodEntry>,
    overrides: DashMap<(TypeHandle, MethodHandle), MethodHandle>,
    fields: DashMap<FieldHandle, FieldInfo>,
    tokens: DashMap<Token, ResolvedToken>,
    heap: Mutex<Vec<Box<[u64]>>>,
    heap_bytes: AtomicUsize,
    next_method: AtomicU32,
    next_field: AtomicU32,
    next_string: AtomicU32,
    next_signature: AtomicU32,
    next_member_ref: AtomicU32,
    monitors: Monitors,
    interrupt: Mutex<Option<ObjectRef>>,
    gc_stress: AtomicBool,
    roots: Mutex<Vec<RecordedRoot>>,
    collections: AtomicUsize,
    libraries: NativeLibraries,
    core: CoreTypes,
}

impl Default for StandaloneRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl StandaloneRuntime {
    pub fn new() -> Self {
        let placeholder = TypeHandle(0);
        let mut rt = Self {
            types: RwLock::new(vec![]),
            array_types: DashMap::new(),
            primitive_types: DashMap::new(),
            exception_types: DashMap::new(),
            type_objects: DashMap::new(),
            class_constructors: DashMap::new(),
            init_cells: DashMap::new(),
            methods: DashMap::new(),
            overrides: DashMap::new(),
            fields: DashMap::new(),
            tokens: DashMap::new(),
            heap: Mutex::new(vec![]),
            heap_bytes: AtomicUsize::new(0),
            next_method: AtomicU32::new(1),
            next_field: AtomicU32::new(1),
            next_string: AtomicU32::new(1),
            next_signature: AtomicU32::new(1),
            next_member_ref: AtomicU32::new(1),
            monitors: Monitors::default(),
            interrupt: Mutex::new(None),
            gc_stress: AtomicBool::new(false),
            roots: Mutex::new(vec![]),
            collections: AtomicUsize::new(0),
            libraries: NativeLibraries::new("."),
            core: CoreTypes {
                object: placeholder,
                value_type: placeholder,
                string: placeholder,
                array: placeholder,
                exception: placeholder,
                wrapped_exception: placeholder,
                runtime_type: placeholder,
            },
        };
        let object = rt.push_type(TypeInfo::class("System.Object", vec![]), None, None);
        let value_type = rt.push_type(TypeInfo::class("System.ValueType", vec![]), Some(object), None);
        let string = rt.push_type(TypeInfo::class("System.String", vec![]), Some(object), None);
        let array = rt.push_type(TypeInfo::class("System.Array", vec![]), Some(object), None);
        let exception = rt.push_type(
            TypeInfo::class(
                "System.Exception",
                vec![FlatField {
                    offset: 0,
                    kind: PrimitiveKind::Object,
                }],
            ),
            Some(object),
            None,
        );
        let wrapped_exception = rt.push_type(
            TypeInfo::class(
                "System.Runtime.CompilerServices.RuntimeWrappedException",
                vec![
                    FlatField {
                        offset: 0,
                        kind: PrimitiveKind::Object,
                    },
                    FlatField {
                        offset: 8,
                        kind: PrimitiveKind::Object,
                    },
                ],
            ),
            Some(exception),
            None,
        );
        let runtime_type = rt.push_type(TypeInfo::class("System.RuntimeType", vec![]), Some(object), None);
        rt.core = CoreTypes {
            object,
            value_type,
            string,
            array,
            exception,
            wrapped_exception,
            runtime_type,
        };
        rt
    }

    pub fn core_types(&self) -> CoreTypes {
        self.core
    }

    fn push_type(&self, info: TypeInfo, parent: Option<TypeHandle>, element: Option<TypeHandle>) -> TypeHandle {
        let mut types = self.types.write();
        let handle = TypeHandle(types.len() as u32);
        types.push(TypeEntry {
            info: Arc::new(info),
            parent,
            element,
        });
        handle
    }

    /// Registers a type. Value types derive from `System.ValueType` and
    /// classes from `System.Object` unless `parent` says otherwise.
    pub fn define_type(&self, info: TypeInfo, parent: Option<TypeHandle>) -> TypeHandle {
        let parent = parent.unwrap_or(if info.is_value_type {
            self.core.value_type
        } else {
            self.core.object
        });
        let name = info.name.clone();
        let handle = self.push_type(info, Some(parent), None);
        tracing::trace!(%name, ?handle, "defined type");
        handle
    }

    pub fn type_token(&self, ty: TypeHandle) -> Token {
        let token = TYPE_TABLE | ty.0;
        self.tokens.insert(token, ResolvedToken::Type(ty));
        token
    }

    /// The boxed form of a primitive kind, e.g. `System.Int32`.
    pub fn primitive_type(&self, kind: PrimitiveKind) -> TypeHandle {
        if kind == PrimitiveKind::Object {
            return self.core.object;
        }
        if let Some(h) = self.primitive_types.get(&kind) {
            return *h;
        }
        let name = format!("System.{}", primitive_type_name(kind));
        *self
            .primitive_types
            .entry(kind)
            .or_insert_with(|| self.define_type(TypeInfo::primitive(name, kind), None))
    }

    /// The single-dimensional, zero-based array type of `element`.
    pub fn array_type(&self, element: TypeHandle) -> TypeHandle {
        if let Some(h) = self.array_types.get(&element) {
            return *h;
        }
        *self.array_types.entry(element).or_insert_with(|| {
            let name = format!("{}[]", self.type_name(element));
            self.push_type(TypeInfo::class(name, vec![]), Some(self.core.array), Some(element))
        })
    }

    /// The type the runtime materializes for a core-raised exception.
    pub fn exception_type(&self, kind: ManagedExceptionKind) -> TypeHandle {
        if let Some(h) = self.exception_types.get(&kind) {
            return *h;
        }
        *self.exception_types.entry(kind).or_insert_with(|| {
            let base = self.types.read()[self.core.exception.0 as usize].info.fields.clone();
            self.push_type(
                TypeInfo::class(kind.type_name(), base),
                Some(self.core.exception),
                None,
            )
        })
    }

    pub fn type_name(&self, ty: TypeHandle) -> String {
        self.type_info(ty).name.clone()
    }

    pub fn set_class_constructor(&self, ty: TypeHandle, cctor: MethodHandle) {
        self.class_constructors.insert(ty, cctor);
    }

    pub fn new_method_handle(&self) -> MethodHandle {
        MethodHandle(self.next_method.fetch_add(1, Ordering::Relaxed))
    }

    fn method_token(&self, method: MethodHandle) -> Token {
        let token = METHOD_TABLE | method.0;
        self.tokens.insert(token, ResolvedToken::Method(method));
        token
    }

    fn register_method(
        &self,
        method: MethodHandle,
        owner: TypeHandle,
        name: String,
        signature: Arc<MethodSignature>,
        is_virtual: bool,
        code: Option<MethodCode>,
    ) -> Token {
        tracing::trace!(%name, ?method, "defined method");
        self.methods.insert(
            method,
            MethodEntry {
                call: CallInfo {
                    method,
                    owner,
                    name,
                    signature,
                    is_virtual,
                    generic_context: GenericContext::NONE,
                },
                code,
            },
        );
        self.method_token(method)
    }

    /// Registers an interpreted method under its definition's handle.
    pub fn define_method(&self, def: MethodDefinition) -> Token {
        self.define_method_with(def, false)
    }

    pub fn define_virtual_method(&self, def: MethodDefinition) -> Token {
        self.define_method_with(def, true)
    }

    fn define_method_with(&self, def: MethodDefinition, is_virtual: bool) -> Token {
        let (handle, owner, name, signature) = (def.handle, def.owner, def.name.clone(), def.signature.clone());
        self.register_method(
            handle,
            owner,
            name,
            signature,
            is_virtual,
            Some(MethodCode::Interpreted(Arc::new(def))),
        )
    }

    /// A method with no body; calls to it fail to resolve.
    pub fn define_abstract_method(&self, owner: TypeHandle, name: &str, signature: MethodSignature) -> (MethodHandle, Token) {
        let handle = self.new_method_handle();
        let token = self.register_method(handle, owner, name.to_string(), Arc::new(signature), true, None);
        (handle, token)
    }

    /// A method whose code was built against the runtime's entry convention.
    pub fn define_compiled_method(
        &self,
        owner: TypeHandle,
        name: &str,
        signature: MethodSignature,
        code: Arc<dyn CompiledCode>,
    ) -> (MethodHandle, Token) {
        let handle = self.new_method_handle();
        let token = self.register_method(
            handle,
            owner,
            name.to_string(),
            Arc::new(signature),
            false,
            Some(MethodCode::Compiled(code)),
        );
        (handle, token)
    }

    /// A method implemented by a plain exported function at `address`.
    pub fn define_native_method(
        &self,
        owner: TypeHandle,
        name: &str,
        signature: MethodSignature,
        address: usize,
    ) -> (MethodHandle, Token) {
        let info = |h: TypeHandle| self.type_info(h);
        let mut params = vec![];
        if signature.has_this {
            params.push(ArgClass::of(SigType::Primitive(signature.this_kind), &info));
        }
        params.extend(signature.params.iter().map(|p| ArgClass::of(*p, &info)));
        let ret = (!signature.ret.is_void()).then(|| ArgClass::of(signature.ret, &info));
        let callee = Arc::new(FfiCallee::new(address, params, ret));
        let handle = self.new_method_handle();
        let token = self.register_method(
            handle,
            owner,
            name.to_string(),
            Arc::new(signature),
            false,
            Some(MethodCode::Native(callee)),
        );
        (handle, token)
    }

    /// Native libraries named by [`define_pinvoke_method`](Self::define_pinvoke_method)
    /// are looked up under `root`.
    pub fn with_library_root(mut self, root: impl Into<std::path::PathBuf>) -> Self {
        self.libraries = NativeLibraries::new(root);
        self
    }

    /// A method bound to `entry_point` exported by `library`.
    pub fn define_pinvoke_method(
        &self,
        owner: TypeHandle,
        name: &str,
        signature: MethodSignature,
        library: &str,
        entry_point: &str,
    ) -> Result<(MethodHandle, Token), NativeLibraryError> {
        let address = self.libraries.get_function(library, entry_point)?;
        tracing::debug!(method = name, library, entry_point, "bound native entry point");
        Ok(self.define_native_method(owner, name, signature, address))
    }

    /// `implementation` replaces `base` for receivers of type `ty` and its
    /// subtypes.
    pub fn override_method(&self, ty: TypeHandle, base: MethodHandle, implementation: MethodHandle) {
        self.overrides.insert((ty, base), implementation);
    }

    /// Sets the instantiation argument callers pass to `method`.
    pub fn set_generic_context(&self, method: MethodHandle, context: GenericContext) {
        if let Some(mut entry) = self.methods.get_mut(&method) {
            entry.call.generic_context = context;
        }
    }

    /// A member reference naming a vararg call site of `method`.
    pub fn vararg_site(&self, method: MethodHandle, site: MethodSignature) -> Token {
        let token = MEMBER_REF_TABLE | self.next_member_ref.fetch_add(1, Ordering::Relaxed);
        self.tokens.insert(
            token,
            ResolvedToken::VarArgMethod {
                method,
                site: Arc::new(site),
            },
        );
        token
    }

    pub fn define_signature(&self, signature: MethodSignature) -> Token {
        let token = SIGNATURE_TABLE | self.next_signature.fetch_add(1, Ordering::Relaxed);
        self.tokens.insert(token, ResolvedToken::Signature(Arc::new(signature)));
        token
    }

    fn field_token(&self, info: FieldInfo) -> Token {
        let token = FIELD_TABLE | info.handle.0;
        self.tokens.insert(token, ResolvedToken::Field(info.handle));
        self.fields.insert(info.handle, info);
        token
    }

    pub fn define_field(&self, owner: TypeHandle, ty: SigType, offset: usize) -> Token {
        let handle = FieldHandle(self.next_field.fetch_add(1, Ordering::Relaxed));
        self.field_token(FieldInfo {
            handle,
            owner,
            ty,
            offset,
            static_address: None,
        })
    }

    /// A static field with zeroed storage of its own.
    pub fn define_static_field(&self, owner: TypeHandle, ty: SigType) -> Token {
        let size = ty.descriptor(|h| self.type_info(h)).size();
        let storage = self.leak(align_up(size.max(1), SLOT_SIZE) / SLOT_SIZE);
        let handle = FieldHandle(self.next_field.fetch_add(1, Ordering::Relaxed));
        self.field_token(FieldInfo {
            handle,
            owner,
            ty,
            offset: 0,
            static_address: Some(storage as usize),
        })
    }

    /// Address of a static field's storage.
    pub fn static_address(&self, token: Token) -> Option<*mut u8> {
        let ResolvedToken::Field(handle) = self.tokens.get(&token)?.clone() else {
            return None;
        };
        self.fields.get(&handle)?.static_address.map(|a| a as *mut u8)
    }

    /// Interns a string literal and returns its user-string token.
    pub fn define_string(&self, value: &str) -> Token {
        let object = self.new_string(value);
        let token = STRING_TABLE | self.next_string.fetch_add(1, Ordering::Relaxed);
        self.tokens.insert(token, ResolvedToken::String(object));
        token
    }

    pub fn new_string(&self, value: &str) -> ObjectRef {
        let units: Vec<u16> = value.encode_utf16().collect();
        let obj = self.allocate_raw(self.core.string, units.len(), units.len() * 2);
        let data = self.field_data(obj).cast::<u16>();
        for (i, unit) in units.iter().enumerate() {
            // SAFETY: the allocation holds `units.len()` UTF-16 code units.
            unsafe { data.add(i).write_unaligned(*unit) };
        }
        obj
    }

    pub fn string_value(&self, obj: ObjectRef) -> Option<String> {
        if obj.is_null() || self.object_type(obj) != self.core.string {
            return None;
        }
        let len = self.header(obj, 1) as usize;
        let data = self.field_data(obj).cast::<u16>();
        // SAFETY: string objects hold `len` code units after the header.
        let units: Vec<u16> = (0..len).map(|i| unsafe { data.add(i).read_unaligned() }).collect();
        Some(String::from_utf16_lossy(&units))
    }

    /// Wraps a non-exception object the way a foreign throw arrives.
    pub fn wrap_foreign_exception(&self, thrown: ObjectRef) -> ObjectRef {
        let wrapper = self.allocate_raw(self.core.wrapped_exception, 0, 2 * SLOT_SIZE);
        // SAFETY: the wrapper's second field is a reference slot.
        unsafe { self.field_data(wrapper).add(SLOT_SIZE).cast::<usize>().write(thrown.0) };
        wrapper
    }

    /// Raises `exception` at the next interrupt observation point.
    pub fn interrupt(&self, exception: ObjectRef) {
        *self.interrupt.lock() = Some(exception);
    }

    /// Walks the current thread's interpreted frames at every allocation
    /// and records what they report.
    pub fn set_gc_stress(&self, enabled: bool) {
        self.gc_stress.store(enabled, Ordering::Relaxed);
    }

    pub fn recorded_roots(&self) -> Vec<RecordedRoot> {
        self.roots.lock().clone()
    }

    pub fn take_recorded_roots(&self) -> Vec<RecordedRoot> {
        std::mem::take(&mut *self.roots.lock())
    }

    /// Simulated collections performed under GC stress.
    pub fn collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    pub fn heap_bytes(&self) -> usize {
        self.heap_bytes.load(Ordering::Relaxed)
    }

    /// Current owner's recursion count on `obj`'s monitor.
    pub fn monitor_depth(&self, obj: ObjectRef) -> u32 {
        self.monitors.owners.lock().get(&obj.0).map_or(0, |(_, n)| *n)
    }

    fn leak(&self, words: usize) -> *mut u8 {
        let mut block = vec![0u64; words].into_boxed_slice();
        let ptr = block.as_mut_ptr().cast();
        self.heap_bytes.fetch_add(words * SLOT_SIZE, Ordering::Relaxed);
        self.heap.lock().push(block);
        ptr
    }

    fn allocate_raw(&self, ty: TypeHandle, length: usize, data_bytes: usize) -> ObjectRef {
        let words = (HEADER_SIZE + align_up(data_bytes, SLOT_SIZE)) / SLOT_SIZE;
        let base = self.leak(words).cast::<u64>();
        // SAFETY: the block holds at least the two header words.
        unsafe {
            base.write(ty.0 as u64);
            base.add(1).write(length as u64);
        }
        ObjectRef(base as usize)
    }

    fn header(&self, obj: ObjectRef, word: usize) -> u64 {
        // SAFETY: every object starts with two header words.
        unsafe { obj.as_ptr().cast::<u64>().add(word).read() }
    }

    fn stress(&self) {
        if !self.gc_stress.load(Ordering::Relaxed) || !gc::collection_allowed() {
            return;
        }
        self.collections.fetch_add(1, Ordering::Relaxed);
        let mut recorded = vec![];
        let mut record = |slot: *mut usize, interior: bool, pinned: bool| {
            // SAFETY: reported slots are live reference slots.
            let value = unsafe { slot.read_unaligned() };
            recorded.push(RecordedRoot {
                slot: slot as usize,
                value,
                interior,
                pinned,
            });
        };
        gc::scan_current_thread(self, &mut record as &mut dyn RootVisitor);
        self.roots.lock().extend(recorded);
    }

    fn init_cell(&self, ty: TypeHandle) -> Arc<InitCell> {
        self.init_cells
            .entry(ty)
            .or_insert_with(|| {
                Arc::new(InitCell {
                    state: Mutex::new(InitState::Uninitialized),
                    done: Condvar::new(),
                })
            })
            .clone()
    }

    fn entry<R>(&self, ty: TypeHandle, f: impl FnOnce(&TypeEntry) -> R) -> Option<R> {
        self.types.read().get(ty.0 as usize).map(f)
    }
}

fn primitive_type_name(kind: PrimitiveKind) -> &'static str {
    use PrimitiveKind::*;
    match kind {
        Void => "Void",
        Bool => "Boolean",
        Char => "Char",
        I1 => "SByte",
        U1 => "Byte",
        I2 => "Int16",
        U2 => "UInt16",
        I4 => "Int32",
        U4 => "UInt32",
        I8 => "Int64",
        U8 => "UInt64",
        NativeInt => "IntPtr",
        NativeUInt => "UIntPtr",
        R4 => "Single",
        R8 => "Double",
        Object => "Object",
        ByRef => "TypedReference",
        Ptr => "Void*",
    }
}

fn kind_matches(resolved: &ResolvedToken, kind: TokenKind) -> bool {
    matches!(
        (resolved, kind),
        (ResolvedToken::Type(_), TokenKind::Type)
            | (ResolvedToken::Method(_) | ResolvedToken::VarArgMethod { .. }, TokenKind::Method)
            | (ResolvedToken::Field(_), TokenKind::Field)
            | (ResolvedToken::String(_), TokenKind::String)
            | (ResolvedToken::Signature(_), TokenKind::Signature)
    )
}

impl MetadataResolver for StandaloneRuntime {
    fn resolve_token(&self, _scope: &TokenScope, token: Token, kind: TokenKind) -> Result<ResolvedToken, ResolutionError> {
        match self.tokens.get(&token) {
            Some(resolved) if kind_matches(&resolved, kind) => Ok(resolved.clone()),
            _ => Err(ResolutionError::Token {
                token,
                kind: kind.as_str(),
            }),
        }
    }

    fn type_info(&self, ty: TypeHandle) -> Arc<TypeInfo> {
        match self.entry(ty, |e| e.info.clone()) {
            Some(info) => info,
            None => {
                tracing::warn!(?ty, "unknown type handle");
                Arc::new(TypeInfo::class("<unknown>", vec![]))
            }
        }
    }

    fn field_info(&self, field: FieldHandle, _context: GenericContext) -> Result<FieldInfo, ResolutionError> {
        self.fields
            .get(&field)
            .map(|f| f.clone())
            .ok_or_else(|| ResolutionError::Host(format!("unknown field {:?}", field)))
    }

    fn call_info(&self, method: MethodHandle, _context: GenericContext) -> Result<CallInfo, ResolutionError> {
        self.methods
            .get(&method)
            .map(|m| m.call.clone())
            .ok_or_else(|| ResolutionError::Host(format!("unknown method {:?}", method)))
    }

    fn method_code(&self, method: MethodHandle) -> Option<MethodCode> {
        self.methods.get(&method)?.code.clone()
    }

    fn resolve_virtual(&self, method: MethodHandle, receiver: TypeHandle) -> Result<MethodHandle, ResolutionError> {
        let mut current = Some(receiver);
        while let Some(ty) = current {
            if let Some(implementation) = self.overrides.get(&(ty, method)) {
                return Ok(*implementation);
            }
            current = self.entry(ty, |e| e.parent).flatten();
        }
        Ok(method)
    }

    fn is_assignable(&self, from: TypeHandle, to: TypeHandle) -> bool {
        if from == to || to == self.core.object {
            return true;
        }
        let (from_element, to_element) = (self.entry(from, |e| e.element).flatten(), self.entry(to, |e| e.element).flatten());
        if let (Some(f), Some(t)) = (from_element, to_element) {
            // Reference element types are covariant.
            return !self.type_info(f).is_value_type && !self.type_info(t).is_value_type && self.is_assignable(f, t);
        }
        let mut current = self.entry(from, |e| e.parent).flatten();
        while let Some(ty) = current {
            if ty == to {
                return true;
            }
            current = self.entry(ty, |e| e.parent).flatten();
        }
        false
    }

    fn ensure_class_initialized(&self, ty: TypeHandle, interp: &Interpreter) -> ExecResult<()> {
        let Some(cctor) = self.class_constructors.get(&ty).map(|c| *c) else {
            return Ok(());
        };
        let cell = self.init_cell(ty);
        let me = thread::current().id();
        {
            let mut state = cell.state.lock();
            loop {
                match *state {
                    InitState::Done => return Ok(()),
                    InitState::Failed => return Err(interp.exception(ManagedExceptionKind::TypeLoad)),
                    // The initializer itself touches its own statics.
                    InitState::Running(owner) if owner == me => return Ok(()),
                    InitState::Running(_) => cell.done.wait(&mut state),
                    InitState::Uninitialized => {
                        *state = InitState::Running(me);
                        break;
                    }
                }
            }
        }
        tracing::debug!(ty = %self.type_name(ty), "running class constructor");
        let result = interp.invoke(cctor, &[]);
        let mut state = cell.state.lock();
        *state = if result.is_ok() {
            InitState::Done
        } else {
            InitState::Failed
        };
        cell.done.notify_all();
        match result {
            Ok(_) => Ok(()),
            Err(Unwind::Exception(_)) => Err(interp.exception(ManagedExceptionKind::TypeLoad)),
            Err(fatal) => Err(fatal),
        }
    }
}

impl ObjectModel for StandaloneRuntime {
    fn allocate_object(&self, ty: TypeHandle) -> ExecResult<ObjectRef> {
        self.stress();
        let size = self.type_info(ty).size;
        Ok(self.allocate_raw(ty, 0, size))
    }

    fn allocate_array(&self, element: TypeHandle, length: usize) -> ExecResult<ObjectRef> {
        self.stress();
        let info = self.type_info(element);
        let stride = if info.is_value_type { info.size } else { SLOT_SIZE };
        let array = self.array_type(element);
        Ok(self.allocate_raw(array, length, stride * length))
    }

    fn object_type(&self, obj: ObjectRef) -> TypeHandle {
        TypeHandle(self.header(obj, 0) as u32)
    }

    fn field_data(&self, obj: ObjectRef) -> *mut u8 {
        obj.as_ptr().wrapping_add(HEADER_SIZE)
    }

    fn array_length(&self, array: ObjectRef) -> usize {
        self.header(array, 1) as usize
    }

    fn array_element_type(&self, array: ObjectRef) -> TypeHandle {
        self.entry(self.object_type(array), |e| e.element)
            .flatten()
            .unwrap_or(self.core.object)
    }

    fn array_data(&self, array: ObjectRef) -> *mut u8 {
        self.field_data(array)
    }

    fn new_exception(&self, kind: ManagedExceptionKind) -> ObjectRef {
        let ty = self.exception_type(kind);
        let message = self.new_string(kind.type_name());
        let size = self.type_info(ty).size;
        let exception = self.allocate_raw(ty, 0, size);
        // SAFETY: exception types start with a message reference.
        unsafe { self.field_data(exception).cast::<usize>().write(message.0) };
        exception
    }

    fn unwrap_exception(&self, exception: ObjectRef) -> Option<ObjectRef> {
        if self.object_type(exception) != self.core.wrapped_exception {
            return None;
        }
        // SAFETY: wrappers hold the thrown object in their second field.
        Some(ObjectRef(unsafe { self.field_data(exception).add(SLOT_SIZE).cast::<usize>().read() }))
    }

    fn monitor_enter(&self, obj: ObjectRef) {
        let me = thread::current().id();
        let mut owners = self.monitors.owners.lock();
        loop {
            match owners.get_mut(&obj.0) {
                None => {
                    owners.insert(obj.0, (me, 1));
                    return;
                }
                Some((owner, count)) if *owner == me => {
                    *count += 1;
                    return;
                }
                Some(_) => self.monitors.released.wait(&mut owners),
            }
        }
    }

    fn monitor_exit(&self, obj: ObjectRef) {
        let me = thread::current().id();
        let mut owners = self.monitors.owners.lock();
        match owners.get_mut(&obj.0) {
            Some((owner, count)) if *owner == me => {
                *count -= 1;
                if *count == 0 {
                    owners.remove(&obj.0);
                    self.monitors.released.notify_all();
                }
            }
            _ => tracing::warn!(?obj, "monitor exit by a thread that does not own it"),
        }
    }

    fn type_object(&self, ty: TypeHandle) -> ObjectRef {
        if let Some(obj) = self.type_objects.get(&ty) {
            return *obj;
        }
        *self
            .type_objects
            .entry(ty)
            .or_insert_with(|| self.allocate_raw(self.core.runtime_type, 0, 0))
    }

    fn take_interrupt(&self) -> Option<ObjectRef> {
        self.interrupt.lock().take()
    }
}
