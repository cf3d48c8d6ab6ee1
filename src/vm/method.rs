use crate::{
    callconv::{ArgLayout, ArgRole, CallingConvention, NativeSignature, TargetConvention},
    types::{MethodSignature, SigType, TypeHandle, TypeInfo, ValueTypeDescriptor, SLOT_SIZE},
    utils::align_up,
    vm::{
        cache::{GenericCache, IlOffsetCache},
        error::UnimplementedError,
        exceptions::ExceptionClause,
        opcodes::{self, Opcode, Token},
        tiering::TieringTrigger,
    },
};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Debug, Formatter},
    sync::{Arc, OnceLock},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodHandle(pub u32);

impl Debug for MethodHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "method#{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldHandle(pub u32);

impl Debug for FieldHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "field#{}", self.0)
    }
}

/// Exact instantiation a shared generic body runs under; `NONE` for
/// non-generic code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenericContext(pub usize);

impl GenericContext {
    pub const NONE: Self = GenericContext(0);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// Where a shared generic method finds its exact instantiation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GenericSource {
    #[default]
    None,
    /// The hidden instantiation argument.
    HiddenArg,
    /// The runtime type of the receiver.
    ThisType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalVar {
    pub ty: SigType,
    pub pinned: bool,
}

impl LocalVar {
    pub fn new(ty: SigType) -> Self {
        Self { ty, pinned: false }
    }

    pub fn pinned(ty: SigType) -> Self {
        Self { ty, pinned: true }
    }
}

/// A method body as the host hands it over.
#[derive(Clone, Debug)]
pub struct MethodDefinition {
    pub handle: MethodHandle,
    pub name: String,
    pub owner: TypeHandle,
    pub signature: Arc<MethodSignature>,
    pub code: Vec<u8>,
    pub max_stack: u16,
    pub locals: Vec<LocalVar>,
    pub init_locals: bool,
    pub clauses: Vec<ExceptionClause>,
    pub synchronized: bool,
    pub generic_source: GenericSource,
}

impl MethodDefinition {
    pub fn new(handle: MethodHandle, name: impl Into<String>, signature: MethodSignature) -> Self {
        Self {
            handle,
            name: name.into(),
            owner: TypeHandle(0),
            signature: Arc::new(signature),
            code: vec![],
            max_stack: 8,
            locals: vec![],
            init_locals: true,
            clauses: vec![],
            synchronized: false,
            generic_source: GenericSource::None,
        }
    }

    pub fn with_body(mut self, code: Vec<u8>, clauses: Vec<ExceptionClause>) -> Self {
        self.code = code;
        self.clauses = clauses;
        self
    }

    pub fn with_locals(mut self, locals: Vec<LocalVar>) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_max_stack(mut self, max_stack: u16) -> Self {
        self.max_stack = max_stack;
        self
    }

    pub fn with_owner(mut self, owner: TypeHandle) -> Self {
        self.owner = owner;
        self
    }

    pub fn synchronized(mut self) -> Self {
        self.synchronized = true;
        self
    }

    pub fn with_generic_source(mut self, source: GenericSource) -> Self {
        self.generic_source = source;
        self
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodFlags(u16);

impl MethodFlags {
    pub const HAS_THIS: Self = Self(1 << 0);
    pub const HAS_RET_BUF: Self = Self(1 << 1);
    pub const IS_VARARG: Self = Self(1 << 2);
    pub const HAS_GENERIC_CONTEXT: Self = Self(1 << 3);
    pub const SYNCHRONIZED: Self = Self(1 << 4);
    pub const MAY_HAVE_LOOP: Self = Self(1 << 5);
    pub const INIT_LOCALS: Self = Self(1 << 6);
    pub const HAS_CLAUSES: Self = Self(1 << 7);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    fn set(&mut self, other: Self, on: bool) {
        if on {
            self.insert(other);
        }
    }
}

impl Debug for MethodFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(MethodFlags, &str); 8] = [
            (MethodFlags::HAS_THIS, "this"),
            (MethodFlags::HAS_RET_BUF, "retbuf"),
            (MethodFlags::IS_VARARG, "vararg"),
            (MethodFlags::HAS_GENERIC_CONTEXT, "generic-context"),
            (MethodFlags::SYNCHRONIZED, "synchronized"),
            (MethodFlags::MAY_HAVE_LOOP, "loop"),
            (MethodFlags::INIT_LOCALS, "init-locals"),
            (MethodFlags::HAS_CLAUSES, "clauses"),
        ];
        let set: Vec<_> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "[{}]", set.join(" "))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArgDescriptor {
    pub role: ArgRole,
    pub ty: ValueTypeDescriptor,
    /// Offset in the block an entry stub builds.
    pub native_offset: usize,
    /// The native block holds a pointer to the value rather than the value.
    pub native_by_ref: bool,
    /// Offset in the block an interpreted caller builds.
    pub direct_offset: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalDescriptor {
    pub ty: ValueTypeDescriptor,
    pub pinned: bool,
    /// Byte offset of the value in the locals' overflow region.
    pub overflow_offset: Option<usize>,
}

/// The `ldfld` of a plain getter body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GetterField {
    pub offset: u32,
    pub token: Token,
}

/// Per-method facts computed once, shared by every invocation.
pub struct MethodDescriptor {
    pub definition: Arc<MethodDefinition>,
    pub layout: ArgLayout,
    /// Canonical order; matches `layout.args`.
    pub args: Vec<ArgDescriptor>,
    /// IL argument index to canonical index.
    pub il_args: Vec<usize>,
    pub locals: Vec<LocalDescriptor>,
    pub local_overflow_size: usize,
    pub ret: ValueTypeDescriptor,
    pub flags: MethodFlags,
    pub direct_block_size: usize,
    /// Set when the body is a plain instance-field getter.
    pub getter_field: Option<GetterField>,
    pub tiering: TieringTrigger,
    cache: OnceLock<Arc<IlOffsetCache>>,
    generic_caches: OnceLock<GenericCache>,
}

impl Debug for MethodDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.definition.name)
            .field("flags", &self.flags)
            .field("args", &self.args.len())
            .field("locals", &self.locals.len())
            .finish()
    }
}

impl MethodDescriptor {
    pub fn new(
        definition: Arc<MethodDefinition>,
        convention: TargetConvention,
        type_info: &dyn Fn(TypeHandle) -> Arc<TypeInfo>,
    ) -> Result<Self, UnimplementedError> {
        let sig = &definition.signature;
        let native = NativeSignature::from_method(sig, type_info);
        let layout = convention.classify_args(&native)?;

        let descriptor_of = |ty: SigType| ty.descriptor(type_info);
        let ret = descriptor_of(sig.ret);

        let args: Vec<_> = layout
            .args
            .iter()
            .enumerate()
            .map(|(i, placement)| {
                let ty = match placement.role {
                    ArgRole::This => ValueTypeDescriptor::Primitive(sig.this_kind),
                    ArgRole::RetBuf => ValueTypeDescriptor::BYREF,
                    ArgRole::VarArgCookie | ArgRole::GenericContext => {
                        ValueTypeDescriptor::NATIVE_INT
                    }
                    ArgRole::Param(p) => descriptor_of(sig.params[p as usize]),
                };
                ArgDescriptor {
                    role: placement.role,
                    ty,
                    native_offset: placement.offset,
                    native_by_ref: placement.by_reference,
                    direct_offset: i * SLOT_SIZE,
                }
            })
            .collect();

        let il_args = (0..sig.il_arg_count())
            .map(|il| {
                let role = if sig.has_this {
                    if il == 0 {
                        ArgRole::This
                    } else {
                        ArgRole::Param(il as u16 - 1)
                    }
                } else {
                    ArgRole::Param(il as u16)
                };
                args.iter().position(|a| a.role == role).unwrap_or_default()
            })
            .collect();

        let mut local_overflow_size = 0;
        let locals = definition
            .locals
            .iter()
            .map(|local| {
                let ty = descriptor_of(local.ty);
                let overflow_offset = ty.is_overflow().then(|| {
                    let offset = local_overflow_size;
                    local_overflow_size += ty.overflow_size();
                    offset
                });
                LocalDescriptor {
                    ty,
                    pinned: local.pinned,
                    overflow_offset,
                }
            })
            .collect();

        let mut flags = MethodFlags::default();
        flags.set(MethodFlags::HAS_THIS, sig.has_this);
        flags.set(MethodFlags::HAS_RET_BUF, layout.has_ret_buf());
        flags.set(MethodFlags::IS_VARARG, sig.is_vararg());
        flags.set(MethodFlags::HAS_GENERIC_CONTEXT, sig.generic_context);
        flags.set(MethodFlags::SYNCHRONIZED, definition.synchronized);
        flags.set(MethodFlags::MAY_HAVE_LOOP, opcodes::may_have_loop(&definition.code));
        flags.set(MethodFlags::INIT_LOCALS, definition.init_locals);
        flags.set(MethodFlags::HAS_CLAUSES, !definition.clauses.is_empty());

        let getter_field = detect_simple_getter(&definition);
        let direct_block_size = args.len() * SLOT_SIZE;

        tracing::debug!(
            method = %definition.name,
            target = layout.target,
            ?flags,
            args = args.len(),
            locals = definition.locals.len(),
            getter = getter_field.is_some(),
            "created method descriptor"
        );

        Ok(Self {
            definition,
            layout,
            args,
            il_args,
            locals,
            local_overflow_size: align_up(local_overflow_size, SLOT_SIZE),
            ret,
            flags,
            direct_block_size,
            getter_field,
            tiering: TieringTrigger::default(),
            cache: OnceLock::new(),
            generic_caches: OnceLock::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn handle(&self) -> MethodHandle {
        self.definition.handle
    }

    pub fn code(&self) -> &[u8] {
        &self.definition.code
    }

    pub fn has(&self, flag: MethodFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn arg(&self, role: ArgRole) -> Option<&ArgDescriptor> {
        self.args.iter().find(|a| a.role == role)
    }

    /// Call-site cache for one instantiation of this method's body.
    pub fn call_site_cache(&self, context: GenericContext) -> Arc<IlOffsetCache> {
        if context.is_none() {
            self.cache.get_or_init(Default::default).clone()
        } else {
            self.generic_caches
                .get_or_init(GenericCache::default)
                .get_or_create(context)
        }
    }
}

/// Recognizes `ldarg.0; ldfld F; ret`, optionally in the debug-build shape
/// `nop; ldarg.0; ldfld F; stloc.0; br next; next: ldloc.0; ret`.
fn detect_simple_getter(def: &MethodDefinition) -> Option<GetterField> {
    if !def.signature.has_this
        || def.signature.this_kind != crate::types::PrimitiveKind::Object
        || !def.signature.params.is_empty()
        || def.synchronized
        || !def.clauses.is_empty()
    {
        return None;
    }
    let mut ops = vec![];
    let mut offset = 0;
    while offset < def.code.len() {
        let (op, next) = opcodes::decode(&def.code, offset).ok()?;
        ops.push((offset, op));
        offset = next;
    }
    let ops: Vec<_> = ops
        .into_iter()
        .filter(|(_, op)| !matches!(op, Opcode::Nop))
        .collect();
    let (offset, token) = match ops.as_slice() {
        [(_, Opcode::LdArg(0)), (ld, Opcode::LdFld(token)), (_, Opcode::Ret)] => (*ld, *token),
        [(_, Opcode::LdArg(0)), (ld, Opcode::LdFld(token)), (_, Opcode::StLoc(0)), (_, Opcode::Branch(_, target)), (at, Opcode::LdLoc(0)), (_, Opcode::Ret)]
            if *target as usize == *at =>
        {
            (*ld, *token)
        }
        _ => return None,
    };
    Some(GetterField {
        offset: offset as u32,
        token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        callconv::{Amd64SysV, Arm64},
        types::{FlatField, PrimitiveKind},
        vm::emit::ILBuilder,
    };

    fn info(h: TypeHandle) -> Arc<TypeInfo> {
        Arc::new(match h.0 {
            1 => TypeInfo::value_type(
                "Big",
                (0..3)
                    .map(|i| FlatField {
                        offset: i * 8,
                        kind: PrimitiveKind::I8,
                    })
                    .collect(),
            ),
            _ => TypeInfo::class("Object", vec![]),
        })
    }

    #[test]
    fn offsets_follow_the_canonical_order() {
        let sig = MethodSignature::instance_method(
            vec![SigType::Primitive(PrimitiveKind::I4), SigType::Struct(TypeHandle(1))],
            SigType::Struct(TypeHandle(1)),
        );
        let def = Arc::new(MethodDefinition::new(MethodHandle(1), "M", sig).with_locals(vec![
            LocalVar::new(SigType::Primitive(PrimitiveKind::I4)),
            LocalVar::new(SigType::Struct(TypeHandle(1))),
            LocalVar::new(SigType::Struct(TypeHandle(1))),
        ]));
        let desc = MethodDescriptor::new(def.clone(), Amd64SysV.into(), &info).unwrap();
        assert!(desc.has(MethodFlags::HAS_RET_BUF));
        let roles: Vec<_> = desc.args.iter().map(|a| a.role).collect();
        assert_eq!(
            roles,
            vec![ArgRole::This, ArgRole::RetBuf, ArgRole::Param(0), ArgRole::Param(1)]
        );
        assert_eq!(desc.args[3].direct_offset, 24);
        assert_eq!(desc.il_args, vec![0, 2, 3]);
        assert_eq!(desc.locals[1].overflow_offset, Some(0));
        assert_eq!(desc.locals[2].overflow_offset, Some(24));
        assert_eq!(desc.local_overflow_size, 48);

        let arm = MethodDescriptor::new(def, Arm64.into(), &info).unwrap();
        assert!(arm.args[3].native_by_ref);
    }

    #[test]
    fn detects_plain_getters() {
        let sig = MethodSignature::instance_method(vec![], SigType::Primitive(PrimitiveKind::I4));
        let mut il = ILBuilder::new();
        il.emit(Opcode::LdArg(0)).emit(Opcode::LdFld(0x0400_0001)).emit(Opcode::Ret);
        let (code, clauses) = il.finish();
        let def = Arc::new(MethodDefinition::new(MethodHandle(2), "get_X", sig).with_body(code, clauses));
        let desc = MethodDescriptor::new(def, Amd64SysV.into(), &info).unwrap();
        assert_eq!(
            desc.getter_field,
            Some(GetterField {
                offset: 1,
                token: 0x0400_0001
            })
        );
    }

    #[test]
    fn generic_instantiations_get_separate_caches() {
        let sig = MethodSignature::static_method(vec![], SigType::VOID);
        let def = Arc::new(MethodDefinition::new(MethodHandle(3), "G", sig));
        let desc = MethodDescriptor::new(def, Amd64SysV.into(), &info).unwrap();
        let a = desc.call_site_cache(GenericContext(0x10));
        let b = desc.call_site_cache(GenericContext(0x20));
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &desc.call_site_cache(GenericContext(0x10))));
        assert!(Arc::ptr_eq(
            &desc.call_site_cache(GenericContext::NONE),
            &desc.call_site_cache(GenericContext::NONE)
        ));
    }
}
