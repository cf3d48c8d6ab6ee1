use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};

pub mod rules;
pub mod signature;

pub use signature::{CallConv, MethodSignature, SigType};

/// Width of every operand-stack and local slot.
pub const SLOT_SIZE: usize = 8;

/// Opaque handle to a type owned by the host's type system.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeHandle(pub u32);

impl Debug for TypeHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimitiveKind {
    Void,
    Bool,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    NativeInt,
    NativeUInt,
    R4,
    R8,
    /// Object reference, including strings, arrays and boxed values.
    Object,
    /// Managed (GC-tracked, possibly interior) pointer.
    ByRef,
    /// Unmanaged pointer; normalizes to `NativeInt` on the stack.
    Ptr,
}

impl PrimitiveKind {
    pub const fn size(self) -> usize {
        use PrimitiveKind::*;
        match self {
            Void => 0,
            Bool | I1 | U1 => 1,
            Char | I2 | U2 => 2,
            I4 | U4 | R4 => 4,
            I8 | U8 | R8 => 8,
            NativeInt | NativeUInt | Object | ByRef | Ptr => SLOT_SIZE,
        }
    }

    /// The kind this value takes once pushed on the evaluation stack.
    pub const fn stack_normal(self) -> PrimitiveKind {
        use PrimitiveKind::*;
        match self {
            Bool | Char | I1 | U1 | I2 | U2 | I4 | U4 => I4,
            I8 | U8 => I8,
            NativeInt | NativeUInt | Ptr => NativeInt,
            other => other,
        }
    }

    pub const fn is_stack_normal(self) -> bool {
        matches!(
            self,
            PrimitiveKind::I4
                | PrimitiveKind::I8
                | PrimitiveKind::NativeInt
                | PrimitiveKind::R4
                | PrimitiveKind::R8
                | PrimitiveKind::Object
                | PrimitiveKind::ByRef
        )
    }

    pub const fn is_float(self) -> bool {
        matches!(self, PrimitiveKind::R4 | PrimitiveKind::R8)
    }

    pub const fn is_integer(self) -> bool {
        use PrimitiveKind::*;
        matches!(
            self,
            Bool | Char | I1 | U1 | I2 | U2 | I4 | U4 | I8 | U8 | NativeInt | NativeUInt | Ptr
        )
    }

    pub const fn is_gc_ref(self) -> bool {
        matches!(self, PrimitiveKind::Object | PrimitiveKind::ByRef)
    }

    /// Whether loading a value of this kind from memory sign-extends it.
    pub const fn is_signed(self) -> bool {
        use PrimitiveKind::*;
        matches!(self, I1 | I2 | I4 | I8 | NativeInt)
    }

    pub fn short_name(self) -> &'static str {
        use PrimitiveKind::*;
        match self {
            Void => "void",
            Bool => "bool",
            Char => "char",
            I1 => "i1",
            U1 => "u1",
            I2 => "i2",
            U2 => "u2",
            I4 => "i4",
            U4 => "u4",
            I8 => "i8",
            U8 => "u8",
            NativeInt => "i",
            NativeUInt => "u",
            R4 => "r4",
            R8 => "r8",
            Object => "obj",
            ByRef => "byref",
            Ptr => "ptr",
        }
    }

    pub fn from_short_name(name: &str) -> Option<Self> {
        use PrimitiveKind::*;
        Some(match name {
            "void" => Void,
            "bool" => Bool,
            "char" => Char,
            "i1" => I1,
            "u1" => U1,
            "i2" => I2,
            "u2" => U2,
            "i4" => I4,
            "u4" => U4,
            "i8" => I8,
            "u8" => U8,
            "i" => NativeInt,
            "u" => NativeUInt,
            "r4" => R4,
            "r8" => R8,
            "obj" => Object,
            "byref" => ByRef,
            "ptr" => Ptr,
            _ => return None,
        })
    }
}

impl Display for PrimitiveKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Type tag carried by every operand-stack entry, argument and local.
///
/// Structs up to one slot wide travel inline in the slot; anything larger
/// lives out of line and the slot holds its address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueTypeDescriptor {
    Primitive(PrimitiveKind),
    InlineStruct { handle: TypeHandle, size: u32 },
    OverflowStruct { handle: TypeHandle, size: u32 },
}

impl ValueTypeDescriptor {
    pub const I4: Self = Self::Primitive(PrimitiveKind::I4);
    pub const I8: Self = Self::Primitive(PrimitiveKind::I8);
    pub const NATIVE_INT: Self = Self::Primitive(PrimitiveKind::NativeInt);
    pub const R4: Self = Self::Primitive(PrimitiveKind::R4);
    pub const R8: Self = Self::Primitive(PrimitiveKind::R8);
    pub const OBJECT: Self = Self::Primitive(PrimitiveKind::Object);
    pub const BYREF: Self = Self::Primitive(PrimitiveKind::ByRef);
    pub const VOID: Self = Self::Primitive(PrimitiveKind::Void);

    pub fn for_struct(handle: TypeHandle, size: usize) -> Self {
        if size <= SLOT_SIZE {
            Self::InlineStruct {
                handle,
                size: size as u32,
            }
        } else {
            Self::OverflowStruct {
                handle,
                size: size as u32,
            }
        }
    }

    /// Descriptor for a value of the given type as stored in memory.
    pub fn of_type(handle: TypeHandle, info: &TypeInfo) -> Self {
        match info.primitive {
            Some(p) => Self::Primitive(p),
            None if info.is_value_type => Self::for_struct(handle, info.size),
            None => Self::OBJECT,
        }
    }

    /// Byte size of the value itself (not of the stack slot).
    pub fn size(self) -> usize {
        match self {
            Self::Primitive(p) => p.size(),
            Self::InlineStruct { size, .. } | Self::OverflowStruct { size, .. } => size as usize,
        }
    }

    pub fn normalize(self) -> Self {
        match self {
            Self::Primitive(p) => Self::Primitive(p.stack_normal()),
            s => s,
        }
    }

    pub fn is_stack_normal(self) -> bool {
        match self {
            Self::Primitive(p) => p.is_stack_normal(),
            _ => true,
        }
    }

    pub fn is_overflow(self) -> bool {
        matches!(self, Self::OverflowStruct { .. })
    }

    pub fn is_struct(self) -> bool {
        !matches!(self, Self::Primitive(_))
    }

    pub fn primitive(self) -> Option<PrimitiveKind> {
        match self {
            Self::Primitive(p) => Some(p),
            _ => None,
        }
    }

    pub fn struct_handle(self) -> Option<TypeHandle> {
        match self {
            Self::InlineStruct { handle, .. } | Self::OverflowStruct { handle, .. } => {
                Some(handle)
            }
            Self::Primitive(_) => None,
        }
    }

    /// Bytes of overflow storage a value of this type needs.
    pub fn overflow_size(self) -> usize {
        match self {
            Self::OverflowStruct { size, .. } => crate::utils::align_up(size as usize, SLOT_SIZE),
            _ => 0,
        }
    }
}

impl Debug for ValueTypeDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primitive(p) => write!(f, "{}", p),
            Self::InlineStruct { handle, size } => write!(f, "struct({:?}, {})", handle, size),
            Self::OverflowStruct { handle, size } => {
                write!(f, "large-struct({:?}, {})", handle, size)
            }
        }
    }
}

/// A primitive field in the flattened layout of a value type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatField {
    pub offset: u32,
    pub kind: PrimitiveKind,
}

/// Layout facts about a type, as computed by the host's type system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub name: String,
    pub is_value_type: bool,
    /// Instance size for value types, field-data size for reference types.
    pub size: usize,
    pub alignment: usize,
    /// Set for primitive value classes and enums (their underlying kind).
    pub primitive: Option<PrimitiveKind>,
    /// Primitive leaves of the instance layout, nested structs flattened.
    pub fields: Vec<FlatField>,
}

impl TypeInfo {
    pub fn primitive(name: impl Into<String>, kind: PrimitiveKind) -> Self {
        Self {
            name: name.into(),
            is_value_type: !kind.is_gc_ref(),
            size: kind.size(),
            alignment: kind.size().max(1),
            primitive: Some(kind),
            fields: vec![FlatField { offset: 0, kind }],
        }
    }

    pub fn value_type(name: impl Into<String>, fields: Vec<FlatField>) -> Self {
        let end = fields
            .iter()
            .map(|f| f.offset as usize + f.kind.size())
            .max()
            .unwrap_or(1);
        let alignment = fields
            .iter()
            .map(|f| f.kind.size())
            .max()
            .unwrap_or(1)
            .max(1);
        Self {
            name: name.into(),
            is_value_type: true,
            size: crate::utils::align_up(end, alignment),
            alignment,
            primitive: None,
            fields,
        }
    }

    pub fn class(name: impl Into<String>, fields: Vec<FlatField>) -> Self {
        let size = fields
            .iter()
            .map(|f| f.offset as usize + f.kind.size())
            .max()
            .unwrap_or(0);
        Self {
            name: name.into(),
            is_value_type: false,
            size,
            alignment: SLOT_SIZE,
            primitive: None,
            fields,
        }
    }

    /// Offsets of reference-typed leaves, with `true` for interior pointers.
    pub fn gc_slots(&self) -> impl Iterator<Item = (usize, bool)> + '_ {
        self.fields.iter().filter_map(|f| match f.kind {
            PrimitiveKind::Object => Some((f.offset as usize, false)),
            PrimitiveKind::ByRef => Some((f.offset as usize, true)),
            _ => None,
        })
    }

    /// Homogeneous floating-point aggregate: up to four leaves of one float kind.
    pub fn hfa(&self) -> Option<(PrimitiveKind, usize)> {
        if !self.is_value_type || self.primitive.is_some() || self.fields.is_empty() {
            return None;
        }
        let kind = self.fields[0].kind;
        if !kind.is_float() || self.fields.len() > 4 {
            return None;
        }
        if self.fields.iter().any(|f| f.kind != kind) {
            return None;
        }
        if self.size != kind.size() * self.fields.len() {
            return None;
        }
        Some((kind, self.fields.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_integers_widen_to_i4() {
        for kind in [
            PrimitiveKind::Bool,
            PrimitiveKind::Char,
            PrimitiveKind::I1,
            PrimitiveKind::U1,
            PrimitiveKind::I2,
            PrimitiveKind::U2,
            PrimitiveKind::U4,
        ] {
            assert_eq!(kind.stack_normal(), PrimitiveKind::I4, "{kind}");
        }
        assert_eq!(PrimitiveKind::U8.stack_normal(), PrimitiveKind::I8);
        assert_eq!(PrimitiveKind::Ptr.stack_normal(), PrimitiveKind::NativeInt);
        assert_eq!(PrimitiveKind::R4.stack_normal(), PrimitiveKind::R4);
    }

    #[test]
    fn struct_descriptor_splits_at_slot_size() {
        let h = TypeHandle(7);
        assert!(matches!(
            ValueTypeDescriptor::for_struct(h, 8),
            ValueTypeDescriptor::InlineStruct { size: 8, .. }
        ));
        let large = ValueTypeDescriptor::for_struct(h, 12);
        assert!(large.is_overflow());
        assert_eq!(large.overflow_size(), 16);
    }

    #[test]
    fn hfa_detection() {
        let point = TypeInfo::value_type(
            "Point",
            vec![
                FlatField { offset: 0, kind: PrimitiveKind::R8 },
                FlatField { offset: 8, kind: PrimitiveKind::R8 },
            ],
        );
        assert_eq!(point.hfa(), Some((PrimitiveKind::R8, 2)));

        let mixed = TypeInfo::value_type(
            "Mixed",
            vec![
                FlatField { offset: 0, kind: PrimitiveKind::R4 },
                FlatField { offset: 4, kind: PrimitiveKind::I4 },
            ],
        );
        assert_eq!(mixed.hfa(), None);
    }
}
