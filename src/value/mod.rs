use crate::types::{
    rules::{self, BinaryOp, TypeRules},
    PrimitiveKind,
};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt::{Debug, Formatter},
};

pub mod convert;

pub use convert::{convert, ConvMode};

/// Address of a heap object owned by the host's object model. Zero is null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef(pub usize);

impl ObjectRef {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

impl Debug for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "obj@{:#x}", self.0)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumberSign {
    Signed,
    Unsigned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ArithmeticError {
    #[error("arithmetic operation overflowed")]
    Overflow,
    #[error("division by zero")]
    DivideByZero,
    #[error("invalid operand kinds {0} and {1}")]
    InvalidOperands(PrimitiveKind, PrimitiveKind),
    #[error("invalid operand kind {0}")]
    InvalidOperand(PrimitiveKind),
}

/// A stack-normalized primitive value, decoded from a tagged slot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StackValue {
    Int32(i32),
    Int64(i64),
    NativeInt(isize),
    Float(f32),
    Double(f64),
    ObjectRef(ObjectRef),
    ManagedPtr(usize),
}

macro_rules! wrapping_arithmetic_op {
    ($l:expr, $r:expr, $op:ident, $float_op:tt) => {
        match ($l, $r) {
            (StackValue::Int32(l), StackValue::Int32(r)) => Ok(StackValue::Int32(l.$op(r))),
            (StackValue::Int64(l), StackValue::Int64(r)) => Ok(StackValue::Int64(l.$op(r))),
            (StackValue::NativeInt(l), StackValue::NativeInt(r)) => Ok(StackValue::NativeInt(l.$op(r))),
            (StackValue::Float(l), StackValue::Float(r)) => Ok(StackValue::Float(l $float_op r)),
            (StackValue::Double(l), StackValue::Double(r)) => Ok(StackValue::Double(l $float_op r)),
            (l, r) => Err(ArithmeticError::InvalidOperands(l.kind(), r.kind())),
        }
    };
}

macro_rules! checked_arithmetic_op {
    ($l:expr, $r:expr, $sgn:expr, $op:ident) => {
        match ($l, $r, $sgn) {
            (StackValue::Int32(l), StackValue::Int32(r), NumberSign::Signed) => l
                .$op(r)
                .map(StackValue::Int32)
                .ok_or(ArithmeticError::Overflow),
            (StackValue::Int32(l), StackValue::Int32(r), NumberSign::Unsigned) => (l as u32)
                .$op(r as u32)
                .map(|v| StackValue::Int32(v as i32))
                .ok_or(ArithmeticError::Overflow),
            (StackValue::Int64(l), StackValue::Int64(r), NumberSign::Signed) => l
                .$op(r)
                .map(StackValue::Int64)
                .ok_or(ArithmeticError::Overflow),
            (StackValue::Int64(l), StackValue::Int64(r), NumberSign::Unsigned) => (l as u64)
                .$op(r as u64)
                .map(|v| StackValue::Int64(v as i64))
                .ok_or(ArithmeticError::Overflow),
            (StackValue::NativeInt(l), StackValue::NativeInt(r), NumberSign::Signed) => l
                .$op(r)
                .map(StackValue::NativeInt)
                .ok_or(ArithmeticError::Overflow),
            (StackValue::NativeInt(l), StackValue::NativeInt(r), NumberSign::Unsigned) => (l
                as usize)
                .$op(r as usize)
                .map(|v| StackValue::NativeInt(v as isize))
                .ok_or(ArithmeticError::Overflow),
            (l, r, _) => Err(ArithmeticError::InvalidOperands(l.kind(), r.kind())),
        }
    };
}

macro_rules! division_op {
    ($l:expr, $r:expr, $sgn:expr, $checked:ident, $float_op:tt) => {
        match ($l, $r, $sgn) {
            (StackValue::Int32(_), StackValue::Int32(0), _)
            | (StackValue::Int64(_), StackValue::Int64(0), _)
            | (StackValue::NativeInt(_), StackValue::NativeInt(0), _) => {
                Err(ArithmeticError::DivideByZero)
            }
            (StackValue::Int32(l), StackValue::Int32(r), NumberSign::Signed) => {
                l.$checked(r).map(StackValue::Int32).ok_or(ArithmeticError::Overflow)
            }
            (StackValue::Int32(l), StackValue::Int32(r), NumberSign::Unsigned) => {
                Ok(StackValue::Int32((l as u32 $float_op r as u32) as i32))
            }
            (StackValue::Int64(l), StackValue::Int64(r), NumberSign::Signed) => {
                l.$checked(r).map(StackValue::Int64).ok_or(ArithmeticError::Overflow)
            }
            (StackValue::Int64(l), StackValue::Int64(r), NumberSign::Unsigned) => {
                Ok(StackValue::Int64((l as u64 $float_op r as u64) as i64))
            }
            (StackValue::NativeInt(l), StackValue::NativeInt(r), NumberSign::Signed) => {
                l.$checked(r).map(StackValue::NativeInt).ok_or(ArithmeticError::Overflow)
            }
            (StackValue::NativeInt(l), StackValue::NativeInt(r), NumberSign::Unsigned) => {
                Ok(StackValue::NativeInt((l as usize $float_op r as usize) as isize))
            }
            (StackValue::Float(l), StackValue::Float(r), NumberSign::Signed) => {
                Ok(StackValue::Float(l $float_op r))
            }
            (StackValue::Double(l), StackValue::Double(r), NumberSign::Signed) => {
                Ok(StackValue::Double(l $float_op r))
            }
            (l, r, _) => Err(ArithmeticError::InvalidOperands(l.kind(), r.kind())),
        }
    };
}

macro_rules! bitwise_op {
    ($l:expr, $r:expr, $op:tt) => {
        match ($l, $r) {
            (StackValue::Int32(l), StackValue::Int32(r)) => Ok(StackValue::Int32(l $op r)),
            (StackValue::Int64(l), StackValue::Int64(r)) => Ok(StackValue::Int64(l $op r)),
            (StackValue::NativeInt(l), StackValue::NativeInt(r)) => Ok(StackValue::NativeInt(l $op r)),
            (l, r) => Err(ArithmeticError::InvalidOperands(l.kind(), r.kind())),
        }
    };
}

macro_rules! shift_op {
    ($target:expr, $amount:expr, $sgn:expr, $op:ident) => {
        match ($target, $sgn) {
            (StackValue::Int32(i), NumberSign::Signed) => StackValue::Int32(i.$op($amount)),
            (StackValue::Int32(i), NumberSign::Unsigned) => StackValue::Int32((i as u32).$op($amount) as i32),
            (StackValue::Int64(i), NumberSign::Signed) => StackValue::Int64(i.$op($amount)),
            (StackValue::Int64(i), NumberSign::Unsigned) => StackValue::Int64((i as u64).$op($amount) as i64),
            (StackValue::NativeInt(i), NumberSign::Signed) => StackValue::NativeInt(i.$op($amount)),
            (StackValue::NativeInt(i), NumberSign::Unsigned) => StackValue::NativeInt((i as usize).$op($amount) as isize),
            (v, _) => return Err(ArithmeticError::InvalidOperand(v.kind())),
        }
    };
}

impl StackValue {
    pub fn null() -> Self {
        Self::ObjectRef(ObjectRef::NULL)
    }

    pub fn kind(&self) -> PrimitiveKind {
        match self {
            Self::Int32(_) => PrimitiveKind::I4,
            Self::Int64(_) => PrimitiveKind::I8,
            Self::NativeInt(_) => PrimitiveKind::NativeInt,
            Self::Float(_) => PrimitiveKind::R4,
            Self::Double(_) => PrimitiveKind::R8,
            Self::ObjectRef(_) => PrimitiveKind::Object,
            Self::ManagedPtr(_) => PrimitiveKind::ByRef,
        }
    }

    /// Decodes the raw contents of a slot tagged with a stack-normal kind.
    pub fn from_slot(kind: PrimitiveKind, bits: u64) -> Self {
        match kind.stack_normal() {
            PrimitiveKind::I4 => Self::Int32(bits as u32 as i32),
            PrimitiveKind::I8 => Self::Int64(bits as i64),
            PrimitiveKind::R4 => Self::Float(f32::from_bits(bits as u32)),
            PrimitiveKind::R8 => Self::Double(f64::from_bits(bits)),
            PrimitiveKind::Object => Self::ObjectRef(ObjectRef(bits as usize)),
            PrimitiveKind::ByRef => Self::ManagedPtr(bits as usize),
            _ => Self::NativeInt(bits as isize),
        }
    }

    pub fn to_slot(self) -> u64 {
        match self {
            Self::Int32(i) => i as u32 as u64,
            Self::Int64(i) => i as u64,
            Self::NativeInt(i) => i as u64,
            Self::Float(f) => f.to_bits() as u64,
            Self::Double(d) => d.to_bits(),
            Self::ObjectRef(o) => o.0 as u64,
            Self::ManagedPtr(p) => p as u64,
        }
    }

    /// Reads a value of `kind` from memory and normalizes it for the stack.
    ///
    /// # Safety
    /// `ptr` must be valid for reads of `kind.size()` bytes.
    pub unsafe fn load(ptr: *const u8, kind: PrimitiveKind) -> Self {
        use PrimitiveKind::*;
        match kind {
            Bool | U1 => Self::Int32(ptr.read() as i32),
            I1 => Self::Int32(ptr.cast::<i8>().read() as i32),
            Char | U2 => Self::Int32(ptr.cast::<u16>().read_unaligned() as i32),
            I2 => Self::Int32(ptr.cast::<i16>().read_unaligned() as i32),
            I4 | U4 => Self::Int32(ptr.cast::<i32>().read_unaligned()),
            I8 | U8 => Self::Int64(ptr.cast::<i64>().read_unaligned()),
            NativeInt | NativeUInt | Ptr => Self::NativeInt(ptr.cast::<isize>().read_unaligned()),
            R4 => Self::Float(ptr.cast::<f32>().read_unaligned()),
            R8 => Self::Double(ptr.cast::<f64>().read_unaligned()),
            Object => Self::ObjectRef(ObjectRef(ptr.cast::<usize>().read_unaligned())),
            ByRef => Self::ManagedPtr(ptr.cast::<usize>().read_unaligned()),
            Void => Self::Int32(0),
        }
    }

    /// Writes this value into memory as `kind`, truncating integers.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `kind.size()` bytes.
    pub unsafe fn store(self, ptr: *mut u8, kind: PrimitiveKind) {
        use PrimitiveKind::*;
        match kind {
            R4 => ptr.cast::<f32>().write_unaligned(self.as_f64() as f32),
            R8 => ptr.cast::<f64>().write_unaligned(self.as_f64()),
            Void => {}
            _ => {
                let bits = self.as_bits_i64() as u64;
                let bytes = bits.to_le_bytes();
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, kind.size());
            }
        }
    }

    fn as_bits_i64(self) -> i64 {
        match self {
            Self::Int32(i) => i as i64,
            Self::Int64(i) => i,
            Self::NativeInt(i) => i as i64,
            Self::Float(f) => f as i64,
            Self::Double(d) => d as i64,
            Self::ObjectRef(o) => o.0 as i64,
            Self::ManagedPtr(p) => p as i64,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Self::Float(f) => f as f64,
            Self::Double(d) => d,
            other => other.as_bits_i64() as f64,
        }
    }

    /// Integer view used for branch conditions and pointer-typed operands.
    pub fn as_isize(self) -> isize {
        self.as_bits_i64() as isize
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.as_isize() as *mut u8
    }

    pub fn is_zero(self) -> bool {
        match self {
            Self::Float(f) => f == 0.0,
            Self::Double(d) => d == 0.0,
            other => other.as_bits_i64() == 0,
        }
    }

    /// Converts an operand to the result kind picked by the rules table.
    fn coerce(self, to: PrimitiveKind, sgn: NumberSign) -> Result<Self, ArithmeticError> {
        Ok(match (self, to) {
            (v, k) if v.kind() == k => v,
            (Self::Int32(i), PrimitiveKind::NativeInt) => match sgn {
                NumberSign::Signed => Self::NativeInt(i as isize),
                NumberSign::Unsigned => Self::NativeInt(i as u32 as isize),
            },
            (Self::Int32(i), PrimitiveKind::I8) => match sgn {
                NumberSign::Signed => Self::Int64(i as i64),
                NumberSign::Unsigned => Self::Int64(i as u32 as i64),
            },
            (Self::Int64(i), PrimitiveKind::NativeInt) => Self::NativeInt(i as isize),
            (Self::Float(f), PrimitiveKind::R8) => Self::Double(f as f64),
            (v, _) => return Err(ArithmeticError::InvalidOperand(v.kind())),
        })
    }

    pub fn binary(
        self,
        op: BinaryOp,
        rhs: Self,
        rules: TypeRules,
    ) -> Result<Self, ArithmeticError> {
        let result = rules::binary_result(op, self.kind(), rhs.kind(), rules)
            .ok_or(ArithmeticError::InvalidOperands(self.kind(), rhs.kind()))?;

        if self.kind() == PrimitiveKind::ByRef || rhs.kind() == PrimitiveKind::ByRef {
            return self.pointer_arithmetic(op, rhs);
        }

        let sgn = match op {
            BinaryOp::DivUn | BinaryOp::RemUn | BinaryOp::AddOvfUn | BinaryOp::SubOvfUn | BinaryOp::MulOvfUn => {
                NumberSign::Unsigned
            }
            _ => NumberSign::Signed,
        };
        let l = self.coerce(result, sgn)?;
        let r = rhs.coerce(result, sgn)?;

        use BinaryOp::*;
        match op {
            Add => wrapping_arithmetic_op!(l, r, wrapping_add, +),
            Sub => wrapping_arithmetic_op!(l, r, wrapping_sub, -),
            Mul => wrapping_arithmetic_op!(l, r, wrapping_mul, *),
            Div | DivUn => division_op!(l, r, sgn, checked_div, /),
            Rem | RemUn => division_op!(l, r, sgn, checked_rem, %),
            And => bitwise_op!(l, r, &),
            Or => bitwise_op!(l, r, |),
            Xor => bitwise_op!(l, r, ^),
            AddOvf | AddOvfUn => checked_arithmetic_op!(l, r, sgn, checked_add),
            SubOvf | SubOvfUn => checked_arithmetic_op!(l, r, sgn, checked_sub),
            MulOvf | MulOvfUn => checked_arithmetic_op!(l, r, sgn, checked_mul),
        }
    }

    /// byref +/- integer yields a byref; byref - byref yields a native int.
    fn pointer_arithmetic(self, op: BinaryOp, rhs: Self) -> Result<Self, ArithmeticError> {
        let checked = matches!(op, BinaryOp::AddOvfUn | BinaryOp::SubOvfUn);
        let add = |base: usize, offset: isize| -> Result<usize, ArithmeticError> {
            if checked {
                base.checked_add_signed(offset).ok_or(ArithmeticError::Overflow)
            } else {
                Ok(base.wrapping_add_signed(offset))
            }
        };
        match (self, op, rhs) {
            (Self::ManagedPtr(p), BinaryOp::Add | BinaryOp::AddOvfUn, i)
            | (i, BinaryOp::Add | BinaryOp::AddOvfUn, Self::ManagedPtr(p)) => {
                Ok(Self::ManagedPtr(add(p, i.as_isize())?))
            }
            (Self::ManagedPtr(l), BinaryOp::Sub | BinaryOp::SubOvfUn, Self::ManagedPtr(r)) => {
                if checked && r > l {
                    return Err(ArithmeticError::Overflow);
                }
                Ok(Self::NativeInt(l.wrapping_sub(r) as isize))
            }
            (Self::ManagedPtr(p), BinaryOp::Sub | BinaryOp::SubOvfUn, i) => {
                if checked {
                    p.checked_sub(i.as_isize() as usize)
                        .map(Self::ManagedPtr)
                        .ok_or(ArithmeticError::Overflow)
                } else {
                    Ok(Self::ManagedPtr(p.wrapping_add_signed(i.as_isize().wrapping_neg())))
                }
            }
            (i, BinaryOp::Sub | BinaryOp::SubOvfUn, Self::ManagedPtr(p)) => {
                Ok(Self::NativeInt((i.as_isize() as usize).wrapping_sub(p) as isize))
            }
            (l, _, r) => Err(ArithmeticError::InvalidOperands(l.kind(), r.kind())),
        }
    }

    pub fn shift(self, amount: Self, op: ShiftOp) -> Result<Self, ArithmeticError> {
        let amount = match amount {
            Self::Int32(i) => i as u32,
            Self::Int64(i) => i as u32,
            Self::NativeInt(i) => i as u32,
            other => return Err(ArithmeticError::InvalidOperand(other.kind())),
        };
        Ok(match op {
            ShiftOp::Left => shift_op!(self, amount, NumberSign::Signed, wrapping_shl),
            ShiftOp::Right => shift_op!(self, amount, NumberSign::Signed, wrapping_shr),
            ShiftOp::RightUnsigned => shift_op!(self, amount, NumberSign::Unsigned, wrapping_shr),
        })
    }

    pub fn neg(self) -> Result<Self, ArithmeticError> {
        Ok(match self {
            Self::Int32(i) => Self::Int32(i.wrapping_neg()),
            Self::Int64(i) => Self::Int64(i.wrapping_neg()),
            Self::NativeInt(i) => Self::NativeInt(i.wrapping_neg()),
            Self::Float(f) => Self::Float(-f),
            Self::Double(d) => Self::Double(-d),
            other => return Err(ArithmeticError::InvalidOperand(other.kind())),
        })
    }

    pub fn not(self) -> Result<Self, ArithmeticError> {
        Ok(match self {
            Self::Int32(i) => Self::Int32(!i),
            Self::Int64(i) => Self::Int64(!i),
            Self::NativeInt(i) => Self::NativeInt(!i),
            other => return Err(ArithmeticError::InvalidOperand(other.kind())),
        })
    }

    /// Three-way comparison after applying the widening rules. `None` means
    /// unordered (a NaN was involved).
    pub fn compare(self, other: Self, sgn: NumberSign) -> Option<Ordering> {
        use StackValue::*;
        match (self, other) {
            (Float(_) | Double(_), Float(_) | Double(_)) => {
                self.as_f64().partial_cmp(&other.as_f64())
            }
            (l, r) => {
                let (l, r) = (l.as_bits_i64(), r.as_bits_i64());
                Some(match sgn {
                    NumberSign::Signed => l.cmp(&r),
                    NumberSign::Unsigned => {
                        // An int32 compared unsigned against a wider operand is sign-extended first.
                        (l as u64).cmp(&(r as u64))
                    }
                })
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShiftOp {
    Left,
    Right,
    RightUnsigned,
}

impl From<ObjectRef> for StackValue {
    fn from(o: ObjectRef) -> Self {
        Self::ObjectRef(o)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: TypeRules = TypeRules::Permissive;

    #[test]
    fn int_plus_native_int_is_native_int() {
        let v = StackValue::Int32(5)
            .binary(BinaryOp::Add, StackValue::NativeInt(3), TypeRules::Strict)
            .unwrap();
        assert_eq!(v, StackValue::NativeInt(8));
        assert_eq!(v.kind(), PrimitiveKind::NativeInt);
    }

    #[test]
    fn checked_add_overflows() {
        assert_eq!(
            StackValue::Int32(i32::MAX).binary(BinaryOp::AddOvf, StackValue::Int32(1), P),
            Err(ArithmeticError::Overflow)
        );
        assert_eq!(
            StackValue::Int32(i32::MAX).binary(BinaryOp::Add, StackValue::Int32(1), P),
            Ok(StackValue::Int32(i32::MIN))
        );
        assert_eq!(
            StackValue::Int32(-1).binary(BinaryOp::AddOvfUn, StackValue::Int32(1), P),
            Err(ArithmeticError::Overflow)
        );
    }

    #[test]
    fn division_edge_cases() {
        for op in [BinaryOp::Div, BinaryOp::Rem] {
            assert_eq!(
                StackValue::Int32(i32::MIN).binary(op, StackValue::Int32(-1), P),
                Err(ArithmeticError::Overflow)
            );
        }
        for op in [BinaryOp::Div, BinaryOp::DivUn, BinaryOp::Rem, BinaryOp::RemUn] {
            assert_eq!(
                StackValue::Int32(7).binary(op, StackValue::Int32(0), P),
                Err(ArithmeticError::DivideByZero)
            );
            assert_eq!(
                StackValue::Int64(7).binary(op, StackValue::Int64(0), P),
                Err(ArithmeticError::DivideByZero)
            );
        }
        assert_eq!(
            StackValue::Int32(i32::MIN).binary(BinaryOp::DivUn, StackValue::Int32(-1), P),
            Ok(StackValue::Int32(0))
        );
        let inf = StackValue::Double(1.0)
            .binary(BinaryOp::Div, StackValue::Double(0.0), P)
            .unwrap();
        assert_eq!(inf, StackValue::Double(f64::INFINITY));
    }

    #[test]
    fn pointer_arithmetic() {
        let p = StackValue::ManagedPtr(0x1000);
        assert_eq!(
            StackValue::Int32(8).binary(BinaryOp::Add, p, P),
            Ok(StackValue::ManagedPtr(0x1008))
        );
        assert_eq!(
            p.binary(BinaryOp::Sub, StackValue::ManagedPtr(0xff0), P),
            Ok(StackValue::NativeInt(0x10))
        );
        assert!(p.binary(BinaryOp::Mul, StackValue::Int32(2), P).is_err());
    }

    #[test]
    fn shifts_and_unsigned_compare() {
        assert_eq!(
            StackValue::Int32(-8).shift(StackValue::Int32(1), ShiftOp::RightUnsigned),
            Ok(StackValue::Int32(0x7fff_fffc))
        );
        assert_eq!(
            StackValue::Int32(-1).compare(StackValue::Int32(1), NumberSign::Unsigned),
            Some(Ordering::Greater)
        );
        assert_eq!(
            StackValue::Double(f64::NAN).compare(StackValue::Double(1.0), NumberSign::Signed),
            None
        );
    }

    #[test]
    fn load_sign_extends_small_integers() {
        let byte: i8 = -3;
        let v = unsafe { StackValue::load(&byte as *const i8 as *const u8, PrimitiveKind::I1) };
        assert_eq!(v, StackValue::Int32(-3));
        let v = unsafe { StackValue::load(&byte as *const i8 as *const u8, PrimitiveKind::U1) };
        assert_eq!(v, StackValue::Int32(253));
    }
}
