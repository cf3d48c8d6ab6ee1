//! Operand-kind compatibility tables for binary, comparison and shift
//! instructions.
//!
//! `Strict` accepts exactly the pairings of ECMA-335 Partition III tables 2-6.
//! `Permissive` additionally accepts the cross-matching that compiled code
//! produced by older code generators relies on:
//!
//! | left      | right     | ops                      | result     |
//! |-----------|-----------|--------------------------|------------|
//! | int32     | int64     | numeric, integer         | int64      |
//! | int64     | native int| numeric, integer         | native int |
//! | byref     | int64     | add, sub                 | byref      |
//! | int64     | byref     | add                      | byref      |
//! | native int| byref     | sub                      | native int |
//! | any of int32/int64/native int pairwise | comparisons | -  |
//! | byref     | int64/native int | comparisons (all)  | -          |
//! | int64/native int | byref local or argument | store | -      |
//! | int64     | (shift amount) | shl, shr, shr.un    | value kind |
use super::PrimitiveKind::{self, *};
use serde::{Deserialize, Serialize};

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum TypeRules {
    Strict,
    #[default]
    Permissive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    DivUn,
    RemUn,
    And,
    Or,
    Xor,
    AddOvf,
    AddOvfUn,
    SubOvf,
    SubOvfUn,
    MulOvf,
    MulOvfUn,
}

impl BinaryOp {
    /// Operations restricted to integer operands.
    pub fn is_integer_only(self) -> bool {
        use BinaryOp::*;
        !matches!(self, Add | Sub | Mul | Div | Rem)
    }

    fn adds(self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::AddOvfUn)
    }

    fn subtracts(self) -> bool {
        matches!(self, BinaryOp::Sub | BinaryOp::SubOvfUn)
    }

    pub fn mnemonic(self) -> &'static str {
        use BinaryOp::*;
        match self {
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Rem => "rem",
            DivUn => "div.un",
            RemUn => "rem.un",
            And => "and",
            Or => "or",
            Xor => "xor",
            AddOvf => "add.ovf",
            AddOvfUn => "add.ovf.un",
            SubOvf => "sub.ovf",
            SubOvfUn => "sub.ovf.un",
            MulOvf => "mul.ovf",
            MulOvfUn => "mul.ovf.un",
        }
    }
}

/// Result kind of `left op right`, or `None` if the pairing is invalid.
pub fn binary_result(
    op: BinaryOp,
    left: PrimitiveKind,
    right: PrimitiveKind,
    rules: TypeRules,
) -> Option<PrimitiveKind> {
    let strict = match (left, right) {
        (I4, I4) => Some(I4),
        (I4, NativeInt) | (NativeInt, I4) | (NativeInt, NativeInt) => Some(NativeInt),
        (I8, I8) => Some(I8),
        (R4, R4) if !op.is_integer_only() => Some(R4),
        (R4, R8) | (R8, R4) | (R8, R8) if !op.is_integer_only() => Some(R8),
        (ByRef, I4) | (ByRef, NativeInt) if op.adds() || op.subtracts() => Some(ByRef),
        (I4, ByRef) | (NativeInt, ByRef) if op.adds() => Some(ByRef),
        (ByRef, ByRef) if op.subtracts() => Some(NativeInt),
        _ => None,
    };
    if strict.is_some() || rules == TypeRules::Strict {
        return strict;
    }
    match (left, right) {
        (I4, I8) | (I8, I4) => Some(I8),
        (I8, NativeInt) | (NativeInt, I8) => Some(NativeInt),
        (ByRef, I8) if op.adds() || op.subtracts() => Some(ByRef),
        (I8, ByRef) if op.adds() => Some(ByRef),
        (NativeInt, ByRef) if op.subtracts() => Some(NativeInt),
        _ => None,
    }
}

/// Whether two stack kinds may be compared. `equality_only` covers
/// `ceq`/`beq`/`bne.un`, and `cgt.un` against null for object references.
pub fn comparison_allowed(
    left: PrimitiveKind,
    right: PrimitiveKind,
    equality_only: bool,
    rules: TypeRules,
) -> bool {
    let strict = match (left, right) {
        (I4, I4) | (I4, NativeInt) | (NativeInt, I4) | (NativeInt, NativeInt) | (I8, I8) => true,
        (R4 | R8, R4 | R8) => true,
        (ByRef, ByRef) => true,
        (ByRef, NativeInt) | (NativeInt, ByRef) => equality_only,
        (Object, Object) => equality_only,
        _ => false,
    };
    if strict || rules == TypeRules::Strict {
        return strict;
    }
    matches!(
        (left, right),
        (I4 | I8 | NativeInt, I4 | I8 | NativeInt)
            | (ByRef, I8 | NativeInt)
            | (I8 | NativeInt, ByRef)
    )
}

pub fn shift_allowed(value: PrimitiveKind, amount: PrimitiveKind, rules: TypeRules) -> bool {
    let value_ok = matches!(value, I4 | I8 | NativeInt);
    let amount_ok = match amount {
        I4 | NativeInt => true,
        I8 => rules == TypeRules::Permissive,
        _ => false,
    };
    value_ok && amount_ok
}

/// Whether a stack value of kind `value` may be stored into a location
/// whose stack-normal kind is `target`.
pub fn store_allowed(target: PrimitiveKind, value: PrimitiveKind, rules: TypeRules) -> bool {
    if target == value {
        return true;
    }
    let strict = match (target, value) {
        (I4, NativeInt) | (NativeInt, I4) => true,
        (R4, R8) | (R8, R4) => true,
        // Storing a byref into a native int location stops GC tracking.
        (NativeInt, ByRef) => true,
        _ => false,
    };
    if strict || rules == TypeRules::Strict {
        return strict;
    }
    matches!(
        (target, value),
        (ByRef, I8 | NativeInt) | (I8, NativeInt | I4 | ByRef) | (NativeInt, I8) | (I4, I8)
    )
}
