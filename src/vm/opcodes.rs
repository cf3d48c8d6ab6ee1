//! CIL instruction decoding.
//!
//! The interpreter executes raw method bodies; each step decodes one
//! instruction at the current offset into a closed [`Opcode`]. Two-byte
//! `0xFE`-prefixed instructions decode into the nested [`PrefixedOpcode`].
//! Short and long encodings of the same instruction (`ldarg.s`/`ldarg`,
//! `br.s`/`br`, ...) decode to the same variant, with branch targets made
//! absolute.
use crate::{
    types::{rules::BinaryOp, PrimitiveKind},
    value::{ConvMode, ShiftOp},
    vm::error::DecodeError,
};
use std::fmt::{Display, Formatter};

/// Metadata token embedded in the instruction stream.
pub type Token = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchKind {
    Always,
    False,
    True,
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
    NeUn,
    GeUn,
    GtUn,
    LeUn,
    LtUn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementType {
    Primitive(PrimitiveKind),
    Token(Token),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Opcode {
    Nop,
    Break,
    LdArg(u16),
    LdArgA(u16),
    StArg(u16),
    LdLoc(u16),
    LdLocA(u16),
    StLoc(u16),
    LdNull,
    LdcI4(i32),
    LdcI8(i64),
    LdcR4(f32),
    LdcR8(f64),
    Dup,
    Pop,
    Jmp(Token),
    Call(Token),
    CallI(Token),
    Ret,
    Branch(BranchKind, u32),
    /// Jump table; targets are read from the instruction stream on execution.
    Switch { count: u32, table: u32 },
    LdInd(PrimitiveKind),
    StInd(PrimitiveKind),
    Binary(BinaryOp),
    Shift(ShiftOp),
    Neg,
    Not,
    Conv(PrimitiveKind, ConvMode),
    CallVirt(Token),
    CpObj(Token),
    LdObj(Token),
    LdStr(Token),
    NewObj(Token),
    CastClass(Token),
    IsInst(Token),
    Unbox(Token),
    Throw,
    LdFld(Token),
    LdFldA(Token),
    StFld(Token),
    LdSFld(Token),
    LdSFldA(Token),
    StSFld(Token),
    StObj(Token),
    Box(Token),
    NewArr(Token),
    LdLen,
    LdElemA(Token),
    LdElem(ElementType),
    StElem(ElementType),
    UnboxAny(Token),
    RefAnyVal(Token),
    CkFinite,
    MkRefAny(Token),
    LdToken(Token),
    EndFinally,
    Leave(u32),
    Prefixed(PrefixedOpcode),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrefixedOpcode {
    ArgList,
    Ceq,
    Cgt,
    CgtUn,
    Clt,
    CltUn,
    LdFtn(Token),
    LdVirtFtn(Token),
    LocAlloc,
    EndFilter,
    Unaligned(u8),
    Volatile,
    Tail,
    InitObj(Token),
    Constrained(Token),
    CpBlk,
    InitBlk,
    No(u8),
    Rethrow,
    SizeOf(Token),
    RefAnyType,
    ReadOnly,
}

use PrimitiveKind as P;

const BRANCHES: [(u8, u8, BranchKind); 13] = [
    (0x2B, 0x38, BranchKind::Always),
    (0x2C, 0x39, BranchKind::False),
    (0x2D, 0x3A, BranchKind::True),
    (0x2E, 0x3B, BranchKind::Eq),
    (0x2F, 0x3C, BranchKind::Ge),
    (0x30, 0x3D, BranchKind::Gt),
    (0x31, 0x3E, BranchKind::Le),
    (0x32, 0x3F, BranchKind::Lt),
    (0x33, 0x40, BranchKind::NeUn),
    (0x34, 0x41, BranchKind::GeUn),
    (0x35, 0x42, BranchKind::GtUn),
    (0x36, 0x43, BranchKind::LeUn),
    (0x37, 0x44, BranchKind::LtUn),
];

const LDIND: [(u8, PrimitiveKind); 11] = [
    (0x46, P::I1),
    (0x47, P::U1),
    (0x48, P::I2),
    (0x49, P::U2),
    (0x4A, P::I4),
    (0x4B, P::U4),
    (0x4C, P::I8),
    (0x4D, P::NativeInt),
    (0x4E, P::R4),
    (0x4F, P::R8),
    (0x50, P::Object),
];

const STIND: [(u8, PrimitiveKind); 8] = [
    (0x51, P::Object),
    (0x52, P::I1),
    (0x53, P::I2),
    (0x54, P::I4),
    (0x55, P::I8),
    (0x56, P::R4),
    (0x57, P::R8),
    (0xDF, P::NativeInt),
];

const BINARY: [(u8, BinaryOp); 15] = [
    (0x58, BinaryOp::Add),
    (0x59, BinaryOp::Sub),
    (0x5A, BinaryOp::Mul),
    (0x5B, BinaryOp::Div),
    (0x5C, BinaryOp::DivUn),
    (0x5D, BinaryOp::Rem),
    (0x5E, BinaryOp::RemUn),
    (0x5F, BinaryOp::And),
    (0x60, BinaryOp::Or),
    (0x61, BinaryOp::Xor),
    (0xD6, BinaryOp::AddOvf),
    (0xD7, BinaryOp::AddOvfUn),
    (0xD8, BinaryOp::MulOvf),
    (0xD9, BinaryOp::MulOvfUn),
    (0xDA, BinaryOp::SubOvf),
];

const CONV: [(u8, PrimitiveKind, ConvMode); 33] = [
    (0x67, P::I1, ConvMode::Unchecked),
    (0x68, P::I2, ConvMode::Unchecked),
    (0x69, P::I4, ConvMode::Unchecked),
    (0x6A, P::I8, ConvMode::Unchecked),
    (0x6B, P::R4, ConvMode::Unchecked),
    (0x6C, P::R8, ConvMode::Unchecked),
    (0x6D, P::U4, ConvMode::Unchecked),
    (0x6E, P::U8, ConvMode::Unchecked),
    (0x76, P::R8, ConvMode::UnsignedToFloat),
    (0x82, P::I1, ConvMode::OverflowUnsigned),
    (0x83, P::I2, ConvMode::OverflowUnsigned),
    (0x84, P::I4, ConvMode::OverflowUnsigned),
    (0x85, P::I8, ConvMode::OverflowUnsigned),
    (0x86, P::U1, ConvMode::OverflowUnsigned),
    (0x87, P::U2, ConvMode::OverflowUnsigned),
    (0x88, P::U4, ConvMode::OverflowUnsigned),
    (0x89, P::U8, ConvMode::OverflowUnsigned),
    (0x8A, P::NativeInt, ConvMode::OverflowUnsigned),
    (0x8B, P::NativeUInt, ConvMode::OverflowUnsigned),
    (0xB3, P::I1, ConvMode::Overflow),
    (0xB4, P::U1, ConvMode::Overflow),
    (0xB5, P::I2, ConvMode::Overflow),
    (0xB6, P::U2, ConvMode::Overflow),
    (0xB7, P::I4, ConvMode::Overflow),
    (0xB8, P::U4, ConvMode::Overflow),
    (0xB9, P::I8, ConvMode::Overflow),
    (0xBA, P::U8, ConvMode::Overflow),
    (0xD1, P::U2, ConvMode::Unchecked),
    (0xD2, P::U1, ConvMode::Unchecked),
    (0xD3, P::NativeInt, ConvMode::Unchecked),
    (0xD4, P::NativeInt, ConvMode::Overflow),
    (0xD5, P::NativeUInt, ConvMode::Overflow),
    (0xE0, P::NativeUInt, ConvMode::Unchecked),
];

const LDELEM: [(u8, PrimitiveKind); 11] = [
    (0x90, P::I1),
    (0x91, P::U1),
    (0x92, P::I2),
    (0x93, P::U2),
    (0x94, P::I4),
    (0x95, P::U4),
    (0x96, P::I8),
    (0x97, P::NativeInt),
    (0x98, P::R4),
    (0x99, P::R8),
    (0x9A, P::Object),
];

const STELEM: [(u8, PrimitiveKind); 8] = [
    (0x9B, P::NativeInt),
    (0x9C, P::I1),
    (0x9D, P::I2),
    (0x9E, P::I4),
    (0x9F, P::I8),
    (0xA0, P::R4),
    (0xA1, P::R8),
    (0xA2, P::Object),
];

struct Reader<'a> {
    code: &'a [u8],
    start: usize,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self
            .code
            .get(self.pos..self.pos + N)
            .ok_or(DecodeError::Truncated(self.start))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes::<1>()?[0])
    }

    fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.bytes()?))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.bytes()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.bytes()?))
    }

    fn token(&mut self) -> Result<Token, DecodeError> {
        self.u32()
    }

    /// Branch targets are relative to the end of the instruction.
    fn target(&self, relative: i64) -> u32 {
        (self.pos as i64 + relative) as u32
    }
}

/// Decodes the instruction at `offset`, returning it and the offset of the
/// next instruction.
pub fn decode(code: &[u8], offset: usize) -> Result<(Opcode, usize), DecodeError> {
    let mut r = Reader {
        code,
        start: offset,
        pos: offset,
    };
    let byte = r.u8()?;
    let op = match byte {
        0x00 => Opcode::Nop,
        0x01 => Opcode::Break,
        0x02..=0x05 => Opcode::LdArg((byte - 0x02) as u16),
        0x06..=0x09 => Opcode::LdLoc((byte - 0x06) as u16),
        0x0A..=0x0D => Opcode::StLoc((byte - 0x0A) as u16),
        0x0E => Opcode::LdArg(r.u8()? as u16),
        0x0F => Opcode::LdArgA(r.u8()? as u16),
        0x10 => Opcode::StArg(r.u8()? as u16),
        0x11 => Opcode::LdLoc(r.u8()? as u16),
        0x12 => Opcode::LdLocA(r.u8()? as u16),
        0x13 => Opcode::StLoc(r.u8()? as u16),
        0x14 => Opcode::LdNull,
        0x15..=0x1E => Opcode::LdcI4(byte as i32 - 0x16),
        0x1F => Opcode::LdcI4(r.i8()? as i32),
        0x20 => Opcode::LdcI4(r.i32()?),
        0x21 => Opcode::LdcI8(r.i64()?),
        0x22 => Opcode::LdcR4(f32::from_le_bytes(r.bytes()?)),
        0x23 => Opcode::LdcR8(f64::from_le_bytes(r.bytes()?)),
        0x25 => Opcode::Dup,
        0x26 => Opcode::Pop,
        0x27 => Opcode::Jmp(r.token()?),
        0x28 => Opcode::Call(r.token()?),
        0x29 => Opcode::CallI(r.token()?),
        0x2A => Opcode::Ret,
        0x2B..=0x37 => {
            let kind = BRANCHES[(byte - 0x2B) as usize].2;
            let rel = r.i8()? as i64;
            Opcode::Branch(kind, r.target(rel))
        }
        0x38..=0x44 => {
            let kind = BRANCHES[(byte - 0x38) as usize].2;
            let rel = r.i32()? as i64;
            Opcode::Branch(kind, r.target(rel))
        }
        0x45 => {
            let count = r.u32()?;
            let table = r.pos as u32;
            let len = count as usize * 4;
            if r.pos + len > code.len() {
                return Err(DecodeError::Truncated(offset));
            }
            r.pos += len;
            Opcode::Switch { count, table }
        }
        0x65 => Opcode::Neg,
        0x66 => Opcode::Not,
        0x62 => Opcode::Shift(ShiftOp::Left),
        0x63 => Opcode::Shift(ShiftOp::Right),
        0x64 => Opcode::Shift(ShiftOp::RightUnsigned),
        0xDB => Opcode::Binary(BinaryOp::SubOvfUn),
        0x6F => Opcode::CallVirt(r.token()?),
        0x70 => Opcode::CpObj(r.token()?),
        0x71 => Opcode::LdObj(r.token()?),
        0x72 => Opcode::LdStr(r.token()?),
        0x73 => Opcode::NewObj(r.token()?),
        0x74 => Opcode::CastClass(r.token()?),
        0x75 => Opcode::IsInst(r.token()?),
        0x79 => Opcode::Unbox(r.token()?),
        0x7A => Opcode::Throw,
        0x7B => Opcode::LdFld(r.token()?),
        0x7C => Opcode::LdFldA(r.token()?),
        0x7D => Opcode::StFld(r.token()?),
        0x7E => Opcode::LdSFld(r.token()?),
        0x7F => Opcode::LdSFldA(r.token()?),
        0x80 => Opcode::StSFld(r.token()?),
        0x81 => Opcode::StObj(r.token()?),
        0x8C => Opcode::Box(r.token()?),
        0x8D => Opcode::NewArr(r.token()?),
        0x8E => Opcode::LdLen,
        0x8F => Opcode::LdElemA(r.token()?),
        0xA3 => Opcode::LdElem(ElementType::Token(r.token()?)),
        0xA4 => Opcode::StElem(ElementType::Token(r.token()?)),
        0xA5 => Opcode::UnboxAny(r.token()?),
        0xC2 => Opcode::RefAnyVal(r.token()?),
        0xC3 => Opcode::CkFinite,
        0xC6 => Opcode::MkRefAny(r.token()?),
        0xD0 => Opcode::LdToken(r.token()?),
        0xDC => Opcode::EndFinally,
        0xDD => {
            let rel = r.i32()? as i64;
            Opcode::Leave(r.target(rel))
        }
        0xDE => {
            let rel = r.i8()? as i64;
            Opcode::Leave(r.target(rel))
        }
        0xFE => return decode_prefixed(r),
        b => {
            if let Some(&(_, k)) = LDIND.iter().find(|(x, _)| *x == b) {
                Opcode::LdInd(k)
            } else if let Some(&(_, k)) = STIND.iter().find(|(x, _)| *x == b) {
                Opcode::StInd(k)
            } else if let Some(&(_, op)) = BINARY.iter().find(|(x, _)| *x == b) {
                Opcode::Binary(op)
            } else if let Some(&(_, k, m)) = CONV.iter().find(|(x, _, _)| *x == b) {
                Opcode::Conv(k, m)
            } else if let Some(&(_, k)) = LDELEM.iter().find(|(x, _)| *x == b) {
                Opcode::LdElem(ElementType::Primitive(k))
            } else if let Some(&(_, k)) = STELEM.iter().find(|(x, _)| *x == b) {
                Opcode::StElem(ElementType::Primitive(k))
            } else {
                return Err(DecodeError::UnknownOpcode { offset, byte: b });
            }
        }
    };
    Ok((op, r.pos))
}

fn decode_prefixed(mut r: Reader<'_>) -> Result<(Opcode, usize), DecodeError> {
    let byte = r.u8()?;
    let op = match byte {
        0x00 => PrefixedOpcode::ArgList,
        0x01 => PrefixedOpcode::Ceq,
        0x02 => PrefixedOpcode::Cgt,
        0x03 => PrefixedOpcode::CgtUn,
        0x04 => PrefixedOpcode::Clt,
        0x05 => PrefixedOpcode::CltUn,
        0x06 => PrefixedOpcode::LdFtn(r.token()?),
        0x07 => PrefixedOpcode::LdVirtFtn(r.token()?),
        0x09 => return Ok((Opcode::LdArg(r.u16()?), r.pos)),
        0x0A => return Ok((Opcode::LdArgA(r.u16()?), r.pos)),
        0x0B => return Ok((Opcode::StArg(r.u16()?), r.pos)),
        0x0C => return Ok((Opcode::LdLoc(r.u16()?), r.pos)),
        0x0D => return Ok((Opcode::LdLocA(r.u16()?), r.pos)),
        0x0E => return Ok((Opcode::StLoc(r.u16()?), r.pos)),
        0x0F => PrefixedOpcode::LocAlloc,
        0x11 => PrefixedOpcode::EndFilter,
        0x12 => PrefixedOpcode::Unaligned(r.u8()?),
        0x13 => PrefixedOpcode::Volatile,
        0x14 => PrefixedOpcode::Tail,
        0x15 => PrefixedOpcode::InitObj(r.token()?),
        0x16 => PrefixedOpcode::Constrained(r.token()?),
        0x17 => PrefixedOpcode::CpBlk,
        0x18 => PrefixedOpcode::InitBlk,
        0x19 => PrefixedOpcode::No(r.u8()?),
        0x1A => PrefixedOpcode::Rethrow,
        0x1C => PrefixedOpcode::SizeOf(r.token()?),
        0x1D => PrefixedOpcode::RefAnyType,
        0x1E => PrefixedOpcode::ReadOnly,
        b => {
            return Err(DecodeError::UnknownPrefixedOpcode {
                offset: r.start,
                byte: b,
            })
        }
    };
    Ok((Opcode::Prefixed(op), r.pos))
}

/// Reads the `index`th target of a `switch` whose table starts at `table`
/// and whose instruction ends at `next`.
pub fn switch_target(code: &[u8], table: u32, index: u32, next: usize) -> Option<u32> {
    let at = table as usize + index as usize * 4;
    let bytes: [u8; 4] = code.get(at..at + 4)?.try_into().ok()?;
    Some((next as i64 + i32::from_le_bytes(bytes) as i64) as u32)
}

/// Whether the body contains a backward branch.
pub fn may_have_loop(code: &[u8]) -> bool {
    let mut offset = 0;
    while offset < code.len() {
        let Ok((op, next)) = decode(code, offset) else {
            return false;
        };
        match op {
            Opcode::Branch(_, target) | Opcode::Leave(target) if (target as usize) <= offset => {
                return true;
            }
            Opcode::Switch { count, table } => {
                for i in 0..count {
                    if matches!(switch_target(code, table, i, next), Some(t) if (t as usize) <= offset)
                    {
                        return true;
                    }
                }
            }
            _ => {}
        }
        offset = next;
    }
    false
}

/// Decodes a whole body for display purposes.
pub fn disassemble(code: &[u8]) -> Result<Vec<(usize, Opcode)>, DecodeError> {
    let mut out = vec![];
    let mut offset = 0;
    while offset < code.len() {
        let (op, next) = decode(code, offset)?;
        out.push((offset, op));
        offset = next;
    }
    Ok(out)
}

/// Appends the encoding of `op`. Branch and leave targets are absolute and
/// always use the long form.
pub fn encode(op: Opcode, out: &mut Vec<u8>) {
    let token = |out: &mut Vec<u8>, byte: u8, t: Token| {
        out.push(byte);
        out.extend_from_slice(&t.to_le_bytes());
    };
    let var = |out: &mut Vec<u8>, short: u8, long: u8, index: u16| {
        if index <= u8::MAX as u16 {
            out.push(short);
            out.push(index as u8);
        } else {
            out.extend_from_slice(&[0xFE, long]);
            out.extend_from_slice(&index.to_le_bytes());
        }
    };
    let relative = |out: &mut Vec<u8>, byte: u8, target: u32| {
        out.push(byte);
        let end = out.len() as i64 + 4;
        out.extend_from_slice(&((target as i64 - end) as i32).to_le_bytes());
    };
    match op {
        Opcode::Nop => out.push(0x00),
        Opcode::Break => out.push(0x01),
        Opcode::LdArg(i) if i < 4 => out.push(0x02 + i as u8),
        Opcode::LdArg(i) => var(out, 0x0E, 0x09, i),
        Opcode::LdArgA(i) => var(out, 0x0F, 0x0A, i),
        Opcode::StArg(i) => var(out, 0x10, 0x0B, i),
        Opcode::LdLoc(i) if i < 4 => out.push(0x06 + i as u8),
        Opcode::LdLoc(i) => var(out, 0x11, 0x0C, i),
        Opcode::LdLocA(i) => var(out, 0x12, 0x0D, i),
        Opcode::StLoc(i) if i < 4 => out.push(0x0A + i as u8),
        Opcode::StLoc(i) => var(out, 0x13, 0x0E, i),
        Opcode::LdNull => out.push(0x14),
        Opcode::LdcI4(v @ -1..=8) => out.push((0x16 + v) as u8),
        Opcode::LdcI4(v @ -128..=127) => out.extend_from_slice(&[0x1F, v as i8 as u8]),
        Opcode::LdcI4(v) => {
            out.push(0x20);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Opcode::LdcI8(v) => {
            out.push(0x21);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Opcode::LdcR4(v) => {
            out.push(0x22);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Opcode::LdcR8(v) => {
            out.push(0x23);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Opcode::Dup => out.push(0x25),
        Opcode::Pop => out.push(0x26),
        Opcode::Jmp(t) => token(out, 0x27, t),
        Opcode::Call(t) => token(out, 0x28, t),
        Opcode::CallI(t) => token(out, 0x29, t),
        Opcode::Ret => out.push(0x2A),
        Opcode::Branch(kind, target) => {
            let long = BRANCHES
                .iter()
                .find(|(_, _, k)| *k == kind)
                .map(|(_, l, _)| *l)
                .unwrap_or(0x38);
            relative(out, long, target)
        }
        Opcode::Switch { .. } => {
            // Switch tables are emitted by the builder, which knows the targets.
            out.extend_from_slice(&[0x45, 0, 0, 0, 0]);
        }
        Opcode::LdInd(k) => out.push(lookup(&LDIND, k)),
        Opcode::StInd(k) => out.push(lookup(&STIND, k)),
        Opcode::Binary(BinaryOp::SubOvfUn) => out.push(0xDB),
        Opcode::Binary(b) => out.push(
            BINARY
                .iter()
                .find(|(_, x)| *x == b)
                .map(|(byte, _)| *byte)
                .unwrap_or(0x00),
        ),
        Opcode::Shift(ShiftOp::Left) => out.push(0x62),
        Opcode::Shift(ShiftOp::Right) => out.push(0x63),
        Opcode::Shift(ShiftOp::RightUnsigned) => out.push(0x64),
        Opcode::Neg => out.push(0x65),
        Opcode::Not => out.push(0x66),
        Opcode::Conv(k, m) => out.push(
            CONV.iter()
                .find(|(_, x, y)| *x == k && *y == m)
                .map(|(byte, _, _)| *byte)
                .unwrap_or(0x00),
        ),
        Opcode::CallVirt(t) => token(out, 0x6F, t),
        Opcode::CpObj(t) => token(out, 0x70, t),
        Opcode::LdObj(t) => token(out, 0x71, t),
        Opcode::LdStr(t) => token(out, 0x72, t),
        Opcode::NewObj(t) => token(out, 0x73, t),
        Opcode::CastClass(t) => token(out, 0x74, t),
        Opcode::IsInst(t) => token(out, 0x75, t),
        Opcode::Unbox(t) => token(out, 0x79, t),
        Opcode::Throw => out.push(0x7A),
        Opcode::LdFld(t) => token(out, 0x7B, t),
        Opcode::LdFldA(t) => token(out, 0x7C, t),
        Opcode::StFld(t) => token(out, 0x7D, t),
        Opcode::LdSFld(t) => token(out, 0x7E, t),
        Opcode::LdSFldA(t) => token(out, 0x7F, t),
        Opcode::StSFld(t) => token(out, 0x80, t),
        Opcode::StObj(t) => token(out, 0x81, t),
        Opcode::Box(t) => token(out, 0x8C, t),
        Opcode::NewArr(t) => token(out, 0x8D, t),
        Opcode::LdLen => out.push(0x8E),
        Opcode::LdElemA(t) => token(out, 0x8F, t),
        Opcode::LdElem(ElementType::Primitive(k)) => out.push(lookup(&LDELEM, k)),
        Opcode::LdElem(ElementType::Token(t)) => token(out, 0xA3, t),
        Opcode::StElem(ElementType::Primitive(k)) => out.push(lookup(&STELEM, k)),
        Opcode::StElem(ElementType::Token(t)) => token(out, 0xA4, t),
        Opcode::UnboxAny(t) => token(out, 0xA5, t),
        Opcode::RefAnyVal(t) => token(out, 0xC2, t),
        Opcode::CkFinite => out.push(0xC3),
        Opcode::MkRefAny(t) => token(out, 0xC6, t),
        Opcode::LdToken(t) => token(out, 0xD0, t),
        Opcode::EndFinally => out.push(0xDC),
        Opcode::Leave(target) => relative(out, 0xDD, target),
        Opcode::Prefixed(p) => {
            out.push(0xFE);
            match p {
                PrefixedOpcode::ArgList => out.push(0x00),
                PrefixedOpcode::Ceq => out.push(0x01),
                PrefixedOpcode::Cgt => out.push(0x02),
                PrefixedOpcode::CgtUn => out.push(0x03),
                PrefixedOpcode::Clt => out.push(0x04),
                PrefixedOpcode::CltUn => out.push(0x05),
                PrefixedOpcode::LdFtn(t) => token(out, 0x06, t),
                PrefixedOpcode::LdVirtFtn(t) => token(out, 0x07, t),
                PrefixedOpcode::LocAlloc => out.push(0x0F),
                PrefixedOpcode::EndFilter => out.push(0x11),
                PrefixedOpcode::Unaligned(a) => out.extend_from_slice(&[0x12, a]),
                PrefixedOpcode::Volatile => out.push(0x13),
                PrefixedOpcode::Tail => out.push(0x14),
                PrefixedOpcode::InitObj(t) => token(out, 0x15, t),
                PrefixedOpcode::Constrained(t) => token(out, 0x16, t),
                PrefixedOpcode::CpBlk => out.push(0x17),
                PrefixedOpcode::InitBlk => out.push(0x18),
                PrefixedOpcode::No(f) => out.extend_from_slice(&[0x19, f]),
                PrefixedOpcode::Rethrow => out.push(0x1A),
                PrefixedOpcode::SizeOf(t) => token(out, 0x1C, t),
                PrefixedOpcode::RefAnyType => out.push(0x1D),
                PrefixedOpcode::ReadOnly => out.push(0x1E),
            }
        }
    }
}

fn lookup(table: &[(u8, PrimitiveKind)], kind: PrimitiveKind) -> u8 {
    table
        .iter()
        .find(|(_, k)| *k == kind)
        .map(|(b, _)| *b)
        .unwrap_or(0x00)
}

impl Opcode {
    pub fn mnemonic(&self) -> &'static str {
        use Opcode::*;
        match self {
            Nop => "nop",
            Break => "break",
            LdArg(_) => "ldarg",
            LdArgA(_) => "ldarga",
            StArg(_) => "starg",
            LdLoc(_) => "ldloc",
            LdLocA(_) => "ldloca",
            StLoc(_) => "stloc",
            LdNull => "ldnull",
            LdcI4(_) => "ldc.i4",
            LdcI8(_) => "ldc.i8",
            LdcR4(_) => "ldc.r4",
            LdcR8(_) => "ldc.r8",
            Dup => "dup",
            Pop => "pop",
            Jmp(_) => "jmp",
            Call(_) => "call",
            CallI(_) => "calli",
            Ret => "ret",
            Branch(kind, _) => match kind {
                BranchKind::Always => "br",
                BranchKind::False => "brfalse",
                BranchKind::True => "brtrue",
                BranchKind::Eq => "beq",
                BranchKind::Ge => "bge",
                BranchKind::Gt => "bgt",
                BranchKind::Le => "ble",
                BranchKind::Lt => "blt",
                BranchKind::NeUn => "bne.un",
                BranchKind::GeUn => "bge.un",
                BranchKind::GtUn => "bgt.un",
                BranchKind::LeUn => "ble.un",
                BranchKind::LtUn => "blt.un",
            },
            Switch { .. } => "switch",
            LdInd(_) => "ldind",
            StInd(_) => "stind",
            Binary(op) => op.mnemonic(),
            Shift(ShiftOp::Left) => "shl",
            Shift(ShiftOp::Right) => "shr",
            Shift(ShiftOp::RightUnsigned) => "shr.un",
            Neg => "neg",
            Not => "not",
            Conv(_, ConvMode::Unchecked) => "conv",
            Conv(_, ConvMode::UnsignedToFloat) => "conv.r.un",
            Conv(_, ConvMode::Overflow) => "conv.ovf",
            Conv(_, ConvMode::OverflowUnsigned) => "conv.ovf.un",
            CallVirt(_) => "callvirt",
            CpObj(_) => "cpobj",
            LdObj(_) => "ldobj",
            LdStr(_) => "ldstr",
            NewObj(_) => "newobj",
            CastClass(_) => "castclass",
            IsInst(_) => "isinst",
            Unbox(_) => "unbox",
            Throw => "throw",
            LdFld(_) => "ldfld",
            LdFldA(_) => "ldflda",
            StFld(_) => "stfld",
            LdSFld(_) => "ldsfld",
            LdSFldA(_) => "ldsflda",
            StSFld(_) => "stsfld",
            StObj(_) => "stobj",
            Box(_) => "box",
            NewArr(_) => "newarr",
            LdLen => "ldlen",
            LdElemA(_) => "ldelema",
            LdElem(_) => "ldelem",
            StElem(_) => "stelem",
            UnboxAny(_) => "unbox.any",
            RefAnyVal(_) => "refanyval",
            CkFinite => "ckfinite",
            MkRefAny(_) => "mkrefany",
            LdToken(_) => "ldtoken",
            EndFinally => "endfinally",
            Leave(_) => "leave",
            Prefixed(p) => match p {
                PrefixedOpcode::ArgList => "arglist",
                PrefixedOpcode::Ceq => "ceq",
                PrefixedOpcode::Cgt => "cgt",
                PrefixedOpcode::CgtUn => "cgt.un",
                PrefixedOpcode::Clt => "clt",
                PrefixedOpcode::CltUn => "clt.un",
                PrefixedOpcode::LdFtn(_) => "ldftn",
                PrefixedOpcode::LdVirtFtn(_) => "ldvirtftn",
                PrefixedOpcode::LocAlloc => "localloc",
                PrefixedOpcode::EndFilter => "endfilter",
                PrefixedOpcode::Unaligned(_) => "unaligned.",
                PrefixedOpcode::Volatile => "volatile.",
                PrefixedOpcode::Tail => "tail.",
                PrefixedOpcode::InitObj(_) => "initobj",
                PrefixedOpcode::Constrained(_) => "constrained.",
                PrefixedOpcode::CpBlk => "cpblk",
                PrefixedOpcode::InitBlk => "initblk",
                PrefixedOpcode::No(_) => "no.",
                PrefixedOpcode::Rethrow => "rethrow",
                PrefixedOpcode::SizeOf(_) => "sizeof",
                PrefixedOpcode::RefAnyType => "refanytype",
                PrefixedOpcode::ReadOnly => "readonly.",
            },
        }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use Opcode::*;
        let name = self.mnemonic();
        match *self {
            LdArg(i) | LdArgA(i) | StArg(i) | LdLoc(i) | LdLocA(i) | StLoc(i) => {
                write!(f, "{} {}", name, i)
            }
            LdcI4(v) => write!(f, "{} {}", name, v),
            LdcI8(v) => write!(f, "{} {}", name, v),
            LdcR4(v) => write!(f, "{} {}", name, v),
            LdcR8(v) => write!(f, "{} {}", name, v),
            Branch(_, t) | Leave(t) => write!(f, "{} IL_{:04x}", name, t),
            Switch { count, .. } => write!(f, "{} ({} targets)", name, count),
            LdInd(k) | StInd(k) | Conv(k, _) => write!(f, "{}.{}", name, k),
            LdElem(ElementType::Primitive(k)) | StElem(ElementType::Primitive(k)) => {
                write!(f, "{}.{}", name, k)
            }
            Jmp(t) | Call(t) | CallI(t) | CallVirt(t) | CpObj(t) | LdObj(t) | LdStr(t)
            | NewObj(t) | CastClass(t) | IsInst(t) | Unbox(t) | LdFld(t) | LdFldA(t)
            | StFld(t) | LdSFld(t) | LdSFldA(t) | StSFld(t) | StObj(t) | Box(t) | NewArr(t)
            | LdElemA(t) | UnboxAny(t) | RefAnyVal(t) | MkRefAny(t) | LdToken(t)
            | LdElem(ElementType::Token(t)) | StElem(ElementType::Token(t)) => {
                write!(f, "{} {:#010x}", name, t)
            }
            Prefixed(
                PrefixedOpcode::LdFtn(t)
                | PrefixedOpcode::LdVirtFtn(t)
                | PrefixedOpcode::InitObj(t)
                | PrefixedOpcode::Constrained(t)
                | PrefixedOpcode::SizeOf(t),
            ) => write!(f, "{} {:#010x}", name, t),
            _ => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_short_and_long_forms_alike() {
        // ldarg.0; ldarg.s 1; ldarg 2 (0xFE 0x09); ret
        let code = [0x02, 0x0E, 0x01, 0xFE, 0x09, 0x02, 0x00, 0x2A];
        let ops: Vec<_> = disassemble(&code).unwrap().into_iter().map(|(_, o)| o).collect();
        assert_eq!(
            ops,
            vec![Opcode::LdArg(0), Opcode::LdArg(1), Opcode::LdArg(2), Opcode::Ret]
        );
    }

    #[test]
    fn branch_targets_are_absolute() {
        // 0: br.s +1 ; 2: nop ; 3: ret
        let code = [0x2B, 0x01, 0x00, 0x2A];
        assert_eq!(
            decode(&code, 0).unwrap(),
            (Opcode::Branch(BranchKind::Always, 3), 2)
        );
        let mut out = vec![];
        encode(Opcode::Branch(BranchKind::Lt, 0), &mut out);
        assert_eq!(decode(&out, 0).unwrap().0, Opcode::Branch(BranchKind::Lt, 0));
        assert!(may_have_loop(&out));
        assert!(!may_have_loop(&code));
    }

    #[test]
    fn prefixed_opcodes_nest() {
        assert_eq!(
            decode(&[0xFE, 0x01], 0).unwrap().0,
            Opcode::Prefixed(PrefixedOpcode::Ceq)
        );
        assert_eq!(
            decode(&[0xFE, 0x11], 0).unwrap().0,
            Opcode::Prefixed(PrefixedOpcode::EndFilter)
        );
    }

    #[test]
    fn unknown_and_truncated() {
        assert_eq!(
            decode(&[0x24], 0),
            Err(DecodeError::UnknownOpcode { offset: 0, byte: 0x24 })
        );
        assert_eq!(
            decode(&[0xFE, 0x08], 0),
            Err(DecodeError::UnknownPrefixedOpcode { offset: 0, byte: 0x08 })
        );
        assert_eq!(decode(&[0x20, 0x01], 0), Err(DecodeError::Truncated(0)));
    }

    #[test]
    fn conversions_and_elements_encode_back() {
        for op in [
            Opcode::Conv(PrimitiveKind::I8, ConvMode::Unchecked),
            Opcode::Conv(PrimitiveKind::U1, ConvMode::OverflowUnsigned),
            Opcode::Conv(PrimitiveKind::NativeUInt, ConvMode::Unchecked),
            Opcode::LdElem(ElementType::Primitive(PrimitiveKind::Object)),
            Opcode::StInd(PrimitiveKind::NativeInt),
            Opcode::Binary(BinaryOp::SubOvfUn),
            Opcode::LdcI4(-1),
            Opcode::LdcI4(100),
            Opcode::LdcI4(100_000),
        ] {
            let mut out = vec![];
            encode(op, &mut out);
            assert_eq!(decode(&out, 0).unwrap(), (op, out.len()), "{op}");
        }
    }
}
