use super::{ArithmeticError, StackValue};
use crate::types::PrimitiveKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvMode {
    /// `conv.*`: truncate or saturate silently.
    Unchecked,
    /// `conv.ovf.*`: the source is read as signed.
    Overflow,
    /// `conv.ovf.*.un`: the source integer is read as unsigned.
    OverflowUnsigned,
    /// `conv.r.un`: the source integer is read as unsigned.
    UnsignedToFloat,
}

fn target_range(target: PrimitiveKind) -> (i128, i128) {
    use PrimitiveKind::*;
    match target {
        I1 => (i8::MIN as i128, i8::MAX as i128),
        U1 | Bool => (0, u8::MAX as i128),
        I2 => (i16::MIN as i128, i16::MAX as i128),
        U2 | Char => (0, u16::MAX as i128),
        I4 => (i32::MIN as i128, i32::MAX as i128),
        U4 => (0, u32::MAX as i128),
        I8 | NativeInt => (i64::MIN as i128, i64::MAX as i128),
        U8 | NativeUInt | Ptr => (0, u64::MAX as i128),
        _ => (i128::MIN, i128::MAX),
    }
}

/// Integer result of a conversion, stack-normalized for `target`.
fn narrow(value: i128, target: PrimitiveKind) -> StackValue {
    use PrimitiveKind::*;
    match target {
        I1 => StackValue::Int32(value as i8 as i32),
        U1 | Bool => StackValue::Int32(value as u8 as i32),
        I2 => StackValue::Int32(value as i16 as i32),
        U2 | Char => StackValue::Int32(value as u16 as i32),
        I4 | U4 => StackValue::Int32(value as i32),
        I8 | U8 => StackValue::Int64(value as i64),
        _ => StackValue::NativeInt(value as isize),
    }
}

/// Implements the `conv.*`, `conv.ovf.*` and `conv.r.un` families.
pub fn convert(
    value: StackValue,
    target: PrimitiveKind,
    mode: ConvMode,
) -> Result<StackValue, ArithmeticError> {
    let unsigned_source = matches!(mode, ConvMode::OverflowUnsigned | ConvMode::UnsignedToFloat);
    let integer = match value {
        StackValue::Int32(i) if unsigned_source => Some(i as u32 as i128),
        StackValue::Int32(i) => Some(i as i128),
        StackValue::Int64(i) if unsigned_source => Some(i as u64 as i128),
        StackValue::Int64(i) => Some(i as i128),
        StackValue::NativeInt(i) if unsigned_source => Some(i as usize as i128),
        StackValue::NativeInt(i) => Some(i as i128),
        StackValue::ManagedPtr(p) => Some(p as i128),
        StackValue::Float(_) | StackValue::Double(_) => None,
        StackValue::ObjectRef(_) => return Err(ArithmeticError::InvalidOperand(value.kind())),
    };

    if target.is_float() {
        let f = match integer {
            Some(i) => i as f64,
            None => value.as_f64(),
        };
        return Ok(match target {
            PrimitiveKind::R4 => StackValue::Float(f as f32),
            _ => StackValue::Double(match value {
                // Widening a float must not pick up double-rounding noise.
                StackValue::Float(f) => f as f64,
                _ => f,
            }),
        });
    }

    if !target.is_integer() {
        return Err(ArithmeticError::InvalidOperand(target));
    }

    let checked = matches!(mode, ConvMode::Overflow | ConvMode::OverflowUnsigned);
    let (min, max) = target_range(target);
    let integral = match integer {
        Some(i) => i,
        None => {
            let f = value.as_f64().trunc();
            if checked {
                if f.is_nan() || f < min as f64 - 1.0 || f > max as f64 + 1.0 {
                    return Err(ArithmeticError::Overflow);
                }
                f as i128
            } else if target_range(target).0 == 0 {
                // Unsigned targets saturate through u64 so large doubles keep their bits.
                f as u64 as i128
            } else {
                f as i64 as i128
            }
        }
    };
    if checked && (integral < min || integral > max) {
        return Err(ArithmeticError::Overflow);
    }
    Ok(narrow(integral, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use PrimitiveKind::*;

    #[test]
    fn unchecked_truncates() {
        assert_eq!(
            convert(StackValue::Int32(0x1ff), U1, ConvMode::Unchecked),
            Ok(StackValue::Int32(0xff))
        );
        assert_eq!(
            convert(StackValue::Int32(0x80), I1, ConvMode::Unchecked),
            Ok(StackValue::Int32(-128))
        );
        assert_eq!(
            convert(StackValue::Int32(-1), I8, ConvMode::Unchecked),
            Ok(StackValue::Int64(-1))
        );
        assert_eq!(
            convert(StackValue::Int32(-1), U8, ConvMode::Unchecked),
            Ok(StackValue::Int64(-1))
        );
        assert_eq!(
            convert(StackValue::Double(3.9), I4, ConvMode::Unchecked),
            Ok(StackValue::Int32(3))
        );
    }

    #[test]
    fn checked_conversions() {
        assert_eq!(
            convert(StackValue::Int32(300), U1, ConvMode::Overflow),
            Err(ArithmeticError::Overflow)
        );
        assert_eq!(
            convert(StackValue::Int32(-1), U4, ConvMode::Overflow),
            Err(ArithmeticError::Overflow)
        );
        assert_eq!(
            convert(StackValue::Int32(-1), I8, ConvMode::OverflowUnsigned),
            Ok(StackValue::Int64(u32::MAX as i64))
        );
        assert_eq!(
            convert(StackValue::Double(f64::NAN), I4, ConvMode::Overflow),
            Err(ArithmeticError::Overflow)
        );
        assert_eq!(
            convert(StackValue::Double(2147483647.5), I4, ConvMode::Overflow),
            Ok(StackValue::Int32(i32::MAX))
        );
    }

    #[test]
    fn unsigned_to_float() {
        assert_eq!(
            convert(StackValue::Int32(-1), R8, ConvMode::UnsignedToFloat),
            Ok(StackValue::Double(u32::MAX as f64))
        );
        assert_eq!(
            convert(StackValue::Int32(2), R4, ConvMode::Unchecked),
            Ok(StackValue::Float(2.0))
        );
    }
}
