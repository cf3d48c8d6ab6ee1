use super::*;
use crate::types::FlatField;

/// RISC-V LP64D: eight integer and eight float argument registers. Floats
/// fall back to integer registers once the float registers run out, and a
/// two-slot aggregate may straddle the last integer register and the stack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiscV64;

impl RiscV64 {
    /// Structs of one float, two floats, or one float and one integer are
    /// passed field by field in registers.
    fn float_fields(info: &TypeInfo) -> Option<&[FlatField]> {
        let fields = info.fields.as_slice();
        let floats = fields.iter().filter(|f| f.kind.is_float()).count();
        match (fields.len(), floats) {
            (1, 1) | (2, 1) | (2, 2) => Some(fields),
            _ => None,
        }
    }
}

impl CallingConvention for RiscV64 {
    fn name(&self) -> &'static str {
        "riscv64"
    }

    fn int_arg_registers(&self) -> u8 {
        8
    }

    fn fp_arg_registers(&self) -> u8 {
        8
    }

    fn int_reg_name(&self, reg: u8) -> &'static str {
        ["a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7"][reg as usize]
    }

    fn fp_reg_name(&self, reg: u8) -> String {
        format!("fa{}", reg)
    }

    fn classify_args(&self, sig: &NativeSignature) -> Result<ArgLayout, UnimplementedError> {
        sig.check_supported(self.name())?;

        let ret = match &sig.ret {
            None => ReturnPlacement::Void,
            Some(ArgClass::Int { .. }) => ReturnPlacement::Scalar(ReturnSource::IntReg(0)),
            Some(ArgClass::Float { .. }) => ReturnPlacement::Scalar(ReturnSource::FpReg(0)),
            Some(ArgClass::Struct(info)) if info.size > 2 * SLOT_SIZE => ReturnPlacement::Buffer,
            Some(ArgClass::Struct(info)) => {
                let parts = match Self::float_fields(info) {
                    Some(fields) => {
                        let (mut int, mut fp) = (0, 0);
                        fields
                            .iter()
                            .map(|f| {
                                let source = if f.kind.is_float() {
                                    fp += 1;
                                    ReturnSource::FpReg(fp - 1)
                                } else {
                                    int += 1;
                                    ReturnSource::IntReg(int - 1)
                                };
                                (source, f.offset, f.kind.size() as u32)
                            })
                            .collect()
                    }
                    None => (0..align_up(info.size, SLOT_SIZE) / SLOT_SIZE)
                        .map(|i| {
                            let size = (info.size - i * SLOT_SIZE).min(SLOT_SIZE) as u32;
                            (ReturnSource::IntReg(i as u8), (i * SLOT_SIZE) as u32, size)
                        })
                        .collect(),
                };
                ReturnPlacement::Registers {
                    size: info.size,
                    parts,
                }
            }
        };

        let mut state = ArgState::new(8, 8);
        let mut args = vec![];
        for (role, class) in sig.canonical_args(ret == ReturnPlacement::Buffer) {
            let variadic = matches!(role, ArgRole::Param(i) if sig.is_variadic(i as usize));
            let arg = ArgPlacement::new(role, class.clone());
            let size = class.size() as u32;
            let int_or_stack = |state: &mut ArgState, arg: ArgPlacement| match state.take_int(1, false) {
                Some(r) => arg.part(ArgSource::IntReg(r), 0, size),
                None => arg.part(ArgSource::Stack(state.take_stack(8, 8)), 0, size),
            };
            let arg = match &class {
                ArgClass::Int { .. } => int_or_stack(&mut state, arg),
                ArgClass::Float { .. } if variadic => int_or_stack(&mut state, arg),
                ArgClass::Float { .. } => match state.take_fp(1) {
                    Some(r) => arg.part(ArgSource::FpReg(r), 0, size),
                    None => int_or_stack(&mut state, arg),
                },
                ArgClass::Struct(info) if info.size > 2 * SLOT_SIZE => {
                    let mut arg = match state.take_int(1, false) {
                        Some(r) => arg.part(ArgSource::IntReg(r), 0, SLOT_SIZE as u32),
                        None => arg.part(ArgSource::Stack(state.take_stack(8, 8)), 0, 8),
                    };
                    arg.by_reference = true;
                    arg
                }
                ArgClass::Struct(info) => {
                    let fields = Self::float_fields(info).filter(|fields| {
                        let floats = fields.iter().filter(|f| f.kind.is_float()).count() as u8;
                        let ints = fields.len() as u8 - floats;
                        !variadic && floats <= state.fp_remaining() && ints <= state.int_remaining()
                    });
                    match fields {
                        Some(fields) => fields.iter().fold(arg, |arg, f| {
                            let source = if f.kind.is_float() {
                                ArgSource::FpReg(state.take_fp(1).unwrap_or_default())
                            } else {
                                ArgSource::IntReg(state.take_int(1, false).unwrap_or_default())
                            };
                            arg.part(source, f.offset, f.kind.size() as u32)
                        }),
                        None => {
                            let slots = (align_up(info.size, SLOT_SIZE) / SLOT_SIZE) as u8;
                            let pair_aligned = info.alignment >= 2 * SLOT_SIZE;
                            match state.take_int(slots, pair_aligned) {
                                Some(first) => (0..slots).fold(arg, |arg, i| {
                                    let offset = i as usize * SLOT_SIZE;
                                    let size = (info.size - offset).min(SLOT_SIZE) as u32;
                                    arg.part(ArgSource::IntReg(first + i), offset as u32, size)
                                }),
                                None if slots == 2 && state.int_remaining() == 1 && !pair_aligned => {
                                    let last = state.take_int(1, false).unwrap_or_default();
                                    let stack = state.take_stack(8, 8);
                                    arg.part(ArgSource::IntReg(last), 0, SLOT_SIZE as u32).part(
                                        ArgSource::Stack(stack),
                                        SLOT_SIZE as u32,
                                        (info.size - SLOT_SIZE) as u32,
                                    )
                                }
                                None => {
                                    let offset = state.take_stack(info.size, info.alignment);
                                    arg.part(ArgSource::Stack(offset), 0, size)
                                }
                            }
                        }
                    }
                }
            };
            args.push(arg);
        }

        let mut layout = ArgLayout {
            target: self.name(),
            args,
            ret,
            block_size: 0,
            stack_size: state.stack_used as usize,
            args_in_caller_frame: false,
        };
        layout.pack_sequential();
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{callconv::test_support::*, types::PrimitiveKind};

    #[test]
    fn floats_fall_back_to_integer_registers() {
        let mut sig = ints(0);
        sig.params = vec![ArgClass::Float { size: 8 }; 9];
        let layout = RiscV64.classify_args(&sig).unwrap();
        assert_eq!(layout.args[7].parts[0].source, ArgSource::FpReg(7));
        assert_eq!(layout.args[8].parts[0].source, ArgSource::IntReg(0));
    }

    #[test]
    fn float_int_struct_uses_both_files() {
        let mut sig = ints(0);
        sig.params = vec![strukt(&[(0, PrimitiveKind::R4), (8, PrimitiveKind::I8)])];
        let layout = RiscV64.classify_args(&sig).unwrap();
        let sources: Vec<_> = layout.args[0].parts.iter().map(|p| p.source).collect();
        assert_eq!(sources, vec![ArgSource::FpReg(0), ArgSource::IntReg(0)]);
    }

    #[test]
    fn two_slot_struct_straddles_last_register() {
        let mut sig = ints(7);
        sig.params.push(strukt(&[(0, PrimitiveKind::I8), (8, PrimitiveKind::I8)]));
        let layout = RiscV64.classify_args(&sig).unwrap();
        let parts = &layout.args[7].parts;
        assert_eq!(parts[0].source, ArgSource::IntReg(7));
        assert_eq!(parts[1].source, ArgSource::Stack(0));
        assert_eq!(parts[1].offset, 8);
        assert_eq!(layout.stack_size, 8);
    }
}
