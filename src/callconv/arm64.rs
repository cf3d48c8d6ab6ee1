use super::*;

/// AAPCS64 as used by the runtime on Linux and Windows: eight integer and
/// eight SIMD registers, homogeneous float aggregates in SIMD registers,
/// and the return buffer in the dedicated x8.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arm64;

impl Arm64 {
    fn struct_return(info: &TypeInfo) -> ReturnPlacement {
        if let Some((kind, count)) = info.hfa() {
            let size = kind.size() as u32;
            return ReturnPlacement::Registers {
                size: info.size,
                parts: (0..count as u32)
                    .map(|i| (ReturnSource::FpReg(i as u8), i * size, size))
                    .collect(),
            };
        }
        if info.size > 2 * SLOT_SIZE {
            return ReturnPlacement::Buffer;
        }
        let slots = align_up(info.size, SLOT_SIZE) / SLOT_SIZE;
        ReturnPlacement::Registers {
            size: info.size,
            parts: (0..slots)
                .map(|i| {
                    let size = (info.size - i * SLOT_SIZE).min(SLOT_SIZE) as u32;
                    (ReturnSource::IntReg(i as u8), (i * SLOT_SIZE) as u32, size)
                })
                .collect(),
        }
    }
}

impl CallingConvention for Arm64 {
    fn name(&self) -> &'static str {
        "arm64"
    }

    fn int_arg_registers(&self) -> u8 {
        8
    }

    fn fp_arg_registers(&self) -> u8 {
        8
    }

    fn int_reg_name(&self, reg: u8) -> &'static str {
        ["x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7"][reg as usize]
    }

    fn fp_reg_name(&self, reg: u8) -> String {
        format!("v{}", reg)
    }

    fn classify_args(&self, sig: &NativeSignature) -> Result<ArgLayout, UnimplementedError> {
        sig.check_supported(self.name())?;

        let ret = match &sig.ret {
            None => ReturnPlacement::Void,
            Some(ArgClass::Int { .. }) => ReturnPlacement::Scalar(ReturnSource::IntReg(0)),
            Some(ArgClass::Float { .. }) => ReturnPlacement::Scalar(ReturnSource::FpReg(0)),
            Some(ArgClass::Struct(info)) => Self::struct_return(info),
        };

        let mut state = ArgState::new(8, 8);
        let mut args = vec![];
        for (role, class) in sig.canonical_args(ret == ReturnPlacement::Buffer) {
            let arg = ArgPlacement::new(role, class.clone());
            let size = class.size() as u32;
            let arg = match (&class, role) {
                (_, ArgRole::RetBuf) => arg.part(ArgSource::RetBufReg, 0, SLOT_SIZE as u32),
                (ArgClass::Int { .. }, _) => match state.take_int(1, false) {
                    Some(r) => arg.part(ArgSource::IntReg(r), 0, size),
                    None => arg.part(ArgSource::Stack(state.take_stack(8, 8)), 0, size),
                },
                (ArgClass::Float { .. }, _) => match state.take_fp(1) {
                    Some(r) => arg.part(ArgSource::FpReg(r), 0, size),
                    None => arg.part(ArgSource::Stack(state.take_stack(8, 8)), 0, size),
                },
                (ArgClass::Struct(info), _) => match info.hfa() {
                    Some((kind, count)) => match state.take_fp(count as u8) {
                        Some(first) => {
                            let element = kind.size() as u32;
                            (0..count as u8).fold(arg, |arg, i| {
                                arg.part(ArgSource::FpReg(first + i), i as u32 * element, element)
                            })
                        }
                        None => {
                            // Once an aggregate spills, no later float uses a register.
                            state.exhaust_fp();
                            let offset = state.take_stack(info.size, info.alignment);
                            arg.part(ArgSource::Stack(offset), 0, size)
                        }
                    },
                    None if info.size > 2 * SLOT_SIZE => {
                        let mut arg = match state.take_int(1, false) {
                            Some(r) => arg.part(ArgSource::IntReg(r), 0, SLOT_SIZE as u32),
                            None => arg.part(ArgSource::Stack(state.take_stack(8, 8)), 0, 8),
                        };
                        arg.by_reference = true;
                        arg
                    }
                    None => {
                        let slots = (align_up(info.size, SLOT_SIZE) / SLOT_SIZE) as u8;
                        let pair_aligned = info.alignment >= 2 * SLOT_SIZE;
                        match state.take_int(slots, pair_aligned) {
                            Some(first) => (0..slots).fold(arg, |arg, i| {
                                let offset = i as usize * SLOT_SIZE;
                                let size = (info.size - offset).min(SLOT_SIZE) as u32;
                                arg.part(ArgSource::IntReg(first + i), offset as u32, size)
                            }),
                            None => {
                                state.exhaust_int();
                                let offset = state.take_stack(info.size, info.alignment);
                                arg.part(ArgSource::Stack(offset), 0, size)
                            }
                        }
                    }
                },
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
    fn hfa_uses_consecutive_simd_registers() {
        let mut sig = ints(0);
        sig.params = vec![
            ArgClass::Float { size: 8 },
            strukt(&[(0, PrimitiveKind::R4), (4, PrimitiveKind::R4), (8, PrimitiveKind::R4)]),
        ];
        let layout = Arm64.classify_args(&sig).unwrap();
        let sources: Vec<_> = layout.args[1].parts.iter().map(|p| p.source).collect();
        assert_eq!(
            sources,
            vec![ArgSource::FpReg(1), ArgSource::FpReg(2), ArgSource::FpReg(3)]
        );
        assert_eq!(layout.args[1].parts[2].offset, 8);
    }

    #[test]
    fn hfa_spill_blocks_later_float_registers() {
        let mut sig = ints(0);
        sig.params = vec![ArgClass::Float { size: 8 }; 6];
        sig.params.push(strukt(&[
            (0, PrimitiveKind::R8),
            (8, PrimitiveKind::R8),
            (16, PrimitiveKind::R8),
        ]));
        sig.params.push(ArgClass::Float { size: 8 });
        let layout = Arm64.classify_args(&sig).unwrap();
        assert_eq!(layout.args[6].parts[0].source, ArgSource::Stack(0));
        assert_eq!(layout.args[7].parts[0].source, ArgSource::Stack(24));
    }

    #[test]
    fn large_struct_by_reference_and_retbuf_in_x8() {
        let big = strukt(&[(0, PrimitiveKind::I8), (8, PrimitiveKind::I8), (16, PrimitiveKind::I4)]);
        let mut sig = ints(0);
        sig.params = vec![big.clone()];
        sig.ret = Some(big);
        let layout = Arm64.classify_args(&sig).unwrap();
        assert_eq!(layout.args[0].parts[0].source, ArgSource::RetBufReg);
        assert!(layout.args[1].by_reference);
        assert_eq!(layout.args[1].parts[0].source, ArgSource::IntReg(0));
    }

    #[test]
    fn hfa_return_in_simd_registers() {
        let mut sig = ints(0);
        sig.ret = Some(strukt(&[(0, PrimitiveKind::R8), (8, PrimitiveKind::R8)]));
        let layout = Arm64.classify_args(&sig).unwrap();
        assert_eq!(
            layout.ret,
            ReturnPlacement::Registers {
                size: 16,
                parts: vec![(ReturnSource::FpReg(0), 0, 8), (ReturnSource::FpReg(1), 8, 8)]
            }
        );
    }
}
