use super::*;

const WIN64_INT_REGS: [&str; 4] = ["rcx", "rdx", "r8", "r9"];
const SYSV_INT_REGS: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];
const WIN64_HOME_AREA: usize = 32;

/// Microsoft x64: four positional slots shared by integer and floating
/// arguments, with a 32-byte home area the callee may spill them into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amd64Windows;

impl Amd64Windows {
    fn passes_by_value(size: usize) -> bool {
        matches!(size, 1 | 2 | 4 | 8)
    }
}

impl CallingConvention for Amd64Windows {
    fn name(&self) -> &'static str {
        "amd64-windows"
    }

    fn int_arg_registers(&self) -> u8 {
        4
    }

    fn fp_arg_registers(&self) -> u8 {
        4
    }

    fn int_reg_name(&self, reg: u8) -> &'static str {
        WIN64_INT_REGS[reg as usize]
    }

    fn fp_reg_name(&self, reg: u8) -> String {
        format!("xmm{}", reg)
    }

    fn classify_args(&self, sig: &NativeSignature) -> Result<ArgLayout, UnimplementedError> {
        sig.check_supported(self.name())?;

        let ret = match &sig.ret {
            None => ReturnPlacement::Void,
            Some(ArgClass::Int { .. }) => ReturnPlacement::Scalar(ReturnSource::IntReg(0)),
            Some(ArgClass::Float { .. }) => ReturnPlacement::Scalar(ReturnSource::FpReg(0)),
            Some(ArgClass::Struct(info)) if Self::passes_by_value(info.size) => {
                ReturnPlacement::Registers {
                    size: info.size,
                    parts: vec![(ReturnSource::IntReg(0), 0, info.size as u32)],
                }
            }
            Some(ArgClass::Struct(_)) => ReturnPlacement::Buffer,
        };

        let mut args = vec![];
        let canonical = sig.canonical_args(ret == ReturnPlacement::Buffer);
        for (position, (role, class)) in canonical.into_iter().enumerate() {
            let in_register = position < 4;
            let slot = if in_register {
                None
            } else {
                Some(ArgSource::Stack((WIN64_HOME_AREA + (position - 4) * SLOT_SIZE) as u32))
            };
            let mut arg = ArgPlacement::new(role, class.clone());
            let size = match &class {
                ArgClass::Struct(info) if !Self::passes_by_value(info.size) => {
                    arg.by_reference = true;
                    SLOT_SIZE
                }
                other => other.size(),
            } as u32;
            arg = match (slot, &class) {
                (Some(stack), _) => arg.part(stack, 0, size),
                (None, ArgClass::Float { .. }) if sig.is_vararg() => {
                    // Callees of vararg methods read floats from the integer registers.
                    arg.part(ArgSource::FpReg(position as u8), 0, size)
                        .part(ArgSource::IntReg(position as u8), 0, size)
                }
                (None, ArgClass::Float { .. }) => arg.part(ArgSource::FpReg(position as u8), 0, size),
                (None, _) => arg.part(ArgSource::IntReg(position as u8), 0, size),
            };
            // Register arguments are homed into the caller's 32-byte area, so
            // every argument lives at its positional stack slot.
            arg.offset = position * SLOT_SIZE;
            args.push(arg);
        }

        let stack_size = WIN64_HOME_AREA.max(args.len() * SLOT_SIZE);
        Ok(ArgLayout {
            target: self.name(),
            args,
            ret,
            block_size: stack_size,
            stack_size,
            args_in_caller_frame: true,
        })
    }
}

/// System V AMD64: six integer and eight SSE registers, small structs
/// split into eightbytes classified independently.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amd64SysV;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EightbyteClass {
    Integer,
    Sse,
}

impl Amd64SysV {
    /// Classifies each eightbyte of a struct of at most 16 bytes.
    fn eightbytes(info: &TypeInfo) -> Vec<EightbyteClass> {
        let count = align_up(info.size, SLOT_SIZE) / SLOT_SIZE;
        (0..count)
            .map(|i| {
                let (start, end) = ((i * SLOT_SIZE) as u32, ((i + 1) * SLOT_SIZE) as u32);
                let mut fields = info
                    .fields
                    .iter()
                    .filter(|f| f.offset >= start && f.offset < end)
                    .peekable();
                if fields.peek().is_some() && fields.all(|f| f.kind.is_float()) {
                    EightbyteClass::Sse
                } else {
                    EightbyteClass::Integer
                }
            })
            .collect()
    }

    fn eightbyte_size(info: &TypeInfo, index: usize) -> u32 {
        (info.size - index * SLOT_SIZE).min(SLOT_SIZE) as u32
    }
}

impl CallingConvention for Amd64SysV {
    fn name(&self) -> &'static str {
        "amd64-sysv"
    }

    fn int_arg_registers(&self) -> u8 {
        6
    }

    fn fp_arg_registers(&self) -> u8 {
        8
    }

    fn int_reg_name(&self, reg: u8) -> &'static str {
        SYSV_INT_REGS[reg as usize]
    }

    fn fp_reg_name(&self, reg: u8) -> String {
        format!("xmm{}", reg)
    }

    fn classify_args(&self, sig: &NativeSignature) -> Result<ArgLayout, UnimplementedError> {
        sig.check_supported(self.name())?;

        let ret = match &sig.ret {
            None => ReturnPlacement::Void,
            Some(ArgClass::Int { .. }) => ReturnPlacement::Scalar(ReturnSource::IntReg(0)),
            Some(ArgClass::Float { .. }) => ReturnPlacement::Scalar(ReturnSource::FpReg(0)),
            Some(ArgClass::Struct(info)) if info.size <= 2 * SLOT_SIZE => {
                let (mut int, mut fp) = (0, 0);
                let parts = Self::eightbytes(info)
                    .into_iter()
                    .enumerate()
                    .map(|(i, class)| {
                        let source = match class {
                            EightbyteClass::Integer => {
                                int += 1;
                                ReturnSource::IntReg(int - 1)
                            }
                            EightbyteClass::Sse => {
                                fp += 1;
                                ReturnSource::FpReg(fp - 1)
                            }
                        };
                        (source, (i * SLOT_SIZE) as u32, Self::eightbyte_size(info, i))
                    })
                    .collect();
                ReturnPlacement::Registers {
                    size: info.size,
                    parts,
                }
            }
            Some(ArgClass::Struct(_)) => ReturnPlacement::Buffer,
        };

        let mut state = ArgState::new(6, 8);
        let mut args = vec![];
        for (role, class) in sig.canonical_args(ret == ReturnPlacement::Buffer) {
            let arg = ArgPlacement::new(role, class.clone());
            let size = class.size() as u32;
            let arg = match &class {
                ArgClass::Int { .. } => match state.take_int(1, false) {
                    Some(r) => arg.part(ArgSource::IntReg(r), 0, size),
                    None => arg.part(ArgSource::Stack(state.take_stack(8, 8)), 0, size),
                },
                ArgClass::Float { .. } => match state.take_fp(1) {
                    Some(r) => arg.part(ArgSource::FpReg(r), 0, size),
                    None => arg.part(ArgSource::Stack(state.take_stack(8, 8)), 0, size),
                },
                ArgClass::Struct(info) => {
                    let classes = if info.size <= 2 * SLOT_SIZE {
                        Self::eightbytes(info)
                    } else {
                        vec![]
                    };
                    let ints = classes.iter().filter(|c| **c == EightbyteClass::Integer).count();
                    let sses = classes.len() - ints;
                    if !classes.is_empty()
                        && ints as u8 <= state.int_remaining()
                        && sses as u8 <= state.fp_remaining()
                    {
                        classes.into_iter().enumerate().fold(arg, |arg, (i, class)| {
                            let source = match class {
                                EightbyteClass::Integer => {
                                    ArgSource::IntReg(state.take_int(1, false).unwrap_or_default())
                                }
                                EightbyteClass::Sse => {
                                    ArgSource::FpReg(state.take_fp(1).unwrap_or_default())
                                }
                            };
                            arg.part(source, (i * SLOT_SIZE) as u32, Self::eightbyte_size(info, i))
                        })
                    } else {
                        let offset = state.take_stack(info.size, info.alignment);
                        arg.part(ArgSource::Stack(offset), 0, size)
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
    fn win64_positional_registers() {
        let mut sig = ints(0);
        sig.params = vec![
            ArgClass::Int { size: 4 },
            ArgClass::Float { size: 8 },
            ArgClass::Int { size: 8 },
        ];
        let layout = Amd64Windows.classify_args(&sig).unwrap();
        assert_eq!(layout.args[0].parts[0].source, ArgSource::IntReg(0));
        assert_eq!(layout.args[1].parts[0].source, ArgSource::FpReg(1));
        assert_eq!(layout.args[2].parts[0].source, ArgSource::IntReg(2));
        assert!(layout.args_in_caller_frame);
        assert_eq!(layout.stack_size, 32);
    }

    #[test]
    fn win64_odd_sized_structs_by_reference() {
        let mut sig = ints(0);
        sig.params = vec![
            strukt(&[(0, PrimitiveKind::I4), (4, PrimitiveKind::I2)]),
            strukt(&[(0, PrimitiveKind::I4), (4, PrimitiveKind::I4)]),
        ];
        let layout = Amd64Windows.classify_args(&sig).unwrap();
        assert!(layout.args[0].by_reference);
        assert!(!layout.args[1].by_reference);
    }

    #[test]
    fn win64_fifth_argument_after_home_area() {
        let layout = Amd64Windows.classify_args(&ints(6)).unwrap();
        assert_eq!(layout.args[4].parts[0].source, ArgSource::Stack(32));
        assert_eq!(layout.args[5].parts[0].source, ArgSource::Stack(40));
        assert_eq!(layout.args[5].offset, 40);
        assert_eq!(layout.stack_size, 48);
    }

    #[test]
    fn win64_vararg_floats_duplicate_into_integer_registers() {
        let mut sig = ints(0);
        sig.call_conv = CallConv::VarArg;
        sig.fixed_params = Some(0);
        sig.params = vec![ArgClass::Float { size: 8 }];
        let layout = Amd64Windows.classify_args(&sig).unwrap();
        // cookie in rcx, the double in xmm1 and rdx
        let sources: Vec<_> = layout.args[1].parts.iter().map(|p| p.source).collect();
        assert_eq!(sources, vec![ArgSource::FpReg(1), ArgSource::IntReg(1)]);
    }

    #[test]
    fn sysv_separate_register_files() {
        let mut sig = ints(0);
        sig.params = vec![
            ArgClass::Float { size: 8 },
            ArgClass::Int { size: 4 },
            ArgClass::Float { size: 4 },
        ];
        let layout = Amd64SysV.classify_args(&sig).unwrap();
        assert_eq!(layout.args[0].parts[0].source, ArgSource::FpReg(0));
        assert_eq!(layout.args[1].parts[0].source, ArgSource::IntReg(0));
        assert_eq!(layout.args[2].parts[0].source, ArgSource::FpReg(1));
        assert_eq!(layout.stack_size, 0);
    }

    #[test]
    fn sysv_mixed_struct_splits_eightbytes() {
        let mut sig = ints(0);
        sig.params = vec![strukt(&[(0, PrimitiveKind::R8), (8, PrimitiveKind::I4)])];
        let layout = Amd64SysV.classify_args(&sig).unwrap();
        let parts = &layout.args[0].parts;
        assert_eq!(parts[0].source, ArgSource::FpReg(0));
        assert_eq!(parts[1].source, ArgSource::IntReg(0));
        assert_eq!(parts[1].offset, 8);
    }

    #[test]
    fn sysv_large_struct_on_stack_and_buffer_return() {
        let big = strukt(&[(0, PrimitiveKind::I8), (8, PrimitiveKind::I8), (16, PrimitiveKind::I8)]);
        let mut sig = ints(0);
        sig.params = vec![big.clone()];
        sig.ret = Some(big);
        let layout = Amd64SysV.classify_args(&sig).unwrap();
        assert_eq!(layout.ret, ReturnPlacement::Buffer);
        assert_eq!(layout.args[0].role, ArgRole::RetBuf);
        assert_eq!(layout.args[0].parts[0].source, ArgSource::IntReg(0));
        assert_eq!(layout.args[1].parts[0].source, ArgSource::Stack(0));
        assert_eq!(layout.stack_size, 24);
    }

    #[test]
    fn sysv_struct_falls_back_to_stack_when_registers_run_out() {
        let mut sig = ints(5);
        sig.params.push(strukt(&[(0, PrimitiveKind::I8), (8, PrimitiveKind::I8)]));
        let layout = Amd64SysV.classify_args(&sig).unwrap();
        assert_eq!(layout.args[5].parts[0].source, ArgSource::Stack(0));
    }
}
