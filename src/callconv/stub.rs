//! Native-to-interpreter entry stubs.
//!
//! A stub is a short op list derived from an [`ArgLayout`]: copy each
//! argument from where the native caller left it into the packed block,
//! hand the block to the interpreter, then move the result into the return
//! registers. The op list is what a code generator would lower to machine
//! code; here it is also directly executable against a [`NativeCallState`].
use super::*;
use crate::vm::{
    method::MethodDescriptor,
    interpreter::{ArgBlock, Interpreter, ReturnValue},
};
use std::fmt::Display;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StubOp {
    /// Spill a register argument into its home slot in the caller's frame.
    HomeIntReg { reg: u8, offset: usize },
    HomeFpReg { reg: u8, offset: usize },
    StoreIntReg { reg: u8, offset: usize, size: u32 },
    StoreFpReg { reg: u8, offset: usize, size: u32 },
    StoreRetBufReg { offset: usize },
    CopyStack { from: u32, offset: usize, size: u32 },
    /// Scratch space for a struct returned in registers.
    ReserveReturnBuffer { size: usize },
    LoadMethodDescriptor,
    CallInterpreter,
    ReturnVoid,
    ReturnScalar(ReturnSource),
    LoadReturnRegisters,
    /// Return the return-buffer address in the first integer register.
    ReturnRetBuf { offset: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntryStub {
    pub target: &'static str,
    pub ops: Vec<StubOp>,
    pub layout: ArgLayout,
}

pub(super) fn build(target: &'static str, layout: &ArgLayout) -> EntryStub {
    let mut ops = vec![];
    for arg in &layout.args {
        for part in &arg.parts {
            let offset = arg.offset + part.offset as usize;
            ops.push(match (layout.args_in_caller_frame, part.source) {
                (true, ArgSource::IntReg(reg)) => StubOp::HomeIntReg { reg, offset },
                (true, ArgSource::FpReg(reg)) => StubOp::HomeFpReg { reg, offset },
                // Already in place in the caller's frame.
                (true, ArgSource::Stack(_)) => continue,
                (_, ArgSource::IntReg(reg)) => StubOp::StoreIntReg {
                    reg,
                    offset,
                    size: part.size,
                },
                (_, ArgSource::FpReg(reg)) => StubOp::StoreFpReg {
                    reg,
                    offset,
                    size: part.size,
                },
                (_, ArgSource::Stack(from)) => StubOp::CopyStack {
                    from,
                    offset,
                    size: part.size,
                },
                (_, ArgSource::RetBufReg) => StubOp::StoreRetBufReg { offset },
            });
        }
    }
    if let ReturnPlacement::Registers { size, .. } = &layout.ret {
        ops.push(StubOp::ReserveReturnBuffer { size: *size });
    }
    ops.push(StubOp::LoadMethodDescriptor);
    ops.push(StubOp::CallInterpreter);
    ops.push(match &layout.ret {
        ReturnPlacement::Void => StubOp::ReturnVoid,
        ReturnPlacement::Scalar(source) => StubOp::ReturnScalar(*source),
        ReturnPlacement::Registers { .. } => StubOp::LoadReturnRegisters,
        ReturnPlacement::Buffer => StubOp::ReturnRetBuf {
            offset: layout
                .args
                .iter()
                .find(|a| a.role == ArgRole::RetBuf)
                .map_or(0, |a| a.offset),
        },
    });
    EntryStub {
        target,
        ops,
        layout: layout.clone(),
    }
}

fn write_bytes(block: &mut [u64], offset: usize, value: u64, size: usize) {
    let bytes: &mut [u8] = unsafe {
        std::slice::from_raw_parts_mut(block.as_mut_ptr().cast(), block.len() * SLOT_SIZE)
    };
    bytes[offset..offset + size].copy_from_slice(&value.to_le_bytes()[..size]);
}

fn read_bytes(block: &[u64], offset: usize, size: usize) -> u64 {
    let bytes: &[u8] =
        unsafe { std::slice::from_raw_parts(block.as_ptr().cast(), block.len() * SLOT_SIZE) };
    let mut buf = [0u8; 8];
    buf[..size].copy_from_slice(&bytes[offset..offset + size]);
    u64::from_le_bytes(buf)
}

impl EntryStub {
    /// Runs the stub as if `state` were the register file at entry.
    pub fn invoke(
        &self,
        interp: &Interpreter,
        method: &Arc<MethodDescriptor>,
        state: &mut NativeCallState,
    ) -> ExecResult<NativeReturn> {
        let mut own_block = vec![0u64; self.layout.block_size / SLOT_SIZE];
        let mut ret_buffer: Vec<u64> = vec![];
        let mut result = NativeReturn::default();
        let mut value = ReturnValue::Void;
        let mut target = None;

        for op in &self.ops {
            match *op {
                StubOp::HomeIntReg { reg, offset } => {
                    let v = state.int_regs[reg as usize];
                    write_bytes(&mut state.stack, offset, v, SLOT_SIZE)
                }
                StubOp::HomeFpReg { reg, offset } => {
                    let v = state.fp_regs[reg as usize];
                    write_bytes(&mut state.stack, offset, v, SLOT_SIZE)
                }
                StubOp::StoreIntReg { reg, offset, size } => {
                    write_bytes(&mut own_block, offset, state.int_regs[reg as usize], size as usize)
                }
                StubOp::StoreFpReg { reg, offset, size } => {
                    write_bytes(&mut own_block, offset, state.fp_regs[reg as usize], size as usize)
                }
                StubOp::StoreRetBufReg { offset } => {
                    write_bytes(&mut own_block, offset, state.ret_buf_reg.unwrap_or(0), SLOT_SIZE)
                }
                StubOp::CopyStack { from, offset, size } => {
                    let mut done = 0;
                    while done < size as usize {
                        let chunk = (size as usize - done).min(SLOT_SIZE);
                        let v = state.read_stack(from as usize + done, chunk);
                        write_bytes(&mut own_block, offset + done, v, chunk);
                        done += chunk;
                    }
                }
                StubOp::ReserveReturnBuffer { size } => {
                    ret_buffer = vec![0u64; align_up(size, SLOT_SIZE) / SLOT_SIZE];
                }
                StubOp::LoadMethodDescriptor => target = Some(method),
                StubOp::CallInterpreter => {
                    let Some(method) = target else {
                        continue;
                    };
                    let base = if self.layout.args_in_caller_frame {
                        state.stack_ptr()
                    } else {
                        own_block.as_mut_ptr().cast()
                    };
                    let ret_slot = (!ret_buffer.is_empty())
                        .then(|| ret_buffer.as_mut_ptr().cast::<u8>());
                    value = interp.interpret(method, ArgBlock::native(base), ret_slot)?;
                }
                StubOp::ReturnVoid => {}
                StubOp::ReturnScalar(source) => {
                    if let ReturnValue::Scalar(bits) = value {
                        match source {
                            ReturnSource::IntReg(r) => result.int[r as usize] = bits,
                            ReturnSource::FpReg(r) => result.fp[r as usize] = bits,
                        }
                    }
                }
                StubOp::LoadReturnRegisters => {
                    if let ReturnPlacement::Registers { parts, .. } = &self.layout.ret {
                        for (source, offset, size) in parts {
                            let v = read_bytes(&ret_buffer, *offset as usize, *size as usize);
                            match source {
                                ReturnSource::IntReg(r) => result.int[*r as usize] = v,
                                ReturnSource::FpReg(r) => result.fp[*r as usize] = v,
                            }
                        }
                    }
                }
                StubOp::ReturnRetBuf { offset } => {
                    let block: &[u64] = if self.layout.args_in_caller_frame {
                        &state.stack
                    } else {
                        &own_block
                    };
                    result.int[0] = read_bytes(block, offset, SLOT_SIZE);
                }
            }
        }
        Ok(result)
    }
}

impl Display for StubOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StubOp::HomeIntReg { reg, offset } => write!(f, "home    int{} -> [frame+{}]", reg, offset),
            StubOp::HomeFpReg { reg, offset } => write!(f, "home    fp{} -> [frame+{}]", reg, offset),
            StubOp::StoreIntReg { reg, offset, size } => {
                write!(f, "store{}  int{} -> [block+{}]", size, reg, offset)
            }
            StubOp::StoreFpReg { reg, offset, size } => {
                write!(f, "store{}  fp{} -> [block+{}]", size, reg, offset)
            }
            StubOp::StoreRetBufReg { offset } => write!(f, "store8  retbuf -> [block+{}]", offset),
            StubOp::CopyStack { from, offset, size } => {
                write!(f, "copy{}  [sp+{}] -> [block+{}]", size, from, offset)
            }
            StubOp::ReserveReturnBuffer { size } => write!(f, "reserve {} bytes for return", size),
            StubOp::LoadMethodDescriptor => f.write_str("load    method descriptor"),
            StubOp::CallInterpreter => f.write_str("call    interpreter"),
            StubOp::ReturnVoid => f.write_str("ret"),
            StubOp::ReturnScalar(ReturnSource::IntReg(r)) => write!(f, "ret     int{}", r),
            StubOp::ReturnScalar(ReturnSource::FpReg(r)) => write!(f, "ret     fp{}", r),
            StubOp::LoadReturnRegisters => f.write_str("ret     struct in registers"),
            StubOp::ReturnRetBuf { offset } => write!(f, "ret     retbuf from [block+{}]", offset),
        }
    }
}

impl Display for EntryStub {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let conv = TargetConvention::by_name(self.target).unwrap_or_default();
        writeln!(f, "; entry stub for {}", self.target)?;
        for op in &self.ops {
            // Register numbers are printed symbolically so dumps match the target.
            let line = op.to_string();
            let line = match op {
                StubOp::HomeIntReg { reg, .. } | StubOp::StoreIntReg { reg, .. } => {
                    line.replacen(&format!("int{}", reg), conv.int_reg_name(*reg), 1)
                }
                StubOp::HomeFpReg { reg, .. } | StubOp::StoreFpReg { reg, .. } => {
                    line.replacen(&format!("fp{}", reg), &conv.fp_reg_name(*reg), 1)
                }
                StubOp::ReturnScalar(ReturnSource::IntReg(r)) => {
                    line.replacen(&format!("int{}", r), conv.int_reg_name(*r), 1)
                }
                StubOp::ReturnScalar(ReturnSource::FpReg(r)) => {
                    line.replacen(&format!("fp{}", r), &conv.fp_reg_name(*r), 1)
                }
                _ => line,
            };
            writeln!(f, "    {}", line)?;
        }
        Ok(())
    }
}
