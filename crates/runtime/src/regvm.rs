//! Register VM backend
//!
//! An alternative execution backend over the same chunks, values, and heap.
//! Instructions are fixed-shape `{op, dst, src1, src2}` records over a
//! 256-entry register bank. Chunks are lowered instruction-for-instruction
//! from stack bytecode by simulating the operand stack: the value at stack
//! depth `d` lives in register `d`, so branch targets need consistent depths
//! (which the compiler's statement-balanced emission guarantees).
//!
//! The backend has no call/return or try discipline: lowering refuses any
//! chunk containing `CALL`, `CALL_NATIVE`, `IMPORT`, or try opcodes, and the
//! interpreter falls back to the stack VM, keeping observable semantics
//! identical either way. Arithmetic, comparisons, and casts delegate to the
//! same ALU the stack VM uses.

use std::collections::HashMap;

use orus_core::chunk::{Chunk, Constant};
use orus_core::diag::{Diagnostic, RuntimeErrorKind, Span};
use orus_core::opcode::OpCode;
use orus_core::value::Value;

use crate::interpreter::Interpreter;
use crate::vm::{RtErr, binary_alu, cast_value, format_template, unary_alu};

const REGISTERS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum RegOp {
    Nop,
    LoadConst { dst: u8, index: u8 },
    LoadNil { dst: u8 },
    LoadBool { dst: u8, value: bool },
    Bin { op: OpCode, dst: u8, a: u8, b: u8 },
    Un { op: OpCode, dst: u8, src: u8 },
    Cast { dst: u8, src: u8, from: u8, to: u8 },
    GetGlobal { dst: u8, slot: u8 },
    SetGlobal { slot: u8, src: u8 },
    DefineGlobal { slot: u8, src: u8 },
    Jmp { target: u16 },
    /// Branch when the condition register holds `false`.
    Jz { cond: u8, target: u16 },
    /// Branch when the condition register holds `true`.
    Jnz { cond: u8, target: u16 },
    Print { src: u8 },
    FormatPrint { base: u8, argc: u8 },
    Halt,
}

#[derive(Debug)]
pub(crate) struct RegProgram {
    pub code: Vec<RegOp>,
    /// Byte offset of the stack instruction each register instruction came
    /// from, for line lookups in error reports.
    pub origins: Vec<usize>,
}

/// True for the pop-two-push-one ALU opcodes shared with the stack VM.
fn is_alu_binary(op: OpCode) -> bool {
    // Arithmetic block, comparison/equality block, binary bitwise block.
    matches!(op as u8, 10..=33 | 40..=66)
}

/// Lower a chunk to register code, or `None` when it uses anything the
/// backend does not support.
pub(crate) fn lower(chunk: &Chunk) -> Option<RegProgram> {
    // First pass: decode instruction boundaries.
    let mut offsets = Vec::new();
    let mut offset_to_index = HashMap::new();
    let mut offset = 0;
    while offset < chunk.code.len() {
        let op = OpCode::from_byte(chunk.code[offset])?;
        offset_to_index.insert(offset, offsets.len());
        offsets.push((offset, op));
        offset += 1 + op.operands().width();
    }

    // Second pass: simulate stack depth and emit one register instruction
    // per stack instruction (so jump targets map index-for-index).
    let mut code = Vec::with_capacity(offsets.len());
    let mut origins = Vec::with_capacity(offsets.len());
    let mut depth_at: HashMap<usize, usize> = HashMap::new();
    let mut depth: usize = 0;
    let mut fixups: Vec<(usize, usize)> = Vec::new(); // (instr index, target byte offset)
    let mut reachable = true;

    for &(at, op) in &offsets {
        if let Some(&expected) = depth_at.get(&at) {
            if reachable && expected != depth {
                return None;
            }
            depth = expected;
            reachable = true;
        } else if !reachable {
            // Unreachable and no recorded depth: refuse rather than guess.
            return None;
        }
        depth_at.insert(at, depth);

        if depth >= REGISTERS - 1 {
            return None;
        }
        let top = depth.wrapping_sub(1) as u8;
        let operand = |k: usize| chunk.code[at + k];

        let reg_op = match op {
            OpCode::Constant => {
                depth += 1;
                RegOp::LoadConst {
                    dst: depth as u8 - 1,
                    index: operand(1),
                }
            }
            OpCode::Nil => {
                depth += 1;
                RegOp::LoadNil {
                    dst: depth as u8 - 1,
                }
            }
            OpCode::True | OpCode::False => {
                depth += 1;
                RegOp::LoadBool {
                    dst: depth as u8 - 1,
                    value: op == OpCode::True,
                }
            }
            OpCode::Pop => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                RegOp::Nop
            }
            OpCode::Cast => {
                if depth == 0 {
                    return None;
                }
                RegOp::Cast {
                    dst: top,
                    src: top,
                    from: operand(1),
                    to: operand(2),
                }
            }
            OpCode::NegateI32
            | OpCode::NegateI64
            | OpCode::NegateU32
            | OpCode::NegateU64
            | OpCode::NegateF64
            | OpCode::NotBool
            | OpCode::BitNot
            | OpCode::I32ToF64
            | OpCode::U32ToF64 => {
                if depth == 0 {
                    return None;
                }
                RegOp::Un {
                    op,
                    dst: top,
                    src: top,
                }
            }
            OpCode::DefineGlobal => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                RegOp::DefineGlobal {
                    slot: operand(1),
                    src: depth as u8,
                }
            }
            OpCode::GetGlobal => {
                depth += 1;
                RegOp::GetGlobal {
                    dst: depth as u8 - 1,
                    slot: operand(1),
                }
            }
            OpCode::SetGlobal => {
                if depth == 0 {
                    return None;
                }
                RegOp::SetGlobal {
                    slot: operand(1),
                    src: top,
                }
            }
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue | OpCode::Loop => {
                let distance = chunk.read_u16(at + 1) as usize;
                let after = at + 3;
                let target = if op == OpCode::Loop {
                    after - distance
                } else {
                    after + distance
                };
                let target_depth = depth; // branches peek, jumps carry depth
                match depth_at.get(&target) {
                    Some(&existing) if existing != target_depth => return None,
                    Some(_) => {}
                    None => {
                        depth_at.insert(target, target_depth);
                    }
                }
                fixups.push((code.len(), target));
                match op {
                    OpCode::Jump | OpCode::Loop => {
                        // Fallthrough after an unconditional jump is only
                        // reachable as someone else's branch target.
                        reachable = false;
                        RegOp::Jmp { target: 0 }
                    }
                    OpCode::JumpIfFalse => RegOp::Jz {
                        cond: top,
                        target: 0,
                    },
                    _ => RegOp::Jnz {
                        cond: top,
                        target: 0,
                    },
                }
            }
            OpCode::Print => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                RegOp::Print { src: depth as u8 }
            }
            OpCode::FormatPrint => {
                let argc = operand(1) as usize;
                if depth < argc + 1 {
                    return None;
                }
                depth -= argc + 1;
                RegOp::FormatPrint {
                    base: depth as u8,
                    argc: argc as u8,
                }
            }
            OpCode::Return => {
                reachable = false;
                RegOp::Halt
            }
            // Typed binary ALU ops all pop two and push one.
            other if is_alu_binary(other) => {
                if depth < 2 {
                    return None;
                }
                depth -= 1;
                RegOp::Bin {
                    op: other,
                    dst: depth as u8 - 1,
                    a: depth as u8 - 1,
                    b: depth as u8,
                }
            }
            // Calls, natives, arrays, try frames, imports: not supported.
            _ => return None,
        };
        origins.push(at);
        code.push(reg_op);
    }

    for (index, target) in fixups {
        let target_index = *offset_to_index.get(&target)? as u16;
        match &mut code[index] {
            RegOp::Jmp { target }
            | RegOp::Jz { target, .. }
            | RegOp::Jnz { target, .. } => *target = target_index,
            _ => unreachable!("fixup against a non-jump"),
        }
    }

    Some(RegProgram { code, origins })
}

impl Interpreter {
    pub(crate) fn run_register(
        &mut self,
        chunk_id: u16,
        program: &RegProgram,
    ) -> Result<(), Diagnostic> {
        let mut registers = [Value::Nil; REGISTERS];
        let mut pc = 0usize;

        while pc < program.code.len() {
            if self.heap.should_collect() {
                let mut roots = self.persistent_roots();
                roots.extend(registers.iter().copied());
                self.heap.collect(&roots);
            }

            let instr = program.code[pc];
            let result: Result<(), RtErr> = (|| {
                match instr {
                    RegOp::Nop => {}
                    RegOp::LoadConst { dst, index } => {
                        let value =
                            match &self.chunks[chunk_id as usize].constants[index as usize] {
                                Constant::Nil => Value::Nil,
                                Constant::Bool(b) => Value::Bool(*b),
                                Constant::I32(n) => Value::I32(*n),
                                Constant::I64(n) => Value::I64(*n),
                                Constant::U32(n) => Value::U32(*n),
                                Constant::U64(n) => Value::U64(*n),
                                Constant::F64(x) => Value::F64(*x),
                                Constant::Str(s) => match self.intern.get(s) {
                                    Some(&id) => Value::Str(id),
                                    None => {
                                        let text = s.clone();
                                        let id = self.heap.alloc_string(text.clone());
                                        self.intern.insert(text, id);
                                        Value::Str(id)
                                    }
                                },
                            };
                        registers[dst as usize] = value;
                    }
                    RegOp::LoadNil { dst } => registers[dst as usize] = Value::Nil,
                    RegOp::LoadBool { dst, value } => {
                        registers[dst as usize] = Value::Bool(value);
                    }
                    RegOp::Bin { op, dst, a, b } => {
                        registers[dst as usize] = binary_alu(
                            op,
                            registers[a as usize],
                            registers[b as usize],
                            &self.heap,
                        )?;
                    }
                    RegOp::Un { op, dst, src } => {
                        registers[dst as usize] = unary_alu(op, registers[src as usize])?;
                    }
                    RegOp::Cast { dst, src, from, to } => {
                        registers[dst as usize] = cast_value(registers[src as usize], from, to)?;
                    }
                    RegOp::GetGlobal { dst, slot } => {
                        if !self.globals_defined[slot as usize] {
                            return Err((
                                RuntimeErrorKind::UndefinedVariable,
                                format!("undefined variable in global slot {}", slot),
                            ));
                        }
                        registers[dst as usize] = self.globals[slot as usize];
                    }
                    RegOp::SetGlobal { slot, src } => {
                        if !self.globals_defined[slot as usize] {
                            return Err((
                                RuntimeErrorKind::UndefinedVariable,
                                format!("undefined variable in global slot {}", slot),
                            ));
                        }
                        self.globals[slot as usize] = registers[src as usize];
                    }
                    RegOp::DefineGlobal { slot, src } => {
                        self.globals[slot as usize] = registers[src as usize];
                        self.globals_defined[slot as usize] = true;
                    }
                    RegOp::Jmp { target } => {
                        pc = target as usize;
                        return Ok(());
                    }
                    RegOp::Jz { cond, target } | RegOp::Jnz { cond, target } => {
                        let Value::Bool(condition) = registers[cond as usize] else {
                            return Err((
                                RuntimeErrorKind::TypeMismatch,
                                "branch condition must be bool".to_string(),
                            ));
                        };
                        let wants_true = matches!(instr, RegOp::Jnz { .. });
                        if condition == wants_true {
                            pc = target as usize;
                            return Ok(());
                        }
                    }
                    RegOp::Print { src } => {
                        let text = self.heap.render(registers[src as usize]);
                        self.output.write_line(&text);
                    }
                    RegOp::FormatPrint { base, argc } => {
                        let template = registers[base as usize];
                        let Value::Str(id) = template else {
                            return Err((
                                RuntimeErrorKind::TypeMismatch,
                                "format template must be a string".to_string(),
                            ));
                        };
                        let args: Vec<String> = (1..=argc as usize)
                            .map(|i| self.heap.render(registers[base as usize + i]))
                            .collect();
                        let text = format_template(self.heap.string(id), &args)?;
                        self.output.write_line(&text);
                    }
                    RegOp::Halt => {
                        pc = program.code.len();
                        return Ok(());
                    }
                }
                pc += 1;
                Ok(())
            })();

            if let Err((kind, message)) = result {
                let origin = program.origins.get(pc).copied().unwrap_or(0);
                let line = self.chunks[chunk_id as usize].line_at(origin);
                let file = self
                    .chunk_files
                    .get(chunk_id as usize)
                    .cloned()
                    .unwrap_or_default();
                return Err(Diagnostic::runtime(
                    kind,
                    message,
                    Span::new(file, line, 0, 1),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orus_core::chunk::Chunk;

    fn simple_chunk() -> Chunk {
        let mut chunk = Chunk::new();
        let k = chunk.add_constant(Constant::I32(2)).unwrap();
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_byte(k, 1);
        let j = chunk.add_constant(Constant::I32(3)).unwrap();
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_byte(j, 1);
        chunk.write_op(OpCode::AddI32, 1);
        chunk.write_op(OpCode::Print, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 1);
        chunk
    }

    #[test]
    fn lowers_straight_line_arithmetic() {
        let program = lower(&simple_chunk()).expect("should lower");
        assert!(matches!(program.code[2], RegOp::Bin { op: OpCode::AddI32, .. }));
        assert!(matches!(program.code.last(), Some(RegOp::Halt)));
    }

    #[test]
    fn refuses_calls() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Call, 1);
        chunk.write_byte(0, 1);
        chunk.write_byte(0, 1);
        assert!(lower(&chunk).is_none());
    }

    #[test]
    fn refuses_try_frames() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::PushTry, 1);
        chunk.write_u16(0, 1);
        chunk.write_byte(0, 1);
        assert!(lower(&chunk).is_none());
    }

    #[test]
    fn lowers_branches_with_consistent_depths() {
        // if true { } else { }  shaped control flow
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::True, 1);
        chunk.write_op(OpCode::JumpIfFalse, 1);
        chunk.write_u16(4, 1); // over POP + JUMP
        chunk.write_op(OpCode::Pop, 1);
        chunk.write_op(OpCode::Jump, 1);
        chunk.write_u16(1, 1); // over the else POP
        chunk.write_op(OpCode::Pop, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Return, 1);
        let program = lower(&chunk).expect("should lower");
        assert!(matches!(program.code[1], RegOp::Jz { .. }));
    }
}
