//! The stack-based bytecode VM
//!
//! A single fetch/decode/execute loop over the current chunk. Call frames
//! record the return chunk and address, the stack base, and the previous
//! values of the callee's parameter slots (parameters live in global slots,
//! so recursion must save and restore them). Try frames record a handler
//! address plus the stack and frame depths to unwind to.
//!
//! Runtime errors allocate a heap `Error` object, store it in `last_error`,
//! and unwind to the innermost try frame; without one, execution terminates
//! with a runtime diagnostic. The collector runs only between instructions,
//! so every temporary a single instruction allocates is rooted (on the
//! stack) before the next collection can happen.

use orus_core::chunk::Constant;
use orus_core::diag::{Diagnostic, RuntimeErrorKind, Span};
use orus_core::heap::{ErrorObj, Heap};
use orus_core::opcode::OpCode;
use orus_core::value::Value;
use orus_core::{FRAMES_MAX, TRY_MAX};

use crate::interpreter::{Backend, Interpreter};
use crate::natives::NATIVE_IMPLS;

/// Initial operand-stack capacity; the stack grows by doubling on demand.
pub const STACK_INITIAL: usize = 2048;

/// A runtime fault before it becomes a diagnostic or is caught.
pub(crate) type RtErr = (RuntimeErrorKind, String);
pub(crate) type RtResult<T> = Result<T, RtErr>;

struct CallFrame {
    return_ip: usize,
    chunk_id: u16,
    stack_offset: usize,
    /// Saved `(slot, value, defined)` for the callee's parameter slots.
    saved_params: Vec<(u8, Value, bool)>,
}

struct TryFrame {
    handler_ip: usize,
    chunk_id: u16,
    stack_depth: usize,
    frame_depth: usize,
    err_slot: u8,
}

struct ExecState {
    chunk_id: u16,
    ip: usize,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    try_frames: Vec<TryFrame>,
}

pub(crate) fn type_mismatch(expected: &str, found: Value) -> RtErr {
    (
        RuntimeErrorKind::TypeMismatch,
        format!("expected {}, found {}", expected, found.type_name()),
    )
}

fn pop(stack: &mut Vec<Value>) -> RtResult<Value> {
    stack
        .pop()
        .ok_or_else(|| (RuntimeErrorKind::StackUnderflow, "stack underflow".to_string()))
}

fn peek(stack: &[Value]) -> RtResult<Value> {
    stack
        .last()
        .copied()
        .ok_or_else(|| (RuntimeErrorKind::StackUnderflow, "stack underflow".to_string()))
}

/// Convert an index value to `usize`, rejecting negatives.
pub(crate) fn value_index(value: Value) -> RtResult<usize> {
    let index = match value {
        Value::I32(n) => i64::from(n),
        Value::I64(n) => n,
        Value::U32(n) => i64::from(n),
        Value::U64(n) => {
            if n > i64::MAX as u64 {
                return Err((
                    RuntimeErrorKind::IndexOutOfBounds,
                    format!("index {} is out of range", n),
                ));
            }
            n as i64
        }
        other => return Err(type_mismatch("an integer index", other)),
    };
    usize::try_from(index).map_err(|_| {
        (
            RuntimeErrorKind::IndexOutOfBounds,
            format!("index {} is negative", index),
        )
    })
}

macro_rules! checked_int {
    ($method:ident, $x:expr, $y:expr) => {
        match $x.$method($y) {
            Some(v) => Ok(v),
            None => Err((
                RuntimeErrorKind::ArithmeticOverflow,
                "arithmetic overflow".to_string(),
            )),
        }
    };
}

/// Typed binary operation shared by the stack and register backends.
pub(crate) fn binary_alu(op: OpCode, a: Value, b: Value, heap: &Heap) -> RtResult<Value> {
    use OpCode::*;

    macro_rules! signed {
        ($variant:ident, $name:literal, $method:ident, $check_zero:expr) => {{
            let (Value::$variant(x), Value::$variant(y)) = (a, b) else {
                return Err(type_mismatch($name, if matches!(a, Value::$variant(_)) { b } else { a }));
            };
            if $check_zero && y == 0 {
                return Err((
                    RuntimeErrorKind::DivisionByZero,
                    "division by zero".to_string(),
                ));
            }
            checked_int!($method, x, y).map(Value::$variant)
        }};
    }
    macro_rules! unsigned {
        ($variant:ident, $name:literal, $method:ident, $check_zero:expr) => {{
            let (Value::$variant(x), Value::$variant(y)) = (a, b) else {
                return Err(type_mismatch($name, if matches!(a, Value::$variant(_)) { b } else { a }));
            };
            if $check_zero && y == 0 {
                return Err((
                    RuntimeErrorKind::DivisionByZero,
                    "division by zero".to_string(),
                ));
            }
            Ok(Value::$variant(x.$method(y)))
        }};
    }
    macro_rules! float {
        ($op:tt) => {{
            let (Value::F64(x), Value::F64(y)) = (a, b) else {
                return Err(type_mismatch("f64", if matches!(a, Value::F64(_)) { b } else { a }));
            };
            Ok(Value::F64(x $op y))
        }};
    }
    macro_rules! compare {
        ($variant:ident, $name:literal, $op:tt) => {{
            let (Value::$variant(x), Value::$variant(y)) = (a, b) else {
                return Err(type_mismatch($name, if matches!(a, Value::$variant(_)) { b } else { a }));
            };
            Ok(Value::Bool(x $op y))
        }};
    }

    match op {
        AddI32 => signed!(I32, "i32", checked_add, false),
        SubI32 => signed!(I32, "i32", checked_sub, false),
        MulI32 => signed!(I32, "i32", checked_mul, false),
        DivI32 => signed!(I32, "i32", checked_div, true),
        ModI32 => signed!(I32, "i32", checked_rem, true),
        AddI64 => signed!(I64, "i64", checked_add, false),
        SubI64 => signed!(I64, "i64", checked_sub, false),
        MulI64 => signed!(I64, "i64", checked_mul, false),
        DivI64 => signed!(I64, "i64", checked_div, true),
        ModI64 => signed!(I64, "i64", checked_rem, true),
        AddU32 => unsigned!(U32, "u32", wrapping_add, false),
        SubU32 => unsigned!(U32, "u32", wrapping_sub, false),
        MulU32 => unsigned!(U32, "u32", wrapping_mul, false),
        DivU32 => unsigned!(U32, "u32", wrapping_div, true),
        ModU32 => unsigned!(U32, "u32", wrapping_rem, true),
        AddU64 => unsigned!(U64, "u64", wrapping_add, false),
        SubU64 => unsigned!(U64, "u64", wrapping_sub, false),
        MulU64 => unsigned!(U64, "u64", wrapping_mul, false),
        DivU64 => unsigned!(U64, "u64", wrapping_div, true),
        ModU64 => unsigned!(U64, "u64", wrapping_rem, true),
        AddF64 => float!(+),
        SubF64 => float!(-),
        MulF64 => float!(*),
        DivF64 => float!(/),

        LessI32 => compare!(I32, "i32", <),
        LessEqualI32 => compare!(I32, "i32", <=),
        GreaterI32 => compare!(I32, "i32", >),
        GreaterEqualI32 => compare!(I32, "i32", >=),
        LessI64 => compare!(I64, "i64", <),
        LessEqualI64 => compare!(I64, "i64", <=),
        GreaterI64 => compare!(I64, "i64", >),
        GreaterEqualI64 => compare!(I64, "i64", >=),
        LessU32 => compare!(U32, "u32", <),
        LessEqualU32 => compare!(U32, "u32", <=),
        GreaterU32 => compare!(U32, "u32", >),
        GreaterEqualU32 => compare!(U32, "u32", >=),
        LessU64 => compare!(U64, "u64", <),
        LessEqualU64 => compare!(U64, "u64", <=),
        GreaterU64 => compare!(U64, "u64", >),
        GreaterEqualU64 => compare!(U64, "u64", >=),
        LessF64 => compare!(F64, "f64", <),
        LessEqualF64 => compare!(F64, "f64", <=),
        GreaterF64 => compare!(F64, "f64", >),
        GreaterEqualF64 => compare!(F64, "f64", >=),

        Equal => Ok(Value::Bool(heap.values_equal(a, b))),
        NotEqual => Ok(Value::Bool(!heap.values_equal(a, b))),

        BitAnd | BitOr | BitXor | ShiftLeft | ShiftRight => bitwise(op, a, b),

        other => Err((
            RuntimeErrorKind::Unknown,
            format!("{} is not a binary operation", other.mnemonic()),
        )),
    }
}

fn bitwise(op: OpCode, a: Value, b: Value) -> RtResult<Value> {
    macro_rules! per_type {
        ($x:expr, $y:expr) => {
            match op {
                OpCode::BitAnd => $x & $y,
                OpCode::BitOr => $x | $y,
                OpCode::BitXor => $x ^ $y,
                OpCode::ShiftLeft => $x.wrapping_shl($y as u32),
                _ => $x.wrapping_shr($y as u32),
            }
        };
    }
    match (a, b) {
        (Value::I32(x), Value::I32(y)) => Ok(Value::I32(per_type!(x, y))),
        (Value::I64(x), Value::I64(y)) => Ok(Value::I64(per_type!(x, y))),
        (Value::U32(x), Value::U32(y)) => Ok(Value::U32(per_type!(x, y))),
        (Value::U64(x), Value::U64(y)) => Ok(Value::U64(per_type!(x, y))),
        _ => Err(type_mismatch("matching integer operands", b)),
    }
}

/// Typed unary operation shared by both backends.
pub(crate) fn unary_alu(op: OpCode, value: Value) -> RtResult<Value> {
    use OpCode::*;
    match (op, value) {
        (NegateI32, Value::I32(n)) => n
            .checked_neg()
            .map(Value::I32)
            .ok_or_else(|| (
                RuntimeErrorKind::ArithmeticOverflow,
                "arithmetic overflow".to_string(),
            )),
        (NegateI64, Value::I64(n)) => n
            .checked_neg()
            .map(Value::I64)
            .ok_or_else(|| (
                RuntimeErrorKind::ArithmeticOverflow,
                "arithmetic overflow".to_string(),
            )),
        // Unsigned negate wraps by two's complement.
        (NegateU32, Value::U32(n)) => Ok(Value::U32(n.wrapping_neg())),
        (NegateU64, Value::U64(n)) => Ok(Value::U64(n.wrapping_neg())),
        (NegateF64, Value::F64(x)) => Ok(Value::F64(-x)),
        (NotBool, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (BitNot, Value::I32(n)) => Ok(Value::I32(!n)),
        (BitNot, Value::I64(n)) => Ok(Value::I64(!n)),
        (BitNot, Value::U32(n)) => Ok(Value::U32(!n)),
        (BitNot, Value::U64(n)) => Ok(Value::U64(!n)),
        (I32ToF64, Value::I32(n)) => Ok(Value::F64(f64::from(n))),
        (U32ToF64, Value::U32(n)) => Ok(Value::F64(f64::from(n))),
        (_, other) => Err(type_mismatch("a compatible operand", other)),
    }
}

/// Numeric cast with Rust `as` semantics (truncating float-to-int,
/// wrapping int-to-int).
pub(crate) fn cast_value(value: Value, from: u8, to: u8) -> RtResult<Value> {
    let matches_from = matches!(
        (value, from),
        (Value::I32(_), 0)
            | (Value::I64(_), 1)
            | (Value::U32(_), 2)
            | (Value::U64(_), 3)
            | (Value::F64(_), 4)
            | (Value::Bool(_), 5)
    );
    if !matches_from {
        return Err(type_mismatch("the cast's source type", value));
    }
    let wide: f64;
    let int: i128;
    match value {
        Value::I32(n) => {
            wide = f64::from(n);
            int = i128::from(n);
        }
        Value::I64(n) => {
            wide = n as f64;
            int = i128::from(n);
        }
        Value::U32(n) => {
            wide = f64::from(n);
            int = i128::from(n);
        }
        Value::U64(n) => {
            wide = n as f64;
            int = i128::from(n);
        }
        Value::F64(x) => {
            wide = x;
            int = x as i128;
        }
        Value::Bool(b) => {
            wide = f64::from(u8::from(b));
            int = i128::from(u8::from(b));
        }
        other => return Err(type_mismatch("a numeric value", other)),
    }
    let result = match to {
        0 => Value::I32(int as i32),
        1 => Value::I64(int as i64),
        2 => Value::U32(int as u32),
        3 => Value::U64(int as u64),
        4 => Value::F64(wide),
        5 => Value::Bool(int != 0),
        _ => {
            return Err((
                RuntimeErrorKind::Unknown,
                format!("bad cast target code {}", to),
            ));
        }
    };
    Ok(result)
}

/// Substitute `{}` placeholders left to right.
pub(crate) fn format_template(template: &str, args: &[String]) -> RtResult<String> {
    let pieces: Vec<&str> = template.split("{}").collect();
    if pieces.len() - 1 != args.len() {
        return Err((
            RuntimeErrorKind::TypeMismatch,
            format!(
                "format template has {} placeholder(s) but {} argument(s) were given",
                pieces.len() - 1,
                args.len()
            ),
        ));
    }
    let mut out = String::with_capacity(template.len());
    for (index, piece) in pieces.iter().enumerate() {
        out.push_str(piece);
        if let Some(arg) = args.get(index) {
            out.push_str(arg);
        }
    }
    Ok(out)
}

impl Interpreter {
    /// Execute a chunk to completion on the configured backend.
    pub(crate) fn run_chunk(&mut self, chunk_id: u16) -> Result<(), Diagnostic> {
        if self.backend == Backend::Register {
            if let Some(program) = crate::regvm::lower(&self.chunks[chunk_id as usize]) {
                return self.run_register(chunk_id, &program);
            }
            tracing::debug!(chunk_id, "register backend cannot lower chunk, using stack VM");
        }
        self.run_stack(chunk_id)
    }

    fn run_stack(&mut self, chunk_id: u16) -> Result<(), Diagnostic> {
        let mut state = ExecState {
            chunk_id,
            ip: 0,
            stack: Vec::with_capacity(STACK_INITIAL),
            frames: Vec::new(),
            try_frames: Vec::new(),
        };

        loop {
            // Collection happens only between instructions; see module docs.
            if self.heap.should_collect() {
                let mut roots = self.persistent_roots();
                roots.extend(state.stack.iter().copied());
                self.heap.collect(&roots);
            }

            let code_len = self.chunks[state.chunk_id as usize].code.len();
            if state.ip >= code_len {
                return Ok(());
            }
            let op_start = state.ip;

            if self.trace {
                let mut line = String::from("          ");
                for value in &state.stack {
                    line.push_str(&format!("[ {} ]", self.heap.render(*value)));
                }
                eprintln!("{}", line);
                let (text, _) = self.chunks[state.chunk_id as usize]
                    .disassemble_instruction(op_start);
                eprintln!("{}", text);
            }

            let byte = self.chunks[state.chunk_id as usize].code[state.ip];
            state.ip += 1;
            let Some(op) = OpCode::from_byte(byte) else {
                return Err(self.runtime_diagnostic(
                    &state,
                    op_start,
                    RuntimeErrorKind::Unknown,
                    format!("bad opcode {:#04x}", byte),
                ));
            };

            match self.step(op, &mut state) {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Halt) => return Ok(()),
                Err((kind, message)) => {
                    self.unwind(&mut state, op_start, kind, message)?;
                }
            }
        }
    }

    fn read_byte(&self, state: &mut ExecState) -> u8 {
        let byte = self.chunks[state.chunk_id as usize].code[state.ip];
        state.ip += 1;
        byte
    }

    fn read_u16(&self, state: &mut ExecState) -> u16 {
        let value = self.chunks[state.chunk_id as usize].read_u16(state.ip);
        state.ip += 2;
        value
    }

    fn step(&mut self, op: OpCode, state: &mut ExecState) -> RtResult<StepOutcome> {
        match op {
            OpCode::Constant => {
                let index = self.read_byte(state) as usize;
                let value = match &self.chunks[state.chunk_id as usize].constants[index] {
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
                state.stack.push(value);
            }
            OpCode::Nil => state.stack.push(Value::Nil),
            OpCode::True => state.stack.push(Value::Bool(true)),
            OpCode::False => state.stack.push(Value::Bool(false)),
            OpCode::Pop => {
                pop(&mut state.stack)?;
            }

            // Typed arithmetic, comparisons, bitwise
            OpCode::AddI32
            | OpCode::SubI32
            | OpCode::MulI32
            | OpCode::DivI32
            | OpCode::ModI32
            | OpCode::AddI64
            | OpCode::SubI64
            | OpCode::MulI64
            | OpCode::DivI64
            | OpCode::ModI64
            | OpCode::AddU32
            | OpCode::SubU32
            | OpCode::MulU32
            | OpCode::DivU32
            | OpCode::ModU32
            | OpCode::AddU64
            | OpCode::SubU64
            | OpCode::MulU64
            | OpCode::DivU64
            | OpCode::ModU64
            | OpCode::AddF64
            | OpCode::SubF64
            | OpCode::MulF64
            | OpCode::DivF64
            | OpCode::LessI32
            | OpCode::LessEqualI32
            | OpCode::GreaterI32
            | OpCode::GreaterEqualI32
            | OpCode::LessI64
            | OpCode::LessEqualI64
            | OpCode::GreaterI64
            | OpCode::GreaterEqualI64
            | OpCode::LessU32
            | OpCode::LessEqualU32
            | OpCode::GreaterU32
            | OpCode::GreaterEqualU32
            | OpCode::LessU64
            | OpCode::LessEqualU64
            | OpCode::GreaterU64
            | OpCode::GreaterEqualU64
            | OpCode::LessF64
            | OpCode::LessEqualF64
            | OpCode::GreaterF64
            | OpCode::GreaterEqualF64
            | OpCode::Equal
            | OpCode::NotEqual
            | OpCode::BitAnd
            | OpCode::BitOr
            | OpCode::BitXor
            | OpCode::ShiftLeft
            | OpCode::ShiftRight => {
                let b = pop(&mut state.stack)?;
                let a = pop(&mut state.stack)?;
                state.stack.push(binary_alu(op, a, b, &self.heap)?);
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
                let value = pop(&mut state.stack)?;
                state.stack.push(unary_alu(op, value)?);
            }

            OpCode::Cast => {
                let from = self.read_byte(state);
                let to = self.read_byte(state);
                let value = pop(&mut state.stack)?;
                state.stack.push(cast_value(value, from, to)?);
            }

            // Globals
            OpCode::DefineGlobal => {
                let slot = self.read_byte(state) as usize;
                let value = pop(&mut state.stack)?;
                self.globals[slot] = value;
                self.globals_defined[slot] = true;
            }
            OpCode::GetGlobal => {
                let slot = self.read_byte(state) as usize;
                if !self.globals_defined[slot] {
                    return Err(self.undefined_global(slot));
                }
                state.stack.push(self.globals[slot]);
            }
            OpCode::SetGlobal => {
                // Stores without popping; the value stays observable.
                let slot = self.read_byte(state) as usize;
                if !self.globals_defined[slot] {
                    return Err(self.undefined_global(slot));
                }
                self.globals[slot] = peek(&state.stack)?;
            }

            // Control flow
            OpCode::Jump => {
                let offset = self.read_u16(state) as usize;
                state.ip += offset;
            }
            OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
                let offset = self.read_u16(state) as usize;
                let Value::Bool(condition) = peek(&state.stack)? else {
                    return Err(type_mismatch("bool", peek(&state.stack)?));
                };
                let take = if op == OpCode::JumpIfFalse {
                    !condition
                } else {
                    condition
                };
                if take {
                    state.ip += offset;
                }
            }
            OpCode::Loop => {
                let offset = self.read_u16(state) as usize;
                state.ip -= offset;
            }

            OpCode::Call => {
                let index = self.read_byte(state);
                let argc = self.read_byte(state) as usize;
                self.enter_function(state, index, argc)?;
            }
            OpCode::CallNative => {
                let index = self.read_byte(state) as usize;
                let argc = self.read_byte(state) as usize;
                if state.stack.len() < argc {
                    return Err((
                        RuntimeErrorKind::StackUnderflow,
                        "stack underflow in native call".to_string(),
                    ));
                }
                let base = state.stack.len() - argc;
                let args: Vec<Value> = state.stack.split_off(base);
                let value = NATIVE_IMPLS[index](&mut self.heap, &args)?;
                state.stack.push(value);
            }
            OpCode::Return => {
                let value = state.stack.pop().unwrap_or(Value::Nil);
                match state.frames.pop() {
                    None => {
                        // Top level: leave the result on the stack and halt.
                        state.stack.push(value);
                        return Ok(StepOutcome::Halt);
                    }
                    Some(frame) => {
                        for (slot, saved, defined) in frame.saved_params.iter().rev() {
                            self.globals[*slot as usize] = *saved;
                            self.globals_defined[*slot as usize] = *defined;
                        }
                        state.stack.truncate(frame.stack_offset);
                        state.stack.push(value);
                        state.chunk_id = frame.chunk_id;
                        state.ip = frame.return_ip;
                        while state
                            .try_frames
                            .last()
                            .is_some_and(|t| t.frame_depth > state.frames.len())
                        {
                            state.try_frames.pop();
                        }
                    }
                }
            }

            // I/O
            OpCode::Print => {
                let value = pop(&mut state.stack)?;
                let text = self.heap.render(value);
                self.output.write_line(&text);
            }
            OpCode::FormatPrint => {
                let argc = self.read_byte(state) as usize;
                if state.stack.len() < argc + 1 {
                    return Err((
                        RuntimeErrorKind::StackUnderflow,
                        "stack underflow in print".to_string(),
                    ));
                }
                let base = state.stack.len() - argc;
                let args: Vec<String> = state
                    .stack
                    .split_off(base)
                    .into_iter()
                    .map(|v| self.heap.render(v))
                    .collect();
                let template = pop(&mut state.stack)?;
                let Value::Str(id) = template else {
                    return Err(type_mismatch("string", template));
                };
                let text = format_template(self.heap.string(id), &args)?;
                self.output.write_line(&text);
            }

            // Arrays and struct instances
            OpCode::MakeArray => {
                let count = self.read_byte(state) as usize;
                if state.stack.len() < count {
                    return Err((
                        RuntimeErrorKind::StackUnderflow,
                        "stack underflow in array literal".to_string(),
                    ));
                }
                let base = state.stack.len() - count;
                let items = state.stack.split_off(base);
                let id = self.heap.alloc_array(items);
                state.stack.push(Value::Array(id));
            }
            OpCode::IndexGet => {
                let index = pop(&mut state.stack)?;
                let array = pop(&mut state.stack)?;
                let Value::Array(id) = array else {
                    if array == Value::Nil {
                        return Err((
                            RuntimeErrorKind::NullDereference,
                            "cannot index nil".to_string(),
                        ));
                    }
                    return Err(type_mismatch("array", array));
                };
                let index = value_index(index)?;
                let items = self.heap.array(id);
                let Some(value) = items.get(index).copied() else {
                    return Err((
                        RuntimeErrorKind::IndexOutOfBounds,
                        format!("index {} out of bounds for length {}", index, items.len()),
                    ));
                };
                state.stack.push(value);
            }
            OpCode::IndexSet => {
                let value = pop(&mut state.stack)?;
                let index = pop(&mut state.stack)?;
                let array = pop(&mut state.stack)?;
                let Value::Array(id) = array else {
                    if array == Value::Nil {
                        return Err((
                            RuntimeErrorKind::NullDereference,
                            "cannot index nil".to_string(),
                        ));
                    }
                    return Err(type_mismatch("array", array));
                };
                let index = value_index(index)?;
                let items = self.heap.array_mut(id);
                let Some(slot) = items.get_mut(index) else {
                    let len = items.len();
                    return Err((
                        RuntimeErrorKind::IndexOutOfBounds,
                        format!("index {} out of bounds for length {}", index, len),
                    ));
                };
                *slot = value;
                // The assigned value remains observable as the expression value.
                state.stack.push(value);
            }
            OpCode::Slice => {
                let end = pop(&mut state.stack)?;
                let start = pop(&mut state.stack)?;
                let array = pop(&mut state.stack)?;
                let Value::Array(id) = array else {
                    return Err(type_mismatch("array", array));
                };
                let start = value_index(start)?;
                let end = value_index(end)?;
                let items = self.heap.array(id);
                if start > end || end > items.len() {
                    return Err((
                        RuntimeErrorKind::IndexOutOfBounds,
                        format!(
                            "slice {}..{} out of bounds for length {}",
                            start,
                            end,
                            items.len()
                        ),
                    ));
                }
                let slice = items[start..end].to_vec();
                let new_id = self.heap.alloc_array(slice);
                state.stack.push(Value::Array(new_id));
            }

            // Exception handling
            OpCode::PushTry => {
                let offset = self.read_u16(state) as usize;
                let err_slot = self.read_byte(state);
                if state.try_frames.len() >= TRY_MAX {
                    return Err((
                        RuntimeErrorKind::StackOverflow,
                        "too many nested try blocks".to_string(),
                    ));
                }
                state.try_frames.push(TryFrame {
                    handler_ip: state.ip + offset,
                    chunk_id: state.chunk_id,
                    stack_depth: state.stack.len(),
                    frame_depth: state.frames.len(),
                    err_slot,
                });
            }
            OpCode::PopTry => {
                state.try_frames.pop();
            }

            OpCode::Import => {
                let index = self.read_byte(state) as usize;
                let Constant::Str(path) = &self.chunks[state.chunk_id as usize].constants[index]
                else {
                    return Err((
                        RuntimeErrorKind::Unknown,
                        "IMPORT operand must be a string constant".to_string(),
                    ));
                };
                let path = path.clone();
                let Some(module_index) = self.loader.module_index(&path) else {
                    return Err((
                        RuntimeErrorKind::ModuleNotFound,
                        format!("module '{}' is not registered", path),
                    ));
                };
                if self.loader.mark_executed(module_index) {
                    // Already ran: keep the stack shape identical.
                    state.stack.push(Value::Nil);
                } else {
                    let module_chunk = self.loader.chunk_id(module_index);
                    if state.frames.len() >= FRAMES_MAX {
                        return Err((
                            RuntimeErrorKind::StackOverflow,
                            "call stack overflow".to_string(),
                        ));
                    }
                    state.frames.push(CallFrame {
                        return_ip: state.ip,
                        chunk_id: state.chunk_id,
                        stack_offset: state.stack.len(),
                        saved_params: Vec::new(),
                    });
                    state.chunk_id = module_chunk;
                    state.ip = 0;
                }
            }
        }
        Ok(StepOutcome::Continue)
    }

    fn enter_function(&mut self, state: &mut ExecState, index: u8, argc: usize) -> RtResult<()> {
        if state.frames.len() >= FRAMES_MAX {
            return Err((
                RuntimeErrorKind::StackOverflow,
                "call stack overflow".to_string(),
            ));
        }
        let Some(info) = self.session.functions.get(index) else {
            return Err((
                RuntimeErrorKind::Unknown,
                format!("no function at index {}", index),
            ));
        };
        if argc != info.arity as usize || state.stack.len() < argc {
            return Err((
                RuntimeErrorKind::TypeMismatch,
                format!(
                    "function '{}' expects {} argument(s), got {}",
                    info.name, info.arity, argc
                ),
            ));
        }
        let entry = info.entry as usize;
        let target_chunk = info.chunk_id;
        let saved_params: Vec<(u8, Value, bool)> = info
            .param_slots
            .iter()
            .map(|&slot| {
                (
                    slot,
                    self.globals[slot as usize],
                    self.globals_defined[slot as usize],
                )
            })
            .collect();

        state.frames.push(CallFrame {
            return_ip: state.ip,
            chunk_id: state.chunk_id,
            stack_offset: state.stack.len() - argc,
            saved_params,
        });
        state.chunk_id = target_chunk;
        state.ip = entry;
        Ok(())
    }

    fn undefined_global(&self, slot: usize) -> RtErr {
        let name = self
            .session
            .globals
            .entry(slot as u8)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| format!("<slot {}>", slot));
        (
            RuntimeErrorKind::UndefinedVariable,
            format!("undefined variable '{}'", name),
        )
    }

    fn runtime_diagnostic(
        &self,
        state: &ExecState,
        op_start: usize,
        kind: RuntimeErrorKind,
        message: String,
    ) -> Diagnostic {
        let chunk = &self.chunks[state.chunk_id as usize];
        let file = self
            .chunk_files
            .get(state.chunk_id as usize)
            .cloned()
            .unwrap_or_default();
        Diagnostic::runtime(
            kind,
            message,
            Span::new(file, chunk.line_at(op_start), 0, 1),
        )
    }

    /// Record the error and transfer control to the innermost try frame, or
    /// surface a runtime diagnostic when none is active.
    fn unwind(
        &mut self,
        state: &mut ExecState,
        op_start: usize,
        kind: RuntimeErrorKind,
        message: String,
    ) -> Result<(), Diagnostic> {
        let line = self.chunks[state.chunk_id as usize].line_at(op_start);
        let error_id = self.heap.alloc_error(ErrorObj {
            kind,
            message: message.clone(),
            line,
            column: 0,
        });
        let error_value = Value::Error(error_id);
        self.last_error = Some(error_value);

        let Some(frame) = state.try_frames.pop() else {
            return Err(self.runtime_diagnostic(state, op_start, kind, message));
        };

        // Pop call frames down to the handler's depth, restoring the
        // parameter slots each one saved.
        while state.frames.len() > frame.frame_depth {
            let call = state.frames.pop().unwrap();
            for (slot, saved, defined) in call.saved_params.iter().rev() {
                self.globals[*slot as usize] = *saved;
                self.globals_defined[*slot as usize] = *defined;
            }
        }
        state.stack.truncate(frame.stack_depth);
        state.chunk_id = frame.chunk_id;
        state.ip = frame.handler_ip;
        self.globals[frame.err_slot as usize] = error_value;
        self.globals_defined[frame.err_slot as usize] = true;
        Ok(())
    }
}

enum StepOutcome {
    Continue,
    Halt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alu_typed_arithmetic() {
        let heap = Heap::new();
        assert_eq!(
            binary_alu(OpCode::AddI32, Value::I32(2), Value::I32(3), &heap).unwrap(),
            Value::I32(5)
        );
        assert_eq!(
            binary_alu(OpCode::MulF64, Value::F64(1.5), Value::F64(2.0), &heap).unwrap(),
            Value::F64(3.0)
        );
        let err = binary_alu(OpCode::AddI32, Value::I32(1), Value::F64(2.0), &heap).unwrap_err();
        assert_eq!(err.0, RuntimeErrorKind::TypeMismatch);
    }

    #[test]
    fn alu_division_by_zero() {
        let heap = Heap::new();
        let err = binary_alu(OpCode::DivI32, Value::I32(1), Value::I32(0), &heap).unwrap_err();
        assert_eq!(err.0, RuntimeErrorKind::DivisionByZero);
        let err = binary_alu(OpCode::ModU64, Value::U64(1), Value::U64(0), &heap).unwrap_err();
        assert_eq!(err.0, RuntimeErrorKind::DivisionByZero);
    }

    #[test]
    fn alu_signed_overflow_is_an_error_unsigned_wraps() {
        let heap = Heap::new();
        let err =
            binary_alu(OpCode::AddI32, Value::I32(i32::MAX), Value::I32(1), &heap).unwrap_err();
        assert_eq!(err.0, RuntimeErrorKind::ArithmeticOverflow);
        assert_eq!(
            binary_alu(OpCode::AddU32, Value::U32(u32::MAX), Value::U32(1), &heap).unwrap(),
            Value::U32(0)
        );
    }

    #[test]
    fn unsigned_negate_wraps() {
        assert_eq!(
            unary_alu(OpCode::NegateU32, Value::U32(1)).unwrap(),
            Value::U32(u32::MAX)
        );
    }

    #[test]
    fn string_equality_is_structural() {
        let mut heap = Heap::new();
        let a = heap.alloc_string("same");
        let b = heap.alloc_string("same");
        assert_eq!(
            binary_alu(OpCode::Equal, Value::Str(a), Value::Str(b), &heap).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn cast_semantics() {
        // i32 -> f64
        assert_eq!(cast_value(Value::I32(3), 0, 4).unwrap(), Value::F64(3.0));
        // f64 -> i32 truncates
        assert_eq!(cast_value(Value::F64(3.9), 4, 0).unwrap(), Value::I32(3));
        // i32 -> u32 wraps
        assert_eq!(
            cast_value(Value::I32(-1), 0, 2).unwrap(),
            Value::U32(u32::MAX)
        );
        // source-type check
        assert!(cast_value(Value::I32(1), 4, 0).is_err());
    }

    #[test]
    fn format_template_substitutes() {
        let out = format_template("a {} b {}", &["1".to_string(), "2".to_string()]).unwrap();
        assert_eq!(out, "a 1 b 2");
        assert!(format_template("{}", &[]).is_err());
    }

    #[test]
    fn value_index_rejects_negatives() {
        assert_eq!(value_index(Value::I32(3)).unwrap(), 3);
        assert!(value_index(Value::I32(-1)).is_err());
        assert!(value_index(Value::F64(1.0)).is_err());
    }
}
