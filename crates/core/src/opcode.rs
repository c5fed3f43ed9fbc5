//! Bytecode opcodes for the Orus VM
//!
//! Operand widths are fixed per opcode: none for arithmetic, one byte for
//! constant/global/function indices, two big-endian bytes for jump offsets.
//! `Loop` takes a positive offset subtracted from `ip`; the forward jumps
//! take a positive offset added to `ip` measured from the byte after the
//! operand.

/// Operand layout of an opcode, used by the decoder and the disassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    /// No operands
    None,
    /// One byte (constant index, global slot, arg count)
    Byte,
    /// Two independent bytes (function index + arg count, cast from + to)
    ByteByte,
    /// One big-endian u16 (jump offset)
    Short,
    /// A u16 followed by a byte (try handler offset + error slot)
    ShortByte,
}

impl Operands {
    /// Number of operand bytes following the opcode byte.
    pub fn width(self) -> usize {
        match self {
            Operands::None => 0,
            Operands::Byte => 1,
            Operands::ByteByte | Operands::Short => 2,
            Operands::ShortByte => 3,
        }
    }
}

macro_rules! opcodes {
    ($($name:ident = $byte:literal => ($mnemonic:literal, $operands:ident);)*) => {
        /// A single VM instruction tag.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum OpCode {
            $($name = $byte,)*
        }

        impl OpCode {
            /// Decode a raw byte. Returns `None` for bytes that are not opcodes.
            pub fn from_byte(byte: u8) -> Option<OpCode> {
                match byte {
                    $($byte => Some(OpCode::$name),)*
                    _ => None,
                }
            }

            /// Mnemonic used by the disassembler and trace output.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(OpCode::$name => $mnemonic,)*
                }
            }

            /// Operand layout for this opcode.
            pub fn operands(self) -> Operands {
                match self {
                    $(OpCode::$name => Operands::$operands,)*
                }
            }
        }
    };
}

opcodes! {
    // Constants and stack shuffling
    Constant = 0 => ("CONSTANT", Byte);
    Nil = 1 => ("NIL", None);
    True = 2 => ("TRUE", None);
    False = 3 => ("FALSE", None);
    Pop = 4 => ("POP", None);

    // i32 arithmetic
    AddI32 = 10 => ("ADD_I32", None);
    SubI32 = 11 => ("SUB_I32", None);
    MulI32 = 12 => ("MUL_I32", None);
    DivI32 = 13 => ("DIV_I32", None);
    ModI32 = 14 => ("MOD_I32", None);

    // i64 arithmetic
    AddI64 = 15 => ("ADD_I64", None);
    SubI64 = 16 => ("SUB_I64", None);
    MulI64 = 17 => ("MUL_I64", None);
    DivI64 = 18 => ("DIV_I64", None);
    ModI64 = 19 => ("MOD_I64", None);

    // u32 arithmetic (wrapping)
    AddU32 = 20 => ("ADD_U32", None);
    SubU32 = 21 => ("SUB_U32", None);
    MulU32 = 22 => ("MUL_U32", None);
    DivU32 = 23 => ("DIV_U32", None);
    ModU32 = 24 => ("MOD_U32", None);

    // u64 arithmetic (wrapping)
    AddU64 = 25 => ("ADD_U64", None);
    SubU64 = 26 => ("SUB_U64", None);
    MulU64 = 27 => ("MUL_U64", None);
    DivU64 = 28 => ("DIV_U64", None);
    ModU64 = 29 => ("MOD_U64", None);

    // f64 arithmetic
    AddF64 = 30 => ("ADD_F64", None);
    SubF64 = 31 => ("SUB_F64", None);
    MulF64 = 32 => ("MUL_F64", None);
    DivF64 = 33 => ("DIV_F64", None);

    // Comparisons (result is always bool)
    LessI32 = 40 => ("LESS_I32", None);
    LessEqualI32 = 41 => ("LESS_EQUAL_I32", None);
    GreaterI32 = 42 => ("GREATER_I32", None);
    GreaterEqualI32 = 43 => ("GREATER_EQUAL_I32", None);
    LessI64 = 44 => ("LESS_I64", None);
    LessEqualI64 = 45 => ("LESS_EQUAL_I64", None);
    GreaterI64 = 46 => ("GREATER_I64", None);
    GreaterEqualI64 = 47 => ("GREATER_EQUAL_I64", None);
    LessU32 = 48 => ("LESS_U32", None);
    LessEqualU32 = 49 => ("LESS_EQUAL_U32", None);
    GreaterU32 = 50 => ("GREATER_U32", None);
    GreaterEqualU32 = 51 => ("GREATER_EQUAL_U32", None);
    LessU64 = 52 => ("LESS_U64", None);
    LessEqualU64 = 53 => ("LESS_EQUAL_U64", None);
    GreaterU64 = 54 => ("GREATER_U64", None);
    GreaterEqualU64 = 55 => ("GREATER_EQUAL_U64", None);
    LessF64 = 56 => ("LESS_F64", None);
    LessEqualF64 = 57 => ("LESS_EQUAL_F64", None);
    GreaterF64 = 58 => ("GREATER_F64", None);
    GreaterEqualF64 = 59 => ("GREATER_EQUAL_F64", None);
    Equal = 60 => ("EQUAL", None);
    NotEqual = 61 => ("NOT_EQUAL", None);

    // Bitwise (integer operands of matching type)
    BitAnd = 62 => ("BIT_AND", None);
    BitOr = 63 => ("BIT_OR", None);
    BitXor = 64 => ("BIT_XOR", None);
    ShiftLeft = 65 => ("SHIFT_LEFT", None);
    ShiftRight = 66 => ("SHIFT_RIGHT", None);
    BitNot = 67 => ("BIT_NOT", None);

    // Unary
    NegateI32 = 70 => ("NEGATE_I32", None);
    NegateI64 = 71 => ("NEGATE_I64", None);
    // Unsigned negate wraps (two's complement), it does not error.
    NegateU32 = 72 => ("NEGATE_U32", None);
    NegateU64 = 73 => ("NEGATE_U64", None);
    NegateF64 = 74 => ("NEGATE_F64", None);
    NotBool = 75 => ("NOT_BOOL", None);

    // Numeric conversions
    I32ToF64 = 76 => ("I32_TO_F64", None);
    U32ToF64 = 77 => ("U32_TO_F64", None);
    Cast = 78 => ("CAST", ByteByte);

    // Globals
    DefineGlobal = 80 => ("DEFINE_GLOBAL", Byte);
    GetGlobal = 81 => ("GET_GLOBAL", Byte);
    SetGlobal = 82 => ("SET_GLOBAL", Byte);

    // Control flow
    Jump = 90 => ("JUMP", Short);
    JumpIfFalse = 91 => ("JUMP_IF_FALSE", Short);
    JumpIfTrue = 92 => ("JUMP_IF_TRUE", Short);
    Loop = 93 => ("LOOP", Short);
    Call = 94 => ("CALL", ByteByte);
    CallNative = 95 => ("CALL_NATIVE", ByteByte);
    Return = 96 => ("RETURN", None);

    // I/O
    Print = 100 => ("PRINT", None);
    FormatPrint = 101 => ("FORMAT_PRINT", Byte);

    // Arrays and struct instances
    MakeArray = 110 => ("MAKE_ARRAY", Byte);
    IndexGet = 111 => ("INDEX_GET", None);
    IndexSet = 112 => ("INDEX_SET", None);
    Slice = 113 => ("SLICE", None);

    // Exception handling
    PushTry = 120 => ("PUSH_TRY", ShortByte);
    PopTry = 121 => ("POP_TRY", None);

    // Modules: run the named module's chunk once, pushing nil
    Import = 125 => ("IMPORT", Byte);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        for byte in 0u8..=255 {
            if let Some(op) = OpCode::from_byte(byte) {
                assert_eq!(op as u8, byte);
            }
        }
    }

    #[test]
    fn operand_widths() {
        assert_eq!(OpCode::AddI32.operands().width(), 0);
        assert_eq!(OpCode::Constant.operands().width(), 1);
        assert_eq!(OpCode::Jump.operands().width(), 2);
        assert_eq!(OpCode::Call.operands().width(), 2);
        assert_eq!(OpCode::PushTry.operands().width(), 3);
    }

    #[test]
    fn unknown_bytes_decode_to_none() {
        assert_eq!(OpCode::from_byte(250), None);
    }
}
