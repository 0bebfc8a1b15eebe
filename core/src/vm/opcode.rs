//! Opcode numbering and metadata.

/// One byte per opcode, grouped the way the dispatch loop handles them.
/// Comparison synthesis: the register forms only carry `EQ`/`LE`/`LT`; the
/// compiler swaps operands for `>` and `>=`. The immediate forms carry
/// `GEI`/`GTI` directly (the immediate cannot be swapped into a register).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    // misc
    Nop = 0,
    Hlt,
    // data movement
    Mov,
    Movi,
    Load,
    // integer/float arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Addi,
    Subi,
    Muli,
    Divi,
    // bitwise
    Shl,
    Shr,
    Shli,
    Shri,
    And,
    Or,
    Xor,
    Not,
    // comparisons
    Eq,
    Le,
    Lt,
    Eqi,
    Lei,
    Lti,
    Gei,
    Gti,
    // logical
    Land,
    Lor,
    Lnot,
    // introspection
    Typeof,
    // control flow
    Test,
    Jmp,
    Jmpi,
    // call group
    CallNew,
    CallSet,
    Call,
    TailCall,
    CoCall,
    Ret,
    // arrays
    ArrayNew,
    ArrayGet,
    ArraySet,
    ArrayAdd,
    // globals
    GlobalGet,
    GlobalSet,
    // errors and debugging
    Throw,
    Echo,
}

/// Operand shape, used by the disassembler and encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncForm {
    I0,
    I1,
    I1Reg,
    I2,
    I3,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        Some(match byte {
            0 => Opcode::Nop,
            1 => Opcode::Hlt,
            2 => Opcode::Mov,
            3 => Opcode::Movi,
            4 => Opcode::Load,
            5 => Opcode::Add,
            6 => Opcode::Sub,
            7 => Opcode::Mul,
            8 => Opcode::Div,
            9 => Opcode::Neg,
            10 => Opcode::Addi,
            11 => Opcode::Subi,
            12 => Opcode::Muli,
            13 => Opcode::Divi,
            14 => Opcode::Shl,
            15 => Opcode::Shr,
            16 => Opcode::Shli,
            17 => Opcode::Shri,
            18 => Opcode::And,
            19 => Opcode::Or,
            20 => Opcode::Xor,
            21 => Opcode::Not,
            22 => Opcode::Eq,
            23 => Opcode::Le,
            24 => Opcode::Lt,
            25 => Opcode::Eqi,
            26 => Opcode::Lei,
            27 => Opcode::Lti,
            28 => Opcode::Gei,
            29 => Opcode::Gti,
            30 => Opcode::Land,
            31 => Opcode::Lor,
            32 => Opcode::Lnot,
            33 => Opcode::Typeof,
            34 => Opcode::Test,
            35 => Opcode::Jmp,
            36 => Opcode::Jmpi,
            37 => Opcode::CallNew,
            38 => Opcode::CallSet,
            39 => Opcode::Call,
            40 => Opcode::TailCall,
            41 => Opcode::CoCall,
            42 => Opcode::Ret,
            43 => Opcode::ArrayNew,
            44 => Opcode::ArrayGet,
            45 => Opcode::ArraySet,
            46 => Opcode::ArrayAdd,
            47 => Opcode::GlobalGet,
            48 => Opcode::GlobalSet,
            49 => Opcode::Throw,
            50 => Opcode::Echo,
            _ => return None,
        })
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::Hlt => "HLT",
            Opcode::Mov => "MOV",
            Opcode::Movi => "MOVI",
            Opcode::Load => "LOAD",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Neg => "NEG",
            Opcode::Addi => "ADDI",
            Opcode::Subi => "SUBI",
            Opcode::Muli => "MULI",
            Opcode::Divi => "DIVI",
            Opcode::Shl => "SHL",
            Opcode::Shr => "SHR",
            Opcode::Shli => "SHLI",
            Opcode::Shri => "SHRI",
            Opcode::And => "AND",
            Opcode::Or => "OR",
            Opcode::Xor => "XOR",
            Opcode::Not => "NOT",
            Opcode::Eq => "EQ",
            Opcode::Le => "LE",
            Opcode::Lt => "LT",
            Opcode::Eqi => "EQI",
            Opcode::Lei => "LEI",
            Opcode::Lti => "LTI",
            Opcode::Gei => "GEI",
            Opcode::Gti => "GTI",
            Opcode::Land => "LAND",
            Opcode::Lor => "LOR",
            Opcode::Lnot => "LNOT",
            Opcode::Typeof => "TYPEOF",
            Opcode::Test => "TEST",
            Opcode::Jmp => "JMP",
            Opcode::Jmpi => "JMPI",
            Opcode::CallNew => "CALL_NEW",
            Opcode::CallSet => "CALL_SET",
            Opcode::Call => "CALL",
            Opcode::TailCall => "TAIL_CALL",
            Opcode::CoCall => "CO_CALL",
            Opcode::Ret => "RET",
            Opcode::ArrayNew => "ARRAY_NEW",
            Opcode::ArrayGet => "ARRAY_GET",
            Opcode::ArraySet => "ARRAY_SET",
            Opcode::ArrayAdd => "ARRAY_ADD",
            Opcode::GlobalGet => "GLOBAL_GET",
            Opcode::GlobalSet => "GLOBAL_SET",
            Opcode::Throw => "THROW",
            Opcode::Echo => "ECHO",
        }
    }

    pub fn form(&self) -> EncForm {
        match self {
            Opcode::Nop | Opcode::Hlt => EncForm::I0,
            Opcode::Jmpi => EncForm::I1,
            Opcode::ArrayNew
            | Opcode::CallNew
            | Opcode::Call
            | Opcode::TailCall
            | Opcode::CoCall
            | Opcode::Ret
            | Opcode::Jmp
            | Opcode::Throw
            | Opcode::Echo => EncForm::I1Reg,
            Opcode::Movi
            | Opcode::Load
            | Opcode::Addi
            | Opcode::Subi
            | Opcode::Muli
            | Opcode::Divi
            | Opcode::Shli
            | Opcode::Shri
            | Opcode::Eqi
            | Opcode::Lei
            | Opcode::Lti
            | Opcode::Gei
            | Opcode::Gti
            | Opcode::Test
            | Opcode::GlobalGet
            | Opcode::GlobalSet => EncForm::I2,
            _ => EncForm::I3,
        }
    }
}
