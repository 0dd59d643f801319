//! Bytecode instruction encoding.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Register-machine opcodes. Registers are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpCode {
    /// Call operator `X` on the stack.
    Op,
    /// Push a copy of register `X`.
    Load,
    /// Push register `X` and clear it.
    Move,
    /// Pop into register `X`.
    Store,
    /// Pop `N` values into registers `X..X+N`, last value into the highest register.
    StoreN,
    /// Pop and discard.
    Drop,
    /// Clear register `X`.
    DropR,
    /// Push constant `X`.
    LoadC,
    /// Pop a bool; fall through when true, jump by `X` when false.
    Jf,
    /// Jump by `X`.
    Jmp,
    /// Pop a value; push whether it matches any of types `X..X+N`.
    IsInstance,
    /// Return to the caller.
    Ret,
}

impl OpCode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Op => "OP",
            OpCode::Load => "LOAD",
            OpCode::Move => "MOVE",
            OpCode::Store => "STORE",
            OpCode::StoreN => "STOREN",
            OpCode::Drop => "DROP",
            OpCode::DropR => "DROPR",
            OpCode::LoadC => "LOADC",
            OpCode::Jf => "JF",
            OpCode::Jmp => "JMP",
            OpCode::IsInstance => "ISINSTANCE",
            OpCode::Ret => "RET",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    pub op: OpCode,
    pub x: i32,
    pub n: u16,
}

impl Instruction {
    pub const fn new(op: OpCode, x: i32, n: u16) -> Self {
        Instruction { op, x, n }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.op.mnemonic(), self.x, self.n)
    }
}
