//! Bytecode functions and their static validation.

use serde::Serialize;

use super::instruction::{Instruction, OpCode};
use super::ivalue::{IValue, TypeTag};
use super::UpgraderError;

/// Operator referenced by an `OP` instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorString {
    pub name: String,
    pub overload_name: String,
    /// Arguments the call site passes; missing trailing arguments take schema defaults.
    pub num_specified_args: Option<usize>,
}

impl OperatorString {
    pub fn new(name: &str, overload_name: &str, num_specified_args: Option<usize>) -> Self {
        OperatorString {
            name: name.to_string(),
            overload_name: overload_name.to_string(),
            num_specified_args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ByteCodeFunction {
    pub name: String,
    pub instructions: Vec<Instruction>,
    pub constants: Vec<IValue>,
    pub types: Vec<String>,
    pub register_size: usize,
}

impl ByteCodeFunction {
    /// Checks register, constant, type and operator indices, jump targets, and the
    /// trailing `RET`.
    pub fn validate(&self, num_operators: usize) -> Result<(), UpgraderError> {
        for name in &self.types {
            TypeTag::parse(name)?;
        }
        match self.instructions.last() {
            Some(last) if last.op == OpCode::Ret => {}
            _ => {
                return Err(UpgraderError::MissingReturn {
                    function: self.name.clone(),
                })
            }
        }
        for (pc, instruction) in self.instructions.iter().enumerate() {
            self.validate_instruction(pc, instruction, num_operators)?;
        }
        Ok(())
    }

    fn validate_instruction(
        &self,
        pc: usize,
        instruction: &Instruction,
        num_operators: usize,
    ) -> Result<(), UpgraderError> {
        let x = instruction.x;
        let n = usize::from(instruction.n);
        let invalid = |reason: String| UpgraderError::InvalidFunction {
            function: self.name.clone(),
            pc,
            reason,
        };
        let index = |limit: usize, what: &str| -> Result<usize, UpgraderError> {
            usize::try_from(x)
                .ok()
                .filter(|&index| index < limit)
                .ok_or_else(|| invalid(format!("{what} index {x} out of range ({limit})")))
        };
        match instruction.op {
            OpCode::Load | OpCode::Move | OpCode::Store | OpCode::DropR => {
                self.check_registers(x, 1).map_err(invalid)?;
            }
            OpCode::StoreN => {
                if n == 0 {
                    return Err(invalid("STOREN of zero registers".to_string()));
                }
                self.check_registers(x, n).map_err(invalid)?;
            }
            OpCode::LoadC => {
                index(self.constants.len(), "constant")?;
            }
            OpCode::Op => {
                index(num_operators, "operator")?;
            }
            OpCode::IsInstance => {
                let start = index(self.types.len(), "type")?;
                if start + n > self.types.len() {
                    return Err(invalid(format!(
                        "type range {start}..{} out of range ({})",
                        start + n,
                        self.types.len()
                    )));
                }
            }
            OpCode::Jf | OpCode::Jmp => {
                let target = pc as i64 + i64::from(x);
                if target < 0 || target >= self.instructions.len() as i64 {
                    return Err(UpgraderError::JumpOutOfRange {
                        function: self.name.clone(),
                        pc,
                        target,
                    });
                }
            }
            OpCode::Drop | OpCode::Ret => {}
        }
        Ok(())
    }

    fn check_registers(&self, first: i32, count: usize) -> Result<(), String> {
        if first < 1 {
            return Err(format!("register {first} out of range (registers start at 1)"));
        }
        let last = first as usize + count - 1;
        if last > self.register_size {
            return Err(format!(
                "register {last} exceeds register size {}",
                self.register_size
            ));
        }
        Ok(())
    }
}

/// A bytecode function together with the operators its `OP` instructions index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ByteCodeFunctionWithOperator {
    pub function: ByteCodeFunction,
    pub operators: Vec<OperatorString>,
}

impl ByteCodeFunctionWithOperator {
    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn validate(&self) -> Result<(), UpgraderError> {
        self.function.validate(self.operators.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(instructions: Vec<Instruction>, register_size: usize) -> ByteCodeFunction {
        ByteCodeFunction {
            name: "test".to_string(),
            instructions,
            constants: vec![IValue::Bool(true)],
            types: vec!["float".to_string()],
            register_size,
        }
    }

    #[test]
    fn rejects_register_past_size() {
        let f = function(
            vec![
                Instruction::new(OpCode::StoreN, 1, 3),
                Instruction::new(OpCode::Ret, 0, 0),
            ],
            2,
        );
        assert!(matches!(
            f.validate(0),
            Err(UpgraderError::InvalidFunction { pc: 0, .. })
        ));
    }

    #[test]
    fn rejects_jump_outside_function() {
        let f = function(
            vec![
                Instruction::new(OpCode::LoadC, 0, 0),
                Instruction::new(OpCode::Jf, 5, 0),
                Instruction::new(OpCode::Ret, 0, 0),
            ],
            0,
        );
        assert!(matches!(
            f.validate(0),
            Err(UpgraderError::JumpOutOfRange { pc: 1, target: 6, .. })
        ));
    }

    #[test]
    fn requires_trailing_ret() {
        let f = function(vec![Instruction::new(OpCode::LoadC, 0, 0)], 0);
        assert!(matches!(
            f.validate(0),
            Err(UpgraderError::MissingReturn { .. })
        ));
    }
}
