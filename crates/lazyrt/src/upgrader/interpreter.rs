//! Register-machine interpreter for upgrader bytecode.

use log::trace;

use super::instruction::OpCode;
use super::ivalue::IValue;
use super::registry::{ExecutableFunction, Stack};
use super::UpgraderError;

/// Executes [`ExecutableFunction`]s on a caller-owned stack.
///
/// Arguments are expected on the stack on entry and results are left there on `RET`.
/// Each run gets fresh registers; a run is bounded by `instructions² + 1` steps.
pub struct Interpreter;

impl Interpreter {
    pub fn run(function: &ExecutableFunction, stack: &mut Stack) -> Result<(), UpgraderError> {
        let code = &function.function;
        let instructions = &code.instructions;
        let budget = instructions.len() * instructions.len() + 1;
        let mut registers = vec![IValue::None; code.register_size];
        let mut pc = 0usize;

        for _ in 0..budget {
            let Some(instruction) = instructions.get(pc) else {
                return Err(UpgraderError::MissingReturn {
                    function: code.name.clone(),
                });
            };
            trace!("{} {pc:>3}: {instruction}", code.name);
            let x = instruction.x;
            let underflow = || {
                UpgraderError::StackUnderflow(format!(
                    "`{}` at pc {pc} ({instruction})",
                    code.name
                ))
            };
            let mut next = pc as i64 + 1;
            match instruction.op {
                OpCode::Op => {
                    let operator = function
                        .operators
                        .get(index(x))
                        .ok_or_else(|| invalid(function, pc, "operator index out of range"))?;
                    operator(stack)?;
                }
                OpCode::Load => {
                    let value = register(&mut registers, x, function, pc)?.clone();
                    stack.push(value);
                }
                OpCode::Move => {
                    let value = std::mem::take(register(&mut registers, x, function, pc)?);
                    stack.push(value);
                }
                OpCode::Store => {
                    let value = stack.pop().ok_or_else(underflow)?;
                    *register(&mut registers, x, function, pc)? = value;
                }
                OpCode::StoreN => {
                    for offset in (0..i32::from(instruction.n)).rev() {
                        let value = stack.pop().ok_or_else(underflow)?;
                        *register(&mut registers, x + offset, function, pc)? = value;
                    }
                }
                OpCode::Drop => {
                    stack.pop().ok_or_else(underflow)?;
                }
                OpCode::DropR => {
                    *register(&mut registers, x, function, pc)? = IValue::None;
                }
                OpCode::LoadC => {
                    let constant = code
                        .constants
                        .get(index(x))
                        .ok_or_else(|| invalid(function, pc, "constant index out of range"))?;
                    stack.push(constant.clone());
                }
                OpCode::Jf => {
                    let condition = stack.pop().ok_or_else(underflow)?.to_bool()?;
                    if !condition {
                        next = pc as i64 + i64::from(x);
                    }
                }
                OpCode::Jmp => {
                    next = pc as i64 + i64::from(x);
                }
                OpCode::IsInstance => {
                    let value = stack.pop().ok_or_else(underflow)?;
                    let start = index(x);
                    let types = function
                        .types
                        .get(start..start.saturating_add(usize::from(instruction.n)))
                        .ok_or_else(|| invalid(function, pc, "type range out of range"))?;
                    stack.push(IValue::Bool(types.iter().any(|tag| tag.matches(&value))));
                }
                OpCode::Ret => return Ok(()),
            }
            if next < 0 || next >= instructions.len() as i64 {
                return Err(UpgraderError::JumpOutOfRange {
                    function: code.name.clone(),
                    pc,
                    target: next,
                });
            }
            pc = next as usize;
        }
        Err(UpgraderError::StepBudgetExceeded {
            function: code.name.clone(),
            budget,
        })
    }
}

fn index(x: i32) -> usize {
    usize::try_from(x).unwrap_or(usize::MAX)
}

fn invalid(function: &ExecutableFunction, pc: usize, reason: &str) -> UpgraderError {
    UpgraderError::InvalidFunction {
        function: function.name().to_string(),
        pc,
        reason: reason.to_string(),
    }
}

fn register<'a>(
    registers: &'a mut [IValue],
    x: i32,
    function: &ExecutableFunction,
    pc: usize,
) -> Result<&'a mut IValue, UpgraderError> {
    index(x)
        .checked_sub(1)
        .and_then(|slot| registers.get_mut(slot))
        .ok_or_else(|| invalid(function, pc, "register out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upgrader::{
        ByteCodeFunction, ByteCodeFunctionWithOperator, Instruction, OperatorRegistry,
    };

    fn run(
        instructions: Vec<Instruction>,
        constants: Vec<IValue>,
        types: Vec<&str>,
        register_size: usize,
        stack: &mut Stack,
    ) -> Result<(), UpgraderError> {
        let function = ByteCodeFunctionWithOperator {
            function: ByteCodeFunction {
                name: "t".to_string(),
                instructions,
                constants,
                types: types.into_iter().map(str::to_string).collect(),
                register_size,
            },
            operators: Vec::new(),
        };
        let resolved = OperatorRegistry::new().resolve(&function)?;
        Interpreter::run(&resolved, stack)
    }

    #[test]
    fn storen_fills_registers_in_argument_order() {
        let mut stack = vec![IValue::Int(1), IValue::Int(2)];
        run(
            vec![
                Instruction::new(OpCode::StoreN, 1, 2),
                Instruction::new(OpCode::Move, 2, 0),
                Instruction::new(OpCode::Move, 1, 0),
                Instruction::new(OpCode::Ret, 0, 0),
            ],
            Vec::new(),
            Vec::new(),
            2,
            &mut stack,
        )
        .unwrap();
        assert_eq!(stack, vec![IValue::Int(2), IValue::Int(1)]);
    }

    #[test]
    fn jf_jumps_on_false_and_isinstance_checks_types() {
        let mut stack = vec![IValue::Int(3)];
        run(
            vec![
                Instruction::new(OpCode::IsInstance, 0, 1),
                Instruction::new(OpCode::Jf, 3, 0),
                Instruction::new(OpCode::LoadC, 0, 0),
                Instruction::new(OpCode::Ret, 0, 0),
                Instruction::new(OpCode::LoadC, 1, 0),
                Instruction::new(OpCode::Ret, 0, 0),
            ],
            vec![IValue::from("float"), IValue::from("other")],
            vec!["float"],
            0,
            &mut stack,
        )
        .unwrap();
        assert_eq!(stack, vec![IValue::from("other")]);
    }

    #[test]
    fn infinite_loop_hits_step_budget() {
        let mut stack = Stack::new();
        let err = run(
            vec![
                Instruction::new(OpCode::Jmp, 0, 0),
                Instruction::new(OpCode::Ret, 0, 0),
            ],
            Vec::new(),
            Vec::new(),
            0,
            &mut stack,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            UpgraderError::StepBudgetExceeded { budget: 5, .. }
        ));
    }

    #[test]
    fn store_from_empty_stack_underflows() {
        let mut stack = Stack::new();
        let err = run(
            vec![
                Instruction::new(OpCode::Store, 1, 0),
                Instruction::new(OpCode::Ret, 0, 0),
            ],
            Vec::new(),
            Vec::new(),
            1,
            &mut stack,
        )
        .unwrap_err();
        assert!(matches!(err, UpgraderError::StackUnderflow(_)));
    }
}
