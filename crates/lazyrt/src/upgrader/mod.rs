//! Operator version upgraders.
//!
//! Models serialized against an older operator schema are kept runnable by routing calls
//! of a versioned operator through a small bytecode function that reproduces the old
//! semantics with current operators. The builtin table covers the `aten::div` family,
//! whose integer division switched from truncation to true division at version 4.
//!
//! The pieces:
//! - [`UpgraderTable`] maps operator names to version ranges and bytecode functions.
//! - [`OperatorRegistry`] binds the operator names referenced by bytecode to callables.
//! - [`Interpreter`] runs a resolved function on a caller-owned [`Stack`].

mod function;
mod instruction;
mod interpreter;
mod ivalue;
mod registry;
mod table;

use thiserror::Error;

pub use function::{ByteCodeFunction, ByteCodeFunctionWithOperator, OperatorString};
pub use instruction::{Instruction, OpCode};
pub use interpreter::Interpreter;
pub use ivalue::{IValue, TypeTag};
pub use registry::{pop, ExecutableFunction, OperatorEntry, OperatorFn, OperatorRegistry, Stack};
pub use table::{Upgrader, UpgraderTable};

#[derive(Debug, Error)]
pub enum UpgraderError {
    #[error("invalid bytecode in `{function}` at pc {pc}: {reason}")]
    InvalidFunction {
        function: String,
        pc: usize,
        reason: String,
    },
    #[error("`{function}` does not end with RET")]
    MissingReturn { function: String },
    #[error("unknown type `{0}` in bytecode type table")]
    UnknownType(String),
    #[error("operator {name}.{overload} is not registered")]
    UnknownOperator { name: String, overload: String },
    #[error("operator {name}.{overload} called with {specified} arguments but takes {arity}")]
    TooManyArguments {
        name: String,
        overload: String,
        specified: usize,
        arity: usize,
    },
    #[error("operator {name}.{overload} has no defaults for arguments {specified}..{arity}")]
    MissingDefaults {
        name: String,
        overload: String,
        specified: usize,
        arity: usize,
    },
    #[error("stack underflow: {0}")]
    StackUnderflow(String),
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("jump in `{function}` at pc {pc} lands outside the function (target {target})")]
    JumpOutOfRange {
        function: String,
        pc: usize,
        target: i64,
    },
    #[error("`{function}` exceeded its step budget of {budget}")]
    StepBudgetExceeded { function: String, budget: usize },
    #[error("operator failed: {0}")]
    Operator(String),
    #[error("upgrader table refers to missing function index {index} for {op_name}")]
    MissingFunction { op_name: String, index: usize },
}
