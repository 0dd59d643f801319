//! Binding of bytecode operator references to callables.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::function::{ByteCodeFunction, ByteCodeFunctionWithOperator, OperatorString};
use super::ivalue::{IValue, TypeTag};
use super::UpgraderError;

/// Operand stack shared between the interpreter and operators.
pub type Stack = Vec<IValue>;

/// Operator implementation: pops its arguments (last argument on top) and pushes results.
pub type OperatorFn = Arc<dyn Fn(&mut Stack) -> Result<(), UpgraderError> + Send + Sync>;

/// Pops the top of `stack`.
pub fn pop(stack: &mut Stack) -> Result<IValue, UpgraderError> {
    stack
        .pop()
        .ok_or_else(|| UpgraderError::StackUnderflow("operator argument missing".to_string()))
}

/// Schema and implementation of one operator overload.
#[derive(Clone)]
pub struct OperatorEntry {
    pub arity: usize,
    /// Defaults for the trailing `defaults.len()` arguments.
    pub defaults: Vec<IValue>,
    callable: OperatorFn,
}

impl OperatorEntry {
    pub fn new<F>(arity: usize, callable: F) -> Self
    where
        F: Fn(&mut Stack) -> Result<(), UpgraderError> + Send + Sync + 'static,
    {
        OperatorEntry {
            arity,
            defaults: Vec::new(),
            callable: Arc::new(callable),
        }
    }

    pub fn with_defaults(mut self, defaults: Vec<IValue>) -> Self {
        assert!(
            defaults.len() <= self.arity,
            "{} defaults for an operator of arity {}",
            defaults.len(),
            self.arity
        );
        self.defaults = defaults;
        self
    }

    pub fn call(&self, stack: &mut Stack) -> Result<(), UpgraderError> {
        (self.callable)(stack)
    }
}

impl fmt::Debug for OperatorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorEntry")
            .field("arity", &self.arity)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

/// Operators available to upgrader bytecode, keyed by `(name, overload)`.
#[derive(Debug, Default, Clone)]
pub struct OperatorRegistry {
    entries: HashMap<(String, String), OperatorEntry>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an overload, replacing any previous registration.
    pub fn register(&mut self, name: &str, overload: &str, entry: OperatorEntry) {
        self.entries
            .insert((name.to_string(), overload.to_string()), entry);
    }

    pub fn get(&self, name: &str, overload: &str) -> Option<&OperatorEntry> {
        self.entries.get(&(name.to_string(), overload.to_string()))
    }

    pub fn contains(&self, name: &str, overload: &str) -> bool {
        self.get(name, overload).is_some()
    }

    /// Binds every operator of `function` and parses its type table.
    pub fn resolve(
        &self,
        function: &ByteCodeFunctionWithOperator,
    ) -> Result<ExecutableFunction, UpgraderError> {
        let operators = function
            .operators
            .iter()
            .map(|operator| self.bind(operator))
            .collect::<Result<Vec<_>, _>>()?;
        let types = function
            .function
            .types
            .iter()
            .map(|name| TypeTag::parse(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ExecutableFunction {
            function: function.function.clone(),
            operators,
            types,
        })
    }

    fn bind(&self, operator: &OperatorString) -> Result<OperatorFn, UpgraderError> {
        let entry = self
            .get(&operator.name, &operator.overload_name)
            .ok_or_else(|| UpgraderError::UnknownOperator {
                name: operator.name.clone(),
                overload: operator.overload_name.clone(),
            })?;
        let specified = match operator.num_specified_args {
            Some(specified) if specified < entry.arity => specified,
            Some(specified) if specified > entry.arity => {
                return Err(UpgraderError::TooManyArguments {
                    name: operator.name.clone(),
                    overload: operator.overload_name.clone(),
                    specified,
                    arity: entry.arity,
                })
            }
            _ => return Ok(Arc::clone(&entry.callable)),
        };
        let first_default = entry.arity - entry.defaults.len();
        if specified < first_default {
            return Err(UpgraderError::MissingDefaults {
                name: operator.name.clone(),
                overload: operator.overload_name.clone(),
                specified,
                arity: entry.arity,
            });
        }
        let fill = entry.defaults[specified - first_default..].to_vec();
        let callable = Arc::clone(&entry.callable);
        Ok(Arc::new(move |stack: &mut Stack| {
            stack.extend(fill.iter().cloned());
            callable(stack)
        }))
    }
}

/// A bytecode function with its operators bound, ready for the interpreter.
#[derive(Clone)]
pub struct ExecutableFunction {
    pub(crate) function: ByteCodeFunction,
    pub(crate) operators: Vec<OperatorFn>,
    pub(crate) types: Vec<TypeTag>,
}

impl ExecutableFunction {
    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn function(&self) -> &ByteCodeFunction {
        &self.function
    }
}

impl fmt::Debug for ExecutableFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableFunction")
            .field("name", &self.function.name)
            .field("operators", &self.operators.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concat_registry() -> OperatorRegistry {
        let mut registry = OperatorRegistry::new();
        registry.register(
            "test::join",
            "",
            OperatorEntry::new(3, |stack| {
                let c = pop(stack)?;
                let b = pop(stack)?;
                let a = pop(stack)?;
                stack.push(IValue::String(format!("{a}{b}{c}")));
                Ok(())
            })
            .with_defaults(vec![IValue::from("y"), IValue::from("z")]),
        );
        registry
    }

    fn with_operator(num_specified_args: Option<usize>) -> ByteCodeFunctionWithOperator {
        ByteCodeFunctionWithOperator {
            function: ByteCodeFunction {
                name: "f".to_string(),
                instructions: Vec::new(),
                constants: Vec::new(),
                types: Vec::new(),
                register_size: 0,
            },
            operators: vec![OperatorString::new("test::join", "", num_specified_args)],
        }
    }

    #[test]
    fn missing_arguments_take_trailing_defaults() {
        let registry = concat_registry();
        let resolved = registry.resolve(&with_operator(Some(2))).unwrap();
        let mut stack = vec![IValue::from("a"), IValue::from("b")];
        (resolved.operators[0])(&mut stack).unwrap();
        assert_eq!(stack, vec![IValue::String("\"a\"\"b\"\"z\"".to_string())]);
    }

    #[test]
    fn too_few_arguments_without_defaults_fail() {
        let registry = concat_registry();
        assert!(matches!(
            registry.resolve(&with_operator(Some(0))),
            Err(UpgraderError::MissingDefaults { specified: 0, .. })
        ));
        assert!(matches!(
            registry.resolve(&with_operator(Some(4))),
            Err(UpgraderError::TooManyArguments { .. })
        ));
    }

    #[test]
    fn unknown_operator_is_reported() {
        let registry = OperatorRegistry::new();
        assert!(matches!(
            registry.resolve(&with_operator(None)),
            Err(UpgraderError::UnknownOperator { .. })
        ));
    }
}
