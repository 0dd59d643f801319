//! Operator version map and the builtin upgrader functions.

use std::collections::BTreeMap;

use log::debug;
use once_cell::sync::OnceCell;
use serde::Serialize;

use super::function::{ByteCodeFunction, ByteCodeFunctionWithOperator, OperatorString};
use super::instruction::OpCode::{
    DropR, IsInstance, Jf, Jmp, Load, LoadC, Move, Op, Ret, Store, StoreN,
};
use super::instruction::{Instruction, OpCode};
use super::interpreter::Interpreter;
use super::ivalue::IValue;
use super::registry::{OperatorRegistry, Stack};
use super::UpgraderError;

/// Routes calls of an operator serialized at `min_version..=max_version` through the
/// function at `index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Upgrader {
    pub min_version: u32,
    pub max_version: u32,
    pub upgrader_name: String,
    pub index: usize,
}

impl Upgrader {
    /// Both ends of the range are inclusive.
    pub fn covers(&self, version: u32) -> bool {
        self.min_version <= version && version <= self.max_version
    }
}

/// Version map plus the bytecode functions it points at.
#[derive(Debug, Clone, Serialize)]
pub struct UpgraderTable {
    operator_version_map: BTreeMap<String, Vec<Upgrader>>,
    functions: Vec<ByteCodeFunctionWithOperator>,
}

impl UpgraderTable {
    /// Builds a table, validating every function and every index the map refers to.
    pub fn new(
        operator_version_map: BTreeMap<String, Vec<Upgrader>>,
        functions: Vec<ByteCodeFunctionWithOperator>,
    ) -> Result<Self, UpgraderError> {
        for function in &functions {
            function.validate()?;
        }
        for (op_name, upgraders) in &operator_version_map {
            for upgrader in upgraders {
                if upgrader.index >= functions.len() {
                    return Err(UpgraderError::MissingFunction {
                        op_name: op_name.clone(),
                        index: upgrader.index,
                    });
                }
            }
        }
        Ok(UpgraderTable {
            operator_version_map,
            functions,
        })
    }

    /// The `aten::div` upgraders, built and validated on first use.
    pub fn builtin() -> &'static UpgraderTable {
        static BUILTIN: OnceCell<UpgraderTable> = OnceCell::new();
        BUILTIN.get_or_init(|| {
            let (map, functions) = builtin_div_upgraders();
            let table = UpgraderTable::new(map, functions)
                .unwrap_or_else(|err| panic!("builtin upgrader table is invalid: {err}"));
            debug!(
                "loaded {} builtin upgrader functions",
                table.functions.len()
            );
            table
        })
    }

    pub fn upgraders(&self, op_name: &str) -> &[Upgrader] {
        self.operator_version_map
            .get(op_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First upgrader for `op_name` whose range contains `version`.
    pub fn select(&self, op_name: &str, version: u32) -> Option<&Upgrader> {
        self.upgraders(op_name)
            .iter()
            .find(|upgrader| upgrader.covers(version))
    }

    pub fn function(&self, index: usize) -> Option<&ByteCodeFunctionWithOperator> {
        self.functions.get(index)
    }

    pub fn function_by_name(&self, name: &str) -> Option<&ByteCodeFunctionWithOperator> {
        self.functions.iter().find(|function| function.name() == name)
    }

    pub fn functions(&self) -> &[ByteCodeFunctionWithOperator] {
        &self.functions
    }

    pub fn operator_version_map(&self) -> &BTreeMap<String, Vec<Upgrader>> {
        &self.operator_version_map
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Runs the upgrader for `op_name` at `version` on `stack`, if one applies.
    /// Returns `false` (leaving the stack untouched) when the call needs no upgrade.
    pub fn run_upgrader(
        &self,
        op_name: &str,
        version: u32,
        registry: &OperatorRegistry,
        stack: &mut Stack,
    ) -> Result<bool, UpgraderError> {
        let Some(upgrader) = self.select(op_name, version) else {
            return Ok(false);
        };
        let function = self
            .function(upgrader.index)
            .ok_or_else(|| UpgraderError::MissingFunction {
                op_name: op_name.to_string(),
                index: upgrader.index,
            })?;
        debug!(
            "upgrading {op_name} at version {version} through {}",
            upgrader.upgrader_name
        );
        let executable = registry.resolve(function)?;
        Interpreter::run(&executable, stack)?;
        Ok(true)
    }
}

type Code = [(OpCode, i32, u16)];

fn bytecode_function(
    name: &str,
    code: &Code,
    types: &[&str],
    register_size: usize,
    operators: &[(&str, &str, usize)],
) -> ByteCodeFunctionWithOperator {
    ByteCodeFunctionWithOperator {
        function: ByteCodeFunction {
            name: name.to_string(),
            instructions: code
                .iter()
                .map(|&(op, x, n)| Instruction::new(op, x, n))
                .collect(),
            constants: vec![IValue::from("trunc"), IValue::Bool(true)],
            types: types.iter().map(|name| name.to_string()).collect(),
            register_size,
        },
        operators: operators
            .iter()
            .map(|&(name, overload, args)| OperatorString::new(name, overload, Some(args)))
            .collect(),
    }
}

// (self, other): true division when either side is floating point, else truncation.
const DIV_TENSOR: &Code = &[
    (StoreN, 1, 2),
    (Load, 1, 0),
    (Op, 0, 0),
    (Jf, 3, 0),
    (LoadC, 1, 0),
    (Jmp, 3, 0),
    (Load, 2, 0),
    (Op, 0, 0),
    (Store, 3, 0),
    (Move, 3, 0),
    (Jf, 5, 0),
    (Load, 1, 0),
    (Load, 2, 0),
    (Op, 1, 0),
    (Jmp, 5, 0),
    (Load, 1, 0),
    (Load, 2, 0),
    (LoadC, 0, 0),
    (Op, 2, 0),
    (Store, 4, 0),
    (DropR, 2, 0),
    (DropR, 1, 0),
    (Move, 4, 0),
    (Ret, 0, 0),
];

// (self, other: Scalar): the scalar side is checked with ISINSTANCE float.
const DIV_SCALAR: &Code = &[
    (StoreN, 1, 2),
    (Load, 1, 0),
    (Op, 0, 0),
    (Jf, 3, 0),
    (LoadC, 1, 0),
    (Jmp, 3, 0),
    (Load, 2, 0),
    (IsInstance, 0, 1),
    (Store, 3, 0),
    (Move, 3, 0),
    (Jf, 5, 0),
    (Load, 1, 0),
    (Load, 2, 0),
    (Op, 1, 0),
    (Jmp, 6, 0),
    (Load, 1, 0),
    (Load, 2, 0),
    (Op, 2, 0),
    (LoadC, 0, 0),
    (Op, 3, 0),
    (Store, 4, 0),
    (DropR, 2, 0),
    (DropR, 1, 0),
    (Move, 4, 0),
    (Ret, 0, 0),
];

// (self, other, out): any floating-point operand selects true division.
const DIV_OUT: &Code = &[
    (StoreN, 1, 3),
    (Load, 1, 0),
    (Op, 0, 0),
    (Jf, 3, 0),
    (LoadC, 1, 0),
    (Jmp, 3, 0),
    (Load, 2, 0),
    (Op, 0, 0),
    (Jf, 3, 0),
    (LoadC, 1, 0),
    (Jmp, 3, 0),
    (Load, 3, 0),
    (Op, 0, 0),
    (Store, 4, 0),
    (Move, 4, 0),
    (Jf, 6, 0),
    (Load, 1, 0),
    (Load, 2, 0),
    (Load, 3, 0),
    (Op, 1, 0),
    (Jmp, 6, 0),
    (Load, 1, 0),
    (Load, 2, 0),
    (LoadC, 0, 0),
    (Load, 3, 0),
    (Op, 2, 0),
    (Store, 5, 0),
    (DropR, 3, 0),
    (DropR, 2, 0),
    (DropR, 1, 0),
    (Move, 5, 0),
    (Ret, 0, 0),
];

const IS_FLOATING_POINT: (&str, &str, usize) = ("aten::is_floating_point", "", 1);
const UNCHECKED_CAST: (&str, &str, usize) = ("prim::unchecked_cast", "", 1);

fn builtin_div_upgraders() -> (
    BTreeMap<String, Vec<Upgrader>>,
    Vec<ByteCodeFunctionWithOperator>,
) {
    let functions = vec![
        bytecode_function(
            "div_Tensor_0_3",
            DIV_TENSOR,
            &[],
            4,
            &[
                IS_FLOATING_POINT,
                ("aten::div", "Tensor", 2),
                ("aten::div", "Tensor_mode", 3),
            ],
        ),
        bytecode_function(
            "div_Scalar_0_3",
            DIV_SCALAR,
            &["float"],
            4,
            &[
                IS_FLOATING_POINT,
                ("aten::div", "Scalar", 2),
                UNCHECKED_CAST,
                ("aten::div", "Scalar_mode", 3),
            ],
        ),
        bytecode_function(
            "div_out_0_3",
            DIV_OUT,
            &[],
            5,
            &[
                IS_FLOATING_POINT,
                ("aten::div", "out", 3),
                ("aten::div", "out_mode", 4),
            ],
        ),
        bytecode_function(
            "div__Tensor_0_3",
            DIV_TENSOR,
            &[],
            4,
            &[
                IS_FLOATING_POINT,
                ("aten::div_", "Tensor", 2),
                ("aten::div_", "Tensor_mode", 3),
            ],
        ),
        bytecode_function(
            "div__Scalar_0_3",
            DIV_SCALAR,
            &["float"],
            4,
            &[
                IS_FLOATING_POINT,
                ("aten::div_", "Scalar", 2),
                UNCHECKED_CAST,
                ("aten::div_", "Scalar_mode", 3),
            ],
        ),
    ];
    let map = [
        ("aten::div.Tensor", "div_Tensor_0_3"),
        ("aten::div.Scalar", "div_Scalar_0_3"),
        ("aten::div.out", "div_out_0_3"),
        ("aten::div_.Tensor", "div__Tensor_0_3"),
        ("aten::div_.Scalar", "div__Scalar_0_3"),
    ]
    .into_iter()
    .enumerate()
    .map(|(index, (op_name, upgrader_name))| {
        let upgrader = Upgrader {
            min_version: 0,
            max_version: 3,
            upgrader_name: upgrader_name.to_string(),
            index,
        };
        (op_name.to_string(), vec![upgrader])
    })
    .collect();
    (map, functions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_functions_validate() {
        let table = UpgraderTable::builtin();
        assert_eq!(table.functions().len(), 5);
        for function in table.functions() {
            function.validate().unwrap();
        }
    }

    #[test]
    fn version_range_is_inclusive() {
        let table = UpgraderTable::builtin();
        assert!(table.select("aten::div.Tensor", 0).is_some());
        assert!(table.select("aten::div.Tensor", 3).is_some());
        assert!(table.select("aten::div.Tensor", 4).is_none());
        assert!(table.select("aten::mul.Tensor", 0).is_none());
    }

    #[test]
    fn map_indices_point_at_named_functions() {
        let table = UpgraderTable::builtin();
        for upgraders in table.operator_version_map().values() {
            for upgrader in upgraders {
                let function = table.function(upgrader.index).unwrap();
                assert_eq!(function.name(), upgrader.upgrader_name);
            }
        }
    }

    #[test]
    fn unknown_index_is_rejected() {
        let mut map = BTreeMap::new();
        map.insert(
            "aten::div.Tensor".to_string(),
            vec![Upgrader {
                min_version: 0,
                max_version: 3,
                upgrader_name: "missing".to_string(),
                index: 0,
            }],
        );
        assert!(matches!(
            UpgraderTable::new(map, Vec::new()),
            Err(UpgraderError::MissingFunction { index: 0, .. })
        ));
    }
}
