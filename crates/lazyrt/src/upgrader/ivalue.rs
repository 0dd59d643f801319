//! Dynamically typed values manipulated by upgrader bytecode.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::tensor::Tensor;

use super::UpgraderError;

/// Interpreter value. Tensors compare equal when they share storage.
#[derive(Debug, Clone, Default)]
pub enum IValue {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Tensor(Tensor),
}

impl IValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            IValue::None => "NoneType",
            IValue::Bool(_) => "bool",
            IValue::Int(_) => "int",
            IValue::Double(_) => "float",
            IValue::String(_) => "str",
            IValue::Tensor(_) => "Tensor",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, IValue::None)
    }

    pub fn to_bool(&self) -> Result<bool, UpgraderError> {
        match self {
            IValue::Bool(value) => Ok(*value),
            other => Err(mismatch("bool", other)),
        }
    }

    pub fn to_int(&self) -> Result<i64, UpgraderError> {
        match self {
            IValue::Int(value) => Ok(*value),
            other => Err(mismatch("int", other)),
        }
    }

    /// Numeric value of an int or float.
    pub fn to_f64(&self) -> Result<f64, UpgraderError> {
        match self {
            IValue::Int(value) => Ok(*value as f64),
            IValue::Double(value) => Ok(*value),
            other => Err(mismatch("number", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str, UpgraderError> {
        match self {
            IValue::String(value) => Ok(value),
            other => Err(mismatch("str", other)),
        }
    }

    pub fn as_tensor(&self) -> Result<&Tensor, UpgraderError> {
        match self {
            IValue::Tensor(tensor) => Ok(tensor),
            other => Err(mismatch("Tensor", other)),
        }
    }
}

fn mismatch(expected: &'static str, found: &IValue) -> UpgraderError {
    UpgraderError::TypeMismatch {
        expected,
        found: found.type_name(),
    }
}

impl PartialEq for IValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (IValue::None, IValue::None) => true,
            (IValue::Bool(a), IValue::Bool(b)) => a == b,
            (IValue::Int(a), IValue::Int(b)) => a == b,
            (IValue::Double(a), IValue::Double(b)) => a == b,
            (IValue::String(a), IValue::String(b)) => a == b,
            (IValue::Tensor(a), IValue::Tensor(b)) => a.shares_storage(b),
            _ => false,
        }
    }
}

impl From<bool> for IValue {
    fn from(value: bool) -> Self {
        IValue::Bool(value)
    }
}

impl From<i64> for IValue {
    fn from(value: i64) -> Self {
        IValue::Int(value)
    }
}

impl From<f64> for IValue {
    fn from(value: f64) -> Self {
        IValue::Double(value)
    }
}

impl From<&str> for IValue {
    fn from(value: &str) -> Self {
        IValue::String(value.to_string())
    }
}

impl From<Tensor> for IValue {
    fn from(value: Tensor) -> Self {
        IValue::Tensor(value)
    }
}

impl fmt::Display for IValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IValue::None => write!(f, "None"),
            IValue::Bool(value) => write!(f, "{value}"),
            IValue::Int(value) => write!(f, "{value}"),
            IValue::Double(value) => write!(f, "{value}"),
            IValue::String(value) => write!(f, "{value:?}"),
            IValue::Tensor(tensor) => write!(f, "Tensor{}", tensor.spec()),
        }
    }
}

/// Constants serialize as plain JSON scalars; tensors as their spec string.
impl Serialize for IValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            IValue::None => serializer.serialize_unit(),
            IValue::Bool(value) => serializer.serialize_bool(*value),
            IValue::Int(value) => serializer.serialize_i64(*value),
            IValue::Double(value) => serializer.serialize_f64(*value),
            IValue::String(value) => serializer.serialize_str(value),
            IValue::Tensor(_) => serializer.collect_str(self),
        }
    }
}

/// Type names usable in a bytecode function's type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    NoneType,
    Bool,
    Int,
    Float,
    Str,
    Tensor,
}

impl TypeTag {
    pub fn parse(name: &str) -> Result<Self, UpgraderError> {
        Ok(match name {
            "NoneType" => TypeTag::NoneType,
            "bool" => TypeTag::Bool,
            "int" => TypeTag::Int,
            "float" => TypeTag::Float,
            "str" => TypeTag::Str,
            "Tensor" => TypeTag::Tensor,
            other => return Err(UpgraderError::UnknownType(other.to_string())),
        })
    }

    pub fn matches(self, value: &IValue) -> bool {
        matches!(
            (self, value),
            (TypeTag::NoneType, IValue::None)
                | (TypeTag::Bool, IValue::Bool(_))
                | (TypeTag::Int, IValue::Int(_))
                | (TypeTag::Float, IValue::Double(_))
                | (TypeTag::Str, IValue::String(_))
                | (TypeTag::Tensor, IValue::Tensor(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_tag_does_not_match_int() {
        let float = TypeTag::parse("float").unwrap();
        assert!(float.matches(&IValue::Double(2.0)));
        assert!(!float.matches(&IValue::Int(2)));
        assert!(TypeTag::parse("complex").is_err());
    }

    #[test]
    fn constants_serialize_as_json_scalars() {
        let constants = vec![IValue::from("trunc"), IValue::Bool(true), IValue::None];
        let json = serde_json::to_string(&constants).unwrap();
        assert_eq!(json, r#"["trunc",true,null]"#);
    }
}
