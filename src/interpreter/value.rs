//! Runtime values and their arithmetic.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::program::Number;

/// Value produced while evaluating EDL expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// 64-bit signed integer
    Int(i64),
    /// Double precision float
    Float(f64),
    /// String (only used for messages and names)
    Str(String),
    /// One-dimensional array
    Array(Vec<Value>),
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `!x`
    Not,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// `^`
    Pow,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `&`
    And,
    /// `|`
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Pow => "^",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
        }
    }
}

impl Value {
    /// Name of the value's type for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
        }
    }

    /// Numeric value as `f64`, if the value is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value as a loop bound.
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Int(v) => Some(Number::Int(*v)),
            Value::Float(v) => Some(Number::Float(*v)),
            _ => None,
        }
    }

    /// Truth value of a numeric value; `None` for strings and arrays.
    pub fn truth(&self) -> Option<bool> {
        match self {
            Value::Int(v) => Some(*v != 0),
            Value::Float(v) => Some(*v != 0.0),
            _ => None,
        }
    }

    fn from_bool(flag: bool) -> Value {
        Value::Int(flag as i64)
    }
}

impl From<Number> for Value {
    fn from(number: Number) -> Self {
        match number {
            Number::Int(v) => Value::Int(v),
            Number::Float(v) => Value::Float(v),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => f.write_str(s),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Apply a unary operator. Errors are plain messages; the caller attaches
/// the location.
pub fn unary(op: UnaryOp, value: Value) -> Result<Value, String> {
    match (op, value) {
        (UnaryOp::Neg, Value::Int(v)) => v
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| "integer overflow in negation".to_string()),
        (UnaryOp::Neg, Value::Float(v)) => Ok(Value::Float(-v)),
        (UnaryOp::Not, value) => value
            .truth()
            .map(|t| Value::from_bool(!t))
            .ok_or_else(|| format!("cannot apply '!' to {}", value.type_name())),
        (UnaryOp::Neg, value) => Err(format!("cannot negate {}", value.type_name())),
    }
}

/// Apply a binary operator. Integers combined with floats are promoted.
pub fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, String> {
    use BinaryOp::*;

    match (op, &lhs, &rhs) {
        (And, _, _) | (Or, _, _) => {
            let (Some(a), Some(b)) = (lhs.truth(), rhs.truth()) else {
                return Err(mismatch(op, &lhs, &rhs));
            };
            Ok(Value::from_bool(if op == And { a && b } else { a || b }))
        }
        (Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
        (Eq, Value::Str(a), Value::Str(b)) => Ok(Value::from_bool(a == b)),
        (Ne, Value::Str(a), Value::Str(b)) => Ok(Value::from_bool(a != b)),
        (_, Value::Int(a), Value::Int(b)) => int_binary(op, *a, *b),
        (_, Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let a = lhs.as_f64().unwrap_or_default();
            let b = rhs.as_f64().unwrap_or_default();
            float_binary(op, a, b)
        }
        _ => Err(mismatch(op, &lhs, &rhs)),
    }
}

fn mismatch(op: BinaryOp, lhs: &Value, rhs: &Value) -> String {
    format!(
        "operator '{}' not defined for {} and {}",
        op.symbol(),
        lhs.type_name(),
        rhs.type_name()
    )
}

fn int_binary(op: BinaryOp, a: i64, b: i64) -> Result<Value, String> {
    use BinaryOp::*;

    let overflow = || format!("integer overflow in '{}'", op.symbol());
    let value = match op {
        Add => Value::Int(a.checked_add(b).ok_or_else(overflow)?),
        Sub => Value::Int(a.checked_sub(b).ok_or_else(overflow)?),
        Mul => Value::Int(a.checked_mul(b).ok_or_else(overflow)?),
        Div | Rem if b == 0 => return Err("integer division by zero".to_string()),
        Div => Value::Int(a.checked_div(b).ok_or_else(overflow)?),
        Rem => Value::Int(a.checked_rem(b).ok_or_else(overflow)?),
        Pow if b < 0 => Value::Float((a as f64).powf(b as f64)),
        Pow => {
            let exp = u32::try_from(b).map_err(|_| overflow())?;
            Value::Int(a.checked_pow(exp).ok_or_else(overflow)?)
        }
        Eq => Value::from_bool(a == b),
        Ne => Value::from_bool(a != b),
        Lt => Value::from_bool(a < b),
        Le => Value::from_bool(a <= b),
        Gt => Value::from_bool(a > b),
        Ge => Value::from_bool(a >= b),
        And => Value::from_bool(a != 0 && b != 0),
        Or => Value::from_bool(a != 0 || b != 0),
    };
    Ok(value)
}

fn float_binary(op: BinaryOp, a: f64, b: f64) -> Result<Value, String> {
    use BinaryOp::*;

    let value = match op {
        Add => Value::Float(a + b),
        Sub => Value::Float(a - b),
        Mul => Value::Float(a * b),
        Div | Rem if b == 0.0 => return Err("division by zero".to_string()),
        Div => Value::Float(a / b),
        Rem => Value::Float(a % b),
        Pow => Value::Float(a.powf(b)),
        Eq => Value::from_bool(a == b),
        Ne => Value::from_bool(a != b),
        Lt => Value::from_bool(a < b),
        Le => Value::from_bool(a <= b),
        Gt => Value::from_bool(a > b),
        Ge => Value::from_bool(a >= b),
        And => Value::from_bool(a != 0.0 && b != 0.0),
        Or => Value::from_bool(a != 0.0 || b != 0.0),
    };
    match value {
        Value::Float(v) if !v.is_finite() => Err(format!(
            "floating point result of '{}' is not finite",
            op.symbol()
        )),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion() {
        assert_eq!(
            binary(BinaryOp::Add, Value::Int(1), Value::Float(0.5)),
            Ok(Value::Float(1.5))
        );
        assert_eq!(
            binary(BinaryOp::Div, Value::Int(7), Value::Int(2)),
            Ok(Value::Int(3))
        );
    }

    #[test]
    fn test_division_by_zero_is_an_error() {
        assert!(binary(BinaryOp::Div, Value::Int(1), Value::Int(0)).is_err());
        assert!(binary(BinaryOp::Rem, Value::Float(1.0), Value::Float(0.0)).is_err());
    }

    #[test]
    fn test_comparison_and_logic() {
        assert_eq!(
            binary(BinaryOp::Le, Value::Int(2), Value::Float(2.0)),
            Ok(Value::Int(1))
        );
        assert_eq!(
            binary(BinaryOp::And, Value::Int(1), Value::Float(0.0)),
            Ok(Value::Int(0))
        );
        assert!(binary(BinaryOp::Or, Value::Str("a".into()), Value::Int(1)).is_err());
        assert_eq!(unary(UnaryOp::Not, Value::Int(0)), Ok(Value::Int(1)));
    }

    #[test]
    fn test_power() {
        assert_eq!(
            binary(BinaryOp::Pow, Value::Int(2), Value::Int(10)),
            Ok(Value::Int(1024))
        );
        assert_eq!(
            binary(BinaryOp::Pow, Value::Int(2), Value::Int(-1)),
            Ok(Value::Float(0.5))
        );
    }

    #[test]
    fn test_display() {
        let array = Value::Array(vec![Value::Int(1), Value::Float(2.5), Value::Str("x".into())]);
        assert_eq!(array.to_string(), "[1, 2.5, x]");
    }
}
