use std::fmt;
use crate::core::{ProxyError, Result};

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Boolean(bool),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Integer(_) => "INTEGER",
            Self::Float(_) => "FLOAT",
            Self::Text(_) => "TEXT",
            Self::Boolean(_) => "BOOLEAN",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Float with `-0.0` folded into `0.0` and every NaN into one form.
    pub fn canonical_float(f: f64) -> f64 {
        if f == 0.0 {
            0.0
        } else if f.is_nan() {
            f64::NAN
        } else {
            f
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => {
                Self::canonical_float(*a).to_bits() == Self::canonical_float(*b).to_bits()
            }
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(fl) => {
                if fl.is_nan() {
                    write!(f, "NaN")
                } else if fl.is_infinite() {
                    if *fl > 0.0 {
                        write!(f, "Infinity")
                    } else {
                        write!(f, "-Infinity")
                    }
                } else {
                    write!(f, "{}", fl)
                }
            }
            Self::Text(s) => write!(f, "{}", s),
            Self::Boolean(b) => write!(f, "{}", b),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Declared type of a proxied function argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Integer,
    Float,
    Text,
    Boolean,
}

impl DataType {
    /// Maps a SQL type name (`int4`, `bigint`, `varchar(32)`, ...) to a declared type.
    pub fn parse(name: &str) -> Result<Self> {
        Self::parse_declared(name).map(|(data_type, _)| data_type)
    }

    /// Like [`DataType::parse`], also returning the normalized type text
    /// (`"VARCHAR (32)"` becomes `"varchar(32)"`) for use in parameter casts.
    pub fn parse_declared(name: &str) -> Result<(Self, String)> {
        let lowered = name
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_lowercase();
        let (base, modifier) = match lowered.split_once('(') {
            Some((base, rest)) => (base.trim(), Some(rest)),
            None => (lowered.as_str(), None),
        };

        let data_type = Self::from_base_name(base).ok_or_else(|| {
            ProxyError::DirectiveSyntax(format!("unsupported argument type '{}'", name.trim()))
        })?;

        let declared = match modifier {
            None => base.to_string(),
            Some(rest) => {
                let inner = rest.strip_suffix(')').ok_or_else(|| {
                    ProxyError::DirectiveSyntax(format!("malformed type '{}'", name.trim()))
                })?;
                let numbers = inner
                    .split(',')
                    .map(|part| part.trim())
                    .collect::<Vec<_>>();
                let valid = numbers.len() <= 2
                    && numbers
                        .iter()
                        .all(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
                if !valid {
                    return Err(ProxyError::DirectiveSyntax(format!(
                        "malformed type modifier in '{}'",
                        name.trim()
                    )));
                }
                format!("{}({})", base, numbers.join(","))
            }
        };
        Ok((data_type, declared))
    }

    fn from_base_name(base: &str) -> Option<Self> {
        match base {
            "int" | "int2" | "int4" | "int8" | "integer" | "smallint" | "bigint" => {
                Some(Self::Integer)
            }
            "float" | "float4" | "float8" | "real" | "double precision" | "numeric"
            | "decimal" => Some(Self::Float),
            "text" | "varchar" | "character varying" | "char" | "character" | "bpchar"
            | "name" => Some(Self::Text),
            "bool" | "boolean" => Some(Self::Boolean),
            _ => None,
        }
    }

    /// Cast used for an argument declared without SQL type text.
    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::Integer => "int8",
            Self::Float => "float8",
            Self::Text => "text",
            Self::Boolean => "bool",
        }
    }

    pub fn is_compatible(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (Self::Integer, Value::Integer(_))
                | (Self::Float, Value::Float(_))
                | (Self::Text, Value::Text(_))
                | (Self::Boolean, Value::Boolean(_))
        )
    }

    /// Converts `value` to this type where the conversion is lossless.
    pub fn coerce(&self, value: Value) -> Result<Value> {
        if self.is_compatible(&value) {
            return Ok(value);
        }

        let coerced = match (self, &value) {
            (Self::Integer, Value::Float(f)) if f.fract() == 0.0 && f.is_finite() => {
                Some(Value::Integer(*f as i64))
            }
            (Self::Integer, Value::Text(s)) => s.trim().parse::<i64>().ok().map(Value::Integer),
            (Self::Float, Value::Integer(i)) => Some(Value::Float(*i as f64)),
            (Self::Float, Value::Text(s)) => s.trim().parse::<f64>().ok().map(Value::Float),
            (Self::Text, other) => Some(Value::Text(other.to_string())),
            (Self::Boolean, Value::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "yes" | "on" | "1" => Some(Value::Boolean(true)),
                "f" | "false" | "no" | "off" | "0" => Some(Value::Boolean(false)),
                _ => None,
            },
            _ => None,
        };

        coerced.ok_or_else(|| {
            ProxyError::ArgumentBinding(format!(
                "cannot convert {} value '{}' to {}",
                value.type_name(),
                value,
                self
            ))
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => write!(f, "INTEGER"),
            Self::Float => write!(f, "FLOAT"),
            Self::Text => write!(f, "TEXT"),
            Self::Boolean => write!(f, "BOOLEAN"),
        }
    }
}
