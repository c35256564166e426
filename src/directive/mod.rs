pub mod cache;
pub mod lexer;
pub mod parser;

use crate::core::{DataType, ProxyError, Result, Value};
use crate::routing::hash::fnv1a;

pub use cache::PlanCache;
pub use parser::compile;

/// Declared argument of a proxied function.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionArg {
    pub name: Option<String>,
    pub data_type: DataType,
    /// SQL type as declared (`int4`, `numeric(10,2)`), used for remote casts.
    pub sql_type: String,
}

/// A function definition as handed over by the host.
///
/// The body carries the routing directive, e.g.
/// ```text
/// CLUSTER 'userdb';
/// RUN ON hash(username);
/// SELECT id, email FROM users WHERE username = $1;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: String,
    pub args: Vec<FunctionArg>,
    pub returns_set: bool,
    /// Expected number of result columns, checked against every partition.
    pub result_columns: Option<usize>,
    pub body: String,
}

/// Stable identity of a function definition, used as the plan cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionKey {
    pub name: String,
    pub arg_types: Vec<String>,
}

impl FunctionDef {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            returns_set: false,
            result_columns: None,
            body: body.into(),
        }
    }

    /// Add a named argument
    pub fn arg(mut self, name: &str, data_type: DataType) -> Self {
        self.args.push(FunctionArg {
            name: Some(name.to_string()),
            data_type,
            sql_type: data_type.sql_name().to_string(),
        });
        self
    }

    /// Add an argument that can only be referenced positionally
    pub fn unnamed_arg(mut self, data_type: DataType) -> Self {
        self.args.push(FunctionArg {
            name: None,
            data_type,
            sql_type: data_type.sql_name().to_string(),
        });
        self
    }

    /// Add an argument by its SQL type name, keeping the exact type for casts.
    pub fn declared_arg(mut self, name: Option<&str>, type_name: &str) -> Result<Self> {
        let (data_type, sql_type) = DataType::parse_declared(type_name)?;
        self.args.push(FunctionArg {
            name: name.map(str::to_string),
            data_type,
            sql_type,
        });
        Ok(self)
    }

    pub fn returns_set(mut self, returns_set: bool) -> Self {
        self.returns_set = returns_set;
        self
    }

    pub fn result_columns(mut self, columns: usize) -> Self {
        self.result_columns = Some(columns);
        self
    }

    /// Builds a definition from a signature such as `get_user(username text, int)`.
    pub fn from_signature(signature: &str, body: impl Into<String>) -> Result<Self> {
        let signature = signature.trim();
        let (name, rest) = signature.split_once('(').ok_or_else(|| {
            ProxyError::DirectiveSyntax(format!(
                "signature '{}' must look like name(arg type, ...)",
                signature
            ))
        })?;
        let inner = rest.trim_end().strip_suffix(')').ok_or_else(|| {
            ProxyError::DirectiveSyntax(format!("signature '{}' is missing ')'", signature))
        })?;

        let name = name.trim();
        if name.is_empty() {
            return Err(ProxyError::DirectiveSyntax(
                "function name must not be empty".into(),
            ));
        }

        let mut def = Self::new(name, body);
        for raw in split_top_level(inner) {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            if DataType::parse(raw).is_ok() {
                def = def.declared_arg(None, raw)?;
                continue;
            }
            let (arg_name, type_name) = raw.split_once(char::is_whitespace).ok_or_else(|| {
                ProxyError::DirectiveSyntax(format!("cannot parse argument '{}'", raw))
            })?;
            def = def.declared_arg(Some(arg_name), type_name)?;
        }
        Ok(def)
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    pub fn key(&self) -> FunctionKey {
        FunctionKey {
            name: self.name.clone(),
            arg_types: self.args.iter().map(|a| a.sql_type.clone()).collect(),
        }
    }

    /// Changes whenever anything the compiled plan depends on changes.
    pub fn fingerprint(&self) -> u64 {
        let mut material = String::with_capacity(self.body.len() + 64);
        material.push_str(&self.body);
        material.push('\u{0}');
        for arg in &self.args {
            material.push_str(arg.name.as_deref().unwrap_or(""));
            material.push(':');
            material.push_str(&arg.sql_type);
            material.push(',');
        }
        material.push(if self.returns_set { 'S' } else { '1' });
        if let Some(columns) = self.result_columns {
            material.push_str(&columns.to_string());
        }
        fnv1a(material.as_bytes())
    }

    pub(crate) fn arg_position(&self, name: &str) -> Option<usize> {
        self.args.iter().position(|arg| {
            arg.name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
    }
}

fn split_top_level(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (idx, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&input[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

/// Where the call's cluster name comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterExpr {
    Static(String),
    /// Zero-based index of a text argument holding the cluster name.
    Argument(usize),
}

impl ClusterExpr {
    pub fn resolve(&self, args: &[Value]) -> Result<String> {
        match self {
            Self::Static(name) => Ok(name.clone()),
            Self::Argument(index) => match args.get(*index) {
                Some(Value::Text(name)) if !name.trim().is_empty() => Ok(name.clone()),
                Some(Value::Null) => Err(ProxyError::ArgumentBinding(format!(
                    "cluster name argument ${} is NULL",
                    index + 1
                ))),
                Some(other) => Err(ProxyError::ArgumentBinding(format!(
                    "cluster name argument ${} must be non-empty TEXT, got {}",
                    index + 1,
                    other.type_name()
                ))),
                None => Err(ProxyError::ArgumentOutOfRange {
                    index: *index,
                    count: args.len(),
                }),
            },
        }
    }
}

/// Fan-out mode of a directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetMode {
    All,
    Any,
    /// Zero-based index of the argument whose hash selects the partition.
    Hash(usize),
}

/// Remote query text with dense `$1..$k` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteQuery {
    pub sql: String,
    /// For each remote placeholder (in order), the caller argument feeding it.
    pub params: Vec<usize>,
}

/// Compiled, immutable execution plan of one proxied function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDirective {
    pub function_name: String,
    pub arg_types: Vec<DataType>,
    /// Declared SQL type of each argument, parallel to `arg_types`.
    pub arg_sql_types: Vec<String>,
    pub cluster: ClusterExpr,
    pub target: TargetMode,
    pub query: RemoteQuery,
    pub target_function: Option<String>,
    pub returns_set: bool,
    pub result_columns: Option<usize>,
}

impl RoutingDirective {
    pub fn arity(&self) -> usize {
        self.arg_types.len()
    }
}
