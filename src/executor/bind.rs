use crate::core::{DataType, ProxyError, Result, Value};
use crate::directive::RoutingDirective;

/// One positional parameter of a remote query.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParam {
    pub data_type: DataType,
    /// Declared SQL type of the feeding argument.
    pub sql_type: String,
    pub value: Value,
}

/// Remote query text together with its parameter values.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    pub params: Vec<BoundParam>,
}

impl BoundQuery {
    pub fn new(sql: impl Into<String>, params: Vec<BoundParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn values(&self) -> Vec<&Value> {
        self.params.iter().map(|p| &p.value).collect()
    }
}

/// Coerces the call's arguments to the declared argument types.
///
/// Fewer arguments than declared is left to the consumers of the
/// missing positions, which report `ArgumentOutOfRange`.
pub fn bind_arguments(directive: &RoutingDirective, args: Vec<Value>) -> Result<Vec<Value>> {
    if args.len() > directive.arity() {
        return Err(ProxyError::ArgumentBinding(format!(
            "{} takes {} argument(s), {} given",
            directive.function_name,
            directive.arity(),
            args.len()
        )));
    }

    args.into_iter()
        .zip(directive.arg_types.iter())
        .enumerate()
        .map(|(i, (value, data_type))| {
            data_type.coerce(value).map_err(|e| match e {
                ProxyError::ArgumentBinding(msg) => {
                    ProxyError::ArgumentBinding(format!("argument ${}: {}", i + 1, msg))
                }
                other => other,
            })
        })
        .collect()
}

/// Builds the remote query for one call from already coerced arguments.
pub fn bind_query(directive: &RoutingDirective, args: &[Value]) -> Result<BoundQuery> {
    let params = directive
        .query
        .params
        .iter()
        .map(|&index| {
            let value = args.get(index).cloned().ok_or(ProxyError::ArgumentOutOfRange {
                index,
                count: args.len(),
            })?;
            let declared = directive
                .arg_types
                .get(index)
                .zip(directive.arg_sql_types.get(index));
            let (data_type, sql_type) = declared.ok_or(ProxyError::ArgumentOutOfRange {
                index,
                count: directive.arity(),
            })?;
            Ok(BoundParam {
                data_type: *data_type,
                sql_type: sql_type.clone(),
                value,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(BoundQuery::new(directive.query.sql.clone(), params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::{FunctionDef, compile};

    fn plan() -> RoutingDirective {
        let def = FunctionDef::new(
            "find",
            "CLUSTER 'c'; RUN ON ALL; SELECT * FROM t WHERE b = $2 AND a = $1 AND b2 = $2;",
        )
        .arg("a", DataType::Integer)
        .arg("b", DataType::Text);
        compile(&def).unwrap()
    }

    #[test]
    fn test_bind_coerces_and_orders_params() {
        let plan = plan();
        let args = bind_arguments(&plan, vec![Value::Text("42".into()), Value::Integer(7)]).unwrap();
        assert_eq!(args, vec![Value::Integer(42), Value::Text("7".into())]);

        let query = bind_query(&plan, &args).unwrap();
        assert_eq!(
            query.values(),
            vec![&Value::Text("7".into()), &Value::Integer(42)]
        );
        assert_eq!(query.params[0].data_type, DataType::Text);
        assert_eq!(query.params[1].sql_type, "int8");
    }

    #[test]
    fn test_params_carry_declared_sql_type() {
        let def = FunctionDef::from_signature("f(x int4)", "CLUSTER 'c'; RUN ON hash(x);")
            .unwrap();
        let plan = compile(&def).unwrap();
        let args = bind_arguments(&plan, vec![Value::Text("12".into())]).unwrap();
        let query = bind_query(&plan, &args).unwrap();
        assert_eq!(query.sql, "SELECT * FROM f($1::int4)");
        assert_eq!(query.params[0].sql_type, "int4");
        assert_eq!(query.params[0].value, Value::Integer(12));
    }

    #[test]
    fn test_bind_rejects_bad_input() {
        let plan = plan();
        let err = bind_arguments(&plan, vec![Value::Text("forty".into())]).unwrap_err();
        assert!(matches!(err, ProxyError::ArgumentBinding(ref m) if m.contains("$1")));

        let too_many = vec![Value::Integer(1), Value::Null, Value::Null];
        assert!(matches!(
            bind_arguments(&plan, too_many),
            Err(ProxyError::ArgumentBinding(_))
        ));

        let short = bind_arguments(&plan, vec![Value::Integer(1)]).unwrap();
        assert!(matches!(
            bind_query(&plan, &short),
            Err(ProxyError::ArgumentOutOfRange { index: 1, count: 1 })
        ));
    }

    #[test]
    fn test_null_passes_through() {
        let plan = plan();
        let args = bind_arguments(&plan, vec![Value::Null, Value::Null]).unwrap();
        assert!(bind_query(&plan, &args).unwrap().values().iter().all(|v| v.is_null()));
    }
}
