use super::{Connector, PartitionConnection};
use crate::cluster::PartitionTarget;
use crate::core::{RemoteError, Row, Value};
use crate::executor::{BoundParam, BoundQuery};
use crate::result::QueryResult;
use async_trait::async_trait;
use log::{debug, warn};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, Config, NoTls};

/// Connects to PostgreSQL partitions.
///
/// Partition addresses are libpq-style connection strings
/// (`host=db1 port=5432 dbname=users`) or `postgresql://` URLs. Credentials
/// from the cluster configuration override those in the address.
#[derive(Debug, Default, Clone)]
pub struct PgConnector;

impl PgConnector {
    pub fn new() -> Self {
        Self
    }

    fn config_for(target: &PartitionTarget) -> Result<Config, RemoteError> {
        let mut config: Config = target.address.parse().map_err(|e| {
            RemoteError::Connection(format!("invalid partition address: {}", e))
        })?;
        if let Some(credentials) = &target.credentials {
            config.user(&credentials.user);
            if let Some(password) = &credentials.password {
                config.password(password);
            }
        }
        Ok(config)
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(
        &self,
        target: &PartitionTarget,
    ) -> Result<Box<dyn PartitionConnection>, RemoteError> {
        let config = Self::config_for(target)?;
        let (client, connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| RemoteError::Connection(e.to_string()))?;

        let partition = target.index;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("Connection to partition {} closed: {}", partition, e);
            }
        });

        debug!("Opened PostgreSQL session to partition {}", target);
        Ok(Box::new(PgConnection { client }))
    }
}

struct PgConnection {
    client: Client,
}

impl PgConnection {
    fn map_error(&self, err: tokio_postgres::Error) -> RemoteError {
        if self.client.is_closed() || err.is_closed() {
            return RemoteError::Connection(err.to_string());
        }
        match err.as_db_error() {
            Some(db) => RemoteError::Query(format!("{}: {}", db.code().code(), db.message())),
            None => RemoteError::Query(err.to_string()),
        }
    }
}

#[async_trait]
impl PartitionConnection for PgConnection {
    async fn query(&mut self, query: &BoundQuery) -> Result<QueryResult, RemoteError> {
        let mut types = Vec::with_capacity(query.params.len());
        let mut params = Vec::with_capacity(query.params.len());
        for param in &query.params {
            let wire = wire_type(&param.sql_type);
            params.push(to_sql(param, &wire)?);
            types.push(wire);
        }
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let statement = self
            .client
            .prepare_typed(&query.sql, &types)
            .await
            .map_err(|e| self.map_error(e))?;
        let rows = self
            .client
            .query(&statement, &refs)
            .await
            .map_err(|e| self.map_error(e))?;

        let columns = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        Ok(QueryResult::new(columns, rows))
    }

    fn is_healthy(&self) -> bool {
        !self.client.is_closed()
    }
}

/// Parameter type sent with the prepare. Types without a native encoding
/// here (`numeric`) travel as text and are converted by the query's cast.
fn wire_type(sql_type: &str) -> Type {
    let base = sql_type.split('(').next().unwrap_or_default().trim();
    match base {
        "int2" | "smallint" => Type::INT2,
        "int" | "int4" | "integer" => Type::INT4,
        "int8" | "bigint" => Type::INT8,
        "float4" | "real" => Type::FLOAT4,
        "float" | "float8" | "double precision" => Type::FLOAT8,
        "bool" | "boolean" => Type::BOOL,
        "varchar" | "character varying" => Type::VARCHAR,
        "char" | "character" | "bpchar" => Type::BPCHAR,
        "name" => Type::NAME,
        _ => Type::TEXT,
    }
}

fn to_sql(param: &BoundParam, wire: &Type) -> Result<Box<dyn ToSql + Sync + Send>, RemoteError> {
    let out_of_range = || {
        RemoteError::Query(format!(
            "value {} is out of range for {}",
            param.value, param.sql_type
        ))
    };
    let boxed: Box<dyn ToSql + Sync + Send> = match (wire, &param.value) {
        (&Type::INT2, Value::Null) => Box::new(None::<i16>),
        (&Type::INT4, Value::Null) => Box::new(None::<i32>),
        (&Type::INT8, Value::Null) => Box::new(None::<i64>),
        (&Type::FLOAT4, Value::Null) => Box::new(None::<f32>),
        (&Type::FLOAT8, Value::Null) => Box::new(None::<f64>),
        (&Type::BOOL, Value::Null) => Box::new(None::<bool>),
        (_, Value::Null) => Box::new(None::<String>),
        (&Type::INT2, Value::Integer(i)) => {
            Box::new(i16::try_from(*i).map_err(|_| out_of_range())?)
        }
        (&Type::INT4, Value::Integer(i)) => {
            Box::new(i32::try_from(*i).map_err(|_| out_of_range())?)
        }
        (&Type::INT8, Value::Integer(i)) => Box::new(*i),
        (&Type::FLOAT4, Value::Float(f)) => Box::new(*f as f32),
        (&Type::FLOAT8, Value::Float(f)) => Box::new(*f),
        (&Type::BOOL, Value::Boolean(b)) => Box::new(*b),
        (&Type::TEXT | &Type::VARCHAR | &Type::BPCHAR | &Type::NAME, Value::Text(s)) => {
            Box::new(s.clone())
        }
        (&Type::TEXT, Value::Float(f)) => Box::new(Value::Float(*f).to_string()),
        (_, value) => {
            return Err(RemoteError::Query(format!(
                "cannot send {} value as {}",
                value.type_name(),
                param.sql_type
            )));
        }
    };
    Ok(boxed)
}

fn decode_row(row: &tokio_postgres::Row) -> Result<Row, RemoteError> {
    (0..row.len())
        .map(|idx| {
            let column = &row.columns()[idx];
            let decode_err = |e: tokio_postgres::Error| {
                RemoteError::Query(format!("column '{}': {}", column.name(), e))
            };
            let value: Value = match *column.type_() {
                Type::BOOL => row.try_get::<_, Option<bool>>(idx).map_err(decode_err)?.into(),
                Type::INT2 => row
                    .try_get::<_, Option<i16>>(idx)
                    .map_err(decode_err)?
                    .map(|v| v as i64)
                    .into(),
                Type::INT4 => row.try_get::<_, Option<i32>>(idx).map_err(decode_err)?.into(),
                Type::INT8 => row.try_get::<_, Option<i64>>(idx).map_err(decode_err)?.into(),
                Type::FLOAT4 => row
                    .try_get::<_, Option<f32>>(idx)
                    .map_err(decode_err)?
                    .map(|v| v as f64)
                    .into(),
                Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map_err(decode_err)?.into(),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                    row.try_get::<_, Option<String>>(idx).map_err(decode_err)?.into()
                }
                ref other => {
                    return Err(RemoteError::Query(format!(
                        "column '{}' has unsupported type {}",
                        column.name(),
                        other
                    )));
                }
            };
            Ok(value)
        })
        .collect()
}
