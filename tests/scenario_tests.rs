/// End-to-end call routing tests
///
/// Drives `ProxyEngine` against in-process partitions.
/// Run with: cargo test --test scenario_tests

use shardproxy::{
    DataType, EngineConfig, FunctionDef, MemoryConnector, ProxyEngine, ProxyError, QueryResult,
    StaticClusterSource, Value,
};
use std::collections::HashSet;
use std::sync::Arc;

fn partition_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("host=part{} dbname=demo", i)).collect()
}

/// Every partition answers with its own index plus the bound parameters.
fn demo_engine(n: usize) -> (Arc<MemoryConnector>, ProxyEngine) {
    let names = partition_names(n);
    let addresses: Vec<&str> = names.iter().map(String::as_str).collect();
    let source = Arc::new(StaticClusterSource::with_cluster("demo", &addresses));

    let connector = Arc::new(MemoryConnector::new());
    for (index, address) in names.iter().enumerate() {
        connector.add_partition(address.clone(), move |query| {
            let mut row = vec![Value::Integer(index as i64)];
            row.extend(query.values().into_iter().cloned());
            Ok(QueryResult::new(vec!["partition".into()], vec![row]))
        });
    }

    let engine = ProxyEngine::new(EngineConfig::default(), source, connector.clone()).unwrap();
    (connector, engine)
}

fn hash_fn() -> FunctionDef {
    FunctionDef::new("f", "CLUSTER 'demo'; RUN ON hash(x);").arg("x", DataType::Integer)
}

fn count_fn() -> FunctionDef {
    FunctionDef::new("g", "CLUSTER 'demo';\nRUN ON ALL;\nSELECT count(*) FROM t;").returns_set(true)
}

async fn routed_partition(engine: &ProxyEngine, func: &FunctionDef, x: i64) -> i64 {
    let row = engine
        .call(func, vec![Value::Integer(x)])
        .await
        .unwrap()
        .expect("one row");
    row[0].as_i64().unwrap()
}

#[tokio::test]
async fn test_hash_routing_is_repeatable() {
    let (_connector, engine) = demo_engine(2);
    let func = hash_fn();

    let first = routed_partition(&engine, &func, 5).await;
    let second = routed_partition(&engine, &func, 5).await;
    assert_eq!(first, second);

    // the partition answers with the argument it was sent
    let row = engine.call(&func, vec![Value::Integer(5)]).await.unwrap().unwrap();
    assert_eq!(row[1], Value::Integer(5));
}

#[tokio::test]
async fn test_hash_routing_spreads_keys() {
    let (_connector, engine) = demo_engine(2);
    let func = hash_fn();

    let mut seen = HashSet::new();
    for x in 0..32 {
        seen.insert(routed_partition(&engine, &func, x).await);
    }
    assert_eq!(seen.len(), 2, "32 keys should reach both partitions");
}

#[tokio::test]
async fn test_hash_routing_coerces_before_hashing() {
    let (_connector, engine) = demo_engine(4);
    let func = hash_fn();

    let from_int = routed_partition(&engine, &func, 77).await;
    let row = engine
        .call(&func, vec![Value::Text("77".into())])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row[0].as_i64().unwrap(), from_int);
}

#[tokio::test]
async fn test_run_on_all_merges_in_partition_order() {
    let (connector, engine) = demo_engine(3);

    let set = engine.call_set(&count_fn(), vec![]).await.unwrap();
    assert_eq!(set.total_rows(), 3);
    let rows: Vec<_> = set.collect();
    let partitions: Vec<i64> = rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
    assert_eq!(partitions, vec![0, 1, 2]);

    for address in partition_names(3) {
        assert_eq!(connector.query_count(&address), 1);
    }
    assert_eq!(engine.pool_stats().in_use, 0);
}

#[tokio::test]
async fn test_multi_row_partitions_stay_contiguous() {
    let names = partition_names(3);
    let addresses: Vec<&str> = names.iter().map(String::as_str).collect();
    let source = Arc::new(StaticClusterSource::with_cluster("demo", &addresses));
    let connector = Arc::new(MemoryConnector::new());
    for (index, address) in names.iter().enumerate() {
        connector.add_partition(address.clone(), move |_query| {
            let rows = (0..index + 1)
                .map(|seq| vec![Value::Integer(index as i64), Value::Integer(seq as i64)])
                .collect();
            Ok(QueryResult::new(vec!["p".into(), "seq".into()], rows))
        });
    }
    let engine = ProxyEngine::new(EngineConfig::default(), source, connector).unwrap();

    let mut set = engine.call_set(&count_fn(), vec![]).await.unwrap();
    let mut tagged = Vec::new();
    while let Some((partition, row)) = set.next_tagged() {
        assert_eq!(row[0].as_i64().unwrap() as usize, partition);
        tagged.push((partition, row[1].as_i64().unwrap()));
    }
    assert_eq!(
        tagged,
        vec![(0, 0), (1, 0), (1, 1), (2, 0), (2, 1), (2, 2)]
    );
}

#[tokio::test]
async fn test_unreachable_partition_fails_whole_call() {
    let (connector, engine) = demo_engine(3);
    connector.set_reachable(&partition_names(3)[2], false);

    let err = engine.call_set(&count_fn(), vec![]).await.unwrap_err();
    assert_eq!(err.function, "g");
    assert_eq!(err.arity, 0);
    match err.kind() {
        ProxyError::PartitionExecution(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].partition, 2);
        }
        other => panic!("expected partition execution error, got {}", other),
    }
    assert!(err.to_string().contains("partition 2"));
    assert_eq!(engine.pool_stats().in_use, 0);
}

#[tokio::test]
async fn test_query_error_on_one_partition_leaks_no_rows() {
    let names = partition_names(3);
    let addresses: Vec<&str> = names.iter().map(String::as_str).collect();
    let source = Arc::new(StaticClusterSource::with_cluster("demo", &addresses));
    let connector = Arc::new(MemoryConnector::new());
    for (index, address) in names.iter().enumerate() {
        connector.add_partition(address.clone(), move |_query| {
            if index == 1 {
                Err(shardproxy::core::RemoteError::Query(
                    "relation \"t\" does not exist".into(),
                ))
            } else {
                Ok(QueryResult::single("n", Value::Integer(10)))
            }
        });
    }
    let engine = ProxyEngine::new(EngineConfig::default(), source, connector).unwrap();

    let err = engine.call_set(&count_fn(), vec![]).await.unwrap_err();
    assert_eq!(err.kind().failed_partitions(), vec![1]);
    assert!(err.to_string().contains("does not exist"));

    // the same function as a single-valued call fails the same way
    let single = FunctionDef { returns_set: false, ..count_fn() };
    assert!(engine.call(&single, vec![]).await.is_err());
}

#[tokio::test]
async fn test_run_on_any_uses_one_partition() {
    let (connector, engine) = demo_engine(3);
    let func = FunctionDef::new("pick", "CLUSTER 'demo'; RUN ON ANY; SELECT 1;");

    for _ in 0..6 {
        let row = engine.call(&func, vec![]).await.unwrap();
        assert!(row.is_some());
    }
    let total: usize = partition_names(3)
        .iter()
        .map(|a| connector.query_count(a))
        .sum();
    assert_eq!(total, 6);
}

#[tokio::test]
async fn test_directive_errors_surface_with_function_identity() {
    let (_connector, engine) = demo_engine(1);
    let broken = FunctionDef::new("broken", "CLUSTER 'demo'; RUN ON sideways;")
        .arg("x", DataType::Integer);

    let err = engine.call(&broken, vec![Value::Integer(1)]).await.unwrap_err();
    assert!(matches!(err.kind(), ProxyError::DirectiveSyntax(_)));
    assert!(err.to_string().starts_with("proxy function broken(1): "));

    let unknown = FunctionDef::new("lost", "CLUSTER 'nowhere'; RUN ON ALL;");
    let err = engine.call(&unknown, vec![]).await.unwrap_err();
    assert!(matches!(err.kind(), ProxyError::UnknownCluster { .. }));
}

#[tokio::test]
async fn test_argument_binding_failure() {
    let (connector, engine) = demo_engine(2);
    let err = engine
        .call(&hash_fn(), vec![Value::Text("five".into())])
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ProxyError::ArgumentBinding(_)));

    // nothing was sent anywhere
    for address in partition_names(2) {
        assert_eq!(connector.connect_count(&address), 0);
    }
}

#[tokio::test]
async fn test_explicit_select_binds_named_arguments() {
    let (_connector, engine) = demo_engine(2);
    let func = FunctionDef::new(
        "by_pair",
        "CLUSTER 'demo'; RUN ON hash(a); SELECT * FROM t WHERE b = $2 AND a = $1;",
    )
    .arg("a", DataType::Integer)
    .arg("b", DataType::Text);

    let row = engine
        .call(&func, vec![Value::Integer(3), Value::Text("x".into())])
        .await
        .unwrap()
        .unwrap();
    // remote parameters follow first-use order in the query text
    assert_eq!(&row[1..], &[Value::Text("x".into()), Value::Integer(3)]);
}

#[tokio::test]
async fn test_declared_type_reaches_partition_query() {
    let source = Arc::new(StaticClusterSource::with_cluster("demo", &["p0", "p1"]));
    let connector = Arc::new(MemoryConnector::new());
    for address in ["p0", "p1"] {
        connector.add_partition(address, |query| {
            let row = vec![
                Value::Text(query.sql.clone()),
                Value::Text(query.params[0].sql_type.clone()),
            ];
            Ok(QueryResult::new(vec!["sql".into(), "type".into()], vec![row]))
        });
    }
    let engine = ProxyEngine::new(EngineConfig::default(), source, connector).unwrap();
    let func = FunctionDef::from_signature("f(x int)", "CLUSTER 'demo'; RUN ON hash(x);").unwrap();

    let row = engine.call(&func, vec![Value::Integer(5)]).await.unwrap().unwrap();
    assert_eq!(row[0], Value::Text("SELECT * FROM f($1::int)".into()));
    assert_eq!(row[1], Value::Text("int".into()));
}

#[tokio::test]
async fn test_equal_float_keys_route_together() {
    let (_connector, engine) = demo_engine(7);
    let func = FunctionDef::new("f", "CLUSTER 'demo'; RUN ON hash(x);").arg("x", DataType::Float);

    let call = |x: f64| {
        let engine = &engine;
        let func = &func;
        async move {
            let row = engine.call(func, vec![Value::Float(x)]).await.unwrap().unwrap();
            row[0].as_i64().unwrap()
        }
    };
    assert_eq!(call(0.0).await, call(-0.0).await);
}
