use chrono::{TimeDelta, Utc};
use metadata::{
    ExecutionError, ExecutionMetrics, ExecutionStatus, Function, FunctionCode, FunctionConfig,
    FunctionFilter, Invocation, InvocationFilter, MemoryMetadataStore, MetadataError,
    MetadataStore, RuntimeKind,
};
use std::collections::HashMap;
use std::time::Duration;

fn sample_function(id: &str, name: &str, version: &str) -> Function {
    let now = Utc::now();
    Function {
        id: id.to_string(),
        name: name.to_string(),
        version: version.to_string(),
        runtime: RuntimeKind::Python,
        handler: "main.handler".to_string(),
        code: FunctionCode {
            location: format!("{id}/code"),
            checksum: "deadbeef".to_string(),
            size: 42,
        },
        config: FunctionConfig {
            timeout: Duration::from_secs(30),
            memory_mb: 128,
            concurrency: 1,
            environment: HashMap::new(),
        },
        metadata: HashMap::new(),
        created_at: now,
        updated_at: now,
    }
}

fn sample_invocation(id: &str, function_id: &str) -> Invocation {
    Invocation {
        id: id.to_string(),
        function_id: function_id.to_string(),
        payload: serde_json::json!({"input": 1}),
        headers: HashMap::new(),
        status: ExecutionStatus::Pending,
        result: None,
        error: None,
        metrics: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

#[tokio::test]
async fn create_get_round_trip() {
    let store = MemoryMetadataStore::new();
    let f = sample_function("f1", "echo", "1.0.0");
    store.create_function(&f).await.unwrap();

    assert_eq!(store.get_function("f1").await.unwrap(), f);
    assert_eq!(
        store.get_function_by_name("echo", "1.0.0").await.unwrap(),
        f
    );
}

#[tokio::test]
async fn duplicate_name_version_conflicts() {
    let store = MemoryMetadataStore::new();
    store
        .create_function(&sample_function("f1", "echo", "1.0.0"))
        .await
        .unwrap();

    let err = store
        .create_function(&sample_function("f2", "echo", "1.0.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::Conflict(_)));

    // Same name, different version is fine.
    store
        .create_function(&sample_function("f3", "echo", "1.0.1"))
        .await
        .unwrap();
}

#[tokio::test]
async fn missing_rows_are_not_found() {
    let store = MemoryMetadataStore::new();
    assert!(matches!(
        store.get_function("absent").await.unwrap_err(),
        MetadataError::NotFound { .. }
    ));
    assert!(matches!(
        store.delete_function("absent").await.unwrap_err(),
        MetadataError::NotFound { .. }
    ));
    assert!(matches!(
        store.get_invocation("absent").await.unwrap_err(),
        MetadataError::NotFound { .. }
    ));
    assert!(matches!(
        store
            .update_invocation(&sample_invocation("absent", "f1"))
            .await
            .unwrap_err(),
        MetadataError::NotFound { .. }
    ));
}

#[tokio::test]
async fn list_functions_filters_and_orders() {
    let store = MemoryMetadataStore::new();
    let base = Utc::now();

    let mut older = sample_function("a", "one", "1");
    older.created_at = base - TimeDelta::seconds(10);
    let mut newer = sample_function("b", "two", "1");
    newer.created_at = base;
    let mut go = sample_function("c", "three", "1");
    go.runtime = RuntimeKind::Go;
    go.created_at = base - TimeDelta::seconds(5);

    for f in [&older, &newer, &go] {
        store.create_function(f).await.unwrap();
    }

    let all = store
        .list_functions(&FunctionFilter::default())
        .await
        .unwrap();
    assert_eq!(
        all.iter().map(|f| f.id.as_str()).collect::<Vec<_>>(),
        ["b", "c", "a"]
    );

    let only_go = store
        .list_functions(&FunctionFilter {
            runtime: Some(RuntimeKind::Go),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(only_go.len(), 1);
    assert_eq!(only_go[0].id, "c");

    let page = store
        .list_functions(&FunctionFilter {
            limit: Some(1),
            offset: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, "c");
}

#[tokio::test]
async fn invocation_state_machine_progresses_to_terminal() {
    let store = MemoryMetadataStore::new();
    let mut inv = sample_invocation("i1", "f1");
    store.create_invocation(&inv).await.unwrap();

    let started = Utc::now();
    inv.status = ExecutionStatus::Running;
    inv.started_at = Some(started);
    store.update_invocation(&inv).await.unwrap();

    inv.status = ExecutionStatus::Completed;
    inv.result = Some(b"{\"ok\":true}".to_vec());
    inv.metrics = Some(ExecutionMetrics {
        duration: Duration::from_millis(12),
        ..Default::default()
    });
    inv.completed_at = Some(Utc::now());
    store.update_invocation(&inv).await.unwrap();

    let row = store.get_invocation("i1").await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);
    assert!(row.started_at.is_some());
    assert!(row.completed_at.unwrap() >= row.started_at.unwrap());
    assert!(row.started_at.unwrap() >= row.created_at);
}

#[tokio::test]
async fn terminal_states_absorb_non_terminal_writes() {
    let store = MemoryMetadataStore::new();
    let mut inv = sample_invocation("i1", "f1");
    store.create_invocation(&inv).await.unwrap();

    inv.status = ExecutionStatus::Failed;
    inv.error = Some(ExecutionError::new("RuntimeError", "exited with code 1"));
    inv.completed_at = Some(Utc::now());
    store.update_invocation(&inv).await.unwrap();

    // A redelivered message tries to mark the invocation RUNNING again.
    let mut regress = inv.clone();
    regress.status = ExecutionStatus::Running;
    regress.error = None;
    regress.completed_at = None;
    store.update_invocation(&regress).await.unwrap();

    let row = store.get_invocation("i1").await.unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
    assert!(row.error.is_some());
    assert!(row.completed_at.is_some());
}

#[tokio::test]
async fn terminal_write_is_idempotent() {
    let store = MemoryMetadataStore::new();
    let mut inv = sample_invocation("i1", "f1");
    store.create_invocation(&inv).await.unwrap();

    inv.status = ExecutionStatus::Completed;
    inv.result = Some(b"42".to_vec());
    inv.completed_at = Some(Utc::now());

    store.update_invocation(&inv).await.unwrap();
    let first = store.get_invocation("i1").await.unwrap();

    store.update_invocation(&inv).await.unwrap();
    let second = store.get_invocation("i1").await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn duplicate_invocation_id_conflicts() {
    let store = MemoryMetadataStore::new();
    let inv = sample_invocation("i1", "f1");
    store.create_invocation(&inv).await.unwrap();
    assert!(matches!(
        store.create_invocation(&inv).await.unwrap_err(),
        MetadataError::Conflict(_)
    ));
}

#[tokio::test]
async fn list_invocations_filters_by_function_and_status() {
    let store = MemoryMetadataStore::new();

    let mut a = sample_invocation("a", "f1");
    a.status = ExecutionStatus::Completed;
    let b = sample_invocation("b", "f1");
    let c = sample_invocation("c", "f2");

    for inv in [&a, &b, &c] {
        store.create_invocation(inv).await.unwrap();
    }

    let of_f1 = store
        .list_invocations(&InvocationFilter {
            function_id: Some("f1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(of_f1.len(), 2);

    let completed = store
        .list_invocations(&InvocationFilter {
            status: Some(ExecutionStatus::Completed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, "a");
}
