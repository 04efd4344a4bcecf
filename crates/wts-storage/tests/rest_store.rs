//! `RestStore` against an in-process PostgREST stand-in with injectable
//! failures.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use serde_json::Value;
use tokio::net::TcpListener;
use wts_core::{CanonicalTaskRecord, Field, TaskOwner, TaskStatus, Unit, UnitNumber};
use wts_storage::{BackoffPolicy, ChangeSet, RestStore, RestStoreConfig, StoreError, TaskStore};

type TaskKey = (String, String, String, i64);

/// Fails (or, with `commit`, performs and then fails) matching requests.
#[derive(Debug, Clone)]
struct Fault {
    method: Method,
    table: &'static str,
    status: StatusCode,
    commit: bool,
    times: usize,
}

#[derive(Debug, Default)]
struct Stub {
    tasks: BTreeMap<TaskKey, Value>,
    units: BTreeMap<String, Value>,
    requests: Vec<(Method, String)>,
    faults: Vec<Fault>,
}

impl Stub {
    fn take_fault(&mut self, method: &Method, table: &str) -> Option<Fault> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.times > 0 && &f.method == method && f.table == table)?;
        fault.times -= 1;
        Some(fault.clone())
    }
}

type Shared = Arc<Mutex<Stub>>;

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn row_key(row: &Value) -> TaskKey {
    (
        text(&row["unit_number"]),
        text(&row["owner_key"]),
        text(&row["task_key"]),
        row["sort_order"].as_i64().unwrap_or_default(),
    )
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn eq_param(params: &[(String, String)], name: &str) -> Option<String> {
    param(params, name).map(|value| value.trim_start_matches("eq.").to_string())
}

fn filter_key(params: &[(String, String)]) -> Option<TaskKey> {
    Some((
        eq_param(params, "unit_number")?,
        eq_param(params, "owner_key")?,
        eq_param(params, "task_key")?,
        eq_param(params, "sort_order")?.parse().ok()?,
    ))
}

fn body_rows(body: &Bytes) -> Vec<Value> {
    match serde_json::from_slice(body).unwrap_or(Value::Null) {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        row => vec![row],
    }
}

fn serve_tasks(
    stub: &mut Stub,
    method: &Method,
    params: &[(String, String)],
    body: &Bytes,
) -> Response {
    match *method {
        Method::GET => {
            let unit = eq_param(params, "unit_number");
            let number = |name: &str| param(params, name).and_then(|v| v.parse::<usize>().ok());
            let offset = number("offset").unwrap_or(0);
            let limit = number("limit").unwrap_or(usize::MAX);
            let rows: Vec<Value> = stub
                .tasks
                .iter()
                .filter(|(key, _)| unit.as_ref().map_or(true, |u| &key.0 == u))
                .map(|(_, row)| row.clone())
                .skip(offset)
                .take(limit)
                .collect();
            Json(rows).into_response()
        }
        Method::POST => {
            let rows = body_rows(body);
            let upsert = param(params, "on_conflict").is_some();
            if !upsert && rows.iter().any(|row| stub.tasks.contains_key(&row_key(row))) {
                return (StatusCode::CONFLICT, "duplicate key value").into_response();
            }
            for row in rows {
                stub.tasks.insert(row_key(&row), row);
            }
            StatusCode::CREATED.into_response()
        }
        Method::PATCH => {
            let Some(key) = filter_key(params) else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            if let (Some(slot), Some(row)) = (stub.tasks.get_mut(&key), body_rows(body).pop()) {
                *slot = row;
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Method::DELETE => {
            let Some(key) = filter_key(params) else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            stub.tasks.remove(&key);
            StatusCode::NO_CONTENT.into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

fn serve_units(
    stub: &mut Stub,
    method: &Method,
    params: &[(String, String)],
    body: &Bytes,
) -> Response {
    match *method {
        Method::GET => {
            let unit = eq_param(params, "unit_number");
            let rows: Vec<Value> = stub
                .units
                .iter()
                .filter(|(number, _)| unit.as_ref().map_or(true, |u| *number == u))
                .map(|(_, row)| row.clone())
                .collect();
            Json(rows).into_response()
        }
        Method::POST => {
            for row in body_rows(body) {
                stub.units.insert(text(&row["unit_number"]), row);
            }
            StatusCode::CREATED.into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

async fn handle(
    State(state): State<Shared>,
    method: Method,
    Path(table): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let mut stub = state.lock().unwrap();
    stub.requests.push((method.clone(), table.clone()));
    let fault = stub.take_fault(&method, &table);
    if let Some(fault) = fault.as_ref().filter(|f| !f.commit) {
        return fault.status.into_response();
    }
    let response = match table.as_str() {
        "task_records" => serve_tasks(&mut stub, &method, &params, &body),
        "train_units" => serve_units(&mut stub, &method, &params, &body),
        "cars" => StatusCode::CREATED.into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    };
    match fault {
        Some(fault) => fault.status.into_response(),
        None => response,
    }
}

struct Harness {
    state: Shared,
    store: RestStore,
}

impl Harness {
    async fn start(page_size: usize) -> Self {
        let state: Shared = Arc::default();
        let app = Router::new()
            .route("/{table}", any(handle))
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let store = RestStore::new(RestStoreConfig {
            page_size,
            backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..RestStoreConfig::new(format!("http://{addr}"), "test-key")
        })
        .unwrap();
        Self { state, store }
    }

    fn inject(&self, method: Method, status: StatusCode, commit: bool) {
        self.state.lock().unwrap().faults.push(Fault {
            method,
            table: "task_records",
            status,
            commit,
            times: 1,
        });
    }

    fn task_requests(&self, method: Method) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(m, table)| *m == method && table == "task_records")
            .count()
    }

    async fn tasks(&self) -> Vec<CanonicalTaskRecord> {
        self.store.fetch_unit_tasks(&unit_number()).await.unwrap()
    }
}

fn unit_number() -> UnitNumber {
    UnitNumber::parse("96004").unwrap()
}

fn record(name: &str, sort_order: u32) -> CanonicalTaskRecord {
    CanonicalTaskRecord {
        unit_number: unit_number(),
        owner: TaskOwner::Unit,
        sort_order,
        task_number: None,
        task_name: name.into(),
        description: None,
        status: TaskStatus::NotStarted,
        duration_minutes: Field::source(30),
        headcount: 1,
        phase: Field::empty(),
        completed_by: vec!["AS".into()],
        team: Field::empty(),
        completed_at: None,
        reference_code: None,
        position: None,
        scope_delayed: false,
        wi_reference: None,
        review_flags: Default::default(),
    }
}

fn change_set(
    inserts: Vec<CanonicalTaskRecord>,
    updates: Vec<CanonicalTaskRecord>,
    deletes: &[&CanonicalTaskRecord],
) -> ChangeSet {
    ChangeSet {
        unit: Unit {
            unit_number: unit_number(),
            train_id: None,
            train_name: None,
            construction_phase: None,
        },
        cars: vec![],
        inserts,
        updates,
        delete_keys: deletes.iter().map(|r| r.natural_key()).collect(),
    }
}

async fn seeded(page_size: usize) -> (Harness, Vec<CanonicalTaskRecord>) {
    let harness = Harness::start(page_size).await;
    let seed = vec![record("Remove bogie", 1), record("Fit seats", 2), record("Paint roof", 3)];
    harness
        .store
        .apply_reconciliation(&change_set(seed, vec![], &[]))
        .await
        .unwrap();
    let before = harness.tasks().await;
    assert_eq!(before.len(), 3);
    (harness, before)
}

#[tokio::test]
async fn reads_page_by_page_until_a_short_page() {
    let (harness, _) = seeded(2).await;
    let gets = harness.task_requests(Method::GET);
    let records = harness.store.fetch_all_tasks().await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(harness.task_requests(Method::GET) - gets, 2);
}

#[tokio::test]
async fn unavailable_store_is_retried() {
    let (harness, before) = seeded(100).await;
    harness.inject(Method::GET, StatusCode::SERVICE_UNAVAILABLE, false);
    harness.inject(Method::GET, StatusCode::SERVICE_UNAVAILABLE, false);
    let gets = harness.task_requests(Method::GET);

    assert_eq!(harness.tasks().await, before);
    assert_eq!(harness.task_requests(Method::GET) - gets, 3);
}

#[tokio::test]
async fn rejected_requests_are_not_retried() {
    let (harness, _) = seeded(100).await;
    harness.inject(Method::GET, StatusCode::BAD_REQUEST, false);
    let gets = harness.task_requests(Method::GET);

    let err = harness.store.fetch_unit_tasks(&unit_number()).await.unwrap_err();
    assert!(matches!(err, StoreError::Semantic(_)), "{err:?}");
    assert_eq!(harness.task_requests(Method::GET) - gets, 1);
}

#[tokio::test]
async fn failed_apply_restores_prior_state() {
    let (harness, before) = seeded(100).await;
    let mut fit_seats = record("Fit seats", 2);
    fit_seats.status = TaskStatus::Completed;
    let changes = change_set(
        vec![record("Renew flooring", 4)],
        vec![fit_seats],
        &[&record("Remove bogie", 1)],
    );
    harness.inject(Method::DELETE, StatusCode::BAD_REQUEST, false);

    let err = harness.store.apply_reconciliation(&changes).await.unwrap_err();
    assert!(matches!(err, StoreError::RolledBack { .. }), "{err:?}");
    assert_eq!(harness.tasks().await, before);
}

#[tokio::test]
async fn insert_that_landed_without_a_response_is_undone() {
    let (harness, before) = seeded(100).await;
    // The first attempt writes the rows; the retry then hits a duplicate key.
    harness.inject(Method::POST, StatusCode::SERVICE_UNAVAILABLE, true);
    let changes = change_set(vec![record("Renew flooring", 4)], vec![], &[]);

    let err = harness.store.apply_reconciliation(&changes).await.unwrap_err();
    assert!(matches!(err, StoreError::RolledBack { .. }), "{err:?}");
    assert_eq!(harness.tasks().await, before);
}

#[tokio::test]
async fn failed_rollback_reports_divergence() {
    let (harness, _) = seeded(100).await;
    let mut fit_seats = record("Fit seats", 2);
    fit_seats.status = TaskStatus::InProgress;
    let changes = change_set(vec![record("Renew flooring", 4)], vec![fit_seats], &[]);
    harness.inject(Method::PATCH, StatusCode::BAD_REQUEST, false);
    harness.inject(Method::DELETE, StatusCode::FORBIDDEN, false);

    let err = harness.store.apply_reconciliation(&changes).await.unwrap_err();
    assert!(matches!(err, StoreError::Divergent { .. }), "{err:?}");
    assert_eq!(harness.tasks().await.len(), 4);
}

#[tokio::test]
async fn rollback_that_does_not_restore_is_divergence() {
    let (harness, _) = seeded(100).await;
    let changes = change_set(
        vec![record("Renew flooring", 4)],
        vec![],
        &[&record("Remove bogie", 1)],
    );
    harness.inject(Method::DELETE, StatusCode::BAD_REQUEST, false);
    // Acknowledged without deleting the inserted row.
    harness.inject(Method::DELETE, StatusCode::NO_CONTENT, false);

    let err = harness.store.apply_reconciliation(&changes).await.unwrap_err();
    match err {
        StoreError::Divergent { rollback, .. } => {
            assert!(rollback.contains("differs"), "{rollback}")
        }
        other => panic!("expected divergence, got {other:?}"),
    }
}
