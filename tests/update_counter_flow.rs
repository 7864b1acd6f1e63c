use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tower::util::ServiceExt;
use visitcount::app::{build_router, AppState};
use visitcount::counter::{VisitCounter, COUNTER_PARTITION, COUNTER_ROW, VISITOR_PARTITION};
use visitcount::retry::RetryPolicy;
use visitcount::store::{CreateOutcome, Entity, Lookup, TableStore, UpdateOutcome};

type Key = (String, String);

#[derive(Default)]
struct FakeTable {
    rows: Mutex<HashMap<Key, (Map<String, Value>, u64)>>,
    calls: Mutex<Vec<String>>,
    /// Rows reported missing for the given number of reads, as if another
    /// request created them between our check and our create.
    hidden: Mutex<HashMap<Key, usize>>,
    /// Rows whose next update loses to a concurrent writer that stores these
    /// properties first.
    interleaved: Mutex<HashMap<Key, Map<String, Value>>>,
    /// Rows whose updates always lose.
    contended: Mutex<HashSet<Key>>,
    unreachable: bool,
}

fn key(pk: &str, rk: &str) -> Key {
    (pk.to_string(), rk.to_string())
}

impl FakeTable {
    fn seed(&self, pk: &str, rk: &str, props: Value) {
        let Value::Object(map) = props else {
            panic!("seed props must be an object");
        };
        self.rows
            .lock()
            .unwrap()
            .insert(key(pk, rk), (map, 1));
    }

    fn hide(&self, pk: &str, rk: &str, reads: usize) {
        self.hidden.lock().unwrap().insert(key(pk, rk), reads);
    }

    fn interleave(&self, pk: &str, rk: &str, props: Value) {
        let Value::Object(map) = props else {
            panic!("interleaved props must be an object");
        };
        self.interleaved.lock().unwrap().insert(key(pk, rk), map);
    }

    fn contend(&self, pk: &str, rk: &str) {
        self.contended.lock().unwrap().insert(key(pk, rk));
    }

    fn count_calls(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn row(&self, pk: &str, rk: &str) -> Option<Map<String, Value>> {
        self.rows
            .lock()
            .unwrap()
            .get(&key(pk, rk))
            .map(|(p, _)| p.clone())
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn writes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("get "))
            .collect()
    }

    fn record(&self, op: &str, pk: &str, rk: &str) -> anyhow::Result<()> {
        if self.unreachable {
            anyhow::bail!("connection refused");
        }
        self.calls.lock().unwrap().push(format!("{} {}/{}", op, pk, rk));
        Ok(())
    }
}

#[async_trait::async_trait]
impl TableStore for FakeTable {
    async fn get(&self, partition_key: &str, row_key: &str) -> anyhow::Result<Lookup> {
        self.record("get", partition_key, row_key)?;
        let key = (partition_key.to_string(), row_key.to_string());
        if let Some(reads) = self.hidden.lock().unwrap().get_mut(&key) {
            if *reads > 0 {
                *reads -= 1;
                return Ok(Lookup::NotFound);
            }
        }
        Ok(match self.rows.lock().unwrap().get(&key) {
            Some((properties, version)) => Lookup::Found(Entity {
                partition_key: key.0.clone(),
                row_key: key.1.clone(),
                properties: properties.clone(),
                etag: Some(format!("v{}", version)),
            }),
            None => Lookup::NotFound,
        })
    }

    async fn create(&self, entity: &Entity) -> anyhow::Result<CreateOutcome> {
        self.record("create", &entity.partition_key, &entity.row_key)?;
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        rows.insert(key, (entity.properties.clone(), 1));
        Ok(CreateOutcome::Created)
    }

    async fn update(&self, entity: &Entity) -> anyhow::Result<UpdateOutcome> {
        self.record("update", &entity.partition_key, &entity.row_key)?;
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        let mut rows = self.rows.lock().unwrap();
        let Some((properties, version)) = rows.get_mut(&key) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if self.contended.lock().unwrap().contains(&key) {
            return Ok(UpdateOutcome::Conflict);
        }
        if let Some(theirs) = self.interleaved.lock().unwrap().remove(&key) {
            properties.extend(theirs);
            *version += 1;
            return Ok(UpdateOutcome::Conflict);
        }
        let current = format!("v{}", version);
        if entity.etag.as_deref() != Some(current.as_str()) {
            return Ok(UpdateOutcome::Conflict);
        }
        *properties = entity.properties.clone();
        *version += 1;
        Ok(UpdateOutcome::Updated)
    }
}

fn app_with_table(table: Arc<FakeTable>) -> Router {
    let counter = VisitCounter::new(table, Duration::hours(1));
    build_router(AppState::new(counter))
}

fn app_with_retry(table: Arc<FakeTable>, max_attempts: u32) -> Router {
    let retry = RetryPolicy {
        max_attempts,
        base_delay: std::time::Duration::from_millis(1),
        max_delay: std::time::Duration::from_millis(2),
    };
    let counter = VisitCounter::with_retry(table, Duration::hours(1), retry);
    build_router(AppState::new(counter))
}

fn visit(method: &str, ip: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri("/updateCounter");
    if let Some(ip) = ip {
        builder = builder.header("x-forwarded-for", ip);
    }
    builder.body(Body::empty()).expect("failed to build request")
}

async fn json_body(res: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn counter_value(table: &FakeTable) -> Option<u64> {
    table
        .row(COUNTER_PARTITION, COUNTER_ROW)
        .and_then(|p| p.get("count").and_then(|v| v.as_u64()))
}

#[tokio::test]
async fn first_ever_visit_counts_one() {
    let table = Arc::new(FakeTable::default());
    let res = app_with_table(table.clone())
        .oneshot(visit("GET", Some("1.2.3.5")))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["access-control-allow-origin"], "*");
    assert_eq!(res.headers()["content-type"], "application/json");
    assert_eq!(
        res.headers()["cache-control"],
        "no-store, no-cache, must-revalidate"
    );
    assert_eq!(json_body(res).await, json!({ "count": 1 }));

    assert_eq!(
        table.writes(),
        vec![
            "create visitor/1.2.3.5".to_string(),
            "create counter/visits".to_string()
        ]
    );
    assert_eq!(counter_value(&table), Some(1));
}

#[tokio::test]
async fn new_identity_increments_existing_counter() {
    let table = Arc::new(FakeTable::default());
    table.seed(COUNTER_PARTITION, COUNTER_ROW, json!({ "count": 10 }));

    let res = app_with_table(table.clone())
        .oneshot(visit("POST", Some("1.2.3.6")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await, json!({ "count": 11 }));

    assert!(table.row(VISITOR_PARTITION, "1.2.3.6").is_some());
    assert_eq!(
        table.writes(),
        vec![
            "create visitor/1.2.3.6".to_string(),
            "update counter/visits".to_string()
        ]
    );
    assert_eq!(counter_value(&table), Some(11));
}

#[tokio::test]
async fn repeat_visit_inside_window_writes_nothing() {
    let table = Arc::new(FakeTable::default());
    table.seed(COUNTER_PARTITION, COUNTER_ROW, json!({ "count": 5 }));
    let last = (Utc::now() - Duration::minutes(30)).to_rfc3339();
    table.seed(VISITOR_PARTITION, "1.2.3.4", json!({ "lastVisit": last }));

    let res = app_with_table(table.clone())
        .oneshot(visit("GET", Some("1.2.3.4")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await, json!({ "count": 5 }));
    assert!(table.writes().is_empty());
    assert_eq!(
        table.row(VISITOR_PARTITION, "1.2.3.4").unwrap()["lastVisit"],
        json!(last)
    );
}

#[tokio::test]
async fn repeat_visit_after_window_increments() {
    let table = Arc::new(FakeTable::default());
    table.seed(COUNTER_PARTITION, COUNTER_ROW, json!({ "count": 20 }));
    let last = (Utc::now() - Duration::hours(2)).to_rfc3339();
    table.seed(VISITOR_PARTITION, "1.2.3.4", json!({ "lastVisit": last }));

    let res = app_with_table(table.clone())
        .oneshot(visit("GET", Some("1.2.3.4")))
        .await
        .unwrap();
    assert_eq!(json_body(res).await, json!({ "count": 21 }));
    assert_eq!(counter_value(&table), Some(21));

    let refreshed = table.row(VISITOR_PARTITION, "1.2.3.4").unwrap();
    let refreshed = refreshed["lastVisit"].as_str().unwrap();
    let refreshed = chrono::DateTime::parse_from_rfc3339(refreshed).unwrap();
    assert!(Utc::now() - refreshed.with_timezone(&Utc) < Duration::minutes(1));
}

#[tokio::test]
async fn losing_the_create_race_does_not_double_count() {
    let table = Arc::new(FakeTable::default());
    table.seed(COUNTER_PARTITION, COUNTER_ROW, json!({ "count": 1 }));
    table.seed(
        VISITOR_PARTITION,
        "7.7.7.7",
        json!({ "lastVisit": Utc::now().to_rfc3339() }),
    );
    table.hide(VISITOR_PARTITION, "7.7.7.7", 1);

    let res = app_with_table(table.clone())
        .oneshot(visit("GET", Some("7.7.7.7")))
        .await
        .unwrap();
    assert_eq!(json_body(res).await, json!({ "count": 1 }));
    assert_eq!(table.writes(), vec!["create visitor/7.7.7.7".to_string()]);
    assert_eq!(counter_value(&table), Some(1));
}

#[tokio::test]
async fn counter_conflict_is_retried_without_losing_increments() {
    let table = Arc::new(FakeTable::default());
    table.seed(COUNTER_PARTITION, COUNTER_ROW, json!({ "count": 10 }));
    table.interleave(COUNTER_PARTITION, COUNTER_ROW, json!({ "count": 11 }));

    let res = app_with_table(table.clone())
        .oneshot(visit("GET", Some("8.8.8.8")))
        .await
        .unwrap();
    // The concurrent writer moved 10 -> 11, so our retry lands on 12.
    assert_eq!(json_body(res).await, json!({ "count": 12 }));
    assert_eq!(counter_value(&table), Some(12));
    assert_eq!(table.count_calls("update counter/visits"), 2);
}

#[tokio::test]
async fn losing_the_refresh_race_does_not_double_count() {
    let table = Arc::new(FakeTable::default());
    table.seed(COUNTER_PARTITION, COUNTER_ROW, json!({ "count": 20 }));
    let stale = (Utc::now() - Duration::hours(2)).to_rfc3339();
    table.seed(VISITOR_PARTITION, "3.3.3.3", json!({ "lastVisit": stale }));
    // Another request from the same visitor refreshes the row first.
    let theirs = Utc::now().to_rfc3339();
    table.interleave(VISITOR_PARTITION, "3.3.3.3", json!({ "lastVisit": theirs }));

    let res = app_with_table(table.clone())
        .oneshot(visit("GET", Some("3.3.3.3")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await, json!({ "count": 20 }));
    assert_eq!(table.writes(), vec!["update visitor/3.3.3.3".to_string()]);
    assert_eq!(
        table.row(VISITOR_PARTITION, "3.3.3.3").unwrap()["lastVisit"],
        json!(theirs)
    );
    assert_eq!(counter_value(&table), Some(20));
}

#[tokio::test]
async fn visitor_missing_after_create_conflict_is_read_again() {
    let table = Arc::new(FakeTable::default());
    table.seed(COUNTER_PARTITION, COUNTER_ROW, json!({ "count": 3 }));
    table.seed(
        VISITOR_PARTITION,
        "4.4.4.4",
        json!({ "lastVisit": Utc::now().to_rfc3339() }),
    );
    table.hide(VISITOR_PARTITION, "4.4.4.4", 2);

    let res = app_with_table(table.clone())
        .oneshot(visit("GET", Some("4.4.4.4")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(json_body(res).await, json!({ "count": 3 }));
    assert_eq!(table.writes(), vec!["create visitor/4.4.4.4".to_string()]);
    assert_eq!(table.count_calls("get visitor/4.4.4.4"), 3);
}

#[tokio::test]
async fn endless_counter_contention_is_a_server_error() {
    let table = Arc::new(FakeTable::default());
    table.seed(COUNTER_PARTITION, COUNTER_ROW, json!({ "count": 6 }));
    table.contend(COUNTER_PARTITION, COUNTER_ROW);

    let res = app_with_retry(table.clone(), 3)
        .oneshot(visit("GET", Some("5.5.5.5")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(res.headers()["access-control-allow-origin"], "*");
    assert_eq!(
        json_body(res).await,
        json!({ "count": "N/A", "error": "Server error" })
    );
    assert_eq!(table.count_calls("update counter/visits"), 3);
    assert_eq!(counter_value(&table), Some(6));
}

#[tokio::test]
async fn endless_visitor_contention_is_a_server_error() {
    let table = Arc::new(FakeTable::default());
    table.seed(COUNTER_PARTITION, COUNTER_ROW, json!({ "count": 6 }));
    let stale = (Utc::now() - Duration::hours(5)).to_rfc3339();
    table.seed(VISITOR_PARTITION, "6.6.6.6", json!({ "lastVisit": stale }));
    table.contend(VISITOR_PARTITION, "6.6.6.6");

    let res = app_with_retry(table.clone(), 4)
        .oneshot(visit("POST", Some("6.6.6.6")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        json_body(res).await,
        json!({ "count": "N/A", "error": "Server error" })
    );
    assert_eq!(table.count_calls("update visitor/6.6.6.6"), 4);
    assert_eq!(table.count_calls("update counter/visits"), 0);
    assert_eq!(counter_value(&table), Some(6));
}

#[tokio::test]
async fn missing_headers_share_the_unknown_identity() {
    let table = Arc::new(FakeTable::default());
    let app = app_with_table(table.clone());

    let first = app.clone().oneshot(visit("GET", None)).await.unwrap();
    assert_eq!(json_body(first).await, json!({ "count": 1 }));
    let second = app.oneshot(visit("GET", None)).await.unwrap();
    assert_eq!(json_body(second).await, json!({ "count": 1 }));

    assert!(table.row(VISITOR_PARTITION, "unknown").is_some());
}

#[tokio::test]
async fn preflight_skips_the_store() {
    let table = Arc::new(FakeTable::default());
    let res = app_with_table(table.clone())
        .oneshot(visit("OPTIONS", None))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["access-control-allow-origin"], "*");
    assert_eq!(
        res.headers()["access-control-allow-methods"],
        "GET, POST, OPTIONS"
    );
    assert_eq!(
        res.headers()["access-control-allow-headers"],
        "Content-Type, Accept, Origin"
    );
    assert_eq!(res.headers()["access-control-max-age"], "3600");
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    assert!(bytes.is_empty());
    assert!(table.calls().is_empty());
}

#[tokio::test]
async fn missing_configuration_reports_error() {
    let app = build_router(AppState::unconfigured());
    let res = app.oneshot(visit("GET", Some("1.2.3.4"))).await.unwrap();

    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(res.headers()["access-control-allow-origin"], "*");
    assert_eq!(
        json_body(res).await,
        json!({ "count": "N/A", "error": "Configuration error" })
    );
}

#[tokio::test]
async fn store_failure_is_a_generic_server_error() {
    let table = Arc::new(FakeTable {
        unreachable: true,
        ..FakeTable::default()
    });
    let res = app_with_table(table)
        .oneshot(visit("GET", Some("1.2.3.4")))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(res).await;
    assert_eq!(body, json!({ "count": "N/A", "error": "Server error" }));
    assert!(!body.to_string().contains("connection refused"));
}

#[tokio::test]
async fn unsupported_methods_are_rejected() {
    let table = Arc::new(FakeTable::default());
    let res = app_with_table(table.clone())
        .oneshot(visit("DELETE", Some("1.2.3.4")))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(
        json_body(res).await,
        json!({ "count": "N/A", "error": "Method not allowed" })
    );
    assert!(table.calls().is_empty());
}

#[tokio::test]
async fn functions_route_prefix_is_served() {
    let table = Arc::new(FakeTable::default());
    let req = Request::get("/api/updateCounter")
        .header("x-real-ip", "9.9.9.9")
        .body(Body::empty())
        .unwrap();
    let res = app_with_table(table.clone()).oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(table.row(VISITOR_PARTITION, "9.9.9.9").is_some());
}

#[tokio::test]
async fn health_is_ok() {
    let res = build_router(AppState::unconfigured())
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}
