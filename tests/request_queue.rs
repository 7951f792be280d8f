use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_sqlite_bridge::{
    Args, ConstraintKind, Database, Engine, EngineHandle, Error, ErrorKind, HandleOptions,
    PendingRequest, Registry, RegistryConfig, Result, SqliteEngine, StatementResult, Value,
};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const SLOW_MARKER: &str = "/* slow */";

/// SQLite engine that counts statements reaching it, stalls on request and
/// can be told to refuse ROLLBACK.
struct CountingEngine {
    execs: Arc<AtomicUsize>,
    fail_rollback: Arc<AtomicBool>,
    delay: Duration,
}

struct CountingHandle {
    inner: Box<dyn EngineHandle>,
    execs: Arc<AtomicUsize>,
    fail_rollback: Arc<AtomicBool>,
    delay: Duration,
}

impl Engine for CountingEngine {
    fn open_handle(&self, path: &Path, options: HandleOptions) -> Result<Box<dyn EngineHandle>> {
        Ok(Box::new(CountingHandle {
            inner: SqliteEngine.open_handle(path, options)?,
            execs: self.execs.clone(),
            fail_rollback: self.fail_rollback.clone(),
            delay: self.delay,
        }))
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        SqliteEngine.delete_file(path)
    }
}

impl EngineHandle for CountingHandle {
    fn exec(&mut self, sql: &str, args: &[Value]) -> Result<StatementResult> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        if sql.contains(SLOW_MARKER) {
            std::thread::sleep(self.delay);
        }
        if sql == "ROLLBACK" && self.fail_rollback.load(Ordering::SeqCst) {
            return Err(Error::Engine {
                code: None,
                message: "disk I/O error".to_string(),
            });
        }
        self.inner.exec(sql, args)
    }

    fn is_autocommit(&self) -> bool {
        self.inner.is_autocommit()
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.inner.close()
    }
}

struct Fixture {
    _registry: Registry,
    db: Database,
    execs: Arc<AtomicUsize>,
    fail_rollback: Arc<AtomicBool>,
    _dir: TempDir,
}

async fn setup(config: impl FnOnce(RegistryConfig) -> RegistryConfig) -> Fixture {
    let dir = TempDir::new().unwrap();
    let execs = Arc::new(AtomicUsize::new(0));
    let fail_rollback = Arc::new(AtomicBool::new(false));
    let engine = CountingEngine {
        execs: execs.clone(),
        fail_rollback: fail_rollback.clone(),
        delay: Duration::from_millis(400),
    };
    let registry = Registry::with_engine(config(RegistryConfig::new(dir.path())), Arc::new(engine));
    let db = registry.open("queue").await.unwrap();
    db.execute_sql(
        "CREATE TABLE events (id INTEGER PRIMARY KEY, label TEXT NOT NULL)",
        (),
    )
    .await
    .unwrap();
    Fixture {
        _registry: registry,
        db,
        execs,
        fail_rollback,
        _dir: dir,
    }
}

async fn labels(db: &Database) -> Vec<String> {
    db.execute_sql("SELECT label FROM events ORDER BY id", ())
        .await
        .unwrap()
        .rows
        .iter()
        .map(|row| row.get("label").and_then(Value::as_str).unwrap().to_string())
        .collect()
}

fn insert(db: &Database, label: &str) -> PendingRequest {
    db.submit("INSERT INTO events (label) VALUES (?)", [label])
        .unwrap()
}

/// Occupy the queue with a transaction until the returned sender fires.
async fn hold_queue(db: &Database) -> (oneshot::Sender<()>, JoinHandle<Result<()>>) {
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let task_db = db.clone();
    let holder = tokio::spawn(async move {
        task_db
            .transaction(|_tx| async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok(())
            })
            .await
    });
    started_rx.await.unwrap();
    (release_tx, holder)
}

#[tokio::test]
async fn test_execution_follows_submission_order() {
    let fx = setup(|c| c).await;

    let pending: Vec<_> = (0..50)
        .map(|i| insert(&fx.db, &format!("e{i}")))
        .collect();
    let results = futures::future::join_all(pending.into_iter().map(PendingRequest::wait)).await;

    let ids: Vec<i64> = results
        .into_iter()
        .map(|r| r.unwrap().insert_id.unwrap())
        .collect();
    assert_eq!(ids, (1..=50).collect::<Vec<i64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_complete_in_submission_order() {
    let fx = setup(|c| c).await;
    let submitted = Arc::new(Mutex::new(Vec::new()));

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let db = fx.db.clone();
            let submitted = submitted.clone();
            tokio::spawn(async move {
                let pending = {
                    let mut order = submitted.lock();
                    let pending = insert(&db, &format!("task{i}"));
                    order.push(i);
                    pending
                };
                (i, pending.wait().await.unwrap().insert_id.unwrap())
            })
        })
        .collect();

    let mut completed = Vec::new();
    for task in tasks {
        completed.push(task.await.unwrap());
    }
    completed.sort_by_key(|(_, id)| *id);
    let execution_order: Vec<i32> = completed.into_iter().map(|(i, _)| i).collect();
    assert_eq!(execution_order, *submitted.lock());
}

#[tokio::test]
async fn test_transaction_span_is_not_interleaved() {
    let fx = setup(|c| c).await;
    let (release, holder) = hold_queue(&fx.db).await;

    // Queued behind the open span; must not run until it ends.
    let outsider = insert(&fx.db, "outsider");
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Only CREATE TABLE and BEGIN have reached the engine.
    assert_eq!(fx.execs.load(Ordering::SeqCst), 2);

    release.send(()).unwrap();
    holder.await.unwrap().unwrap();
    outsider.wait().await.unwrap();
    assert_eq!(labels(&fx.db).await, ["outsider"]);
}

#[tokio::test]
async fn test_cancel_removes_queued_request() {
    let fx = setup(|c| c).await;
    let (release, holder) = hold_queue(&fx.db).await;

    let first = insert(&fx.db, "first");
    let doomed = insert(&fx.db, "doomed");
    let last = insert(&fx.db, "last");

    assert!(doomed.cancel());
    assert_eq!(doomed.wait().await.unwrap_err().kind(), ErrorKind::Cancelled);

    release.send(()).unwrap();
    holder.await.unwrap().unwrap();
    first.wait().await.unwrap();
    last.wait().await.unwrap();

    assert_eq!(labels(&fx.db).await, ["first", "last"]);
}

#[tokio::test]
async fn test_dropped_request_never_runs() {
    let fx = setup(|c| c).await;
    let (release, holder) = hold_queue(&fx.db).await;

    drop(insert(&fx.db, "dropped"));
    let kept = insert(&fx.db, "kept");

    release.send(()).unwrap();
    holder.await.unwrap().unwrap();
    kept.wait().await.unwrap();

    assert_eq!(labels(&fx.db).await, ["kept"]);
}

#[tokio::test]
async fn test_queued_request_times_out() {
    let fx = setup(|c| c).await;
    let (release, holder) = hold_queue(&fx.db).await;

    let err = insert(&fx.db, "late")
        .with_timeout(Duration::from_millis(50))
        .wait()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    release.send(()).unwrap();
    holder.await.unwrap().unwrap();
    assert!(labels(&fx.db).await.is_empty());
}

#[tokio::test]
async fn test_default_request_timeout_applies() {
    let fx = setup(|c| c.with_request_timeout(Some(Duration::from_millis(50)))).await;
    let (release, holder) = hold_queue(&fx.db).await;

    let err = fx
        .db
        .execute_sql("SELECT COUNT(*) FROM events", ())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    release.send(()).unwrap();
    holder.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dispatched_request_runs_to_completion() {
    let fx = setup(|c| c).await;

    let sql = format!("SELECT 1 {SLOW_MARKER}");
    let result = fx
        .db
        .submit(&sql, ())
        .unwrap()
        .with_timeout(Duration::from_millis(100))
        .wait()
        .await
        .unwrap();
    assert_eq!(result.scalar(), Some(&Value::Integer(1)));
}

#[tokio::test]
async fn test_argument_count_checked_before_engine() {
    let fx = setup(|c| c).await;
    let before = fx.execs.load(Ordering::SeqCst);

    let err = fx
        .db
        .execute_sql("INSERT INTO events (id, label) VALUES (?, ?)", ["only-one"])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentCount);

    let err = fx
        .db
        .execute_sql("SELECT * FROM events", Args::new().bind(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentCount);
    assert_eq!(fx.execs.load(Ordering::SeqCst), before);

    // Same check inside a transaction; BEGIN and ROLLBACK are the only
    // statements that reach the engine.
    let err = fx
        .db
        .transaction(|tx| async move {
            tx.execute_sql("SELECT ?", ()).await?;
            Ok(())
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgumentCount);
    assert_eq!(fx.execs.load(Ordering::SeqCst), before + 2);
}

#[tokio::test]
async fn test_close_waits_for_queued_requests() {
    let fx = setup(|c| c).await;

    let queued = insert(&fx.db, "before-close");
    fx.db.close().await.unwrap();
    assert!(queued.wait().await.is_ok());

    let err = fx
        .db
        .execute_sql("SELECT 1", ())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ClosedConnection);
    assert!(fx.db.close().await.is_ok());
}

#[tokio::test]
async fn test_close_refused_during_transaction() {
    let fx = setup(|c| c).await;
    let (release, holder) = hold_queue(&fx.db).await;

    let err = fx.db.close().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ActiveTransaction);
    assert!(fx.db.is_open());

    release.send(()).unwrap();
    holder.await.unwrap().unwrap();
    fx.db.close().await.unwrap();
    assert!(!fx.db.is_open());
}

#[tokio::test]
async fn test_failed_rollback_after_body_error_keeps_original_error() {
    let fx = setup(|c| c).await;
    fx.fail_rollback.store(true, Ordering::SeqCst);

    let err = fx
        .db
        .transaction(|tx| async move {
            tx.execute_sql("INSERT INTO events (label) VALUES (?)", ["x"])
                .await?;
            Err::<(), _>(Error::aborted("changed my mind"))
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Aborted);
    let rollback = err.rollback_failure().expect("rollback failure attached");
    assert_eq!(rollback.kind(), ErrorKind::Engine);
    assert!(err.to_string().contains("disk I/O error"));
    assert_eq!(err.into_original().kind(), ErrorKind::Aborted);
    assert!(!fx.db.in_transaction());
}

#[tokio::test]
async fn test_failed_rollback_after_commit_failure_keeps_commit_error() {
    let fx = setup(|c| c).await;
    fx.db
        .execute_sql("CREATE TABLE parent (id INTEGER PRIMARY KEY)", ())
        .await
        .unwrap();
    fx.db
        .execute_sql(
            "CREATE TABLE child (
                parent_id INTEGER REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED
            )",
            (),
        )
        .await
        .unwrap();
    fx.fail_rollback.store(true, Ordering::SeqCst);

    // The deferred foreign key fails at COMMIT, then ROLLBACK fails too.
    let err = fx
        .db
        .transaction(|tx| async move {
            tx.execute_sql("INSERT INTO child (parent_id) VALUES (?)", [7])
                .await?;
            Ok(())
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    assert!(err.rollback_failure().is_some());
    assert!(matches!(
        err.into_original(),
        Error::ConstraintViolation {
            kind: ConstraintKind::ForeignKey,
            ..
        }
    ));
}
