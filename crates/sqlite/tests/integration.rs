use std::{
    sync::Arc,
    time::Duration,
};

use common::runtime::Runtime;
use futures::FutureExt;
use pretty_assertions::assert_eq;
use query_orchestrator::{
    driver::{
        mock::{
            row,
            MockDriver,
        },
        DriverInterface,
    },
    queue::{
        AddToQueueRequest,
        CacheAndQueueDriver,
        CacheAndQueueDriverFactory,
        JobKind,
        QueryDefUpdate,
        QueueDriver,
        QueueDriverOptions,
        QueueResult,
    },
    OrchestratorOptions,
    QueryBody,
    QueryOrchestrator,
};
use runtime::testing::TestRuntime;
use serde_json::json;
use sqlite::{
    cache_and_queue_driver_factory,
    SqliteDriverFactory,
};
use tempfile::TempDir;

fn db_path(dir: &TempDir) -> anyhow::Result<String> {
    dir.path()
        .join("orchestrator.sqlite3")
        .to_str()
        .map(str::to_owned)
        .ok_or_else(|| anyhow::anyhow!("Non UTF-8 temp dir"))
}

fn options(concurrency: usize) -> QueueDriverOptions {
    QueueDriverOptions {
        prefix: "SQL_QUERY_test".to_owned(),
        concurrency,
        continue_wait_timeout: Duration::from_secs(5),
        orphaned_timeout: Duration::from_secs(120),
        heart_beat_timeout: Duration::from_secs(120),
        process_uid: "uid".to_owned(),
    }
}

fn request(key: &str, key_score: i64, orphaned_time: i64) -> AddToQueueRequest {
    AddToQueueRequest {
        key_score,
        query_key: json!(key),
        orphaned_time,
        query_handler: JobKind::Query,
        query: json!({"sql": key}),
        priority: 0,
        queue_id: key_score,
        stage_query_key: None,
        request_id: None,
        awaits_result: true,
    }
}

#[orchestrator_macro::test_runtime]
async fn test_dispatch_order_and_locks(rt: TestRuntime) -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let factory = SqliteDriverFactory::new(rt.clone(), &db_path(&dir)?)?;
    assert!(factory.is_fresh());
    let driver = factory.queue_driver(options(1))?;
    let conn = driver.create_connection().await?;
    let orphaned = rt.unix_millis() + 100_000;

    assert!(conn.add_to_queue(request("low", 300, orphaned)).await?.added);
    conn.add_to_queue(request("high", 100, orphaned)).await?;
    let mid = conn.add_to_queue(request("mid", 200, orphaned)).await?;
    assert_eq!(mid.queue_size, 3);
    let again = conn.add_to_queue(request("mid", 50, orphaned)).await?;
    assert!(!again.added);
    assert_eq!(again.queue_id, Some(200));
    let keys: Vec<_> = conn
        .get_to_process_queries()
        .await?
        .into_iter()
        .map(|(hash, _)| hash.to_string())
        .collect();
    assert_eq!(keys, vec!["high", "mid", "low"]);

    let high = driver.redis_hash(&json!("high"));
    let mid = driver.redis_hash(&json!("mid"));
    let pid = conn.get_next_processing_id().await?;
    assert_eq!(pid, 2);
    let retrieved = conn
        .retrieve_for_processing(&high, pid)
        .await?
        .expect("lock is free");
    assert!(retrieved.added);
    assert_eq!(retrieved.queue_size, 2);
    assert_eq!(retrieved.query_def.map(|def| def.query), Some(json!({"sql": "high"})));
    assert!(conn.retrieve_for_processing(&high, pid + 1).await?.is_none());

    // Concurrency 1: the second query locks but doesn't activate.
    let pid2 = conn.get_next_processing_id().await?;
    let retrieved = conn
        .retrieve_for_processing(&mid, pid2)
        .await?
        .expect("lock is free");
    assert!(!retrieved.added);
    assert_eq!(retrieved.active_keys, vec![high.clone()]);
    conn.free_processing_lock(&mid, pid2, false).await?;
    assert_eq!(conn.get_active_queries().await?.len(), 1);

    let state = conn.get_query_stage_state(false).await?;
    assert_eq!(state.active, vec![high.clone()]);
    assert_eq!(state.to_process.len(), 2);
    assert_eq!(state.defs.len(), 3);
    assert!(conn.get_query_stage_state(true).await?.defs.is_empty());
    Ok(())
}

#[orchestrator_macro::test_runtime]
async fn test_results_are_shared_between_processes(rt: TestRuntime) -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = db_path(&dir)?;
    let waiter_factory = SqliteDriverFactory::new(rt.clone(), &path)?;
    let worker_factory = SqliteDriverFactory::new(rt.clone(), &path)?;
    assert!(!worker_factory.is_fresh());
    let waiter_driver = waiter_factory.queue_driver(options(2))?;
    let worker_driver = worker_factory.queue_driver(options(2))?;
    let waiter = waiter_driver.create_connection().await?;
    let worker = worker_driver.create_connection().await?;
    let hash = waiter_driver.redis_hash(&json!("a"));

    // Unknown queries don't block.
    assert_eq!(waiter.get_result_blocking(&hash).await?, None);

    waiter
        .add_to_queue(request("a", 1, rt.unix_millis() + 100_000))
        .await?;
    let start = rt.unix_millis();
    assert_eq!(waiter.get_result_blocking(&hash).await?, None);
    assert!(rt.unix_millis() - start >= 5000);

    let pid = worker.get_next_processing_id().await?;
    assert_eq!(waiter.get_next_processing_id().await?, pid + 1);
    worker.retrieve_for_processing(&hash, pid).await?;
    assert!(
        worker
            .optimistic_query_update(
                &hash,
                QueryDefUpdate {
                    start_query_time: Some(42),
                    cancel_handler: None,
                },
                pid,
            )
            .await?
    );
    assert_eq!(
        waiter
            .get_query_def(&hash)
            .await?
            .and_then(|def| def.start_query_time),
        Some(42)
    );

    // The worker's process asks for the same query while it runs.
    assert!(
        !worker
            .add_to_queue(request("a", 2, rt.unix_millis() + 100_000))
            .await?
            .added
    );

    let wait = waiter.get_result_blocking(&hash);
    let finish = async {
        rt.wait(Duration::from_secs(1)).await;
        assert!(
            !worker
                .set_result_and_remove_query(&hash, QueueResult::Result(json!(1)), pid + 100)
                .await?
        );
        worker
            .set_result_and_remove_query(&hash, QueueResult::Result(json!([{"n": 1}])), pid)
            .await
    };
    let (result, stored) = futures::join!(wait, finish);
    assert!(stored?);
    assert_eq!(result?, Some(QueueResult::Result(json!([{"n": 1}]))));
    // Each caller that enqueued the query reads the result once.
    assert_eq!(
        worker.get_result(&hash).await?,
        Some(QueueResult::Result(json!([{"n": 1}])))
    );
    assert_eq!(worker.get_result(&hash).await?, None);
    assert!(worker.get_query_def(&hash).await?.is_none());
    assert!(worker.get_active_queries().await?.is_empty());
    Ok(())
}

#[orchestrator_macro::test_runtime]
async fn test_orphaned_and_stalled(rt: TestRuntime) -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let factory = SqliteDriverFactory::new(rt.clone(), &db_path(&dir)?)?;
    let driver = factory.queue_driver(options(2))?;
    let conn = driver.create_connection().await?;
    let now = rt.unix_millis();
    conn.add_to_queue(request("orphan", 1, now + 10_000)).await?;
    conn.add_to_queue(request("running", 2, now + 1_000_000))
        .await?;
    let running = driver.redis_hash(&json!("running"));
    let pid = conn.get_next_processing_id().await?;
    conn.retrieve_for_processing(&running, pid).await?;

    rt.advance_time(Duration::from_secs(11)).await;
    let orphaned = conn.get_orphaned_queries().await?;
    assert_eq!(orphaned.len(), 1);
    assert_eq!(orphaned[0].0.as_str(), "orphan");
    assert!(conn.get_stalled_queries().await?.is_empty());

    rt.advance_time(Duration::from_secs(120)).await;
    assert_eq!(conn.get_stalled_queries().await?[0].0, running);
    conn.update_heart_beat(&running).await?;
    assert!(conn.get_stalled_queries().await?.is_empty());

    let to_cancel = conn.get_queries_to_cancel().await?;
    assert_eq!(to_cancel.len(), 1);
    let def = conn
        .get_query_and_remove(&to_cancel[0].0)
        .await?
        .expect("queued");
    assert_eq!(def.query, json!({"sql": "orphan"}));
    assert!(conn.get_queries_to_cancel().await?.is_empty());

    // Other prefixes don't see this queue.
    let mut other = options(2);
    other.prefix = "other".to_owned();
    let other = factory.queue_driver(other)?.create_connection().await?;
    assert!(other.get_active_queries().await?.is_empty());
    Ok(())
}

#[orchestrator_macro::test_runtime]
async fn test_cache_values_and_locks(rt: TestRuntime) -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let factory = SqliteDriverFactory::new(rt.clone(), &db_path(&dir)?)?;
    let cache = factory.cache_driver()?;
    cache.test_connection().await?;

    let stored = cache
        .set("SQL_QUERY_RESULT_a", json!({"n": 1}), Duration::from_secs(10))
        .await?;
    assert_eq!(stored.bytes, r#"{"n":1}"#.len());
    cache
        .set("SQL_QUERY_RESULT_b", json!(2), Duration::from_secs(30))
        .await?;
    cache.set("OTHER", json!(3), Duration::from_secs(30)).await?;
    assert_eq!(cache.get("SQL_QUERY_RESULT_a").await?, Some(json!({"n": 1})));
    assert_eq!(
        cache.keys_starting_with("SQL_QUERY_RESULT_").await?,
        vec!["SQL_QUERY_RESULT_a", "SQL_QUERY_RESULT_b"]
    );

    rt.advance_time(Duration::from_secs(11)).await;
    assert_eq!(cache.get("SQL_QUERY_RESULT_a").await?, None);
    assert_eq!(
        cache.keys_starting_with("SQL_QUERY_RESULT_").await?,
        vec!["SQL_QUERY_RESULT_b"]
    );
    cache.cleanup().await?;
    cache.remove("SQL_QUERY_RESULT_b").await?;
    assert_eq!(cache.get("SQL_QUERY_RESULT_b").await?, None);

    let ttl = Duration::from_secs(60);
    assert!(cache.try_acquire_lock("drop", ttl).await?);
    let ran = cache
        .with_lock("drop", ttl, true, async { Ok::<_, anyhow::Error>(()) }.boxed())
        .await?;
    assert!(!ran);
    rt.advance_time(Duration::from_secs(61)).await;
    let ran = cache
        .with_lock("drop", ttl, true, async { Ok::<_, anyhow::Error>(()) }.boxed())
        .await?;
    assert!(ran);
    assert!(cache.try_acquire_lock("drop", ttl).await?);
    cache.free_lock("drop").await?;
    assert!(cache.try_acquire_lock("drop", ttl).await?);
    Ok(())
}

#[orchestrator_macro::test_runtime]
async fn test_orchestrators_share_cached_results(rt: TestRuntime) -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let backend = CacheAndQueueDriver::Sqlite {
        path: db_path(&dir)?,
    };
    let source = Arc::new(MockDriver::new());
    source.on_query("FROM orders", vec![row(&[("count", json!(3))])]);
    let new_orchestrator = |rt: &TestRuntime| -> anyhow::Result<QueryOrchestrator<TestRuntime>> {
        let source = source.clone();
        QueryOrchestrator::new(
            rt.clone(),
            "TEST",
            Arc::new(move |_: &str| -> anyhow::Result<Arc<dyn DriverInterface>> {
                Ok(source.clone())
            }),
            None,
            cache_and_queue_driver_factory(rt.clone(), &backend)?,
            OrchestratorOptions::default(),
        )
    };
    let first = new_orchestrator(&rt)?;
    let second = new_orchestrator(&rt)?;
    let body = QueryBody {
        query: "SELECT count(*) FROM orders".to_owned(),
        ..Default::default()
    };

    let result = first.fetch_query(&body).await?;
    assert_eq!(result.data, Some(json!([{"count": 3}])));
    let cached = second
        .result_from_cache_if_exists(&body)
        .await?
        .expect("stored by the first orchestrator");
    assert_eq!(cached.data, json!([{"count": 3}]));
    assert_eq!(second.fetch_query(&body).await?.data, result.data);
    assert_eq!(source.count_statements("FROM orders"), 1);
    Ok(())
}
