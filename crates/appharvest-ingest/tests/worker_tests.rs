//! Resumable worker and category worker integration tests
//!
//! All tests run on paused tokio time, so throttle delays and sink backoff
//! cost nothing.

mod common;

use anyhow::Result;
use appharvest_ingest::error::HarvestError;
use appharvest_ingest::framework::{
    AdaptiveThrottle, CategoryWorker, ProgressLedger, ProgressRecord, RecordSink, ResumableWorker,
    SinkConfig, ThrottleConfig, WorkUnit, WorkUnitStatus, WorkerConfig,
};
use appharvest_ingest::store::StoreErrorKind;
use appharvest_ingest::upstream::UpstreamError;
use common::{
    init_tracing, page_cursor, stored_review_row, FailingStore, FixedProbe, ScriptedUpstream,
};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CATEGORY: &str = "TOOLS";
const APP: &str = "com.example.notes";

struct Harness {
    upstream: Arc<ScriptedUpstream>,
    store: Arc<FailingStore>,
    probe: Arc<FixedProbe>,
    ledger: Arc<ProgressLedger>,
    worker: ResumableWorker,
    _dir: TempDir,
}

fn harness(upstream: ScriptedUpstream, config: WorkerConfig, sink: SinkConfig) -> Harness {
    init_tracing();
    let dir = TempDir::new().expect("temp dir");
    let upstream = Arc::new(upstream);
    let store = Arc::new(FailingStore::new());
    let probe = Arc::new(FixedProbe::new(40.0));
    let ledger = Arc::new(
        ProgressLedger::open(dir.path(), config.max_records_per_unit).expect("open ledger"),
    );
    let worker = ResumableWorker::new(
        upstream.clone(),
        RecordSink::new(store.clone(), sink),
        ledger.clone(),
        probe.clone(),
        config,
    );
    Harness {
        upstream,
        store,
        probe,
        ledger,
        worker,
        _dir: dir,
    }
}

fn default_harness(upstream: ScriptedUpstream) -> Harness {
    harness(upstream, WorkerConfig::default(), SinkConfig::default())
}

fn throttle() -> AdaptiveThrottle {
    AdaptiveThrottle::new(ThrottleConfig::default())
}

fn latest(ledger: &ProgressLedger, unit: &str) -> ProgressRecord {
    ledger
        .load(CATEGORY)
        .expect("load ledger")
        .remove(unit)
        .expect("unit has a ledger record")
}

#[tokio::test(start_paused = true)]
async fn test_prestored_page_counts_as_duplicates() -> Result<()> {
    let h = default_harness(ScriptedUpstream::new().with_app(CATEGORY, APP, 20, 250));

    // Page 3 was stored by an earlier, unrecorded run
    let seeded: Vec<Value> = (500..750).map(|n| stored_review_row(APP, n)).collect();
    h.store.seed("reviews", &seeded).await;

    let outcome = h
        .worker
        .process_unit(
            &WorkUnit::new(CATEGORY, APP),
            None,
            &mut throttle(),
            &CancellationToken::new(),
        )
        .await?;

    assert!(outcome.completed);
    assert_eq!(outcome.pages, 20);
    assert_eq!(outcome.flushed.inserted, 4750);
    assert_eq!(outcome.flushed.skipped, 250);
    assert_eq!(outcome.flushed.failed, 0);
    assert_eq!(outcome.records_so_far, 5000);
    assert_eq!(h.store.count("reviews"), 5000);

    let record = latest(&h.ledger, APP);
    assert_eq!(record.status, WorkUnitStatus::Completed);
    assert_eq!(record.records_so_far, 5000);
    assert!(h.ledger.is_complete(&record));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_per_unit_cap_stops_paging() -> Result<()> {
    let config = WorkerConfig {
        max_records_per_unit: 600,
        ..Default::default()
    };
    let h = harness(
        ScriptedUpstream::new().with_app(CATEGORY, APP, 10, 250),
        config,
        SinkConfig::default(),
    );

    let outcome = h
        .worker
        .process_unit(
            &WorkUnit::new(CATEGORY, APP),
            None,
            &mut throttle(),
            &CancellationToken::new(),
        )
        .await?;

    assert!(outcome.completed);
    assert_eq!(outcome.pages, 3);
    assert_eq!(outcome.records_so_far, 600);
    assert_eq!(h.store.count("reviews"), 600);
    assert_eq!(h.upstream.page_requests().len(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_resumes_from_checkpoint_cursor() -> Result<()> {
    let h = default_harness(ScriptedUpstream::new().with_app(CATEGORY, APP, 20, 250));

    let checkpoint = ProgressRecord::new(CATEGORY, APP, WorkUnitStatus::InProgress, 2500)
        .with_cursor(Some(page_cursor(10)));
    h.ledger.append(&checkpoint)?;
    let resume = latest(&h.ledger, APP);

    let unit = WorkUnit::new(CATEGORY, APP).with_status(WorkUnitStatus::InProgress);
    let outcome = h
        .worker
        .process_unit(&unit, Some(&resume), &mut throttle(), &CancellationToken::new())
        .await?;

    let requests = h.upstream.page_requests();
    assert_eq!(requests.first().and_then(|(_, c)| c.clone()), Some(page_cursor(10)));
    assert!(requests.iter().all(|(_, cursor)| cursor.is_some()));

    assert_eq!(outcome.pages, 10);
    assert_eq!(outcome.flushed.inserted, 2500);
    assert_eq!(outcome.records_so_far, 5000);
    assert_eq!(latest(&h.ledger, APP).status, WorkUnitStatus::Completed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_pauses_then_resume_finishes() -> Result<()> {
    let h = default_harness(ScriptedUpstream::new().with_app(CATEGORY, APP, 20, 250));
    let unit = WorkUnit::new(CATEGORY, APP);

    let cancel = CancellationToken::new();
    h.upstream.cancel_after_pages(5, cancel.clone());

    let paused = h
        .worker
        .process_unit(&unit, None, &mut throttle(), &cancel)
        .await?;
    assert!(!paused.completed);
    assert_eq!(paused.records_so_far, 1250);
    assert_eq!(paused.cursor, Some(page_cursor(5)));

    let record = latest(&h.ledger, APP);
    assert_eq!(record.status, WorkUnitStatus::InProgress);
    assert_eq!(record.records_so_far, 1250);
    assert_eq!(record.cursor_token, Some(page_cursor(5)));
    assert_eq!(record.last_error.as_deref(), Some("interrupted"));

    let finished = h
        .worker
        .process_unit(&unit, Some(&record), &mut throttle(), &CancellationToken::new())
        .await?;
    assert!(finished.completed);
    assert_eq!(finished.flushed.inserted, 3750);
    assert_eq!(finished.flushed.skipped, 0);
    assert_eq!(finished.records_so_far, 5000);
    assert_eq!(h.store.count("reviews"), 5000);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_fails_unit_at_last_checkpoint() -> Result<()> {
    let h = default_harness(ScriptedUpstream::new().with_app(CATEGORY, APP, 20, 250));
    // Calls 1-3 flush page 1; call 4 is the first chunk of page 2
    h.store.fail_call(4, StoreErrorKind::Fatal);

    let err = h
        .worker
        .process_unit(
            &WorkUnit::new(CATEGORY, APP),
            None,
            &mut throttle(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("unit should fail");

    match err {
        HarvestError::UnitFailed { records_so_far, .. } => assert_eq!(records_so_far, 250),
        other => panic!("unexpected error: {other}"),
    }

    let record = latest(&h.ledger, APP);
    assert_eq!(record.status, WorkUnitStatus::Failed);
    assert_eq!(record.records_so_far, 250);
    assert_eq!(record.cursor_token, Some(page_cursor(1)));
    assert!(!h.ledger.is_complete(&record));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transient_store_errors_are_retried() -> Result<()> {
    let h = default_harness(ScriptedUpstream::new().with_app(CATEGORY, APP, 20, 250));
    h.store.fail_call(4, StoreErrorKind::Transient);
    h.store.fail_call(5, StoreErrorKind::Transient);

    let outcome = h
        .worker
        .process_unit(
            &WorkUnit::new(CATEGORY, APP),
            None,
            &mut throttle(),
            &CancellationToken::new(),
        )
        .await?;

    assert!(outcome.completed);
    assert_eq!(outcome.flushed.inserted, 5000);
    // 20 flushes of 250 records in chunks of 100/100/50, plus two retries
    assert_eq!(h.store.calls(), 62);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_consecutive_upstream_errors_abort_unit() -> Result<()> {
    let config = WorkerConfig::default();
    let h = harness(
        ScriptedUpstream::new().with_app(CATEGORY, APP, 20, 250),
        config,
        SinkConfig::default(),
    );
    h.upstream.fail_next(
        UpstreamError::Server {
            status: 502,
            message: "bad gateway".into(),
        },
        50,
    );

    let mut throttle = AdaptiveThrottle::new(ThrottleConfig {
        abort_after_errors: 3,
        ..Default::default()
    });
    let err = h
        .worker
        .process_unit(
            &WorkUnit::new(CATEGORY, APP),
            None,
            &mut throttle,
            &CancellationToken::new(),
        )
        .await
        .expect_err("unit should abort");

    assert!(matches!(
        err,
        HarvestError::UnitAborted {
            consecutive_errors: 4,
            records_so_far: 0,
            ..
        }
    ));
    assert!(throttle.current_delay() >= ThrottleConfig::default().max_delay);
    assert_eq!(latest(&h.ledger, APP).status, WorkUnitStatus::Failed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_memory_pressure_flushes_early() -> Result<()> {
    let config = WorkerConfig {
        memory_check_every: 100,
        memory_limit_mb: 512,
        ..Default::default()
    };
    let sink = SinkConfig {
        chunk_size: 250,
        ..Default::default()
    };
    let h = harness(ScriptedUpstream::new().with_app(CATEGORY, APP, 1, 250), config, sink);
    h.probe.set_process_mb(1024);

    let outcome = h
        .worker
        .process_unit(
            &WorkUnit::new(CATEGORY, APP),
            None,
            &mut throttle(),
            &CancellationToken::new(),
        )
        .await?;

    assert_eq!(outcome.flushed.inserted, 250);
    // Flushed at items 100 and 200, then the remaining 50 at the end
    assert_eq!(h.store.calls(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_category_worker_skips_completed_apps() -> Result<()> {
    let upstream = ScriptedUpstream::new()
        .with_app(CATEGORY, "com.example.one", 2, 50)
        .with_app(CATEGORY, "com.example.two", 2, 50)
        .with_app(CATEGORY, "com.example.done", 2, 50)
        .with_app(CATEGORY, "com.example.one", 2, 50);
    let h = default_harness(upstream);
    h.ledger.append(&ProgressRecord::new(
        CATEGORY,
        "com.example.done",
        WorkUnitStatus::Completed,
        100,
    ))?;

    let category_worker = CategoryWorker::new(
        h.upstream.clone(),
        h.worker,
        h.ledger.clone(),
        ThrottleConfig::default(),
    )
    .with_metadata(true);

    let summary = category_worker
        .run(CATEGORY, &CancellationToken::new())
        .await?;

    assert_eq!(summary.apps_listed, 3);
    assert_eq!(summary.apps_skipped, 1);
    assert_eq!(summary.apps_completed, 2);
    assert_eq!(summary.records.inserted, 200);
    assert_eq!(summary.metadata.inserted, 2);
    assert!(summary.success());

    assert_eq!(h.store.count("reviews"), 200);
    assert_eq!(h.store.count("app_meta"), 2);
    assert!(h
        .upstream
        .page_requests()
        .iter()
        .all(|(app, _)| app != "com.example.done"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_buffer_bounds_every_insert() -> Result<()> {
    // 70 does not divide 250, so the buffer fills in the middle of a page
    for (chunk_size, largest) in [(1000, 250), (100, 100)] {
        let config = WorkerConfig {
            buffer_size: 250,
            ..Default::default()
        };
        let sink = SinkConfig {
            chunk_size,
            ..Default::default()
        };
        let h = harness(ScriptedUpstream::new().with_app(CATEGORY, APP, 10, 70), config, sink);

        let outcome = h
            .worker
            .process_unit(
                &WorkUnit::new(CATEGORY, APP),
                None,
                &mut throttle(),
                &CancellationToken::new(),
            )
            .await?;
        assert_eq!(outcome.flushed.inserted, 700);

        let sizes = h.store.batch_sizes("reviews");
        assert_eq!(sizes.iter().sum::<usize>(), 700);
        assert_eq!(sizes.iter().max().copied(), Some(largest), "chunk size {chunk_size}: {sizes:?}");
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_category_worker_skips_apps_already_in_store() -> Result<()> {
    let upstream = ScriptedUpstream::new()
        .with_app(CATEGORY, "com.example.stored", 2, 50)
        .with_app(CATEGORY, "com.example.partial", 2, 50)
        .with_app(CATEGORY, "com.example.fresh", 2, 50);
    let h = default_harness(upstream);

    // Reviews from a run whose ledger is gone
    h.store
        .seed("reviews", &[stored_review_row("com.example.stored", 0)])
        .await;
    // Half done, with a checkpoint to resume from
    let seeded: Vec<Value> = (0..50)
        .map(|n| stored_review_row("com.example.partial", n))
        .collect();
    h.store.seed("reviews", &seeded).await;
    h.ledger.append(
        &ProgressRecord::new(CATEGORY, "com.example.partial", WorkUnitStatus::InProgress, 50)
            .with_cursor(Some(page_cursor(1))),
    )?;

    let category_worker = CategoryWorker::new(
        h.upstream.clone(),
        h.worker,
        h.ledger.clone(),
        ThrottleConfig::default(),
    );
    let summary = category_worker
        .run(CATEGORY, &CancellationToken::new())
        .await?;

    assert_eq!(summary.apps_listed, 3);
    assert_eq!(summary.apps_skipped, 1);
    assert_eq!(summary.apps_completed, 2);
    assert_eq!(summary.records.inserted, 150);
    assert_eq!(h.store.count("reviews"), 201);

    let requests = h.upstream.page_requests();
    assert!(requests.iter().all(|(app, _)| app != "com.example.stored"));
    assert!(requests
        .iter()
        .any(|(app, cursor)| app == "com.example.partial" && *cursor == Some(page_cursor(1))));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_category_worker_store_check_can_be_disabled() -> Result<()> {
    let upstream = ScriptedUpstream::new().with_app(CATEGORY, APP, 1, 20);
    let h = default_harness(upstream);
    h.store.seed("reviews", &[stored_review_row(APP, 0)]).await;

    let category_worker = CategoryWorker::new(
        h.upstream.clone(),
        h.worker,
        h.ledger.clone(),
        ThrottleConfig::default(),
    )
    .with_store_check(false);
    let summary = category_worker
        .run(CATEGORY, &CancellationToken::new())
        .await?;

    assert_eq!(summary.apps_skipped, 0);
    assert_eq!(summary.records.inserted, 19);
    assert_eq!(summary.records.skipped, 1);
    assert_eq!(h.store.count("reviews"), 20);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_category_worker_stores_listing_ranks() -> Result<()> {
    let upstream = ScriptedUpstream::new()
        .with_app(CATEGORY, "com.example.first", 1, 10)
        .with_app(CATEGORY, "com.example.second", 1, 10)
        .with_app(CATEGORY, "com.example.third", 1, 10);
    let h = default_harness(upstream);
    // Ranks are recorded even for apps that are already done
    h.ledger.append(&ProgressRecord::new(
        CATEGORY,
        "com.example.second",
        WorkUnitStatus::Completed,
        10,
    ))?;

    let category_worker = CategoryWorker::new(
        h.upstream.clone(),
        h.worker,
        h.ledger.clone(),
        ThrottleConfig::default(),
    )
    .with_ranks(Some("top_free".to_string()));
    let summary = category_worker
        .run(CATEGORY, &CancellationToken::new())
        .await?;

    assert_eq!(summary.ranks.inserted, 3);
    assert_eq!(summary.apps_skipped, 1);
    assert_eq!(summary.records.inserted, 20);

    let ranks: Vec<(String, u64, String)> = h
        .store
        .rows("app_ranks")
        .iter()
        .map(|row| {
            (
                row["app_id"].as_str().unwrap_or_default().to_string(),
                row["position"].as_u64().unwrap_or_default(),
                row["collection"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    assert_eq!(
        ranks,
        vec![
            ("com.example.first".to_string(), 1, "top_free".to_string()),
            ("com.example.second".to_string(), 2, "top_free".to_string()),
            ("com.example.third".to_string(), 3, "top_free".to_string()),
        ]
    );
    assert!(h.store.rows("app_ranks").iter().all(|row| row["category"] == CATEGORY));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_category_listing_failure_is_reported() {
    let h = default_harness(ScriptedUpstream::new().with_app(CATEGORY, APP, 1, 10));
    h.upstream.fail_next(UpstreamError::Network("connection refused".into()), 10);

    let category_worker = CategoryWorker::new(
        h.upstream.clone(),
        h.worker,
        h.ledger.clone(),
        ThrottleConfig::default(),
    );
    let err = category_worker
        .run(CATEGORY, &CancellationToken::new())
        .await
        .expect_err("listing should fail");

    assert!(matches!(err, HarvestError::UnitFailed { ref unit_id, .. } if unit_id == CATEGORY));
}
