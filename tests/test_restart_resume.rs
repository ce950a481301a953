//! Restart behavior against the on-disk JSONL topic
//!
//! Committed offsets live in the store's `meta.db`, so a restarted runtime
//! resumes after the last committed batch instead of re-reading the topic.

#[cfg(test)]
mod restart_resume_tests {
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use cncflow::error::PipelineError;
    use cncflow::pipeline::{ManualClock, PipelineConfig, PipelineCoordinator};
    use cncflow::queue::{JsonlTopic, StartPosition};
    use cncflow::store::TimeRange;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> PipelineConfig {
        PipelineConfig {
            queue_path: dir.path().join("queue"),
            store_path: dir.path().join("store"),
            start_position: StartPosition::Earliest,
            poll_timeout: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(5),
            ..PipelineConfig::default()
        }
    }

    fn publish_samples(topic: &JsonlTopic, from: i64, to: i64) {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 2, 6, 0, 0).unwrap();
        for i in from..to {
            topic
                .publish_json(&json!({
                    "machine": "CNC-11",
                    "timestamp": (t0 + ChronoDuration::seconds(i)).timestamp_millis(),
                    "event": "ANOMALY_DETECTED",
                    "anomalyType": "TEMPERATURE",
                    "anomalyValue": i as f64
                }))
                .unwrap();
        }
    }

    async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_resumes_after_committed_offset() {
        // Test: second run only sees records published after the first run's commit
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap(),
        ));
        let topic = JsonlTopic::open(&config.queue_path, &config.topic).unwrap();
        publish_samples(&topic, 0, 10);

        let first = PipelineCoordinator::open(config.clone(), clock.clone())
            .unwrap_or_else(|e| panic!("open failed: {}", e))
            .start()
            .unwrap();
        wait_until("first run stores 10", || first.metrics().ingest.stored == 10).await;
        first.shutdown().await;

        publish_samples(&topic, 10, 15);

        let coordinator = PipelineCoordinator::open(config.clone(), clock.clone())
            .unwrap_or_else(|e| panic!("reopen failed: {}", e));
        let store = coordinator.store().clone();
        let second = coordinator.start().unwrap();
        wait_until("second run reads 5", || second.metrics().ingest.records == 5).await;
        let snapshot = second.shutdown().await;

        assert_eq!(snapshot.ingest.stored, 5);
        assert_eq!(snapshot.ingest.duplicates, 0);

        let day = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let range = TimeRange::new(day, day + ChronoDuration::days(1));
        assert_eq!(store.scan_range(None, range).count(), 15);
    }

    #[tokio::test]
    async fn test_chunk_width_change_is_fatal() {
        // Test: reopening a store with a different chunk width fails before starting
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let first = PipelineCoordinator::open(config(&dir), clock.clone());
        assert!(first.is_ok());
        drop(first);

        let changed = PipelineConfig {
            chunk_width: Duration::from_secs(3_600),
            ..config(&dir)
        };
        match PipelineCoordinator::open(changed, clock) {
            Err(PipelineError::FatalConfiguration(message)) => {
                assert!(message.contains("store"), "unexpected message: {}", message)
            }
            Err(other) => panic!("expected fatal configuration error, got {}", other),
            Ok(_) => panic!("store opened with a mismatched chunk width"),
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        // Test: a zero batch size never reaches the store
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig {
            batch_size: 0,
            ..config(&dir)
        };
        let result = PipelineCoordinator::open(config, Arc::new(ManualClock::new(Utc::now())));
        assert!(matches!(result, Err(PipelineError::Config(_))));
        assert!(!dir.path().join("store").exists());
    }
}
