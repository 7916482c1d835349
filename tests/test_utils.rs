//! Shared setup for the integration tests.

#![allow(dead_code)]

use jobkeeper::{
    Clock, FnHandler, HandlerRegistry, InMemoryStatsCollector, JobProcessor, MemoryStore,
    MockClock, ProcessorConfig,
};
use serde_json::json;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

pub struct TestProcessor {
    pub processor: JobProcessor,
    pub clock: MockClock,
    pub stats: Arc<InMemoryStatsCollector>,
}

/// A processor on a mock clock with an empty registry plus the built-ins.
pub fn mock_processor(max_concurrent_jobs: usize) -> TestProcessor {
    let clock = MockClock::new();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let stats = Arc::new(InMemoryStatsCollector::new_default().with_clock(Arc::clone(&shared)));

    let config = ProcessorConfig {
        max_concurrent_jobs,
        poll_interval: Duration::from_millis(20),
        ..Default::default()
    };
    let processor = JobProcessor::builder()
        .config(config)
        .clock(Arc::clone(&shared))
        .store(Arc::new(MemoryStore::with_clock(shared)))
        .registry(Arc::new(HandlerRegistry::with_builtin_handlers()))
        .stats_collector(stats.clone())
        .build()
        .expect("valid test configuration");

    TestProcessor {
        processor,
        clock,
        stats,
    }
}

/// Registers a handler for `job_type` that always fails and returns its call
/// counter.
pub fn register_failing(processor: &JobProcessor, job_type: &str) -> Arc<AtomicU32> {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    processor.register_handler(
        job_type,
        FnHandler::new(move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(jobkeeper::JobkeeperError::handler("downstream unavailable"))
            }
        }),
    );
    calls
}

/// Registers a handler that echoes its payload.
pub fn register_echo(processor: &JobProcessor, job_type: &str) {
    processor.register_handler(
        job_type,
        FnHandler::new(|data, _| async move { Ok(json!({ "echo": data })) }),
    );
}
