//! Prometheus metrics for job execution.
//!
//! [`PrometheusMetricsCollector`] turns [`JobEvent`]s into counters and a
//! duration histogram, tracks the in-flight gauge, and renders everything in
//! the Prometheus text exposition format. Serving that text over HTTP is left
//! to the embedding application.

use crate::{
    JobkeeperError, Result,
    config::MetricsConfig,
    job::{ErrorCode, JobStatus},
    stats::{JobEvent, JobEventType, JobStats},
};
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    TextEncoder,
};

fn metrics_error(what: &str, err: prometheus::Error) -> JobkeeperError {
    JobkeeperError::Metrics {
        message: format!("Failed to create {} metric: {}", what, err),
    }
}

/// Prometheus metrics collector for job execution
pub struct PrometheusMetricsCollector {
    registry: Registry,
    jobs_total: CounterVec,
    jobs_failed_total: CounterVec,
    job_duration: HistogramVec,
    jobs_in_flight: IntGauge,
    jobs_by_status: GaugeVec,
}

impl PrometheusMetricsCollector {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let registry = Registry::new();
        let namespace = config.namespace.as_str();

        let jobs_total = CounterVec::new(
            Opts::new("jobs_total", "Job execution events by outcome").namespace(namespace),
            &["job_type", "outcome", "priority"],
        )
        .map_err(|e| metrics_error("jobs_total", e))?;

        let jobs_failed_total = CounterVec::new(
            Opts::new("jobs_failed_total", "Failed attempts by error code").namespace(namespace),
            &["job_type", "error_code"],
        )
        .map_err(|e| metrics_error("jobs_failed_total", e))?;

        let job_duration = HistogramVec::new(
            HistogramOpts::new("job_duration_seconds", "Handler execution time in seconds")
                .namespace(namespace)
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
            &["job_type", "priority"],
        )
        .map_err(|e| metrics_error("job_duration_seconds", e))?;

        let jobs_in_flight = IntGauge::with_opts(
            Opts::new("jobs_in_flight", "Jobs currently executing").namespace(namespace),
        )
        .map_err(|e| metrics_error("jobs_in_flight", e))?;

        let jobs_by_status = GaugeVec::new(
            Opts::new("jobs", "Stored jobs by status").namespace(namespace),
            &["status"],
        )
        .map_err(|e| metrics_error("jobs", e))?;

        registry
            .register(Box::new(jobs_total.clone()))
            .map_err(|e| metrics_error("jobs_total", e))?;
        registry
            .register(Box::new(jobs_failed_total.clone()))
            .map_err(|e| metrics_error("jobs_failed_total", e))?;
        registry
            .register(Box::new(job_duration.clone()))
            .map_err(|e| metrics_error("job_duration_seconds", e))?;
        registry
            .register(Box::new(jobs_in_flight.clone()))
            .map_err(|e| metrics_error("jobs_in_flight", e))?;
        registry
            .register(Box::new(jobs_by_status.clone()))
            .map_err(|e| metrics_error("jobs", e))?;

        Ok(Self {
            registry,
            jobs_total,
            jobs_failed_total,
            job_duration,
            jobs_in_flight,
            jobs_by_status,
        })
    }

    pub fn record_job_event(&self, event: &JobEvent) {
        let job_type = event.job_type.as_str();
        let priority = event.priority.to_string();
        let outcome = match event.event_type {
            JobEventType::Started => "started",
            JobEventType::Completed => "completed",
            JobEventType::Retried => "retried",
            JobEventType::Failed => "failed",
            JobEventType::TimedOut => "timed_out",
            JobEventType::Superseded => "superseded",
        };

        self.jobs_total
            .with_label_values(&[job_type, outcome, priority.as_str()])
            .inc();

        if matches!(
            event.event_type,
            JobEventType::Completed | JobEventType::Retried | JobEventType::Failed
        ) {
            if let Some(duration_ms) = event.processing_time_ms {
                self.job_duration
                    .with_label_values(&[job_type, priority.as_str()])
                    .observe(duration_ms as f64 / 1000.0);
            }
        }

        if matches!(
            event.event_type,
            JobEventType::Retried | JobEventType::Failed
        ) {
            let code = event.error_code.unwrap_or(ErrorCode::HandlerError).to_string();
            self.jobs_failed_total
                .with_label_values(&[job_type, code.as_str()])
                .inc();
        }
    }

    pub fn set_in_flight(&self, count: usize) {
        self.jobs_in_flight.set(count as i64);
    }

    pub fn update_job_counts(&self, stats: &JobStats) {
        for status in JobStatus::ALL {
            self.jobs_by_status
                .with_label_values(&[status.as_str()])
                .set(stats.count(status) as f64);
        }
    }

    /// All metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| JobkeeperError::Metrics {
                message: format!("Failed to encode metrics: {}", e),
            })?;

        String::from_utf8(buffer).map_err(|e| JobkeeperError::Metrics {
            message: format!("Metrics output is not UTF-8: {}", e),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for PrometheusMetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetricsCollector")
            .field("in_flight", &self.jobs_in_flight.get())
            .finish_non_exhaustive()
    }
}
