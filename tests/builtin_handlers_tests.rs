use jobkeeper::{
    JobFilter, JobOptions, JobPayload, JobProcessor, JobStatus, JobkeeperConfig, Priority,
    handlers::{DATA_PROCESSING, EMAIL_NOTIFICATION, REPORT_GENERATION},
};
use serde_json::json;
use std::time::Duration;

async fn run_until_idle(processor: &JobProcessor) {
    while processor.tick().await.unwrap() > 0 {
        processor.wait_for_idle().await;
    }
}

#[tokio::test]
async fn test_builtin_jobs_complete_through_connect() {
    let mut config = JobkeeperConfig::development();
    config.metrics.enabled = true;
    let processor = JobProcessor::connect(&config).await.unwrap();

    let email = processor
        .create_job(
            JobPayload::new(
                EMAIL_NOTIFICATION,
                json!({"to": ["ops@example.com", "oncall@example.com"], "subject": "Deploy", "body": "v2 is live"}),
            ),
            JobOptions::new().with_priority(Priority::HIGH).with_tag("deploy"),
        )
        .await
        .unwrap();
    let report = processor
        .create_job(
            JobPayload::new(REPORT_GENERATION, json!({"report_type": "usage", "format": "csv"})),
            JobOptions::new(),
        )
        .await
        .unwrap();
    let sum = processor
        .create_job(
            JobPayload::new(
                DATA_PROCESSING,
                json!({"operation": "sum", "records": [1, 2, 3.5]}),
            ),
            JobOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        processor.estimated_duration(&email),
        Some(Duration::from_secs(4))
    );

    run_until_idle(&processor).await;

    let email = processor.get_job(email.id).await.unwrap().unwrap();
    assert_eq!(email.status, JobStatus::Completed);
    assert_eq!(email.progress, 100);
    let result = email.result.unwrap();
    assert!(result["message_id"].is_string());
    assert_eq!(result["subject"], "Deploy");

    let report = processor.get_job(report.id).await.unwrap().unwrap();
    assert_eq!(report.status, JobStatus::Completed);
    assert!(report.result.unwrap()["report_id"].is_string());

    let sum = processor.get_job(sum.id).await.unwrap().unwrap();
    assert_eq!(sum.result.unwrap()["value"], json!(6.5));

    let completed = processor
        .get_jobs(&JobFilter::new().with_status(JobStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 3);

    #[cfg(feature = "metrics")]
    {
        processor.get_job_stats().await.unwrap();
        let rendered = processor.metrics().unwrap().render().unwrap();
        assert!(rendered.contains("jobkeeper_jobs_total"));
        assert!(rendered.contains("jobkeeper_jobs{status=\"completed\"} 3"));
    }
}

#[tokio::test]
async fn test_invalid_data_processing_request_fails() {
    let processor = JobProcessor::builder().build().unwrap();

    // unknown operations are rejected at creation
    assert!(
        processor
            .create_job(
                JobPayload::new(DATA_PROCESSING, json!({"operation": "median", "records": [1]})),
                JobOptions::new(),
            )
            .await
            .is_err()
    );

    let status = processor.processor_status();
    assert!(!status.is_running);
    assert_eq!(
        status.registered_types,
        vec![DATA_PROCESSING, EMAIL_NOTIFICATION, REPORT_GENERATION]
    );
}
