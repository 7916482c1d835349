//! Built-in handlers.
//!
//! These cover the common job types a service enqueues out of the box. Each
//! one validates its required payload fields and returns a structured JSON
//! result. Real delivery and rendering are left to the caller, who replaces
//! a built-in by registering another handler under the same type.

use crate::{
    JobkeeperError, Result,
    handler::{HandlerRegistry, JobContext, JobHandler},
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub const EMAIL_NOTIFICATION: &str = "email_notification";
pub const REPORT_GENERATION: &str = "report_generation";
pub const DATA_PROCESSING: &str = "data_processing";

/// Registers every built-in handler under its job type.
pub fn register_builtin(registry: &HandlerRegistry) {
    registry.register(EMAIL_NOTIFICATION, EmailNotificationHandler);
    registry.register(REPORT_GENERATION, ReportGenerationHandler);
    registry.register(DATA_PROCESSING, DataProcessingHandler);
}

fn non_empty_str<'a>(data: &'a Value, field: &str) -> Option<&'a str> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
}

fn invalid(job_type: &str, message: impl Into<String>) -> JobkeeperError {
    JobkeeperError::InvalidPayload {
        job_type: job_type.to_string(),
        message: message.into(),
    }
}

/// `email_notification`: `{to, subject, body}`, all non-empty strings.
/// `to` may also be an array of addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailNotificationHandler;

impl EmailNotificationHandler {
    fn recipients(data: &Value) -> Option<Vec<String>> {
        match data.get("to")? {
            Value::String(to) if !to.trim().is_empty() => Some(vec![to.clone()]),
            Value::Array(list) if !list.is_empty() => list
                .iter()
                .map(|to| {
                    to.as_str()
                        .filter(|to| !to.trim().is_empty())
                        .map(str::to_string)
                })
                .collect(),
            _ => None,
        }
    }
}

#[async_trait]
impl JobHandler for EmailNotificationHandler {
    async fn execute(&self, data: &Value, ctx: &JobContext) -> Result<Value> {
        let recipients = Self::recipients(data)
            .ok_or_else(|| invalid(EMAIL_NOTIFICATION, "field 'to' is required"))?;
        let subject = non_empty_str(data, "subject")
            .ok_or_else(|| invalid(EMAIL_NOTIFICATION, "field 'subject' is required"))?;
        if non_empty_str(data, "body").is_none() {
            return Err(invalid(EMAIL_NOTIFICATION, "field 'body' is required"));
        }

        debug!(
            "Dispatching notification '{}' to {} recipient(s) for job {}",
            subject,
            recipients.len(),
            ctx.id()
        );

        Ok(json!({
            "message_id": Uuid::new_v4().to_string(),
            "recipients": recipients,
            "subject": subject,
            "sent_at": ctx.now(),
        }))
    }

    fn validate(&self, data: &Value) -> bool {
        Self::recipients(data).is_some()
            && non_empty_str(data, "subject").is_some()
            && non_empty_str(data, "body").is_some()
    }

    fn estimate_duration(&self, data: &Value) -> Option<Duration> {
        let recipients = Self::recipients(data).map_or(1, |list| list.len());
        Some(Duration::from_secs(2 * recipients as u64))
    }
}

/// `report_generation`: `{report_type, format?, parameters?}`. `format` is one
/// of `json`, `csv` or `pdf` and defaults to `json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportGenerationHandler;

impl ReportGenerationHandler {
    const FORMATS: [&'static str; 3] = ["json", "csv", "pdf"];

    fn format(data: &Value) -> Option<&str> {
        match data.get("format") {
            None | Some(Value::Null) => Some("json"),
            Some(Value::String(format)) if Self::FORMATS.contains(&format.as_str()) => {
                Some(format.as_str())
            }
            _ => None,
        }
    }
}

#[async_trait]
impl JobHandler for ReportGenerationHandler {
    async fn execute(&self, data: &Value, ctx: &JobContext) -> Result<Value> {
        let report_type = non_empty_str(data, "report_type")
            .ok_or_else(|| invalid(REPORT_GENERATION, "field 'report_type' is required"))?;
        let format = Self::format(data)
            .ok_or_else(|| invalid(REPORT_GENERATION, "field 'format' must be json, csv or pdf"))?;
        let parameters = data.get("parameters").cloned().unwrap_or(Value::Null);

        ctx.report_progress(50).await?;

        let report_id = Uuid::new_v4();
        Ok(json!({
            "report_id": report_id.to_string(),
            "report_type": report_type,
            "format": format,
            "parameters": parameters,
            "location": format!("reports/{}.{}", report_id, format),
            "generated_at": ctx.now(),
        }))
    }

    fn validate(&self, data: &Value) -> bool {
        non_empty_str(data, "report_type").is_some()
            && Self::format(data).is_some()
            && data
                .get("parameters")
                .is_none_or(|parameters| parameters.is_object() || parameters.is_null())
    }

    fn estimate_duration(&self, data: &Value) -> Option<Duration> {
        match Self::format(data) {
            Some("pdf") => Some(Duration::from_secs(60)),
            _ => Some(Duration::from_secs(30)),
        }
    }
}

/// `data_processing`: `{operation, records, field?}`. Aggregates numeric
/// `records` (or `records[*][field]` when `field` is given) with one of `sum`,
/// `count`, `average`, `min`, `max`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataProcessingHandler;

impl DataProcessingHandler {
    const OPERATIONS: [&'static str; 5] = ["sum", "count", "average", "min", "max"];
    const CHUNK_SIZE: usize = 1_000;

    fn operation(data: &Value) -> Option<&str> {
        data.get("operation")
            .and_then(Value::as_str)
            .filter(|operation| Self::OPERATIONS.contains(operation))
    }

    fn values(data: &Value) -> Option<Vec<f64>> {
        let records = data.get("records")?.as_array()?;
        let field = data.get("field").and_then(Value::as_str);
        records
            .iter()
            .map(|record| match field {
                Some(field) => record.get(field).and_then(Value::as_f64),
                None => record.as_f64(),
            })
            .collect()
    }
}

#[async_trait]
impl JobHandler for DataProcessingHandler {
    async fn execute(&self, data: &Value, ctx: &JobContext) -> Result<Value> {
        let operation = Self::operation(data).ok_or_else(|| {
            invalid(
                DATA_PROCESSING,
                "field 'operation' must be one of sum, count, average, min, max",
            )
        })?;
        let values = Self::values(data)
            .ok_or_else(|| invalid(DATA_PROCESSING, "field 'records' must hold numeric values"))?;

        let chunks = values.len().div_ceil(Self::CHUNK_SIZE).max(1);
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for (index, chunk) in values.chunks(Self::CHUNK_SIZE).enumerate() {
            for &value in chunk {
                sum += value;
                min = min.min(value);
                max = max.max(value);
            }
            ctx.report_progress(((index + 1) * 100 / chunks) as i64)
                .await?;
            tokio::task::yield_now().await;
        }

        let count = values.len();
        let value = match operation {
            "sum" => json!(sum),
            "count" => json!(count),
            "average" if count > 0 => json!(sum / count as f64),
            "min" if count > 0 => json!(min),
            "max" if count > 0 => json!(max),
            _ => Value::Null,
        };

        Ok(json!({
            "operation": operation,
            "records_processed": count,
            "value": value,
        }))
    }

    fn validate(&self, data: &Value) -> bool {
        Self::operation(data).is_some() && Self::values(data).is_some()
    }

    fn estimate_duration(&self, data: &Value) -> Option<Duration> {
        let records = data
            .get("records")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        Some(Duration::from_secs(1 + records as u64 / 10_000))
    }
}
