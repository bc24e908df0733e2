//! Per-target delivery outcomes.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::Error;
use crate::target::Target;

/// Delivery status of a single target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sending,
    Sent,
    Retrying,
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sending => write!(f, "sending"),
            Self::Sent => write!(f, "sent"),
            Self::Retrying => write!(f, "retrying"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome record for exactly one target within one send call.
///
/// The same record is updated in place across retry rounds.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryResult {
    pub message_id: String,
    pub target: Target,
    pub status: DeliveryStatus,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<Error>,
    /// Raw platform response, if the platform returned one.
    pub response: Option<serde_json::Value>,
    /// Retries performed for this target. A first-try delivery reports 0.
    pub attempts: u32,
    pub sent_at: Option<DateTime<Utc>>,
}

fn serialize_error<S: Serializer>(error: &Option<Error>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

impl DeliveryResult {
    pub fn pending(message_id: impl Into<String>, target: Target) -> Self {
        Self {
            message_id: message_id.into(),
            target,
            status: DeliveryStatus::Pending,
            error: None,
            response: None,
            attempts: 0,
            sent_at: None,
        }
    }

    pub fn sent(message_id: impl Into<String>, target: Target) -> Self {
        let mut result = Self::pending(message_id, target);
        result.status = DeliveryStatus::Sent;
        result.sent_at = Some(Utc::now());
        result
    }

    pub fn failed(message_id: impl Into<String>, target: Target, error: Error) -> Self {
        let mut result = Self::pending(message_id, target);
        result.status = DeliveryStatus::Failed;
        result.error = Some(error);
        result
    }

    pub fn with_response(mut self, response: serde_json::Value) -> Self {
        self.response = Some(response);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == DeliveryStatus::Sent
    }

    pub fn is_failed(&self) -> bool {
        self.status == DeliveryStatus::Failed
    }

    pub fn mark_sent(&mut self, response: Option<serde_json::Value>, sent_at: Option<DateTime<Utc>>) {
        self.status = DeliveryStatus::Sent;
        self.response = response;
        self.error = None;
        self.sent_at = Some(sent_at.unwrap_or_else(Utc::now));
    }

    pub fn mark_failed(&mut self, error: Error) {
        self.status = DeliveryStatus::Failed;
        self.error = Some(error);
    }

    /// Bump the retry counter and flag the record as being retried.
    pub fn mark_retrying(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
        self.status = DeliveryStatus::Retrying;
    }
}

/// Aggregate outcome of one send call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SendingResults {
    pub message_id: String,
    pub results: Vec<DeliveryResult>,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

impl SendingResults {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            ..Default::default()
        }
    }

    pub fn push(&mut self, result: DeliveryResult) {
        self.results.push(result);
        self.recount();
    }

    pub fn extend(&mut self, results: impl IntoIterator<Item = DeliveryResult>) {
        self.results.extend(results);
        self.recount();
    }

    /// Recompute the counters from the status of each result.
    pub fn recount(&mut self) {
        self.total = self.results.len();
        self.success = self.results.iter().filter(|r| r.is_success()).count();
        self.failed = self.total - self.success;
    }

    pub fn is_all_success(&self) -> bool {
        self.total > 0 && self.success == self.total
    }

    pub fn failures(&self) -> impl Iterator<Item = &DeliveryResult> {
        self.results.iter().filter(|r| !r.is_success())
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }
}
