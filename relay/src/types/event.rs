use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, RelayError};
use crate::types::TrackedChange;

/// Error text recorded when a filter rejects a change.
pub const FILTERED_OUT: &str = "Filtered out";

/// A [`TrackedChange`] persisted in the buffer.
///
/// The id is independent of the row label because several tracking instances share label spaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedChangeEvent {
    pub id: Uuid,
    pub tracking_instance: String,
    pub change: TrackedChange,
    pub buffered_at: DateTime<Utc>,
}

impl BufferedChangeEvent {
    pub fn new(change: TrackedChange, buffered_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tracking_instance: change.tracking_instance.clone(),
            change,
            buffered_at,
        }
    }
}

/// Delivery state of one event for one receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "success" => Ok(DeliveryStatus::Success),
            "failed" => Ok(DeliveryStatus::Failed),
            other => bail!(
                ErrorKind::InvalidData,
                "Unknown delivery status",
                format!("'{other}' is not a valid delivery status")
            ),
        }
    }
}

/// Delivery ledger row for one (event, receiver) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverDeliveryStatus {
    pub event_id: Uuid,
    pub receiver: String,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_latency_ms: Option<u64>,
    pub avg_latency_ms: Option<f64>,
    /// Number of writes that measured a latency, used to keep the average running.
    pub latency_samples: u32,
    /// Set once the receiver's retry ceiling was hit; exhausted rows are never retried.
    pub exhausted: bool,
}

impl ReceiverDeliveryStatus {
    pub fn pending(event_id: Uuid, receiver: impl Into<String>) -> Self {
        Self {
            event_id,
            receiver: receiver.into(),
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            last_latency_ms: None,
            avg_latency_ms: None,
            latency_samples: 0,
            exhausted: false,
        }
    }

    /// Returns `true` when the row still has to be handed to its receiver.
    pub fn is_deliverable(&self) -> bool {
        match self.status {
            DeliveryStatus::Pending => true,
            DeliveryStatus::Failed => !self.exhausted,
            DeliveryStatus::Success => false,
        }
    }

    /// Applies an outcome to the row.
    ///
    /// Every write counts as an attempt. The average latency only considers writes that measured
    /// one.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) {
        self.status = if update.success {
            DeliveryStatus::Success
        } else {
            DeliveryStatus::Failed
        };
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_at = Some(now);
        self.last_error = update.error.clone();
        self.exhausted = update.exhausted;

        if let Some(latency_ms) = update.latency_ms {
            let samples = self.latency_samples as f64;
            let previous = self.avg_latency_ms.unwrap_or(0.0);
            self.avg_latency_ms = Some((previous * samples + latency_ms as f64) / (samples + 1.0));
            self.last_latency_ms = Some(latency_ms);
            self.latency_samples = self.latency_samples.saturating_add(1);
        }
    }
}

/// Outcome of one delivery step, written back through the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub success: bool,
    pub error: Option<String>,
    pub latency_ms: Option<u64>,
    pub exhausted: bool,
}

impl StatusUpdate {
    pub fn success(latency_ms: u64) -> Self {
        Self {
            success: true,
            error: None,
            latency_ms: Some(latency_ms),
            exhausted: false,
        }
    }

    pub fn filtered_out() -> Self {
        Self {
            success: true,
            error: Some(FILTERED_OUT.to_string()),
            latency_ms: None,
            exhausted: false,
        }
    }

    pub fn failed(error: impl Into<String>, latency_ms: Option<u64>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            latency_ms,
            exhausted: false,
        }
    }

    pub fn exhausted(retry_count: u32) -> Self {
        Self {
            success: false,
            error: Some(format!("exceeded retry limit of {retry_count} attempts")),
            latency_ms: None,
            exhausted: true,
        }
    }
}

/// An event waiting for delivery together with the receiver's attempts so far.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDelivery {
    pub event: BufferedChangeEvent,
    pub attempt_count: u32,
}

/// Declares that a receiver consumes the events of a tracking instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverSubscription {
    pub receiver: String,
    pub tracking_instance: String,
}

impl ReceiverSubscription {
    pub fn new(receiver: impl Into<String>, tracking_instance: impl Into<String>) -> Self {
        Self {
            receiver: receiver.into(),
            tracking_instance: tracking_instance.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_rows_stay_deliverable_until_exhausted() {
        let mut status = ReceiverDeliveryStatus::pending(Uuid::new_v4(), "hook");
        assert!(status.is_deliverable());

        status.apply(&StatusUpdate::failed("boom", Some(10)), Utc::now());
        assert_eq!(status.status, DeliveryStatus::Failed);
        assert!(status.is_deliverable());

        status.apply(&StatusUpdate::exhausted(2), Utc::now());
        assert!(!status.is_deliverable());
        assert_eq!(
            status.last_error.as_deref(),
            Some("exceeded retry limit of 2 attempts")
        );
    }

    #[test]
    fn average_latency_ignores_writes_without_latency() {
        let mut status = ReceiverDeliveryStatus::pending(Uuid::new_v4(), "hook");

        status.apply(&StatusUpdate::failed("boom", Some(10)), Utc::now());
        status.apply(&StatusUpdate::failed("transform failed", None), Utc::now());
        status.apply(&StatusUpdate::success(30), Utc::now());

        assert_eq!(status.attempt_count, 3);
        assert_eq!(status.latency_samples, 2);
        assert_eq!(status.last_latency_ms, Some(30));
        assert_eq!(status.avg_latency_ms, Some(20.0));
    }

    #[test]
    fn filtered_out_is_a_single_successful_write() {
        let mut status = ReceiverDeliveryStatus::pending(Uuid::new_v4(), "hook");
        status.apply(&StatusUpdate::filtered_out(), Utc::now());

        assert_eq!(status.status, DeliveryStatus::Success);
        assert_eq!(status.attempt_count, 1);
        assert_eq!(status.last_error.as_deref(), Some(FILTERED_OUT));
        assert!(!status.is_deliverable());
    }
}
