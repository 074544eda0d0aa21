use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use crate::error::RelayResult;
use crate::receiver::{Receiver, ReceiverResponse, delivery_payload};
use crate::test_utils::notify::TimedNotify;
use crate::types::TrackedChange;

#[derive(Debug, Default)]
struct Inner {
    payloads: Vec<Value>,
    sends: usize,
    scripted_failures: VecDeque<String>,
    always_fail: Option<String>,
    delay: Option<Duration>,
}

/// A [`Receiver`] that records every payload it is asked to send.
///
/// Failures can be scripted per send or made permanent. Clones share the same recordings.
#[derive(Debug, Clone, Default)]
pub struct RecordingReceiver {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl RecordingReceiver {
    pub const NAME: &'static str = "Recording";

    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next send fail with `error`. Calls queue up.
    pub async fn fail_next(&self, error: impl Into<String>) {
        self.inner
            .lock()
            .await
            .scripted_failures
            .push_back(error.into());
    }

    /// Makes every send fail with `error`.
    pub async fn fail_always(&self, error: impl Into<String>) {
        self.inner.lock().await.always_fail = Some(error.into());
    }

    /// Makes every send sleep for `delay` before answering.
    pub async fn delay_sends(&self, delay: Duration) {
        self.inner.lock().await.delay = Some(delay);
    }

    /// Number of send calls, successful or not.
    pub async fn sends(&self) -> usize {
        self.inner.lock().await.sends
    }

    /// Payloads of every send call, in call order.
    pub async fn payloads(&self) -> Vec<Value> {
        self.inner.lock().await.payloads.clone()
    }

    /// Waits until at least `count` sends were made.
    pub async fn wait_for_sends(&self, count: usize) {
        let notify = TimedNotify::new(self.notify.clone());
        while self.sends().await < count {
            notify.notified().await;
        }
    }
}

#[async_trait]
impl Receiver for RecordingReceiver {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate_parameters(&self, _parameters: &Value) -> RelayResult<()> {
        Ok(())
    }

    async fn send(
        &self,
        change: &TrackedChange,
        _parameters: &Value,
    ) -> RelayResult<ReceiverResponse> {
        let delay = self.inner.lock().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let payload = delivery_payload(change)?;

        let response = {
            let mut inner = self.inner.lock().await;
            inner.sends += 1;
            inner.payloads.push(payload);

            match inner.scripted_failures.pop_front() {
                Some(error) => ReceiverResponse::failure(error),
                None => match &inner.always_fail {
                    Some(error) => ReceiverResponse::failure(error.clone()),
                    None => ReceiverResponse::success(),
                },
            }
        };

        // A stored permit covers sends that happen before anyone waits.
        self.notify.notify_one();

        Ok(response)
    }
}
