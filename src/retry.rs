use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Attempt budget shared by the outer apply loop and get-or-create.
pub const MAX_RETRIES: u32 = 3;
/// Reads performed when verifying a mutation became observable.
pub const VERIFY_ATTEMPTS: u32 = 3;

/// Delays governing the apply/verify workflow. Gmail applies label mutations
/// asynchronously, so the defaults leave room for propagation; tests run with
/// `RetryPolicy::immediate()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub retry_delay_ms: u64,
    pub batch_delay_ms: u64,
    pub settle_delay_ms: u64,
    pub verify_delay_ms: u64,
    pub creation_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_delay_ms: 2000,
            batch_delay_ms: 1000,
            settle_delay_ms: 2000,
            verify_delay_ms: 1000,
            creation_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Every delay zeroed.
    pub fn immediate() -> Self {
        Self {
            retry_delay_ms: 0,
            batch_delay_ms: 0,
            settle_delay_ms: 0,
            verify_delay_ms: 0,
            creation_delay_ms: 0,
        }
    }

    /// Linear backoff: `(attempt + 1) × base`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms * (attempt as u64 + 1))
    }

    /// Extended pause after a throttling response.
    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms * 2)
    }

    /// Flat pause before re-entering the outer loop after a verification miss.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Pause between a mutation call and the first verification read.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Verification pauses grow with each read.
    pub fn verify_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.verify_delay_ms * (attempt as u64 + 1))
    }

    /// Pause after creating a label, before it is considered usable.
    pub fn creation_delay(&self) -> Duration {
        Duration::from_millis(self.creation_delay_ms)
    }
}

/// Typed failure of one labeling attempt. The outer loop branches on the
/// variant, keeping the retry policy a single match instead of string checks
/// spread through control flow.
#[derive(Debug, Error)]
pub enum LabelError {
    /// Missing scope or permission; retrying cannot help.
    #[error("authorization rejected: {0}")]
    Authorization(String),
    /// Provider throttling; retried after an extended pause.
    #[error("rate limited: {0}")]
    RateLimit(String),
    /// Target message does not exist or is not visible to this account.
    #[error("message not accessible: {0}")]
    NotFound(String),
    /// The mutation call succeeded but the label never became observable.
    #[error("label {0} not present after mutation")]
    Unverified(String),
    /// Get-or-create exhausted its own retry budget; not retried again.
    #[error("label could not be resolved: {0}")]
    Resolve(String),
    /// Anything else; retried with linear backoff.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl LabelError {
    /// Classify a gateway error by message content. The provider surfaces
    /// throttling and scope problems as plain HTTP errors, so the text is
    /// all there is to go on.
    pub fn from_gateway(err: anyhow::Error) -> Self {
        let text = format!("{err:#}");
        let lower = text.to_lowercase();
        if lower.contains("insufficient") || lower.contains("permission") {
            LabelError::Authorization(text)
        } else if lower.contains("rate") || lower.contains("quota") {
            LabelError::RateLimit(text)
        } else {
            LabelError::Transient(text)
        }
    }
}
