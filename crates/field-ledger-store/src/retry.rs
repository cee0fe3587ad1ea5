use std::time::Duration;

use field_ledger_core::LedgerError;

/// Backoff parameters for one call-site category.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// External tracker command invocations.
    #[must_use]
    pub fn external_command() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }

    /// Probing evidence URIs for reachability.
    #[must_use]
    pub fn evidence_probe() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(1),
        }
    }

    /// Version-control operations.
    #[must_use]
    pub fn version_control() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1).try_into().unwrap_or(i32::MAX));
        let delay = self.base_delay.as_secs_f64() * factor;
        self.max_delay.min(Duration::from_secs_f64(delay))
    }
}

/// Whether an error is worth retrying.
///
/// Only storage faults qualify, and only when the message carries a known
/// transient signature: dropped connections, timeouts, DNS hiccups,
/// throttling status codes, or lock contention. Validation, conflict, and
/// boundary errors are never transient.
#[must_use]
pub fn is_transient(error: &LedgerError) -> bool {
    let LedgerError::Storage(message) = error else {
        return false;
    };
    let message = message.to_ascii_lowercase();
    const SIGNATURES: &[&str] = &[
        "connection reset",
        "timed out",
        "timeout",
        "dns",
        "429",
        "503",
        "504",
        "temporar",
        "busy",
        "lock",
        "try again",
        "eagain",
    ];
    SIGNATURES.iter().any(|sig| message.contains(sig))
}

/// Run `operation` with exponential backoff on transient failures.
///
/// Non-transient errors propagate immediately. Once `max_attempts` is
/// exhausted the final error is wrapped into [`LedgerError::Storage`]
/// naming the operation and attempt count.
///
/// # Errors
/// Propagates the operation's own error, or the exhaustion wrapper.
pub fn with_retry<T>(
    operation: &str,
    policy: &RetryPolicy,
    mut f: impl FnMut() -> Result<T, LedgerError>,
) -> Result<T, LedgerError> {
    let mut last = None;
    for attempt in 1..=policy.max_attempts.max(1) {
        match f() {
            Ok(value) => return Ok(value),
            Err(error) if !is_transient(&error) => return Err(error),
            Err(error) => {
                tracing::debug!(operation, attempt, %error, "transient failure, backing off");
                last = Some(error);
                if attempt < policy.max_attempts {
                    std::thread::sleep(policy.delay_for(attempt));
                }
            }
        }
    }
    let detail = last.map_or_else(String::new, |e| format!(": {e}"));
    Err(LedgerError::Storage(format!(
        "{operation} failed after {} attempts{detail}",
        policy.max_attempts.max(1)
    )))
}
