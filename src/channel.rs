//! Command transactions with reconnect-and-retry.
//!
//! A [`CommandChannel`] owns one [`Transport`] and turns it into a sequence of atomic
//! `write command → read response` transactions. Atomicity follows from ownership:
//! `transact` takes `&mut self`, so nothing else can touch the link between the write
//! and the read. Serializing *callers* is the job of the
//! [`DeviceLock`](crate::lock::DeviceLock) that guards the channel.
//!
//! Link failures (`LinkTimeout`, `LinkBroken`, or `LinkUnavailable` while reopening)
//! put the link in `faulted`; the next attempt reopens it, discards stale input and
//! resends. Idempotent transactions get the whole [`RetryPolicy`] budget; a
//! non-idempotent one is attempted once and the raw link error is returned.

use crate::error::{AppResult, ControllerError};
use crate::transport::{LinkState, ResponseSpec, Transport};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Bounded retry with exponential backoff.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per transaction, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
    /// Factor applied to the delay after each retry.
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(self.backoff.as_secs_f64() * factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// One outbound command and the shape of its answer.
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Bytes written to the link, terminator included
    pub payload: Bytes,
    /// How the response is framed
    pub expect: ResponseSpec,
    /// Whether resending after an ambiguous failure is safe.
    pub idempotent: bool,
    /// Overrides the channel's default read timeout.
    pub timeout: Option<Duration>,
    /// Response must match, otherwise the transaction fails with `Protocol`.
    pub validate: Option<regex::bytes::Regex>,
}

impl Transaction {
    /// Idempotent transaction expecting `expect`.
    pub fn new(payload: impl Into<Bytes>, expect: ResponseSpec) -> Self {
        Self {
            payload: payload.into(),
            expect,
            idempotent: true,
            timeout: None,
            validate: None,
        }
    }

    /// Command with no response.
    pub fn write_only(payload: impl Into<Bytes>) -> Self {
        Self::new(payload, ResponseSpec::None)
    }

    /// Attempt once; a link failure is returned instead of retried.
    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    /// Read timeout for this transaction only.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Require the response to match `pattern`.
    pub fn expecting(mut self, pattern: &str) -> AppResult<Self> {
        let re = regex::bytes::Regex::new(pattern)
            .map_err(|e| ControllerError::InvalidArgument(format!("invalid pattern: {}", e)))?;
        self.validate = Some(re);
        Ok(self)
    }
}

/// Result of a completed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response frame, terminator stripped
    pub data: Bytes,
    /// Attempts made, the successful one included.
    pub attempts: u32,
}

impl Response {
    /// The response as trimmed UTF-8 text.
    pub fn text(&self) -> AppResult<String> {
        std::str::from_utf8(&self.data)
            .map(|s| s.trim().to_string())
            .map_err(|_| {
                ControllerError::Protocol(format!("response is not valid UTF-8: {:?}", self.data))
            })
    }

    /// Attempts made, the successful one included.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Attempts beyond the first.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Counters kept by a channel since it was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    /// Transactions started
    pub transactions: u64,
    /// Attempts that were retries
    pub retries: u64,
    /// Times the link was re-established after a fault
    pub reconnects: u64,
    /// Transactions that ended in an error
    pub failures: u64,
}

/// Atomic command transactions over one transport.
pub struct CommandChannel {
    transport: Box<dyn Transport>,
    label: String,
    policy: RetryPolicy,
    write_terminator: Bytes,
    read_spec: ResponseSpec,
    default_timeout: Duration,
    stats: ChannelStats,
    generation: u64,
    recovering: bool,
}

impl CommandChannel {
    /// Wrap a transport with the default policy, `\n` terminator and line responses.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let label = transport.descriptor().label();
        let default_timeout = transport.descriptor().timeout;
        Self {
            transport,
            label,
            policy: RetryPolicy::default(),
            write_terminator: Bytes::from_static(b"\n"),
            read_spec: ResponseSpec::line(),
            default_timeout,
            stats: ChannelStats::default(),
            generation: 0,
            recovering: false,
        }
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bytes appended to every command built by [`command`](Self::command).
    pub fn with_write_terminator(mut self, terminator: impl AsRef<[u8]>) -> Self {
        self.write_terminator = Bytes::copy_from_slice(terminator.as_ref());
        self
    }

    /// Framing used by [`query`](Self::query) and [`command`](Self::command).
    pub fn with_read_spec(mut self, spec: ResponseSpec) -> Self {
        self.read_spec = spec;
        self
    }

    /// Link label used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Retry policy in effect.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current state of the underlying link.
    pub fn link_state(&self) -> LinkState {
        self.transport.link_state()
    }

    /// Receiver notified on every link state change.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.transport.link().subscribe()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    /// Count of successful reopens that followed a fault.
    ///
    /// Any change means device-side state may have been lost.
    pub fn reconnect_generation(&self) -> u64 {
        self.generation
    }

    /// Open the link once, without retrying.
    ///
    /// # Errors
    /// `LinkUnavailable` when the device cannot be reached.
    pub async fn open(&mut self) -> AppResult<()> {
        self.transport.open().await?;
        self.transport.discard_input().await
    }

    /// Release the link. Idempotent.
    pub async fn close(&mut self) -> AppResult<()> {
        self.recovering = false;
        self.transport.close().await
    }

    /// Drop any unread input on the link.
    pub async fn purge(&mut self) -> AppResult<()> {
        self.transport.discard_input().await
    }

    /// Idempotent transaction for `cmd` with the channel's terminator and read framing.
    pub fn command(&self, cmd: &str) -> Transaction {
        let mut payload = Vec::with_capacity(cmd.len() + self.write_terminator.len());
        payload.extend_from_slice(cmd.as_bytes());
        payload.extend_from_slice(&self.write_terminator);
        Transaction::new(payload, self.read_spec.clone())
    }

    /// Idempotent command with no response.
    pub async fn send(&mut self, cmd: &str) -> AppResult<Response> {
        let tx = self.command(cmd);
        self.transact(&Transaction {
            expect: ResponseSpec::None,
            ..tx
        })
        .await
    }

    /// Command with no response that must never be repeated.
    pub async fn send_once(&mut self, cmd: &str) -> AppResult<Response> {
        let tx = self.command(cmd);
        self.transact(
            &Transaction {
                expect: ResponseSpec::None,
                ..tx
            }
            .non_idempotent(),
        )
        .await
    }

    /// Query returning the trimmed response text.
    pub async fn query(&mut self, cmd: &str) -> AppResult<String> {
        let tx = self.command(cmd);
        self.transact(&tx).await?.text()
    }

    /// Query whose response must match `pattern`.
    pub async fn query_matching(&mut self, cmd: &str, pattern: &str) -> AppResult<String> {
        let tx = self.command(cmd).expecting(pattern)?;
        self.transact(&tx).await?.text()
    }

    /// Run one transaction, reconnecting and resending as the policy allows.
    ///
    /// # Errors
    /// - `DeviceUnresponsive` once the retry budget of an idempotent transaction is spent
    /// - the raw link error for a non-idempotent transaction
    /// - `Protocol` for a malformed response (never retried)
    pub async fn transact(&mut self, tx: &Transaction) -> AppResult<Response> {
        self.stats.transactions += 1;
        let budget = if tx.idempotent {
            self.policy.max_attempts.max(1)
        } else {
            1
        };
        let timeout = tx.timeout.unwrap_or(self.default_timeout);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match self.attempt(tx, timeout).await {
                Ok(data) => {
                    if attempt > 1 {
                        info!(device = %self.label, attempts = attempt, "Transaction recovered");
                    }
                    return Ok(Response {
                        data,
                        attempts: attempt,
                    });
                }
                Err(err) => err,
            };

            if !is_link_failure(&err) {
                if matches!(err, ControllerError::Protocol(_)) {
                    // leave no half-read frame behind for the next transaction
                    if let Err(e) = self.transport.discard_input().await {
                        debug!(device = %self.label, error = %e, "Discard after protocol error failed");
                    }
                }
                self.stats.failures += 1;
                return Err(err);
            }

            self.transport.mark_faulted();
            self.recovering = true;

            if !tx.idempotent {
                warn!(
                    device = %self.label,
                    command = %printable(&tx.payload),
                    error = %err,
                    "Non-idempotent command failed; not retrying"
                );
                self.stats.failures += 1;
                return Err(err);
            }

            if attempt >= budget {
                warn!(
                    device = %self.label,
                    attempts = attempt,
                    error = %err,
                    "Retry budget exhausted"
                );
                self.stats.failures += 1;
                return Err(ControllerError::DeviceUnresponsive {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                device = %self.label,
                attempt,
                max_attempts = budget,
                error = %err,
                "Link failure, retrying in {:?}",
                delay
            );
            self.stats.retries += 1;
            sleep(delay).await;
        }
    }

    async fn attempt(&mut self, tx: &Transaction, timeout: Duration) -> AppResult<Bytes> {
        self.ensure_connected().await?;

        debug!(device = %self.label, command = %printable(&tx.payload), "write");
        self.transport.write(&tx.payload).await?;
        if !tx.expect.expects_response() {
            return Ok(Bytes::new());
        }

        let frame = self.transport.read_frame(&tx.expect, timeout).await?;
        debug!(device = %self.label, response = %printable(&frame), "read");

        if let Some(re) = &tx.validate {
            if !re.is_match(&frame) {
                return Err(ControllerError::Protocol(format!(
                    "response '{}' to '{}' does not match '{}'",
                    printable(&frame),
                    printable(&tx.payload),
                    re.as_str()
                )));
            }
        }
        Ok(frame)
    }

    async fn ensure_connected(&mut self) -> AppResult<()> {
        let state = self.transport.link_state();
        if state == LinkState::Connected {
            return Ok(());
        }

        let after_fault = self.recovering || state == LinkState::Faulted;
        self.transport.open().await?;
        self.transport.discard_input().await?;

        if after_fault {
            self.recovering = false;
            self.generation += 1;
            self.stats.reconnects += 1;
            info!(
                device = %self.label,
                generation = self.generation,
                "Link re-established"
            );
        }
        Ok(())
    }
}

fn is_link_failure(err: &ControllerError) -> bool {
    err.is_link_transient() || matches!(err, ControllerError::LinkUnavailable { .. })
}

fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().escape_debug().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CannedResponder, SimFault, SimulatedTransport, SimulationControl};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(1),
            backoff_multiplier: 1.0,
            max_backoff: Duration::from_millis(1),
        }
    }

    fn channel(policy: RetryPolicy) -> (CommandChannel, SimulationControl) {
        let sim = SimulatedTransport::new(
            "chan",
            CannedResponder::new()
                .with("*IDN?", "OK")
                .with("V1?", "V1 12.000"),
        );
        let control = sim.control();
        (
            CommandChannel::new(Box::new(sim)).with_retry_policy(policy),
            control,
        )
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_secs(2));
    }

    #[test]
    fn test_extreme_backoff_saturates_at_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff: Duration::from_millis(100),
            backoff_multiplier: 1e10,
            max_backoff: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_for(4), Duration::from_secs(2));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(2));

        let huge = RetryPolicy {
            backoff: Duration::MAX,
            max_backoff: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        assert_eq!(huge.delay_for(3), Duration::from_secs(5));

        let infinite = RetryPolicy {
            backoff_multiplier: f64::INFINITY,
            ..RetryPolicy::default()
        };
        assert_eq!(infinite.delay_for(2), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_query_opens_lazily() {
        let (mut chan, control) = channel(fast_policy(3));
        assert_eq!(chan.link_state(), LinkState::Disconnected);
        assert_eq!(chan.query("*IDN?").await.unwrap(), "OK");
        assert_eq!(chan.link_state(), LinkState::Connected);
        assert_eq!(control.open_count(), 1);
        // a first open is not a reconnect
        assert_eq!(chan.reconnect_generation(), 0);
    }

    #[tokio::test]
    async fn test_broken_read_is_retried_after_reconnect() {
        let (mut chan, control) = channel(fast_policy(3));
        chan.open().await.unwrap();
        control.fail_next_read(SimFault::Broken);

        let tx = chan.command("V1?");
        let response = chan.transact(&tx).await.unwrap();
        assert_eq!(response.text().unwrap(), "V1 12.000");
        assert_eq!(response.retries(), 1);
        assert_eq!(chan.reconnect_generation(), 1);
        assert_eq!(chan.stats().reconnects, 1);
        assert_eq!(control.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_budget_exhausted_is_device_unresponsive() {
        let (mut chan, control) = channel(fast_policy(2));
        chan.open().await.unwrap();
        control.set_available(false);

        let err = chan.query("*IDN?").await.unwrap_err();
        match err {
            ControllerError::DeviceUnresponsive { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected DeviceUnresponsive, got {:?}", other),
        }
        assert_eq!(chan.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_non_idempotent_attempted_once() {
        let (mut chan, control) = channel(fast_policy(5));
        chan.open().await.unwrap();
        control.fail_next_write(SimFault::Broken);

        let err = chan.send_once("INCV1").await.unwrap_err();
        assert!(matches!(err, ControllerError::LinkBroken(_)));
        assert!(control.writes().is_empty());
        assert_eq!(chan.link_state(), LinkState::Faulted);

        // next transaction reconnects lazily
        assert_eq!(chan.query("*IDN?").await.unwrap(), "OK");
        assert_eq!(chan.reconnect_generation(), 1);
    }

    #[tokio::test]
    async fn test_validation_mismatch_is_protocol_and_not_retried() {
        let (mut chan, control) = channel(fast_policy(3));
        let err = chan
            .query_matching("V1?", r"^V2 [0-9.]+$")
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Protocol(_)));
        assert_eq!(control.writes().len(), 1);
        assert_eq!(chan.stats().retries, 0);
    }
}
