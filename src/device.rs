//! Lock-guarded device sessions.
//!
//! A [`Device`] couples a [`DeviceLock`] with the [`Session`] it guards: the command
//! channel of one instrument plus the driver's cached state. Every driver operation
//! runs through [`Device::run`], which acquires the lock, performs the operation's
//! transactions and releases the lock. The operation runs on its own task, so a caller
//! that goes away mid-call (RPC connection dropped, request future cancelled) cannot
//! abort an exchange halfway and leave the instrument out of sync.
//!
//! Cached state is dropped whenever the channel reports a reconnect after a fault,
//! since the instrument may have been power-cycled in between.

use crate::channel::{ChannelStats, CommandChannel, Response, Transaction};
use crate::error::{AppResult, ControllerError};
use crate::lock::DeviceLock;
use crate::transport::LinkState;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Driver state that must be forgotten when the link is re-established.
pub trait CachedState: Send + 'static {
    /// Drop everything learned from the instrument.
    fn invalidate(&mut self) {}
}

impl CachedState for () {}

/// Channel plus cached driver state, only reachable while the device lock is held.
pub struct Session<S> {
    channel: CommandChannel,
    /// Driver-owned cache
    pub state: S,
    synced_generation: u64,
}

impl<S: CachedState> Session<S> {
    fn new(channel: CommandChannel, state: S) -> Self {
        let synced_generation = channel.reconnect_generation();
        Self {
            channel,
            state,
            synced_generation,
        }
    }

    /// Read-only view of the channel.
    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    /// Counters of the underlying channel.
    pub fn stats(&self) -> ChannelStats {
        self.channel.stats()
    }

    /// Run one transaction through the retrying channel.
    pub async fn transact(&mut self, tx: &Transaction) -> AppResult<Response> {
        let result = self.channel.transact(tx).await;
        self.resync();
        result
    }

    /// Send `cmd` and return the trimmed reply.
    pub async fn query(&mut self, cmd: &str) -> AppResult<String> {
        let result = self.channel.query(cmd).await;
        self.resync();
        result
    }

    /// Like [`query`](Self::query), failing with `Protocol` unless the reply matches `pattern`.
    pub async fn query_matching(&mut self, cmd: &str, pattern: &str) -> AppResult<String> {
        let result = self.channel.query_matching(cmd, pattern).await;
        self.resync();
        result
    }

    /// Send `cmd` without reading a reply.
    pub async fn send(&mut self, cmd: &str) -> AppResult<()> {
        let result = self.channel.send(cmd).await;
        self.resync();
        result.map(|_| ())
    }

    /// Send a command that must not be repeated after an ambiguous failure.
    pub async fn send_once(&mut self, cmd: &str) -> AppResult<()> {
        let result = self.channel.send_once(cmd).await;
        self.resync();
        result.map(|_| ())
    }

    /// Idempotent transaction for `cmd` using the channel's framing.
    pub fn command(&self, cmd: &str) -> Transaction {
        self.channel.command(cmd)
    }

    /// Drop any unread input on the link.
    pub async fn purge(&mut self) -> AppResult<()> {
        self.channel.purge().await
    }

    async fn open(&mut self) -> AppResult<()> {
        self.channel.open().await
    }

    async fn close(&mut self) -> AppResult<()> {
        self.channel.close().await
    }

    /// Invalidate cached state if the link came back since the last check.
    fn resync(&mut self) {
        let generation = self.channel.reconnect_generation();
        if generation != self.synced_generation {
            debug!(
                link = %self.channel.label(),
                from = self.synced_generation,
                to = generation,
                "Link re-established, dropping cached state"
            );
            self.state.invalidate();
            self.synced_generation = generation;
        }
    }
}

/// One physical device shared by concurrent callers.
pub struct Device<S> {
    name: Arc<str>,
    lock: DeviceLock<Session<S>>,
    lock_timeout: Duration,
    link_rx: watch::Receiver<LinkState>,
    next_call: Arc<AtomicU64>,
}

impl<S> Clone for Device<S> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            lock: self.lock.clone(),
            lock_timeout: self.lock_timeout,
            link_rx: self.link_rx.clone(),
            next_call: Arc::clone(&self.next_call),
        }
    }
}

impl<S: CachedState> Device<S> {
    /// Wrap `channel` and `state` behind a new device lock.
    pub fn new(
        name: impl Into<String>,
        channel: CommandChannel,
        state: S,
        lock_timeout: Duration,
    ) -> Self {
        let name: String = name.into();
        let link_rx = channel.subscribe();
        Self {
            lock: DeviceLock::new(name.clone(), Session::new(channel, state)),
            name: Arc::from(name),
            lock_timeout,
            link_rx,
            next_call: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Device name used in logs and lock diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The lock guarding this device's session.
    pub fn lock(&self) -> &DeviceLock<Session<S>> {
        &self.lock
    }

    /// Current link state, readable without the lock.
    pub fn link_state(&self) -> LinkState {
        *self.link_rx.borrow()
    }

    /// Watch link state changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.link_rx.clone()
    }

    /// Open the link once. Fails with `LinkUnavailable` if the device can't be reached.
    pub async fn connect(&self) -> AppResult<()> {
        self.run("connect", |session| Box::pin(session.open())).await?;
        info!(device = %self.name, "Device connected");
        Ok(())
    }

    /// Run `op` with exclusive access to the session.
    ///
    /// The lock is held from before the first transaction until after the last, and is
    /// released on every exit path. The operation completes even if the returned
    /// future is dropped.
    ///
    /// # Errors
    /// `LockTimeout` if the device stayed busy for the whole lock timeout, otherwise
    /// whatever `op` returns.
    pub async fn run<T, F>(&self, operation: &str, op: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Session<S>) -> BoxFuture<'a, AppResult<T>> + Send + 'static,
    {
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        let holder = format!("{}#{}", operation, call);
        let lock = self.lock.clone();
        let timeout = self.lock_timeout;

        let task = tokio::spawn(async move {
            let mut guard = lock.acquire(holder, timeout).await?;
            let session: &mut Session<S> = &mut guard;
            session.resync();
            op(session).await
        });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(device = %self.name, operation, error = %e, "Device operation aborted");
                Err(ControllerError::Internal(format!(
                    "operation '{}' on '{}' aborted: {}",
                    operation, self.name, e
                )))
            }
        }
    }

    /// Close the link once the device is idle, waiting at most `timeout`.
    pub async fn close(&self, timeout: Duration) -> AppResult<()> {
        let mut guard = self.lock.acquire("close", timeout).await?;
        guard.close().await?;
        info!(device = %self.name, "Device link closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RetryPolicy;
    use crate::transport::{CannedResponder, SimFault, SimulatedTransport, SimulationControl};
    use futures::FutureExt;

    #[derive(Default)]
    struct Cache {
        idn: Option<String>,
        invalidations: u32,
    }

    impl CachedState for Cache {
        fn invalidate(&mut self) {
            self.idn = None;
            self.invalidations += 1;
        }
    }

    fn device() -> (Device<Cache>, SimulationControl) {
        let sim = SimulatedTransport::new("dev", CannedResponder::new().with("*IDN?", "OK"));
        let control = sim.control();
        let channel = CommandChannel::new(Box::new(sim)).with_retry_policy(RetryPolicy {
            backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        });
        (
            Device::new("dev", channel, Cache::default(), Duration::from_secs(1)),
            control,
        )
    }

    #[tokio::test]
    async fn test_run_returns_operation_result() {
        let (device, _) = device();
        device.connect().await.unwrap();
        assert_eq!(device.link_state(), LinkState::Connected);

        let idn = device
            .run("identity", |s| async move { s.query("*IDN?").await }.boxed())
            .await
            .unwrap();
        assert_eq!(idn, "OK");
        assert!(device.lock().is_available());
    }

    #[tokio::test]
    async fn test_reconnect_invalidates_cache() {
        let (device, control) = device();
        device.connect().await.unwrap();
        device
            .run("cache", |s| {
                async move {
                    s.state.idn = Some(s.query("*IDN?").await?);
                    Ok(())
                }
                .boxed()
            })
            .await
            .unwrap();

        control.fail_next_read(SimFault::Broken);
        let (idn, invalidations) = device
            .run("reread", |s| {
                async move {
                    let idn = s.query("*IDN?").await?;
                    Ok((s.state.idn.clone().unwrap_or(idn), s.state.invalidations))
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(idn, "OK");
        assert_eq!(invalidations, 1);
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_abort_operation() {
        let (device, control) = device();
        device.connect().await.unwrap();
        control.set_latency(Duration::from_millis(100));

        let call = device.run("slow", |s| async move { s.query("*IDN?").await }.boxed());
        // caller gives up before the response arrives
        let _ = tokio::time::timeout(Duration::from_millis(10), call).await;

        // the exchange still completes and the lock comes back
        let guard = device
            .lock()
            .acquire("after", Duration::from_secs(1))
            .await
            .unwrap();
        drop(guard);
        assert!(control
            .events()
            .iter()
            .any(|e| matches!(e, crate::transport::SimEvent::Read(_))));
    }
}
