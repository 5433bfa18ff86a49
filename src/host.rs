//! Controller host: one driver published over RPC, plus its lifecycle.
//!
//! ```text
//! Initializing ──▶ Ready(Simulation | Live) ──▶ Serving ──▶ ShuttingDown ──▶ Stopped
//! ```
//!
//! Every call, built-ins included, passes the [`CallGate`]. Once shutdown begins the
//! gate is closed, so new calls fail fast with `ControllerShuttingDown` while calls
//! already admitted run to completion (or until the grace period ends). Only then is
//! the device link closed.

use crate::channel::CommandChannel;
use crate::config::ControllerConfig;
use crate::drivers::{DriverKind, DriverOptions};
use crate::error::{AppResult, ControllerError};
use crate::rpc::{
    ret, CallArgs, RpcHandler, RpcRequest, RpcResponse, RpcServer, RpcTarget, LIST_METHODS,
    PING, TARGETS,
};
use crate::transport::{live_transport, SimulatedTransport, SimulationControl, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Smallest wait granted to closing the link, even when the grace period is spent.
const MIN_CLOSE_WAIT: Duration = Duration::from_millis(50);

/// Whether the driver talks to hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Driver talks to a simulated link
    Simulation,
    /// Driver talks to the configured device
    Live,
}

/// Lifecycle of a [`ControllerHost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPhase {
    /// Building the link and driver
    Initializing,
    /// Driver up, not yet accepting connections
    Ready(RunMode),
    /// Accepting RPC connections
    Serving,
    /// Gate closed, draining in-flight calls
    ShuttingDown,
    /// Link closed
    Stopped,
}

impl fmt::Display for HostPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPhase::Initializing => write!(f, "initializing"),
            HostPhase::Ready(RunMode::Simulation) => write!(f, "ready (simulation)"),
            HostPhase::Ready(RunMode::Live) => write!(f, "ready"),
            HostPhase::Serving => write!(f, "serving"),
            HostPhase::ShuttingDown => write!(f, "shutting down"),
            HostPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Admission control for calls, with in-flight tracking for shutdown.
#[derive(Clone, Default)]
pub struct CallGate {
    inner: Arc<GateInner>,
}

#[derive(Default)]
struct GateInner {
    state: Mutex<GateState>,
    idle: Notify,
}

#[derive(Default)]
struct GateState {
    closed: bool,
    in_flight: usize,
}

/// Held for the duration of one admitted call.
pub struct CallPermit {
    inner: Arc<GateInner>,
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        let idle = {
            let mut state = self.inner.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.in_flight == 0
        };
        if idle {
            self.inner.idle.notify_waiters();
        }
    }
}

impl CallGate {
    /// Open gate, nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one call.
    ///
    /// # Errors
    /// `ControllerShuttingDown` once the gate is closed.
    pub fn enter(&self) -> AppResult<CallPermit> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(ControllerError::ControllerShuttingDown);
        }
        state.in_flight += 1;
        Ok(CallPermit {
            inner: self.inner.clone(),
        })
    }

    /// Stop admitting calls. Idempotent.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
    }

    /// True once shutdown has begun.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Calls currently admitted.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    /// Wait until no admitted call is left. Returns false if `timeout` ran out first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}

/// Outcome of a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every in-flight call finished within the grace period
    pub drained: bool,
    /// The device link was released
    pub closed: bool,
}

/// One driver, published under its service name.
pub struct ControllerHost {
    service: String,
    target: Arc<dyn RpcTarget>,
    mode: RunMode,
    grace: Duration,
    gate: CallGate,
    phase: watch::Sender<HostPhase>,
    simulation: Option<SimulationControl>,
    shutdown: OnceCell<ShutdownReport>,
}

impl ControllerHost {
    /// Build the link and the driver, and run the driver's startup checks.
    ///
    /// # Arguments
    /// * `config` - Resolved configuration
    /// * `kind` - Driver to publish
    /// * `mode` - Simulation uses the driver's built-in emulator instead of `config.device`
    /// * `name` - Device name for logs and lock diagnostics
    ///
    /// # Errors
    /// `LinkUnavailable` if the device can't be reached; configuration errors if no
    /// usable target is configured.
    pub async fn start(
        config: &ControllerConfig,
        kind: DriverKind,
        mode: RunMode,
        name: &str,
    ) -> AppResult<Self> {
        let (phase, _) = watch::channel(HostPhase::Initializing);
        Self::start_with_phase(config, kind, mode, name, phase).await
    }

    /// Like [`start`](Self::start), publishing phases on a channel the caller already
    /// subscribed to, so `Initializing` is observable. A failed start ends in `Stopped`.
    pub async fn start_with_phase(
        config: &ControllerConfig,
        kind: DriverKind,
        mode: RunMode,
        name: &str,
        phase: watch::Sender<HostPhase>,
    ) -> AppResult<Self> {
        phase.send_replace(HostPhase::Initializing);
        match Self::initialize(config, kind, mode, name).await {
            Ok((target, simulation)) => {
                let mut host = Self::assemble(
                    kind.service_name().to_string(),
                    target,
                    mode,
                    config.shutdown_grace,
                    phase,
                );
                host.simulation = simulation;
                Ok(host)
            }
            Err(e) => {
                phase.send_replace(HostPhase::Stopped);
                Err(e)
            }
        }
    }

    async fn initialize(
        config: &ControllerConfig,
        kind: DriverKind,
        mode: RunMode,
        name: &str,
    ) -> AppResult<(Arc<dyn RpcTarget>, Option<SimulationControl>)> {
        info!(driver = %kind, device = name, ?mode, "Initializing controller");

        let (transport, simulation): (Box<dyn Transport>, Option<SimulationControl>) = match mode
        {
            RunMode::Simulation => {
                let sim = SimulatedTransport::with_responder(name, kind.simulator());
                let control = sim.control();
                (Box::new(sim), Some(control))
            }
            RunMode::Live => {
                let descriptor =
                    config.descriptor(kind.default_device_port(), kind.default_baud())?;
                info!(link = %descriptor.label(), "Using live link");
                (live_transport(&descriptor)?, None)
            }
        };

        let channel = CommandChannel::new(transport).with_retry_policy(config.retry.clone());
        let options = DriverOptions {
            name: name.to_string(),
            lock_timeout: config.lock_timeout,
            serial_number: config.device.serial_number.clone(),
        };
        let target = kind.build(channel, &options).await?;
        Ok((target, simulation))
    }

    /// Host an already initialized target.
    pub fn from_target(
        service: impl Into<String>,
        target: Arc<dyn RpcTarget>,
        mode: RunMode,
        grace: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(HostPhase::Initializing);
        Self::assemble(service.into(), target, mode, grace, phase)
    }

    fn assemble(
        service: String,
        target: Arc<dyn RpcTarget>,
        mode: RunMode,
        grace: Duration,
        phase: watch::Sender<HostPhase>,
    ) -> Self {
        phase.send_replace(HostPhase::Ready(mode));
        info!(%service, ?mode, "Controller ready");
        Self {
            service,
            target,
            mode,
            grace,
            gate: CallGate::new(),
            phase,
            simulation: None,
            shutdown: OnceCell::new(),
        }
    }

    /// Name the driver is published under.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Simulation or live.
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> HostPhase {
        *self.phase.borrow()
    }

    /// Watch phase changes.
    pub fn subscribe_phase(&self) -> watch::Receiver<HostPhase> {
        self.phase.subscribe()
    }

    /// Fault injection handle of the simulated link, in simulation mode.
    pub fn simulation_control(&self) -> Option<&SimulationControl> {
        self.simulation.as_ref()
    }

    /// Calls currently running.
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    /// Dispatch one call.
    ///
    /// # Arguments
    /// * `target` - Service name; `None` means this host's driver
    pub async fn call(
        &self,
        target: Option<&str>,
        method: &str,
        args: CallArgs,
    ) -> AppResult<Value> {
        let _permit = self.gate.enter()?;

        if let Some(name) = target {
            if name != self.service {
                return Err(ControllerError::InvalidRequest(format!(
                    "unknown target '{}'",
                    name
                )));
            }
        }

        match method {
            PING => ret("pong"),
            TARGETS => ret(vec![self.service.as_str()]),
            LIST_METHODS => ret(self.target.methods()),
            _ => self.target.call(method, args).await,
        }
    }

    /// Serve RPC on `listener` until `shutdown` resolves, then shut down.
    pub async fn serve<F>(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: F,
    ) -> AppResult<ShutdownReport>
    where
        F: Future<Output = ()> + Send,
    {
        let server = RpcServer::from_listener(listener);
        info!(service = %self.service, addr = %server.local_addr()?, "Serving");
        self.set_phase(HostPhase::Serving);

        let served = server.run(self.clone(), shutdown).await;
        let report = self.shutdown().await;
        server.stop();
        served?;
        Ok(report)
    }

    /// Reject new calls, drain in-flight ones for up to the grace period, then close
    /// the device link. Later calls return the first report.
    pub async fn shutdown(&self) -> ShutdownReport {
        *self.shutdown.get_or_init(|| self.run_shutdown()).await
    }

    async fn run_shutdown(&self) -> ShutdownReport {
        self.set_phase(HostPhase::ShuttingDown);
        self.gate.close();
        let started = Instant::now();
        info!(in_flight = self.gate.in_flight(), grace = ?self.grace, "Shutting down");

        let drained = self.gate.drain(self.grace).await;
        if !drained {
            warn!(
                in_flight = self.gate.in_flight(),
                "Grace period elapsed with calls still in flight"
            );
        }

        let remaining = self.grace.saturating_sub(started.elapsed()).max(MIN_CLOSE_WAIT);
        let closed = match self.target.close(remaining).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Device link not closed");
                false
            }
        };

        self.set_phase(HostPhase::Stopped);
        info!(drained, closed, "Controller stopped");
        ShutdownReport { drained, closed }
    }

    fn set_phase(&self, phase: HostPhase) {
        let previous = self.phase.send_replace(phase);
        debug!(from = %previous, to = %phase, "Host phase changed");
    }
}

#[async_trait]
impl RpcHandler for ControllerHost {
    async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let RpcRequest {
            id,
            target,
            method,
            args,
            kwargs,
        } = request;
        let result = self
            .call(target.as_deref(), &method, CallArgs::new(args, kwargs))
            .await;
        if let Err(e) = &result {
            debug!(id, %method, kind = %e.kind(), error = %e, "Call failed");
        }
        RpcResponse::from_result(id, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MethodInfo;
    use serde_json::json;

    #[tokio::test]
    async fn test_gate_rejects_after_close() {
        let gate = CallGate::new();
        let permit = gate.enter().unwrap();
        assert_eq!(gate.in_flight(), 1);

        gate.close();
        assert!(matches!(
            gate.enter(),
            Err(ControllerError::ControllerShuttingDown)
        ));
        drop(permit);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_permits() {
        let gate = CallGate::new();
        let permit = gate.enter().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(permit);
        });
        assert!(gate.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_drain_times_out() {
        let gate = CallGate::new();
        let _permit = gate.enter().unwrap();
        let started = std::time::Instant::now();
        assert!(!gate.drain(Duration::from_millis(40)).await);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    struct Recorder {
        closed: Mutex<u32>,
    }

    #[async_trait]
    impl RpcTarget for Recorder {
        fn methods(&self) -> Vec<MethodInfo> {
            vec![MethodInfo::new("double", "(x)", "Twice x")]
        }

        async fn call(&self, method: &str, args: CallArgs) -> AppResult<Value> {
            match method {
                "double" => ret(args.get::<f64>(0, "x")? * 2.0),
                other => Err(ControllerError::UnknownMethod(other.to_string())),
            }
        }

        async fn close(&self, _timeout: Duration) -> AppResult<()> {
            *self.closed.lock() += 1;
            Ok(())
        }
    }

    fn host() -> (ControllerHost, Arc<Recorder>) {
        let recorder = Arc::new(Recorder {
            closed: Mutex::new(0),
        });
        let host = ControllerHost::from_target(
            "calc",
            recorder.clone(),
            RunMode::Simulation,
            Duration::from_millis(200),
        );
        (host, recorder)
    }

    #[tokio::test]
    async fn test_builtins_and_dispatch() {
        let (host, _) = host();
        assert_eq!(host.phase(), HostPhase::Ready(RunMode::Simulation));
        assert_eq!(host.call(None, PING, CallArgs::default()).await.unwrap(), json!("pong"));
        assert_eq!(
            host.call(None, TARGETS, CallArgs::default()).await.unwrap(),
            json!(["calc"])
        );
        let methods = host.call(None, LIST_METHODS, CallArgs::default()).await.unwrap();
        assert_eq!(methods[0]["name"], "double");

        let doubled = host
            .call(Some("calc"), "double", CallArgs::positional(vec![json!(2.5)]))
            .await
            .unwrap();
        assert_eq!(doubled, json!(5.0));

        assert!(matches!(
            host.call(Some("other"), "double", CallArgs::default()).await,
            Err(ControllerError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_handle_maps_errors_to_records() {
        let (host, _) = host();
        let response = host
            .handle(RpcRequest::new(7, "explode", CallArgs::default()))
            .await;
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["error"]["kind"], "UnknownMethod");
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (host, recorder) = host();
        let first = host.shutdown().await;
        let second = host.shutdown().await;
        assert_eq!(first, ShutdownReport { drained: true, closed: true });
        assert_eq!(first, second);
        assert_eq!(*recorder.closed.lock(), 1);
        assert_eq!(host.phase(), HostPhase::Stopped);

        assert!(matches!(
            host.call(None, PING, CallArgs::default()).await,
            Err(ControllerError::ControllerShuttingDown)
        ));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_shutdown_is_logged() {
        let (host, _) = host();
        host.shutdown().await;
        assert!(logs_contain("Shutting down"));
        assert!(logs_contain("Controller stopped"));
    }

    #[tokio::test]
    async fn test_start_in_simulation() {
        let config = ControllerConfig::default();
        let host = ControllerHost::start(&config, DriverKind::Ql355, RunMode::Simulation, "psu")
            .await
            .unwrap();
        assert_eq!(host.service(), "ql355");
        assert!(host.simulation_control().is_some());

        let model = host.call(None, "model", CallArgs::default()).await.unwrap();
        assert_eq!(model, json!("QL355TP"));
        assert!(host.shutdown().await.closed);
    }

    #[tokio::test]
    async fn test_live_start_without_target_fails() {
        let config = ControllerConfig::default();
        let result = ControllerHost::start(&config, DriverKind::Scpi, RunMode::Live, "scope").await;
        assert!(matches!(result, Err(ControllerError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_publishes_phases_on_callers_channel() {
        let config = ControllerConfig::default();

        let (tx, rx) = watch::channel(HostPhase::Initializing);
        let result =
            ControllerHost::start_with_phase(&config, DriverKind::Scpi, RunMode::Live, "scope", tx)
                .await;
        assert!(result.is_err());
        assert_eq!(*rx.borrow(), HostPhase::Stopped);

        let (tx, mut rx) = watch::channel(HostPhase::Stopped);
        let host = ControllerHost::start_with_phase(
            &config,
            DriverKind::Synth,
            RunMode::Simulation,
            "synth",
            tx,
        )
        .await
        .unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), HostPhase::Ready(RunMode::Simulation));
        assert_eq!(host.phase(), HostPhase::Ready(RunMode::Simulation));
        assert_eq!(HostPhase::Initializing.to_string(), "initializing");

        host.shutdown().await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow(), HostPhase::Stopped);
    }
}
