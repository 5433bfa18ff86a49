//! Simulated link for `--simulation` mode and tests.
//!
//! A [`SimulatedTransport`] hands every write to a [`Responder`] that plays the part of
//! the instrument; the reply is queued and served by the next framed read. A cloneable
//! [`SimulationControl`] handle provides:
//! - Simulated response latency
//! - Controllable failure injection (failed opens, broken or silent writes and reads)
//! - An event log for test verification

use super::framing::{FrameBuffer, ResponseSpec};
use super::{ConnectionDescriptor, LinkState, LinkStateCell, Transport};
use crate::error::{AppResult, ControllerError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Plays the instrument side of a simulated link.
///
/// Receives each write verbatim (terminator included) and returns the bytes the
/// instrument would send back, or `None` for commands that produce no response.
pub trait Responder: Send {
    /// Reply to one command, or `None` if it has no response.
    fn respond(&mut self, command: &[u8]) -> Option<Vec<u8>>;
}

impl<F> Responder for F
where
    F: FnMut(&[u8]) -> Option<Vec<u8>> + Send,
{
    fn respond(&mut self, command: &[u8]) -> Option<Vec<u8>> {
        self(command)
    }
}

/// Responder backed by a fixed command → response table.
///
/// Lookup uses the command text with trailing `\r`/`\n` removed; the terminator is
/// appended to each response.
#[derive(Debug, Clone)]
pub struct CannedResponder {
    table: HashMap<String, String>,
    default: Option<String>,
    terminator: String,
}

impl Default for CannedResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl CannedResponder {
    /// Responder with no canned replies.
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
            default: None,
            terminator: "\n".to_string(),
        }
    }

    /// Answer `command` with `response`.
    pub fn with(mut self, command: impl Into<String>, response: impl Into<String>) -> Self {
        self.table.insert(command.into(), response.into());
        self
    }

    /// Answer every unknown command with `response` (unknown commands are silent otherwise).
    pub fn with_default(mut self, response: impl Into<String>) -> Self {
        self.default = Some(response.into());
        self
    }

    /// Terminator appended to every reply.
    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }
}

impl Responder for CannedResponder {
    fn respond(&mut self, command: &[u8]) -> Option<Vec<u8>> {
        let text = String::from_utf8_lossy(command);
        let key = text.trim_end_matches(['\r', '\n']);
        self.table
            .get(key)
            .or(self.default.as_ref())
            .map(|response| format!("{}{}", response, self.terminator).into_bytes())
    }
}

/// Responder that sends every write straight back.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoResponder;

impl Responder for EchoResponder {
    fn respond(&mut self, command: &[u8]) -> Option<Vec<u8>> {
        Some(command.to_vec())
    }
}

/// Failure injected into the next write or read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// The link drops (`LinkBroken`)
    Broken,
    /// Nothing arrives in time (`LinkTimeout`)
    Timeout,
}

/// Observable activity on a simulated link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// Link opened
    Open,
    /// Open refused
    OpenFailed,
    /// Link closed
    Close,
    /// Bytes written
    Write(Vec<u8>),
    /// Frame read
    Read(Vec<u8>),
    /// Injected fault fired
    Fault(SimFault),
}

#[derive(Debug)]
struct ControlState {
    failing_opens: u32,
    write_fault: Option<SimFault>,
    read_fault: Option<SimFault>,
    silent_writes: u32,
    available: bool,
    latency: Duration,
    events: Vec<SimEvent>,
}

/// Cloneable handle for steering a [`SimulatedTransport`] from outside.
#[derive(Debug, Clone)]
pub struct SimulationControl {
    state: Arc<Mutex<ControlState>>,
}

impl Default for SimulationControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulationControl {
    /// Control for a fresh, available link.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ControlState {
                failing_opens: 0,
                write_fault: None,
                read_fault: None,
                silent_writes: 0,
                available: true,
                latency: Duration::ZERO,
                events: Vec::new(),
            })),
        }
    }

    /// Make the next `n` opens fail with `LinkUnavailable`.
    pub fn fail_next_opens(&self, n: u32) {
        self.state.lock().failing_opens = n;
    }

    /// Fail the next write.
    pub fn fail_next_write(&self, fault: SimFault) {
        self.state.lock().write_fault = Some(fault);
    }

    /// Fail the next read.
    pub fn fail_next_read(&self, fault: SimFault) {
        self.state.lock().read_fault = Some(fault);
    }

    /// Accept the next `n` writes without producing a response.
    pub fn swallow_next_responses(&self, n: u32) {
        self.state.lock().silent_writes = n;
    }

    /// Unplug (`false`) or replug (`true`) the simulated device.
    ///
    /// While unplugged, opens fail and I/O on an open link breaks.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Delay applied before every framed read.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<SimEvent> {
        self.state.lock().events.clone()
    }

    /// Forget recorded events.
    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Writes recorded in the event log.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                SimEvent::Write(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of successful opens recorded in the event log.
    pub fn open_count(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, SimEvent::Open))
            .count()
    }

    fn record(&self, event: SimEvent) {
        self.state.lock().events.push(event);
    }
}

/// Transport whose far end is a [`Responder`].
pub struct SimulatedTransport {
    descriptor: ConnectionDescriptor,
    responder: Box<dyn Responder>,
    control: SimulationControl,
    rx: FrameBuffer,
    link: LinkStateCell,
}

impl SimulatedTransport {
    /// Simulated link called `name` answered by `responder`.
    pub fn new(name: impl Into<String>, responder: impl Responder + 'static) -> Self {
        Self::with_responder(name, Box::new(responder))
    }

    /// Build around an already boxed responder.
    pub fn with_responder(name: impl Into<String>, responder: Box<dyn Responder>) -> Self {
        let descriptor = ConnectionDescriptor::simulated(name);
        let link = LinkStateCell::new(descriptor.label());
        Self {
            descriptor,
            responder,
            control: SimulationControl::new(),
            rx: FrameBuffer::new(),
            link,
        }
    }

    /// Share an existing control handle instead of a private one.
    pub fn with_control(mut self, control: SimulationControl) -> Self {
        self.control = control;
        self
    }

    /// Handle for steering and inspecting this link.
    pub fn control(&self) -> SimulationControl {
        self.control.clone()
    }

    fn not_connected(&self) -> ControllerError {
        ControllerError::LinkBroken(format!("{} is not connected", self.descriptor.label()))
    }

    fn fault(&mut self, fault: SimFault, timeout: Duration) -> ControllerError {
        self.control.record(SimEvent::Fault(fault));
        self.rx.clear();
        self.link.fault();
        match fault {
            SimFault::Broken => ControllerError::LinkBroken("simulated link dropped".to_string()),
            SimFault::Timeout => ControllerError::LinkTimeout(timeout),
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    fn link(&self) -> &LinkStateCell {
        &self.link
    }

    async fn open(&mut self) -> AppResult<()> {
        if self.link.get() == LinkState::Connected {
            return Ok(());
        }
        self.link.transition(LinkState::Connecting)?;
        self.rx.clear();

        let refused = {
            let mut state = self.control.state.lock();
            if !state.available {
                true
            } else if state.failing_opens > 0 {
                state.failing_opens -= 1;
                true
            } else {
                false
            }
        };

        if refused {
            self.control.record(SimEvent::OpenFailed);
            self.link.transition(LinkState::Disconnected)?;
            return Err(ControllerError::LinkUnavailable {
                target: self.descriptor.label(),
                reason: "simulated device refused connection".to_string(),
            });
        }

        self.control.record(SimEvent::Open);
        self.link.transition(LinkState::Connected)?;
        debug!(link = %self.descriptor.label(), "Simulated link open");
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        if self.link.get() != LinkState::Disconnected {
            self.control.record(SimEvent::Close);
        }
        self.rx.clear();
        self.link.transition(LinkState::Disconnected)
    }

    async fn write(&mut self, data: &[u8]) -> AppResult<()> {
        if self.link.get() != LinkState::Connected {
            return Err(self.not_connected());
        }

        let (fault, available, silent) = {
            let mut state = self.control.state.lock();
            let silent = state.silent_writes > 0;
            if silent {
                state.silent_writes -= 1;
            }
            (state.write_fault.take(), state.available, silent)
        };
        if let Some(fault) = fault {
            return Err(self.fault(fault, self.descriptor.timeout));
        }
        if !available {
            return Err(self.fault(SimFault::Broken, self.descriptor.timeout));
        }

        trace!(link = %self.descriptor.label(), bytes = data.len(), "sim write");
        self.control.record(SimEvent::Write(data.to_vec()));
        if !silent {
            if let Some(reply) = self.responder.respond(data) {
                self.rx.extend(&reply);
            }
        }
        Ok(())
    }

    async fn read_frame(&mut self, spec: &ResponseSpec, timeout: Duration) -> AppResult<Bytes> {
        if self.link.get() != LinkState::Connected {
            return Err(self.not_connected());
        }

        let (latency, fault, available) = {
            let mut state = self.control.state.lock();
            (state.latency, state.read_fault.take(), state.available)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(fault) = fault {
            return Err(self.fault(fault, timeout));
        }
        if !available {
            return Err(self.fault(SimFault::Broken, timeout));
        }

        match self.rx.try_frame(spec)? {
            Some(frame) => {
                self.control.record(SimEvent::Read(frame.to_vec()));
                Ok(frame)
            }
            // nothing else will ever arrive, so don't wait out the timeout
            None => {
                self.link.fault();
                Err(ControllerError::LinkTimeout(timeout))
            }
        }
    }

    async fn discard_input(&mut self) -> AppResult<()> {
        self.rx.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idn_responder() -> CannedResponder {
        CannedResponder::new().with("*IDN?", "ACME,SIM,0,1.0")
    }

    #[tokio::test]
    async fn test_canned_round_trip() {
        let mut sim = SimulatedTransport::new("psu", idn_responder());
        sim.open().await.unwrap();
        sim.write(b"*IDN?\n").await.unwrap();
        let frame = sim
            .read_frame(&ResponseSpec::line(), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(&frame[..], b"ACME,SIM,0,1.0");

        let control = sim.control();
        assert_eq!(
            control.events(),
            vec![
                SimEvent::Open,
                SimEvent::Write(b"*IDN?\n".to_vec()),
                SimEvent::Read(b"ACME,SIM,0,1.0".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_command_times_out_and_faults() {
        let mut sim = SimulatedTransport::new("psu", idn_responder());
        sim.open().await.unwrap();
        sim.write(b"BOGUS?\n").await.unwrap();
        let err = sim
            .read_frame(&ResponseSpec::line(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::LinkTimeout(_)));
        assert_eq!(sim.link_state(), LinkState::Faulted);

        // reopen from faulted
        sim.open().await.unwrap();
        assert_eq!(sim.link_state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let mut sim = SimulatedTransport::new("psu", idn_responder());
        let control = sim.control();

        control.fail_next_opens(1);
        assert!(matches!(
            sim.open().await,
            Err(ControllerError::LinkUnavailable { .. })
        ));
        sim.open().await.unwrap();

        control.fail_next_write(SimFault::Broken);
        assert!(matches!(
            sim.write(b"*IDN?\n").await,
            Err(ControllerError::LinkBroken(_))
        ));
        assert_eq!(sim.link_state(), LinkState::Faulted);
        assert!(sim.write(b"*IDN?\n").await.is_err());
    }

    #[tokio::test]
    async fn test_unplugged_device_refuses_open() {
        let mut sim = SimulatedTransport::new("psu", EchoResponder);
        sim.control().set_available(false);
        assert!(sim.open().await.is_err());
        assert_eq!(sim.link_state(), LinkState::Disconnected);

        sim.control().set_available(true);
        sim.open().await.unwrap();
        sim.write(b"ping\n").await.unwrap();
        let frame = sim
            .read_frame(&ResponseSpec::line(), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(&frame[..], b"ping");
    }

    #[tokio::test]
    async fn test_closure_responder() {
        let mut count = 0u32;
        let responder = move |_cmd: &[u8]| {
            count += 1;
            Some(format!("{}\n", count).into_bytes())
        };
        let mut sim = SimulatedTransport::new("counter", responder);
        sim.open().await.unwrap();
        for expected in ["1", "2"] {
            sim.write(b"N?\n").await.unwrap();
            let frame = sim
                .read_frame(&ResponseSpec::line(), Duration::from_millis(10))
                .await
                .unwrap();
            assert_eq!(&frame[..], expected.as_bytes());
        }
    }
}
