//! Concurrent callers on one device must never interleave on the wire.

use daq_controller::channel::CommandChannel;
use daq_controller::device::Device;
use daq_controller::transport::{CannedResponder, SimEvent, SimulatedTransport, SimulationControl};
use daq_controller::ControllerError;
use futures::future::join_all;
use futures::FutureExt;
use std::time::Duration;

fn device(lock_timeout: Duration) -> (Device<()>, SimulationControl) {
    let responder = CannedResponder::new()
        .with("MEAS:VOLT?", "1.25")
        .with("MEAS:CURR?", "0.5");
    let sim = SimulatedTransport::new("meter", responder);
    let control = sim.control();
    let device = Device::new("meter", CommandChannel::new(Box::new(sim)), (), lock_timeout);
    (device, control)
}

/// Write/read events only, in order.
fn wire(control: &SimulationControl) -> Vec<SimEvent> {
    control
        .events()
        .into_iter()
        .filter(|e| matches!(e, SimEvent::Write(_) | SimEvent::Read(_)))
        .collect()
}

fn assert_strictly_paired(events: &[SimEvent]) {
    assert_eq!(events.len() % 2, 0, "unpaired event in {:?}", events);
    for pair in events.chunks(2) {
        match (&pair[0], &pair[1]) {
            (SimEvent::Write(cmd), SimEvent::Read(reply)) => {
                let expected: &[u8] = if cmd.starts_with(b"MEAS:VOLT?") {
                    b"1.25"
                } else {
                    b"0.5"
                };
                assert_eq!(reply.as_slice(), expected, "reply crossed to another command");
            }
            other => panic!("interleaved exchange: {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_queries_are_serialized() {
    let (device, control) = device(Duration::from_secs(5));
    device.connect().await.unwrap();
    control.set_latency(Duration::from_millis(2));

    let callers = (0..16).map(|i| {
        let device = device.clone();
        async move {
            let cmd = if i % 2 == 0 { "MEAS:VOLT?" } else { "MEAS:CURR?" };
            let reply = device
                .run("measure", move |s| s.query(cmd).boxed())
                .await
                .unwrap();
            (cmd, reply)
        }
    });

    for (cmd, reply) in join_all(callers).await {
        let expected = if cmd == "MEAS:VOLT?" { "1.25" } else { "0.5" };
        assert_eq!(reply, expected);
    }

    let events = wire(&control);
    assert_eq!(events.len(), 32);
    assert_strictly_paired(&events);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_step_operation_holds_the_lock() {
    let (device, control) = device(Duration::from_secs(5));
    device.connect().await.unwrap();
    control.set_latency(Duration::from_millis(2));

    let callers = (0..4).map(|_| {
        let device = device.clone();
        async move {
            device
                .run("power", |s| {
                    async move {
                        let volts: f64 = s.query("MEAS:VOLT?").await?.parse().unwrap_or(0.0);
                        let amps: f64 = s.query("MEAS:CURR?").await?.parse().unwrap_or(0.0);
                        Ok(volts * amps)
                    }
                    .boxed()
                })
                .await
        }
    });
    for power in join_all(callers).await {
        assert_eq!(power.unwrap(), 0.625);
    }

    // each operation's two exchanges are adjacent
    let events = wire(&control);
    for op in events.chunks(4) {
        assert_eq!(op[0], SimEvent::Write(b"MEAS:VOLT?\n".to_vec()));
        assert_eq!(op[2], SimEvent::Write(b"MEAS:CURR?\n".to_vec()));
    }
    assert_strictly_paired(&events);
}

#[tokio::test]
async fn test_busy_device_times_out() {
    let (device, control) = device(Duration::from_millis(50));
    device.connect().await.unwrap();
    control.set_latency(Duration::from_millis(300));

    let slow = {
        let device = device.clone();
        tokio::spawn(async move { device.run("slow", |s| s.query("MEAS:VOLT?").boxed()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = device
        .run("fast", |s| s.query("MEAS:CURR?").boxed())
        .await
        .unwrap_err();
    match err {
        ControllerError::LockTimeout { holder, .. } => assert!(holder.starts_with("slow")),
        other => panic!("expected LockTimeout, got {:?}", other),
    }
    assert_eq!(slow.await.unwrap().unwrap(), "1.25");
}

#[tokio::test]
async fn test_cancelled_caller_does_not_tear_exchange() {
    let (device, control) = device(Duration::from_secs(5));
    device.connect().await.unwrap();
    control.set_latency(Duration::from_millis(50));

    let abandoned = {
        let device = device.clone();
        tokio::spawn(async move { device.run("abandoned", |s| s.query("MEAS:VOLT?").boxed()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    abandoned.abort();

    control.set_latency(Duration::ZERO);
    let reply = device
        .run("next", |s| s.query("MEAS:CURR?").boxed())
        .await
        .unwrap();
    assert_eq!(reply, "0.5");

    let events = wire(&control);
    assert_eq!(events.len(), 4);
    assert_strictly_paired(&events);
}
