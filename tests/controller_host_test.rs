//! Controller host end to end: simulated drivers, RPC over TCP and graceful shutdown.

use daq_controller::config::ControllerConfig;
use daq_controller::rpc::{CallArgs, RpcClient};
use daq_controller::{ControllerError, ControllerHost, DriverKind, ErrorKind, HostPhase, RunMode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

const SCPI_IDN: &str = "SIMULATED,SCPI-DEVICE,0000,1.0";

async fn simulated(kind: DriverKind) -> Arc<ControllerHost> {
    let config = ControllerConfig::default();
    let host = ControllerHost::start(&config, kind, RunMode::Simulation, "bench")
        .await
        .unwrap();
    Arc::new(host)
}

fn remote_kind(err: ControllerError) -> ErrorKind {
    match err {
        ControllerError::Remote(remote) => remote.kind,
        other => panic!("expected a remote error record, got {:?}", other),
    }
}

#[tokio::test]
async fn test_shutdown_rejects_new_calls_while_in_flight_call_completes() {
    let host = simulated(DriverKind::Scpi).await;
    let control = host.simulation_control().unwrap().clone();
    control.set_latency(Duration::from_millis(200));

    let in_flight = {
        let host = host.clone();
        tokio::spawn(async move {
            host.call(None, "query", CallArgs::positional(vec![json!("*IDN?")]))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(host.in_flight(), 1);

    let shutdown = {
        let host = host.clone();
        tokio::spawn(async move { host.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(host.phase(), HostPhase::ShuttingDown);

    let rejected = host.call(None, "identity", CallArgs::default()).await;
    assert!(matches!(rejected, Err(ControllerError::ControllerShuttingDown)));

    assert_eq!(in_flight.await.unwrap().unwrap(), json!(SCPI_IDN));
    let report = shutdown.await.unwrap();
    assert!(report.drained);
    assert!(report.closed);
    assert_eq!(host.phase(), HostPhase::Stopped);
}

#[tokio::test]
async fn test_rpc_round_trip_over_tcp() {
    let host = simulated(DriverKind::Ql355).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let server = tokio::spawn(host.clone().serve(listener, async move {
        let _ = stop_rx.changed().await;
    }));

    let mut client = RpcClient::connect(&addr).await.unwrap();
    client.ping().await.unwrap();
    assert_eq!(client.targets().await.unwrap(), vec!["ql355".to_string()]);

    client
        .call("set_voltage_limit", vec![json!(12.0), json!(1)])
        .await
        .unwrap();
    let mut kwargs = serde_json::Map::new();
    kwargs.insert("channel".into(), json!(1));
    let volts = client
        .call_with("get_voltage_limit", CallArgs::new(Vec::new(), kwargs))
        .await
        .unwrap();
    assert_eq!(volts, json!(12.0));

    let methods = client.list_methods().await.unwrap();
    let names: Vec<&str> = methods
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["name"].as_str())
        .collect();
    assert!(names.contains(&"increment_voltage"));

    // errors come back as records and the connection stays usable
    let err = client.call("selfdestruct", Vec::new()).await.unwrap_err();
    assert_eq!(remote_kind(err), ErrorKind::UnknownMethod);
    let err = client
        .call("set_voltage_limit", vec![json!(99.0)])
        .await
        .unwrap_err();
    assert_eq!(remote_kind(err), ErrorKind::OutOfRange);
    let model: String = client.call_typed("model", Vec::new()).await.unwrap();
    assert_eq!(model, "QL355TP");

    let mut stranger = RpcClient::connect(&addr).await.unwrap().with_target("synth");
    let err = stranger.call("get_freq", Vec::new()).await.unwrap_err();
    assert_eq!(remote_kind(err), ErrorKind::InvalidRequest);

    stop_tx.send_replace(true);
    let report = server.await.unwrap().unwrap();
    assert!(report.drained);
    assert_eq!(host.phase(), HostPhase::Stopped);

    // the server hung up on its clients
    assert!(client.ping().await.is_err());
}

#[tokio::test]
async fn test_synth_over_rpc_keeps_settings() {
    let host = simulated(DriverKind::Synth).await;

    host.call(None, "set_freq", CallArgs::positional(vec![json!(2.0e9)]))
        .await
        .unwrap();
    host.call(None, "set_rf_on", CallArgs::positional(vec![json!(true)]))
        .await
        .unwrap();
    assert_eq!(
        host.call(Some("synth"), "get_freq", CallArgs::default())
            .await
            .unwrap(),
        json!(2.0e9)
    );
    assert_eq!(
        host.call(None, "get_rf_on", CallArgs::default()).await.unwrap(),
        Value::Bool(true)
    );
    host.shutdown().await;
}

#[tokio::test]
async fn test_simulated_link_drop_is_invisible_to_callers() {
    let host = simulated(DriverKind::Scpi).await;
    let control = host.simulation_control().unwrap().clone();
    control.fail_next_write(daq_controller::transport::SimFault::Broken);

    let idn = host
        .call(None, "query", CallArgs::positional(vec![json!("*IDN?")]))
        .await
        .unwrap();
    assert_eq!(idn, json!(SCPI_IDN));
    assert!(control.open_count() >= 2);
    host.shutdown().await;
}
