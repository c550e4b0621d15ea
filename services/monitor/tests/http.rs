use bytes::Bytes;
use fleetwatch_broker::Broker;
use fleetwatch_client::{Connector, InProcessConnector};
use fleetwatch_common::SystemClock;
use fleetwatch_monitor::{Monitor, MonitorConfig, MonitorHandle};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn serve(handle: &MonitorHandle) -> SocketAddr {
    let recorder = PrometheusBuilder::new().build_recorder();
    let app = monitor::http::router(recorder.handle(), handle.query(), handle.status());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.ok();
    });
    addr
}

fn start(broker: &Arc<Broker>) -> MonitorHandle {
    let config = MonitorConfig {
        tick_interval_ms: 20,
        reconnect_delay_ms: 20,
        ..MonitorConfig::default()
    };
    let connector = Arc::new(InProcessConnector::new(Arc::clone(broker)));
    Monitor::start(config, connector, Arc::new(SystemClock)).expect("start")
}

async fn get_json(url: &str) -> serde_json::Value {
    reqwest::get(url)
        .await
        .expect("request")
        .json()
        .await
        .expect("json body")
}

#[tokio::test]
async fn snapshot_endpoint_reports_published_readings() {
    let broker = Arc::new(Broker::new());
    let handle = start(&broker);
    let addr = serve(&handle).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !handle.status().is_connected() {
        assert!(tokio::time::Instant::now() < deadline, "subscriber never connected");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let ready = reqwest::get(format!("http://{addr}/ready"))
        .await
        .expect("ready");
    assert_eq!(ready.status(), 200);

    let device = InProcessConnector::new(Arc::clone(&broker))
        .connect("device-1")
        .await
        .expect("connect");
    device
        .publish(
            "iot/device/data",
            Bytes::from_static(br#"{"temperature": 24.0, "humidity": 55.0}"#),
        )
        .await
        .expect("publish");
    device.disconnect().await.expect("disconnect");

    let url = format!("http://{addr}/snapshot");
    let mut body = get_json(&url).await;
    while body["eventCount"] != 1 {
        assert!(tokio::time::Instant::now() < deadline, "snapshot never updated");
        tokio::time::sleep(Duration::from_millis(20)).await;
        body = get_json(&url).await;
    }
    assert_eq!(body["anomaly"]["active"], false);
    assert_eq!(body["anomaly"]["threshold"], 50.0);
    assert_eq!(body["recent"][0]["fields"]["humidity"], 55.0);
    assert!(body["perFieldSeries"]["temperature"].is_array());

    let live = reqwest::get(format!("http://{addr}/live"))
        .await
        .expect("live");
    assert_eq!(live.text().await.expect("body"), "ok");
    let metrics = reqwest::get(format!("http://{addr}/metrics"))
        .await
        .expect("metrics");
    assert_eq!(metrics.status(), 200);

    handle.shutdown().await;
}

#[tokio::test]
async fn ready_is_unavailable_without_a_subscription() {
    let broker = Arc::new(Broker::new());
    broker.set_accepting(false);
    let handle = start(&broker);
    let addr = serve(&handle).await;
    let ready = reqwest::get(format!("http://{addr}/ready"))
        .await
        .expect("ready");
    assert_eq!(ready.status(), 503);
    handle.shutdown().await;
}
