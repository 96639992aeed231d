use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, instrument, warn};

use vantil_util::identity::DEVICE_PREFIX;
use vantil_util::types::Serial;

use crate::metrics::{MetricsSampler, MetricsSnapshot};
use crate::session::{Session, SessionError};

/// Topic a device publishes its metrics reports on.
pub fn data_topic(serial: &Serial) -> String {
    format!("{DEVICE_PREFIX}/{serial}/data")
}

/// A single metrics report as published on the data topic.
///
/// Field order is the wire order.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TelemetryReport {
    device: String,
    cpu_usage_percent: f64,
    ram_usage_percent: f64,
    ram_used_mb: f64,
    disk_usage_percent: f64,
    battery_percent: Option<f64>,
    power_plugged: Option<bool>,
    status: &'static str,
    timestamp: u64,
}

impl TelemetryReport {
    pub fn new(device: &str, snapshot: &MetricsSnapshot, timestamp: u64) -> Self {
        let (battery_percent, power_plugged) = match &snapshot.battery {
            Some(battery) => (Some(battery.percent), Some(battery.plugged)),
            None => (None, None),
        };

        Self {
            device: device.to_owned(),
            cpu_usage_percent: snapshot.cpu_usage_percent,
            ram_usage_percent: snapshot.ram_usage_percent,
            ram_used_mb: snapshot.ram_used_mb,
            disk_usage_percent: snapshot.disk_usage_percent,
            battery_percent,
            power_plugged,
            status: "online",
            timestamp,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ReportConfig {
    /// Device tag attached to every report.
    pub device: String,
    pub serial: Serial,
    pub interval: Duration,
}

/// Where reports go.
///
/// The broker session implements this, tests substitute a recorder.
#[async_trait]
pub trait ReportSink {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError>;
    async fn disconnect(&self) -> Result<(), SessionError>;
}

#[async_trait]
impl ReportSink for Session {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        Session::publish(self, topic, payload).await
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        Session::disconnect(self).await
    }
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Periodically sample local metrics and publish them until `stop_rx`
/// signals, then close the sink.
///
/// Reports are fire and forget, a failed publish is logged and the loop
/// carries on. The stop signal interrupts the sleep between reports, after
/// which exactly one graceful disconnect is issued.
#[instrument(name = "report", skip_all)]
pub async fn start_report<S: ReportSink>(
    sink: &S,
    config: &ReportConfig,
    sampler: &mut MetricsSampler,
    mut stop_rx: watch::Receiver<bool>,
) -> Result<(), SessionError> {
    let topic = data_topic(&config.serial);
    info!("reporting metrics on {topic} every {:?}", config.interval);

    loop {
        let snapshot = sampler.sample().await;
        let report = TelemetryReport::new(&config.device, &snapshot, epoch_seconds());
        let payload = serde_json::to_vec(&report)
            // This is probably a bug in the types, it shouldn't really happen
            .expect("metrics report serialization failed");

        debug!("publishing {report:?}");
        if let Err(err) = sink.publish(&topic, payload).await {
            warn!("report failed: {err}");
        }

        tokio::select! {
            _ = time::sleep(config.interval) => {}
            _ = stop_rx.changed() => break,
        }
    }

    info!("stopping reports");
    sink.disconnect().await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    use crate::metrics::BatteryReading;

    use super::*;

    #[test]
    fn it_serializes_the_report_in_wire_order() {
        let snapshot = MetricsSnapshot {
            cpu_usage_percent: 12.3,
            ram_usage_percent: 40.0,
            ram_used_mb: 2048.0,
            disk_usage_percent: 55.0,
            battery: None,
        };
        let report = TelemetryReport::new("laptop", &snapshot, 1_700_000_000);

        assert_eq!(
            serde_json::to_string(&report).unwrap(),
            concat!(
                "{\"device\":\"laptop\",\"cpu_usage_percent\":12.3,",
                "\"ram_usage_percent\":40.0,\"ram_used_mb\":2048.0,",
                "\"disk_usage_percent\":55.0,\"battery_percent\":null,",
                "\"power_plugged\":null,\"status\":\"online\",",
                "\"timestamp\":1700000000}"
            )
        );
    }

    #[test]
    fn it_reports_battery_state_when_present() {
        let snapshot = MetricsSnapshot {
            cpu_usage_percent: 1.0,
            ram_usage_percent: 2.0,
            ram_used_mb: 3.0,
            disk_usage_percent: 4.0,
            battery: Some(BatteryReading {
                percent: 87.0,
                plugged: true,
            }),
        };
        let report = TelemetryReport::new("laptop", &snapshot, 1_700_000_000);

        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({
                "device": "laptop",
                "cpu_usage_percent": 1.0,
                "ram_usage_percent": 2.0,
                "ram_used_mb": 3.0,
                "disk_usage_percent": 4.0,
                "battery_percent": 87.0,
                "power_plugged": true,
                "status": "online",
                "timestamp": 1_700_000_000
            })
        );
    }

    #[test]
    fn data_topic_is_derived_from_the_serial() {
        assert_eq!(data_topic(&Serial::from("001")), "vantilator/001/data");
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        published: Arc<AtomicUsize>,
        disconnected: Arc<AtomicUsize>,
        first_report: Arc<Notify>,
    }

    #[async_trait]
    impl ReportSink for RecordingSink {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), SessionError> {
            self.published.fetch_add(1, Ordering::SeqCst);
            self.first_report.notify_one();
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), SessionError> {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn an_interrupt_mid_sleep_publishes_nothing_further() {
        let sink = RecordingSink::default();
        let config = ReportConfig {
            device: "laptop".to_owned(),
            serial: "001".into(),
            // long enough that the loop is guaranteed to be mid-sleep
            interval: Duration::from_secs(60),
        };
        let (stop_tx, stop_rx) = watch::channel(false);

        let task_sink = sink.clone();
        let handle = tokio::spawn(async move {
            let mut sampler = MetricsSampler::new();
            start_report(&task_sink, &config, &mut sampler, stop_rx).await
        });

        timeout(Duration::from_secs(30), sink.first_report.notified())
            .await
            .expect("no report was published");

        stop_tx.send(true).unwrap();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("the loop did not stop")
            .unwrap()
            .unwrap();

        assert_eq!(sink.published.load(Ordering::SeqCst), 1);
        assert_eq!(sink.disconnected.load(Ordering::SeqCst), 1);
    }
}
