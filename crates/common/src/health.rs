//! Health view derived from the observation streams.

use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::Serialize,
};

use crate::observe::{ConnectionKind, EventClass, Observation, ObserverHook, SystemKind};

const DEFAULT_COLLECTION_PERIOD: Duration = Duration::from_secs(60);

/// Thresholds from the error-rate policy: degraded at 5%, unhealthy at 20%
/// of observed events in the collection period.
const DEGRADED_ERROR_RATE: f64 = 0.05;
const UNHEALTHY_ERROR_RATE: f64 = 0.20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub active_connections: i64,
    pub error_rate: f64,
    pub last_error: Option<String>,
    pub bridge_circuit_open: bool,
}

struct Window {
    started_at: Instant,
    events: u64,
    errors: u64,
}

/// Derives `{healthy | degraded | unhealthy}` from the live observation
/// streams. Registered as an [`ObserverHook`] on all four classes.
pub struct HealthMonitor {
    active_connections: AtomicI64,
    circuit_open: AtomicBool,
    window: Mutex<Window>,
    last_error: Mutex<Option<String>>,
    collection_period: Duration,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::with_period(DEFAULT_COLLECTION_PERIOD)
    }

    pub fn with_period(collection_period: Duration) -> Self {
        Self {
            active_connections: AtomicI64::new(0),
            circuit_open: AtomicBool::new(false),
            window: Mutex::new(Window {
                started_at: Instant::now(),
                events: 0,
                errors: 0,
            }),
            last_error: Mutex::new(None),
            collection_period,
        }
    }

    pub fn set_circuit_open(&self, open: bool) {
        self.circuit_open.store(open, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    fn record_event(&self, is_error: bool) {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.started_at.elapsed() >= self.collection_period {
            window.started_at = Instant::now();
            window.events = 0;
            window.errors = 0;
        }
        window.events += 1;
        if is_error {
            window.errors += 1;
        }
    }

    fn error_rate(&self) -> f64 {
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.events == 0 {
            return 0.0;
        }
        window.errors as f64 / window.events as f64
    }

    pub fn report(&self) -> HealthReport {
        let error_rate = self.error_rate();
        let circuit_open = self.circuit_open.load(Ordering::Relaxed);
        let status = if circuit_open || error_rate >= UNHEALTHY_ERROR_RATE {
            HealthStatus::Unhealthy
        } else if error_rate >= DEGRADED_ERROR_RATE {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthReport {
            status,
            active_connections: self.active_connections(),
            error_rate,
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            bridge_circuit_open: circuit_open,
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObserverHook for HealthMonitor {
    fn name(&self) -> &str {
        "health-monitor"
    }

    fn classes(&self) -> &[EventClass] {
        EventClass::ALL
    }

    async fn observe(&self, observation: &Observation) -> Result<()> {
        match observation {
            Observation::Error { scope, message } => {
                self.record_event(true);
                *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(format!("{scope}: {message}"));
            },
            Observation::Metric { .. } => {
                self.record_event(false);
            },
            Observation::Connection { kind, .. } => match kind {
                ConnectionKind::Connected => {
                    self.active_connections.fetch_add(1, Ordering::Relaxed);
                },
                ConnectionKind::Disconnected => {
                    self.active_connections.fetch_sub(1, Ordering::Relaxed);
                },
                ConnectionKind::Replaced
                | ConnectionKind::Stale
                | ConnectionKind::HeartbeatFailed => {},
            },
            Observation::System { kind, .. } => match kind {
                SystemKind::Degraded => self.set_circuit_open(true),
                SystemKind::Recovered => self.set_circuit_open(false),
                SystemKind::Started | SystemKind::ShuttingDown => {},
            },
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_counting() {
        let monitor = HealthMonitor::new();
        monitor
            .observe(&Observation::connection(ConnectionKind::Connected, "1", "a"))
            .await
            .unwrap();
        monitor
            .observe(&Observation::connection(ConnectionKind::Connected, "2", "b"))
            .await
            .unwrap();
        monitor
            .observe(&Observation::connection(
                ConnectionKind::Disconnected,
                "1",
                "a",
            ))
            .await
            .unwrap();
        assert_eq!(monitor.active_connections(), 1);
    }

    #[tokio::test]
    async fn degraded_at_five_percent_errors() {
        let monitor = HealthMonitor::new();
        for _ in 0..95 {
            monitor
                .observe(&Observation::metric("hub.frames", 1.0))
                .await
                .unwrap();
        }
        for _ in 0..5 {
            monitor
                .observe(&Observation::error("hub", "boom"))
                .await
                .unwrap();
        }
        let report = monitor.report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.last_error.is_some());
    }

    #[tokio::test]
    async fn unhealthy_when_circuit_open() {
        let monitor = HealthMonitor::new();
        monitor
            .observe(&Observation::system(SystemKind::Degraded, "bus down"))
            .await
            .unwrap();
        assert_eq!(monitor.report().status, HealthStatus::Unhealthy);

        monitor
            .observe(&Observation::system(SystemKind::Recovered, "bus back"))
            .await
            .unwrap();
        assert_eq!(monitor.report().status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn window_resets_after_period() {
        let monitor = HealthMonitor::with_period(Duration::from_millis(10));
        monitor
            .observe(&Observation::error("hub", "boom"))
            .await
            .unwrap();
        assert_eq!(monitor.report().status, HealthStatus::Unhealthy);

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Next event rolls the window; the old error no longer counts.
        monitor
            .observe(&Observation::metric("hub.frames", 1.0))
            .await
            .unwrap();
        assert_eq!(monitor.report().status, HealthStatus::Healthy);
    }
}
