//! Periodic health probing and request admission.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::health_model::{HealthStatus, ProbeFailure, ProbeOutcome};
use crate::config::SyncConfig;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> ProbeOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_consecutive_failures: u32,
}

impl From<&SyncConfig> for MonitorConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            interval: config.health_interval(),
            timeout: config.health_timeout(),
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

struct MonitorInner {
    probe: Arc<dyn HealthProbe>,
    config: MonitorConfig,
    status: watch::Sender<HealthStatus>,
    network_online: AtomicBool,
}

impl MonitorInner {
    async fn check_now(&self) -> HealthStatus {
        let failure = match tokio::time::timeout(self.config.timeout, self.probe.probe()).await {
            Err(_) => Some(ProbeFailure::Timeout {
                after_ms: self.config.timeout.as_millis() as u64,
            }),
            Ok(ProbeOutcome::Healthy) => None,
            Ok(ProbeOutcome::Unhealthy { status }) => Some(ProbeFailure::Unhealthy { status }),
            Ok(ProbeOutcome::NetworkError(detail)) => Some(ProbeFailure::Network(detail)),
        };
        self.record(failure)
    }

    fn record(&self, failure: Option<ProbeFailure>) -> HealthStatus {
        let online = self.network_online.load(Ordering::SeqCst);
        let max = self.config.max_consecutive_failures;
        self.status.send_if_modified(|status| {
            let before = status.signature();
            status.last_check = Some(Utc::now());
            match &failure {
                None => {
                    status.is_healthy = true;
                    status.consecutive_failures = 0;
                    status.last_error = None;
                }
                Some(failure) => {
                    status.is_healthy = false;
                    status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                    status.last_error = Some(failure.message());
                }
            }
            status.can_make_requests = online && status.consecutive_failures < max;
            status.signature() != before
        });
        let status = self.status.borrow().clone();
        match &failure {
            Some(failure) => debug!(
                "[Reachability] Probe failed ({} in a row): {}",
                status.consecutive_failures,
                failure.message()
            ),
            None => debug!("[Reachability] Probe ok"),
        }
        status
    }
}

/// Tracks reachability of the remote service and decides whether remote requests
/// are admitted.
pub struct ReachabilityMonitor {
    inner: Arc<MonitorInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReachabilityMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, config: MonitorConfig) -> Self {
        let (status, _) = watch::channel(HealthStatus::default());
        Self {
            inner: Arc::new(MonitorInner {
                probe,
                config,
                status,
                network_online: AtomicBool::new(true),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> MonitorConfig {
        self.inner.config
    }

    /// Probes immediately, then on every interval. A second call while running is a no-op.
    pub async fn start_monitoring(&self) {
        let mut guard = self.task.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                warn!("[Reachability] Monitoring already running");
                return;
            }
            guard.take();
        }
        let inner = Arc::clone(&self.inner);
        let interval = self.inner.config.interval;
        *guard = Some(tokio::spawn(async move {
            loop {
                inner.check_now().await;
                tokio::time::sleep(interval).await;
            }
        }));
        info!(
            "[Reachability] Monitoring started (every {}s)",
            interval.as_secs()
        );
    }

    pub async fn stop_monitoring(&self) {
        let mut guard = self.task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
            info!("[Reachability] Monitoring stopped");
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn check_now(&self) -> HealthStatus {
        self.inner.check_now().await
    }

    /// Device connectivity signal. Going offline blocks requests regardless of probe history.
    pub fn set_network_online(&self, online: bool) {
        let previous = self.inner.network_online.swap(online, Ordering::SeqCst);
        if previous == online {
            return;
        }
        info!(
            "[Reachability] Device is {}",
            if online { "online" } else { "offline" }
        );
        let max = self.inner.config.max_consecutive_failures;
        self.inner.status.send_if_modified(|status| {
            let before = status.signature();
            status.can_make_requests = online && status.consecutive_failures < max;
            status.signature() != before
        });
    }

    pub fn is_network_online(&self) -> bool {
        self.inner.network_online.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> HealthStatus {
        self.inner.status.borrow().clone()
    }

    pub fn can_make_requests(&self) -> bool {
        self.inner.status.borrow().can_make_requests
    }

    /// Receives a value only when health, admission or the failure count changes.
    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.inner.status.subscribe()
    }
}

impl Drop for ReachabilityMonitor {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.task.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
