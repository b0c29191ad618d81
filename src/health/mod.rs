//! HTTP health probes, bounded polling, and cancellable background monitors.
//!
//! A probe never errors: network failures, timeouts and non-2xx responses all
//! count as unhealthy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback invoked with the outcome of every monitor poll.
pub type HealthCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct Monitor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct HealthChecker {
    client: reqwest::Client,
    monitors: Arc<Mutex<HashMap<String, Monitor>>>,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl HealthChecker {
    pub fn new(probe_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .no_proxy()
            .build()
            .unwrap_or_default();
        Self {
            client,
            monitors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn monitors(&self) -> MutexGuard<'_, HashMap<String, Monitor>> {
        self.monitors.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One GET; healthy iff the status is 2xx.
    pub async fn check_once(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) => {
                let ok = resp.status().is_success();
                tracing::debug!("Health probe {} -> {}", url, resp.status());
                ok
            }
            Err(e) => {
                tracing::debug!("Health probe {} failed: {}", url, e);
                false
            }
        }
    }

    /// Poll `url` every `poll_interval` until it answers 2xx or `timeout`
    /// elapses. Each probe is cut short at the deadline.
    pub async fn wait_until_healthy(
        &self,
        url: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let attempt_started = Instant::now();
            let remaining = deadline.saturating_duration_since(attempt_started);
            if remaining.is_zero() {
                return false;
            }

            match tokio::time::timeout(remaining, self.check_once(url)).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(_) => return false,
            }

            // 다음 폴링 시각은 시도 시작 기준, 간격보다 빨리 폴링하지 않음
            let next_poll = attempt_started + poll_interval;
            if next_poll >= deadline {
                tokio::time::sleep_until(deadline).await;
                return false;
            }
            tokio::time::sleep_until(next_poll).await;
        }
    }

    /// Start polling `url` every `interval` in the background, calling
    /// `on_status_change` with every result. Replaces any monitor under `key`.
    pub fn start_monitoring(
        &self,
        key: &str,
        url: String,
        interval: Duration,
        on_status_change: HealthCallback,
    ) {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let checker = self.clone();
        let task_key = key.to_string();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let healthy = tokio::select! {
                    _ = task_token.cancelled() => break,
                    healthy = checker.check_once(&url) => healthy,
                };
                // 취소 이후에 끝난 결과는 전달하지 않음
                if task_token.is_cancelled() {
                    break;
                }
                on_status_change(healthy);
            }
            tracing::debug!("Health monitor for '{}' exited", task_key);
        });

        let previous = self
            .monitors()
            .insert(key.to_string(), Monitor { token, handle });
        if let Some(old) = previous {
            tracing::debug!("Replacing existing health monitor for '{}'", key);
            old.token.cancel();
            old.handle.abort();
        }
        tracing::info!("Health monitoring started for '{}'", key);
    }

    /// Safe to call for keys without a monitor.
    pub fn stop_monitoring(&self, key: &str) {
        if let Some(monitor) = self.monitors().remove(key) {
            monitor.token.cancel();
            monitor.handle.abort();
            tracing::info!("Health monitoring stopped for '{}'", key);
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<(String, Monitor)> = self.monitors().drain().collect();
        for (key, monitor) in drained {
            monitor.token.cancel();
            monitor.handle.abort();
            tracing::debug!("Health monitoring stopped for '{}'", key);
        }
    }

    pub fn is_monitoring(&self, key: &str) -> bool {
        self.monitors().contains_key(key)
    }

    pub fn monitored_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.monitors().keys().cloned().collect();
        keys.sort();
        keys
    }
}
