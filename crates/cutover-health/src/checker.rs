//! Health check probe logic.
//!
//! A `HealthTracker` turns a stream of raw probe results for one instance
//! into a status: `retries` consecutive failures mark it unhealthy, a
//! single success marks it healthy again.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use cutover_core::{HealthStatus, Instance, InstanceId, ProbeConfig};
use cutover_platform::BoxFuture;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

/// Tracks consecutive probe results for a single instance.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Threshold before marking unhealthy.
    unhealthy_threshold: u32,
    /// Successes needed to recover from unhealthy.
    healthy_threshold: u32,
}

impl HealthTracker {
    /// Create a new tracker from a probe config.
    pub fn new(config: &ProbeConfig) -> Self {
        Self::with_thresholds(config.retries.max(1), 1)
    }

    /// Create a tracker with custom thresholds.
    pub fn with_thresholds(unhealthy_threshold: u32, healthy_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold,
            healthy_threshold,
        }
    }

    /// Record a probe result and return the new health status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        match result {
            ProbeResult::Healthy => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;

                if self.consecutive_successes >= self.healthy_threshold {
                    if self.status != HealthStatus::Healthy {
                        debug!(
                            successes = self.consecutive_successes,
                            "instance became healthy"
                        );
                    }
                    self.status = HealthStatus::Healthy;
                }
            }
            ProbeResult::Unhealthy | ProbeResult::Failed => {
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;

                if self.consecutive_failures >= self.unhealthy_threshold {
                    if self.status != HealthStatus::Unhealthy {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.unhealthy_threshold,
                            "instance marked unhealthy"
                        );
                    }
                    self.status = HealthStatus::Unhealthy;
                }
            }
        }

        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Something that can check one instance.
pub trait Probe: Send + Sync {
    fn probe<'a>(&'a self, instance: &'a Instance, config: &'a ProbeConfig)
    -> BoxFuture<'a, ProbeResult>;
}

/// Probes `GET http://{address}{path}`.
#[derive(Debug, Default, Clone)]
pub struct HttpProbe;

impl Probe for HttpProbe {
    fn probe<'a>(
        &'a self,
        instance: &'a Instance,
        config: &'a ProbeConfig,
    ) -> BoxFuture<'a, ProbeResult> {
        Box::pin(http_probe(&instance.address, &config.path, config.timeout))
    }
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "cutover-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    ProbeResult::Healthy
                } else {
                    debug!(status = %resp.status(), %uri, "health probe non-2xx");
                    ProbeResult::Unhealthy
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}

/// Deterministic probe: a default verdict plus per-instance overrides.
///
/// Backs the daemon's simulated platform mode and the test suites.
#[derive(Debug)]
pub struct ScriptedProbe {
    default: Mutex<ProbeResult>,
    overrides: Mutex<HashMap<InstanceId, ProbeResult>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn always(result: ProbeResult) -> Self {
        Self {
            default: Mutex::new(result),
            overrides: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_default(&self, result: ProbeResult) {
        *self.default.lock().expect("default lock") = result;
    }

    pub fn set_instance(&self, instance_id: &str, result: ProbeResult) {
        self.overrides
            .lock()
            .expect("overrides lock")
            .insert(instance_id.to_string(), result);
    }

    /// Total probes answered.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Probe for ScriptedProbe {
    fn probe<'a>(
        &'a self,
        instance: &'a Instance,
        _config: &'a ProbeConfig,
    ) -> BoxFuture<'a, ProbeResult> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let result = self
            .overrides
            .lock()
            .expect("overrides lock")
            .get(&instance.id)
            .copied()
            .unwrap_or_else(|| *self.default.lock().expect("default lock"));
        Box::pin(async move { result })
    }
}
