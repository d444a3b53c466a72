use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::{error, info, warn};

use crate::metrics::Metrics;
use crate::payload::Batch;

/// Fixed-delay retry policy for batch delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Pause between a failed attempt and the next one.
    pub delay: Duration,
    /// Timeout applied to each individual attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// Why a batch was not delivered.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The batch could not be encoded. Retrying the same bytes cannot help.
    #[error("serializing batch of {batch_size} payloads: {source}")]
    Serialize {
        batch_size: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Every attempt failed. The runner treats this as fatal.
    #[error("batch of {batch_size} payloads not delivered after {attempts} attempts: {last_error}")]
    Exhausted {
        batch_size: usize,
        attempts: u32,
        last_error: String,
    },
}

impl DispatchError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Result of a successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub attempts: u32,
    pub status: StatusCode,
}

/// Serializes batches and POSTs them downstream with bounded retries.
pub struct Dispatcher {
    client: reqwest::Client,
    endpoint: String,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    /// Creates a dispatcher for `endpoint`, prepending `http://` when the
    /// scheme is missing.
    pub fn new(endpoint: &str, policy: RetryPolicy, metrics: Arc<Metrics>) -> Result<Self> {
        let normalized = normalize_endpoint(endpoint);
        if matches!(normalized, Cow::Owned(_)) {
            warn!(endpoint, "endpoint missing protocol, prepending http://");
        }

        let client = reqwest::Client::builder()
            .timeout(policy.attempt_timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            endpoint: normalized.into_owned(),
            policy,
            metrics,
        })
    }

    /// Returns the normalized endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Delivers one batch, retrying the whole batch on failure.
    pub async fn deliver(&self, batch: &Batch) -> Result<Delivery, DispatchError> {
        let batch_size = batch.len();

        let body = match serde_json::to_vec(batch) {
            Ok(body) => body,
            Err(source) => {
                error!(batch_size, error = %source, "failed to serialize batch");
                self.metrics.batches_abandoned.inc();
                return Err(DispatchError::Serialize { batch_size, source });
            }
        };

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let start = Instant::now();
            let result = self.send(body.clone()).await;
            let duration = start.elapsed();
            self.metrics
                .delivery_duration
                .observe(duration.as_secs_f64());

            match result {
                Ok(status) if status.is_success() => {
                    self.metrics
                        .delivery_attempts
                        .with_label_values(&["success"])
                        .inc();
                    info!(
                        attempt,
                        batch_size,
                        status_code = status.as_u16(),
                        ?duration,
                        "batch forwarded",
                    );
                    return Ok(Delivery {
                        attempts: attempt,
                        status,
                    });
                }
                Ok(status) => {
                    last_error = format!("unexpected status {status}");
                    warn!(
                        attempt,
                        batch_size,
                        status_code = status.as_u16(),
                        ?duration,
                        "batch forwarding attempt rejected",
                    );
                }
                Err(e) => {
                    last_error = format!("{e:#}");
                    warn!(
                        attempt,
                        batch_size,
                        error = %last_error,
                        ?duration,
                        "batch forwarding attempt failed",
                    );
                }
            }

            self.metrics
                .delivery_attempts
                .with_label_values(&["failure"])
                .inc();

            if attempt < max_attempts {
                warn!(
                    retry = attempt,
                    max_attempts,
                    delay = ?self.policy.delay,
                    "retrying batch forwarding",
                );
                tokio::time::sleep(self.policy.delay).await;
            }
        }

        self.metrics.batches_failed.inc();
        error!(
            max_attempts,
            batch_size,
            error = %last_error,
            "failed to forward batch after retries",
        );

        Err(DispatchError::Exhausted {
            batch_size,
            attempts: max_attempts,
            last_error,
        })
    }

    /// Sends one attempt and returns the response status.
    async fn send(&self, body: Vec<u8>) -> Result<StatusCode> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .context("sending batch")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        Ok(status)
    }
}

/// Prepends `http://` to endpoints without an http or https scheme.
pub fn normalize_endpoint(endpoint: &str) -> Cow<'_, str> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Cow::Borrowed(endpoint)
    } else {
        Cow::Owned(format!("http://{endpoint}"))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::Router;
    use tokio::net::TcpListener;

    use super::*;
    use crate::payload::Payload;

    /// Downstream that fails the first `failures` requests with a 503.
    struct Scripted {
        hits: AtomicU32,
        failures: u32,
    }

    async fn scripted_handler(State(s): State<Arc<Scripted>>) -> AxumStatus {
        let n = s.hits.fetch_add(1, Ordering::SeqCst);
        if n < s.failures {
            AxumStatus::SERVICE_UNAVAILABLE
        } else {
            AxumStatus::OK
        }
    }

    async fn spawn_downstream(failures: u32) -> (SocketAddr, Arc<Scripted>) {
        let state = Arc::new(Scripted {
            hits: AtomicU32::new(0),
            failures,
        });
        let app = Router::new()
            .route("/ingest", post(scripted_handler))
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (addr, state)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(50),
            attempt_timeout: Duration::from_secs(2),
        }
    }

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new().expect("metrics"))
    }

    fn one_payload_batch() -> Batch {
        Batch::new(vec![Payload {
            user_id: 7,
            title: "t".to_string(),
            ..Default::default()
        }])
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, Duration::from_secs(2));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("http://a/b"), "http://a/b");
        assert_eq!(normalize_endpoint("https://a/b"), "https://a/b");
        assert_eq!(normalize_endpoint("a:8080/b"), "http://a:8080/b");
        assert!(matches!(normalize_endpoint("https://x"), Cow::Borrowed(_)));
        assert!(matches!(normalize_endpoint("x"), Cow::Owned(_)));
    }

    #[test]
    fn test_dispatch_error_fatality() {
        let exhausted = DispatchError::Exhausted {
            batch_size: 1,
            attempts: 3,
            last_error: "boom".to_string(),
        };
        assert!(exhausted.is_fatal());

        let source = serde_json::from_str::<u8>("x").expect_err("invalid json");
        let serialize = DispatchError::Serialize {
            batch_size: 1,
            source,
        };
        assert!(!serialize.is_fatal());
    }

    #[tokio::test]
    async fn test_deliver_first_attempt_success() {
        let (addr, state) = spawn_downstream(0).await;
        let dispatcher =
            Dispatcher::new(&format!("{addr}/ingest"), fast_policy(), metrics()).expect("new");
        assert!(dispatcher.endpoint().starts_with("http://"));

        let delivery = dispatcher
            .deliver(&one_payload_batch())
            .await
            .expect("delivered");
        assert_eq!(delivery.attempts, 1);
        assert_eq!(delivery.status, StatusCode::OK);
        assert_eq!(state.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deliver_success_short_circuits() {
        let (addr, state) = spawn_downstream(1).await;
        let m = metrics();
        let dispatcher = Dispatcher::new(&format!("http://{addr}/ingest"), fast_policy(), m.clone())
            .expect("new");

        let delivery = dispatcher
            .deliver(&one_payload_batch())
            .await
            .expect("delivered");
        assert_eq!(delivery.attempts, 2);

        // Give a stray third request time to show up if one were sent.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state.hits.load(Ordering::SeqCst), 2);
        assert_eq!(
            m.delivery_attempts.with_label_values(&["failure"]).get(),
            1.0
        );
        assert_eq!(
            m.delivery_attempts.with_label_values(&["success"]).get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_deliver_exhausts_retry_budget() {
        let (addr, state) = spawn_downstream(u32::MAX).await;
        let policy = fast_policy();
        let m = metrics();
        let dispatcher =
            Dispatcher::new(&format!("http://{addr}/ingest"), policy, m.clone()).expect("new");

        let start = Instant::now();
        let err = dispatcher
            .deliver(&one_payload_batch())
            .await
            .expect_err("should exhaust");
        let elapsed = start.elapsed();

        assert!(err.is_fatal());
        match err {
            DispatchError::Exhausted {
                attempts,
                batch_size,
                ref last_error,
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(batch_size, 1);
                assert!(last_error.contains("503"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(state.hits.load(Ordering::SeqCst), 3);
        // Two pauses between three attempts.
        assert!(elapsed >= policy.delay * 2);
        assert_eq!(m.batches_failed.get(), 1.0);
    }

    #[tokio::test]
    async fn test_deliver_transport_error_is_retried() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let dispatcher =
            Dispatcher::new(&format!("http://{addr}/ingest"), fast_policy(), metrics())
                .expect("new");
        let err = dispatcher
            .deliver(&one_payload_batch())
            .await
            .expect_err("should exhaust");
        assert!(matches!(err, DispatchError::Exhausted { attempts: 3, .. }));
    }
}
