//! # Transmitter Module
//!
//! Single-attempt delivery of one coordinate to the remote collector.
//!
//! The [`Transmitter`] never retries: retry policy belongs to the sync engine.
//! Every attempt, successful or not, is reported to the [`NetworkOracle`].
//!
//! A request counts as delivered when the collector answers with a 2xx
//! status, or with a bare `1` body as some deployments do.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::coordinate::{Coordinate, TelemetryPayload};
use crate::credential::Credential;
use crate::error::{Result, TelemetryError};
use crate::network::{NetworkOracle, ReachabilityProbe};

/// Raw answer from the collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Bytes,
}

impl HttpReply {
    /// 2xx, or a body consisting of `1`.
    pub fn is_delivered(&self) -> bool {
        (200..300).contains(&self.status) || self.body.trim_ascii() == b"1"
    }
}

/// Trait for the HTTP layer underneath the transmitter.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST one telemetry object with bearer authentication.
    ///
    /// Returns `Err` only when no HTTP response was obtained.
    async fn post_coordinate(
        &self,
        payload: &TelemetryPayload<'_>,
        credential: &Credential,
    ) -> Result<HttpReply>;
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitOutcome {
    pub success: bool,
    /// Present when the request reached the collector.
    pub http_status: Option<u16>,
}

/// Real transport using reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    url: String,
    probe_url: String,
}

impl ReqwestTransport {
    /// Creates a transport posting to `url` and probing `probe_url`.
    pub fn new(url: &str, probe_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("course-telemetry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TelemetryError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.to_string(),
            probe_url: probe_url.to_string(),
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post_coordinate(
        &self,
        payload: &TelemetryPayload<'_>,
        credential: &Credential,
    ) -> Result<HttpReply> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(credential.token())
            .json(payload)
            .send()
            .await
            .map_err(|e| TelemetryError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        // The status alone decides most outcomes; an unreadable body is empty.
        let body = response.bytes().await.unwrap_or_default();
        Ok(HttpReply { status, body })
    }
}

#[async_trait]
impl ReachabilityProbe for ReqwestTransport {
    async fn probe(&self) -> Result<u16> {
        let response = self
            .client
            .get(&self.probe_url)
            .send()
            .await
            .map_err(|e| TelemetryError::Transport(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

/// Delivers coordinates and reports outcomes to the oracle.
pub struct Transmitter {
    transport: Arc<dyn Transport>,
    oracle: Arc<NetworkOracle>,
    timeout: Duration,
}

impl Transmitter {
    pub fn new(transport: Arc<dyn Transport>, oracle: Arc<NetworkOracle>, timeout: Duration) -> Self {
        Self {
            transport,
            oracle,
            timeout,
        }
    }

    pub fn oracle(&self) -> &Arc<NetworkOracle> {
        &self.oracle
    }

    /// One bounded delivery attempt for `coordinate`.
    pub async fn transmit(&self, coordinate: &Coordinate, credential: &Credential) -> TransmitOutcome {
        let payload = coordinate.payload();
        let attempt = tokio::time::timeout(
            self.timeout,
            self.transport.post_coordinate(&payload, credential),
        )
        .await;

        let outcome = match attempt {
            Ok(Ok(reply)) => TransmitOutcome {
                success: reply.is_delivered(),
                http_status: Some(reply.status),
            },
            Ok(Err(e)) => {
                debug!("Coordinate {} not sent: {}", coordinate.id(), e);
                TransmitOutcome {
                    success: false,
                    http_status: None,
                }
            }
            Err(_) => {
                debug!("Coordinate {} timed out after {:?}", coordinate.id(), self.timeout);
                TransmitOutcome {
                    success: false,
                    http_status: None,
                }
            }
        };

        if outcome.success {
            debug!(
                "Delivered coordinate {} (uit {}, status {})",
                coordinate.id(),
                coordinate.uit(),
                coordinate.status()
            );
            self.oracle.report_success();
        } else {
            self.oracle.report_failure(outcome.http_status);
        }
        outcome
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted transport reply.
    #[derive(Debug, Clone)]
    pub enum Reply {
        Status(u16, &'static str),
        NoResponse,
        /// Never answers within any reasonable timeout.
        Hang,
    }

    /// Mock transport recording every request it receives.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        /// (uit, status code, timestamp) per request, in arrival order.
        pub requests: Arc<Mutex<Vec<(String, u8, String)>>>,
        /// Per-request script; falls back to `default_reply` when empty.
        pub script: Arc<Mutex<VecDeque<Reply>>>,
        pub default_reply: Arc<Mutex<Option<Reply>>>,
        /// Artificial latency applied before replying.
        pub delay: Arc<Mutex<Option<Duration>>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn always(reply: Reply) -> Self {
            let mock = Self::new();
            mock.set_default(reply);
            mock
        }

        pub fn set_default(&self, reply: Reply) {
            *self.default_reply.lock().unwrap() = Some(reply);
        }

        pub fn push(&self, replies: impl IntoIterator<Item = Reply>) {
            self.script.lock().unwrap().extend(replies);
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn requested_uits(&self) -> Vec<String> {
            self.requests.lock().unwrap().iter().map(|r| r.0.clone()).collect()
        }

        fn next_reply(&self) -> Reply {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .or_else(|| self.default_reply.lock().unwrap().clone())
                .unwrap_or(Reply::Status(200, ""))
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn post_coordinate(
            &self,
            payload: &TelemetryPayload<'_>,
            _credential: &Credential,
        ) -> Result<HttpReply> {
            self.requests.lock().unwrap().push((
                payload.uit.to_string(),
                payload.status,
                payload.timestamp.to_string(),
            ));
            let reply = self.next_reply();
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match reply {
                Reply::Status(status, body) => Ok(HttpReply {
                    status,
                    body: Bytes::from_static(body.as_bytes()),
                }),
                Reply::NoResponse => Err(TelemetryError::Transport("connection refused".to_string())),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(TelemetryError::Transport("hung".to_string()))
                }
            }
        }
    }
}
