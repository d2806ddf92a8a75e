//! Outbound federation transport.
//!
//! [`FederationTransport`] is the wire-facing collaborator: membership
//! handshakes, missing-event fetches and backfill against remote servers.
//! [`RetryingTransport`] layers exponential backoff with jitter on top, and
//! short-circuits destinations that are inside a failure backoff window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use rand::Rng;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use lattica_entity::types::{Event, Membership, RoomVersion};
use lattica_entity::utils::canonical_json::canonical_json;

use crate::config::RetryConfig;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{destination} returned {status}: {message}")]
    Http { destination: String, status: u16, message: String },
    #[error("could not reach {destination}: {message}")]
    Unreachable { destination: String, message: String },
    #[error("not retrying {destination}, backoff ends in {retry_after_ms}ms")]
    NotRetryingDestination { destination: String, retry_after_ms: u64 },
    #[error("bad response from {destination}: {message}")]
    BadResponse { destination: String, message: String },
}

impl TransportError {
    /// Transient failures are worth retrying; 4xx responses other than 429
    /// are the remote telling us no.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Unreachable { .. } => true,
            Self::NotRetryingDestination { .. } => false,
            Self::BadResponse { .. } => false,
        }
    }
}

/// Prototype event returned by a remote from `make_*` membership handshakes.
#[derive(Debug, Clone)]
pub struct MembershipTemplate {
    pub room_version: RoomVersion,
    pub event: Value,
}

/// Room snapshot returned from a successful `send_join`.
#[derive(Debug, Clone)]
pub struct JoinResponse {
    pub state: Vec<Event>,
    pub auth_chain: Vec<Event>,
    pub origin: String,
}

#[async_trait]
pub trait FederationTransport: Send + Sync {
    /// Ask `destination` for a prototype membership event for `user_id`.
    async fn make_membership_event(
        &self,
        destination: &str,
        room_id: &str,
        user_id: &str,
        membership: Membership,
    ) -> Result<MembershipTemplate, TransportError>;

    /// Submit a signed join event; on success the remote returns the room's
    /// current state and its auth chain.
    async fn send_join(
        &self,
        destination: &str,
        room_id: &str,
        event: &Event,
    ) -> Result<JoinResponse, TransportError>;

    async fn send_leave(
        &self,
        destination: &str,
        room_id: &str,
        event: &Event,
    ) -> Result<(), TransportError>;

    /// Submit a signed knock; returns stripped state events for the room.
    async fn send_knock(
        &self,
        destination: &str,
        room_id: &str,
        event: &Event,
    ) -> Result<Vec<Value>, TransportError>;

    /// Hand an invite to the invitee's server for countersigning.
    async fn send_invite(
        &self,
        destination: &str,
        room_id: &str,
        room_version: &RoomVersion,
        event: &Event,
    ) -> Result<Event, TransportError>;

    /// Events on paths between `earliest` and `latest` that we are missing.
    async fn get_missing_events(
        &self,
        destination: &str,
        room_id: &str,
        earliest: &[String],
        latest: &[String],
        limit: u32,
    ) -> Result<Vec<Event>, TransportError>;

    /// Fetch up to `limit` events of history before `event_ids`.
    async fn backfill(
        &self,
        destination: &str,
        room_id: &str,
        event_ids: &[String],
        limit: u32,
    ) -> Result<Vec<Event>, TransportError>;

    async fn get_event(
        &self,
        destination: &str,
        event_id: &str,
    ) -> Result<Event, TransportError>;
}

struct DestinationBackoff {
    consecutive_failures: u32,
    retry_at: Instant,
}

/// Wraps a transport with per-call retries and per-destination backoff
/// windows. A destination that keeps failing is short-circuited locally
/// until its window expires.
pub struct RetryingTransport {
    inner: Arc<dyn FederationTransport>,
    config: RetryConfig,
    backoff: Mutex<HashMap<String, DestinationBackoff>>,
}

impl RetryingTransport {
    pub fn new(inner: Arc<dyn FederationTransport>, config: RetryConfig) -> Self {
        Self { inner, config, backoff: Mutex::new(HashMap::new()) }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponential = self.config.base_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = exponential.min(self.config.max_delay_ms as f64);
        let jitter = capped * self.config.jitter_factor * rand::rng().random_range(0.0..1.0);
        Duration::from_millis((capped + jitter) as u64)
    }

    async fn check_destination(&self, destination: &str) -> Result<(), TransportError> {
        let backoff = self.backoff.lock().await;
        if let Some(state) = backoff.get(destination) {
            let now = Instant::now();
            if state.retry_at > now {
                return Err(TransportError::NotRetryingDestination {
                    destination: destination.to_string(),
                    retry_after_ms: (state.retry_at - now).as_millis() as u64,
                });
            }
        }
        Ok(())
    }

    async fn record_outcome(&self, destination: &str, outcome: Result<(), &TransportError>) {
        let mut backoff = self.backoff.lock().await;
        match outcome {
            Ok(()) => {
                backoff.remove(destination);
            },
            Err(error) if error.is_transient() => {
                let entry = backoff.entry(destination.to_string()).or_insert(
                    DestinationBackoff { consecutive_failures: 0, retry_at: Instant::now() },
                );
                entry.consecutive_failures += 1;
                let delay = self.delay_for_attempt(entry.consecutive_failures);
                entry.retry_at = Instant::now() + delay;
                warn!(
                    destination,
                    failures = entry.consecutive_failures,
                    backoff_ms = delay.as_millis() as u64,
                    "destination entering backoff window"
                );
            },
            Err(_) => {},
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        destination: &str,
        mut call: F,
    ) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, TransportError>>,
    {
        self.check_destination(destination).await?;

        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => {
                    self.record_outcome(destination, Ok(())).await;
                    return Ok(value);
                },
                Err(error) => {
                    if !error.is_transient() || attempt >= self.config.max_retries {
                        self.record_outcome(destination, Err(&error)).await;
                        return Err(error);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    debug!(
                        destination,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "retrying federation request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
            }
        }
    }
}

#[async_trait]
impl FederationTransport for RetryingTransport {
    async fn make_membership_event(
        &self,
        destination: &str,
        room_id: &str,
        user_id: &str,
        membership: Membership,
    ) -> Result<MembershipTemplate, TransportError> {
        self.with_retry(destination, || {
            self.inner.make_membership_event(destination, room_id, user_id, membership)
        })
        .await
    }

    async fn send_join(
        &self,
        destination: &str,
        room_id: &str,
        event: &Event,
    ) -> Result<JoinResponse, TransportError> {
        self.with_retry(destination, || self.inner.send_join(destination, room_id, event))
            .await
    }

    async fn send_leave(
        &self,
        destination: &str,
        room_id: &str,
        event: &Event,
    ) -> Result<(), TransportError> {
        self.with_retry(destination, || self.inner.send_leave(destination, room_id, event))
            .await
    }

    async fn send_knock(
        &self,
        destination: &str,
        room_id: &str,
        event: &Event,
    ) -> Result<Vec<Value>, TransportError> {
        self.with_retry(destination, || self.inner.send_knock(destination, room_id, event))
            .await
    }

    async fn send_invite(
        &self,
        destination: &str,
        room_id: &str,
        room_version: &RoomVersion,
        event: &Event,
    ) -> Result<Event, TransportError> {
        self.with_retry(destination, || {
            self.inner.send_invite(destination, room_id, room_version, event)
        })
        .await
    }

    async fn get_missing_events(
        &self,
        destination: &str,
        room_id: &str,
        earliest: &[String],
        latest: &[String],
        limit: u32,
    ) -> Result<Vec<Event>, TransportError> {
        self.with_retry(destination, || {
            self.inner.get_missing_events(destination, room_id, earliest, latest, limit)
        })
        .await
    }

    async fn backfill(
        &self,
        destination: &str,
        room_id: &str,
        event_ids: &[String],
        limit: u32,
    ) -> Result<Vec<Event>, TransportError> {
        self.with_retry(destination, || {
            self.inner.backfill(destination, room_id, event_ids, limit)
        })
        .await
    }

    async fn get_event(
        &self,
        destination: &str,
        event_id: &str,
    ) -> Result<Event, TransportError> {
        self.with_retry(destination, || self.inner.get_event(destination, event_id))
            .await
    }
}

/// HTTPS transport speaking the server-server API with `X-Matrix` request
/// authentication.
pub struct MatrixFederationClient {
    http: reqwest::Client,
    origin: String,
    key_id: String,
    signing_key: SigningKey,
}

impl MatrixFederationClient {
    pub fn new(
        origin: impl Into<String>,
        key_id: impl Into<String>,
        signing_key: SigningKey,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Unreachable {
                destination: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            origin: origin.into(),
            key_id: key_id.into(),
            signing_key,
        })
    }

    /// `X-Matrix` authorization header: an ed25519 signature over the
    /// canonical JSON of `{method, uri, origin, destination, content?}`.
    fn auth_header(
        &self,
        method: &str,
        uri: &str,
        destination: &str,
        content: Option<&Value>,
    ) -> Result<String, TransportError> {
        let mut request = json!({
            "method": method,
            "uri": uri,
            "origin": self.origin,
            "destination": destination,
        });
        if let Some(content) = content {
            request["content"] = content.clone();
        }

        let canonical = canonical_json(&request).map_err(|e| TransportError::BadResponse {
            destination: destination.to_string(),
            message: e.to_string(),
        })?;
        let signature = STANDARD_NO_PAD.encode(self.signing_key.sign(canonical.as_bytes()).to_bytes());

        Ok(format!(
            "X-Matrix origin=\"{}\",destination=\"{}\",key=\"{}\",sig=\"{}\"",
            self.origin, destination, self.key_id, signature
        ))
    }

    async fn request(
        &self,
        method: reqwest::Method,
        destination: &str,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, TransportError> {
        let url = format!("https://{destination}{path}");
        let header = self.auth_header(method.as_str(), path, destination, body.as_ref())?;

        let mut builder = self
            .http
            .request(method, &url)
            .header("Authorization", header);
        if let Some(body) = &body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| TransportError::Unreachable {
            destination: destination.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                destination: destination.to_string(),
                status: status.as_u16(),
                message,
            });
        }

        response.json().await.map_err(|e| TransportError::BadResponse {
            destination: destination.to_string(),
            message: e.to_string(),
        })
    }

    fn parse_events(
        destination: &str,
        value: Option<&Value>,
    ) -> Result<Vec<Event>, TransportError> {
        let Some(array) = value.and_then(Value::as_array) else {
            return Ok(Vec::new());
        };
        array
            .iter()
            .map(|pdu| {
                serde_json::from_value(pdu.clone()).map_err(|e| TransportError::BadResponse {
                    destination: destination.to_string(),
                    message: format!("bad PDU: {e}"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl FederationTransport for MatrixFederationClient {
    async fn make_membership_event(
        &self,
        destination: &str,
        room_id: &str,
        user_id: &str,
        membership: Membership,
    ) -> Result<MembershipTemplate, TransportError> {
        let kind = match membership {
            Membership::Join => "make_join",
            Membership::Leave => "make_leave",
            Membership::Knock => "make_knock",
            _ => {
                return Err(TransportError::BadResponse {
                    destination: destination.to_string(),
                    message: format!("no make handshake for membership {}", membership.as_str()),
                })
            },
        };
        let path = format!("/_matrix/federation/v1/{kind}/{room_id}/{user_id}");
        let body = self.request(reqwest::Method::GET, destination, &path, None).await?;

        let room_version = body
            .get("room_version")
            .and_then(Value::as_str)
            .and_then(RoomVersion::parse)
            .unwrap_or(RoomVersion::V1);
        let event = body.get("event").cloned().ok_or_else(|| TransportError::BadResponse {
            destination: destination.to_string(),
            message: "make response missing event template".to_string(),
        })?;

        info!(destination, room_id, kind, "membership template received");
        Ok(MembershipTemplate { room_version, event })
    }

    async fn send_join(
        &self,
        destination: &str,
        room_id: &str,
        event: &Event,
    ) -> Result<JoinResponse, TransportError> {
        let path = format!("/_matrix/federation/v2/send_join/{room_id}/{}", event.event_id);
        let body = serde_json::to_value(event).map_err(|e| TransportError::BadResponse {
            destination: destination.to_string(),
            message: e.to_string(),
        })?;
        let response =
            self.request(reqwest::Method::PUT, destination, &path, Some(body)).await?;

        Ok(JoinResponse {
            state: Self::parse_events(destination, response.get("state"))?,
            auth_chain: Self::parse_events(destination, response.get("auth_chain"))?,
            origin: response
                .get("origin")
                .and_then(Value::as_str)
                .unwrap_or(destination)
                .to_string(),
        })
    }

    async fn send_leave(
        &self,
        destination: &str,
        room_id: &str,
        event: &Event,
    ) -> Result<(), TransportError> {
        let path = format!("/_matrix/federation/v2/send_leave/{room_id}/{}", event.event_id);
        let body = serde_json::to_value(event).map_err(|e| TransportError::BadResponse {
            destination: destination.to_string(),
            message: e.to_string(),
        })?;
        self.request(reqwest::Method::PUT, destination, &path, Some(body)).await?;
        Ok(())
    }

    async fn send_knock(
        &self,
        destination: &str,
        room_id: &str,
        event: &Event,
    ) -> Result<Vec<Value>, TransportError> {
        let path = format!("/_matrix/federation/v1/send_knock/{room_id}/{}", event.event_id);
        let body = serde_json::to_value(event).map_err(|e| TransportError::BadResponse {
            destination: destination.to_string(),
            message: e.to_string(),
        })?;
        let response =
            self.request(reqwest::Method::PUT, destination, &path, Some(body)).await?;

        Ok(response
            .get("knock_room_state")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_invite(
        &self,
        destination: &str,
        room_id: &str,
        room_version: &RoomVersion,
        event: &Event,
    ) -> Result<Event, TransportError> {
        let path = format!("/_matrix/federation/v2/invite/{room_id}/{}", event.event_id);
        let body = json!({
            "room_version": room_version.as_str(),
            "event": serde_json::to_value(event).map_err(|e| TransportError::BadResponse {
                destination: destination.to_string(),
                message: e.to_string(),
            })?,
        });
        let response =
            self.request(reqwest::Method::PUT, destination, &path, Some(body)).await?;

        let signed = response.get("event").cloned().ok_or_else(|| {
            TransportError::BadResponse {
                destination: destination.to_string(),
                message: "invite response missing signed event".to_string(),
            }
        })?;
        serde_json::from_value(signed).map_err(|e| TransportError::BadResponse {
            destination: destination.to_string(),
            message: format!("bad signed invite: {e}"),
        })
    }

    async fn get_missing_events(
        &self,
        destination: &str,
        room_id: &str,
        earliest: &[String],
        latest: &[String],
        limit: u32,
    ) -> Result<Vec<Event>, TransportError> {
        let path = format!("/_matrix/federation/v1/get_missing_events/{room_id}");
        let body = json!({
            "earliest_events": earliest,
            "latest_events": latest,
            "limit": limit,
        });
        let response =
            self.request(reqwest::Method::POST, destination, &path, Some(body)).await?;
        Self::parse_events(destination, response.get("events"))
    }

    async fn backfill(
        &self,
        destination: &str,
        room_id: &str,
        event_ids: &[String],
        limit: u32,
    ) -> Result<Vec<Event>, TransportError> {
        let query: Vec<String> = event_ids.iter().map(|id| format!("v={id}")).collect();
        let path = format!(
            "/_matrix/federation/v1/backfill/{room_id}?limit={limit}&{}",
            query.join("&")
        );
        let response = self.request(reqwest::Method::GET, destination, &path, None).await?;
        Self::parse_events(destination, response.get("pdus"))
    }

    async fn get_event(
        &self,
        destination: &str,
        event_id: &str,
    ) -> Result<Event, TransportError> {
        let path = format!("/_matrix/federation/v1/event/{event_id}");
        let response = self.request(reqwest::Method::GET, destination, &path, None).await?;

        let pdus = Self::parse_events(destination, response.get("pdus"))?;
        pdus.into_iter().next().ok_or_else(|| TransportError::BadResponse {
            destination: destination.to_string(),
            message: format!("remote has no event {event_id}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyTransport {
        calls: AtomicU32,
        fail_first: u32,
        status: u16,
    }

    #[async_trait]
    impl FederationTransport for FlakyTransport {
        async fn make_membership_event(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: Membership,
        ) -> Result<MembershipTemplate, TransportError> {
            unimplemented!()
        }

        async fn send_join(&self, _: &str, _: &str, _: &Event) -> Result<JoinResponse, TransportError> {
            unimplemented!()
        }

        async fn send_leave(&self, _: &str, _: &str, _: &Event) -> Result<(), TransportError> {
            unimplemented!()
        }

        async fn send_knock(&self, _: &str, _: &str, _: &Event) -> Result<Vec<Value>, TransportError> {
            unimplemented!()
        }

        async fn send_invite(
            &self,
            _: &str,
            _: &str,
            _: &RoomVersion,
            _: &Event,
        ) -> Result<Event, TransportError> {
            unimplemented!()
        }

        async fn get_missing_events(
            &self,
            _: &str,
            _: &str,
            _: &[String],
            _: &[String],
            _: u32,
        ) -> Result<Vec<Event>, TransportError> {
            unimplemented!()
        }

        async fn backfill(
            &self,
            destination: &str,
            _: &str,
            _: &[String],
            _: u32,
        ) -> Result<Vec<Event>, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(TransportError::Http {
                    destination: destination.to_string(),
                    status: self.status,
                    message: "boom".to_string(),
                })
            } else {
                Ok(Vec::new())
            }
        }

        async fn get_event(&self, _: &str, _: &str) -> Result<Event, TransportError> {
            unimplemented!()
        }
    }

    fn fast_retry_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let inner = Arc::new(FlakyTransport {
            calls: AtomicU32::new(0),
            fail_first: 2,
            status: 503,
        });
        let transport = RetryingTransport::new(inner.clone(), fast_retry_config());

        transport.backfill("remote.org", "!r:x", &[], 10).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let inner = Arc::new(FlakyTransport {
            calls: AtomicU32::new(0),
            fail_first: 10,
            status: 403,
        });
        let transport = RetryingTransport::new(inner.clone(), fast_retry_config());

        let result = transport.backfill("remote.org", "!r:x", &[], 10).await;
        assert!(matches!(result, Err(TransportError::Http { status: 403, .. })));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_destination_enters_backoff_window() {
        let inner = Arc::new(FlakyTransport {
            calls: AtomicU32::new(0),
            fail_first: 100,
            status: 503,
        });
        // One attempt, then a window comfortably longer than the test.
        let config = RetryConfig {
            max_retries: 0,
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..fast_retry_config()
        };
        let transport = RetryingTransport::new(inner, config);

        let first = transport.backfill("remote.org", "!r:x", &[], 10).await;
        assert!(matches!(first, Err(TransportError::Http { .. })));

        // The window now short-circuits without touching the wire.
        let second = transport.backfill("remote.org", "!r:x", &[], 10).await;
        assert!(matches!(second, Err(TransportError::NotRetryingDestination { .. })));
    }

    #[test]
    fn backoff_delay_grows_and_caps() {
        let transport = RetryingTransport::new(
            Arc::new(FlakyTransport { calls: AtomicU32::new(0), fail_first: 0, status: 0 }),
            RetryConfig {
                max_retries: 5,
                base_delay_ms: 100,
                max_delay_ms: 1000,
                backoff_multiplier: 2.0,
                jitter_factor: 0.0,
            },
        );

        assert_eq!(transport.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(transport.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(transport.delay_for_attempt(10), Duration::from_millis(1000));
    }
}
