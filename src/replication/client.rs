//! HTTP Replication Client
//!
//! Connection-pooled client for the peer-to-peer verbs, with a per-peer
//! circuit breaker. A peer that fails repeatedly within a short window is
//! quarantined: it is skipped when new primaries pick their replica set
//! until the quarantine lapses.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;

use super::{ReplicaTransport, HDR_END, HDR_HASH, HDR_OWNER, HDR_START, VERB_HEARTBEAT, VERB_INITIALIZE, VERB_REPLICATE};
use crate::config::ReplicationConfig;
use crate::error::{Error, Result};

/// Per-peer failure bookkeeping
#[derive(Debug, Default)]
struct PeerBreaker {
    consecutive_failures: u32,
    window_start: Option<Instant>,
    quarantined_until: Option<Instant>,
}

/// Replication client over HTTP
pub struct HttpReplicationClient {
    http: reqwest::Client,
    breakers: Mutex<HashMap<String, PeerBreaker>>,
    failure_threshold: u32,
    failure_window: Duration,
    quarantine: Duration,
}

impl HttpReplicationClient {
    pub fn new(config: &ReplicationConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Internal(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            breakers: Mutex::new(HashMap::new()),
            failure_threshold: config.peer_failure_threshold,
            failure_window: config.peer_failure_window(),
            quarantine: config.peer_quarantine(),
        })
    }

    fn url(peer: &str, namespace: &str, fid: &str) -> String {
        format!("http://{}/{}/{}", peer, namespace, fid)
    }

    /// Record a successful call; closes the breaker
    fn record_success(&self, peer: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        breakers.remove(peer);
    }

    /// Record a failed call; opens the breaker at the threshold
    fn record_failure(&self, peer: &str) {
        let now = Instant::now();
        let mut breakers = self.breakers.lock().unwrap();
        let breaker = breakers.entry(peer.to_string()).or_default();

        // Failures outside the window start a fresh streak.
        match breaker.window_start {
            Some(start) if now.duration_since(start) <= self.failure_window => {
                breaker.consecutive_failures += 1;
            }
            _ => {
                breaker.window_start = Some(now);
                breaker.consecutive_failures = 1;
            }
        }

        if breaker.consecutive_failures >= self.failure_threshold {
            tracing::warn!(
                peer,
                failures = breaker.consecutive_failures,
                "peer quarantined for {:?}",
                self.quarantine
            );
            breaker.quarantined_until = Some(now + self.quarantine);
            breaker.consecutive_failures = 0;
            breaker.window_start = None;
        }
    }

    /// Issue one verb and translate the response status
    async fn call(
        &self,
        method: Method,
        peer: &str,
        url: String,
        build: impl FnOnce(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    ) -> Result<()> {
        let request = build(self.http.request(method, url));
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                self.record_failure(peer);
                return Err(Error::PeerUnreachable {
                    address: peer.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let status = response.status().as_u16();
        match status {
            200..=299 => {
                self.record_success(peer);
                Ok(())
            }
            404 => {
                // Protocol-level answer; the peer itself is fine.
                self.record_success(peer);
                Err(Error::ReplicaNotFound(peer.to_string()))
            }
            409 => {
                self.record_success(peer);
                let body = response.text().await.unwrap_or_default();
                Err(Error::Replication(format!(
                    "peer {} rejected append: {}",
                    peer, body
                )))
            }
            _ => {
                self.record_failure(peer);
                Err(Error::Replication(format!(
                    "peer {} returned status {}",
                    peer, status
                )))
            }
        }
    }
}

#[async_trait]
impl ReplicaTransport for HttpReplicationClient {
    async fn initialize(&self, peer: &str, namespace: &str, fid: &str, owner: &str) -> Result<()> {
        let method = Method::from_bytes(VERB_INITIALIZE.as_bytes()).expect("valid verb");
        let owner = owner.to_string();
        self.call(method, peer, Self::url(peer, namespace, fid), move |r| {
            r.header(HDR_OWNER, owner)
        })
        .await
    }

    async fn replicate(
        &self,
        peer: &str,
        namespace: &str,
        fid: &str,
        start: u64,
        end: u64,
        hash: u32,
        body: Bytes,
    ) -> Result<()> {
        let method = Method::from_bytes(VERB_REPLICATE.as_bytes()).expect("valid verb");
        self.call(method, peer, Self::url(peer, namespace, fid), move |r| {
            r.header(HDR_START, start)
                .header(HDR_END, end)
                .header(HDR_HASH, hash)
                .body(body)
        })
        .await
    }

    async fn heartbeat(&self, peer: &str, namespace: &str, fid: &str, owner: &str) -> Result<()> {
        let method = Method::from_bytes(VERB_HEARTBEAT.as_bytes()).expect("valid verb");
        let owner = owner.to_string();
        self.call(method, peer, Self::url(peer, namespace, fid), move |r| {
            r.header(HDR_OWNER, owner)
        })
        .await
    }

    async fn delete(&self, peer: &str, namespace: &str, fid: &str) -> Result<()> {
        self.call(Method::DELETE, peer, Self::url(peer, namespace, fid), |r| r)
            .await
    }

    fn is_available(&self, peer: &str) -> bool {
        let mut breakers = self.breakers.lock().unwrap();
        if let Some(breaker) = breakers.get_mut(peer) {
            if let Some(until) = breaker.quarantined_until {
                if Instant::now() < until {
                    return false;
                }
                breaker.quarantined_until = None;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(threshold: u32, window_secs: u64, quarantine_secs: u64) -> HttpReplicationClient {
        HttpReplicationClient::new(&ReplicationConfig {
            peer_failure_threshold: threshold,
            peer_failure_window_secs: window_secs,
            peer_quarantine_secs: quarantine_secs,
            connect_timeout_secs: 1,
            request_timeout_secs: 1,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_breaker_opens_at_threshold() {
        let client = test_client(3, 60, 300);
        assert!(client.is_available("peer-a:7420"));

        client.record_failure("peer-a:7420");
        client.record_failure("peer-a:7420");
        assert!(client.is_available("peer-a:7420"));

        client.record_failure("peer-a:7420");
        assert!(!client.is_available("peer-a:7420"));
        // Other peers are unaffected.
        assert!(client.is_available("peer-b:7420"));
    }

    #[tokio::test]
    async fn test_success_resets_streak() {
        let client = test_client(3, 60, 300);
        client.record_failure("peer-a:7420");
        client.record_failure("peer-a:7420");
        client.record_success("peer-a:7420");
        client.record_failure("peer-a:7420");
        client.record_failure("peer-a:7420");
        assert!(client.is_available("peer-a:7420"));
    }

    #[tokio::test]
    async fn test_quarantine_lapses() {
        let client = test_client(1, 60, 0);
        client.record_failure("peer-a:7420");
        // Zero-length quarantine expires immediately.
        assert!(client.is_available("peer-a:7420"));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_an_error() {
        let client = test_client(3, 60, 300);
        let err = client
            .heartbeat("127.0.0.1:1", "photos", "00000000000000000000", "10.0.0.1:7420")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerUnreachable { .. }));
    }
}
