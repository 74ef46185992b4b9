use crate::config::{
    Config, RotationRules, RULE_ALL_IDLE, RULE_RATE_LIMIT, RULE_SIZE_CAP, RULE_STALLED,
};
use crate::error::{Result, RotationError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const MIB: f64 = 1024.0 * 1024.0;
const STALL_WARN_EVERY: u32 = 10;

/// One read of rclone's `core/stats`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub transfers: u64,
    #[serde(default)]
    pub eta: Option<f64>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub transferring: Option<Vec<ActiveTransfer>>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ActiveTransfer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bytes: Option<u64>,
    #[serde(default)]
    pub speed: Option<f64>,
}

impl ActiveTransfer {
    /// Moving bytes right now. Entries missing either counter count as finished.
    fn is_progressing(&self) -> bool {
        match (self.bytes, self.speed) {
            (Some(bytes), Some(speed)) => bytes != 0 && speed > 0.0,
            _ => false,
        }
    }
}

impl TransferSnapshot {
    pub fn log_status(&self) {
        info!(
            "Transfer Status - Upload: {:.2} GiB, Avg upspeed: {:.2} MiB/s, Transferred: {}, ETA: {}.",
            self.bytes as f64 / GIB,
            self.speed / MIB,
            self.transfers,
            self.eta
                .map(|e| format!("{}s", e as u64))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
}

#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn poll(&self) -> Result<TransferSnapshot>;
}

/// HTTP client for rclone's remote control API.
#[derive(Debug, Clone)]
pub struct RcClient {
    client: Client,
    stats_url: String,
}

impl RcClient {
    pub fn new(rc_addr: &str) -> Result<Self> {
        let base = if rc_addr.starts_with("http://") || rc_addr.starts_with("https://") {
            rc_addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", rc_addr.trim_end_matches('/'))
        };
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| RotationError::Poll(format!("failed to build rc client: {e}")))?;
        Ok(Self {
            client,
            stats_url: format!("{base}/core/stats"),
        })
    }
}

#[async_trait]
impl StatsSource for RcClient {
    async fn poll(&self) -> Result<TransferSnapshot> {
        let res = self
            .client
            .post(&self.stats_url)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| RotationError::Poll(e.to_string()))?;

        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| RotationError::Poll(e.to_string()))?;
        if !status.is_success() {
            return Err(RotationError::Poll(format!(
                "HTTP {}: {}",
                status,
                String::from_utf8_lossy(&bytes)
            )));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| RotationError::Poll(format!("invalid core/stats JSON: {e}")))
    }
}

/// Thresholds the rotation rules are checked against.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    pub rules: RotationRules,
    pub level: u32,
    pub size_threshold: u64,
    pub stall_polls: u32,
    pub rate_limit_marker: String,
}

impl RotationPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            rules: config.rules,
            level: config.rotation_level,
            size_threshold: config.size_threshold,
            stall_polls: config.stall_polls,
            rate_limit_marker: config.rate_limit_marker.clone(),
        }
    }
}

/// Counters carried across polls of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionHistory {
    pub last_bytes: u64,
    pub stalled_polls: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationDecision {
    pub should_rotate: bool,
    pub hits: Vec<&'static str>,
}

impl RotationDecision {
    pub fn reason(&self) -> String {
        if self.hits.is_empty() {
            return "no rule hit".to_string();
        }
        self.hits
            .iter()
            .map(|h| format!("Rule `{h}` hit"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn decide(
    snapshot: &TransferSnapshot,
    history: &mut SessionHistory,
    policy: &RotationPolicy,
) -> RotationDecision {
    let mut hits = Vec::new();
    let rules = &policy.rules;

    if rules.size_cap && snapshot.bytes > policy.size_threshold {
        hits.push(RULE_SIZE_CAP);
    }

    if rules.stalled_transfer {
        if snapshot.bytes <= history.last_bytes {
            history.stalled_polls += 1;
            if history.stalled_polls % STALL_WARN_EVERY == 0 {
                warn!(
                    "Rclone seems not to transfer in {} checks",
                    history.stalled_polls
                );
            }
            if history.stalled_polls >= policy.stall_polls {
                hits.push(RULE_STALLED);
            }
        } else {
            history.stalled_polls = 0;
        }
        history.last_bytes = snapshot.bytes;
    }

    if rules.rate_limit_error
        && snapshot
            .last_error
            .as_deref()
            .map(|e| e.contains(&policy.rate_limit_marker))
            .unwrap_or(false)
    {
        hits.push(RULE_RATE_LIMIT);
    }

    if rules.all_idle
        && !snapshot
            .transferring
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(ActiveTransfer::is_progressing)
    {
        hits.push(RULE_ALL_IDLE);
    }

    RotationDecision {
        should_rotate: hits.len() as u32 >= policy.level,
        hits,
    }
}

/// Consecutive poll failure counter.
#[derive(Debug, Clone)]
pub struct PollTracker {
    failures: u32,
    cap: u32,
}

impl PollTracker {
    pub fn new(cap: u32) -> Self {
        Self { failures: 0, cap }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns true once the cap is reached.
    pub fn record_failure(&mut self) -> bool {
        self.failures += 1;
        self.failures >= self.cap
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn policy(rules: RotationRules, level: u32) -> RotationPolicy {
        RotationPolicy {
            rules,
            level,
            size_threshold: 750 * 1000 * 1000 * 1000,
            stall_polls: 100,
            rate_limit_marker: "userRateLimitExceeded".to_string(),
        }
    }

    fn busy(bytes: u64) -> TransferSnapshot {
        TransferSnapshot {
            bytes,
            transferring: Some(vec![ActiveTransfer {
                name: Some("a.mkv".to_string()),
                bytes: Some(10),
                speed: Some(5.0),
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn parses_core_stats_payload() {
        let raw = r#"{"bytes":1073741824,"speed":2097152.5,"transfers":3,"eta":null,
            "lastError":"googleapi: Error 403: User rate limit exceeded., userRateLimitExceeded",
            "transferring":[{"name":"a.mkv","bytes":10,"speed":1.5},{"name":"b.mkv"}],
            "checks":0,"errors":1}"#;
        let snap: TransferSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snap.bytes, 1 << 30);
        assert_eq!(snap.transfers, 3);
        assert_eq!(snap.eta, None);
        let active = snap.transferring.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[1].bytes, None);
    }

    #[test]
    fn size_cap_is_strictly_greater() {
        let rules = RotationRules {
            size_cap: true,
            ..RotationRules::none()
        };
        let p = policy(rules, 1);
        let mut h = SessionHistory::default();
        assert!(!decide(&busy(p.size_threshold), &mut h, &p).should_rotate);
        assert!(decide(&busy(p.size_threshold + 1), &mut h, &p).should_rotate);
    }

    #[test]
    fn stall_counter_tracks_byte_progress() {
        let rules = RotationRules {
            stalled_transfer: true,
            ..RotationRules::none()
        };
        let p = policy(rules, 1);
        let mut h = SessionHistory::default();
        for bytes in [10, 20, 30] {
            decide(&busy(bytes), &mut h, &p);
            assert_eq!(h.stalled_polls, 0);
        }
        decide(&busy(30), &mut h, &p);
        assert_eq!(h.stalled_polls, 1);
        decide(&busy(30), &mut h, &p);
        assert_eq!(h.stalled_polls, 2);
        decide(&busy(31), &mut h, &p);
        assert_eq!(h.stalled_polls, 0);
    }

    #[test]
    fn stall_rule_fires_on_hundredth_flat_poll() {
        let rules = RotationRules {
            stalled_transfer: true,
            ..RotationRules::none()
        };
        let p = policy(rules, 1);
        let mut h = SessionHistory {
            last_bytes: 500,
            stalled_polls: 0,
        };
        for call in 1..=100 {
            let d = decide(&busy(500), &mut h, &p);
            assert_eq!(d.should_rotate, call == 100, "call {call}");
        }
    }

    #[test]
    fn rate_limit_marker_in_last_error() {
        let rules = RotationRules {
            rate_limit_error: true,
            ..RotationRules::none()
        };
        let p = policy(rules, 1);
        let mut h = SessionHistory::default();
        let mut snap = busy(1);
        snap.last_error = Some("Error 403: userRateLimitExceeded".to_string());
        assert_eq!(decide(&snap, &mut h, &p).hits, vec![RULE_RATE_LIMIT]);
        snap.last_error = Some("connection reset".to_string());
        assert!(decide(&snap, &mut h, &p).hits.is_empty());
    }

    #[test]
    fn all_idle_ignores_finished_entries_and_needs_no_progress() {
        let rules = RotationRules {
            all_idle: true,
            ..RotationRules::none()
        };
        let p = policy(rules, 1);
        let mut h = SessionHistory::default();

        let idle = TransferSnapshot {
            transferring: Some(vec![
                ActiveTransfer {
                    name: Some("done".to_string()),
                    bytes: None,
                    speed: None,
                },
                ActiveTransfer {
                    name: Some("stuck".to_string()),
                    bytes: Some(1024),
                    speed: Some(0.0),
                },
            ]),
            ..Default::default()
        };
        assert!(decide(&idle, &mut h, &p).should_rotate);
        assert!(decide(&TransferSnapshot::default(), &mut h, &p).should_rotate);
        assert!(!decide(&busy(5), &mut h, &p).should_rotate);
    }

    #[test]
    fn level_counts_rule_hits() {
        let p = policy(RotationRules::default(), 2);
        let mut h = SessionHistory::default();

        // Only all-idle fires.
        let one = TransferSnapshot {
            bytes: 10,
            ..Default::default()
        };
        let d = decide(&one, &mut h, &p);
        assert_eq!(d.hits, vec![RULE_ALL_IDLE]);
        assert!(!d.should_rotate);

        // All-idle plus rate limit.
        let two = TransferSnapshot {
            bytes: 20,
            last_error: Some("userRateLimitExceeded".to_string()),
            ..Default::default()
        };
        let d = decide(&two, &mut h, &p);
        assert_eq!(d.hits.len(), 2);
        assert!(d.should_rotate);
        assert!(d.reason().contains("Rule `error_user_rate_limit` hit"));
    }

    #[test]
    fn poll_tracker_caps_and_resets() {
        let mut t = PollTracker::new(3);
        assert!(!t.record_failure());
        assert!(!t.record_failure());
        t.record_success();
        assert_eq!(t.failures(), 0);
        assert!(!t.record_failure());
        assert!(!t.record_failure());
        assert!(t.record_failure());
    }

    #[tokio::test]
    async fn rc_client_posts_to_core_stats() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/core/stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "bytes": 42, "speed": 1.0, "transfers": 1, "transferring": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = RcClient::new(&server.uri()).unwrap();
        let snap = client.poll().await.unwrap();
        assert_eq!(snap.bytes, 42);
        assert_eq!(snap.transferring, Some(vec![]));
    }

    #[tokio::test]
    async fn rc_client_maps_http_errors_to_poll_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/core/stats"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = RcClient::new(&server.uri()).unwrap();
        assert!(matches!(client.poll().await, Err(RotationError::Poll(_))));
    }
}
