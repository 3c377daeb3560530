use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Signal number of SIGTERM.
const SIGTERM: i32 = 15;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runtime knobs shared by every connection a manager opens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientOptions {
    /// Default deadline for a request (0 = wait forever).
    #[serde(default = "d_60000")]
    pub request_timeout_ms: u64,
    /// Ceiling for the `initialize` request; the effective deadline is
    /// `min(request_timeout_ms, init_timeout_ms)`.
    #[serde(default = "d_30000")]
    pub init_timeout_ms: u64,
    /// Additional `initialize` attempts after the first failure.
    #[serde(default = "d_2")]
    pub init_retries: u32,
    /// Fixed delay between `initialize` attempts.
    #[serde(default = "d_1000")]
    pub init_retry_delay_ms: u64,
    /// Bound on opening (or re-opening) a stream push channel.
    #[serde(default = "d_10000")]
    pub connect_timeout_ms: u64,
    /// Grace window between SIGTERM and SIGKILL when closing a process.
    #[serde(default = "d_5000")]
    pub kill_grace_ms: u64,
    /// Exit codes treated as a clean shutdown when a process exits on its own.
    #[serde(default = "d_benign_exit_codes")]
    pub benign_exit_codes: Vec<i32>,
    /// `clientInfo.name` sent during `initialize`.
    #[serde(default = "d_client_name")]
    pub client_name: String,
    /// `clientInfo.version` sent during `initialize`.
    #[serde(default = "d_client_version")]
    pub client_version: String,
    /// MCP protocol revision requested during `initialize`.
    #[serde(default = "d_protocol_version")]
    pub protocol_version: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout_ms: 60_000,
            init_timeout_ms: 30_000,
            init_retries: 2,
            init_retry_delay_ms: 1000,
            connect_timeout_ms: 10_000,
            kill_grace_ms: 5000,
            benign_exit_codes: d_benign_exit_codes(),
            client_name: d_client_name(),
            client_version: d_client_version(),
            protocol_version: d_protocol_version(),
        }
    }
}

impl ClientOptions {
    /// `None` when the request timeout is disabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        millis_or_none(self.request_timeout_ms)
    }

    /// Effective handshake deadline for a server whose request timeout is
    /// `request_timeout_ms` (falls back to the manager default).
    pub fn init_timeout(&self, request_timeout_ms: Option<u64>) -> Option<Duration> {
        let request = request_timeout_ms.unwrap_or(self.request_timeout_ms);
        match (request, self.init_timeout_ms) {
            (0, 0) => None,
            (0, ceiling) => Some(Duration::from_millis(ceiling)),
            (request, 0) => Some(Duration::from_millis(request)),
            (request, ceiling) => Some(Duration::from_millis(request.min(ceiling))),
        }
    }

    pub fn init_retry_delay(&self) -> Duration {
        Duration::from_millis(self.init_retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Whether a server process ending with this status shut down cleanly.
    ///
    /// Termination by SIGTERM (the signal itself, or exit code `128 + 15`)
    /// always is; other exit codes must be listed in `benign_exit_codes`.
    pub fn is_benign_exit(&self, code: Option<i32>, signal: Option<i32>) -> bool {
        match (code, signal) {
            (Some(code), _) => code == 128 + SIGTERM || self.benign_exit_codes.contains(&code),
            (None, Some(signal)) => signal == SIGTERM,
            (None, None) => false,
        }
    }
}

fn millis_or_none(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

// ── serde default helpers ───────────────────────────────────────────

fn d_60000() -> u64 {
    60_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_10000() -> u64 {
    10_000
}
fn d_5000() -> u64 {
    5000
}
fn d_1000() -> u64 {
    1000
}
fn d_2() -> u32 {
    2
}
/// `0` and `128 + SIGTERM`.
fn d_benign_exit_codes() -> Vec<i32> {
    vec![0, 143]
}
fn d_client_name() -> String {
    "conduit".into()
}
fn d_client_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}
fn d_protocol_version() -> String {
    "2024-11-05".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_timeout_is_capped_by_ceiling() {
        let opts = ClientOptions::default();
        assert_eq!(opts.init_timeout(None), Some(Duration::from_secs(30)));
        assert_eq!(opts.init_timeout(Some(5000)), Some(Duration::from_secs(5)));
    }

    #[test]
    fn zero_request_timeout_still_bounded_by_ceiling() {
        let opts = ClientOptions {
            request_timeout_ms: 0,
            ..ClientOptions::default()
        };
        assert_eq!(opts.request_timeout(), None);
        assert_eq!(opts.init_timeout(None), Some(Duration::from_secs(30)));
    }

    #[test]
    fn both_zero_disables_init_timeout() {
        let opts = ClientOptions {
            request_timeout_ms: 0,
            init_timeout_ms: 0,
            ..ClientOptions::default()
        };
        assert_eq!(opts.init_timeout(None), None);
    }

    #[test]
    fn code_one_is_not_benign_by_default() {
        let opts = ClientOptions::default();
        assert!(opts.is_benign_exit(Some(0), None));
        assert!(opts.is_benign_exit(Some(143), None));
        assert!(!opts.is_benign_exit(Some(1), None));
    }

    #[test]
    fn sigterm_is_always_benign() {
        let opts = ClientOptions {
            benign_exit_codes: Vec::new(),
            ..ClientOptions::default()
        };
        assert!(opts.is_benign_exit(None, Some(SIGTERM)));
        assert!(opts.is_benign_exit(Some(128 + SIGTERM), None));
        assert!(!opts.is_benign_exit(None, Some(9)));
        assert!(!opts.is_benign_exit(None, None));
    }
}
