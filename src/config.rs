use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Largest plan a single INIT may declare.
pub const DEFAULT_MAX_TOTAL_STEPS: usize = 10_000;

/// How long a queued message may wait for room in a connection's buffer.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a failed step may be handed out again.
///
/// Steps are retried without limit by default. With a cap, the step that
/// reaches it is exhausted and its cohort is aborted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of failed attempts per step. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self { max_attempts: None }
    }

    pub fn limited(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
        }
    }

    /// Whether a step that has now failed `failures` times goes back into the pool.
    pub fn allows_retry(&self, failures: u32) -> bool {
        match self.max_attempts {
            Some(max) => failures < max,
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Outbound messages buffered per connection before sends start waiting.
    pub outbound_capacity: usize,
    /// Sends to a connection whose buffer stays full this long fail.
    pub send_timeout: Duration,
    pub retry: RetryPolicy,
    /// INIT messages declaring more steps than this are rejected.
    pub max_total_steps: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            outbound_capacity: 32,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            retry: RetryPolicy::default(),
            max_total_steps: DEFAULT_MAX_TOTAL_STEPS,
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_total_steps(mut self, max_total_steps: usize) -> Self {
        self.max_total_steps = max_total_steps;
        self
    }
}

/// Worker-side settings: where to connect and what to declare in INIT.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the coordinator, e.g. `ws://127.0.0.1:8000`
    pub server_url: String,
    pub api_version: String,
    pub client_id: String,
    pub cache_id: String,
    /// YAML schema file listing the plan's steps
    pub schema_path: PathBuf,
    /// Directory steps run in. Defaults to the current directory.
    pub workspace_path: Option<PathBuf>,
    /// YAML/JSON file describing the source tree per repository
    pub repo_state_path: Option<PathBuf>,
    pub complex_patchset: bool,
}

impl WorkerConfig {
    pub fn new(client_id: impl Into<String>, schema_path: impl Into<PathBuf>) -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000".to_string(),
            api_version: "1".to_string(),
            client_id: client_id.into(),
            cache_id: "1".to_string(),
            schema_path: schema_path.into(),
            workspace_path: None,
            repo_state_path: None,
            complex_patchset: false,
        }
    }

    pub fn with_server_url(mut self, server_url: impl Into<String>) -> Self {
        self.server_url = server_url.into();
        self
    }

    pub fn with_cache_id(mut self, cache_id: impl Into<String>) -> Self {
        self.cache_id = cache_id.into();
        self
    }

    /// Full WebSocket endpoint for this worker.
    pub fn endpoint(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            format!("ws://{}", base)
        };
        format!("{}/ws/api/{}/{}/", base, self.api_version, self.client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_default_is_unlimited() {
        let policy = RetryPolicy::default();
        assert_eq!(policy, RetryPolicy::unlimited());
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(u32::MAX));
    }

    #[test]
    fn retry_policy_limited_stops_at_cap() {
        let policy = RetryPolicy::limited(3);
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
        assert!(!policy.allows_retry(4));
    }

    #[test]
    fn server_config_default() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:8000");
        assert_eq!(cfg.outbound_capacity, 32);
        assert_eq!(cfg.send_timeout, Duration::from_secs(5));
        assert_eq!(cfg.retry.max_attempts, None);
        assert_eq!(cfg.max_total_steps, DEFAULT_MAX_TOTAL_STEPS);
    }

    #[test]
    fn server_config_with_retry() {
        let addr: SocketAddr = "0.0.0.0:9000".parse().unwrap();
        let cfg = ServerConfig::new(addr)
            .with_retry(RetryPolicy::limited(5))
            .with_max_total_steps(64);
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.retry.max_attempts, Some(5));
        assert_eq!(cfg.max_total_steps, 64);
    }

    #[test]
    fn worker_config_endpoint() {
        let cfg = WorkerConfig::new("worker-7", "/tmp/schema.yaml");
        assert_eq!(cfg.endpoint(), "ws://127.0.0.1:8000/ws/api/1/worker-7/");

        let cfg = cfg.with_server_url("example.com:8080/");
        assert_eq!(cfg.endpoint(), "ws://example.com:8080/ws/api/1/worker-7/");

        let cfg = cfg.with_server_url("wss://secure.example.com");
        assert_eq!(
            cfg.endpoint(),
            "wss://secure.example.com/ws/api/1/worker-7/"
        );
    }

    #[test]
    fn worker_config_defaults() {
        let cfg = WorkerConfig::new("a", "schema.yaml").with_cache_id("42");
        assert_eq!(cfg.cache_id, "42");
        assert_eq!(cfg.api_version, "1");
        assert!(cfg.workspace_path.is_none());
        assert!(cfg.repo_state_path.is_none());
        assert!(!cfg.complex_patchset);
    }
}
