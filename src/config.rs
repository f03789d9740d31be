use std::net::SocketAddr;
use std::time::Duration;

/// How this node routes job and partition starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Run everything in-process on this node.
    #[default]
    Local,
    /// Enqueue onto the message transport for any listening node to pick up.
    Queued,
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchMode::Local => write!(f, "local"),
            DispatchMode::Queued => write!(f, "queued"),
        }
    }
}

/// Routing configuration for the dispatcher and the dispatch listener.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub mode: DispatchMode,
    /// Point-to-point destination for job start/restart requests
    pub job_destination: String,
    /// Point-to-point destination for partition start requests
    pub partition_destination: String,
    /// Fan-out topic for stop signals aimed at remote partitions
    pub control_topic: String,
    /// Whether this node consumes queued requests at all
    pub listen: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Local,
            job_destination: "batch.jobs".to_string(),
            partition_destination: "batch.partitions".to_string(),
            control_topic: "batch.control".to_string(),
            listen: true,
        }
    }
}

/// What the coordinator does when a wait elapses with no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Stop collecting; partitions without a final status are incomplete.
    #[default]
    FailMissing,
    /// Log and keep waiting until every partition reports or a stop arrives.
    KeepWaiting,
}

/// Partition coordination timing.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Bounded wait for each blocking take on the reply queue
    pub reply_wait_timeout_ms: u64,
    /// Delay after a stop request before draining without waiting
    pub stop_settle_delay_ms: u64,
    pub timeout_policy: TimeoutPolicy,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            reply_wait_timeout_ms: 15_000,
            stop_settle_delay_ms: 3_000,
            timeout_policy: TimeoutPolicy::FailMissing,
        }
    }
}

impl PartitionConfig {
    pub fn reply_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_wait_timeout_ms)
    }

    pub fn stop_settle_delay(&self) -> Duration {
        Duration::from_millis(self.stop_settle_delay_ms)
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Retries for an update that lost an optimistic-concurrency race
    pub max_conflict_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identity recorded on every execution this node runs
    pub server_id: String,
    /// Externally reachable address recorded alongside the server id
    pub rest_url: String,
    pub dashboard_addr: Option<SocketAddr>,
    pub dispatch: DispatchConfig,
    pub partition: PartitionConfig,
    pub store: StoreConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_id: "node-1".to_string(),
            rest_url: "http://127.0.0.1:9080".to_string(),
            dashboard_addr: None,
            dispatch: DispatchConfig::default(),
            partition: PartitionConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(server_id: impl Into<String>, rest_url: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            rest_url: rest_url.into(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch.mode = mode;
        self
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_partition_timing(mut self, reply_wait_timeout_ms: u64, stop_settle_delay_ms: u64) -> Self {
        self.partition.reply_wait_timeout_ms = reply_wait_timeout_ms;
        self.partition.stop_settle_delay_ms = stop_settle_delay_ms;
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.partition.timeout_policy = policy;
        self
    }

    pub fn without_listener(mut self) -> Self {
        self.dispatch.listen = false;
        self
    }
}
