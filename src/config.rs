use std::time::Duration;

/// Multiplier applied to a job's priority when computing a workunit's
/// queue score; submit time (unix seconds) is subtracted so that within
/// one priority band earlier submissions win.
pub const PRIORITY_WEIGHT: i64 = 100_000_000_000;

/// Wildcard app name a client may register to accept any command.
pub const ALL_APP: &str = "*";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Ready-poll interval for moving tasks into the work queue.
    pub queue_tick: Duration,
    /// Client liveness sweep interval; a client missing one full interval
    /// is declared lost on the following sweep.
    pub client_tick: Duration,
    /// Interval for the expired-job sweep.
    pub expiration_tick: Duration,
    /// Execution failures tolerated per workunit before it and its job
    /// are suspended.
    pub max_work_failure: u32,
    /// Consecutive ready-poll failures tolerated per task before its job
    /// is suspended with the captured error.
    pub max_enqueue_retries: u32,
    /// Minimum job priority; submissions below it are raised to it.
    pub base_priority: i32,
    /// Chunk size (MB) assumed by the partition-size recomputation.
    pub chunk_size_mb: u64,
    /// Blob-store index used for partitioned tasks that do not name one.
    pub default_index: String,
    /// Whether client registration requires a clientgroup token.
    pub client_auth_required: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_tick: Duration::from_secs(10),
            client_tick: Duration::from_secs(30),
            expiration_tick: Duration::from_secs(60),
            max_work_failure: 3,
            max_enqueue_retries: 3,
            base_priority: 1,
            chunk_size_mb: 1,
            default_index: "chunkrecord".to_string(),
            client_auth_required: false,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_tick.is_zero() || self.client_tick.is_zero() || self.expiration_tick.is_zero()
        {
            return Err("tick intervals must be non-zero".to_string());
        }
        if self.max_work_failure == 0 {
            return Err("max_work_failure must be at least 1".to_string());
        }
        if self.max_enqueue_retries == 0 {
            return Err("max_enqueue_retries must be at least 1".to_string());
        }
        if self.chunk_size_mb == 0 {
            return Err("chunk_size_mb must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn with_ticks(mut self, queue: Duration, client: Duration, expiration: Duration) -> Self {
        self.queue_tick = queue;
        self.client_tick = client;
        self.expiration_tick = expiration;
        self
    }

    pub fn with_max_work_failure(mut self, max: u32) -> Self {
        self.max_work_failure = max;
        self
    }
}
