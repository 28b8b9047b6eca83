use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Debug, Clone)]
pub struct OperatorConfig {
    /// Total worker-slot capacity the scheduler may hand out. One slot is
    /// one pod; launchers take a slot too. There is no safe default, the
    /// pool must describe the actual cluster.
    #[envconfig(from = "MPIFLEX_SLOT_POOL")]
    pub slot_pool: u32,

    /// Control port the launcher's rescale server listens on
    #[envconfig(from = "MPIFLEX_RESCALE_PORT", default = "1234")]
    pub rescale_port: u16,

    /// How long to wait for a launcher to acknowledge a rescale
    #[envconfig(from = "MPIFLEX_RESCALE_TIMEOUT_SECS", default = "180")]
    pub rescale_timeout_secs: u64,

    /// Settle time for pod DNS and SSH before an expand signal is sent
    #[envconfig(from = "MPIFLEX_EXPAND_GRACE_SECS", default = "15")]
    pub expand_grace_secs: u64,

    /// Periodic requeue interval for live jobs
    #[envconfig(from = "MPIFLEX_REQUEUE_SECS", default = "10")]
    pub requeue_secs: u64,

    /// First retry delay after a failed reconcile; doubles per
    /// consecutive failure of the same job
    #[envconfig(from = "MPIFLEX_ERROR_BACKOFF_BASE_MS", default = "5")]
    pub error_backoff_base_ms: u64,

    /// Ceiling for the per-job retry delay
    #[envconfig(from = "MPIFLEX_ERROR_BACKOFF_MAX_SECS", default = "1000")]
    pub error_backoff_max_secs: u64,
}

impl OperatorConfig {
    #[inline]
    pub fn rescale_timeout(&self) -> Duration {
        Duration::from_secs(self.rescale_timeout_secs)
    }

    #[inline]
    pub fn expand_grace(&self) -> Duration {
        Duration::from_secs(self.expand_grace_secs)
    }

    #[inline]
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_secs)
    }

    #[inline]
    pub fn error_backoff_base(&self) -> Duration {
        Duration::from_millis(self.error_backoff_base_ms)
    }

    #[inline]
    pub fn error_backoff_max(&self) -> Duration {
        Duration::from_secs(self.error_backoff_max_secs)
    }
}
