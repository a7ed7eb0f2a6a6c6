use std::num::NonZeroU8;
use std::time::Duration;

/// Default time the tracker waits for new movement tasks before checking again.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_secs(2);
/// Default number of workers executing movement attempts concurrently.
pub const DEFAULT_POOL_SIZE: NonZeroU8 = unsafe { NonZeroU8::new_unchecked(10) };
/// Default number of missed coordinator calls between two warnings.
pub const DEFAULT_LOG_WARN_INTERVAL: u64 = 10;

/// Tunables shared by the movement worker, its tracker and the endpoint tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Upper bound of the tracker suspension while no movement task is pending.
    pub idle_wait: Duration,
    /// Number of workers in the movement task pool.
    pub pool_size: NonZeroU8,
    /// Missed coordinator calls between two logged warnings.
    pub log_warn_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_wait: DEFAULT_IDLE_WAIT,
            pool_size: DEFAULT_POOL_SIZE,
            log_warn_interval: DEFAULT_LOG_WARN_INTERVAL,
        }
    }
}

impl Config {
    #[inline]
    pub fn with_idle_wait(self, idle_wait: Duration) -> Self {
        Self { idle_wait, ..self }
    }

    #[inline]
    pub fn with_pool_size(self, pool_size: NonZeroU8) -> Self {
        Self { pool_size, ..self }
    }

    /// Set the number of missed calls between two warnings; `0` is treated as `1`.
    #[inline]
    pub fn with_log_warn_interval(self, log_warn_interval: u64) -> Self {
        Self {
            log_warn_interval: log_warn_interval.max(1),
            ..self
        }
    }
}
