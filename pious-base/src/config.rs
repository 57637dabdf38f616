use crate::{err, Result};
use std::time::Duration;

/// System configuration consumed by the core. There are no process-wide
/// settings: every server and every client context carries its own copy, so
/// tests can instantiate as many differently-tuned instances as they need.
#[derive(Clone, Debug)]
pub struct SysConfig {
    /// Cache data block size in bytes; the unit of caching. Must be > 0.
    pub block_size: usize,
    /// Cache size in data blocks; 0 disables caching. A value of 1 is
    /// promoted to 2 because the segmented cache needs a block per segment.
    pub cache_blocks: usize,
    /// How long an operation may remain blocked on a lock before it becomes
    /// a candidate for abortion.
    pub deadlock_timeout: Duration,
    /// How long the result of the most recent idempotent control operation
    /// stays answerable without re-execution.
    pub result_valid: Duration,
    /// Client open-file table size.
    pub open_max: usize,
    /// Upper bound on attempts to execute an independent access that aborts
    /// because the required locks could not be obtained.
    pub retry_max: u32,
}

impl Default for SysConfig {
    fn default() -> Self {
        SysConfig {
            block_size: 16384,
            cache_blocks: 64,
            deadlock_timeout: Duration::from_millis(250),
            result_valid: Duration::from_millis(20_000),
            open_max: 64,
            retry_max: 10,
        }
    }
}

impl SysConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(err("cache block size must be greater than zero"));
        }
        if self.open_max == 0 {
            return Err(err("open-file table size must be greater than zero"));
        }
        if self.retry_max == 0 {
            return Err(err("retry bound must be greater than zero"));
        }
        Ok(())
    }

    /// Cache block count with the 1 -> 2 promotion applied.
    pub fn cache_blocks_effective(&self) -> usize {
        if self.cache_blocks == 1 {
            2
        } else {
            self.cache_blocks
        }
    }
}
