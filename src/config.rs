use std::{env, time::Duration};

use log::{debug, warn};

use crate::{
    error::{ErrorCode, SmallError},
    types::SmallResult,
};

pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Bounds of the page size. Offsets inside a page must fit in 16 bits.
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 1 << 16;

/// Tunables of the storage core.
#[derive(Debug, Clone)]
pub struct Config {
    pub page_size: usize,

    /// A non-root page whose data size drops below
    /// `page_size * compress_fill_factor` is merged with a sibling.
    pub compress_fill_factor: f64,

    /// Capacity of the index tablespace, in pages.
    pub max_space_pages: usize,

    pub lock_wait_timeout: Duration,

    /// Retry policy of physical removals which may run out of file space.
    pub delete_retry_attempts: usize,
    pub delete_retry_sleep: Duration,

    /// Undo records handled by one purge batch.
    pub purge_batch_size: usize,

    pub adaptive_hash: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            compress_fill_factor: 0.5,
            max_space_pages: 1 << 20,
            lock_wait_timeout: Duration::from_secs(3),
            delete_retry_attempts: 100,
            delete_retry_sleep: Duration::from_millis(50),
            purge_batch_size: 300,
            adaptive_hash: true,
        }
    }
}

impl Config {
    /// Build a config from the defaults, overridden by `SMALL_MVCC_*`
    /// environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = read_env::<usize>("SMALL_MVCC_PAGE_SIZE") {
            if (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&v) {
                config.page_size = v;
            } else {
                warn!(
                    "ignore SMALL_MVCC_PAGE_SIZE={}, not in [{}, {}]",
                    v, MIN_PAGE_SIZE, MAX_PAGE_SIZE
                );
            }
        }
        if let Some(v) = read_env::<f64>("SMALL_MVCC_COMPRESS_FILL_FACTOR") {
            config.compress_fill_factor = v;
        }
        if let Some(v) = read_env::<usize>("SMALL_MVCC_MAX_SPACE_PAGES") {
            config.max_space_pages = v;
        }
        if let Some(v) = read_env::<u64>("SMALL_MVCC_LOCK_WAIT_TIMEOUT_MS") {
            config.lock_wait_timeout = Duration::from_millis(v);
        }
        if let Some(v) = read_env::<usize>("SMALL_MVCC_DELETE_RETRY_ATTEMPTS") {
            config.delete_retry_attempts = v;
        }
        if let Some(v) = read_env::<u64>("SMALL_MVCC_DELETE_RETRY_SLEEP_MS") {
            config.delete_retry_sleep = Duration::from_millis(v);
        }
        if let Some(v) = read_env::<usize>("SMALL_MVCC_PURGE_BATCH_SIZE") {
            config.purge_batch_size = v;
        }
        if let Some(v) = read_env::<bool>("SMALL_MVCC_ADAPTIVE_HASH") {
            config.adaptive_hash = v;
        }

        debug!("config: {:?}", config);
        config
    }

    pub fn validate(&self) -> SmallResult {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(SmallError::new(
                ErrorCode::Internal,
                &format!(
                    "page size {} is not in [{}, {}]",
                    self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
                ),
            ));
        }
        if !(self.compress_fill_factor > 0.0 && self.compress_fill_factor < 1.0) {
            return Err(SmallError::new(
                ErrorCode::Internal,
                &format!("compress fill factor {} is not in (0, 1)", self.compress_fill_factor),
            ));
        }
        Ok(())
    }

    /// Threshold (in bytes of record data) below which a page is a merge
    /// candidate.
    pub fn compress_limit(&self) -> usize {
        (self.page_size as f64 * self.compress_fill_factor) as usize
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignore malformed env {}={}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_limit() {
        let config = Config::default();
        assert_eq!(config.compress_limit(), DEFAULT_PAGE_SIZE / 2);

        let config = Config {
            compress_fill_factor: 0.25,
            ..Config::default()
        };
        assert_eq!(config.compress_limit(), DEFAULT_PAGE_SIZE / 4);
    }

    #[test]
    fn test_validate() {
        Config::default().validate().unwrap();
        for page_size in &[MIN_PAGE_SIZE, MAX_PAGE_SIZE] {
            let config = Config {
                page_size: *page_size,
                ..Config::default()
            };
            config.validate().unwrap();
        }
        for page_size in &[128, MAX_PAGE_SIZE * 2] {
            let config = Config {
                page_size: *page_size,
                ..Config::default()
            };
            assert!(config.validate().is_err());
        }
        let config = Config {
            compress_fill_factor: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
