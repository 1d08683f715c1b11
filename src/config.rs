//! Process-wide configuration, read once from the environment and overlaid
//! on compiled-in defaults, mirroring the teacher's `option_is_enabled` /
//! `option_get` convention but as a typed, lazily-initialized singleton.

use std::env;
use std::sync::OnceLock;

use log::warn;

use crate::error::AllocatorError;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub total_alloc_space: usize,
    pub hard_thread_limit: usize,
    pub objects_per_sb: u16,
    pub max_sb_per_class: usize,
    pub small_threshold: usize,
    pub chunk_size: usize,
    pub search_depth: usize,
    pub verbose: bool,
    pub show_stats: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            total_alloc_space: 4 * 1024 * 1024 * 1024,
            hard_thread_limit: 256,
            objects_per_sb: 255,
            max_sb_per_class: 64,
            small_threshold: crate::size_class::SMALL_THRESHOLD,
            chunk_size: 1024 * 1024,
            search_depth: 18,
            verbose: false,
            show_stats: false,
        }
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Returns the process-wide configuration, building it from the environment
/// on first call. Subsequent calls are free (no further env lookups).
pub fn get() -> &'static Config {
    CONFIG.get_or_init(|| load().unwrap_or_default())
}

fn load() -> Result<Config, AllocatorError> {
    let mut cfg = Config::default();

    if let Some(v) = env_usize("TRICACHE_ARENA_SIZE")? {
        cfg.total_alloc_space = v;
    }
    if let Some(v) = env_usize("TRICACHE_MAX_THREADS")? {
        cfg.hard_thread_limit = v;
    }
    if let Some(v) = env_usize("TRICACHE_MAX_SB_PER_CLASS")? {
        cfg.max_sb_per_class = v;
    }
    if let Some(v) = env_usize("TRICACHE_CHUNK_SIZE")? {
        cfg.chunk_size = v;
    }
    if let Some(v) = env_usize("TRICACHE_SEARCH_DEPTH")? {
        cfg.search_depth = v;
    }
    cfg.verbose = env_bool("TRICACHE_VERBOSE");
    cfg.show_stats = env_bool("TRICACHE_SHOW_STATS");

    Ok(cfg)
}

fn env_usize(var: &'static str) -> Result<Option<usize>, AllocatorError> {
    match env::var(var) {
        Err(_) => Ok(None),
        Ok(value) => match value.parse::<usize>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => {
                warn!("config: falling back to default for {var}: invalid value {value:?}");
                Err(AllocatorError::InvalidConfig { var, value })
            }
        },
    }
}

fn env_bool(var: &'static str) -> bool {
    matches!(env::var(var).as_deref(), Ok("1") | Ok("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.objects_per_sb, 255);
        assert_eq!(cfg.small_threshold, 8192);
        assert_eq!(cfg.hard_thread_limit, 256);
    }

    #[test]
    fn env_usize_parses_valid_value() {
        env::set_var("TRICACHE_TEST_USIZE_OK", "42");
        assert_eq!(env_usize("TRICACHE_TEST_USIZE_OK").unwrap(), Some(42));
        env::remove_var("TRICACHE_TEST_USIZE_OK");
    }

    #[test]
    fn env_usize_rejects_invalid_value() {
        env::set_var("TRICACHE_TEST_USIZE_BAD", "not-a-number");
        assert!(env_usize("TRICACHE_TEST_USIZE_BAD").is_err());
        env::remove_var("TRICACHE_TEST_USIZE_BAD");
    }
}
