//! Typed errors for the allocator's non-hot-path surfaces: configuration
//! parsing and arena reservation.
//!
//! The `malloc`/`free` fast path never returns this type; it surfaces only
//! from `config::load` and `Arena::init`. Per-thread metadata mapping
//! failure is a separate, fatal case handled by `invariant!` (see
//! `cache::ThreadMetadata::new`) rather than this type, since there is no
//! degraded mode to return to a caller.

use std::fmt;

#[derive(Debug)]
pub enum AllocatorError {
    InvalidConfig { var: &'static str, value: String },
    ThreadLimitExceeded,
    ArenaReservationFailed(errno::Errno),
}

impl fmt::Display for AllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocatorError::InvalidConfig { var, value } => {
                write!(f, "invalid value {value:?} for environment variable {var}")
            }
            AllocatorError::ThreadLimitExceeded => {
                write!(f, "exceeded the configured hard thread limit")
            }
            AllocatorError::ArenaReservationFailed(errno) => {
                write!(f, "failed to reserve arena virtual memory: {errno}")
            }
        }
    }
}

impl std::error::Error for AllocatorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_var_name() {
        let e = AllocatorError::InvalidConfig {
            var: "TRICACHE_ARENA_SIZE",
            value: "abc".to_string(),
        };
        assert!(e.to_string().contains("TRICACHE_ARENA_SIZE"));
    }
}
