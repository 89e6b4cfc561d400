//! Connection manager configuration.

pub const DEFAULT_MAX_READ_LENGTH: usize = 64 * 1024;

/// Environment variable overriding [`ManagerConfig::max_read_length`].
pub const MAX_READ_ENV: &str = "IPCBRIDGE_MAX_READ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Upper bound on bytes returned by a single read, whatever the caller asked for.
    pub max_read_length: usize,
    /// Remove a stale socket file before binding a listener.
    pub unlink_existing: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_read_length: DEFAULT_MAX_READ_LENGTH,
            unlink_existing: false,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, overridden from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup(MAX_READ_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.max_read_length = n,
                _ => tracing::warn!(
                    value = %raw,
                    default = DEFAULT_MAX_READ_LENGTH,
                    "Ignoring invalid {MAX_READ_ENV}"
                ),
            }
        }
        config
    }

    pub fn with_max_read_length(mut self, n: usize) -> Self {
        self.max_read_length = n.max(1);
        self
    }

    pub fn with_unlink_existing(mut self, unlink: bool) -> Self {
        self.unlink_existing = unlink;
        self
    }
}
