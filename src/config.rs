use std::path::PathBuf;

/// Default maximum user key size in bytes.
pub const DEFAULT_MAX_KEY_SIZE: usize = 1024;

/// Configuration for a database handle.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database files.
    pub dir: PathBuf,

    /// Database index within the shared key space (0..MAX_DB_COUNT).
    pub index: u8,

    /// Maximum user key size in bytes (default: 1024).
    pub max_key_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            index: 0,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
        }
    }
}

impl Config {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the database index
    pub fn index(mut self, index: u8) -> Self {
        self.index = index;
        self
    }

    /// Set the maximum user key size
    pub fn max_key_size(mut self, size: usize) -> Self {
        self.max_key_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dir, PathBuf::from("./emberdb"));
        assert_eq!(config.index, 0);
        assert_eq!(config.max_key_size, 1024);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/test").index(3).max_key_size(255);

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.index, 3);
        assert_eq!(config.max_key_size, 255);
    }
}
