//! Session configuration.

use std::time::Duration;

/// Tunables for a [`Session`](crate::Session).
///
/// The defaults accept any well-formed frame and never time out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of bytes requested from the socket per read.
    pub read_buffer_size: usize,
    /// Deadline for a single read; expiry ends the session like an I/O error.
    pub read_timeout: Option<Duration>,
    /// Deadline for writing one batch of replies.
    pub write_timeout: Option<Duration>,
    /// Close with 1002 when a frame sets RSV1-3.
    pub reject_reserved_bits: bool,
    /// Close with 1002 when a client frame arrives without a masking key.
    pub require_masked_frames: bool,
}

impl Config {
    /// Default read size in bytes.
    pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

    /// Sets the read size, clamped to at least one byte.
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Treats nonzero RSV bits as a protocol error. No extension is ever
    /// negotiated, so a strict server should enable this.
    #[must_use]
    pub fn reject_reserved_bits(mut self, reject: bool) -> Self {
        self.reject_reserved_bits = reject;
        self
    }

    /// Treats unmasked client frames as a protocol error.
    #[must_use]
    pub fn require_masked_frames(mut self, require: bool) -> Self {
        self.require_masked_frames = require;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            read_buffer_size: Self::DEFAULT_READ_BUFFER_SIZE,
            read_timeout: None,
            write_timeout: None,
            reject_reserved_bits: false,
            require_masked_frames: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_permissive() {
        let config = Config::default();
        assert_eq!(config.read_buffer_size, 4096);
        assert!(config.read_timeout.is_none());
        assert!(!config.reject_reserved_bits);
        assert!(!config.require_masked_frames);
    }

    #[test]
    fn setters_chain() {
        let config = Config::default()
            .with_read_buffer_size(0)
            .with_read_timeout(Duration::from_secs(5))
            .require_masked_frames(true);
        assert_eq!(config.read_buffer_size, 1);
        assert_eq!(config.read_timeout, Some(Duration::from_secs(5)));
        assert!(config.require_masked_frames);
    }
}
