/// Configuration for a [`WsNode`](crate::WsNode).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use relaymesh_transport::TransportConfig;
///
/// let config = TransportConfig::new()
///     .max_message_size(2 * 1024 * 1024)
///     .recv_buffer(512);
/// ```
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum incoming frame size in bytes.
    pub(crate) max_message_size: usize,
    /// Channel buffer size for transport events.
    pub(crate) recv_buffer: usize,
    /// Per-connection outbound queue depth.
    pub(crate) send_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self {
            max_message_size: 1024 * 1024, // 1 MB
            recv_buffer: 256,
            send_buffer: 64,
        }
    }

    /// Set maximum incoming frame size (default: 1 MB).
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set the channel buffer size for transport events (default: 256).
    pub fn recv_buffer(mut self, capacity: usize) -> Self {
        self.recv_buffer = capacity;
        self
    }

    /// Set the per-connection outbound queue depth (default: 64).
    pub fn send_buffer(mut self, capacity: usize) -> Self {
        self.send_buffer = capacity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_style_partial_override() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"max_message_size": 4096}"#).unwrap();
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.recv_buffer, 256);
        assert_eq!(config.send_buffer, 64);
    }
}
