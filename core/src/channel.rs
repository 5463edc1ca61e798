//! Channel configuration for master/worker communication

/// Channel buffer configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Inbound buffer on the master (all workers -> message handler)
    pub inbound_buffer: usize,

    /// Per-worker outbound queue on both sides
    pub outbound_buffer: usize,

    /// Buffer of the in-process transport
    pub link_buffer: usize,

    /// Periodic stats report buffer (reporter -> consumer)
    pub report_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            inbound_buffer: 4_096,
            outbound_buffer: 256,
            link_buffer: 256,
            report_buffer: 64,
        }
    }
}

impl ChannelConfig {
    /// Set the master inbound buffer size
    pub fn with_inbound_buffer(mut self, size: usize) -> Self {
        self.inbound_buffer = size;
        self
    }

    /// Set the per-worker outbound buffer size
    pub fn with_outbound_buffer(mut self, size: usize) -> Self {
        self.outbound_buffer = size;
        self
    }

    /// Set the stats report buffer size
    pub fn with_report_buffer(mut self, size: usize) -> Self {
        self.report_buffer = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_config_default() {
        let config = ChannelConfig::default();
        assert_eq!(config.inbound_buffer, 4_096);
        assert_eq!(config.outbound_buffer, 256);
        assert_eq!(config.report_buffer, 64);
    }

    #[test]
    fn test_channel_config_builder() {
        let config = ChannelConfig::default()
            .with_inbound_buffer(16)
            .with_outbound_buffer(8)
            .with_report_buffer(4);
        assert_eq!(config.inbound_buffer, 16);
        assert_eq!(config.outbound_buffer, 8);
        assert_eq!(config.report_buffer, 4);
    }
}
