use crate::line::DEFAULT_MAX_LINE_BYTES;

/// Runtime knobs the relay core needs once it is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Lines longer than this end the sending client's session.
    pub max_line_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}
