//! Checks applied to user input before anything reaches the radio.

/// Hard ceiling imposed by the mesh text frame.
pub const MAX_TEXT_BYTES: usize = 200;

/// Rejections surfaced to the user; none of these are retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("Message is empty")]
    Empty,

    #[error("Message is too long ({bytes} bytes, maximum {max})")]
    TooLong { bytes: usize, max: usize },

    #[error("Not connected to a device")]
    NotConnected,

    #[error("Unknown contact: {0}")]
    UnknownPeer(String),

    #[error("{0} cannot receive text messages")]
    NotChatCapable(String),

    #[error("An identical message is already in this conversation")]
    Duplicate,
}

/// Validate outbound text against the byte budget. Oversized text is rejected,
/// never truncated.
pub fn validate_outbound_text(text: &str, max_bytes: usize) -> Result<(), InputError> {
    if text.trim().is_empty() {
        return Err(InputError::Empty);
    }
    let max = max_bytes.min(MAX_TEXT_BYTES);
    let bytes = text.len();
    if bytes > max {
        return Err(InputError::TooLong { bytes, max });
    }
    Ok(())
}
