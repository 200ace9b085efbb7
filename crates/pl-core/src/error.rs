use thiserror::Error;

/// A status line that carried a known prefix but an unusable payload.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolViolation {
    #[error("progress value `{value}` is not a valid step count")]
    InvalidProgress { value: String },

    #[error("progress value {value} is outside 0..={max}")]
    ProgressOutOfRange { value: u32, max: u32 },

    #[error("image payload is not valid hex: {source}")]
    InvalidImage {
        #[source]
        source: hex::FromHexError,
    },
}

/// Anything a [`ProgressChannel`](crate::progress::ProgressChannel) can yield instead of an event.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),

    #[error("failed to read worker output: {0}")]
    Read(#[from] std::io::Error),
}
