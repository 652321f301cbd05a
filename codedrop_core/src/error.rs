//! Error taxonomy for the transfer engine.
//!
//! Every failure that can cross a module boundary is a [`TransferError`].
//! The retry controller only looks at [`TransferError::is_transient`]; the
//! variant itself is what surfaces to the interface layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// The session did not reach a usable channel within the negotiation window.
    #[error("negotiation timed out before a channel opened")]
    NegotiationTimeout,

    /// The signal server already has an open registration for this code and role.
    #[error("code {0} is already in use on this side")]
    CodeConflict(String),

    /// Neither the direct nor the relayed channel could be opened.
    #[error("no transport available to the peer")]
    TransportUnavailable,

    /// A frame was handed to the transport and the transport rejected it.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The transport's outgoing buffer had no room within the send window.
    #[error("transport send buffer is full")]
    SendBufferFull,

    /// Splitting the file at the minimum chunk size would exceed the chunk-count ceiling.
    #[error("file needs {total_chunks} chunks, more than the limit of {limit}")]
    FileTooLarge { total_chunks: u64, limit: u64 },

    /// Assembly was requested before every chunk arrived.
    #[error("transfer incomplete: {received} of {total} chunks received")]
    IncompleteTransfer { received: u64, total: u64 },

    /// A stored chunk no longer matches the checksum its sender computed.
    #[error("checksum mismatch at chunk {index}")]
    ChecksumMismatch { index: u64 },

    /// The peer sent something that does not parse or violates the protocol.
    #[error("malformed peer message: {0}")]
    MalformedMessage(String),

    /// The user cancelled the transfer.
    #[error("transfer cancelled")]
    TransferCancelled,

    /// The signaling connection failed or the server reported an error.
    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether the retry controller may try the operation again.
    ///
    /// Send rejections and buffer-full conditions clear up when the peer
    /// drains its side, and a timed-out negotiation can be restarted.
    /// Everything else ends the operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::NegotiationTimeout
                | TransferError::SendFailed(_)
                | TransferError::SendBufferFull
                | TransferError::Signaling(_)
        )
    }

    /// Stable label for events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::NegotiationTimeout => "negotiation-timeout",
            TransferError::CodeConflict(_) => "code-conflict",
            TransferError::TransportUnavailable => "transport-unavailable",
            TransferError::SendFailed(_) => "send-failed",
            TransferError::SendBufferFull => "send-buffer-full",
            TransferError::FileTooLarge { .. } => "file-too-large",
            TransferError::IncompleteTransfer { .. } => "incomplete-transfer",
            TransferError::ChecksumMismatch { .. } => "checksum-mismatch",
            TransferError::MalformedMessage(_) => "malformed-message",
            TransferError::TransferCancelled => "cancelled",
            TransferError::Signaling(_) => "signaling",
            TransferError::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::MalformedMessage(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransferError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransferError::Signaling(err.to_string())
    }
}

impl From<quinn::ConnectionError> for TransferError {
    fn from(err: quinn::ConnectionError) -> Self {
        TransferError::SendFailed(err.to_string())
    }
}

impl From<quinn::WriteError> for TransferError {
    fn from(err: quinn::WriteError) -> Self {
        TransferError::SendFailed(err.to_string())
    }
}

impl From<quinn::ClosedStream> for TransferError {
    fn from(err: quinn::ClosedStream) -> Self {
        TransferError::SendFailed(err.to_string())
    }
}
