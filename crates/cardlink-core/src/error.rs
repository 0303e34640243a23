use thiserror::Error;

/// Transport-level error taxonomy shared by every channel implementation.
///
/// Nothing in the transport retries on its own; each variant is surfaced to
/// the immediate caller, which owns the retry decision.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Radio-level connect/discovery failure.
    #[error("link error: {0}")]
    Link(&'static str),
    /// The peer does not expose the expected service/characteristics, or it
    /// answered the capability handshake with something unexpected.
    #[error("peer does not speak the expected protocol")]
    ProtocolMismatch,
    /// Fragment submission was not acknowledged within the bound.
    #[error("fragment write not confirmed within {0} ms")]
    WriteTimeout(u64),
    /// The radio stack acknowledged the fragment write as failed.
    #[error("fragment write rejected by the radio stack")]
    WriteFailed,
    /// No inbound fragment arrived within the bound.
    #[error("no inbound fragment within {0} ms")]
    ReadTimeout(u64),
    /// Bonding did not complete.
    #[error("bonding did not complete")]
    PairingFailed,
    /// Operation attempted outside the Ready state.
    #[error("channel is not connected")]
    NotConnected,
    /// Operation attempted on an explicitly closed channel.
    #[error("channel is closed")]
    Closed,
}
