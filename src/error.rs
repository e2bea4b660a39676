use thiserror::Error;

/// Failure kinds surfaced to the RPC caller through its notifier.
///
/// Internal faults (malformed headers, impossible offsets, duplicate
/// arrivals) are logged and the offending packet dropped; they never
/// surface here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer has been silent for the entire timeout budget.
    #[error("peer silent past the timeout budget")]
    Timeout,

    /// The session was aborted or the caller cancelled the request.
    #[error("request canceled")]
    Canceled,

    /// The peer lost its state for this RPC after partially responding.
    /// Retrying the request is safe from the transport's standpoint.
    #[error("peer reset transport state for this RPC")]
    TransportReset,
}
