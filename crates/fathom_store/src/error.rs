//! Error kinds surfaced by the dispatch core.
//!
//! Evaluator failures are deliberately absent here: a `RuntimeError` is a
//! value inside a range response's `result`, never a Rust error on the data
//! path. Precondition bugs use debug assertions rather than error returns.

/// A fault in the underlying key/value engine. Fatal to the request, not to
/// the process; the payload carries whatever context the engine attached.
#[derive(Debug, thiserror::Error)]
#[error("engine fault: {0}")]
pub struct EngineError(#[from] pub anyhow::Error);

impl EngineError {
    pub fn msg(message: impl Into<String>) -> EngineError {
        let message: String = message.into();
        EngineError(anyhow::anyhow!(message))
    }
}

/// Errors returned by `protocol_read` / `protocol_write` /
/// `protocol_send_backfill` and friends.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The interruptor was pulsed. Any partially built response is undefined
    /// and must be discarded by the caller.
    #[error("operation interrupted")]
    Interrupted,

    /// The engine failed; propagated unchanged. No retries at this layer.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ProtocolError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ProtocolError::Interrupted)
    }
}
