//! Execution mode threaded through every call whose behavior depends on training.

/// Whether a forward pass runs for training or for inference.
///
/// Components never store the mode; it is passed into each call that needs it
/// (dropout, the non-finite activation guard).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Dropout is active and overflowing activations are clamped.
    Training,
    /// Deterministic forward pass.
    #[default]
    Inference,
}

impl ExecutionMode {
    /// Returns `true` for [`ExecutionMode::Training`].
    #[must_use]
    pub const fn is_training(self) -> bool {
        matches!(self, Self::Training)
    }
}
