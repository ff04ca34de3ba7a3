//! Host-facing error types.
//!
//! Inside the VM, exception flow is the [`crate::throw::Unwind`] sentinel
//! plus the pending exception object on the context. These types are what
//! the embedding host sees at the outermost boundary.

use thiserror::Error;

/// Errors surfaced to the embedder by the VM lifecycle entry points.
#[derive(Debug, Error)]
pub enum VmError {
    /// A managed exception escaped the outermost frame of the main thread.
    #[error("uncaught exception in {thread}: {class}: {message}")]
    UncaughtException {
        /// Thread the exception escaped from.
        thread: String,
        /// Internal name of the exception's class.
        class: String,
        /// The throwable's message, or an empty string.
        message: String,
    },

    /// An operation was attempted while the VM is shutting down.
    #[error("VM is shutting down")]
    ShuttingDown,
}
