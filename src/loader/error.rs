use thiserror::Error;

use crate::backend::BackendError;

/// Why a loader handle resolved without a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The batch call for this key's window failed. Every handle in the
    /// window sees the same error.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// `load` was called on a loader from inside its own batch function.
    #[error("loader `{loader}` was used from inside its own batch function")]
    Reentrant { loader: &'static str },
    /// The owning request was aborted before the result arrived.
    #[error("request aborted before the load completed")]
    Aborted,
}

impl LoadError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
