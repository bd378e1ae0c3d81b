use thiserror::Error;

use crate::image::ImageError;
use crate::process::ProcessError;
use crate::store::StoreError;

/// Everything a lifecycle operation can report back to the operator.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("VM '{0}' not found")]
    NotFound(String),

    #[error("VM '{0}' already exists")]
    DuplicateIdentity(String),

    #[error("fetching the image for VM '{name}' failed: {source}")]
    ImageFetch {
        name: String,
        #[source]
        source: ImageError,
    },

    #[error("resizing the disk of VM '{name}' failed: {source}")]
    Resize {
        name: String,
        #[source]
        source: ImageError,
    },

    #[error("generating the seed for VM '{name}' failed: {source}")]
    SeedGeneration {
        name: String,
        #[source]
        source: ImageError,
    },

    #[error("artifact handling for VM '{name}' failed: {source}")]
    Artifact {
        name: String,
        #[source]
        source: ImageError,
    },

    #[error("starting VM '{name}' failed: {reason}")]
    Launch { name: String, reason: String },

    #[error("stopping VM '{name}' failed: {source}")]
    Stop {
        name: String,
        #[source]
        source: ProcessError,
    },

    #[error("cannot tell whether VM '{name}' is running: {source}")]
    StateUnknown {
        name: String,
        #[source]
        source: ProcessError,
    },

    #[error("VM '{0}' is running; stop it first")]
    Busy(String),

    #[error("VM '{0}' is already running")]
    AlreadyRunning(String),

    #[error("VM '{name}' is partly deleted and its record remains: {source}")]
    PartialRemoval {
        name: String,
        #[source]
        source: ImageError,
    },

    #[error("artifacts of VM '{name}' were removed but its record was not: {source}")]
    PartialDelete {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("store failure: {0}")]
    Storage(#[source] StoreError),
}

impl VmError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        VmError::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Attribute a preparation failure to the phase that produced it.
    pub(crate) fn from_image(name: &str, source: ImageError) -> Self {
        let name = name.to_string();
        match source {
            ImageError::Fetch { .. } => VmError::ImageFetch { name, source },
            ImageError::Resize { .. } => VmError::Resize { name, source },
            ImageError::SeedGeneration { .. } => VmError::SeedGeneration { name, source },
            ImageError::PartialRemoval { .. } => VmError::PartialRemoval { name, source },
            ImageError::Io { .. } => VmError::Artifact { name, source },
        }
    }

    /// Launch failures keep their reason; anything else happened while
    /// stopping.
    pub(crate) fn from_process(name: &str, source: ProcessError) -> Self {
        match source {
            ProcessError::Launch { reason, .. } => VmError::Launch {
                name: name.to_string(),
                reason,
            },
            other => VmError::Stop {
                name: name.to_string(),
                source: other,
            },
        }
    }

    /// The store can no longer be trusted; the process should exit.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VmError::Storage(StoreError::Io { .. }))
    }
}

impl From<StoreError> for VmError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(name) => VmError::NotFound(name),
            other => VmError::Storage(other),
        }
    }
}
