//! Error taxonomy for the compute core.
//!
//! Every fallible operation returns [`Result`]; nothing in this crate aborts
//! the process. Driver return codes are classified once, here, so that
//! memory exhaustion reports as [`ComputeError::AllocationFailure`] whichever
//! stage hit it.

use std::time::Duration;

use ash::prelude::VkResult;
use ash::vk;
use thiserror::Error;

/// Errors produced by the compute core.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// Loader, instance, device or layout creation failed.
    #[error("initialization failed: {context}")]
    Initialization {
        context: String,
        #[source]
        result: Option<vk::Result>,
    },

    /// No physical device or queue family satisfies the selection criteria.
    #[error("no suitable device: {0}")]
    NoSuitableDevice(String),

    /// No memory type is both host-visible and host-coherent.
    #[error(
        "no suitable memory type: allowed types {type_bits:#034b}, required properties {required:?}"
    )]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    /// Device memory, host memory or descriptor pool exhausted.
    #[error("allocation failed: {context}")]
    AllocationFailure {
        context: String,
        #[source]
        result: Option<vk::Result>,
    },

    /// Bytecode is malformed or the device rejected it.
    #[error("shader load failed: {context}")]
    ShaderLoad {
        context: String,
        #[source]
        result: Option<vk::Result>,
    },

    /// The fence was not signaled within the configured bound.
    #[error("submission timed out after {timeout:?}")]
    SubmissionTimeout { timeout: Duration },

    /// Any other driver failure (device lost, submit rejected, ...).
    #[error("device error during {context}: {result}")]
    Device {
        context: &'static str,
        #[source]
        result: vk::Result,
    },

    /// The caller broke an API contract (bad slot, misaligned offset, ...).
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// A resource was released twice or used after release.
    #[error("{0} was already released")]
    AlreadyReleased(&'static str),
}

/// Coarse classification of [`ComputeError`], stable for callers that map
/// failures to exit codes or metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Initialization,
    NoSuitableDevice,
    NoSuitableMemoryType,
    AllocationFailure,
    ShaderLoad,
    SubmissionTimeout,
    Device,
    InvalidUsage,
}

impl ComputeError {
    /// The kind this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Initialization { .. } => ErrorKind::Initialization,
            Self::NoSuitableDevice(_) => ErrorKind::NoSuitableDevice,
            Self::NoSuitableMemoryType { .. } => ErrorKind::NoSuitableMemoryType,
            Self::AllocationFailure { .. } => ErrorKind::AllocationFailure,
            Self::ShaderLoad { .. } => ErrorKind::ShaderLoad,
            Self::SubmissionTimeout { .. } => ErrorKind::SubmissionTimeout,
            Self::Device { .. } => ErrorKind::Device,
            Self::InvalidUsage(_) | Self::AlreadyReleased(_) => ErrorKind::InvalidUsage,
        }
    }

    pub(crate) fn init(context: impl Into<String>) -> Self {
        Self::Initialization { context: context.into(), result: None }
    }

    pub(crate) fn allocation(context: impl Into<String>) -> Self {
        Self::AllocationFailure { context: context.into(), result: None }
    }

    pub(crate) fn shader(context: impl Into<String>) -> Self {
        Self::ShaderLoad { context: context.into(), result: None }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidUsage(message.into())
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, ComputeError>;

/// Whether a driver code means some memory pool ran dry.
pub fn is_exhaustion(result: vk::Result) -> bool {
    matches!(
        result,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY
            | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
            | vk::Result::ERROR_OUT_OF_POOL_MEMORY
            | vk::Result::ERROR_FRAGMENTED_POOL
            | vk::Result::ERROR_FRAGMENTATION
            | vk::Result::ERROR_TOO_MANY_OBJECTS
    )
}

/// Attach a stage to a raw `VkResult`, classifying exhaustion first.
pub(crate) trait VkResultExt<T> {
    /// Failure is an [`ComputeError::Initialization`].
    fn or_init(self, context: &'static str) -> Result<T>;
    /// Failure is an [`ComputeError::AllocationFailure`].
    fn or_alloc(self, context: &'static str) -> Result<T>;
    /// Failure is a [`ComputeError::ShaderLoad`].
    fn or_shader(self, context: &'static str) -> Result<T>;
    /// Failure is a [`ComputeError::Device`].
    fn or_device(self, context: &'static str) -> Result<T>;
}

fn exhausted(context: &'static str, result: vk::Result) -> ComputeError {
    ComputeError::AllocationFailure { context: context.to_string(), result: Some(result) }
}

impl<T> VkResultExt<T> for VkResult<T> {
    fn or_init(self, context: &'static str) -> Result<T> {
        self.map_err(|result| {
            if is_exhaustion(result) {
                exhausted(context, result)
            } else {
                ComputeError::Initialization { context: context.to_string(), result: Some(result) }
            }
        })
    }

    fn or_alloc(self, context: &'static str) -> Result<T> {
        self.map_err(|result| exhausted(context, result))
    }

    fn or_shader(self, context: &'static str) -> Result<T> {
        self.map_err(|result| {
            if is_exhaustion(result) {
                exhausted(context, result)
            } else {
                ComputeError::ShaderLoad { context: context.to_string(), result: Some(result) }
            }
        })
    }

    fn or_device(self, context: &'static str) -> Result<T> {
        self.map_err(|result| {
            if is_exhaustion(result) {
                exhausted(context, result)
            } else {
                ComputeError::Device { context, result }
            }
        })
    }
}
