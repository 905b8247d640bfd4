// Exit codes for precise CI triage
use vkcompute::{ComputeError, ConfigError, ErrorKind};

use crate::payload::VerificationError;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_GENERIC_FAIL: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_INITIALIZATION: i32 = 3;
pub const EXIT_NO_DEVICE: i32 = 4;
pub const EXIT_NO_MEMORY_TYPE: i32 = 5;
pub const EXIT_ALLOCATION: i32 = 6;
pub const EXIT_SHADER_LOAD: i32 = 7;
pub const EXIT_TIMEOUT: i32 = 8;
pub const EXIT_DEVICE: i32 = 9;
pub const EXIT_INVALID_USAGE: i32 = 10;
pub const EXIT_VERIFY_FAIL: i32 = 11;

pub fn for_kind(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Initialization => EXIT_INITIALIZATION,
        ErrorKind::NoSuitableDevice => EXIT_NO_DEVICE,
        ErrorKind::NoSuitableMemoryType => EXIT_NO_MEMORY_TYPE,
        ErrorKind::AllocationFailure => EXIT_ALLOCATION,
        ErrorKind::ShaderLoad => EXIT_SHADER_LOAD,
        ErrorKind::SubmissionTimeout => EXIT_TIMEOUT,
        ErrorKind::Device => EXIT_DEVICE,
        ErrorKind::InvalidUsage => EXIT_INVALID_USAGE,
    }
}

/// First recognised error in the chain decides the exit code.
pub fn for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<ComputeError>() {
            return for_kind(e.kind());
        }
        if cause.is::<ConfigError>() {
            return EXIT_CONFIG;
        }
        if cause.is::<VerificationError>() {
            return EXIT_VERIFY_FAIL;
        }
    }
    EXIT_GENERIC_FAIL
}
