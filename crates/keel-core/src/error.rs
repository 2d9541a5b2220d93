use thiserror::Error;

/// Failures that callers are expected to tell apart.
///
/// Everything else travels as a plain `anyhow::Error` with context attached.
/// Use [`find_install_error`] to recover one of these from an error chain.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("invalid version '{input}': {reason}")]
    Format { input: String, reason: String },

    #[error("no installation state found")]
    NotFound,

    #[error("installation state is corrupt: {reason}")]
    Corruption { reason: String },

    #[error("cannot transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("install lock is held by {holder}; gave up after {waited_ms} ms")]
    LockTimeout { holder: String, waited_ms: u64 },

    #[error("step {step_index} ({kind} {target}) failed: {cause}")]
    StepFailure {
        step_index: usize,
        kind: String,
        target: String,
        cause: String,
        rolled_back: bool,
    },
}

impl InstallError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Format { .. } | Self::NotFound | Self::InvalidTransition { .. } => 1,
            Self::Corruption { .. } | Self::StepFailure { .. } => 2,
            Self::LockTimeout { .. } => 3,
        }
    }

    pub fn recovery_hint(&self) -> Option<&'static str> {
        match self {
            Self::Format { .. } => Some("check the version string and try again"),
            Self::NotFound => Some("run `keelctl install <version>` first"),
            Self::Corruption { .. } => Some(
                "manual recovery required: restore the damaged files from a backup snapshot",
            ),
            Self::InvalidTransition { .. } => None,
            Self::LockTimeout { .. } => {
                Some("another operation is running; retry once it has finished")
            }
            Self::StepFailure {
                rolled_back: true, ..
            } => Some("changes were rolled back; fix the cause and retry"),
            Self::StepFailure {
                rolled_back: false,
                ..
            } => Some("operator intervention required: inspect the installation, then run `keelctl repair`"),
        }
    }
}

pub fn find_install_error(err: &anyhow::Error) -> Option<&InstallError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<InstallError>())
}
