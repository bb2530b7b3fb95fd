//! Error kinds surfaced to the orchestration layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors raised by the block device driver.
///
/// Transient array-busy conditions are retried inside the API client and
/// never reach callers; every other remote failure collapses into
/// [`DriverError::Api`] with the remote message attached.
#[derive(Debug, Error)]
pub enum DriverError {
    /// No array volume exists for the given blockdevice id.
    #[error("unknown volume: {0}")]
    UnknownVolume(String),

    /// The volume has no mapping where one is required.
    #[error("volume is not attached: {0}")]
    UnattachedVolume(String),

    /// The volume is already mapped to a different host.
    #[error("volume {0} is already attached to another host")]
    AlreadyAttachedVolume(String),

    /// The volume is still mapped and the operation refuses to proceed.
    #[error("volume {0} is still mapped to a host, detach it first")]
    VolumeMapped(String),

    /// Inconsistent host/IQN state on the array.
    #[error("invalid array state: {0}")]
    InvalidData(String),

    /// A required construction parameter is missing or malformed.
    #[error("improper configuration: {0}")]
    ImproperConfiguration(String),

    /// An array call failed after exhausting retries, or a create/delete
    /// sequence failed partway.
    #[error("array request failed: {0}")]
    Api(String),

    /// The connection to the array could not be established.
    #[error("array connection failure: {0}")]
    Connection(String),
}

impl DriverError {
    /// Attaches a blockdevice or dataset id to a generic API failure.
    pub fn api_for(id: &str, message: impl std::fmt::Display) -> Self {
        DriverError::Api(format!("{} (blockdevice_id: {})", message, id))
    }
}
