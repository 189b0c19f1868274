use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Failed to connect to window drive: {0}")]
    ConnectionFailed(String),

    #[error(transparent)]
    Device(#[from] crate::device::DeviceError),

    #[error(transparent)]
    InstanceLock(#[from] crate::instance_lock::InstanceLockError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
