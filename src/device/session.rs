//! Device session contract shared by all drive implementations.

use std::io;
use strum::Display;
use thiserror::Error;

/// Motion/lock state as reported by the drive.
///
/// Exactly one value holds at any instant. `Locked` is the fully closed and
/// latched position; `Locking`/`Unlocking` are the latch transitions during
/// which the drive cannot report a meaningful travel position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Status {
    Open,
    Opening,
    Closing,
    Locked,
    Locking,
    Unlocking,
    Stopped,
    Disconnected,
}

/// Firmware identity reported by the drive on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveInfo {
    pub device: String,
    pub version: String,
}

/// Error raised by a device session.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The session has no open connection to the drive.
    #[error("device is not connected")]
    NotConnected,

    /// A position outside 0..=100 was requested.
    #[error("position {0} is out of range")]
    InvalidPosition(u8),

    /// The drive answered with something unintelligible while the
    /// connection itself stayed up.
    #[error("unexpected device response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Blocking driver contract for a motorised window opener.
///
/// Every method that touches the wire blocks the calling thread; the
/// controller runs them on a worker via `spawn_blocking`. Implementations
/// only need to be `Send`: the controller stops its poll ticker before
/// issuing a command, which guarantees at most one call is in flight.
pub trait DeviceSession: Send {
    /// Open the transport and read the device identity. Returns `Ok(false)`
    /// when the transport opens but the drive does not answer.
    fn connect(&mut self) -> Result<bool, DeviceError>;

    /// Close the transport. Cached state survives for a later reconnect.
    fn disconnect(&mut self);

    /// Start opening the window.
    fn open(&mut self) -> Result<(), DeviceError>;

    /// Start closing the window. A full close runs through the latch and
    /// ends locked.
    fn close(&mut self) -> Result<(), DeviceError>;

    /// Stop any travel at the current position.
    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Move to `target` percent open: issues the single directional command
    /// and arranges for the drive to stop itself when the position estimate
    /// reaches the target. Returns as soon as the command is on the wire;
    /// the session reports `busy()` until the pending stop has fired or was
    /// cancelled by a later command.
    fn set_position(&mut self, target: u8) -> Result<(), DeviceError>;

    /// Seed the internal position estimate without any device I/O. Used to
    /// reinject a persisted position after a restart.
    fn restore_position(&mut self, position: u8) -> Result<(), DeviceError>;

    /// Last known status and position estimate. Never touches the wire; the
    /// time-based part of the estimate is still advanced.
    fn status(&mut self) -> (Status, Option<u8>);

    /// Fresh status query on the wire, updating the cached values. While
    /// `busy()`, serves the cached status instead of contending with the
    /// pending stop.
    fn sync_status(&mut self) -> Result<(Status, Option<u8>), DeviceError>;

    /// True while a set-position stop is still pending inside the driver.
    fn busy(&self) -> bool;

    /// True while the transport is open and the drive was answering.
    fn connected(&self) -> bool;

    /// Firmware identity, available after a successful connect.
    fn info(&self) -> Option<DriveInfo>;

    /// Stable identity derived from the transport endpoint.
    fn unique_id(&self) -> String;
}
