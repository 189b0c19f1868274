//! Drivers for the motorised window opener.

pub mod drive;
pub mod session;
pub mod simulated;
pub mod transport;

pub use drive::{DriveTiming, WindowDrive};
pub use session::{DeviceError, DeviceSession, DriveInfo, Status};
pub use simulated::SimulatedDrive;
pub use transport::{SerialTransport, TelnetTransport, Transport};
