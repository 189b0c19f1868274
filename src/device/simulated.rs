//! In-memory drive for development and the simulation binary.

use std::time::Instant;

use log::debug;

use super::drive::DriveTiming;
use super::session::{DeviceError, DeviceSession, DriveInfo, Status};

/// Simulated window opener. Physics advance whenever the state is read, so
/// no background task is needed; commands take effect instantly on the wire
/// level and the motion itself follows the configured timings.
pub struct SimulatedDrive {
    timing: DriveTiming,
    connected: bool,
    phase: Status,
    position: f64,
    /// Seconds already spent in the current latch phase.
    latch_elapsed: f64,
    /// Pending set-position target; motion stops there instead of at the
    /// travel limits.
    target: Option<f64>,
    updated: Instant,
}

impl SimulatedDrive {
    pub fn new(timing: DriveTiming) -> Self {
        Self {
            timing,
            connected: false,
            phase: Status::Locked,
            position: 0.0,
            latch_elapsed: 0.0,
            target: None,
            updated: Instant::now(),
        }
    }

    /// Integrate the motion over the time since the last tick. A phase can
    /// complete with time to spare; the remainder feeds the next phase so
    /// slow pollers still see consistent motion.
    fn tick(&mut self) {
        let now = Instant::now();
        let mut elapsed = now.duration_since(self.updated).as_secs_f64();
        self.updated = now;
        while elapsed > 0.0 {
            match self.phase {
                Status::Unlocking => {
                    let remaining = self.timing.unlock_secs - self.latch_elapsed;
                    if elapsed < remaining {
                        self.latch_elapsed += elapsed;
                        return;
                    }
                    elapsed -= remaining;
                    self.latch_elapsed = 0.0;
                    self.position = 0.0;
                    self.phase = Status::Opening;
                }
                Status::Opening => {
                    let speed = 100.0 / self.timing.travel_secs;
                    let limit = self.target.unwrap_or(100.0);
                    let headroom = (limit - self.position).max(0.0) / speed;
                    if elapsed < headroom {
                        self.position += elapsed * speed;
                        return;
                    }
                    elapsed -= headroom;
                    self.position = limit;
                    if self.target.take().is_some() {
                        self.phase = Status::Stopped;
                    } else {
                        self.phase = Status::Open;
                    }
                }
                Status::Closing => {
                    let speed = 100.0 / self.timing.travel_secs;
                    let limit = self.target.unwrap_or(0.0);
                    let headroom = (self.position - limit).max(0.0) / speed;
                    if elapsed < headroom {
                        self.position -= elapsed * speed;
                        return;
                    }
                    elapsed -= headroom;
                    self.position = limit;
                    if self.target.take().is_some() {
                        self.phase = Status::Stopped;
                    } else {
                        self.phase = Status::Locking;
                        self.latch_elapsed = 0.0;
                    }
                }
                Status::Locking => {
                    let remaining = self.timing.lock_secs - self.latch_elapsed;
                    if elapsed < remaining {
                        self.latch_elapsed += elapsed;
                        return;
                    }
                    elapsed -= remaining;
                    self.latch_elapsed = 0.0;
                    self.phase = Status::Locked;
                }
                Status::Open
                | Status::Locked
                | Status::Stopped
                | Status::Disconnected => return,
            }
        }
    }
}

impl DeviceSession for SimulatedDrive {
    fn connect(&mut self) -> Result<bool, DeviceError> {
        self.connected = true;
        self.updated = Instant::now();
        debug!("simulated drive connected");
        Ok(true)
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        self.tick();
        self.target = None;
        match self.phase {
            Status::Locked | Status::Locking => {
                self.phase = Status::Unlocking;
                self.latch_elapsed = 0.0;
                self.position = 0.0;
            }
            _ if self.position < 100.0 => self.phase = Status::Opening,
            _ => self.phase = Status::Open,
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        self.tick();
        self.target = None;
        match self.phase {
            Status::Locked | Status::Locking => {}
            _ if self.position > 0.0 => self.phase = Status::Closing,
            _ => {
                self.phase = Status::Locking;
                self.latch_elapsed = 0.0;
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        self.tick();
        self.target = None;
        if matches!(
            self.phase,
            Status::Opening | Status::Closing | Status::Unlocking
        ) {
            self.phase = Status::Stopped;
        }
        Ok(())
    }

    fn set_position(&mut self, target: u8) -> Result<(), DeviceError> {
        if target > 100 {
            return Err(DeviceError::InvalidPosition(target));
        }
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        self.tick();
        let target_f = f64::from(target);
        if matches!(self.phase, Status::Locked | Status::Locking) {
            if target == 0 {
                return Ok(());
            }
            self.phase = Status::Unlocking;
            self.latch_elapsed = 0.0;
            self.position = 0.0;
            self.target = if target == 100 { None } else { Some(target_f) };
            return Ok(());
        }
        if (target_f - self.position).abs() < 0.5 {
            self.target = None;
            return Ok(());
        }
        if target_f > self.position {
            self.target = if target == 100 { None } else { Some(target_f) };
            self.phase = Status::Opening;
        } else {
            self.target = if target == 0 { None } else { Some(target_f) };
            self.phase = Status::Closing;
        }
        Ok(())
    }

    fn restore_position(&mut self, position: u8) -> Result<(), DeviceError> {
        if position > 100 {
            return Err(DeviceError::InvalidPosition(position));
        }
        if matches!(self.phase, Status::Open | Status::Stopped) {
            self.position = f64::from(position);
            self.phase = if position == 100 {
                Status::Open
            } else {
                Status::Stopped
            };
        }
        Ok(())
    }

    fn status(&mut self) -> (Status, Option<u8>) {
        if !self.connected {
            return (Status::Disconnected, Some(self.position.round() as u8));
        }
        self.tick();
        (
            self.phase,
            Some(self.position.round().clamp(0.0, 100.0) as u8),
        )
    }

    fn sync_status(&mut self) -> Result<(Status, Option<u8>), DeviceError> {
        if !self.connected {
            self.connected = true;
            self.updated = Instant::now();
        }
        Ok(self.status())
    }

    fn busy(&self) -> bool {
        false
    }

    fn connected(&self) -> bool {
        self.connected
    }

    fn info(&self) -> Option<DriveInfo> {
        Some(DriveInfo {
            device: "AXA Remote (simulated)".to_string(),
            version: "V0.0".to_string(),
        })
    }

    fn unique_id(&self) -> String {
        "simulated".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn fast_sim() -> SimulatedDrive {
        let mut sim = SimulatedDrive::new(DriveTiming {
            unlock_secs: 0.02,
            travel_secs: 0.1,
            lock_secs: 0.02,
        });
        sim.connect().unwrap();
        sim
    }

    #[test]
    fn test_full_open_cycle() {
        let mut sim = fast_sim();
        assert_eq!(sim.status().0, Status::Locked);

        sim.open().unwrap();
        assert_eq!(sim.status().0, Status::Unlocking);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(sim.status(), (Status::Open, Some(100)));
    }

    #[test]
    fn test_unlock_progress_survives_frequent_polls() {
        let mut sim = SimulatedDrive::new(DriveTiming {
            unlock_secs: 0.1,
            travel_secs: 0.1,
            lock_secs: 0.02,
        });
        sim.connect().unwrap();
        sim.open().unwrap();

        // Poll much faster than the unlock phase completes.
        for _ in 0..30 {
            sim.status();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(sim.status(), (Status::Open, Some(100)));
    }

    #[test]
    fn test_set_position_stops_at_target() {
        let mut sim = fast_sim();
        sim.open().unwrap();
        thread::sleep(Duration::from_millis(200));

        sim.set_position(30).unwrap();
        thread::sleep(Duration::from_millis(150));

        let (status, position) = sim.status();
        assert_eq!(status, Status::Stopped);
        assert_eq!(position, Some(30));
    }

    #[test]
    fn test_set_position_from_locked_unlocks_first() {
        let mut sim = fast_sim();
        sim.set_position(50).unwrap();
        assert_eq!(sim.status().0, Status::Unlocking);

        thread::sleep(Duration::from_millis(200));
        assert_eq!(sim.status(), (Status::Stopped, Some(50)));
    }

    #[test]
    fn test_close_latches() {
        let mut sim = fast_sim();
        sim.open().unwrap();
        thread::sleep(Duration::from_millis(200));

        sim.close().unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(sim.status(), (Status::Locked, Some(0)));
    }
}
