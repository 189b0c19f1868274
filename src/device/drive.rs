//! Driver for the AXA Remote window opener.
//!
//! The drive only ever reports its latch state (locked, weak locked or
//! unlocked), never a travel position. The driver therefore keeps a
//! time-based position estimate derived from the configured unlock, travel
//! and lock durations, and corrects it whenever the wire confirms a latch
//! state that contradicts it.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use super::session::{DeviceError, DeviceSession, DriveInfo, Status};
use super::transport::Transport;

const CMD_DEVICE: &str = "DEVICE";
const CMD_VERSION: &str = "VERSION";
const CMD_OPEN: &str = "OPEN";
const CMD_CLOSE: &str = "CLOSE";
const CMD_STOP: &str = "STOP";
const CMD_STATUS: &str = "STATUS";

/// Motion durations of a drive, in seconds. `travel_secs` covers the full
/// stroke from the sill to fully open, excluding the latch phases.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveTiming {
    pub unlock_secs: f64,
    pub travel_secs: f64,
    pub lock_secs: f64,
}

impl Default for DriveTiming {
    fn default() -> Self {
        Self {
            unlock_secs: 5.0,
            travel_secs: 42.0,
            lock_secs: 5.0,
        }
    }
}

/// Latch state as reported by a STATUS query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Locked,
    WeakLocked,
    Unlocked,
}

fn split_reply(reply: &str) -> Result<(u16, &str), DeviceError> {
    let (code, text) = reply
        .split_once(' ')
        .ok_or_else(|| DeviceError::Protocol(reply.to_string()))?;
    let code = code
        .parse::<u16>()
        .map_err(|_| DeviceError::Protocol(reply.to_string()))?;
    Ok((code, text.trim()))
}

fn parse_lock_state(text: &str) -> Result<LockState, DeviceError> {
    let lowered = text.to_ascii_lowercase();
    if lowered.contains("unlocked") {
        return Ok(LockState::Unlocked);
    }
    if lowered.contains("weak") {
        return Ok(LockState::WeakLocked);
    }
    if lowered.contains("locked") {
        return Ok(LockState::Locked);
    }
    Err(DeviceError::Protocol(text.to_string()))
}

/// Time-based position estimate. `anchor` is the position at the start of
/// the current phase; `position` is a percentage, 0 closed and 100 open.
#[derive(Debug, Clone, Copy)]
struct Estimator {
    phase: Status,
    position: f64,
    anchor: f64,
    phase_started: Instant,
}

impl Estimator {
    fn initial(lock_state: LockState, now: Instant) -> Self {
        // Without a calibrated position an unlocked window is assumed to be
        // fully open; a later restore or lock confirmation corrects this.
        let (phase, position) = match lock_state {
            LockState::Locked => (Status::Locked, 0.0),
            LockState::WeakLocked => (Status::Locking, 0.0),
            LockState::Unlocked => (Status::Open, 100.0),
        };
        Self {
            phase,
            position,
            anchor: position,
            phase_started: now,
        }
    }

    fn begin(&mut self, phase: Status, anchor: f64, now: Instant) {
        self.phase = phase;
        self.anchor = anchor;
        self.position = anchor;
        self.phase_started = now;
    }

    fn halt(&mut self, now: Instant) {
        let position = self.position;
        self.begin(Status::Stopped, position, now);
    }

    fn position_percent(&self) -> u8 {
        self.position.round().clamp(0.0, 100.0) as u8
    }

    /// Advance the estimate to `now`, walking through phase transitions
    /// (unlock into travel, travel into latch, latch into locked).
    fn advance(&mut self, timing: &DriveTiming, now: Instant) {
        loop {
            let elapsed = now
                .saturating_duration_since(self.phase_started)
                .as_secs_f64();
            match self.phase {
                Status::Unlocking => {
                    if elapsed < timing.unlock_secs {
                        self.position = 0.0;
                        return;
                    }
                    self.phase = Status::Opening;
                    self.anchor = 0.0;
                    self.phase_started += Duration::from_secs_f64(timing.unlock_secs);
                }
                Status::Opening => {
                    self.position =
                        (self.anchor + elapsed / timing.travel_secs * 100.0).min(100.0);
                    if self.position >= 100.0 {
                        self.phase = Status::Open;
                    }
                    return;
                }
                Status::Closing => {
                    self.position =
                        (self.anchor - elapsed / timing.travel_secs * 100.0).max(0.0);
                    if self.position > 0.0 {
                        return;
                    }
                    // Sill reached; the remaining time goes into the latch.
                    self.phase = Status::Locking;
                    self.phase_started +=
                        Duration::from_secs_f64(self.anchor / 100.0 * timing.travel_secs);
                    self.anchor = 0.0;
                }
                Status::Locking => {
                    self.position = 0.0;
                    if elapsed >= timing.lock_secs {
                        self.phase = Status::Locked;
                    }
                    return;
                }
                Status::Locked => {
                    self.position = 0.0;
                    return;
                }
                Status::Open | Status::Stopped | Status::Disconnected => return,
            }
        }
    }
}

/// Cancellation signal for a scheduled stop.
struct StopSignal {
    cancelled: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            cancelled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.cv.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock()
    }

    /// Block until the timeout elapses or the signal is cancelled.
    /// Returns true when cancelled.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.cv.wait_for(&mut cancelled, deadline - now);
        }
        *cancelled
    }
}

struct StopJob {
    signal: Arc<StopSignal>,
}

struct Inner<T: Transport> {
    transport: T,
    timing: DriveTiming,
    connected: bool,
    info: Option<DriveInfo>,
    estimator: Option<Estimator>,
    stop_job: Option<StopJob>,
}

impl<T: Transport> Inner<T> {
    fn cancel_stop(&mut self) {
        if let Some(job) = self.stop_job.take() {
            job.signal.cancel();
        }
    }

    fn drop_connection(&mut self, reason: &std::io::Error) {
        if self.connected {
            warn!(
                "connection to {} lost: {reason}",
                self.transport.describe()
            );
        }
        self.connected = false;
        self.transport.close();
        self.cancel_stop();
    }

    /// Send one command and parse the reply into (code, text). A wire error
    /// tears the connection down.
    fn query(&mut self, command: &str) -> Result<(u16, String), DeviceError> {
        match self.transport.exchange(command) {
            Ok(reply) => {
                let (code, text) = split_reply(&reply)?;
                Ok((code, text.to_string()))
            }
            Err(e) => {
                self.drop_connection(&e);
                Err(DeviceError::Io(e))
            }
        }
    }

    fn command(&mut self, command: &str) -> Result<(), DeviceError> {
        if !self.connected {
            return Err(DeviceError::NotConnected);
        }
        let (code, text) = self.query(command)?;
        if !(200..300).contains(&code) {
            return Err(DeviceError::Protocol(format!("{code} {text}")));
        }
        Ok(())
    }

    fn query_lock_state(&mut self) -> Result<LockState, DeviceError> {
        let (_, text) = self.query(CMD_STATUS)?;
        parse_lock_state(&text)
    }

    /// Identify the drive and read its latch state over a freshly opened
    /// transport.
    fn handshake(&mut self) -> Result<(), DeviceError> {
        let (_, device) = self.query(CMD_DEVICE)?;
        let (_, version) = self.query(CMD_VERSION)?;
        let lock_state = self.query_lock_state()?;
        info!(
            "connected to {device} ({version}) on {}",
            self.transport.describe()
        );
        self.info = Some(DriveInfo { device, version });
        self.connected = true;
        let now = Instant::now();
        match self.estimator.as_mut() {
            None => self.estimator = Some(Estimator::initial(lock_state, now)),
            Some(est) => {
                // The drive kept moving during an outage; fast-forward the
                // estimate before applying the wire confirmation.
                est.advance(&self.timing, now);
                self.apply_lock_state(lock_state, now);
            }
        }
        Ok(())
    }

    fn advance(&mut self, now: Instant) {
        if !self.connected {
            return;
        }
        if let Some(est) = self.estimator.as_mut() {
            est.advance(&self.timing, now);
        }
    }

    fn cached(&self) -> (Status, Option<u8>) {
        let position = self.estimator.as_ref().map(Estimator::position_percent);
        if !self.connected {
            return (Status::Disconnected, position);
        }
        match self.estimator.as_ref() {
            Some(est) => (est.phase, position),
            None => (Status::Disconnected, None),
        }
    }

    /// Merge a wire latch report into the estimate. A confirmed lock always
    /// wins; anything else only corrects the estimate when it contradicts
    /// it, which means the window was moved by its own remote control.
    fn apply_lock_state(&mut self, lock_state: LockState, now: Instant) {
        let Some(est) = self.estimator.as_mut() else {
            self.estimator = Some(Estimator::initial(lock_state, now));
            return;
        };
        match lock_state {
            LockState::Locked => {
                if est.phase != Status::Locked {
                    debug!("drive confirms locked");
                    est.begin(Status::Locked, 0.0, now);
                }
            }
            LockState::WeakLocked => match est.phase {
                Status::Locked | Status::Locking | Status::Unlocking => {}
                Status::Closing => {
                    debug!("latch engaged ahead of the estimate");
                    est.begin(Status::Locking, 0.0, now);
                }
                _ => {
                    warn!("latch engaging without a known command, assuming closing");
                    est.begin(Status::Locking, 0.0, now);
                }
            },
            LockState::Unlocked => {
                if est.phase == Status::Locked {
                    warn!("drive reports unlocked but was believed locked, assuming fully open");
                    est.begin(Status::Open, 100.0, now);
                }
            }
        }
    }
}

/// Session over a line transport. Cheap to share: the actual state lives
/// behind a lock so the scheduled-stop worker can reach it.
pub struct WindowDrive<T: Transport> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: Transport + 'static> WindowDrive<T> {
    pub fn new(transport: T, timing: DriveTiming) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                transport,
                timing,
                connected: false,
                info: None,
                estimator: None,
                stop_job: None,
            })),
        }
    }

    /// Spawn the worker that issues STOP once the estimate reaches the
    /// requested target, unless a later command cancels it first.
    fn schedule_stop(
        inner: &mut Inner<T>,
        arc: &Arc<Mutex<Inner<T>>>,
        eta: Duration,
    ) -> Result<(), DeviceError> {
        let signal = Arc::new(StopSignal::new());
        let worker_signal = Arc::clone(&signal);
        let worker_inner = Arc::clone(arc);
        let spawned = thread::Builder::new()
            .name("drive-stop".to_string())
            .spawn(move || {
                if worker_signal.wait(eta) {
                    return;
                }
                let mut inner = worker_inner.lock();
                // A later command may have won the lock first.
                if worker_signal.is_cancelled() {
                    return;
                }
                inner.stop_job = None;
                let now = Instant::now();
                inner.advance(now);
                match inner.command(CMD_STOP) {
                    Ok(()) => {
                        if let Some(est) = inner.estimator.as_mut() {
                            if matches!(
                                est.phase,
                                Status::Opening | Status::Closing | Status::Unlocking
                            ) {
                                est.halt(now);
                            }
                        }
                        debug!("scheduled stop issued");
                    }
                    Err(e) => warn!("scheduled stop failed: {e}"),
                }
            });
        match spawned {
            Ok(_) => {
                inner.stop_job = Some(StopJob { signal });
                Ok(())
            }
            Err(e) => {
                // No worker means nothing would ever stop the travel.
                let _ = inner.command(CMD_STOP);
                Err(DeviceError::Io(e))
            }
        }
    }
}

impl<T: Transport + 'static> DeviceSession for WindowDrive<T> {
    fn connect(&mut self) -> Result<bool, DeviceError> {
        let mut inner = self.inner.lock();
        if inner.connected {
            return Ok(true);
        }
        if !inner.transport.is_open() {
            inner.transport.open()?;
        }
        match inner.handshake() {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!(
                    "drive on {} did not answer: {e}",
                    inner.transport.describe()
                );
                inner.transport.close();
                Ok(false)
            }
        }
    }

    fn disconnect(&mut self) {
        let mut inner = self.inner.lock();
        inner.cancel_stop();
        if inner.connected {
            info!("disconnected from {}", inner.transport.describe());
        }
        inner.transport.close();
        inner.connected = false;
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        inner.cancel_stop();
        let now = Instant::now();
        inner.advance(now);
        inner.command(CMD_OPEN)?;
        if let Some(est) = inner.estimator.as_mut() {
            match est.phase {
                Status::Locked | Status::Locking => est.begin(Status::Unlocking, 0.0, now),
                _ if est.position < 100.0 => {
                    let anchor = est.position;
                    est.begin(Status::Opening, anchor, now);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        inner.cancel_stop();
        let now = Instant::now();
        inner.advance(now);
        inner.command(CMD_CLOSE)?;
        if let Some(est) = inner.estimator.as_mut() {
            match est.phase {
                Status::Locked | Status::Locking => {}
                _ if est.position > 0.0 => {
                    let anchor = est.position;
                    est.begin(Status::Closing, anchor, now);
                }
                _ => est.begin(Status::Locking, 0.0, now),
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock();
        inner.cancel_stop();
        let now = Instant::now();
        inner.advance(now);
        inner.command(CMD_STOP)?;
        if let Some(est) = inner.estimator.as_mut() {
            if matches!(
                est.phase,
                Status::Opening | Status::Closing | Status::Unlocking
            ) {
                est.halt(now);
            }
        }
        Ok(())
    }

    fn set_position(&mut self, target: u8) -> Result<(), DeviceError> {
        if target > 100 {
            return Err(DeviceError::InvalidPosition(target));
        }
        let mut inner = self.inner.lock();
        inner.cancel_stop();
        if !inner.connected {
            return Err(DeviceError::NotConnected);
        }
        let now = Instant::now();
        inner.advance(now);
        let (current, phase) = match inner.estimator.as_ref() {
            Some(est) => (est.position, est.phase),
            None => return Err(DeviceError::NotConnected),
        };
        let target_f = f64::from(target);
        if (target_f - current).abs() < 0.5 {
            debug!("already at {target}%, no travel needed");
            return Ok(());
        }
        let timing = inner.timing;
        let eta_secs = if target_f > current {
            inner.command(CMD_OPEN)?;
            let est = inner.estimator.as_mut().ok_or(DeviceError::NotConnected)?;
            if matches!(phase, Status::Locked | Status::Locking) {
                est.begin(Status::Unlocking, 0.0, now);
                timing.unlock_secs + target_f / 100.0 * timing.travel_secs
            } else {
                est.begin(Status::Opening, current, now);
                (target_f - current) / 100.0 * timing.travel_secs
            }
        } else {
            inner.command(CMD_CLOSE)?;
            let est = inner.estimator.as_mut().ok_or(DeviceError::NotConnected)?;
            est.begin(Status::Closing, current, now);
            (current - target_f) / 100.0 * timing.travel_secs
        };
        // The end stop and the latch terminate full travels on their own.
        if target == 0 || target == 100 {
            return Ok(());
        }
        debug!("moving to {target}%, stop scheduled in {eta_secs:.1}s");
        Self::schedule_stop(&mut inner, &self.inner, Duration::from_secs_f64(eta_secs))
    }

    fn restore_position(&mut self, position: u8) -> Result<(), DeviceError> {
        if position > 100 {
            return Err(DeviceError::InvalidPosition(position));
        }
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let phase = if position == 100 {
            Status::Open
        } else {
            Status::Stopped
        };
        match inner.estimator.as_mut() {
            Some(est) => match est.phase {
                Status::Open | Status::Stopped => est.begin(phase, f64::from(position), now),
                other => {
                    debug!("drive is {other}, ignoring restored position {position}%");
                    return Ok(());
                }
            },
            None => {
                let mut est = Estimator::initial(LockState::Unlocked, now);
                est.begin(phase, f64::from(position), now);
                inner.estimator = Some(est);
            }
        }
        debug!("position estimate restored to {position}%");
        Ok(())
    }

    fn status(&mut self) -> (Status, Option<u8>) {
        let mut inner = self.inner.lock();
        inner.advance(Instant::now());
        inner.cached()
    }

    fn sync_status(&mut self) -> Result<(Status, Option<u8>), DeviceError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if inner.stop_job.is_some() {
            // A scheduled stop owns the wire; serve the advanced estimate.
            inner.advance(now);
            return Ok(inner.cached());
        }
        if !inner.connected {
            inner.transport.close();
            match inner.transport.open() {
                Ok(()) => {
                    if let Err(e) = inner.handshake() {
                        debug!("reconnect handshake failed: {e}");
                        inner.transport.close();
                    }
                }
                Err(e) => debug!(
                    "reconnect to {} failed: {e}",
                    inner.transport.describe()
                ),
            }
            return Ok(inner.cached());
        }
        inner.advance(now);
        match inner.query_lock_state() {
            Ok(lock_state) => {
                inner.apply_lock_state(lock_state, now);
                Ok(inner.cached())
            }
            // The wire went away; report disconnected instead of failing.
            Err(DeviceError::Io(_)) => Ok(inner.cached()),
            Err(e) => Err(e),
        }
    }

    fn busy(&self) -> bool {
        self.inner.lock().stop_job.is_some()
    }

    fn connected(&self) -> bool {
        self.inner.lock().connected
    }

    fn info(&self) -> Option<DriveInfo> {
        self.inner.lock().info.clone()
    }

    fn unique_id(&self) -> String {
        self.inner.lock().transport.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Test timings short enough to walk full cycles in milliseconds.
    fn fast_timing() -> DriveTiming {
        DriveTiming {
            unlock_secs: 0.05,
            travel_secs: 0.2,
            lock_secs: 0.05,
        }
    }

    struct FakeTransport {
        sent: Arc<Mutex<Vec<String>>>,
        lock_reply: Arc<Mutex<String>>,
        fail: Arc<AtomicBool>,
        open: bool,
    }

    impl Transport for FakeTransport {
        fn open(&mut self) -> io::Result<()> {
            self.open = true;
            Ok(())
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn exchange(&mut self, command: &str) -> io::Result<String> {
            if !self.open {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "not open"));
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply"));
            }
            self.sent.lock().push(command.to_string());
            Ok(match command {
                CMD_DEVICE => "260 AXA RV2900".to_string(),
                CMD_VERSION => "261 Firmware V1.08".to_string(),
                CMD_STATUS => format!("210 {}", self.lock_reply.lock()),
                _ => "200 OK".to_string(),
            })
        }

        fn describe(&self) -> String {
            "fake:0".to_string()
        }
    }

    struct Fixture {
        drive: WindowDrive<FakeTransport>,
        sent: Arc<Mutex<Vec<String>>>,
        lock_reply: Arc<Mutex<String>>,
        fail: Arc<AtomicBool>,
    }

    fn fixture(lock_state: &str) -> Fixture {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let lock_reply = Arc::new(Mutex::new(lock_state.to_string()));
        let fail = Arc::new(AtomicBool::new(false));
        let transport = FakeTransport {
            sent: Arc::clone(&sent),
            lock_reply: Arc::clone(&lock_reply),
            fail: Arc::clone(&fail),
            open: false,
        };
        Fixture {
            drive: WindowDrive::new(transport, fast_timing()),
            sent,
            lock_reply,
            fail,
        }
    }

    fn sleep_ms(ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn count_sent(fx: &Fixture, command: &str) -> usize {
        fx.sent.lock().iter().filter(|c| *c == command).count()
    }

    #[test]
    fn test_connect_reads_identity_and_lock_state() {
        let mut fx = fixture("Strong Locked");
        assert!(fx.drive.connect().unwrap());
        assert!(fx.drive.connected());

        let info = fx.drive.info().unwrap();
        assert_eq!(info.device, "AXA RV2900");
        assert_eq!(info.version, "Firmware V1.08");
        assert_eq!(fx.drive.unique_id(), "fake:0");
        assert_eq!(fx.drive.status(), (Status::Locked, Some(0)));
    }

    #[test]
    fn test_connect_unlocked_assumes_fully_open() {
        let mut fx = fixture("Unlocked");
        assert!(fx.drive.connect().unwrap());
        assert_eq!(fx.drive.status(), (Status::Open, Some(100)));
    }

    #[test]
    fn test_connect_without_reply_returns_false() {
        let mut fx = fixture("Unlocked");
        fx.fail.store(true, Ordering::SeqCst);
        assert!(!fx.drive.connect().unwrap());
        assert!(!fx.drive.connected());
        assert_eq!(fx.drive.status(), (Status::Disconnected, None));
    }

    #[test]
    fn test_open_from_locked_walks_unlock_then_travel() {
        let mut fx = fixture("Strong Locked");
        fx.drive.connect().unwrap();
        fx.drive.open().unwrap();
        assert_eq!(count_sent(&fx, CMD_OPEN), 1);

        let (status, position) = fx.drive.status();
        assert_eq!(status, Status::Unlocking);
        assert_eq!(position, Some(0));

        // Past the unlock phase and half the travel.
        sleep_ms(150);
        let (status, position) = fx.drive.status();
        assert_eq!(status, Status::Opening);
        let position = position.unwrap();
        assert!((20..=80).contains(&position), "position was {position}");

        sleep_ms(200);
        assert_eq!(fx.drive.status(), (Status::Open, Some(100)));
    }

    #[test]
    fn test_close_runs_through_latch_to_locked() {
        let mut fx = fixture("Unlocked");
        fx.drive.connect().unwrap();
        fx.drive.close().unwrap();
        assert_eq!(count_sent(&fx, CMD_CLOSE), 1);

        let (status, _) = fx.drive.status();
        assert_eq!(status, Status::Closing);

        // Full travel plus the latch phase.
        sleep_ms(350);
        assert_eq!(fx.drive.status(), (Status::Locked, Some(0)));
    }

    #[test]
    fn test_stop_freezes_position() {
        let mut fx = fixture("Unlocked");
        fx.drive.connect().unwrap();
        fx.drive.close().unwrap();
        sleep_ms(100);
        fx.drive.stop().unwrap();
        assert_eq!(count_sent(&fx, CMD_STOP), 1);

        let (status, position) = fx.drive.status();
        assert_eq!(status, Status::Stopped);
        let frozen = position.unwrap();
        assert!((0..100).contains(&frozen), "position was {frozen}");

        sleep_ms(100);
        assert_eq!(fx.drive.status(), (Status::Stopped, Some(frozen)));
    }

    #[test]
    fn test_set_position_schedules_stop() {
        let mut fx = fixture("Unlocked");
        fx.drive.connect().unwrap();

        // From 100 down to 40: eta is 60% of the travel time.
        fx.drive.set_position(40).unwrap();
        assert_eq!(count_sent(&fx, CMD_CLOSE), 1);
        assert!(fx.drive.busy());

        sleep_ms(250);
        assert!(!fx.drive.busy());
        assert_eq!(count_sent(&fx, CMD_STOP), 1);

        let (status, position) = fx.drive.status();
        assert_eq!(status, Status::Stopped);
        let position = position.unwrap();
        assert!((25..=55).contains(&position), "position was {position}");
    }

    #[test]
    fn test_set_position_cancelled_by_later_command() {
        let mut fx = fixture("Unlocked");
        fx.drive.connect().unwrap();
        fx.drive.set_position(40).unwrap();
        assert!(fx.drive.busy());

        fx.drive.stop().unwrap();
        assert!(!fx.drive.busy());

        // The worker must not fire a second stop after its eta.
        sleep_ms(300);
        assert_eq!(count_sent(&fx, CMD_STOP), 1);
    }

    #[test]
    fn test_set_position_to_full_travel_needs_no_stop() {
        let mut fx = fixture("Strong Locked");
        fx.drive.connect().unwrap();
        fx.drive.set_position(100).unwrap();
        assert!(!fx.drive.busy());
        assert_eq!(count_sent(&fx, CMD_OPEN), 1);

        sleep_ms(350);
        assert_eq!(fx.drive.status(), (Status::Open, Some(100)));
        assert_eq!(count_sent(&fx, CMD_STOP), 0);
    }

    #[test]
    fn test_set_position_rejects_out_of_range() {
        let mut fx = fixture("Unlocked");
        fx.drive.connect().unwrap();
        assert!(matches!(
            fx.drive.set_position(101),
            Err(DeviceError::InvalidPosition(101))
        ));
    }

    #[test]
    fn test_set_position_from_locked_includes_unlock_time() {
        let mut fx = fixture("Strong Locked");
        fx.drive.connect().unwrap();
        fx.drive.set_position(50).unwrap();
        assert_eq!(count_sent(&fx, CMD_OPEN), 1);
        assert!(fx.drive.busy());

        let (status, _) = fx.drive.status();
        assert_eq!(status, Status::Unlocking);

        // Unlock (50ms) plus half the travel (100ms).
        sleep_ms(300);
        assert!(!fx.drive.busy());
        let (status, position) = fx.drive.status();
        assert_eq!(status, Status::Stopped);
        let position = position.unwrap();
        assert!((35..=65).contains(&position), "position was {position}");
    }

    #[test]
    fn test_sync_status_absorbs_wire_loss_and_recovers() {
        let mut fx = fixture("Unlocked");
        fx.drive.connect().unwrap();
        assert_eq!(count_sent(&fx, CMD_DEVICE), 1);

        fx.fail.store(true, Ordering::SeqCst);
        let (status, position) = fx.drive.sync_status().unwrap();
        assert_eq!(status, Status::Disconnected);
        assert_eq!(position, Some(100));
        assert!(!fx.drive.connected());

        // Still down: the reconnect attempt fails quietly.
        let (status, _) = fx.drive.sync_status().unwrap();
        assert_eq!(status, Status::Disconnected);

        fx.fail.store(false, Ordering::SeqCst);
        let (status, position) = fx.drive.sync_status().unwrap();
        assert_eq!(status, Status::Open);
        assert_eq!(position, Some(100));
        assert!(fx.drive.connected());
        // Identity is read again on reconnect.
        assert_eq!(count_sent(&fx, CMD_DEVICE), 2);
    }

    #[test]
    fn test_sync_status_while_busy_uses_cache() {
        let mut fx = fixture("Unlocked");
        fx.drive.connect().unwrap();
        let status_queries = count_sent(&fx, CMD_STATUS);

        fx.drive.set_position(40).unwrap();
        let (status, _) = fx.drive.sync_status().unwrap();
        assert_eq!(status, Status::Closing);
        assert_eq!(count_sent(&fx, CMD_STATUS), status_queries);
    }

    #[test]
    fn test_commands_fail_when_not_connected() {
        let mut fx = fixture("Unlocked");
        assert!(matches!(fx.drive.open(), Err(DeviceError::NotConnected)));
        assert!(matches!(
            fx.drive.set_position(50),
            Err(DeviceError::NotConnected)
        ));
    }

    #[test]
    fn test_restore_position_seeds_estimate() {
        let mut fx = fixture("Unlocked");
        fx.drive.connect().unwrap();
        fx.drive.restore_position(63).unwrap();
        assert_eq!(fx.drive.status(), (Status::Stopped, Some(63)));

        assert!(matches!(
            fx.drive.restore_position(130),
            Err(DeviceError::InvalidPosition(130))
        ));
    }

    #[test]
    fn test_restore_position_ignored_while_locked() {
        let mut fx = fixture("Strong Locked");
        fx.drive.connect().unwrap();
        fx.drive.restore_position(63).unwrap();
        assert_eq!(fx.drive.status(), (Status::Locked, Some(0)));
    }

    #[test]
    fn test_wire_lock_confirmation_wins() {
        let mut fx = fixture("Unlocked");
        fx.drive.connect().unwrap();
        fx.drive.close().unwrap();

        // The remote control latched the window before our estimate got
        // there; the wire report outranks the estimator.
        *fx.lock_reply.lock() = "Strong Locked".to_string();
        let (status, position) = fx.drive.sync_status().unwrap();
        assert_eq!(status, Status::Locked);
        assert_eq!(position, Some(0));
    }

    #[test]
    fn test_external_unlock_resets_to_open() {
        let mut fx = fixture("Strong Locked");
        fx.drive.connect().unwrap();
        assert_eq!(fx.drive.status(), (Status::Locked, Some(0)));

        *fx.lock_reply.lock() = "Unlocked".to_string();
        let (status, position) = fx.drive.sync_status().unwrap();
        assert_eq!(status, Status::Open);
        assert_eq!(position, Some(100));
    }

    #[test]
    fn test_estimator_advances_through_unlock_into_travel() {
        let timing = DriveTiming {
            unlock_secs: 5.0,
            travel_secs: 40.0,
            lock_secs: 5.0,
        };
        let start = Instant::now();
        let mut est = Estimator::initial(LockState::Locked, start);
        est.begin(Status::Unlocking, 0.0, start);

        est.advance(&timing, start + Duration::from_secs(3));
        assert_eq!(est.phase, Status::Unlocking);
        assert_eq!(est.position_percent(), 0);

        // 5s unlock + 10s travel = 25%.
        est.advance(&timing, start + Duration::from_secs(15));
        assert_eq!(est.phase, Status::Opening);
        assert_eq!(est.position_percent(), 25);

        est.advance(&timing, start + Duration::from_secs(60));
        assert_eq!(est.phase, Status::Open);
        assert_eq!(est.position_percent(), 100);
    }

    #[test]
    fn test_estimator_closing_runs_into_latch() {
        let timing = DriveTiming {
            unlock_secs: 5.0,
            travel_secs: 40.0,
            lock_secs: 5.0,
        };
        let start = Instant::now();
        let mut est = Estimator::initial(LockState::Unlocked, start);
        est.begin(Status::Closing, 50.0, start);

        est.advance(&timing, start + Duration::from_secs(10));
        assert_eq!(est.phase, Status::Closing);
        assert_eq!(est.position_percent(), 25);

        // 20s empties the remaining travel, 3s into the latch phase.
        est.advance(&timing, start + Duration::from_secs(23));
        assert_eq!(est.phase, Status::Locking);
        assert_eq!(est.position_percent(), 0);

        est.advance(&timing, start + Duration::from_secs(26));
        assert_eq!(est.phase, Status::Locked);
    }
}
