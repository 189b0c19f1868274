//! Cover orchestration: commands, adaptive polling and reconciliation.
//!
//! The controller is the single place that touches the device session and
//! owns the presentation state. Commands from the platform and ticks from
//! the poll scheduler arrive over channels and are handled one at a time,
//! which keeps the whole state machine free of locking subtleties; the
//! blocking device I/O itself runs on the blocking thread pool.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task;

use crate::config::PollConfig;
use crate::cover::restore::plan_restore;
use crate::cover::scheduler::PollScheduler;
use crate::cover::state::{CoverState, reconcile};
use crate::device::{DeviceError, DeviceSession, DriveInfo, Status};

/// Commands accepted from the platform side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverCommand {
    Open,
    Close,
    Stop,
    /// Move to a target position in percent open.
    SetPosition(u8),
    /// Reinject a persisted position after a restart.
    Restore(Option<u8>),
    Shutdown,
}

/// Notifications emitted toward the platform side.
#[derive(Debug, Clone, PartialEq)]
pub enum CoverEvent {
    /// The presentation state changed structurally.
    StateChanged(CoverState),
    /// A refresh attempt failed; the state keeps its last known values.
    RefreshFailed(String),
    /// The device identity became known, on connect or reconnect.
    DeviceInfo(DriveInfo),
}

pub struct CoverController<S: DeviceSession + 'static> {
    session: Arc<Mutex<S>>,
    state: CoverState,
    scheduler: PollScheduler,
    poll: PollConfig,
    tick_rx: mpsc::Receiver<()>,
    cmd_rx: mpsc::Receiver<CoverCommand>,
    event_tx: mpsc::Sender<CoverEvent>,
    consecutive_failures: u32,
    last_info: Option<DriveInfo>,
}

impl<S: DeviceSession + 'static> CoverController<S> {
    pub fn new(
        session: Arc<Mutex<S>>,
        poll: PollConfig,
        cmd_rx: mpsc::Receiver<CoverCommand>,
        event_tx: mpsc::Sender<CoverEvent>,
    ) -> Self {
        let (tick_tx, tick_rx) = PollScheduler::channel();
        Self {
            session,
            state: CoverState::unknown(),
            scheduler: PollScheduler::new(tick_tx),
            poll,
            tick_rx,
            cmd_rx,
            event_tx,
            consecutive_failures: 0,
            last_info: None,
        }
    }

    /// Run the controller until the command channel closes or a `Shutdown`
    /// command arrives.
    pub async fn run(mut self) {
        info!("cover controller started");
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(CoverCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(()) = self.tick_rx.recv() => self.refresh().await,
            }
        }
        self.shutdown().await;
        info!("cover controller stopped");
    }

    async fn handle_command(&mut self, cmd: CoverCommand) {
        debug!("handling command: {cmd:?}");
        match cmd {
            CoverCommand::Open => self.motion_command("open", DeviceSession::open).await,
            CoverCommand::Close => self.motion_command("close", DeviceSession::close).await,
            CoverCommand::Stop => self.motion_command("stop", DeviceSession::stop).await,
            CoverCommand::SetPosition(target) => self.set_position(target).await,
            CoverCommand::Restore(persisted) => self.restore(persisted).await,
            CoverCommand::Shutdown => {} // Handled in run()
        }
    }

    /// Stop polling, run one blocking device command, then restart polling
    /// at the moving interval. Polling restarts even when the command
    /// failed so the visible state keeps converging on reality.
    async fn motion_command(
        &mut self,
        name: &'static str,
        command: fn(&mut S) -> Result<(), DeviceError>,
    ) {
        self.scheduler.stop();
        let session = Arc::clone(&self.session);
        let result = task::spawn_blocking(move || {
            let mut session = session.lock();
            command(&mut session)
        })
        .await;
        match result {
            Ok(Ok(())) => debug!("{name} command issued"),
            Ok(Err(e)) => warn!("{name} command failed: {e}"),
            Err(e) => warn!("{name} command task failed: {e}"),
        }
        self.scheduler.start(self.poll.moving());
    }

    async fn set_position(&mut self, target: u8) {
        if target > 100 {
            warn!("requested position {target}% is out of range");
            return;
        }
        match self.state.position {
            Some(current) if current == target => {
                debug!("already at {target}%, nothing to do");
                return;
            }
            Some(current) if target > current => {
                debug!("moving from {current}% to {target}% (opening)");
            }
            Some(current) => {
                debug!("moving from {current}% to {target}% (closing)");
            }
            None => debug!("moving to {target}% from an unknown position"),
        }
        self.scheduler.stop();
        let session = Arc::clone(&self.session);
        let result =
            task::spawn_blocking(move || session.lock().set_position(target)).await;
        match result {
            Ok(Ok(())) => debug!("set position command issued"),
            Ok(Err(e)) => warn!("set position command failed: {e}"),
            Err(e) => warn!("set position task failed: {e}"),
        }
        // The drive stops itself at the target; poll fast to catch it.
        self.scheduler.start(self.poll.settling());
    }

    /// One poll cycle: read, reconcile, publish, retune the interval.
    async fn refresh(&mut self) {
        let read = if self.session.lock().busy() {
            // A scheduled stop is pending inside the driver; the cached
            // status still advances the time-based estimate.
            Ok(self.session.lock().status())
        } else {
            let session = Arc::clone(&self.session);
            match task::spawn_blocking(move || session.lock().sync_status()).await {
                Ok(read) => read,
                Err(e) => {
                    warn!("status read task failed: {e}");
                    return;
                }
            }
        };
        match read {
            Ok((status, raw)) => {
                self.consecutive_failures = 0;
                self.apply_report(status, raw).await;
            }
            Err(e) => self.refresh_failed(e.to_string()).await,
        }
    }

    async fn apply_report(&mut self, status: Status, raw: Option<u8>) {
        let next = reconcile(&self.state, status, raw);
        match self.desired_interval(status) {
            Some(every) => self.scheduler.start(every),
            None => self.scheduler.stop(),
        }
        self.publish_if_changed(next).await;
        if status != Status::Disconnected {
            self.publish_info().await;
        }
    }

    async fn refresh_failed(&mut self, error: String) {
        warn!("status refresh failed: {error}");
        self.consecutive_failures += 1;
        let threshold = self.poll.offline_after_failures;
        if threshold > 0 && self.consecutive_failures >= threshold && self.state.available {
            info!(
                "{} consecutive refresh failures, marking unavailable",
                self.consecutive_failures
            );
            let mut next = self.state.clone();
            next.available = false;
            self.publish_if_changed(next).await;
            self.scheduler.start(self.poll.offline());
        }
        if self
            .event_tx
            .send(CoverEvent::RefreshFailed(error))
            .await
            .is_err()
        {
            debug!("event channel closed");
        }
        // The ticker stays armed; the next tick retries.
    }

    /// Read the live status once and fold in the persisted position. A
    /// locked window needs no polling until the next command; everything
    /// else starts polling to converge on reality.
    async fn restore(&mut self, persisted: Option<u8>) {
        info!("restoring cover state (persisted position: {persisted:?})");
        let session = Arc::clone(&self.session);
        let read = match task::spawn_blocking(move || session.lock().sync_status()).await {
            Ok(Ok(read)) => read,
            Ok(Err(e)) => {
                warn!("status read during restore failed: {e}");
                (Status::Disconnected, None)
            }
            Err(e) => {
                warn!("restore task failed: {e}");
                return;
            }
        };
        let plan = plan_restore(&self.state, read.0, read.1, persisted);
        if let Some(seed) = plan.seed {
            let session = Arc::clone(&self.session);
            let seeded =
                task::spawn_blocking(move || session.lock().restore_position(seed)).await;
            match seeded {
                Ok(Ok(())) => debug!("position estimate seeded at {seed}%"),
                Ok(Err(e)) => warn!("could not seed position estimate: {e}"),
                Err(e) => warn!("restore seed task failed: {e}"),
            }
        }
        if plan.start_polling {
            let every = self
                .desired_interval(read.0)
                .unwrap_or_else(|| self.poll.moving());
            self.scheduler.start(every);
        } else {
            self.scheduler.stop();
        }
        self.publish_if_changed(plan.state).await;
        self.publish_info().await;
    }

    fn desired_interval(&self, status: Status) -> Option<Duration> {
        match status {
            Status::Opening | Status::Closing | Status::Locking | Status::Unlocking => {
                Some(self.poll.moving())
            }
            Status::Disconnected => Some(self.poll.offline()),
            Status::Open | Status::Locked | Status::Stopped => None,
        }
    }

    async fn publish_if_changed(&mut self, next: CoverState) {
        if next == self.state {
            return;
        }
        debug!("cover state changed: {next:?}");
        self.state = next.clone();
        if self
            .event_tx
            .send(CoverEvent::StateChanged(next))
            .await
            .is_err()
        {
            debug!("event channel closed");
        }
    }

    async fn publish_info(&mut self) {
        let info = self.session.lock().info();
        let Some(info) = info else { return };
        if self.last_info.as_ref() == Some(&info) {
            return;
        }
        self.last_info = Some(info.clone());
        if self
            .event_tx
            .send(CoverEvent::DeviceInfo(info))
            .await
            .is_err()
        {
            debug!("event channel closed");
        }
    }

    async fn shutdown(&mut self) {
        self.scheduler.stop();
        let session = Arc::clone(&self.session);
        if task::spawn_blocking(move || session.lock().disconnect())
            .await
            .is_err()
        {
            warn!("disconnect task failed");
        }
    }
}
