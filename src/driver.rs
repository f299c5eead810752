//! The real-time driver and its control loop
//!
//! [`UrDriver`] owns the socket, decoder, state model and dispatcher, and is
//! advanced by calling [`UrDriver::run_cycle`] from a single thread at the
//! controller's rate. Other threads talk to it through a [`DriverHandle`]:
//! requests go in through a queue drained every cycle, and a snapshot of the
//! state comes out through a watch channel once per cycle.

use crate::config::{resolve_address, Config};
use crate::dashboard::PolyscopeVersion;
use crate::decoder::{DecodeOutcome, PacketDecoder};
use crate::dispatcher::{CommandDispatcher, DispatchOutcome, MotionRequest};
use crate::events::{DriverEvent, EventNotifier, EventObserver};
use crate::packet::FirmwareVersion;
use crate::reporter::{StatusReporter, TracingReporter};
use crate::state::{CartesianState, ControllerStatus, DriverMotionState, JointState, RobotSnapshot, RobotStateModel};
use crate::transport::{TcpTransport, Transport};
use crate::{Result, URError};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

/// Weight of the newest interval in the average cycle period
const PERIOD_SMOOTHING: f64 = 0.1;

/// Non-blocking reads allowed per cycle while draining the socket
const MAX_READS_PER_CYCLE: usize = 32;

/// Stale packets skipped in one cycle that count as falling behind
const BACKLOG_PACKETS: usize = 2;

/// Exponentially weighted interval between cycle starts
#[derive(Debug, Default)]
struct PeriodEstimator {
    last_start: Option<Instant>,
    average: f64,
}

impl PeriodEstimator {
    fn record(&mut self, now: Instant) {
        if let Some(last) = self.last_start {
            let dt = now.saturating_duration_since(last).as_secs_f64();
            self.average = if self.average == 0.0 {
                dt
            } else {
                self.average + PERIOD_SMOOTHING * (dt - self.average)
            };
        }
        self.last_start = Some(now);
    }
}

/// Reconnect schedule with doubling backoff
#[derive(Debug)]
struct Reconnect {
    initial: Duration,
    max: Duration,
    backoff: Duration,
    next_attempt: Option<Instant>,
    failures: u32,
}

impl Reconnect {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            backoff: initial,
            next_attempt: None,
            failures: 0,
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }

    fn schedule(&mut self, now: Instant) {
        self.next_attempt = Some(now + self.backoff);
        self.backoff = (self.backoff * 2).min(self.max);
    }

    fn succeeded(&mut self) {
        self.backoff = self.initial;
        self.next_attempt = None;
        self.failures = 0;
    }
}

/// Thread-safe access to a running driver
#[derive(Debug, Clone)]
pub struct DriverHandle {
    requests: mpsc::UnboundedSender<MotionRequest>,
    snapshot: watch::Receiver<RobotSnapshot>,
    events: broadcast::Sender<DriverEvent>,
}

impl DriverHandle {
    /// Queue a request for the next cycle. Invalid requests are rejected here.
    pub fn submit(&self, request: MotionRequest) -> Result<()> {
        request.validate()?;
        self.requests.send(request).map_err(|_| URError::DriverStopped)
    }

    pub fn move_joint_position(&self, q: &[f64]) -> Result<()> {
        self.submit(MotionRequest::joint_position(q)?)
    }

    pub fn move_cartesian_position(&self, pose: &[f64]) -> Result<()> {
        self.submit(MotionRequest::cartesian_position(pose)?)
    }

    pub fn move_joint_velocity(&self, qd: &[f64]) -> Result<()> {
        self.submit(MotionRequest::joint_velocity(qd)?)
    }

    pub fn move_cartesian_velocity(&self, linear: &[f64], angular: &[f64]) -> Result<()> {
        self.submit(MotionRequest::cartesian_velocity(linear, angular)?)
    }

    pub fn stop_motion(&self) -> Result<()> {
        self.submit(MotionRequest::Stop)
    }

    pub fn set_free_drive_mode(&self) -> Result<()> {
        self.submit(MotionRequest::FreeDrive)
    }

    pub fn set_running_mode(&self) -> Result<()> {
        self.submit(MotionRequest::Running)
    }

    pub fn disable_motor_power(&self) -> Result<()> {
        self.submit(MotionRequest::PowerOff)
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> RobotSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that wakes once per published cycle
    pub fn watch(&self) -> watch::Receiver<RobotSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.borrow().is_connected()
    }

    pub fn motion_state(&self) -> DriverMotionState {
        self.snapshot.borrow().motion_state
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

/// Real-time client driver for one controller
pub struct UrDriver {
    config: Config,
    transport: Box<dyn Transport>,
    decoder: PacketDecoder,
    model: RobotStateModel,
    dispatcher: CommandDispatcher,
    notifier: EventNotifier,
    reporter: Box<dyn StatusReporter>,
    handle: DriverHandle,
    requests: mpsc::UnboundedReceiver<MotionRequest>,
    snapshot: watch::Sender<RobotSnapshot>,
    /// Resolved `robot.host:robot.port`
    target: SocketAddr,
    reconnect: Reconnect,
    backlogged: bool,
    period: PeriodEstimator,
    polyscope: Option<PolyscopeVersion>,
    cycle: u64,
    stopped: bool,
}

impl UrDriver {
    /// Driver over TCP to `config.robot`
    pub fn new(config: Config) -> Result<Self> {
        let transport = TcpTransport::new(config.timing.receive_timeout());
        Self::with_transport(config, transport)
    }

    /// Driver over any transport
    pub fn with_transport<T: Transport + 'static>(config: Config, transport: T) -> Result<Self> {
        config.validate()?;
        let target = config.robot.realtime_address()?;

        let notifier = EventNotifier::new();
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(RobotSnapshot::default());
        let handle = DriverHandle {
            requests: requests_tx,
            snapshot: snapshot_rx,
            events: notifier.channel(),
        };

        Ok(Self {
            dispatcher: CommandDispatcher::new(config.motion.clone()),
            reconnect: Reconnect::new(config.reconnect.initial_backoff(), config.reconnect.max_backoff()),
            config,
            transport: Box::new(transport),
            decoder: PacketDecoder::new(),
            model: RobotStateModel::new(),
            notifier,
            reporter: Box::new(TracingReporter),
            handle,
            requests,
            snapshot,
            target,
            backlogged: false,
            period: PeriodEstimator::default(),
            polyscope: None,
            cycle: 0,
            stopped: false,
        })
    }

    /// Replace the status sink
    pub fn with_reporter<R: StatusReporter + 'static>(mut self, reporter: R) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    /// Point the driver at another controller; reconnects on the next cycle.
    ///
    /// The address is resolved here, so an unknown host leaves the current
    /// connection untouched.
    pub fn configure(&mut self, host: &str) -> Result<()> {
        if host == self.config.robot.host {
            return Ok(());
        }
        self.target = resolve_address(host, self.config.robot.port)?;
        self.reporter.status(&format!("Robot address set to {}", host));
        self.config.robot.host = host.to_string();
        if self.transport.is_connected() {
            self.drop_link();
        }
        self.reconnect.succeeded();
        Ok(())
    }

    /// Record the version read from the dashboard server
    pub fn set_polyscope_version(&mut self, version: PolyscopeVersion) {
        let expected = FirmwareVersion::from_polyscope(&version);
        self.reporter
            .status(&format!("PolyScope {} expects {} packets", version, expected));
        self.polyscope = Some(version);
    }

    pub fn handle(&self) -> DriverHandle {
        self.handle.clone()
    }

    /// Register an observer called synchronously on this thread
    pub fn subscribe<O: EventObserver + 'static>(&mut self, observer: O) {
        self.notifier.subscribe(observer);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn run_cycle(&mut self) {
        self.run_cycle_at(Instant::now());
    }

    /// One cycle with an explicit clock
    pub fn run_cycle_at(&mut self, now: Instant) {
        if self.stopped {
            return;
        }
        self.cycle += 1;
        self.period.record(now);

        // A fresh connection has used this cycle's wait budget already
        let mut just_connected = false;
        if !self.transport.is_connected() && self.reconnect.due(now) {
            just_connected = self.try_connect(now);
        }
        if self.transport.is_connected() {
            self.receive(now, !just_connected);
        }
        self.update_state();

        self.drain_requests(now);

        if self.model.has_packet() {
            self.dispatcher
                .observe(self.model.joints(), self.model.controller(), now);
        }
        match self.dispatcher.service_timeout(self.transport.as_mut(), now) {
            Ok(Some(line)) => debug!("Keep-alive expired, sent {}", line),
            Ok(None) => {}
            Err(e) => self.handle_write_error(e, now),
        }

        self.update_state();
        self.publish();
    }

    fn try_connect(&mut self, now: Instant) -> bool {
        let budget = self.config.timing.connect_budget();
        match self.transport.connect(self.target, budget) {
            Ok(()) => {
                self.decoder.reset();
                self.model.demote();
                self.dispatcher.reset();
                self.reconnect.succeeded();
                self.backlogged = false;
                self.reporter.status(&format!("Connected to {}", self.target));
                true
            }
            Err(e) => {
                self.reconnect.failures += 1;
                if self.reconnect.failures == 1 {
                    self.reporter.warning(&format!("{}; retrying", e));
                } else {
                    debug!("Connect attempt {} failed: {}", self.reconnect.failures, e);
                }
                self.reconnect.schedule(now);
                false
            }
        }
    }

    /// Wait for data (unless `wait_for_data` is false), then drain whatever
    /// else is already queued on the socket and keep the newest packet.
    fn receive(&mut self, now: Instant, wait_for_data: bool) {
        if wait_for_data {
            match self.transport.read_available(self.decoder.buffer_mut()) {
                Ok(_) => {}
                Err(URError::ReceiveTimeout(_)) => self.notifier.emit(DriverEvent::ReceiveTimeout),
                Err(e) if e.is_link_failure() => {
                    self.link_failed(e, now);
                    return;
                }
                Err(e) => warn!("Read failed: {}", e),
            }
        }

        let version_before = self.decoder.version();
        let mut latest = None;
        let mut decoded: usize = 0;
        let mut reads = 0;
        let mut more_pending = false;
        loop {
            loop {
                match self.decoder.decode() {
                    DecodeOutcome::Incomplete => break,
                    DecodeOutcome::Packet(packet) => {
                        decoded += 1;
                        latest = Some(packet);
                    }
                    DecodeOutcome::Invalid { observed, expected } => {
                        self.notifier.emit(DriverEvent::InvalidPacket { observed, expected })
                    }
                }
            }

            if reads == MAX_READS_PER_CYCLE {
                more_pending = true;
                break;
            }
            reads += 1;
            match self.transport.read_pending(self.decoder.buffer_mut()) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.is_link_failure() => {
                    self.link_failed(e, now);
                    return;
                }
                Err(e) => {
                    warn!("Read failed: {}", e);
                    break;
                }
            }
        }
        self.track_backlog(decoded.saturating_sub(1), more_pending);

        let version = self.decoder.version();
        if version != version_before && version != FirmwareVersion::Unknown {
            self.reporter.status(&format!("Firmware version {}", version));
            if let Some(polyscope) = self.polyscope {
                let expected = FirmwareVersion::from_polyscope(&polyscope);
                if expected != version {
                    self.reporter.warning(&format!(
                        "Packet length suggests firmware {} but PolyScope {} expects {}",
                        version, polyscope, expected
                    ));
                }
            }
        }

        if let Some(packet) = latest {
            self.model.apply_packet(packet);
        }
    }

    /// Report falling behind the controller once per occurrence
    fn track_backlog(&mut self, skipped: usize, more_pending: bool) {
        let behind = skipped >= BACKLOG_PACKETS || more_pending;
        if behind && !self.backlogged {
            self.notifier.emit(DriverEvent::Backlog { skipped });
            self.reporter
                .warning(&format!("Falling behind the controller, skipped {} stale packets", skipped));
        } else if !behind && self.backlogged {
            debug!("Caught up with the controller");
        }
        self.backlogged = behind;
    }

    fn drain_requests(&mut self, now: Instant) {
        while let Ok(request) = self.requests.try_recv() {
            let state = self.model.motion_state();
            let firmware = self.decoder.version();
            match self
                .dispatcher
                .dispatch(&request, state, firmware, self.transport.as_mut(), now)
            {
                Ok(DispatchOutcome::Sent(line)) => {
                    debug!("{} -> {}", request.name(), line);
                    if request == MotionRequest::PowerOff {
                        self.reporter.status("Motor power off requested");
                    }
                }
                Ok(DispatchOutcome::NotReady) => {
                    debug!("{} refused in state {:?}", request.name(), state);
                    self.notifier.emit(DriverEvent::RobotNotReady {
                        request: request.name().to_string(),
                        state,
                    });
                }
                Ok(DispatchOutcome::Dropped) => {
                    self.reporter
                        .warning(&format!("Not connected, dropping {}", request.name()));
                }
                Err(e) => self.handle_write_error(e, now),
            }
        }
    }

    fn handle_write_error(&mut self, error: URError, now: Instant) {
        if error.is_link_failure() {
            self.link_failed(error, now);
        } else {
            warn!("Request rejected: {}", error);
        }
    }

    /// Socket failed mid-session: report once, drop to `NotConnected`, back off
    fn link_failed(&mut self, error: URError, now: Instant) {
        self.notifier.emit(DriverEvent::SocketError {
            message: error.to_string(),
        });
        self.reporter.error(&format!("Connection lost: {}", error));
        self.drop_link();
        self.reconnect.schedule(now);
    }

    fn drop_link(&mut self) {
        self.backlogged = false;
        self.transport.disconnect();
        self.decoder.reset();
        self.model.demote();
        self.dispatcher.reset();
    }

    fn update_state(&mut self) {
        let before = self.model.motion_state();
        let after = self
            .model
            .recompute(self.transport.is_connected(), self.dispatcher.intent());
        if before != after {
            debug!("Motion state {:?} -> {:?}", before, after);
            if before == DriverMotionState::NotConnected || after == DriverMotionState::NotConnected {
                self.reporter.status(&format!("Robot state: {:?}", after));
            }
        }
    }

    fn publish(&mut self) {
        let snapshot = self
            .model
            .snapshot(self.decoder.version(), self.period.average, self.cycle);
        self.snapshot.send_replace(snapshot);
    }

    /// Stop any velocity command, close the socket and refuse further requests
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        if self.transport.is_connected() && self.dispatcher.pending_velocity().is_some() {
            let stop = MotionRequest::Stop;
            let state = self.model.motion_state();
            let firmware = self.decoder.version();
            if let Err(e) = self
                .dispatcher
                .dispatch(&stop, state, firmware, self.transport.as_mut(), Instant::now())
            {
                warn!("Failed to stop motion during shutdown: {}", e);
            }
        }
        self.drop_link();
        self.requests.close();
        self.update_state();
        self.publish();
        self.stopped = true;
        self.reporter.status("Driver shut down");
    }

    pub fn joint_state(&self) -> &JointState {
        self.model.joints()
    }

    pub fn cartesian_state(&self) -> &CartesianState {
        self.model.cartesian()
    }

    pub fn controller_status(&self) -> &ControllerStatus {
        self.model.controller()
    }

    /// Controller time since power-on (s)
    pub fn controller_time(&self) -> f64 {
        self.model.controller().timestamp
    }

    pub fn controller_exec_time(&self) -> f64 {
        self.model.controller().exec_time
    }

    pub fn is_connected(&self) -> bool {
        self.model.is_connected()
    }

    pub fn motion_state(&self) -> DriverMotionState {
        self.model.motion_state()
    }

    pub fn firmware_version(&self) -> FirmwareVersion {
        self.decoder.version()
    }

    pub fn polyscope_version(&self) -> Option<PolyscopeVersion> {
        self.polyscope
    }

    /// Average interval between cycles (s)
    pub fn average_period(&self) -> f64 {
        self.period.average
    }

    pub fn snapshot(&self) -> RobotSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn move_joint_position(&self, q: &[f64]) -> Result<()> {
        self.handle.move_joint_position(q)
    }

    pub fn move_cartesian_position(&self, pose: &[f64]) -> Result<()> {
        self.handle.move_cartesian_position(pose)
    }

    pub fn move_joint_velocity(&self, qd: &[f64]) -> Result<()> {
        self.handle.move_joint_velocity(qd)
    }

    pub fn move_cartesian_velocity(&self, linear: &[f64], angular: &[f64]) -> Result<()> {
        self.handle.move_cartesian_velocity(linear, angular)
    }

    pub fn stop_motion(&self) -> Result<()> {
        self.handle.stop_motion()
    }

    pub fn set_free_drive_mode(&self) -> Result<()> {
        self.handle.set_free_drive_mode()
    }

    pub fn set_running_mode(&self) -> Result<()> {
        self.handle.set_running_mode()
    }

    pub fn disable_motor_power(&self) -> Result<()> {
        self.handle.disable_motor_power()
    }
}

impl std::fmt::Debug for UrDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrDriver")
            .field("host", &self.config.robot.host)
            .field("motion_state", &self.model.motion_state())
            .field("firmware", &self.decoder.version())
            .field("cycle", &self.cycle)
            .finish()
    }
}
