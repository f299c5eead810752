//! Motion request validation and command dispatch
//!
//! Converts requests into script lines, gates motion on the driver state,
//! and stops velocity commands that are not refreshed within the keep-alive.

use crate::config::MotionConfig;
use crate::packet::FirmwareVersion;
use crate::script::ScriptCommand;
use crate::state::{ControllerStatus, DriverMotionState, JointState, MotionIntent, RobotMode, NUM_JOINTS};
use crate::transport::Transport;
use crate::{Result, URError};
use std::f64::consts::PI;
use std::time::{Duration, Instant};
use tracing::debug;

/// Largest accepted joint target (rad)
pub const MAX_JOINT_POSITION: f64 = 2.0 * PI;
/// Largest accepted joint speed (rad/s)
pub const MAX_JOINT_SPEED: f64 = PI;
/// Largest accepted distance of a Cartesian target from the base (m)
pub const MAX_REACH: f64 = 2.0;
/// Largest accepted linear tool speed (m/s)
pub const MAX_TOOL_SPEED: f64 = 1.0;
/// Largest accepted angular tool speed (rad/s)
pub const MAX_TOOL_ANGULAR_SPEED: f64 = PI;

/// Target joint speeds below this count as stopped (rad/s)
const SETTLED_VELOCITY: f64 = 1e-4;

/// A validated request from a host or handle
#[derive(Debug, Clone, PartialEq)]
pub enum MotionRequest {
    /// Absolute joint target (rad)
    JointPosition([f64; NUM_JOINTS]),
    /// Absolute TCP pose [x, y, z, rx, ry, rz]
    CartesianPosition([f64; 6]),
    JointVelocity([f64; NUM_JOINTS]),
    CartesianVelocity { linear: [f64; 3], angular: [f64; 3] },
    Stop,
    FreeDrive,
    Running,
    PowerOff,
}

fn to_array<const N: usize>(what: &str, values: &[f64]) -> Result<[f64; N]> {
    values.try_into().map_err(|_| {
        URError::InvalidRequest(format!("{} needs {} values, got {}", what, N, values.len()))
    })
}

fn check_finite(what: &str, values: &[f64]) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(URError::InvalidRequest(format!("{} contains a non-finite value", what)))
    }
}

fn check_bound(what: &str, values: &[f64], limit: f64) -> Result<()> {
    match values.iter().find(|v| v.abs() > limit) {
        Some(v) => Err(URError::InvalidRequest(format!("{} value {} exceeds {}", what, v, limit))),
        None => Ok(()),
    }
}

fn norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

impl MotionRequest {
    pub fn joint_position(q: &[f64]) -> Result<Self> {
        let request = MotionRequest::JointPosition(to_array("Joint position", q)?);
        request.validate()?;
        Ok(request)
    }

    pub fn cartesian_position(pose: &[f64]) -> Result<Self> {
        let request = MotionRequest::CartesianPosition(to_array("Cartesian pose", pose)?);
        request.validate()?;
        Ok(request)
    }

    pub fn joint_velocity(qd: &[f64]) -> Result<Self> {
        let request = MotionRequest::JointVelocity(to_array("Joint velocity", qd)?);
        request.validate()?;
        Ok(request)
    }

    pub fn cartesian_velocity(linear: &[f64], angular: &[f64]) -> Result<Self> {
        let request = MotionRequest::CartesianVelocity {
            linear: to_array("Linear velocity", linear)?,
            angular: to_array("Angular velocity", angular)?,
        };
        request.validate()?;
        Ok(request)
    }

    /// Check numeric ranges
    pub fn validate(&self) -> Result<()> {
        match self {
            MotionRequest::JointPosition(q) => {
                check_finite("Joint position", q)?;
                check_bound("Joint position", q, MAX_JOINT_POSITION)
            }
            MotionRequest::CartesianPosition(pose) => {
                check_finite("Cartesian pose", pose)?;
                let reach = norm(&pose[..3]);
                if reach > MAX_REACH {
                    return Err(URError::InvalidRequest(format!(
                        "Cartesian target {:.3} m from base exceeds {} m",
                        reach, MAX_REACH
                    )));
                }
                check_bound("Rotation vector", &pose[3..], 2.0 * PI)
            }
            MotionRequest::JointVelocity(qd) => {
                check_finite("Joint velocity", qd)?;
                check_bound("Joint velocity", qd, MAX_JOINT_SPEED)
            }
            MotionRequest::CartesianVelocity { linear, angular } => {
                check_finite("Linear velocity", linear)?;
                check_finite("Angular velocity", angular)?;
                if norm(linear) > MAX_TOOL_SPEED {
                    return Err(URError::InvalidRequest(format!(
                        "Linear speed {:.3} m/s exceeds {} m/s",
                        norm(linear),
                        MAX_TOOL_SPEED
                    )));
                }
                if norm(angular) > MAX_TOOL_ANGULAR_SPEED {
                    return Err(URError::InvalidRequest(format!(
                        "Angular speed {:.3} rad/s exceeds {:.3} rad/s",
                        norm(angular),
                        MAX_TOOL_ANGULAR_SPEED
                    )));
                }
                Ok(())
            }
            MotionRequest::Stop | MotionRequest::FreeDrive | MotionRequest::Running | MotionRequest::PowerOff => Ok(()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MotionRequest::JointPosition(_) => "move_joint_position",
            MotionRequest::CartesianPosition(_) => "move_cartesian_position",
            MotionRequest::JointVelocity(_) => "move_joint_velocity",
            MotionRequest::CartesianVelocity { .. } => "move_cartesian_velocity",
            MotionRequest::Stop => "stop_motion",
            MotionRequest::FreeDrive => "set_free_drive_mode",
            MotionRequest::Running => "set_running_mode",
            MotionRequest::PowerOff => "disable_motor_power",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VelocityKind {
    Joint,
    Cartesian,
}

/// Last velocity command and its keep-alive window
#[derive(Debug, Clone, PartialEq)]
pub struct PendingVelocityCommand {
    pub line: String,
    pub kind: VelocityKind,
    pub issued_at: Instant,
    pub timeout: Duration,
}

impl PendingVelocityCommand {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.issued_at) >= self.timeout
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Line written to the controller
    Sent(String),
    /// Motion refused in the current driver state
    NotReady,
    /// No link to write to
    Dropped,
}

#[derive(Debug)]
pub struct CommandDispatcher {
    motion: MotionConfig,
    pending_velocity: Option<PendingVelocityCommand>,
    /// Dispatch time of the position move in flight
    pending_position: Option<Instant>,
    free_drive_requested: bool,
    power_off_requested: bool,
}

impl CommandDispatcher {
    pub fn new(motion: MotionConfig) -> Self {
        Self {
            motion,
            pending_velocity: None,
            pending_position: None,
            free_drive_requested: false,
            power_off_requested: false,
        }
    }

    pub fn pending_velocity(&self) -> Option<&PendingVelocityCommand> {
        self.pending_velocity.as_ref()
    }

    pub fn position_in_flight(&self) -> bool {
        self.pending_position.is_some()
    }

    /// What the controller was last asked to do, highest precedence first
    pub fn intent(&self) -> MotionIntent {
        if self.power_off_requested {
            MotionIntent::PowerOff
        } else if self.free_drive_requested {
            MotionIntent::FreeDrive
        } else if self.pending_velocity.is_some() {
            MotionIntent::VelocityMove
        } else if self.pending_position.is_some() {
            MotionIntent::PositionMove
        } else {
            MotionIntent::None
        }
    }

    /// Forget everything in flight, e.g. after the link dropped
    pub fn reset(&mut self) {
        self.pending_velocity = None;
        self.pending_position = None;
        self.free_drive_requested = false;
        self.power_off_requested = false;
    }

    fn precision(&self) -> usize {
        self.motion.command_precision
    }

    fn write(&self, transport: &mut dyn Transport, command: ScriptCommand) -> Result<String> {
        let line = command.render(self.precision());
        transport.send(&line)?;
        debug!("Sent: {}", line);
        Ok(line)
    }

    /// Validate and send one request.
    ///
    /// Errors are `InvalidRequest` for bad arguments and `Socket` when the
    /// write itself failed.
    pub fn dispatch(
        &mut self,
        request: &MotionRequest,
        state: DriverMotionState,
        firmware: FirmwareVersion,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> Result<DispatchOutcome> {
        request.validate()?;

        let ready = match request {
            MotionRequest::JointPosition(_) | MotionRequest::CartesianPosition(_) => state.accepts_position_move(),
            MotionRequest::JointVelocity(_) | MotionRequest::CartesianVelocity { .. } => {
                state.accepts_velocity_move()
            }
            _ => true,
        };
        if !ready {
            return Ok(DispatchOutcome::NotReady);
        }
        if !transport.is_connected() {
            return Ok(DispatchOutcome::Dropped);
        }

        let motion = &self.motion;
        let keepalive = motion.velocity_keepalive();
        let line = match request {
            MotionRequest::JointPosition(q) => {
                let command = ScriptCommand::MoveJ {
                    q: *q,
                    a: motion.joint_acceleration,
                    v: motion.joint_speed,
                };
                let line = self.write(transport, command)?;
                self.pending_velocity = None;
                self.pending_position = Some(now);
                line
            }
            MotionRequest::CartesianPosition(pose) => {
                let command = ScriptCommand::MoveL {
                    pose: *pose,
                    a: motion.tool_acceleration,
                    v: motion.tool_speed,
                };
                let line = self.write(transport, command)?;
                self.pending_velocity = None;
                self.pending_position = Some(now);
                line
            }
            MotionRequest::JointVelocity(qd) => {
                let command = ScriptCommand::SpeedJ {
                    qd: *qd,
                    a: motion.joint_velocity_acceleration,
                    t: keepalive.as_secs_f64(),
                };
                let line = self.write(transport, command)?;
                self.arm_keepalive(&line, VelocityKind::Joint, keepalive, now);
                line
            }
            MotionRequest::CartesianVelocity { linear, angular } => {
                let xd = [linear[0], linear[1], linear[2], angular[0], angular[1], angular[2]];
                let command = ScriptCommand::SpeedL {
                    xd,
                    a: motion.tool_velocity_acceleration,
                    t: keepalive.as_secs_f64(),
                };
                let line = self.write(transport, command)?;
                self.arm_keepalive(&line, VelocityKind::Cartesian, keepalive, now);
                line
            }
            MotionRequest::Stop => {
                let command = ScriptCommand::StopJ {
                    a: motion.joint_stop_deceleration,
                };
                let line = self.write(transport, command)?;
                self.pending_velocity = None;
                self.pending_position = None;
                line
            }
            MotionRequest::FreeDrive => {
                let line = self.write(transport, ScriptCommand::free_drive(firmware))?;
                self.free_drive_requested = true;
                line
            }
            MotionRequest::Running => {
                let line = self.write(transport, ScriptCommand::running(firmware))?;
                self.free_drive_requested = false;
                line
            }
            MotionRequest::PowerOff => {
                let line = self.write(transport, ScriptCommand::PowerDown)?;
                self.pending_velocity = None;
                self.pending_position = None;
                self.power_off_requested = true;
                line
            }
        };
        Ok(DispatchOutcome::Sent(line))
    }

    fn arm_keepalive(&mut self, line: &str, kind: VelocityKind, timeout: Duration, now: Instant) {
        self.pending_position = None;
        self.pending_velocity = Some(PendingVelocityCommand {
            line: line.to_string(),
            kind,
            issued_at: now,
            timeout,
        });
    }

    /// Stop an expired velocity command. Returns the stop line when one was sent.
    ///
    /// The pending command is cleared before writing, so a failed write
    /// never leads to a second stop.
    pub fn service_timeout(&mut self, transport: &mut dyn Transport, now: Instant) -> Result<Option<String>> {
        let expired = self.pending_velocity.as_ref().is_some_and(|p| p.is_expired(now));
        if !expired {
            return Ok(None);
        }
        let Some(pending) = self.pending_velocity.take() else {
            return Ok(None);
        };

        let command = match pending.kind {
            VelocityKind::Joint => ScriptCommand::StopJ {
                a: self.motion.joint_stop_deceleration,
            },
            VelocityKind::Cartesian => ScriptCommand::StopL {
                a: self.motion.tool_stop_deceleration,
            },
        };
        debug!("Velocity command not refreshed within {:?}, stopping", pending.timeout);
        self.write(transport, command).map(Some)
    }

    /// Settle position moves and acknowledge power-off from fresh state
    pub fn observe(&mut self, joints: &JointState, controller: &ControllerStatus, now: Instant) {
        if let Some(issued_at) = self.pending_position {
            let settled = joints.target_velocity.iter().all(|v| v.abs() < SETTLED_VELOCITY);
            if settled && now.saturating_duration_since(issued_at) >= self.motion.position_settle() {
                self.pending_position = None;
            }
        }
        if self.power_off_requested && controller.robot_mode == RobotMode::PowerOff {
            self.power_off_requested = false;
        }
    }
}
