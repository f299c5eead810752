//! Robot state model
//!
//! Typed joint/Cartesian/controller state decoded from the real-time stream,
//! and the driver's own motion state derived from it each cycle.

use crate::packet::{FirmwareVersion, RealtimePacket};
use serde::Serialize;

pub const NUM_JOINTS: usize = 6;

/// Overall robot mode reported by the controller (3.x vocabulary)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RobotMode {
    NoController,
    Disconnected,
    ConfirmSafety,
    Booting,
    PowerOff,
    PowerOn,
    Idle,
    Backdrive,
    Running,
    UpdatingFirmware,
    Unknown(i32),
}

impl RobotMode {
    /// Decode a 3.x robot mode code
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => RobotMode::NoController,
            0 => RobotMode::Disconnected,
            1 => RobotMode::ConfirmSafety,
            2 => RobotMode::Booting,
            3 => RobotMode::PowerOff,
            4 => RobotMode::PowerOn,
            5 => RobotMode::Idle,
            6 => RobotMode::Backdrive,
            7 => RobotMode::Running,
            8 => RobotMode::UpdatingFirmware,
            other => RobotMode::Unknown(other),
        }
    }

    /// Decode a pre-3.0 robot mode code onto the 3.x vocabulary
    pub fn from_legacy_code(code: i32) -> Self {
        match code {
            0 => RobotMode::Running,
            1 => RobotMode::Backdrive,
            2 => RobotMode::Idle,
            3 => RobotMode::Booting,
            4 | 5 | 10 => RobotMode::ConfirmSafety,
            6 | 8 => RobotMode::Disconnected,
            7 | 9 => RobotMode::PowerOff,
            other => RobotMode::Unknown(other),
        }
    }

    pub fn name(&self) -> String {
        match self {
            RobotMode::NoController => "NO_CONTROLLER".to_string(),
            RobotMode::Disconnected => "DISCONNECTED".to_string(),
            RobotMode::ConfirmSafety => "CONFIRM_SAFETY".to_string(),
            RobotMode::Booting => "BOOTING".to_string(),
            RobotMode::PowerOff => "POWER_OFF".to_string(),
            RobotMode::PowerOn => "POWER_ON".to_string(),
            RobotMode::Idle => "IDLE".to_string(),
            RobotMode::Backdrive => "BACKDRIVE".to_string(),
            RobotMode::Running => "RUNNING".to_string(),
            RobotMode::UpdatingFirmware => "UPDATING_FIRMWARE".to_string(),
            RobotMode::Unknown(code) => format!("UNKNOWN({})", code),
        }
    }
}

/// Safety mode, reported by 3.x firmware only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyMode {
    Normal,
    Reduced,
    ProtectiveStop,
    Recovery,
    SafeguardStop,
    SystemEmergencyStop,
    RobotEmergencyStop,
    Violation,
    Fault,
    Unknown(i32),
}

impl SafetyMode {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => SafetyMode::Normal,
            2 => SafetyMode::Reduced,
            3 => SafetyMode::ProtectiveStop,
            4 => SafetyMode::Recovery,
            5 => SafetyMode::SafeguardStop,
            6 => SafetyMode::SystemEmergencyStop,
            7 => SafetyMode::RobotEmergencyStop,
            8 => SafetyMode::Violation,
            9 => SafetyMode::Fault,
            other => SafetyMode::Unknown(other),
        }
    }

    /// True when the controller is holding the arm in a stop
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            SafetyMode::ProtectiveStop
                | SafetyMode::SafeguardStop
                | SafetyMode::SystemEmergencyStop
                | SafetyMode::RobotEmergencyStop
                | SafetyMode::Violation
                | SafetyMode::Fault
        )
    }
}

/// Per-joint mode reported by the controller (1.8 and later)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JointMode {
    ShuttingDown,
    PartDCalibration,
    Backdrive,
    PowerOff,
    NotResponding,
    MotorInitialisation,
    Booting,
    PartDCalibrationError,
    Bootloader,
    Calibration,
    Fault,
    Running,
    Idle,
    /// Not reported by this firmware, or an unlisted code
    Unknown(i32),
}

impl JointMode {
    pub fn from_code(code: i32) -> Self {
        match code {
            236 => JointMode::ShuttingDown,
            237 => JointMode::PartDCalibration,
            238 => JointMode::Backdrive,
            239 => JointMode::PowerOff,
            240 => JointMode::NotResponding,
            241 => JointMode::MotorInitialisation,
            242 => JointMode::Booting,
            243 => JointMode::PartDCalibrationError,
            244 => JointMode::Bootloader,
            245 => JointMode::Calibration,
            246 => JointMode::Fault,
            247 => JointMode::Running,
            248 => JointMode::Idle,
            other => JointMode::Unknown(other),
        }
    }
}

/// Joint-space state for all six joints
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JointState {
    /// Actual joint positions (rad)
    pub position: [f64; NUM_JOINTS],
    /// Actual joint velocities (rad/s)
    pub velocity: [f64; NUM_JOINTS],
    /// Actual joint currents (A)
    pub effort: [f64; NUM_JOINTS],
    pub target_position: [f64; NUM_JOINTS],
    pub target_velocity: [f64; NUM_JOINTS],
    pub target_effort: [f64; NUM_JOINTS],
    pub mode: [JointMode; NUM_JOINTS],
}

impl Default for JointState {
    fn default() -> Self {
        Self {
            position: [0.0; NUM_JOINTS],
            velocity: [0.0; NUM_JOINTS],
            effort: [0.0; NUM_JOINTS],
            target_position: [0.0; NUM_JOINTS],
            target_velocity: [0.0; NUM_JOINTS],
            target_effort: [0.0; NUM_JOINTS],
            mode: [JointMode::Unknown(0); NUM_JOINTS],
        }
    }
}

/// Tool (TCP) state in base coordinates
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CartesianState {
    /// TCP pose [x, y, z, rx, ry, rz] in metres and rotation-vector radians
    pub tcp_pose: [f64; 6],
    /// TCP velocity [vx, vy, vz, wx, wy, wz]
    pub tcp_speed: [f64; 6],
    /// TCP wrench [fx, fy, fz, tx, ty, tz]
    pub tcp_force: [f64; 6],
}

/// Controller-level status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    /// Controller time since power-on (s)
    pub timestamp: f64,
    /// Time the controller spent in its real-time thread (s)
    pub exec_time: f64,
    pub robot_mode: RobotMode,
    pub safety_mode: Option<SafetyMode>,
    pub speed_scaling: Option<f64>,
    /// Derived: false whenever the driver is `NotConnected`
    pub connected: bool,
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self {
            timestamp: 0.0,
            exec_time: 0.0,
            robot_mode: RobotMode::Disconnected,
            safety_mode: None,
            speed_scaling: None,
            connected: false,
        }
    }
}

/// The driver's own view of what the arm is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverMotionState {
    #[default]
    NotConnected,
    Idle,
    PositionMoving,
    VelocityMoving,
    FreeDrive,
    PoweringOff,
    PoweringOn,
}

impl DriverMotionState {
    /// States in which a one-shot position move may be issued
    pub fn accepts_position_move(&self) -> bool {
        matches!(self, DriverMotionState::Idle | DriverMotionState::PositionMoving)
    }

    /// States in which a velocity command may be issued or refreshed
    pub fn accepts_velocity_move(&self) -> bool {
        matches!(
            self,
            DriverMotionState::Idle | DriverMotionState::PositionMoving | DriverMotionState::VelocityMoving
        )
    }
}

/// What the dispatcher last asked the controller to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MotionIntent {
    #[default]
    None,
    PositionMove,
    VelocityMove,
    FreeDrive,
    PowerOff,
}

/// Recompute the driver motion state from controller mode and dispatcher intent
pub fn derive_motion_state(controller: Option<&ControllerStatus>, intent: MotionIntent) -> DriverMotionState {
    let Some(controller) = controller else {
        return DriverMotionState::NotConnected;
    };

    match controller.robot_mode {
        RobotMode::NoController
        | RobotMode::Disconnected
        | RobotMode::UpdatingFirmware
        | RobotMode::Unknown(_) => DriverMotionState::NotConnected,
        RobotMode::ConfirmSafety | RobotMode::Booting => DriverMotionState::PoweringOn,
        RobotMode::PowerOff => DriverMotionState::PoweringOff,
        RobotMode::Backdrive => DriverMotionState::FreeDrive,
        mode @ (RobotMode::PowerOn | RobotMode::Idle | RobotMode::Running) => match intent {
            MotionIntent::PowerOff => DriverMotionState::PoweringOff,
            MotionIntent::FreeDrive => DriverMotionState::FreeDrive,
            MotionIntent::VelocityMove if mode == RobotMode::Running => DriverMotionState::VelocityMoving,
            MotionIntent::PositionMove if mode == RobotMode::Running => DriverMotionState::PositionMoving,
            _ => DriverMotionState::Idle,
        },
    }
}

/// Everything published to readers once per cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RobotSnapshot {
    pub joints: JointState,
    pub cartesian: CartesianState,
    pub controller: ControllerStatus,
    pub motion_state: DriverMotionState,
    pub firmware: FirmwareVersion,
    /// Average interval between cycles (s)
    pub average_period: f64,
    pub cycle: u64,
}

impl Default for RobotSnapshot {
    fn default() -> Self {
        Self {
            joints: JointState::default(),
            cartesian: CartesianState::default(),
            controller: ControllerStatus::default(),
            motion_state: DriverMotionState::NotConnected,
            firmware: FirmwareVersion::Unknown,
            average_period: 0.0,
            cycle: 0,
        }
    }
}

impl RobotSnapshot {
    pub fn is_connected(&self) -> bool {
        self.motion_state != DriverMotionState::NotConnected
    }
}

/// Latest decoded state plus the derived motion state
#[derive(Debug, Default)]
pub struct RobotStateModel {
    joints: JointState,
    cartesian: CartesianState,
    controller: ControllerStatus,
    motion_state: DriverMotionState,
    /// Whether a packet has been decoded since the link came up
    has_packet: bool,
}

impl RobotStateModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot with a freshly decoded packet
    pub fn apply_packet(&mut self, packet: RealtimePacket) {
        let connected = self.controller.connected;
        self.joints = packet.joints;
        self.cartesian = packet.cartesian;
        self.controller = packet.controller;
        self.controller.connected = connected;
        self.has_packet = true;
    }

    /// Link lost: forget the controller mode so nothing derives a movable state
    pub fn demote(&mut self) {
        self.has_packet = false;
        self.controller.robot_mode = RobotMode::Disconnected;
        self.controller.connected = false;
        self.motion_state = DriverMotionState::NotConnected;
    }

    /// Level-triggered recomputation, called once per cycle
    pub fn recompute(&mut self, link_up: bool, intent: MotionIntent) -> DriverMotionState {
        let controller = (link_up && self.has_packet).then_some(&self.controller);
        self.motion_state = derive_motion_state(controller, intent);
        self.controller.connected = self.motion_state != DriverMotionState::NotConnected;
        self.motion_state
    }

    pub fn joints(&self) -> &JointState {
        &self.joints
    }

    pub fn cartesian(&self) -> &CartesianState {
        &self.cartesian
    }

    pub fn controller(&self) -> &ControllerStatus {
        &self.controller
    }

    pub fn motion_state(&self) -> DriverMotionState {
        self.motion_state
    }

    pub fn has_packet(&self) -> bool {
        self.has_packet
    }

    pub fn is_connected(&self) -> bool {
        self.motion_state != DriverMotionState::NotConnected
    }

    /// Copy out a snapshot for publication
    pub fn snapshot(&self, firmware: FirmwareVersion, average_period: f64, cycle: u64) -> RobotSnapshot {
        RobotSnapshot {
            joints: self.joints.clone(),
            cartesian: self.cartesian.clone(),
            controller: self.controller.clone(),
            motion_state: self.motion_state,
            firmware,
            average_period,
            cycle,
        }
    }
}
