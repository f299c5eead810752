//! JSON-based robot monitoring
//!
//! Structured JSON output of published snapshots, with change detection and
//! publication rate limiting, for console hosts.

use crate::config::PublishingConfig;
use crate::reporter::current_timestamp;
use crate::state::{DriverMotionState, RobotSnapshot};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Combined position monitoring data (TCP pose + joint angles)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionData {
    /// Controller time since power-on, if a packet has been received
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtime: Option<f64>,
    /// Unix time the line was produced
    pub stime: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    /// TCP pose [x, y, z, rx, ry, rz] in meters and radians
    pub tcp_pose: [f64; 6],
    /// Joint angles in radians
    pub joint_positions: [f64; 6],
    /// Average driver cycle period (s)
    pub period: f64,
}

impl PositionData {
    pub fn from_snapshot(snapshot: &RobotSnapshot, decimal_places: u32) -> Self {
        let multiplier = 10.0_f64.powi(decimal_places as i32);
        let round = |values: &[f64; 6]| values.map(|v| (v * multiplier).round() / multiplier);

        Self {
            rtime: snapshot.is_connected().then_some(snapshot.controller.timestamp),
            stime: current_timestamp(),
            event_type: "position".to_string(),
            tcp_pose: round(&snapshot.cartesian.tcp_pose),
            joint_positions: round(&snapshot.joints.position),
            period: snapshot.average_period,
        }
    }
}

/// Robot state monitoring data
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RobotStateData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtime: Option<f64>,
    pub stime: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub robot_mode_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_mode_name: Option<String>,
    /// Controller is holding the arm in a safety stop
    pub safety_stopped: bool,
    pub motion_state: DriverMotionState,
    pub connected: bool,
    pub firmware: String,
}

impl RobotStateData {
    pub fn from_snapshot(snapshot: &RobotSnapshot) -> Self {
        let controller = &snapshot.controller;
        Self {
            rtime: snapshot.is_connected().then_some(controller.timestamp),
            stime: current_timestamp(),
            event_type: "robot_state".to_string(),
            robot_mode_name: controller.robot_mode.name(),
            safety_mode_name: controller.safety_mode.map(|m| format!("{:?}", m)),
            safety_stopped: controller.safety_mode.is_some_and(|m| m.is_stopped()),
            motion_state: snapshot.motion_state,
            connected: controller.connected,
            firmware: snapshot.firmware.name().to_string(),
        }
    }

    /// Fields that count as a state change
    fn key(&self) -> (String, Option<String>, DriverMotionState, bool, String) {
        (
            self.robot_mode_name.clone(),
            self.safety_mode_name.clone(),
            self.motion_state,
            self.connected,
            self.firmware.clone(),
        )
    }
}

/// Monitor output manager that handles dynamic output and rate limiting
pub struct MonitorOutput {
    last_position: Option<([f64; 6], [f64; 6])>,
    last_robot_state: Option<(String, Option<String>, DriverMotionState, bool, String)>,
    last_position_output: Option<Instant>,
    pub_rate_hz: u32,
    /// Position change threshold for dynamic mode (m or rad)
    position_threshold: f64,
    dynamic_mode: bool,
    pub decimal_places: u32,
}

impl MonitorOutput {
    pub fn new(pub_rate_hz: u32, dynamic_mode: bool, decimal_places: u32) -> Self {
        Self {
            last_position: None,
            last_robot_state: None,
            last_position_output: None,
            pub_rate_hz: pub_rate_hz.max(1),
            position_threshold: 0.001,
            dynamic_mode,
            decimal_places,
        }
    }

    pub fn from_config(config: &PublishingConfig) -> Self {
        Self::new(
            config.pub_rate_hz,
            config.stream_robot_state == "dynamic",
            config.decimal_places.unwrap_or(4),
        )
    }

    /// Check if combined position (TCP + joints) should be output
    pub fn should_output_position(&mut self, snapshot: &RobotSnapshot, now: Instant) -> bool {
        if let Some(last_output) = self.last_position_output {
            let min_interval = Duration::from_millis(1000 / self.pub_rate_hz as u64);
            if now.saturating_duration_since(last_output) < min_interval {
                return false;
            }
        }

        let tcp_pose = snapshot.cartesian.tcp_pose;
        let joint_positions = snapshot.joints.position;
        if self.dynamic_mode {
            if let Some((last_tcp, last_joints)) = self.last_position {
                if !self.positions_changed(&last_tcp, &tcp_pose) && !self.positions_changed(&last_joints, &joint_positions)
                {
                    return false;
                }
            }
        }

        self.last_position = Some((tcp_pose, joint_positions));
        self.last_position_output = Some(now);
        true
    }

    /// Check if robot state should be output (never rate limited, only change detection)
    pub fn should_output_robot_state(&mut self, data: &RobotStateData) -> bool {
        let current = data.key();
        if self.dynamic_mode && self.last_robot_state.as_ref() == Some(&current) {
            return false;
        }
        self.last_robot_state = Some(current);
        true
    }

    fn positions_changed(&self, old: &[f64; 6], new: &[f64; 6]) -> bool {
        old.iter()
            .zip(new.iter())
            .any(|(old_val, new_val)| (old_val - new_val).abs() > self.position_threshold)
    }

    /// Position line with a fixed number of decimals
    pub fn format_position(&self, data: &PositionData) -> String {
        let prec = self.decimal_places as usize;
        let tcp: Vec<String> = data.tcp_pose.iter().map(|v| format!("{:.prec$}", v)).collect();
        let joints: Vec<String> = data.joint_positions.iter().map(|v| format!("{:.prec$}", v)).collect();

        match data.rtime {
            Some(rtime) => format!(
                r#"{{"rtime":{:.6},"stime":{:.6},"type":"{}","tcp_pose":[{}],"joint_positions":[{}],"period":{:.6}}}"#,
                rtime,
                data.stime,
                data.event_type,
                tcp.join(","),
                joints.join(","),
                data.period
            ),
            None => format!(
                r#"{{"stime":{:.6},"type":"{}","tcp_pose":[{}],"joint_positions":[{}],"period":{:.6}}}"#,
                data.stime,
                data.event_type,
                tcp.join(","),
                joints.join(","),
                data.period
            ),
        }
    }

    /// Print whatever is due for this snapshot
    pub fn process(&mut self, snapshot: &RobotSnapshot, now: Instant) {
        let state = RobotStateData::from_snapshot(snapshot);
        if self.should_output_robot_state(&state) {
            if let Ok(json) = serde_json::to_string(&state) {
                println!("{}", json);
            }
        }

        if snapshot.is_connected() && self.should_output_position(snapshot, now) {
            let position = PositionData::from_snapshot(snapshot, self.decimal_places);
            println!("{}", self.format_position(&position));
        }
    }
}
