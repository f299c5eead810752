//! Real-time interface packet schemas
//!
//! Every packet on port 30003 starts with a 4-byte big-endian total length,
//! followed by big-endian doubles at fixed offsets. The length identifies
//! the firmware generation, and the field offsets differ between them.

use crate::dashboard::PolyscopeVersion;
use crate::state::{
    CartesianState, ControllerStatus, JointMode, JointState, RobotMode, SafetyMode, NUM_JOINTS,
};
use serde::Serialize;

/// Size of the leading length field
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Firmware generation, identified by packet length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum FirmwareVersion {
    #[default]
    Unknown,
    /// 1.5 - 1.7
    Pre18,
    /// 1.8
    V18,
    /// 3.0 - 3.1
    V30_31,
    /// 3.2 and later
    V32,
}

impl FirmwareVersion {
    pub const KNOWN: [FirmwareVersion; 4] = [
        FirmwareVersion::Pre18,
        FirmwareVersion::V18,
        FirmwareVersion::V30_31,
        FirmwareVersion::V32,
    ];

    /// Total packet length for this version (0 when unknown)
    pub fn packet_len(&self) -> usize {
        match self {
            FirmwareVersion::Unknown => 0,
            FirmwareVersion::Pre18 => 764,
            FirmwareVersion::V18 => 812,
            FirmwareVersion::V30_31 => 1044,
            FirmwareVersion::V32 => 1060,
        }
    }

    /// Version whose packets are exactly `len` bytes
    pub fn from_packet_len(len: usize) -> Option<Self> {
        Self::KNOWN.into_iter().find(|v| v.packet_len() == len)
    }

    /// Smallest packet length of any known version
    pub fn min_packet_len() -> usize {
        FirmwareVersion::Pre18.packet_len()
    }

    /// Expected schema for a PolyScope software version
    pub fn from_polyscope(version: &PolyscopeVersion) -> Self {
        match (version.major, version.minor) {
            (1, minor) if minor < 8 => FirmwareVersion::Pre18,
            (1, _) => FirmwareVersion::V18,
            (3, 0) | (3, 1) => FirmwareVersion::V30_31,
            (major, _) if major >= 3 => FirmwareVersion::V32,
            _ => FirmwareVersion::Unknown,
        }
    }

    /// Firmware older than 3.0 uses the legacy script and mode vocabulary
    pub fn is_legacy(&self) -> bool {
        matches!(self, FirmwareVersion::Pre18 | FirmwareVersion::V18)
    }

    pub fn name(&self) -> &'static str {
        match self {
            FirmwareVersion::Unknown => "Unknown",
            FirmwareVersion::Pre18 => "Pre-1.8",
            FirmwareVersion::V18 => "1.8",
            FirmwareVersion::V30_31 => "3.0/3.1",
            FirmwareVersion::V32 => "3.2",
        }
    }

    fn layout(&self) -> Option<&'static PacketLayout> {
        match self {
            FirmwareVersion::Unknown => None,
            FirmwareVersion::Pre18 => Some(&PRE_18_LAYOUT),
            FirmwareVersion::V18 => Some(&V18_LAYOUT),
            FirmwareVersion::V30_31 | FirmwareVersion::V32 => Some(&V3_LAYOUT),
        }
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Byte offsets of the fields this driver decodes
#[derive(Debug)]
struct PacketLayout {
    time: usize,
    q_target: usize,
    qd_target: usize,
    i_target: usize,
    q_actual: usize,
    qd_actual: usize,
    i_actual: usize,
    tcp_force: usize,
    tool_vector: usize,
    tcp_speed: usize,
    controller_timer: usize,
    robot_mode: usize,
    legacy_robot_modes: bool,
    joint_modes: Option<usize>,
    safety_mode: Option<usize>,
    speed_scaling: Option<usize>,
}

const PRE_18_LAYOUT: PacketLayout = PacketLayout {
    time: 4,
    q_target: 12,
    qd_target: 60,
    i_target: 156,
    q_actual: 252,
    qd_actual: 300,
    i_actual: 348,
    tcp_force: 540,
    tool_vector: 588,
    tcp_speed: 636,
    controller_timer: 740,
    robot_mode: 756,
    legacy_robot_modes: true,
    joint_modes: None,
    safety_mode: None,
    speed_scaling: None,
};

const V18_LAYOUT: PacketLayout = PacketLayout {
    joint_modes: Some(764),
    ..PRE_18_LAYOUT
};

// 3.x moved the tool vector and TCP speed ahead of the force field.
const V3_LAYOUT: PacketLayout = PacketLayout {
    time: 4,
    q_target: 12,
    qd_target: 60,
    i_target: 156,
    q_actual: 252,
    qd_actual: 300,
    i_actual: 348,
    tcp_force: 540,
    tool_vector: 444,
    tcp_speed: 492,
    controller_timer: 740,
    robot_mode: 756,
    legacy_robot_modes: false,
    joint_modes: Some(764),
    safety_mode: Some(812),
    speed_scaling: Some(940),
};

/// Fields decoded from one packet
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimePacket {
    pub joints: JointState,
    pub cartesian: CartesianState,
    pub controller: ControllerStatus,
}

/// Read the leading big-endian length field
pub fn declared_length(bytes: &[u8]) -> Option<usize> {
    let header: [u8; LENGTH_FIELD_SIZE] = bytes.get(..LENGTH_FIELD_SIZE)?.try_into().ok()?;
    Some(u32::from_be_bytes(header) as usize)
}

fn read_f64(bytes: &[u8], offset: usize) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[offset..offset + 8]);
    f64::from_be_bytes(raw)
}

fn read_vec6(bytes: &[u8], offset: usize) -> [f64; 6] {
    let mut values = [0.0; 6];
    for (i, value) in values.iter_mut().enumerate() {
        *value = read_f64(bytes, offset + i * 8);
    }
    values
}

/// Mode codes are sent as doubles
fn read_code(bytes: &[u8], offset: usize) -> i32 {
    read_f64(bytes, offset).round() as i32
}

/// Decode one complete packet under `version`'s schema.
///
/// Returns `None` if the version is unknown or `bytes` is shorter than the
/// version's packet length.
pub fn decode_packet(bytes: &[u8], version: FirmwareVersion) -> Option<RealtimePacket> {
    let layout = version.layout()?;
    if bytes.len() < version.packet_len() {
        return None;
    }

    let mut mode = [JointMode::Unknown(0); NUM_JOINTS];
    if let Some(offset) = layout.joint_modes {
        for (i, m) in mode.iter_mut().enumerate() {
            *m = JointMode::from_code(read_code(bytes, offset + i * 8));
        }
    }

    let joints = JointState {
        position: read_vec6(bytes, layout.q_actual),
        velocity: read_vec6(bytes, layout.qd_actual),
        effort: read_vec6(bytes, layout.i_actual),
        target_position: read_vec6(bytes, layout.q_target),
        target_velocity: read_vec6(bytes, layout.qd_target),
        target_effort: read_vec6(bytes, layout.i_target),
        mode,
    };

    let cartesian = CartesianState {
        tcp_pose: read_vec6(bytes, layout.tool_vector),
        tcp_speed: read_vec6(bytes, layout.tcp_speed),
        tcp_force: read_vec6(bytes, layout.tcp_force),
    };

    let mode_code = read_code(bytes, layout.robot_mode);
    let robot_mode = if layout.legacy_robot_modes {
        RobotMode::from_legacy_code(mode_code)
    } else {
        RobotMode::from_code(mode_code)
    };

    let controller = ControllerStatus {
        timestamp: read_f64(bytes, layout.time),
        exec_time: read_f64(bytes, layout.controller_timer),
        robot_mode,
        safety_mode: layout
            .safety_mode
            .map(|offset| SafetyMode::from_code(read_code(bytes, offset))),
        speed_scaling: layout.speed_scaling.map(|offset| read_f64(bytes, offset)),
        connected: false,
    };

    Some(RealtimePacket {
        joints,
        cartesian,
        controller,
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::PacketBuilder;
    use super::*;

    fn seq(base: f64) -> [f64; 6] {
        [base, base + 1.0, base + 2.0, base + 3.0, base + 4.0, base + 5.0]
    }

    #[test]
    fn test_version_lengths() {
        assert_eq!(FirmwareVersion::from_packet_len(764), Some(FirmwareVersion::Pre18));
        assert_eq!(FirmwareVersion::from_packet_len(812), Some(FirmwareVersion::V18));
        assert_eq!(FirmwareVersion::from_packet_len(1044), Some(FirmwareVersion::V30_31));
        assert_eq!(FirmwareVersion::from_packet_len(1060), Some(FirmwareVersion::V32));
        assert_eq!(FirmwareVersion::from_packet_len(1000), None);
        assert_eq!(FirmwareVersion::min_packet_len(), 764);
    }

    #[test]
    fn test_decode_pre18_packet() {
        // Distinct values at both candidate pose offsets to catch layout mix-ups
        let bytes = PacketBuilder::new(FirmwareVersion::Pre18)
            .time(12.5)
            .q_actual(seq(0.1))
            .put_vec6(444, seq(100.0))
            .put_vec6(492, seq(200.0))
            .put_vec6(540, seq(300.0))
            .put_vec6(588, seq(400.0))
            .put_vec6(636, seq(500.0))
            .put_f64(740, 0.002)
            .robot_mode(0)
            .build();
        assert_eq!(bytes.len(), 764);

        let packet = decode_packet(&bytes, FirmwareVersion::Pre18).unwrap();
        assert_eq!(packet.controller.timestamp, 12.5);
        assert_eq!(packet.controller.exec_time, 0.002);
        assert_eq!(packet.joints.position, seq(0.1));
        assert_eq!(packet.cartesian.tcp_force, seq(300.0));
        assert_eq!(packet.cartesian.tcp_pose, seq(400.0));
        assert_eq!(packet.cartesian.tcp_speed, seq(500.0));
        assert_eq!(packet.controller.robot_mode, RobotMode::Running);
        assert_eq!(packet.controller.safety_mode, None);
        assert_eq!(packet.controller.speed_scaling, None);
        assert!(packet.joints.mode.iter().all(|m| *m == JointMode::Unknown(0)));
    }

    #[test]
    fn test_decode_v30_packet() {
        let bytes = PacketBuilder::new(FirmwareVersion::V30_31)
            .time(99.0)
            .q_actual(seq(-1.0))
            .put_vec6(444, seq(100.0))
            .put_vec6(492, seq(200.0))
            .put_vec6(540, seq(300.0))
            .put_vec6(588, seq(400.0))
            .put_vec6(636, seq(500.0))
            .robot_mode(5)
            .put_vec6(764, [247.0, 247.0, 247.0, 248.0, 246.0, 239.0])
            .put_f64(812, 3.0)
            .put_f64(940, 0.5)
            .build();
        assert_eq!(bytes.len(), 1044);

        let packet = decode_packet(&bytes, FirmwareVersion::V30_31).unwrap();
        assert_eq!(packet.controller.timestamp, 99.0);
        assert_eq!(packet.joints.position, seq(-1.0));
        assert_eq!(packet.cartesian.tcp_pose, seq(100.0));
        assert_eq!(packet.cartesian.tcp_speed, seq(200.0));
        assert_eq!(packet.cartesian.tcp_force, seq(300.0));
        assert_eq!(packet.controller.robot_mode, RobotMode::Idle);
        assert_eq!(packet.controller.safety_mode, Some(SafetyMode::ProtectiveStop));
        assert_eq!(packet.controller.speed_scaling, Some(0.5));
        assert_eq!(packet.joints.mode[0], JointMode::Running);
        assert_eq!(packet.joints.mode[3], JointMode::Idle);
        assert_eq!(packet.joints.mode[4], JointMode::Fault);
        assert_eq!(packet.joints.mode[5], JointMode::PowerOff);
    }

    #[test]
    fn test_decode_v32_packet_shares_v3_layout() {
        let bytes = PacketBuilder::new(FirmwareVersion::V32)
            .tool_vector(seq(0.3))
            .put_vec6(588, seq(7.0))
            .robot_mode(7)
            .build();
        assert_eq!(bytes.len(), 1060);

        let packet = decode_packet(&bytes, FirmwareVersion::V32).unwrap();
        assert_eq!(packet.cartesian.tcp_pose, seq(0.3));
        assert_eq!(packet.controller.robot_mode, RobotMode::Running);
    }

    #[test]
    fn test_decode_v18_packet() {
        // Legacy mode vocabulary, pre-3.0 pose offset, joint modes present
        let bytes = PacketBuilder::new(FirmwareVersion::V18)
            .qd_target(seq(0.5))
            .put_vec6(444, seq(100.0))
            .put_vec6(588, seq(400.0))
            .robot_mode(1)
            .put_vec6(764, [238.0, 238.0, 247.0, 247.0, 248.0, 236.0])
            .build();
        assert_eq!(bytes.len(), 812);

        let packet = decode_packet(&bytes, FirmwareVersion::V18).unwrap();
        assert_eq!(packet.joints.target_velocity, seq(0.5));
        assert_eq!(packet.cartesian.tcp_pose, seq(400.0));
        assert_eq!(packet.controller.robot_mode, RobotMode::Backdrive);
        assert_eq!(packet.controller.safety_mode, None);
        assert_eq!(packet.controller.speed_scaling, None);
        assert_eq!(packet.joints.mode[0], JointMode::Backdrive);
        assert_eq!(packet.joints.mode[2], JointMode::Running);
        assert_eq!(packet.joints.mode[4], JointMode::Idle);
        assert_eq!(packet.joints.mode[5], JointMode::ShuttingDown);
    }

    #[test]
    fn test_decode_rejects_short_input() {
        let bytes = PacketBuilder::new(FirmwareVersion::V18).build();
        assert!(decode_packet(&bytes[..800], FirmwareVersion::V18).is_none());
        assert!(decode_packet(&bytes, FirmwareVersion::Unknown).is_none());
        assert!(decode_packet(&bytes, FirmwareVersion::V18).is_some());
    }

    #[test]
    fn test_polyscope_version_mapping() {
        let v = |major, minor| PolyscopeVersion { major, minor, bugfix: 0 };
        assert_eq!(FirmwareVersion::from_polyscope(&v(1, 7)), FirmwareVersion::Pre18);
        assert_eq!(FirmwareVersion::from_polyscope(&v(1, 8)), FirmwareVersion::V18);
        assert_eq!(FirmwareVersion::from_polyscope(&v(3, 1)), FirmwareVersion::V30_31);
        assert_eq!(FirmwareVersion::from_polyscope(&v(3, 4)), FirmwareVersion::V32);
    }
}
