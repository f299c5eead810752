//! URScript command lines sent over the real-time port

use crate::packet::FirmwareVersion;
use crate::{Result, URError};
use regex::Regex;

/// One single-line script command
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptCommand {
    MoveJ { q: [f64; 6], a: f64, v: f64 },
    MoveL { pose: [f64; 6], a: f64, v: f64 },
    /// `t` is the controller-side duration of the command (s)
    SpeedJ { qd: [f64; 6], a: f64, t: f64 },
    SpeedL { xd: [f64; 6], a: f64, t: f64 },
    StopJ { a: f64 },
    StopL { a: f64 },
    PowerDown,
    /// Pre-3.0 firmware
    SetRobotModeFreedrive,
    SetRobotModeRun,
    /// 3.0 and later
    FreedriveMode,
    EndFreedriveMode,
}

impl ScriptCommand {
    /// Free drive in the syntax the firmware understands
    pub fn free_drive(firmware: FirmwareVersion) -> Self {
        if firmware.is_legacy() {
            ScriptCommand::SetRobotModeFreedrive
        } else {
            ScriptCommand::FreedriveMode
        }
    }

    /// Leave free drive in the syntax the firmware understands
    pub fn running(firmware: FirmwareVersion) -> Self {
        if firmware.is_legacy() {
            ScriptCommand::SetRobotModeRun
        } else {
            ScriptCommand::EndFreedriveMode
        }
    }

    /// Format as a single line, numbers with `precision` decimals
    pub fn render(&self, precision: usize) -> String {
        let num = |value: f64| format!("{:.*}", precision, value);
        let list = |values: &[f64; 6]| values.iter().map(|v| num(*v)).collect::<Vec<_>>().join(", ");

        match self {
            ScriptCommand::MoveJ { q, a, v } => format!("movej([{}], a={}, v={})", list(q), num(*a), num(*v)),
            ScriptCommand::MoveL { pose, a, v } => {
                format!("movel(p[{}], a={}, v={})", list(pose), num(*a), num(*v))
            }
            ScriptCommand::SpeedJ { qd, a, t } => format!("speedj([{}], {}, {})", list(qd), num(*a), num(*t)),
            ScriptCommand::SpeedL { xd, a, t } => format!("speedl([{}], {}, {})", list(xd), num(*a), num(*t)),
            ScriptCommand::StopJ { a } => format!("stopj({})", num(*a)),
            ScriptCommand::StopL { a } => format!("stopl({})", num(*a)),
            ScriptCommand::PowerDown => "powerdown()".to_string(),
            ScriptCommand::SetRobotModeFreedrive => "set robotmode freedrive".to_string(),
            ScriptCommand::SetRobotModeRun => "set robotmode run".to_string(),
            ScriptCommand::FreedriveMode => "freedrive_mode()".to_string(),
            ScriptCommand::EndFreedriveMode => "end_freedrive_mode()".to_string(),
        }
    }

    /// Parse a line produced by [`ScriptCommand::render`]
    pub fn parse(line: &str) -> Result<Self> {
        ScriptParser::new()?.parse(line)
    }
}

const NUMBER: &str = r"[-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?";

/// Reads script lines back into [`ScriptCommand`]s
pub struct ScriptParser {
    move_pattern: Regex,
    speed_pattern: Regex,
    stop_pattern: Regex,
}

impl ScriptParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            move_pattern: Regex::new(&format!(
                r"^(?P<name>movej|movel)\((?P<pose>p)?\[(?P<values>[^\]]*)\],\s*a=(?P<a>{n}),\s*v=(?P<v>{n})\)$",
                n = NUMBER
            ))?,
            speed_pattern: Regex::new(&format!(
                r"^(?P<name>speedj|speedl)\(\[(?P<values>[^\]]*)\],\s*(?P<a>{n}),\s*(?P<t>{n})\)$",
                n = NUMBER
            ))?,
            stop_pattern: Regex::new(&format!(r"^(?P<name>stopj|stopl)\((?P<a>{n})\)$", n = NUMBER))?,
        })
    }

    pub fn parse(&self, line: &str) -> Result<ScriptCommand> {
        let line = line.trim();
        let invalid = || URError::InvalidRequest(format!("Unrecognized script line: {}", line));

        match line {
            "powerdown()" => return Ok(ScriptCommand::PowerDown),
            "set robotmode freedrive" => return Ok(ScriptCommand::SetRobotModeFreedrive),
            "set robotmode run" => return Ok(ScriptCommand::SetRobotModeRun),
            "freedrive_mode()" => return Ok(ScriptCommand::FreedriveMode),
            "end_freedrive_mode()" => return Ok(ScriptCommand::EndFreedriveMode),
            _ => {}
        }

        if let Some(caps) = self.stop_pattern.captures(line) {
            let a = parse_number(&caps["a"])?;
            return Ok(match &caps["name"] {
                "stopj" => ScriptCommand::StopJ { a },
                _ => ScriptCommand::StopL { a },
            });
        }

        if let Some(caps) = self.move_pattern.captures(line) {
            let values = parse_vector(&caps["values"])?;
            let a = parse_number(&caps["a"])?;
            let v = parse_number(&caps["v"])?;
            return match (&caps["name"], caps.name("pose").is_some()) {
                ("movej", false) => Ok(ScriptCommand::MoveJ { q: values, a, v }),
                ("movel", true) => Ok(ScriptCommand::MoveL { pose: values, a, v }),
                _ => Err(invalid()),
            };
        }

        if let Some(caps) = self.speed_pattern.captures(line) {
            let values = parse_vector(&caps["values"])?;
            let a = parse_number(&caps["a"])?;
            let t = parse_number(&caps["t"])?;
            return Ok(match &caps["name"] {
                "speedj" => ScriptCommand::SpeedJ { qd: values, a, t },
                _ => ScriptCommand::SpeedL { xd: values, a, t },
            });
        }

        Err(invalid())
    }
}

fn parse_number(text: &str) -> Result<f64> {
    text.trim()
        .parse::<f64>()
        .map_err(|e| URError::InvalidRequest(format!("Bad number '{}': {}", text, e)))
}

fn parse_vector(text: &str) -> Result<[f64; 6]> {
    let values = text.split(',').map(parse_number).collect::<Result<Vec<_>>>()?;
    let count = values.len();
    values
        .try_into()
        .map_err(|_| URError::InvalidRequest(format!("Expected 6 values, got {}", count)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_movej_zero_round_trip() {
        let line = ScriptCommand::MoveJ {
            q: [0.0; 6],
            a: 1.4,
            v: 1.05,
        }
        .render(6);
        assert_eq!(
            line,
            "movej([0.000000, 0.000000, 0.000000, 0.000000, 0.000000, 0.000000], a=1.400000, v=1.050000)"
        );

        match ScriptCommand::parse(&line).unwrap() {
            ScriptCommand::MoveJ { q, .. } => assert_eq!(q, [0.0; 6]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_movel_uses_pose_prefix() {
        let command = ScriptCommand::MoveL {
            pose: [0.4, -0.1, 0.3, 0.0, 3.14, 0.0],
            a: 1.2,
            v: 0.25,
        };
        let line = command.render(6);
        assert!(line.starts_with("movel(p[0.400000, -0.100000"));
        assert_eq!(ScriptCommand::parse(&line).unwrap(), command);

        // movel without the pose marker is not valid
        assert!(ScriptCommand::parse("movel([0, 0, 0, 0, 0, 0], a=1, v=1)").is_err());
    }

    #[test]
    fn test_velocity_lines_carry_duration() {
        let line = ScriptCommand::SpeedJ {
            qd: [0.1, 0.0, 0.0, 0.0, 0.0, -0.1],
            a: 2.0,
            t: 0.2,
        }
        .render(3);
        assert_eq!(line, "speedj([0.100, 0.000, 0.000, 0.000, 0.000, -0.100], 2.000, 0.200)");

        let line = ScriptCommand::SpeedL {
            xd: [0.05, 0.0, 0.0, 0.0, 0.0, 0.0],
            a: 1.0,
            t: 0.2,
        }
        .render(6);
        assert!(matches!(ScriptCommand::parse(&line).unwrap(), ScriptCommand::SpeedL { t, .. } if t == 0.2));
    }

    #[test]
    fn test_mode_commands_follow_firmware() {
        assert_eq!(ScriptCommand::free_drive(FirmwareVersion::V18).render(6), "set robotmode freedrive");
        assert_eq!(ScriptCommand::running(FirmwareVersion::Pre18).render(6), "set robotmode run");
        assert_eq!(ScriptCommand::free_drive(FirmwareVersion::V32).render(6), "freedrive_mode()");
        assert_eq!(ScriptCommand::running(FirmwareVersion::Unknown).render(6), "end_freedrive_mode()");
    }

    #[test]
    fn test_parse_rejects_wrong_arity() {
        assert!(ScriptCommand::parse("movej([0, 0, 0], a=1, v=1)").is_err());
        assert!(ScriptCommand::parse("textmsg(\"hi\")").is_err());
        assert_eq!(ScriptCommand::parse("stopl(1.5)").unwrap(), ScriptCommand::StopL { a: 1.5 });
    }
}
