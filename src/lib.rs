//! URD RT - Universal Robots real-time interface client
//!
//! Connects to the controller's real-time port (30003), decodes the fixed-size
//! state packets it streams at 125 Hz, and turns motion requests into URScript
//! lines written back over the same socket. The driver is cycle-driven: the
//! host calls [`UrDriver::run_cycle`] periodically and everything (reconnect,
//! decoding, dispatch, keep-alive) happens inside that call.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use urd_rt::{Config, UrDriver};
//!
//! fn main() -> urd_rt::Result<()> {
//!     let mut driver = UrDriver::new(Config::for_host("192.168.1.100"))?;
//!     let handle = driver.handle();
//!
//!     std::thread::spawn(move || loop {
//!         driver.run_cycle();
//!         std::thread::sleep(std::time::Duration::from_millis(8));
//!     });
//!
//!     handle.move_joint_position(&[0.0, -1.57, 1.57, -1.57, -1.57, 0.0])?;
//!     println!("{:?}", handle.snapshot().motion_state);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **UrDriver**: owns the connection and runs one cycle per call
//! - **DriverHandle**: cloneable, thread-safe request and snapshot access
//! - **PacketDecoder**: stream resynchronization and firmware detection
//! - **CommandDispatcher**: motion gating, URScript rendering, velocity keep-alive
//! - **StatusReporter** / **EventObserver**: operator messages and discrete events

pub mod buffer;
pub mod config;
pub mod dashboard;
pub mod decoder;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod events;
pub mod monitoring;
pub mod packet;
pub mod reporter;
pub mod script;
pub mod state;
pub mod transport;

// High-level exports for easy usage
pub use config::{Config, PublishingConfig};
pub use driver::{DriverHandle, UrDriver};
pub use error::{Result, URError};
pub use events::{DriverEvent, EventObserver};
pub use packet::FirmwareVersion;
pub use reporter::{ConsoleReporter, NoOpReporter, StatusReporter, TracingReporter};
pub use state::{
    CartesianState, ControllerStatus, DriverMotionState, JointMode, JointState, RobotMode, RobotSnapshot, SafetyMode,
};

// Core component exports for advanced usage
pub use config::{MotionConfig, ReconnectConfig, RobotConfig, TimingConfig};
pub use dashboard::{query_polyscope_version, DashboardClient, PolyscopeVersion};
pub use decoder::{DecodeOutcome, PacketDecoder};
pub use dispatcher::{CommandDispatcher, DispatchOutcome, MotionRequest};
pub use monitoring::{MonitorOutput, PositionData, RobotStateData};
pub use script::ScriptCommand;
pub use transport::{TcpTransport, Transport};
