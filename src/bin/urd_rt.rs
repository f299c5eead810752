//! UR real-time console
//!
//! Runs the driver loop on its own thread, prints position and state JSON
//! lines to stdout, and reads single-letter commands from stdin:
//!
//! ```text
//! m q0..q5          position move joints (deg)
//! M x y z [rx ry rz] position move Cartesian (mm, rotation vector in rad; omitted keeps current)
//! v qd0..qd5        velocity move joints (deg/s)
//! V vx vy vz wx wy wz velocity move Cartesian (mm/s, deg/s)
//! s                 stop motion
//! f                 free drive mode
//! r                 running mode
//! n                 power off
//! x                 firmware version
//! q                 quit
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use urd_rt::{
    query_polyscope_version, Config, ConsoleReporter, DriverEvent, DriverHandle, MonitorOutput, UrDriver,
};

const DASHBOARD_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "urd_rt")]
#[command(about = "Universal Robots real-time client - console driver with JSON monitoring")]
#[command(version)]
struct Args {
    /// Path to the driver configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Robot address, overrides robot.host from the config
    #[arg(long)]
    host: Option<String>,

    /// Ask the dashboard server for the PolyScope version before starting
    #[arg(long)]
    query_version: bool,

    /// Print driver status messages as JSON lines on stdout instead of logging them
    #[arg(long)]
    json_status: bool,
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("DEFAULT_CONFIG_PATH").ok())
            .unwrap_or_else(|| "config/default_config.yaml".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.get_config_path();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    info!("Universal Robots Real-Time Client (Rust)");
    info!("{}", "=".repeat(50));
    info!("Using config: {}", config_path);

    let mut config = Config::load_from_path(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;
    if let Some(host) = &args.host {
        config.robot.host = host.clone();
    }

    let mut driver = UrDriver::new(config.clone()).context("Failed to create driver")?;
    if args.json_status {
        driver = driver.with_reporter(ConsoleReporter::new());
    }

    if args.query_version {
        let host = config.robot.host.clone();
        let port = config.robot.dashboard_port;
        let queried = tokio::task::spawn_blocking(move || query_polyscope_version(&host, port, DASHBOARD_TIMEOUT))
            .await
            .context("Dashboard query task failed")?;
        match queried {
            Ok(version) => driver.set_polyscope_version(version),
            Err(e) => warn!("Could not query PolyScope version: {}", e),
        }
    }

    let handle = driver.handle();
    let shutdown_signal = Arc::new(AtomicBool::new(false));
    let cycle_period = config.timing.cycle_period();

    let control_thread = {
        let shutdown = Arc::clone(&shutdown_signal);
        std::thread::Builder::new()
            .name("urd-rt-cycle".to_string())
            .spawn(move || run_control_loop(driver, cycle_period, shutdown))
            .context("Failed to spawn control thread")?
    };

    let monitoring_task = {
        let mut receiver = handle.watch();
        let mut monitor = MonitorOutput::from_config(&config.publishing);
        tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let snapshot = receiver.borrow_and_update().clone();
                monitor.process(&snapshot, Instant::now());
            }
        })
    };

    let events_task = {
        let mut events = handle.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DriverEvent::ReceiveTimeout) => debug!("Receive timeout"),
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(json) => println!("{}", json),
                        Err(e) => warn!("Failed to serialize event: {}", e),
                    },
                    Err(RecvError::Lagged(skipped)) => debug!("Skipped {} events", skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) => {
                        match handle_command(&line, &handle) {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => error!("{}", e),
                        }
                    }
                    None => {
                        info!("stdin closed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C");
                break;
            }
        }
    }

    info!("Performing graceful shutdown");
    shutdown_signal.store(true, Ordering::Relaxed);
    // Channels close once the driver and every handle are gone
    drop(handle);
    tokio::task::spawn_blocking(move || control_thread.join())
        .await
        .context("Failed to wait for control thread")?
        .map_err(|_| anyhow::anyhow!("Control thread panicked"))?;
    let _ = monitoring_task.await;
    let _ = events_task.await;

    info!("Shutdown complete");
    Ok(())
}

/// Call `run_cycle` at the configured rate until told to stop
fn run_control_loop(mut driver: UrDriver, period: Duration, shutdown: Arc<AtomicBool>) {
    info!("Control loop running every {:?}", period);
    while !shutdown.load(Ordering::Relaxed) {
        let started = Instant::now();
        driver.run_cycle();
        std::thread::sleep(period.saturating_sub(started.elapsed()));
    }
    driver.shutdown();
}

fn print_help() {
    info!("m: position move joints (deg)");
    info!("M: position move cartesian (mm, optional rotation vector in rad)");
    info!("v: velocity move joints (deg/s)");
    info!("V: velocity move cartesian (mm/s, deg/s)");
    info!("s: stop motion");
    info!("x: get version");
    info!("f: free drive mode");
    info!("r: running mode");
    info!("n: shut down robot");
    info!("q: quit");
}

/// Execute one console line; `Ok(false)` means quit
fn handle_command(line: &str, handle: &DriverHandle) -> Result<bool> {
    let mut tokens = line.split_whitespace();
    let Some(key) = tokens.next() else {
        return Ok(true);
    };
    let values = tokens
        .map(|t| t.parse::<f64>().with_context(|| format!("Not a number: {}", t)))
        .collect::<Result<Vec<f64>>>()?;

    match key {
        "m" => {
            let q = expect_values(&values, 6, "joint positions (deg)")?;
            handle.move_joint_position(&degrees_to_radians(q))?;
        }
        "M" => {
            if values.len() != 3 && values.len() != 6 {
                bail!("Expected x y z (mm) and optionally rx ry rz (rad)");
            }
            let mut pose = [0.0; 6];
            for (target, mm) in pose.iter_mut().zip(&values[..3]) {
                *target = mm / 1000.0;
            }
            if values.len() == 6 && values[3..].iter().any(|v| *v != 0.0) {
                pose[3..].copy_from_slice(&values[3..]);
            } else {
                pose[3..].copy_from_slice(&handle.snapshot().cartesian.tcp_pose[3..]);
            }
            handle.move_cartesian_position(&pose)?;
        }
        "v" => {
            let qd = expect_values(&values, 6, "joint velocities (deg/s)")?;
            handle.move_joint_velocity(&degrees_to_radians(qd))?;
        }
        "V" => {
            let xd = expect_values(&values, 6, "linear (mm/s) and angular (deg/s) velocities")?;
            let linear: Vec<f64> = xd[..3].iter().map(|v| v / 1000.0).collect();
            handle.move_cartesian_velocity(&linear, &degrees_to_radians(&xd[3..]))?;
        }
        "s" => handle.stop_motion()?,
        "f" => handle.set_free_drive_mode()?,
        "r" => handle.set_running_mode()?,
        "n" => handle.disable_motor_power()?,
        "x" => info!("Firmware version: {}", handle.snapshot().firmware),
        "q" => {
            info!("Exiting..");
            return Ok(false);
        }
        other => warn!("Unknown command '{}'", other),
    }
    Ok(true)
}

fn expect_values<'a>(values: &'a [f64], count: usize, what: &str) -> Result<&'a [f64]> {
    if values.len() != count {
        bail!("Expected {} {}, got {}", count, what, values.len());
    }
    Ok(values)
}

fn degrees_to_radians(values: &[f64]) -> Vec<f64> {
    values.iter().map(|v| v.to_radians()).collect()
}
