// Host-side monitor loop with a telemetry watchdog and an operator console
// Note: the core never surfaces transport faults; a board that stops answering only
// shows up here as telemetry that stops getting fresher.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::TELEMETRY_TIMEOUT;
use crate::messages::{ParamsUpdate, Telemetry};
use crate::motor::state::MotorView;
use crate::registry::Registry;

/// Mean rpm over motors spinning forward; 0 when none are
pub fn average_speed(snapshot: &BTreeMap<usize, Telemetry>) -> f32 {
    let (sum, count) = snapshot
        .values()
        .map(|t| t.rpm)
        .filter(|&rpm| rpm > 0.0)
        .fold((0.0f32, 0usize), |(sum, count), rpm| (sum + rpm, count + 1));

    if count == 0 { 0.0 } else { sum / count as f32 }
}

/// Overall telemetry freshness
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Ok,
    TelemetryStale,
}

/// Stale if any motor has no sample yet or its sample is older than `timeout`
pub fn assess(motors: &BTreeMap<usize, MotorView>, timeout: Duration) -> Health {
    let stale = motors
        .values()
        .any(|view| view.sample_age().is_none_or(|age| age > timeout));
    if stale {
        Health::TelemetryStale
    } else {
        Health::Ok
    }
}

/// One line of `--json` output
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub health: Health,
    pub average_rpm: f32,
    pub motors: BTreeMap<usize, MotorView>,
}

pub struct Monitor {
    health: Health,
    timeout: Duration,
}

impl Monitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            health: Health::TelemetryStale, // Start stale until the first samples arrive
            timeout,
        }
    }

    pub fn health(&self) -> Health {
        self.health
    }

    /// Build a report from the registry's cached state, logging health transitions
    pub fn observe(&mut self, registry: &Registry) -> StatusReport {
        let motors = registry.motors_all();
        let health = if motors.is_empty() {
            Health::Ok
        } else {
            assess(&motors, self.timeout)
        };

        if health != self.health {
            match health {
                Health::Ok => info!("Telemetry flowing from all {} motors", motors.len()),
                Health::TelemetryStale => warn!(
                    "Telemetry stale (no sample within {:?}) on at least one motor",
                    self.timeout
                ),
            }
            self.health = health;
        }

        let telemetry = motors.iter().map(|(&i, view)| (i, view.telemetry)).collect();
        StatusReport {
            health,
            average_rpm: average_speed(&telemetry),
            motors,
        }
    }
}

/// Operator console commands, one per stdin line
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// set <index> [setpoint=v] [kp=v] [ki=v] [kd=v]
    Set { index: usize, update: ParamsUpdate },
    /// speed <v>: same setpoint for every motor
    Speed(f64),
    /// add <port> [baud]
    Add { port: String, baud_rate: Option<u32> },
    Show,
    Quit,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command {0:?}")]
    Unknown(String),

    #[error("missing argument: {0}")]
    Missing(&'static str),

    #[error("bad value {value:?} for {field}")]
    BadValue { field: String, value: String },
}

fn parse_value<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, CommandError> {
    value.parse().map_err(|_| CommandError::BadValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}

pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let mut words = line.split_whitespace();
    let verb = words.next().ok_or(CommandError::Empty)?;

    match verb.to_ascii_lowercase().as_str() {
        "set" => {
            let index = parse_value("index", words.next().ok_or(CommandError::Missing("index"))?)?;
            let mut update = ParamsUpdate::default();
            for pair in words {
                let (field, value) = pair.split_once('=').ok_or_else(|| CommandError::BadValue {
                    field: "assignment".to_string(),
                    value: pair.to_string(),
                })?;
                match field.to_ascii_lowercase().as_str() {
                    "setpoint" | "sp" => update.setpoint = Some(parse_value(field, value)?),
                    "kp" => update.kp = Some(parse_value(field, value)?),
                    "ki" => update.ki = Some(parse_value(field, value)?),
                    "kd" => update.kd = Some(parse_value(field, value)?),
                    _ => {
                        return Err(CommandError::BadValue {
                            field: "field".to_string(),
                            value: field.to_string(),
                        });
                    }
                }
            }
            if update.is_empty() {
                return Err(CommandError::Missing("setpoint/kp/ki/kd"));
            }
            Ok(Command::Set { index, update })
        }
        "speed" => {
            let value = words.next().ok_or(CommandError::Missing("setpoint"))?;
            Ok(Command::Speed(parse_value("setpoint", value)?))
        }
        "add" => {
            let port = words.next().ok_or(CommandError::Missing("port"))?.to_string();
            let baud_rate = words.next().map(|b| parse_value("baud", b)).transpose()?;
            Ok(Command::Add { port, baud_rate })
        }
        "show" => Ok(Command::Show),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

/// Log every motor's params and telemetry
fn show(registry: &Registry) {
    for (index, view) in registry.motors_all() {
        let port = registry.port_of(index).unwrap_or("?");
        let t = view.telemetry;
        info!(
            "Motor {} ({}): sp={} kp={} ki={} kd={}{} | rpm={} err={} pid={} p={} i={} d={}",
            index,
            port,
            view.params.setpoint,
            view.params.kp,
            view.params.ki,
            view.params.kd,
            if view.dirty { " (pending)" } else { "" },
            t.rpm,
            t.error,
            t.pid_output,
            t.proportional,
            t.integral,
            t.derivative
        );
    }
}

/// Apply one console command; returns false on quit
fn execute(registry: &mut Registry, command: Command, default_baud: u32) -> bool {
    match command {
        Command::Set { index, update } => {
            if let Err(e) = registry.update_motor(index, update) {
                warn!("{}", e);
            }
        }
        Command::Speed(setpoint) => registry.update_all_setpoints(setpoint),
        Command::Add { port, baud_rate } => {
            if let Err(e) = registry.add_link(&port, baud_rate.unwrap_or(default_baud)) {
                warn!("{}", e);
            }
        }
        Command::Show => show(registry),
        Command::Quit => return false,
    }
    true
}

/// Runtime settings taken from the command line
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub rate_hz: u64,
    pub default_baud: u32,
    pub json: bool,
}

type Error = Box<dyn std::error::Error + Send + Sync>;

/// Monitor tick period; never zero, whatever rate is asked for
fn tick_period(rate_hz: u64) -> Duration {
    Duration::from_millis((1000 / rate_hz.max(1)).max(1))
}

/// Run the monitor and console until quit, Ctrl-C or an error
pub async fn run(registry: Registry, options: RuntimeOptions) -> Result<(), Error> {
    run_then_stop(registry, async |registry: &mut Registry| {
        monitor_loop(registry, &options).await
    })
    .await
}

/// Drive `body`, then stop every link off the async workers whatever `body` returned
async fn run_then_stop<F>(mut registry: Registry, body: F) -> Result<(), Error>
where
    F: AsyncFnOnce(&mut Registry) -> Result<(), Error>,
{
    let result = body(&mut registry).await;

    info!("Stopping links...");
    tokio::task::spawn_blocking(move || registry.stop_all()).await?;
    result
}

async fn monitor_loop(registry: &mut Registry, options: &RuntimeOptions) -> Result<(), Error> {
    let mut monitor = Monitor::new(TELEMETRY_TIMEOUT);
    let mut tick = interval(tick_period(options.rate_hz));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    info!(
        "Monitoring {} motors on {:?} at {}Hz",
        registry.motor_count(),
        registry.ports(),
        options.rate_hz
    );
    info!("Commands: set <i> [setpoint=v] [kp=v] [ki=v] [kd=v] | speed <v> | add <port> [baud] | show | quit");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let report = monitor.observe(registry);
                if options.json {
                    println!("{}", serde_json::to_string(&report)?);
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match parse_command(&line) {
                        Ok(command) => {
                            if !execute(registry, command, options.default_baud) {
                                return Ok(());
                            }
                        }
                        Err(e) => warn!("Failed to parse command: {}", e),
                    },
                    None => stdin_open = false,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
        }
    }
}
