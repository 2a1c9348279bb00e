// One serial link to a motor board and the worker thread that drives it
//
// Each cycle: push at most one pending parameter frame (slot 0 before slot 1),
// then poll telemetry. The worker owns the connection exclusively; callers only
// reach the two motors through their locks.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::codec::{self, DecodeError, POLL_MARKER, RESPONSE_LEN};
use super::state::MotorCell;
use super::transport::{self, Connector, Transport, TransportError};
use crate::config::{READ_TIMEOUT, RECONNECT_BACKOFF};

/// Motors per board; fixed by the firmware
pub const SLOTS_PER_LINK: usize = 2;

/// Longest uninterrupted sleep while backing off, so a stop request is seen promptly
const BACKOFF_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        LinkError::Transport(TransportError::Io(e))
    }
}

/// Timing knobs shared by every link of a registry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkOptions {
    pub read_timeout: Duration,
    pub reconnect_backoff: Duration,
    /// Extra pause between cycles; zero lets the serial round trip set the pace
    pub poll_interval: Duration,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT,
            reconnect_backoff: RECONNECT_BACKOFF,
            poll_interval: Duration::ZERO,
        }
    }
}

/// A registered board: its port, its two motors and its worker
pub struct Link {
    port_name: String,
    motors: Arc<[MotorCell; SLOTS_PER_LINK]>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Link {
    /// Create the link and start its worker thread
    pub fn spawn(
        port_name: &str,
        baud_rate: u32,
        connector: Arc<dyn Connector>,
        options: LinkOptions,
    ) -> std::io::Result<Self> {
        let motors = Arc::new([MotorCell::new(), MotorCell::new()]);
        let running = Arc::new(AtomicBool::new(true));

        let worker = LinkWorker {
            port_name: port_name.to_string(),
            baud_rate,
            motors: Arc::clone(&motors),
            running: Arc::clone(&running),
            connector,
            options,
        };
        let handle = thread::Builder::new()
            .name(format!("link-{}", port_name))
            .spawn(move || worker.run())?;

        Ok(Self {
            port_name: port_name.to_string(),
            motors,
            running,
            handle: Some(handle),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn motor(&self, slot: usize) -> Option<&MotorCell> {
        self.motors.get(slot)
    }

    pub fn motors(&self) -> &[MotorCell; SLOTS_PER_LINK] {
        &self.motors
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the worker to finish its current iteration
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Wait for the worker to exit; a panicked worker is reported, not propagated.
    /// Returns false if there was no worker left to join.
    pub fn join(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        if handle.join().is_err() {
            error!("Worker for {} panicked", self.port_name);
        } else {
            debug!("Worker for {} joined", self.port_name);
        }
        true
    }

    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The worker side of a link; lives on its own thread
pub(crate) struct LinkWorker {
    port_name: String,
    baud_rate: u32,
    motors: Arc<[MotorCell; SLOTS_PER_LINK]>,
    running: Arc<AtomicBool>,
    connector: Arc<dyn Connector>,
    options: LinkOptions,
}

impl LinkWorker {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Open, drive, and on transport faults back off and reopen until stopped
    fn run(self) {
        info!("Link worker for {} started", self.port_name);

        while self.is_running() {
            let mut port = match self.connector.open(
                &self.port_name,
                self.baud_rate,
                self.options.read_timeout,
            ) {
                Ok(port) => port,
                Err(e) => {
                    warn!("Failed to open {}: {}", self.port_name, e);
                    self.back_off();
                    continue;
                }
            };
            info!("Opened {} at {} baud", self.port_name, self.baud_rate);

            if let Err(e) = self.drive(port.as_mut()) {
                warn!("Transport fault on {}: {}", self.port_name, e);
                drop(port);
                self.back_off();
            }
        }

        info!("Link worker for {} stopped", self.port_name);
    }

    /// Cycle until stopped; only transport faults end the session
    fn drive(&self, port: &mut dyn Transport) -> Result<(), TransportError> {
        while self.is_running() {
            match self.cycle(port) {
                Ok(()) => {}
                Err(LinkError::Decode(e)) => {
                    debug!("Missed sample on {}: {}", self.port_name, e);
                    port.discard_input()?;
                }
                Err(LinkError::Transport(e)) => return Err(e),
            }
            if !self.options.poll_interval.is_zero() {
                thread::sleep(self.options.poll_interval);
            }
        }
        Ok(())
    }

    /// One push-then-poll iteration
    pub(crate) fn cycle(&self, port: &mut dyn Transport) -> Result<(), LinkError> {
        self.push_pending(port)?;
        self.poll(port)
    }

    /// Send one pending parameter frame, lowest slot first
    fn push_pending(&self, port: &mut dyn Transport) -> Result<(), LinkError> {
        for (slot, motor) in self.motors.iter().enumerate() {
            // `dirty` is cleared under the lock; a write racing the send raises it again
            let Some(params) = motor.lock().take_pending() else {
                continue;
            };

            let frame = codec::encode_update(slot as u32, &params);
            debug!(
                "Pushing to {} slot {}: sp={}, kp={}, ki={}, kd={}",
                self.port_name, slot, params.setpoint, params.kp, params.ki, params.kd
            );
            if let Err(e) = port.write_all(&frame).and_then(|()| port.flush()) {
                motor.lock().dirty = true;
                return Err(e.into());
            }
            return Ok(());
        }
        Ok(())
    }

    /// Request telemetry and apply it only if the full response arrived
    fn poll(&self, port: &mut dyn Transport) -> Result<(), LinkError> {
        // Leftovers from a late or oversized reply would shift this response
        port.discard_input()?;
        port.write_all(&[POLL_MARKER])?;
        port.flush()?;

        let mut buf = [0u8; RESPONSE_LEN];
        let n = transport::read_up_to(port, &mut buf)?;
        let extra = if n == RESPONSE_LEN { port.bytes_pending()? } else { 0 };
        if extra > 0 {
            return Err(DecodeError::ShortFrame {
                expected: RESPONSE_LEN,
                actual: n + extra,
            }
            .into());
        }
        let samples = codec::decode_response(&buf[..n])?;

        let now = Instant::now();
        for (motor, sample) in self.motors.iter().zip(samples) {
            motor.lock().record_sample(sample, now);
        }
        Ok(())
    }

    /// Sleep for the reconnect backoff, waking early if stopped
    fn back_off(&self) {
        let deadline = Instant::now() + self.options.reconnect_backoff;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(BACKOFF_SLICE));
        }
    }
}
