// Byte-stream seam between link workers and the OS serial layer
//
// Workers only see `Transport` (a byte stream) and `Connector` (port listing + open),
// so the poll/push cycle runs the same against a real board or an in-memory one.

use serialport::{self, ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// An open, exclusively owned connection to one board
pub trait Transport: Read + Write + Send {
    /// Drop bytes that arrived but were not read yet
    fn discard_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Bytes received but not read yet
    fn bytes_pending(&mut self) -> io::Result<usize> {
        Ok(0)
    }
}

impl Transport for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn bytes_pending(&mut self) -> io::Result<usize> {
        let pending = self.bytes_to_read().map_err(io::Error::from)?;
        Ok(pending as usize)
    }
}

/// Enumerates and opens board connections
pub trait Connector: Send + Sync + 'static {
    /// Names of the devices that can currently be opened
    fn available_ports(&self) -> Result<Vec<String>>;

    /// Open `port`; reads on the returned transport give up after `timeout`
    fn open(&self, port: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn Transport>>;
}

/// Connector backed by the host's serial devices
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn available_ports(&self) -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|info| info.port_name).collect())
    }

    fn open(&self, port: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn Transport>> {
        debug!("Opening {} at {} baud", port, baud_rate);
        let port = serialport::new(port, baud_rate).timeout(timeout).open()?;
        Ok(Box::new(port))
    }
}

/// Read until `buf` is full, the peer stops sending, or the read times out.
///
/// Returns how many bytes were read; a timeout is not an error here, the
/// caller decides what a short count means. Any other IO failure is.
pub fn read_up_to(port: &mut dyn Transport, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match port.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
