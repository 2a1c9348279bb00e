// Timeouts, rates, link defaults
use std::time::Duration;

// Serial configuration used by the motor boards
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;

// Upper bound on a single telemetry read (a hung board delays shutdown by at most this)
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

// Pause before re-opening a link after a transport fault
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

// Host-side monitor loop frequency
pub const MONITOR_HZ: u64 = 10;

// Telemetry older than this marks the system stale
pub const TELEMETRY_TIMEOUT: Duration = Duration::from_secs(1);
