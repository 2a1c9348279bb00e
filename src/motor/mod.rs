// Per-board plumbing
//
// Provides:
// - Binary codec for the poll / parameter-update frames
// - Per-motor state guarded by its own lock
// - Transport seam over the serial layer
// - Link worker running the push/poll cycle

pub mod codec;
pub mod link;
pub mod state;
pub mod transport;

pub use codec::{DecodeError, decode_response, decode_telemetry, encode_update};
pub use link::{Link, LinkError, LinkOptions, SLOTS_PER_LINK};
pub use state::{MotorCell, MotorState, MotorView};
pub use transport::{Connector, SerialConnector, Transport, TransportError};
