pub mod config;
pub mod loader;
pub mod messages;
pub mod motor;
pub mod registry;
pub mod runtime;

pub use messages::{MotorParams, ParamsUpdate, Telemetry};
pub use registry::{LinkHandle, Registry, RegistryError};
