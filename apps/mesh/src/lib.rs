pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use channel::DataChannel;
pub use config::{MeshConfig, TransportMode};
pub use context::MeshContext;
pub use error::{MeshError, MeshResult};
pub use session::{MeshEvent, RoomInfo, RoomStatus};
pub use transport::Payload;

#[cfg(test)]
mod tests;
