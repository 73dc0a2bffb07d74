pub mod client;
pub mod coordinator;
pub mod tls;

pub use client::{FleetClient, NodeHandle};
pub use coordinator::Coordinator;
