//! chatwatch protocol
//!
//! Shared types for communication between the chatwatch server and observers.
//! These types are serialized as JSON over WebSocket.

pub mod server;
pub mod types;

pub use server::ServerMessage;
pub use types::*;
