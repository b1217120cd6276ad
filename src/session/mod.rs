//! Client sessions
//!
//! Connection phase tracking and the per-instance client manager.

pub mod context;
pub mod manager;
pub mod state;

pub use context::{ClientId, ClientInfo};
pub use manager::{ClientManager, ClientRecord};
pub use state::{ConnectionPhase, SessionState};
