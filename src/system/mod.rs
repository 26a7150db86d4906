//! System-level wiring: shared state, messages, thread orchestration.

pub mod messages;
pub mod shared_state;
pub mod slam_system;

pub use messages::NewKeyFrame;
pub use shared_state::SharedState;
pub use slam_system::SlamSystem;
