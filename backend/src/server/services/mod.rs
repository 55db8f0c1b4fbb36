pub mod session_state;
pub mod state_store;
pub mod telegram;
