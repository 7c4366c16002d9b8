pub mod client;
pub mod state_machine;
pub mod transport;
