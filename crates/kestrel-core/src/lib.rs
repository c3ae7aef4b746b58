//! Shared vocabulary for the kestrel agent runtime.

pub mod errors;
pub mod events;
pub mod hooks;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod sandbox;
pub mod todos;
pub mod tools;
