//! relayd - overlay super-peer relay
//!
//! This daemon provides:
//! - Join/leave session management keyed by client identity
//! - Forwarding of messages between joined clients
//! - Duplicate suppression per session
//! - Listing of joined clients

pub mod config;
pub mod server;

pub use config::Config;
pub use server::Server;
