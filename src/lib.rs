pub mod client;
pub mod common;

pub use client::config::{ClientConfig, SessionConfig};
pub use client::session::{RoomSession, SessionUpdate};
pub use common::error::{Result, SyncError};
