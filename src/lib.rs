//! Device transfer and connection management for a ROM library client.
//!
//! [`state::AppState`] wires everything together: saved SFTP connections and
//! their credentials, the cached connection status, uploads, transfer history,
//! and the ledger of ROMs stored on this device.

pub mod config;
pub mod error;
pub mod history;
pub mod keychain;
pub mod local;
pub mod logging;
pub mod manager;
pub mod sftp;
pub mod state;
pub mod transfer;

pub use error::{AppError, AppResult};
pub use state::AppState;
