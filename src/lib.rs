//! adb-freeze - embedded ADB (Android Debug Bridge) client over TCP
//!
//! Talks to a local adbd (typically `127.0.0.1:5555` with wireless debugging
//! enabled), authenticates with a persisted RSA key, multiplexes streams over
//! the single socket and runs one-shot shell commands such as
//! `am force-stop <package>`.
//!
//! # Example
//!
//! ```no_run
//! use adb_freeze::{client, AdbConfig, AdbKeyPair};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), adb_freeze::AdbError> {
//! let config = AdbConfig::default();
//! let keypair = AdbKeyPair::load_or_generate(&config.private_key_path, &config.public_key_path)?;
//!
//! let connection = client::connect(&config, Arc::new(keypair))?;
//! let output = client::shell(&connection, "getprop ro.product.model")?;
//! println!("{}", String::from_utf8_lossy(&output));
//!
//! let stopped = client::force_stop_packages(&connection, ["com.example.app"]);
//! println!("stopped {}", stopped);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod stream;
pub mod transport;

// Re-export main types
pub use auth::AdbKeyPair;
pub use client::{AppKiller, Fallback};
pub use config::AdbConfig;
pub use connection::AdbConnection;
pub use protocol::{AdbError, AuthType, Command, ConnectionState, Message};
pub use stream::AdbStream;
