//! # hap-server
//!
//! The accessory side of the HomeKit Accessory Protocol over TCP.
//!
//! This crate provides:
//! - The HAP flavour of HTTP/1.1, including `EVENT/1.0` notifications
//! - Routing of pairing, accessory and characteristic requests
//! - Concurrent batch reads and writes with slow and timeout warnings
//! - Per-connection event subscriptions with coalescing
//! - Publication through an [`Advertiser`](hap_discovery::Advertiser)
//!
//! ## Example
//!
//! ```ignore
//! use hap_server::{HapServer, ServerConfig};
//!
//! let config = ServerConfig::builder("CC:22:3D:E3:CE:30", "031-45-154").build()?;
//! let server = HapServer::start(config, accessory, storage, advertiser).await?;
//! println!("{}", server.setup_uri()?);
//! ```

pub mod config;
mod connection;
pub mod events;
pub mod http;
pub mod pipeline;
mod server;

pub use config::{ServerConfig, ServerConfigBuilder, DEFAULT_PORT};
pub use http::{HttpRequest, HttpResponse, Method};
pub use server::{HapServer, ServerEvent};
