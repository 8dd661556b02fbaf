//! # hap-discovery
//!
//! mDNS advertisement of HomeKit accessories.
//!
//! This crate provides:
//! - The [`Advertiser`] interface used by the server
//! - `_hap._tcp` TXT record construction
//! - An `mdns-sd` backed advertiser
//!
//! ## Example
//!
//! ```ignore
//! use hap_discovery::{Advertiser, MdnsAdvertiser};
//!
//! let advertiser = MdnsAdvertiser::new()?;
//! advertiser.init_port(51826).await?;
//! advertiser.start_advertising(&info).await?;
//! ```

mod advertiser;
mod txt;

pub use advertiser::{Advertiser, MdnsAdvertiser};
#[cfg(any(test, feature = "mock"))]
pub use advertiser::MockAdvertiser;
pub use txt::{AdvertisementInfo, PROTOCOL_VERSION};

/// Service type HomeKit controllers browse for.
pub const HAP_SERVICE_TYPE: &str = "_hap._tcp.local.";
