//! `_hap._tcp` TXT record contents.

use std::collections::HashMap;

use hap_core::category::Category;
use hap_core::setup::setup_hash;

/// HAP protocol version advertised in `pv`.
pub const PROTOCOL_VERSION: &str = "1.1";

/// Everything the advertisement is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementInfo {
    pub display_name: String,
    /// Pairing identifier in MAC form (`CC:22:3D:E3:CE:30`).
    pub username: String,
    pub setup_id: String,
    pub category: Category,
    pub config_version: u32,
    pub paired: bool,
}

impl AdvertisementInfo {
    /// Ordered TXT key/value pairs.
    pub fn txt_record(&self) -> Vec<(&'static str, String)> {
        vec![
            ("c#", self.config_version.to_string()),
            ("ff", "0".to_string()),
            ("id", self.username.clone()),
            ("md", self.display_name.clone()),
            ("pv", PROTOCOL_VERSION.to_string()),
            ("s#", "1".to_string()),
            ("sf", if self.paired { "0" } else { "1" }.to_string()),
            ("ci", self.category.as_u8().to_string()),
            ("sh", setup_hash(&self.setup_id, &self.username)),
        ]
    }

    pub fn txt_properties(&self) -> HashMap<String, String> {
        self.txt_record()
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect()
    }

    /// mDNS host name derived from the pairing identifier.
    pub fn host_name(&self) -> String {
        format!("{}.local.", self.username.replace(':', ""))
    }
}
