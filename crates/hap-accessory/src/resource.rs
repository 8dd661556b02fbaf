//! Per-accessory provider for `/resource` requests such as snapshots.

use async_trait::async_trait;
use hap_core::status::HapStatus;
use serde::Deserialize;

/// Body of a `POST /resource` request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceRequest {
    #[serde(rename = "resource-type")]
    pub resource_type: String,
    #[serde(rename = "image-width", default)]
    pub image_width: Option<u32>,
    #[serde(rename = "image-height", default)]
    pub image_height: Option<u32>,
    #[serde(default)]
    pub aid: Option<u64>,
}

/// Produces resources (e.g. camera snapshots) for one accessory.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn handle_resource(&self, request: &ResourceRequest) -> Result<Vec<u8>, HapStatus>;
}
