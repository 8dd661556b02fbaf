//! Advertisement of the accessory over mDNS.

use async_trait::async_trait;
use hap_core::error::DiscoveryError;
use mdns_sd::{ServiceDaemon, ServiceInfo};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::txt::AdvertisementInfo;
use crate::HAP_SERVICE_TYPE;

/// Publishes the accessory so controllers can find it.
///
/// `init_port` must be called before advertising starts.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait Advertiser: Send + Sync {
    async fn init_port(&self, port: u16) -> Result<(), DiscoveryError>;

    async fn start_advertising(&self, info: &AdvertisementInfo) -> Result<(), DiscoveryError>;

    /// Republish after the configuration version or pairing status changed.
    async fn update_advertisement(&self, info: &AdvertisementInfo) -> Result<(), DiscoveryError>;

    async fn stop_advertising(&self) -> Result<(), DiscoveryError>;
}

/// [`Advertiser`] backed by the `mdns-sd` responder.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    port: Mutex<Option<u16>>,
    registered: Mutex<Option<String>>,
}

impl MdnsAdvertiser {
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| DiscoveryError::Daemon(format!("Failed to create mDNS daemon: {}", e)))?;
        Ok(Self {
            daemon,
            port: Mutex::new(None),
            registered: Mutex::new(None),
        })
    }

    fn service_info(&self, info: &AdvertisementInfo) -> Result<ServiceInfo, DiscoveryError> {
        let port = (*self.port.lock()).ok_or(DiscoveryError::NoPort)?;
        let service = ServiceInfo::new(
            HAP_SERVICE_TYPE,
            &info.display_name,
            &info.host_name(),
            "",
            port,
            info.txt_properties(),
        )
        .map_err(|e| DiscoveryError::Registration(e.to_string()))?
        .enable_addr_auto();
        Ok(service)
    }

    fn register(&self, info: &AdvertisementInfo) -> Result<(), DiscoveryError> {
        let service = self.service_info(info)?;
        let fullname = service.get_fullname().to_string();
        self.daemon
            .register(service)
            .map_err(|e| DiscoveryError::Registration(e.to_string()))?;
        *self.registered.lock() = Some(fullname);
        Ok(())
    }
}

#[async_trait]
impl Advertiser for MdnsAdvertiser {
    async fn init_port(&self, port: u16) -> Result<(), DiscoveryError> {
        *self.port.lock() = Some(port);
        Ok(())
    }

    async fn start_advertising(&self, info: &AdvertisementInfo) -> Result<(), DiscoveryError> {
        self.register(info)?;
        info!(
            name = %info.display_name,
            id = %info.username,
            config_version = info.config_version,
            "Advertising accessory"
        );
        Ok(())
    }

    async fn update_advertisement(&self, info: &AdvertisementInfo) -> Result<(), DiscoveryError> {
        if self.registered.lock().is_none() {
            debug!("Advertisement update before start, ignoring");
            return Ok(());
        }
        self.register(info)?;
        debug!(
            config_version = info.config_version,
            paired = info.paired,
            "Advertisement updated"
        );
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), DiscoveryError> {
        let Some(fullname) = self.registered.lock().take() else {
            return Ok(());
        };
        if let Err(e) = self.daemon.unregister(&fullname) {
            warn!(service = %fullname, error = %e, "Failed to unregister service");
        }
        info!(service = %fullname, "Stopped advertising");
        Ok(())
    }
}
