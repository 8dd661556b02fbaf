//! The accessory server: TCP listener, shared state and lifecycle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hap_accessory::{
    AccessoryEvent, ChangeReason, ControllerStorage, Observers, SubscriptionHandle, WarningKind,
    Accessory, Perm,
};
use hap_core::category::Category;
use hap_core::connection::ConnectionId;
use hap_core::error::{DiscoveryError, Error, ParseError};
use hap_core::setup::{generate_setup_id, setup_uri};
use hap_discovery::{AdvertisementInfo, Advertiser};
use hap_pairing::{PairingStore, SetupPolicy};
use hap_storage::{AccessoryInfo, IdentifierCache, Storage};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::events::{EventHub, EventItem};
use crate::pipeline::Pipeline;

/// Lifecycle notifications for the hosting application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Listening(SocketAddr),
    Paired { controller: String },
    /// The last admin pairing was removed.
    Unpaired,
    /// The accessory tree changed and the configuration number was bumped.
    ConfigurationChanged { version: u32 },
}

/// State shared by the server handle and every connection task.
pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) accessory: Arc<Accessory>,
    pub(crate) store: Arc<PairingStore>,
    pub(crate) policy: Arc<SetupPolicy>,
    pub(crate) hub: Arc<EventHub>,
    pub(crate) pipeline: Pipeline,
    category: Category,
    advertiser: Arc<dyn Advertiser>,
    storage: Arc<dyn Storage>,
    identifiers: Mutex<IdentifierCache>,
    config_changes: mpsc::UnboundedSender<()>,
    observers: Observers<ServerEvent>,
    next_connection: AtomicU64,
}

impl Shared {
    fn advertisement_info(&self) -> AdvertisementInfo {
        AdvertisementInfo {
            display_name: self.accessory.name().to_string(),
            username: self.store.username(),
            setup_id: self.store.setup_id(),
            category: self.category,
            config_version: self.store.config_version(),
            paired: self.store.is_paired(),
        }
    }

    async fn update_advertisement(&self) {
        if let Err(e) = self.advertiser.update_advertisement(&self.advertisement_info()).await {
            warn!(error = %e, "Failed to update advertisement");
        }
    }

    pub(crate) async fn on_paired(&self, controller: &str) {
        info!(controller, "Accessory paired");
        self.observers.emit(&ServerEvent::Paired {
            controller: controller.to_string(),
        });
        self.update_advertisement().await;
    }

    pub(crate) async fn on_unpaired(&self) {
        info!("Accessory unpaired, resetting controller state");
        self.accessory.handle_factory_reset();
        self.observers.emit(&ServerEvent::Unpaired);
        self.update_advertisement().await;
    }

    /// Re-assign identifiers and bump the configuration number if the
    /// published structure changed.
    async fn refresh_configuration(&self) {
        {
            let mut identifiers = self.identifiers.lock();
            self.accessory.assign_ids(&mut identifiers);
            if let Err(e) = identifiers.save(self.storage.as_ref()) {
                error!(error = %e, "Failed to save identifier cache");
            }
        }
        self.pipeline.invalidate_cache();

        match self.store.check_config_hash(&self.accessory.structure_hash()) {
            Ok(true) => {
                let version = self.store.config_version();
                info!(version, "Accessory configuration changed");
                self.observers.emit(&ServerEvent::ConfigurationChanged { version });
                self.update_advertisement().await;
            }
            Ok(false) => debug!("Accessory configuration unchanged"),
            Err(e) => error!(error = %e, "Failed to persist configuration number"),
        }
    }

    fn handle_accessory_event(&self, event: &AccessoryEvent) {
        match event {
            AccessoryEvent::CharacteristicChange {
                aid,
                characteristic,
                change,
            } => {
                let props = characteristic.props();
                if !props.has(Perm::Notify) {
                    return;
                }
                if change.reason == ChangeReason::Read && !props.always_notify {
                    return;
                }
                let item = EventItem {
                    aid: *aid,
                    iid: characteristic.iid(),
                    value: change.new.to_json(),
                    immediate: props.immediate_delivery,
                };
                self.hub.publish(item, change.originator);
            }
            AccessoryEvent::CharacteristicWarning {
                aid,
                characteristic,
                warning,
            } => {
                let (aid, iid, name) = (*aid, characteristic.iid(), characteristic.name());
                match warning.kind {
                    WarningKind::SlowRead | WarningKind::SlowWrite | WarningKind::Warning => {
                        warn!(aid, iid, characteristic = name, "{}", warning.message)
                    }
                    WarningKind::TimeoutRead | WarningKind::TimeoutWrite | WarningKind::Error => {
                        error!(aid, iid, characteristic = name, "{}", warning.message)
                    }
                    WarningKind::Debug => debug!(aid, iid, characteristic = name, "{}", warning.message),
                }
            }
            AccessoryEvent::Identify { aid, paired } => {
                info!(aid, paired, "Identify");
            }
            AccessoryEvent::ConfigurationChange => {
                let _ = self.config_changes.send(());
            }
        }
    }
}

/// A published accessory.
///
/// Dropping the handle does not stop the server; call [`HapServer::shutdown`].
pub struct HapServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
    subscription: Option<SubscriptionHandle>,
}

impl HapServer {
    /// Publish `accessory`: load or create its pairing record, bind the
    /// listener and start advertising.
    pub async fn start(
        config: ServerConfig,
        accessory: Arc<Accessory>,
        storage: Arc<dyn Storage>,
        advertiser: Arc<dyn Advertiser>,
    ) -> Result<Self, Error> {
        let setup_id = match &config.setup_id {
            Some(id) => id.clone(),
            None => match AccessoryInfo::load(storage.as_ref(), &config.username)? {
                Some(info) if !info.setup_id.is_empty() => info.setup_id,
                _ => generate_setup_id(),
            },
        };
        let category = config.category.unwrap_or_else(|| accessory.category());

        let store = Arc::new(PairingStore::open(
            Arc::clone(&storage),
            &config.username,
            accessory.name(),
            category,
            &config.pincode,
            &setup_id,
        )?);
        let controller_storage = ControllerStorage::load(Arc::clone(&storage), &config.username)?;
        accessory.attach_controller_storage(Arc::new(controller_storage));

        accessory.mark_published()?;
        set_firmware_revision(&accessory, &config.firmware_revision);

        let mut identifiers = IdentifierCache::load(storage.as_ref(), &config.username)?;
        accessory.assign_ids(&mut identifiers);
        identifiers.save(storage.as_ref())?;
        if store.check_config_hash(&accessory.structure_hash())? {
            debug!(version = store.config_version(), "Configuration hash recorded");
        }

        let listener = TcpListener::bind((config.bind_address, config.port)).await?;
        let local_addr = listener.local_addr()?;

        let hub = Arc::new(EventHub::new());
        let pipeline = Pipeline::new(Arc::clone(&accessory), Arc::clone(&hub), &config);
        let (config_tx, config_rx) = mpsc::unbounded_channel();
        let debounce = config.config_debounce;
        let shared = Arc::new(Shared {
            policy: Arc::new(SetupPolicy::new(config.backoff.clone())),
            config,
            accessory: Arc::clone(&accessory),
            store,
            hub,
            pipeline,
            category,
            advertiser,
            storage,
            identifiers: Mutex::new(identifiers),
            config_changes: config_tx,
            observers: Observers::new(),
            next_connection: AtomicU64::new(1),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let subscription = accessory.subscribe(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_accessory_event(event);
            }
        });

        let advertised = async {
            shared.advertiser.init_port(local_addr.port()).await?;
            shared
                .advertiser
                .start_advertising(&shared.advertisement_info())
                .await?;
            Ok::<(), DiscoveryError>(())
        };
        if let Err(e) = advertised.await {
            subscription.cancel();
            accessory.mark_unpublished();
            return Err(e.into());
        }

        info!(
            address = %local_addr,
            name = %accessory.name(),
            setup_id = %shared.store.setup_id(),
            "Accessory server listening"
        );
        shared.observers.emit(&ServerEvent::Listening(local_addr));

        let tasks = vec![
            tokio::spawn(accept_loop(listener, Arc::clone(&shared))),
            tokio::spawn(debounce_configuration(Arc::clone(&shared), config_rx, debounce)),
        ];

        Ok(Self {
            shared,
            local_addr,
            tasks,
            subscription: Some(subscription),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `X-HM://` URI for QR codes.
    pub fn setup_uri(&self) -> Result<String, ParseError> {
        setup_uri(
            &self.shared.store.pincode(),
            self.shared.category,
            &self.shared.store.setup_id(),
        )
    }

    pub fn pincode(&self) -> String {
        self.shared.store.pincode()
    }

    pub fn pairing_store(&self) -> &Arc<PairingStore> {
        &self.shared.store
    }

    pub fn is_paired(&self) -> bool {
        self.shared.store.is_paired()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.hub.connection_count()
    }

    pub fn subscribe(&self, listener: impl Fn(&ServerEvent) + Send + Sync + 'static) -> SubscriptionHandle {
        self.shared.observers.subscribe(listener)
    }

    /// Stop accepting, close every connection and withdraw the advertisement.
    pub async fn shutdown(mut self) -> Result<(), Error> {
        info!("Shutting down accessory server");
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.shared.hub.close_all_except(None);
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        self.shared.accessory.mark_unpublished();
        self.shared.advertiser.stop_advertising().await?;
        Ok(())
    }
}

fn set_firmware_revision(accessory: &Accessory, revision: &str) {
    let characteristic = accessory
        .information_service()
        .and_then(|info| info.characteristic(hap_accessory::types::FIRMWARE_REVISION));
    match characteristic {
        Some(characteristic) => characteristic.update_value(revision),
        None => debug!("Accessory has no firmware revision characteristic"),
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let id = ConnectionId(shared.next_connection.fetch_add(1, Ordering::SeqCst));
        let connection = Connection::new(id, peer, Arc::clone(&shared));
        tokio::spawn(connection.run(stream));
    }
}

/// Apply bursts of configuration changes once they settle.
async fn debounce_configuration(
    shared: Arc<Shared>,
    mut changes: mpsc::UnboundedReceiver<()>,
    window: Duration,
) {
    while changes.recv().await.is_some() {
        loop {
            match tokio::time::timeout(window, changes.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        shared.refresh_configuration().await;
    }
}
