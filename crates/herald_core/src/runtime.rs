//! Wires configuration, persisted state, pollers, the dispatcher and the
//! control plane into one runnable unit.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{HeraldConfig, SourceConfig};
use crate::control::{ControlPlane, SourceHandle};
use crate::data_source::{
    BiliDynAdapter, BiliLiveAdapter, CadenceClass, SourceAdapter, SourcePoller, WeiboAdapter,
    herald_reqwest_client,
};
use crate::error::Result;
use crate::id::SourceType;
use crate::queue::{Dispatcher, event_queue};
use crate::subscription::SubscriptionRegistry;
use crate::transport::{PersistentChannels, Transport, TransportHub};
use crate::watch::{JsonFileStore, PersistenceStore, WatchRegistry};

/// A fully assembled pipeline that has not started yet.
#[derive(Debug)]
pub struct HeraldRuntime {
    control: Arc<ControlPlane>,
    pollers: Vec<SourcePoller>,
    dispatcher: Dispatcher,
}

/// Join handles of a started runtime.
#[derive(Debug)]
pub struct RuntimeHandles {
    pub pollers: Vec<JoinHandle<()>>,
    pub dispatcher: JoinHandle<()>,
}

impl RuntimeHandles {
    /// Stops every background task. In-flight work is abandoned.
    pub fn abort(&self) {
        for poller in &self.pollers {
            poller.abort();
        }
        self.dispatcher.abort();
    }
}

impl HeraldRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn control(&self) -> &Arc<ControlPlane> {
        &self.control
    }

    pub fn pollers(&self) -> &[SourcePoller] {
        &self.pollers
    }

    /// Spawns every poller and the dispatcher.
    pub fn start(self) -> RuntimeHandles {
        info!("starting {} pollers", self.pollers.len());
        let pollers = self.pollers.into_iter().map(SourcePoller::start).collect();
        RuntimeHandles {
            pollers,
            dispatcher: self.dispatcher.start(),
        }
    }
}

/// Builder for constructing a HeraldRuntime
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    config: HeraldConfig,
    store: Option<Arc<dyn PersistenceStore>>,
    adapters: BTreeMap<SourceType, Arc<dyn SourceAdapter>>,
    transport: Option<Arc<dyn Transport>>,
    channels: Option<Arc<PersistentChannels>>,
}

impl RuntimeBuilder {
    /// Set the configuration (defaults to everything disabled)
    pub fn config(mut self, config: HeraldConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the state store (defaults to JSON files in `state.directory`)
    pub fn store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `adapter` instead of the built-in one for its source type. The
    /// source still has to be enabled in the configuration.
    pub fn adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.insert(adapter.source_type(), adapter);
        self
    }

    /// Set the delivery transport (defaults to a [`TransportHub`])
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share an existing set of persistent channels
    pub fn channels(mut self, channels: Arc<PersistentChannels>) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Loads persisted state and assembles the pipeline.
    pub async fn build(self) -> Result<HeraldRuntime> {
        let config = self.config;
        let store: Arc<dyn PersistenceStore> = match self.store {
            Some(store) => store,
            None => Arc::new(JsonFileStore::new(&config.state.directory)),
        };
        let channels = self.channels.unwrap_or_default();
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(TransportHub::new(
                Arc::clone(&channels),
                herald_reqwest_client(None)?,
            )),
        };

        let subscriptions = Arc::new(SubscriptionRegistry::load(Arc::clone(&store)).await?);
        let (queue, events) = event_queue();

        let mut sources = BTreeMap::new();
        let mut pollers = Vec::new();
        for source_type in config.enabled_sources() {
            let settings = config.source(source_type);
            let adapter = match self.adapters.get(&source_type) {
                Some(adapter) => Arc::clone(adapter),
                None => built_in_adapter(source_type, settings)?,
            };
            let registry = Arc::new(WatchRegistry::load(source_type, Arc::clone(&store)).await?);

            for class in [CadenceClass::Feed, CadenceClass::Detail, CadenceClass::Comment] {
                if adapter.supports(class) {
                    pollers.push(SourcePoller::new(
                        class,
                        Arc::clone(&adapter),
                        Arc::clone(&registry),
                        queue.clone(),
                        settings.poller_config(class),
                    ));
                }
            }
            info!(
                "{} enabled with {} watched entities",
                source_type,
                registry.len()
            );
            sources.insert(
                source_type,
                SourceHandle {
                    adapter,
                    registry,
                    subtypes: settings.subtypes(),
                },
            );
        }

        let dispatcher = Dispatcher::new(events, Arc::clone(&subscriptions), transport);
        let control = Arc::new(ControlPlane::new(sources, subscriptions, channels));
        Ok(HeraldRuntime {
            control,
            pollers,
            dispatcher,
        })
    }
}

fn built_in_adapter(source_type: SourceType, settings: &SourceConfig) -> Result<Arc<dyn SourceAdapter>> {
    let client = herald_reqwest_client(Some(&settings.ua))?;
    Ok(match source_type {
        SourceType::Weibo => Arc::new(
            WeiboAdapter::new(client, &settings.cookie)
                .with_details(settings.detail_enable)
                .with_comments(settings.comment_enable),
        ),
        SourceType::BiliDyn => Arc::new(
            BiliDynAdapter::new(client, &settings.cookie)
                .with_details(settings.detail_enable)
                .with_comments(settings.comment_enable),
        ),
        SourceType::BiliLive => Arc::new(BiliLiveAdapter::new(client)),
    })
}
