use anyhow::Result;
use seedalchemy_core::{Config, ModelRegistry, OutputStore};
use seedalchemy_engine::{SessionRegistry, Worker};
use seedalchemy_runtime_api::ModelLoader;
use seedalchemy_runtime_diffusion::CandleLoader;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct AppState {
    pub config: Config,
    pub store: OutputStore,
    pub registry: Arc<ModelRegistry>,
    /// The single generation slot; requests that find it taken are refused.
    pub worker: Arc<Mutex<Worker>>,
    pub sessions: SessionRegistry,
}

impl AppState {
    /// State backed by the candle loader.
    pub fn new(config: Config) -> Result<Self> {
        let loader = CandleLoader::from_config(&config)?;
        Self::with_loader(config, Arc::new(loader))
    }

    pub fn with_loader(config: Config, loader: Arc<dyn ModelLoader>) -> Result<Self> {
        let registry = Arc::new(ModelRegistry::from_config(&config.models)?);
        let store = OutputStore::new(&config.storage.storage_path);
        let worker = Worker::new(loader, Arc::clone(&registry), store.clone());

        Ok(Self {
            config,
            store,
            registry,
            worker: Arc::new(Mutex::new(worker)),
            sessions: SessionRegistry::new(),
        })
    }
}
