use crate::executors::AdapterRunner;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use trellis_core::engine::{Engine, EngineConfig};
use trellis_core::events::EventBus;
use trellis_core::registry::StepRegistry;
use trellis_core::scheduler::Scheduler;
use trellis_core::storage::{JsonlEventLog, RunStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_store_file")]
    pub store_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_fan_out")]
    pub fan_out: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_store_file() -> String {
    "trellis.redb".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_fan_out() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    300
}

fn default_cancel_grace_secs() -> u64 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            event_log_dir: default_event_log_dir(),
            store_file: default_store_file(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            fan_out: default_fan_out(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &PathBuf, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("failed to read configuration file")?;
            toml::from_str(&content).context("failed to parse configuration file")?
        } else {
            tracing::info!("configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                engine: Default::default(),
            }
        };

        config.data_dir = data_dir;
        Ok(config)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.store_file)
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            workers: self.engine.workers,
            fan_out: self.engine.fan_out,
            max_retries: self.engine.max_retries,
            retry_delay: Duration::from_secs(self.engine.retry_delay_secs),
            cancel_grace: Duration::from_secs(self.engine.cancel_grace_secs),
            ..EngineConfig::default()
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RunStore>,
    pub event_log: Arc<JsonlEventLog>,
    pub registry: Arc<StepRegistry>,
    pub engine: Arc<Engine>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let store =
            Arc::new(RunStore::new(config.store_path()).context("failed to open run store")?);
        let event_log = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("failed to open event log")?,
        );
        let registry = Arc::new(StepRegistry::with_builtin());
        let events = EventBus::new(event_log.clone());

        let engine = Engine::new(
            config.engine_config(),
            registry.clone(),
            Arc::new(AdapterRunner::new()),
            store.clone(),
            events,
        );
        let scheduler = Scheduler::new(store.clone(), engine.clone());

        Ok(Self {
            store,
            event_log,
            registry,
            engine,
            scheduler,
        })
    }

    /// Start the engine workers and the scheduler fire loop, then
    /// re-enqueue any runs interrupted by the previous shutdown.
    pub fn start(&self) {
        self.engine.start();
        self.scheduler.spawn();
        if let Err(e) = self.engine.recover() {
            tracing::error!("run recovery failed: {e:#}");
        }
    }
}
