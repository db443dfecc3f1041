//! Core application
//!
//! Startup order: config → logging → Postgres (create-if-missing +
//! migrations, fatal on failure) → topics → topology → hidden items → alarm
//! engine (cache rebuild + pending-timer recovery) → optional Redis hot
//! cache (retried, non-fatal) → MQTT ingress → signal handlers. `--migrate`
//! stops after the storage step.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use crate::api::MantleApi;
use crate::data::cache::HotValueCache;
use crate::data::postgres::PostgresService;
use crate::data::postgres::repositories::{
    AlarmRepo, HiddenRepo, HistoryRepo, PropertyRepo, StatsRepo,
};
use crate::data::topics::TopicService;
use crate::domain::alarms::AlarmEngine;
use crate::domain::delete::DeleteCascade;
use crate::domain::events::{MetricUpdate, TOPIC_METRIC_UPDATE};
use crate::domain::hidden::HiddenItems;
use crate::domain::ingress::{IngressDeps, SparkplugIngress};
use crate::model::topology::TopologyService;
use crate::sparkplug::command::MetricCommander;

use super::cli::Cli;
use super::config::AppConfig;
use super::constants::{APP_NAME_LOWER, ENV_LOG};
use super::shutdown::ShutdownService;

pub struct CoreApp {
    pub config: AppConfig,
    pub database: Arc<PostgresService>,
    pub topology: Arc<TopologyService>,
    pub topics: Arc<TopicService>,
    pub cache: Option<Arc<HotValueCache>>,
    pub alarms: Arc<AlarmEngine>,
    pub api: Arc<MantleApi>,
    pub shutdown: ShutdownService,
}

impl CoreApp {
    /// Run the application. Initialisation failures bubble up and the
    /// process exits non-zero.
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        let cli = Cli::parse();
        let config = AppConfig::load(&cli)?;
        Self::init_logging(config.log_level.as_deref());

        if config.migrate {
            PostgresService::init(&config.database)
                .await
                .context("migration run failed")?;
            tracing::info!("Migrations applied");
            return Ok(());
        }

        let app = Self::init(config).await?;
        app.start().await
    }

    async fn init(config: AppConfig) -> Result<Self> {
        let database = Arc::new(
            PostgresService::init(&config.database)
                .await
                .context("storage initialisation failed")?,
        );
        let pool = database.pool().clone();

        let topics = Arc::new(TopicService::new());
        let metric_topic = topics
            .topic::<MetricUpdate>(TOPIC_METRIC_UPDATE)
            .map_err(|e| anyhow::anyhow!("topic setup failed: {e}"))?;

        let topology = Arc::new(TopologyService::new());
        let hidden = Arc::new(
            HiddenItems::load(HiddenRepo::new(pool.clone()))
                .await
                .context("hidden-item load failed")?,
        );

        let alarms = AlarmEngine::init(
            AlarmRepo::new(pool.clone()),
            &topics,
            config.webhook.clone(),
        )
        .await
        .context("alarm engine initialisation failed")?;

        // hot cache is optional; connection failure falls back to in-memory
        // pub/sub
        let cache = match &config.redis_url {
            Some(url) => match HotValueCache::connect(url).await {
                Ok(cache) => Some(Arc::new(cache)),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Hot cache unavailable, falling back to in-memory pub/sub"
                    );
                    None
                }
            },
            None => None,
        };

        let shutdown = ShutdownService::new(topics.clone(), database.clone(), alarms.clone());

        if let Some(cache) = &cache {
            // warm the topology from the cached last values so queries have
            // a tree before the first BIRTH
            match cache.rebuild_host().await {
                Ok(host) => topology.merge(host),
                Err(e) => tracing::warn!(error = %e, "Topology warm-up from cache failed"),
            }

            let feed_handles = cache
                .start_feed(&topics, shutdown.subscribe())
                .map_err(|e| anyhow::anyhow!("cache feed setup failed: {e}"))?;
            for handle in feed_handles {
                shutdown.register(handle).await;
            }
        }

        let history = HistoryRepo::new(pool.clone());
        let properties = PropertyRepo::new(pool.clone(), history.clone());

        let (mqtt_client, ingress_handle) = SparkplugIngress::start(
            &config.mqtt,
            IngressDeps {
                topology: topology.clone(),
                history: history.clone(),
                properties: properties.clone(),
                alarms: alarms.clone(),
                cache: cache.clone(),
                metric_topic,
                historian: config.historian,
            },
            shutdown.subscribe(),
        )
        .context("MQTT ingress failed to start")?;
        shutdown.register(ingress_handle).await;

        let commander = Arc::new(MetricCommander::new(mqtt_client));
        let cascade = DeleteCascade::new(
            topology.clone(),
            cache.clone(),
            history.clone(),
            hidden.clone(),
            properties.clone(),
        );

        let api = Arc::new(MantleApi::new(
            topology.clone(),
            hidden,
            history,
            StatsRepo::new(pool),
            alarms.clone(),
            cascade,
            commander,
            topics.clone(),
        ));

        Ok(Self {
            config,
            database,
            topology,
            topics,
            cache,
            alarms,
            api,
            shutdown,
        })
    }

    fn init_logging(log_level: Option<&str>) {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);
        let filter = log_level
            .map(str::to_string)
            .or_else(|| std::env::var(ENV_LOG).ok())
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_level(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start(self) -> Result<()> {
        self.shutdown.install_signal_handlers();

        tracing::info!(
            broker = %self.config.mqtt.host,
            historian = self.config.historian,
            hot_cache = self.cache.is_some(),
            "Mantle running"
        );

        self.shutdown.wait().await;
        self.shutdown.shutdown().await;
        Ok(())
    }
}
