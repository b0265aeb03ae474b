//! Beat facade: wires configuration into a running scheduler

use crate::config::{BeatConfig, SinkConfig};
use crate::credentials::CredentialStore;
use crate::cursor::{CursorStore, FileCursorStore};
use crate::dispatch::SinkDispatcher;
use crate::dlq::{FileQuarantine, QuarantineHandler};
use crate::error::Result;
use crate::logging::install_logging;
use crate::normalize::{EventNormalizer, FailurePolicy};
use crate::pipeline::{PipelineStatus, SourcePipeline};
use crate::scheduler::{PollScheduler, SchedulerEvent};
use crate::sink::{AuditSink, FileSink, TcpSink};
use crate::source::SapAuditClient;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// A configured collector for one or more SAP sources
pub struct AuditBeat {
    scheduler: PollScheduler,
    shutdown_grace: Duration,
}

impl AuditBeat {
    /// Build every component from a validated configuration
    ///
    /// Installs the configured tracing subscriber unless the embedding
    /// application already set one.
    pub fn from_config(config: &BeatConfig) -> Result<Self> {
        config.validate()?;
        if !install_logging(&config.logging)? {
            tracing::debug!("Global subscriber already set, keeping it");
        }

        let credentials = CredentialStore::new(
            config
                .sources
                .iter()
                .map(|s| (s.id.clone(), s.credentials.clone())),
        )?;

        let cursors: Arc<dyn CursorStore> = Arc::new(FileCursorStore::new(&config.cursor_path));

        let sinks: Vec<Arc<dyn AuditSink>> = config
            .sinks
            .iter()
            .map(|entry| -> Arc<dyn AuditSink> {
                match &entry.sink {
                    SinkConfig::File(file) => Arc::new(FileSink::new(entry.name(), file.clone())),
                    SinkConfig::Tcp(tcp) => Arc::new(TcpSink::new(entry.name(), tcp.clone())),
                }
            })
            .collect();
        let dispatcher = Arc::new(SinkDispatcher::new(sinks, config.retry.clone())?);

        let quarantine: Option<Arc<dyn QuarantineHandler>> = config
            .quarantine_path
            .as_ref()
            .map(|path| Arc::new(FileQuarantine::new(path)) as Arc<dyn QuarantineHandler>);

        let mut pipelines = Vec::with_capacity(config.sources.len());
        for source in &config.sources {
            let settings = source.sap_settings()?;
            let normalizer = EventNormalizer::new(settings.timezone, source.normalizer.clone());
            let client = SapAuditClient::new(
                source.id.clone(),
                credentials.get(&source.id)?,
                settings,
                config.retry.clone(),
            )?;

            let mut pipeline = SourcePipeline::new(
                source.id.clone(),
                Arc::new(client),
                normalizer,
                dispatcher.clone(),
                cursors.clone(),
            );
            if source.normalizer.on_failure == FailurePolicy::Quarantine {
                if let Some(quarantine) = &quarantine {
                    pipeline = pipeline.with_quarantine(quarantine.clone());
                }
            }

            tracing::info!(
                source_id = %source.id,
                timezone = %source.timezone,
                interval_ms = config.interval_for(source).as_millis() as u64,
                "Source configured"
            );
            pipelines.push((Arc::new(pipeline), config.interval_for(source)));
        }

        Ok(Self {
            scheduler: PollScheduler::new(pipelines)?,
            shutdown_grace: config.shutdown_grace,
        })
    }

    /// Wrap an already assembled scheduler
    pub fn new(scheduler: PollScheduler, shutdown_grace: Duration) -> Self {
        Self {
            scheduler,
            shutdown_grace,
        }
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await
    }

    pub fn trigger(&self, source_id: &str) -> Result<()> {
        self.scheduler.trigger(source_id)
    }

    pub async fn resume(&self, source_id: &str) -> Result<bool> {
        self.scheduler.resume(source_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.scheduler.subscribe()
    }

    pub async fn statuses(&self) -> Vec<PipelineStatus> {
        self.scheduler.statuses().await
    }

    /// Stop polling within the configured grace period
    pub async fn shutdown(&self) -> bool {
        self.scheduler.shutdown(self.shutdown_grace).await
    }

    /// Start, run until `signal` completes, then shut down
    pub async fn run_until<F>(&self, signal: F) -> Result<bool>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        tracing::info!("Shutdown requested");
        Ok(self.shutdown().await)
    }
}
