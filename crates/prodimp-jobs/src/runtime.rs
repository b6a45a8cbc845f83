use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use prodimp_storage::{
    PgCatalog, ProductStore, SubscriberRegistry, UploadStore, WebhookClient, WebhookClientConfig,
};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::dispatcher::spawn_dispatcher;
use crate::job_store::{purge_expired, JobStore, MemoryJobStore};
use crate::orchestrator::{ImportOrchestrator, ImportService};
use crate::ImportConfig;

/// Everything a process needs to accept and run imports.
pub struct ImportRuntime {
    pub config: ImportConfig,
    pub service: ImportService,
    pub jobs: Arc<dyn JobStore>,
    pub webhooks: Arc<WebhookClient>,
    pub uploads: UploadStore,
    dispatcher_task: JoinHandle<()>,
}

impl ImportRuntime {
    pub async fn from_env() -> Result<Self> {
        Self::connect(ImportConfig::from_env()).await
    }

    /// Connects to Postgres, ensures the schema and wires the workers.
    pub async fn connect(config: ImportConfig) -> Result<Self> {
        let catalog = PgCatalog::connect(&config.database_url, config.database_max_connections).await?;
        catalog.ensure_schema().await.context("ensuring schema")?;
        let catalog = Arc::new(catalog);
        Self::build(config, catalog.clone(), catalog)
    }

    pub fn build(
        config: ImportConfig,
        store: Arc<dyn ProductStore>,
        registry: Arc<dyn SubscriberRegistry>,
    ) -> Result<Self> {
        let webhooks = Arc::new(WebhookClient::new(WebhookClientConfig {
            timeout: config.webhook_timeout,
            user_agent: Some(config.user_agent.clone()),
            ..WebhookClientConfig::default()
        })?);
        let (dispatcher, dispatcher_task) = spawn_dispatcher(webhooks.clone(), None);
        let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let orchestrator = Arc::new(ImportOrchestrator::new(
            store,
            registry,
            jobs.clone(),
            dispatcher,
            config.limits(),
        ));
        let service = ImportService::new(orchestrator, config.worker_slots);
        let uploads = UploadStore::new(config.upload_dir.clone());
        info!(
            batch_size = config.batch_size,
            worker_slots = config.worker_slots,
            upload_dir = %config.upload_dir.display(),
            "import runtime ready"
        );
        Ok(Self {
            config,
            service,
            jobs,
            webhooks,
            uploads,
            dispatcher_task,
        })
    }

    /// Scheduler that periodically drops finished jobs past the retention window.
    pub async fn build_reaper(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.reaper_cron.clone();
        let retention = self.config.job_retention;
        let jobs = self.jobs.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let jobs = jobs.clone();
            Box::pin(async move {
                let purged = purge_expired(jobs.as_ref(), retention, Utc::now()).await;
                if purged > 0 {
                    info!(purged, "expired import jobs purged");
                }
            })
        })
        .with_context(|| format!("creating reaper job for cron {cron}"))?;
        sched.add(job).await.context("adding reaper job")?;
        Ok(sched)
    }

    /// Drops the submit side and gives queued webhook deliveries up to
    /// `grace` to finish.
    pub async fn shutdown(self, grace: Duration) {
        let Self {
            service,
            dispatcher_task,
            ..
        } = self;
        drop(service);
        match tokio::time::timeout(grace, dispatcher_task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "dispatcher task ended abnormally"),
            Err(_) => warn!("webhook deliveries still pending at shutdown"),
        }
    }
}
