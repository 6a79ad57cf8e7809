use std::sync::Arc;

use actix_web::web;
use anyhow::Context;
use shuttle_actix_web::ShuttleActixWeb;
use shuttle_runtime::SecretStore;
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use agentdesk::models::knowledge::VectorDeletion;
use agentdesk::storage::BlobStorage;
use agentdesk::store::{DocumentStore, MemoryStore, PgStore};
use agentdesk::{configure, AppConfig, AppState};

/// Queued vector deletes retried per run.
const RECONCILE_BATCH: usize = 100;

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn DocumentStore>> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .context("Failed to connect to Postgres")?;
            let store = PgStore::new(pool);
            store.migrate().await.context("Failed to run migrations")?;
            info!("Using Postgres document store");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set, documents are kept in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn schedule_reconciler(state: Arc<AppState>) -> anyhow::Result<()> {
    let scheduler = JobScheduler::new().await.context("Failed to create scheduler")?;
    let job = Job::new_async("0 * * * * *", move |_uuid, _lock| {
        let state = state.clone();
        Box::pin(async move {
            if let Err(e) =
                VectorDeletion::reconcile(state.store.as_ref(), &state.backend, RECONCILE_BATCH).await
            {
                error!("Vector deletion reconcile failed: {}", e);
            }
        })
    })
    .context("Failed to create reconcile job")?;
    scheduler.add(job).await.context("Failed to add reconcile job")?;
    scheduler.start().await.context("Failed to start scheduler")?;
    Ok(())
}

#[shuttle_runtime::main]
async fn main(
    #[shuttle_runtime::Secrets] secrets: SecretStore,
) -> ShuttleActixWeb<impl FnOnce(&mut web::ServiceConfig) + Send + Clone + 'static> {
    let config = AppConfig::new(&secrets)?;
    let store = open_store(&config).await?;
    let blobs = BlobStorage::from_config(&config).await;
    let stripe_client = config.stripe_secret_key.as_deref().map(stripe::Client::new);
    if stripe_client.is_none() {
        warn!("STRIPE_SECRET_KEY not set, billing is disabled");
    }

    let state = Arc::new(AppState::new(config, store, blobs, stripe_client));
    schedule_reconciler(state.clone()).await?;

    info!("agentdesk ready");
    Ok(configure(state).into())
}
