use std::sync::Arc;

use anyhow::Context;

use visitrack_infra::broker::{Broker, RedisBroker};
use visitrack_infra::config::Settings;
use visitrack_infra::db::{Database, PgDatabase};
use visitrack_infra::handlers::{LogVerificationSender, VerificationSender, default_registry};
use visitrack_infra::outbox::OutboxRelay;
use visitrack_infra::tasks::TaskProcessor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("failed to load settings")?;
    visitrack_observability::init(&settings.logging);

    let db = PgDatabase::connect(&settings.database)
        .await
        .context("failed to connect to postgres")?;
    db.migrate().await.context("failed to apply schema")?;
    let db: Arc<dyn Database> = Arc::new(db);

    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::connect(&settings.redis, settings.retry.policy())
            .await
            .context("failed to connect to redis")?,
    );

    let sender: Arc<dyn VerificationSender> = Arc::new(LogVerificationSender);
    let registry = default_registry(db.clone(), sender.clone());
    for kind in registry.unregistered_kinds() {
        tracing::warn!(task_type = %kind, "no handler registered; tasks of this type will be dead-lettered");
    }

    let processor = TaskProcessor::new(
        broker.clone(),
        Arc::new(registry),
        settings.processor.processor_config(),
    )
    .start();

    let relay = settings
        .outbox
        .enabled
        .then(|| OutboxRelay::new(db.clone(), broker.clone(), settings.outbox.relay_config()).spawn());

    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    if let Some(relay) = relay {
        relay.shutdown().await;
    }
    let report = processor.shutdown().await;
    tracing::info!(
        aborted_workers = report.aborted_workers,
        requeued = report.requeued,
        "worker stopped"
    );

    if let Err(err) = sender.close().await {
        tracing::warn!(error = %err, "failed to close verification sender");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
