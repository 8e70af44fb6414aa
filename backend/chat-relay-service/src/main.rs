use chat_relay_service::{
    audio::FsAudioStore,
    classifier::HeuristicClassifier,
    config, db, error,
    fanout::{pubsub::start_psub_listener, ChannelRegistry},
    logging,
    notify::ExpoNotifier,
    redis_client::RedisClient,
    server,
    state::{AppState, Backends},
    store::PgStore,
};
use redis_utils::RedisPool;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = config::Config::from_env()?;

    let db = db::init_pool(&cfg.database_url)
        .await
        .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;
    let store = Arc::new(PgStore::new(db));

    let redis_pool = RedisPool::connect(&cfg.redis_url)
        .await
        .map_err(|e| error::AppError::StartServer(format!("redis: {e}")))?;
    let redis = RedisClient::new(redis_pool.manager());
    let registry = ChannelRegistry::new();

    // Cross-process fan-out into local connections
    let psub_client = redis_pool.client().clone();
    let psub_registry = registry.clone();
    let _psub_listener: JoinHandle<()> =
        tokio::spawn(start_psub_listener(psub_client, psub_registry));

    let text = HeuristicClassifier::new()
        .map_err(|e| error::AppError::Config(format!("text classifier: {e}")))?;
    let notifier = Arc::new(ExpoNotifier::new(cfg.push_endpoint.clone()));
    let audio = Arc::new(FsAudioStore::new(cfg.audio_dir.clone()));

    let listener = server::bind(cfg.port).await?;
    let state = AppState::new(
        cfg,
        Backends {
            directory: store.clone(),
            messages: store,
            broker: Arc::new(redis),
            registry,
            text: Arc::new(text),
            notifier: notifier.clone(),
            audio,
        },
    );
    state.writes.start();

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };
    server::serve(listener, state.clone(), shutdown).await?;

    tracing::info!("flushing pending writes");
    state.writes.shutdown().await;
    notifier.shutdown().await;
    Ok(())
}
