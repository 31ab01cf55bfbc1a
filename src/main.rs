use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::Arc;
use taskpilot::config::Config;
use taskpilot::confirm::{ConfirmationStore, KvConfirmationStore};
use taskpilot::gateway::{Gateway, TelegramGateway};
use taskpilot::llm::{LanguageModel, OpenAiModel};
use taskpilot::scheduler::Scheduler;
use taskpilot::session::SessionContext;
use taskpilot::store::{EventStream, KvStore, RedisStore};
use taskpilot::tools::{HttpToolProvider, ToolProvider};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let Some(bot_token) = config.telegram.bot_token.clone() else {
        bail!("telegram bot token not configured (set TELEGRAM_BOT_TOKEN or telegram.bot_token)");
    };

    let store = Arc::new(RedisStore::connect(config.redis_url()).await?);
    tracing::info!(url = config.redis_url(), "connected to redis");

    let kv: Arc<dyn KvStore> = store.clone();
    let stream: Arc<dyn EventStream> = store;
    let gateway: Arc<dyn Gateway> = Arc::new(TelegramGateway::new(
        &bot_token,
        config.telegram.api_base.as_deref(),
    ));
    let llm: Arc<dyn LanguageModel> = Arc::new(OpenAiModel::new(
        &config.llm.base_url,
        config.llm.api_key.as_deref(),
        &config.llm.model,
        config.llm.temperature,
    ));
    let tools: Arc<dyn ToolProvider> = Arc::new(HttpToolProvider::new(&config.tools.url));
    let confirmations: Arc<dyn ConfirmationStore> =
        Arc::new(KvConfirmationStore::new(Arc::clone(&kv)));

    let ctx = SessionContext {
        kv,
        stream,
        gateway,
        llm,
        tools,
        confirmations,
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    Scheduler::new(ctx, &config.scheduler).run(shutdown).await
}
