use std::path::{Path, PathBuf};

use anyhow::Context;

use ai_assistant::config::AssistantSettings;
use ai_assistant::{data_dir, logging, Services};

const CONFIG_ENV: &str = "AI_ASSISTANT_CONFIG";

/// Settings path: first CLI argument, then `$AI_ASSISTANT_CONFIG`, then
/// `config.yaml` in the data directory if it exists.
fn settings_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .or_else(|| Some(data_dir().join("config.yaml")).filter(|p| p.exists()))
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<AssistantSettings> {
    match path {
        Some(path) => AssistantSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display())),
        None => Ok(AssistantSettings::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = settings_path();
    let settings = load_settings(path.as_deref())?;

    logging::init_tracing(settings.log_dir.as_deref().map(Path::new))
        .context("initialising logging")?;
    tracing::info!(
        settings = %path.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "<defaults>".into()),
        database = %settings.database_path,
        llm = %settings.llm.base_url,
        "settings loaded"
    );

    let services = Services::start(&settings)
        .await
        .context("starting services")?;
    services.spawn_background();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            tracing::info!("interrupt received");
        }
        _ = services.token().cancelled() => {}
    }

    services.shutdown().await;
    Ok(())
}
