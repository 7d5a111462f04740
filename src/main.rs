use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use taskdeck::auth::TokenVerifier;
use taskdeck::config::{AppEnv, Config};
use taskdeck::http::AppState;
use taskdeck::sso::{HttpSsoClient, SsoClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().context("loading configuration")?;
    init_tracing(config.env);
    tracing::info!(env = config.env.as_str(), "starting taskdeck");

    let db = taskdeck::db::connect_from_config(&config.db)
        .await
        .context("connecting to database")?;
    tracing::info!("database ready, migrations applied");

    let sso: Arc<dyn SsoClient> =
        Arc::new(HttpSsoClient::new(&config.sso).context("building sso client")?);

    let verifier = if config.jwt.signing_key.is_empty() {
        TokenVerifier::jwks(sso.clone())
    } else {
        TokenVerifier::hs256(&config.jwt.signing_key)
    };

    let state = AppState::new(Arc::new(config), db, sso, Arc::new(verifier));
    taskdeck::http::serve(state).await.context("http server")?;
    Ok(())
}

fn init_tracing(env: AppEnv) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    match env {
        AppEnv::Local => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        AppEnv::Dev | AppEnv::Prod => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
    }
}
