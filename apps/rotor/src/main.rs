use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

mod cli;
mod server;

use rotor_core::{
    DispatchOptions, Dispatcher, GeminiClient, GeminiClientConfig, TracingAttemptSink,
};
use rotor_pool::{CredentialPool, MemoryStore, StreamSettings};

use crate::cli::Cli;
use crate::server::AppState;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("rotor failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();

    let mut keys = cli.keys.clone();
    if let Some(path) = &cli.keys_file {
        let content = std::fs::read_to_string(path)?;
        keys.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    if keys.is_empty() {
        return Err("no upstream API keys configured (--keys or --keys-file)".into());
    }

    let store = Arc::new(MemoryStore::new());
    store.insert_keys(keys.iter().cloned());
    store.insert_access_keys(cli.access_keys.iter().cloned());
    store.set_stream_settings(StreamSettings {
        real_stream: cli.real_stream,
        fake_stream: cli.fake_stream,
    });

    let pool = Arc::new(CredentialPool::with_ttl(
        store.clone(),
        Duration::from_secs(cli.cache_ttl_secs),
    ));

    let mut client_config = GeminiClientConfig::default();
    if let Some(base_url) = &cli.base_url {
        client_config.base_url = base_url.trim_end_matches('/').to_string();
    }
    let upstream = Arc::new(GeminiClient::new(client_config)?);

    let dispatcher = Dispatcher::new(
        pool,
        upstream,
        store.clone(),
        Arc::new(TracingAttemptSink),
        DispatchOptions {
            disguise: cli.disguise,
            stream_deadline: Duration::from_secs(cli.stream_deadline_secs),
            ..DispatchOptions::default()
        },
    );

    info!(
        host = %cli.host,
        port = cli.port,
        keys = keys.len(),
        access_keys = cli.access_keys.len(),
        real_stream = cli.real_stream,
        fake_stream = cli.fake_stream,
        disguise = cli.disguise,
        "config loaded"
    );

    let state = Arc::new(AppState {
        dispatcher,
        access_keys: store,
        auth_enabled: !cli.access_keys.is_empty(),
    });
    let app = server::router(state);

    let addr = format!("{}:{}", cli.host, cli.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rotor=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
