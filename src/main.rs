//! # Motor de Execução de Tasks de API
//!
//! Ponto de entrada do serviço: um processo `axum` de longa duração que
//! recebe submissões de execução via HTTP (§6), ao invés do binário CLI
//! `runner execute --file ...` de antes — o motor original (`server/start.py`)
//! também sobe um processo HTTP único que delega cada task recebida a um
//! worker, e é esse desenho que este arquivo assume.
//!
//! ## Fluxo de startup
//!
//! 1. Inicializa telemetria (`tracing` + OTEL opcional).
//! 2. Carrega [`limits::EngineConfig`] das variáveis de ambiente (§6).
//! 3. Monta o cliente HTTP compartilhado ([`lifecycle::build_http_client`]).
//! 4. Instala os listeners de `SIGUSR1`/`SIGUSR2` e o watchdog interno de
//!    memória (`signals`), alimentando o mesmo canal `watch` que toda
//!    execução em andamento observa.
//! 5. Monta o router `axum` (`api::router`) e sobe o listener TCP.

mod api;
mod errors;
mod error_strategy;
mod executors;
mod extractors;
mod lifecycle;
mod limits;
mod loader;
mod loop_expansion;
mod protocol;
mod scheduler;
mod signals;
mod step_executor;
mod telemetry;
mod template;
mod tree;
mod validation;
mod variables;

use std::net::SocketAddr;

use telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let telemetry_config = TelemetryConfig::from_env();
    if let Err(e) = init_telemetry(telemetry_config) {
        eprintln!("aviso: falha ao inicializar telemetria OTEL: {e}");
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    let config = std::sync::Arc::new(limits::EngineConfig::from_env());
    let http_client = lifecycle::build_http_client(&config);

    let (broadcaster, resource_watch) = signals::SignalBroadcaster::new();
    if let Err(e) = signals::install_unix_signal_listeners(broadcaster.clone()) {
        tracing::warn!(error = %e, "falha ao instalar listeners de SIGUSR1/SIGUSR2; supervisão externa via sinal indisponível");
    }
    signals::spawn_memory_watchdog(config.clone(), broadcaster);

    let state = api::ApiState::new(config, http_client, resource_watch);
    let app = api::router(state);

    let host = std::env::var("BIND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("BIND_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8000);
    let addr: SocketAddr = format!("{host}:{port}").parse()?;

    tracing::info!(%addr, "motor de execução escutando");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let serve_result = axum::serve(listener, app).await;

    shutdown_telemetry();
    serve_result.map_err(Into::into)
}
