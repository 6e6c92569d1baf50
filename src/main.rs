use std::{future::IntoFuture, process, sync::Arc};

use subsocket::{
    application::{error::AppError, registry::Registry},
    cache::CacheConfig,
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
        transport::Hub,
    },
    rooms,
};
use tokio::sync::Notify;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let hub = Hub::new(settings.relay.channel_capacity.get());
    let registry = Arc::new(Registry::new(
        Arc::new(hub.clone()),
        CacheConfig::from(&settings.cache),
    ));
    rooms::register(&registry, &settings.rooms)?;
    registry.init();

    let result = serve_http(&settings, HttpState {
        registry: Arc::clone(&registry),
        hub,
    })
    .await;

    registry.shutdown().await;
    result
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "Listening");

    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    let mut server = tokio::spawn(
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move { signal.notified().await })
            .into_future(),
    );

    tokio::select! {
        joined = &mut server => {
            return joined
                .map_err(|err| AppError::unexpected(format!("server task failed: {err}")))?
                .map_err(|err| AppError::unexpected(format!("server error: {err}")));
        }
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|err| AppError::from(InfraError::from(err)))?;
            info!("Shutdown requested");
        }
    }

    shutdown.notify_one();
    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => joined
            .map_err(|err| AppError::unexpected(format!("server task failed: {err}")))?
            .map_err(|err| AppError::unexpected(format!("server error: {err}"))),
        Err(_) => {
            warn!(
                timeout_secs = settings.server.graceful_shutdown.as_secs(),
                "Graceful shutdown timed out; aborting open connections"
            );
            server.abort();
            Ok(())
        }
    }
}
