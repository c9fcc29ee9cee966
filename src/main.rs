use std::process;

use semcache::{
    cache::{CacheConfig, CacheState},
    config,
    error::AppError,
    infra::{
        http::{self, ProxyState},
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info};
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

    match command {
        config::Command::Serve(_) => {
            telemetry::init(&settings.logging)?;
            run_serve(settings).await
        }
        config::Command::CheckConfig => {
            println!("{settings:#?}");
            Ok(())
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let proxy = ProxyState::new(&settings.upstream)?;

    let cache = settings
        .cache
        .enabled
        .then(|| CacheState::from_config(CacheConfig::from(&settings.cache)));

    info!(
        target = "semcache::serve",
        version = semcache::VERSION,
        origin = %proxy.origin(),
        cache_enabled = cache.is_some(),
        limit = settings.cache.limit.get(),
        maximum_size = settings.cache.maximum_size,
        "Starting caching proxy"
    );

    let router = http::build_router(cache.clone(), proxy);
    let result = http::serve(settings.server.addr, router, settings.server.graceful_shutdown).await;

    if let Some(cache) = cache {
        cache.close().await;
        info!(
            target = "semcache::serve",
            hits = cache.count(),
            entries = cache.store().delegate().len(),
            "Cache closed"
        );
    }

    result.map_err(AppError::from)
}
