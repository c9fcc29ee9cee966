mod middleware;
mod proxy;

pub use middleware::{REQUEST_ID_HEADER, RequestContext, log_responses, set_request_context};
pub use proxy::{ProxyError, ProxyState, forward};

use std::{future::IntoFuture, net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, middleware as axum_middleware};
use tokio::{net::TcpListener, sync::Notify};
use tracing::{error, info, warn};

use crate::cache::{CacheState, Store, response_cache_layer};

use super::error::InfraError;

/// Router forwarding every request to the origin, behind the cache layer when one is given.
pub fn build_router<S: Store>(cache: Option<CacheState<S>>, proxy: ProxyState) -> Router {
    let routes = Router::new().fallback(forward).with_state(proxy);

    let routes = if let Some(cache_state) = cache {
        routes.layer(axum_middleware::from_fn_with_state(
            cache_state,
            response_cache_layer::<S>,
        ))
    } else {
        routes
    };

    routes
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

/// Serve `router` on `addr` until Ctrl-C, then drain connections for at most `graceful`.
pub async fn serve(addr: SocketAddr, router: Router, graceful: Duration) -> Result<(), InfraError> {
    let listener = TcpListener::bind(addr).await?;
    info!(target = "semcache::http", addr = %addr, "Listening");

    let shutdown = Arc::new(Notify::new());
    let signalled = Arc::clone(&shutdown);
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            shutdown_signal().await;
            info!(target = "semcache::http", "Shutdown requested; draining connections");
            signalled.notify_one();
        },
    );

    let deadline = async {
        shutdown.notified().await;
        tokio::time::sleep(graceful).await;
    };

    tokio::select! {
        result = server.into_future() => result?,
        () = deadline => {
            warn!(
                target = "semcache::http",
                timeout_secs = graceful.as_secs(),
                "Graceful shutdown timed out"
            );
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(target = "semcache::http", error = %err, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
