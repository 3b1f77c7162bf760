use crate::aggregation::RewardAggregator;
use crate::config::Config as FullConfig;
use crate::database::PgStore;
use crate::store::RewardStore;
use crate::updater::Clients;
use axum::{
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use log::info;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub use config::Config;
pub use error::Error;
pub use handler::MissingData;

mod config;
mod error;
mod handler;

/// Everything the request handlers read from.
pub struct Context {
    pub store: Arc<dyn RewardStore>,
    pub aggregator: RewardAggregator,
}

pub async fn serve(config: FullConfig, shutdown: oneshot::Receiver<()>) -> Result<(), Error> {
    let clients = Clients::from_config(&config.updater)?;
    let store: Arc<dyn RewardStore> = Arc::new(PgStore::connect(&config.database)?);
    let ctx = Context {
        aggregator: RewardAggregator::new(store.clone(), clients.beacon, clients.execution),
        store,
    };

    let listen_addr = SocketAddr::from((config.server.listen_addr, config.server.listen_port));
    let (_socket_addr, server) = start_server(Arc::new(ctx), listen_addr, async {
        let _ = shutdown.await;
    })
    .await?;

    server.await
}

pub fn router(ctx: Arc<Context>) -> Router {
    Router::new()
        .route("/v1/block_rewards/:slot", get(handler::get_block_reward))
        .route("/v1/missing_data", get(handler::get_missing_data))
        .route("/v2/rewards", post(handler::post_rewards))
        .route("/metrics", get(handler::get_metrics))
        .layer(axum::middleware::map_response(
            |mut response: axum::response::Response| async move {
                response
                    .headers_mut()
                    .insert(header::SERVER, HeaderValue::from_static("rewards-watch"));
                response
            },
        ))
        .with_state(ctx)
}

/// Binds a server for `ctx` to `listen_addr`.
///
/// ## Returns
///
/// - `SocketAddr`: the address the server listens on, which differs from `listen_addr` if its
///   port is 0.
/// - `Future`: the server itself, which must be awaited and resolves once `shutdown` does.
pub async fn start_server(
    ctx: Arc<Context>,
    listen_addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = Result<(), Error>>), Error> {
    let listener = TcpListener::bind(listen_addr).await?;
    let socket_addr = listener.local_addr()?;
    let server = axum::serve(listener, router(ctx).into_make_service())
        .with_graceful_shutdown(shutdown)
        .into_future();

    info!("HTTP server listening on {}", socket_addr);

    Ok((socket_addr, async move { server.await.map_err(Error::from) }))
}
