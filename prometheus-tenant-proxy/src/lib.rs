#[macro_use]
extern crate tracing;

pub mod auth;
pub mod config;
pub mod enforce;
pub mod http;
pub mod listener;
pub mod log;
pub mod middleware;
pub mod proxy;
pub mod reload;
pub mod sigv4;
pub mod task;

use std::sync::Arc;

use axum::Router;
use axum::routing::any;

use crate::auth::Authenticator;
use crate::config::Conf;
use crate::proxy::Director;
use crate::sigv4::AwsSigner;

/// Shared per-process state handed to every handler and middleware.
#[derive(Clone)]
pub struct ProxyState {
    pub conf: Arc<Conf>,
    pub authenticator: Arc<Authenticator>,
    pub director: Arc<Director>,
    pub signer: Option<Arc<AwsSigner>>,
    pub client: reqwest::Client,
}

/// Assembles the HTTP surface: the configured unprotected endpoints as plain
/// passthroughs, and everything else behind authentication. Both go through
/// the Director, so no outbound request escapes URL canonicalisation and
/// credential scrubbing.
pub fn make_router(state: ProxyState) -> Router {
    let mut unprotected = Router::new();

    for path in &state.conf.unprotected_endpoints {
        unprotected = unprotected.route(path, any(proxy::proxy_handler));
    }

    let protected = Router::new().fallback(proxy::proxy_handler).layer(
        axum::middleware::from_fn_with_state(state.clone(), middleware::auth_middleware),
    );

    unprotected
        .merge(protected)
        .layer(axum::middleware::from_fn(middleware::log_middleware))
        .with_state(state)
}
