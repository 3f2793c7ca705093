use std::time::Instant;

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument as _;

/// One log line per request. Liveness probes are demoted to `debug` so they
/// don't flood the log at the default level.
pub async fn log_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method();
    let uri_path = request.uri().path();

    let is_health_check = uri_path.ends_with("healthy") || uri_path.ends_with("ready");

    let span = if uri_path.len() > 512 {
        // Truncate long URI to keep log readable and prevent fast growing log file
        info_span!("request", %method, path = %&uri_path[..512])
    } else {
        info_span!("request", %method, path = %uri_path)
    };

    async move {
        let start_time = Instant::now();

        debug!("received request");

        let response = next.run(request).await;

        let status = response.status();

        if is_health_check {
            debug!(duration = ?start_time.elapsed(), %status);
        } else {
            info!(duration = ?start_time.elapsed(), %status);
        }

        response
    }
    .instrument(span)
    .await
}
