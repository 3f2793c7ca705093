use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::ProxyState;

/// Authentication middleware guarding the protected routes.
///
/// The optional allow-list matches path *suffixes*: the proxy may be mounted
/// behind an arbitrary base path, so an exact or prefix match would be wrong.
/// An absent list means no restriction; a present-but-empty list denies every
/// path.
pub async fn auth_middleware(
    State(state): State<ProxyState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path();

    if let Some(allowed) = &state.conf.allowed_paths {
        if !allowed.iter().any(|suffix| path.ends_with(suffix)) {
            debug!(path, "path is not in the allow-list");
            return state.authenticator.deny();
        }
    }

    let tenancy = match state.authenticator.authorize(request.headers()) {
        Ok(tenancy) => tenancy,
        Err(error) => {
            debug!(%error, "authentication refused");
            return state.authenticator.deny();
        }
    };

    // A principal without any namespace or label constraint has access to
    // nothing at all.
    if tenancy.is_empty() {
        debug!("authenticated principal carries an empty tenancy");
        return state.authenticator.deny();
    }

    request.extensions_mut().insert(tenancy);

    next.run(request).await
}
