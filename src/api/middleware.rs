//! Bearer-token authentication middleware.
//!
//! Follows `commands::api::middleware::auth`'s shape (extract the
//! Authorization header, validate, reject with 401 + WWW-Authenticate on
//! failure), narrowed from API-key/multi-scheme auth to plain bearer-token
//! verification.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::collaborators::TokenVerifier;

#[derive(Debug, Serialize)]
struct AuthErrorBody {
    error: &'static str,
    message: &'static str,
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Bearer realm=\"traffic-core\""),
        )],
        Json(AuthErrorBody {
            error: "Unauthorized",
            message: "missing or invalid bearer token",
        }),
    )
        .into_response()
}

pub async fn bearer_auth(
    State(verifier): State<Arc<dyn TokenVerifier>>,
    req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match token {
        Some(token) if verifier.verify(token).await => next.run(req).await,
        _ => unauthorized(),
    }
}
