//! Request authentication for the API surface.
//!
//! Every endpoint accepts an RS256 JWT, either in the `Authorization:
//! Bearer` header or in a `?jwt=` query parameter (EventSource connections
//! cannot set headers). In anonymous mode a shared app-secret header is
//! required on every request instead, to keep cross-origin pages from
//! driving the local server.

use crate::config::ApiConfig;
use crate::ids::UserReference;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub const APP_SECRET_HEADER: &str = "x-app-secret";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// The authenticated user.
    pub sub: String,
    /// Expiry as a unix timestamp.
    pub exp: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
}

/// Authenticated request identity, injected as a request extension.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_reference: UserReference,
}

#[derive(Clone)]
pub struct AuthState {
    decoding_key: Option<Arc<DecodingKey>>,
    allow_anonymous: bool,
    app_secret: Option<String>,
}

pub fn create_auth_state(config: &ApiConfig) -> crate::Result<AuthState> {
    let decoding_key = match &config.jwt_public_key_pem {
        Some(pem) => Some(Arc::new(
            DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| crate::AtelierError::Configuration(format!("bad JWT key: {e}")))?,
        )),
        None => None,
    };
    Ok(AuthState {
        decoding_key,
        allow_anonymous: config.allow_anonymous,
        app_secret: config.app_secret.clone(),
    })
}

fn bearer_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    // EventSource and websocket clients pass the token as a query
    // parameter instead.
    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "jwt")
        .map(|(_, value)| value.into_owned())
}

fn validate_token(state: &AuthState, token: &str) -> Result<Claims, StatusCode> {
    let Some(key) = &state.decoding_key else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let validation = Validation::new(Algorithm::RS256);
    jsonwebtoken::decode::<Claims>(token, key, &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            debug!("token validation failed: {}", e);
            StatusCode::UNAUTHORIZED
        })
}

/// Middleware enforcing the auth policy described in the module docs.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if state.allow_anonymous {
        // The app secret must be present on every request to prevent
        // cross-origin abuse, JWT or not.
        let provided = request
            .headers()
            .get(APP_SECRET_HEADER)
            .and_then(|value| value.to_str().ok());
        match (&state.app_secret, provided) {
            (Some(expected), Some(provided)) if expected == provided => {
                request.extensions_mut().insert(AuthenticatedUser {
                    user_reference: UserReference::anonymous(),
                });
                return Ok(next.run(request).await);
            }
            _ => return Err(StatusCode::UNAUTHORIZED),
        }
    }

    let token = bearer_token(&request).ok_or(StatusCode::UNAUTHORIZED)?;
    let claims = validate_token(&state, &token)?;
    request.extensions_mut().insert(AuthenticatedUser {
        user_reference: UserReference(claims.sub),
    });
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;

    fn anonymous_state(secret: &str) -> AuthState {
        AuthState {
            decoding_key: None,
            allow_anonymous: true,
            app_secret: Some(secret.to_string()),
        }
    }

    #[test]
    fn test_bearer_token_from_header() {
        let request = HttpRequest::builder()
            .uri("/tasks")
            .header("authorization", "Bearer abc.def.ghi")
            .body(Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&request).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_bearer_token_from_query_parameter() {
        let request = HttpRequest::builder()
            .uri("/tasks/stream?project_id=prj-1&jwt=abc.def.ghi")
            .body(Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&request).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_missing_token_yields_none() {
        let request = HttpRequest::builder()
            .uri("/tasks")
            .body(Body::empty())
            .unwrap();
        assert!(bearer_token(&request).is_none());
    }

    #[test]
    fn test_validate_token_without_key_is_unauthorized() {
        let state = anonymous_state("secret");
        assert_eq!(
            validate_token(&state, "whatever").unwrap_err(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_anonymous_mode_requires_matching_secret() {
        use axum::middleware::from_fn_with_state;
        use axum::routing::get;
        use axum::Router;
        use tower::ServiceExt;

        let state = anonymous_state("local-secret");
        let app = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(from_fn_with_state(state, auth_middleware));

        let ok = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/ping")
                    .header(APP_SECRET_HEADER, "local-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let wrong = app
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/ping")
                    .header(APP_SECRET_HEADER, "not-it")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let missing = app
            .oneshot(HttpRequest::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    }
}
