//! Authentication middleware
//! Mission: reject every non-health request lacking a valid token, before
//! any handler runs

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::auth::token::TokenAuthenticator;
use crate::error::AppError;

const HEALTH_PATH: &str = "/health";

pub async fn auth_middleware(
    State(authenticator): State<TokenAuthenticator>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    if req.uri().path() == HEALTH_PATH {
        return Ok(next.run(req).await);
    }

    let token = TokenAuthenticator::extract_from_headers(req.headers());

    match token {
        Some(token) if authenticator.validate(&token) => Ok(next.run(req).await),
        _ => Err(AppError::AuthFailure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request as HttpRequest, StatusCode},
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn test_router() -> Router {
        Router::new()
            .route(HEALTH_PATH, get(ok_handler))
            .route("/api/hosts", get(ok_handler))
            .layer(axum::middleware::from_fn_with_state(
                TokenAuthenticator::new("secret"),
                auth_middleware,
            ))
    }

    #[tokio::test]
    async fn health_is_exempt_from_auth() {
        let response = test_router()
            .oneshot(HttpRequest::builder().uri(HEALTH_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_is_rejected() {
        let response = test_router()
            .oneshot(HttpRequest::builder().uri("/api/hosts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_token_is_accepted() {
        let response = test_router()
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/hosts")
                    .header("x-sysmon-token", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
