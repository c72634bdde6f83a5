// ============================================================================
// Request ID Middleware - Request Correlation
// ============================================================================
//
// Every request gets an `X-Request-Id`: the client's, if it sent a valid
// UUID, otherwise a fresh v4. The id rides in request extensions for
// handlers and is stamped on the response so a caller can quote it back.
//
// ============================================================================

use axum::{extract::Request, http::header, middleware::Next, response::Response};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    request.extensions_mut().insert(request_id);

    tracing::debug!(
        request_id = %request_id,
        method = %request.method(),
        uri = %request.uri(),
        "→ incoming request"
    );

    let mut response = next.run(request).await;

    if let Ok(value) = request_id.to_string().parse() {
        response
            .headers_mut()
            .insert(header::HeaderName::from_static(REQUEST_ID_HEADER), value);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest, routing::get, Router};
    use tower::ServiceExt;

    async fn test_handler() -> &'static str {
        "OK"
    }

    fn app() -> Router {
        Router::new()
            .route("/", get(test_handler))
            .layer(axum::middleware::from_fn(request_id_middleware))
    }

    #[tokio::test]
    async fn test_request_id_generated() {
        let response = app()
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let request_id = response.headers().get(REQUEST_ID_HEADER).unwrap();
        assert!(Uuid::parse_str(request_id.to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_request_id_preserved() {
        let client_id = Uuid::new_v4();
        let response = app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, client_id.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let echoed = response.headers().get(REQUEST_ID_HEADER).unwrap();
        assert_eq!(echoed.to_str().unwrap(), client_id.to_string());
    }

    #[tokio::test]
    async fn test_invalid_request_id_replaced() {
        let response = app()
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header(REQUEST_ID_HEADER, "not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let request_id = response.headers().get(REQUEST_ID_HEADER).unwrap();
        assert!(Uuid::parse_str(request_id.to_str().unwrap()).is_ok());
    }
}
