// Access log line per request, tagged with a request id echoed back in X-Request-ID.

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);
static REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

pub async fn request_log_middleware(req: Request, next: Next) -> Response {
    let number = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let request_id = req
        .headers()
        .get(&REQUEST_ID)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{:08x}", number));
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID.clone(), value);
    }
    tracing::info!(
        "REQ#{} {} {} -> {} ({:.2}ms) rid={}",
        number,
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64() * 1000.0,
        request_id
    );
    response
}
