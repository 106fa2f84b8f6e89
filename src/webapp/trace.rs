//! Request tracing middleware
//!
//! Wraps each request in a span carrying a short correlation id.

use std::time::Instant;

use axum::{
    extract::Request,
    middleware::Next,
    response::Response,
};
use tracing::{info_span, Instrument};

/// Generate a short random hex ID
fn gen_id() -> String {
    format!("{:06x}", rand::random::<u32>() & 0xFFFFFF)
}

/// Root span per request, so execution logs never nest under an earlier request
pub async fn trace_request(request: Request, next: Next) -> Response {
    let id = gen_id();
    let span = info_span!(
        parent: None,
        "http",
        %id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    async move {
        let started = Instant::now();
        let response = next.run(request).await;
        tracing::debug!(
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );
        response
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_id_is_six_hex_chars() {
        for _ in 0..32 {
            let id = gen_id();
            assert_eq!(id.len(), 6);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }
}
