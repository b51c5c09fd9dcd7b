use axum::{
    Json,
    body::Body,
    http::{HeaderName, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Preserve or generate `X-Request-Id` and echo it on the response.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static(REQUEST_ID_HEADER);

    let req_id_value = match req.headers().get(&header_name) {
        Some(value) => value.clone(),
        None => match HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            Ok(value) => value,
            Err(_) => HeaderValue::from_static("unknown"),
        },
    };

    // Downstream spans read it from the extensions.
    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(header_name, req_id_value);
    res
}

// Accept FHIR JSON and plain JSON; POST/PUT bodies must be one of them.
pub async fn content_negotiation(req: Request<Body>, next: Next) -> Response {
    let accept_ok = req
        .headers()
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            let v = v.to_ascii_lowercase();
            v.contains("application/fhir+json")
                || v.contains("application/json")
                || v.contains("*/*")
        })
        .unwrap_or(true);

    if !accept_ok {
        return error_response(
            StatusCode::NOT_ACCEPTABLE,
            "Only JSON is supported (application/fhir+json or application/json) in Accept",
        );
    }

    let needs_body_type = req.method() == Method::POST || req.method() == Method::PUT;
    if needs_body_type {
        let content_ok = req
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase())
            .is_some_and(|s| {
                s.starts_with("application/fhir+json") || s.starts_with("application/json")
            });
        if !content_ok {
            return error_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Content-Type must be application/fhir+json or application/json",
            );
        }
    }

    next.run(req).await
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    let body: Value = json!({
        "resourceType": "OperationOutcome",
        "issue": [{
            "severity": "error",
            "code": "not-supported",
            "diagnostics": msg,
        }]
    });
    (status, Json(body)).into_response()
}
