use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Problem-details style error body.
pub fn problem_response(status: StatusCode, title: &str, detail: Option<&str>) -> Response {
    let mut body = json!({"type": "about:blank", "title": title, "status": status.as_u16()});
    if let Some(d) = detail {
        body["detail"] = json!(d);
    }
    (status, Json(body)).into_response()
}

pub fn bad_request(detail: &str) -> Response {
    problem_response(StatusCode::BAD_REQUEST, "Bad Request", Some(detail))
}

pub fn not_found(detail: &str) -> Response {
    problem_response(StatusCode::NOT_FOUND, "Not Found", Some(detail))
}

pub fn internal_error(err: &anyhow::Error) -> Response {
    tracing::error!(error = %err, "request failed");
    problem_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal Server Error",
        Some(&err.to_string()),
    )
}
