pub mod health;
pub mod jobs;
pub mod submit;

use axum::http::HeaderMap;
use std::net::SocketAddr;

/// Caller identity for admission control: the transport layer may inject one
/// via the `x-caller-id` header (the auth hook); otherwise the source
/// address is the caller.
pub(crate) fn caller_identity(headers: &HeaderMap, addr: SocketAddr) -> String {
	headers
		.get("x-caller-id")
		.and_then(|v| v.to_str().ok())
		.filter(|v| !v.is_empty())
		.map(str::to_string)
		.unwrap_or_else(|| addr.ip().to_string())
}
