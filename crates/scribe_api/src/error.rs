use axum::http::{header::RETRY_AFTER, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use scribe_core::ScribeError;

/// HTTP-facing wrapper around the core taxonomy. Every failure response has
/// the same JSON shape: a stable kind, a short human message, and a retry
/// hint when throttled.
#[derive(Debug)]
pub struct ApiError(pub ScribeError);

#[derive(Serialize)]
struct ErrorBody {
	error_kind: &'static str,
	message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	retry_after: Option<u64>,
}

impl ApiError {
	fn status_code(&self) -> StatusCode {
		match &self.0 {
			ScribeError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
			ScribeError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
			ScribeError::UnsupportedMedia(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
			ScribeError::BadRequest(_) | ScribeError::UnknownOption(_) => StatusCode::BAD_REQUEST,
			ScribeError::NotFound => StatusCode::NOT_FOUND,
			ScribeError::Gone => StatusCode::GONE,
			ScribeError::NotCancellable { .. } | ScribeError::StateMismatch { .. } | ScribeError::Conflict(_) => StatusCode::CONFLICT,
			ScribeError::QueueUnavailable(_) | ScribeError::RegistryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = self.status_code();
		if status.is_server_error() {
			tracing::error!(kind = self.0.kind(), error = %self.0, "request failed");
		}

		let retry_after = self.0.retry_after();
		let body = ErrorBody {
			error_kind: self.0.kind(),
			message: self.0.public_message(),
			retry_after,
		};

		let mut response = (status, Json(body)).into_response();
		if let Some(secs) = retry_after {
			if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
				response.headers_mut().insert(RETRY_AFTER, value);
			}
		}
		response
	}
}

impl From<ScribeError> for ApiError {
	fn from(e: ScribeError) -> Self {
		Self(e)
	}
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
	fn from(e: axum::extract::multipart::MultipartError) -> Self {
		Self(ScribeError::BadRequest(format!("malformed multipart body: {e}")))
	}
}
