use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pollen_types::PollenError;
use serde_json::json;

/// An API failure rendered as `{"success": false, "message": ...}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<PollenError> for ApiError {
    fn from(error: PollenError) -> Self {
        match error {
            PollenError::NotConnected => Self::bad_request("Pollinator not connected"),
            PollenError::InvalidRequest(message) => Self::bad_request(message),
            PollenError::DeviceNotFound(_) => Self::new(StatusCode::NOT_FOUND, error.to_string()),
            PollenError::CommandTimeout { .. } => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, error.to_string())
            }
            PollenError::ClassifierUnavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, error.to_string())
            }
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "message": self.message })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_connected_is_a_client_error() {
        let err = ApiError::from(PollenError::NotConnected);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Pollinator not connected");
    }

    #[test]
    fn timeouts_and_link_errors_map_to_server_statuses() {
        let timeout = ApiError::from(PollenError::CommandTimeout {
            command: "HOME".into(),
            timeout_ms: 5000,
        });
        assert_eq!(timeout.status, StatusCode::GATEWAY_TIMEOUT);

        let link = ApiError::from(PollenError::Link("cable pulled".into()));
        assert_eq!(link.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(link.message.contains("cable pulled"));
    }
}
