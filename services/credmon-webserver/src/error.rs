//! HTTP error mapping
//!
//! Every failure from the session or auth crates leaves a handler as a JSON
//! body `{"error": "..."}` with a status chosen by error kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use credmon_session::Error as SessionError;

/// Request-level error returned by route handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("no session cookie; open /key/<key id> first")]
    NoSession,

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<credmon_auth::Error> for ApiError {
    fn from(e: credmon_auth::Error) -> Self {
        Self::Session(SessionError::Auth(e))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        use credmon_auth::Error as AuthError;
        match self {
            Self::NoSession => StatusCode::BAD_REQUEST,
            Self::Session(SessionError::SessionNotFound(_)) => StatusCode::BAD_REQUEST,
            Self::Session(SessionError::UnknownProvider(_)) => StatusCode::BAD_REQUEST,
            Self::Session(SessionError::Auth(e)) => match e {
                AuthError::InvalidKeyId(_) => StatusCode::BAD_REQUEST,
                AuthError::NotFound(_) => StatusCode::NOT_FOUND,
                AuthError::CsrfMismatch(_) => StatusCode::FORBIDDEN,
                AuthError::TokenExchange(_) => StatusCode::BAD_GATEWAY,
                AuthError::Parse(_)
                | AuthError::MissingField { .. }
                | AuthError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            serde_json::json!({ "error": self.to_string() }).to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credmon_auth::Error as AuthError;

    #[test]
    fn statuses_follow_error_kind() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (ApiError::NoSession, StatusCode::BAD_REQUEST),
            (
                SessionError::SessionNotFound("s".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                SessionError::UnknownProvider("p".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (AuthError::InvalidKeyId("zz".into()).into(), StatusCode::BAD_REQUEST),
            (AuthError::NotFound("k".into()).into(), StatusCode::NOT_FOUND),
            (AuthError::CsrfMismatch("p".into()).into(), StatusCode::FORBIDDEN),
            (AuthError::TokenExchange("x".into()).into(), StatusCode::BAD_GATEWAY),
            (
                AuthError::Persistence("disk".into()).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                AuthError::MissingField {
                    provider: "box".into(),
                    field: "TokenUrl",
                }
                .into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status(), expected, "wrong status for {err:?}");
        }
    }

    #[tokio::test]
    async fn response_body_carries_message() {
        let response = ApiError::from(AuthError::TokenExchange("provider said no".into()))
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("provider said no"));
    }
}
