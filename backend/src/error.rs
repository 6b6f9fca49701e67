use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use shared::ErrorResponse;

use crate::model::InferenceError;
use crate::preprocess::PreprocessError;
use crate::upload::UploadError;

pub const PREDICTION_FAILED: &str = "Error al realizar la predicción.";
pub const MISSING_IMAGE: &str = "No se recibió ninguna imagen en el campo 'image'.";

/// Everything that can go wrong while answering `/predict`. Clients only
/// ever see one of two fixed messages; the detail goes to the log.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("request has no image field")]
    MissingImage,
    #[error("multipart error: {0}")]
    Multipart(String),
    #[error("upload io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("model is not loaded")]
    ModelNotLoaded,
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("blocking task failed: {0}")]
    Blocking(String),
}

impl From<UploadError> for PredictError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Multipart(e) => Self::Multipart(e.to_string()),
            UploadError::Io(e) => Self::Io(e),
            UploadError::Blocking(e) => Self::from(e),
        }
    }
}

impl From<actix_web::error::BlockingError> for PredictError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        Self::Blocking(err.to_string())
    }
}

impl ResponseError for PredictError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingImage | Self::Multipart(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self.status_code() {
            StatusCode::BAD_REQUEST => MISSING_IMAGE,
            _ => PREDICTION_FAILED,
        };
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    async fn body_of(err: PredictError) -> (StatusCode, serde_json::Value) {
        let response = err.error_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[actix_web::test]
    async fn internal_failures_share_generic_body() {
        for err in [
            PredictError::ModelNotLoaded,
            PredictError::Inference(InferenceError::EmptyOutput),
            PredictError::Io(std::io::Error::other("disk gone")),
        ] {
            let (status, body) = body_of(err).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body, serde_json::json!({"error": PREDICTION_FAILED}));
        }
    }

    #[actix_web::test]
    async fn missing_image_is_client_error() {
        let (status, body) = body_of(PredictError::MissingImage).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], MISSING_IMAGE);

        let (status, _) = body_of(PredictError::Multipart("no boundary".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
