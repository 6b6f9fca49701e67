use std::path::PathBuf;

use actix_multipart::Multipart;
use actix_web::{HttpResponse, ResponseError, web};
use log::{error, info, warn};
use shared::{HealthResponse, PredictionResponse};

use crate::error::PredictError;
use crate::model::{ModelHandle, Prediction};
use crate::preprocess::preprocess;
use crate::upload::{TempUpload, receive_image};

/// Directory the multipart handler writes uploads into.
#[derive(Debug, Clone)]
pub struct UploadDir(pub PathBuf);

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/predict").route(web::post().to(handle_predict)))
        .service(web::resource("/health").route(web::get().to(health)));
}

async fn handle_predict(
    model: web::Data<ModelHandle>,
    upload_dir: web::Data<UploadDir>,
    payload: Multipart,
) -> Result<HttpResponse, PredictError> {
    let upload = match receive_image(payload, &upload_dir.0).await {
        Ok(Some(upload)) => upload,
        Ok(None) => {
            warn!("Prediction request without an image field");
            return Err(PredictError::MissingImage);
        }
        Err(e) => {
            let err = PredictError::from(e);
            log_failure(&err);
            return Err(err);
        }
    };

    let model = model.get_ref().clone();
    let outcome = web::block(move || run_prediction(&model, upload))
        .await
        .map_err(PredictError::from)
        .and_then(|result| result);

    match outcome {
        Ok(response) => {
            info!("Predicted {} ({})", response.prediction, response.probability);
            Ok(HttpResponse::Ok().json(response))
        }
        Err(e) => {
            log_failure(&e);
            Err(e)
        }
    }
}

/// Read, preprocess, classify. The upload is consumed so its file is gone
/// once this returns, whether or not the prediction succeeded.
fn run_prediction(
    model: &ModelHandle,
    upload: TempUpload,
) -> Result<PredictionResponse, PredictError> {
    let bytes = upload.read()?;
    let classifier = model.get().ok_or(PredictError::ModelNotLoaded)?;
    let tensor = preprocess(&bytes, classifier.channels())?;
    let scores = classifier.predict(&tensor)?;
    let prediction = Prediction::from_scores(&scores)?;
    Ok(prediction.to_response())
}

fn log_failure(err: &PredictError) {
    if err.status_code().is_client_error() {
        warn!("Rejected prediction request: {}", err);
    } else {
        error!("Error al procesar la imagen: {}", err);
    }
}

async fn health(model: web::Data<ModelHandle>) -> HttpResponse {
    if model.is_loaded() {
        HttpResponse::Ok().json(HealthResponse {
            status: "ok".into(),
            model_loaded: true,
        })
    } else {
        HttpResponse::ServiceUnavailable().json(HealthResponse {
            status: "unavailable".into(),
            model_loaded: false,
        })
    }
}
