//! JSON API over the controller.
//!
//! | Route                       | Response                                  |
//! |-----------------------------|-------------------------------------------|
//! | `GET /status`               | cached status of every port               |
//! | `GET /status/:port`         | freshly read status of one port           |
//! | `POST /port/:port/open`     | [`CommandOutcome`](crate::port::outcome::CommandOutcome) |
//! | `POST /port/:port/close`    | as above                                  |
//! | `POST /port/:port/stop`     | as above                                  |
//! | `GET /timing/:port`         | recorded travel times                     |
//! | `GET /calibration/:port`    | last measured relay delay and travel      |
//! | `GET /health`               | liveness and version                      |

use std::{future::Future, sync::Arc};

use axum::{
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use log::{error, info};
use serde_json::json;
use tokio::net::TcpListener;

use crate::{
  config::HttpConfig,
  controller::Controller,
  error::{GarageError, GarageResult},
};

pub mod handlers;

/// A [`GarageError`] turned into a `{"error": ...}` response
#[derive(Debug)]
pub struct ApiError(pub GarageError);

impl From<GarageError> for ApiError {
  fn from(err: GarageError) -> Self {
    ApiError(err)
  }
}

impl ApiError {
  pub fn status_code(&self) -> StatusCode {
    match self.0 {
      GarageError::UnknownPort(_) | GarageError::TimingNotRecorded(_) => StatusCode::NOT_FOUND,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status_code();
    if status.is_server_error() {
      error!("Request failed: {}", self.0);
    }
    (status, Json(json!({ "error": self.0.to_string() }))).into_response()
  }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn router(controller: Arc<Controller>) -> Router {
  Router::new()
    .route("/status", get(handlers::statuses))
    .route("/status/:port", get(handlers::status))
    .route("/port/:port/open", post(handlers::open))
    .route("/port/:port/close", post(handlers::close))
    .route("/port/:port/stop", post(handlers::stop))
    .route("/timing/:port", get(handlers::timing))
    .route("/calibration/:port", get(handlers::calibration))
    .route("/health", get(handlers::health))
    .with_state(controller)
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
  config: &HttpConfig,
  controller: Arc<Controller>,
  shutdown: impl Future<Output = ()> + Send + 'static,
) -> GarageResult<()> {
  let listener = TcpListener::bind(config.bind).await.map_err(GarageError::Http)?;
  info!("HTTP API listening on {}", config.bind);
  axum::serve(listener, router(controller))
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(GarageError::Http)
}
