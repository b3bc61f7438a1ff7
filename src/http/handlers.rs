use std::{collections::BTreeMap, sync::Arc};

use axum::{
  extract::{Path, State},
  http::StatusCode,
  Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use super::ApiResult;
use crate::{
  controller::Controller,
  port::{identifier::PortId, outcome::CommandOutcome, state::Status},
  timing::{PortCalibration, PortTiming},
};

#[derive(Serialize, Debug)]
pub struct PortStatus {
  pub port: PortId,
  pub status: Status,
}

type Outcome = (StatusCode, Json<CommandOutcome>);

fn respond(outcome: CommandOutcome) -> Outcome {
  let status = if outcome.is_failure() {
    StatusCode::INTERNAL_SERVER_ERROR
  }
  else {
    StatusCode::OK
  };
  (status, Json(outcome))
}

pub async fn statuses(State(controller): State<Arc<Controller>>) -> Json<BTreeMap<PortId, Status>> {
  Json(controller.statuses().await)
}

pub async fn status(State(controller): State<Arc<Controller>>, Path(port): Path<String>) -> ApiResult<Json<PortStatus>> {
  let status = controller.read_status(&port).await?;
  Ok(Json(PortStatus {
    port: port.into(),
    status,
  }))
}

pub async fn open(State(controller): State<Arc<Controller>>, Path(port): Path<String>) -> ApiResult<Outcome> {
  Ok(respond(controller.open(&port).await?))
}

pub async fn close(State(controller): State<Arc<Controller>>, Path(port): Path<String>) -> ApiResult<Outcome> {
  Ok(respond(controller.close(&port).await?))
}

pub async fn stop(State(controller): State<Arc<Controller>>, Path(port): Path<String>) -> ApiResult<Outcome> {
  Ok(respond(controller.stop(&port).await?))
}

pub async fn timing(State(controller): State<Arc<Controller>>, Path(port): Path<String>) -> ApiResult<Json<PortTiming>> {
  Ok(Json(controller.timing(&port)?))
}

pub async fn calibration(
  State(controller): State<Arc<Controller>>,
  Path(port): Path<String>,
) -> ApiResult<Json<PortCalibration>> {
  Ok(Json(controller.calibration(&port)?))
}

pub async fn health() -> Json<Value> {
  Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
