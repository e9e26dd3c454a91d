use std::convert::Infallible;
use std::sync::Arc;

use serde::Serialize;
use tracing::error;
use warp::Filter;
use warp::http::StatusCode;

use crate::error::Error;
use crate::lifecycle::TaskEngine;

pub mod sse;
pub mod tasks;

#[derive(Debug)]
pub struct ApiError {
  pub status: StatusCode,
  pub message: String,
}

impl warp::reject::Reject for ApiError {}

impl From<Error> for ApiError {
  fn from(err: Error) -> Self {
    let status = match &err {
      Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
      Error::TaskNotFound(_) => StatusCode::NOT_FOUND,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Self {
      status,
      message: err.to_string(),
    }
  }
}

pub fn reject(err: Error) -> warp::Rejection {
  if !matches!(err, Error::InvalidInput(_) | Error::TaskNotFound(_)) {
    error!("Request failed: {}", err);
  }
  warp::reject::custom(ApiError::from(err))
}

#[derive(Serialize)]
struct ErrorBody {
  error: String,
}

pub async fn handle_rejection(rejection: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
  let (status, message) = if let Some(api_error) = rejection.find::<ApiError>() {
    (api_error.status, api_error.message.clone())
  } else if rejection.is_not_found() {
    (StatusCode::NOT_FOUND, "Not found".to_string())
  } else if let Some(body_error) = rejection.find::<warp::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, body_error.to_string())
  } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
  } else {
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
  };
  let reply = warp::reply::json(&ErrorBody { error: message });
  Ok(warp::reply::with_status(reply, status))
}

pub fn with_engine(engine: Arc<TaskEngine>) -> impl Filter<Extract = (Arc<TaskEngine>,), Error = Infallible> + Clone {
  warp::any().map(move || engine.clone())
}

pub fn routes(engine: Arc<TaskEngine>) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  tasks::health_route()
    .or(tasks::create_route(engine.clone()))
    .or(tasks::get_route(engine.clone()))
    .or(sse::sse_route(engine))
    .recover(handle_rejection)
}
