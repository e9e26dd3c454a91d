use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use warp::Filter;
use warp::http::StatusCode;

use super::{reject, with_engine};
use crate::error::Error;
use crate::lifecycle::TaskEngine;
use crate::models::{Price, Resolution, TaskStatus, TaskView};

#[derive(Deserialize)]
pub struct NewTask {
  #[serde(rename = "imagePath")]
  pub image_path: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
  pub task_id: Uuid,
  pub status: TaskStatus,
  pub price: Price,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub images: Option<Vec<ImageResponse>>,
}

#[derive(Serialize)]
pub struct ImageResponse {
  pub resolution: Resolution,
  pub path: String,
}

impl From<TaskView> for TaskResponse {
  fn from(view: TaskView) -> Self {
    let images = view.derivatives.map(|derivatives| {
      derivatives
        .into_iter()
        .map(|d| ImageResponse {
          resolution: d.resolution,
          path: d.storage_path,
        })
        .collect()
    });
    Self {
      task_id: view.task.id,
      status: view.task.status,
      price: view.task.price,
      images,
    }
  }
}

#[derive(Serialize)]
struct HealthResponse {
  status: &'static str,
  timestamp: String,
}

pub fn health_route() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("health")
    .and(warp::path::end())
    .and(warp::get())
    .map(|| {
      warp::reply::json(&HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
      })
    })
}

pub fn create_route(engine: Arc<TaskEngine>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path("tasks")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::content_length_limit(16 * 1024))
    .and(warp::body::json())
    .and(with_engine(engine))
    .and_then(handle_create_task)
}

pub fn get_route(engine: Arc<TaskEngine>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / Uuid)
    .and(warp::get())
    .and(with_engine(engine))
    .and_then(handle_get_task)
}

async fn handle_create_task(new_task: NewTask, engine: Arc<TaskEngine>) -> Result<impl warp::Reply, warp::Rejection> {
  let task = engine.create_task(&new_task.image_path).await.map_err(reject)?;
  engine.dispatch(task.id);

  info!("Task {} submitted successfully", task.id);
  let response = TaskResponse {
    task_id: task.id,
    status: task.status,
    price: task.price,
    images: None,
  };
  Ok(warp::reply::with_status(warp::reply::json(&response), StatusCode::CREATED))
}

async fn handle_get_task(task_id: Uuid, engine: Arc<TaskEngine>) -> Result<impl warp::Reply, warp::Rejection> {
  let view = engine
    .get_task(task_id)
    .await
    .map_err(reject)?
    .ok_or_else(|| reject(Error::TaskNotFound(task_id)))?;
  Ok(warp::reply::json(&TaskResponse::from(view)))
}
