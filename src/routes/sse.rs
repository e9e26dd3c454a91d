use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, future};
use serde_json::json;
use tokio_stream::wrappers::IntervalStream;
use tracing::warn;
use uuid::Uuid;
use warp::Filter;
use warp::sse::Event;

use super::with_engine;
use crate::lifecycle::TaskEngine;

pub fn sse_route(engine: Arc<TaskEngine>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / Uuid / "events")
    .and(warp::get())
    .and(with_engine(engine))
    .map(handle_sse)
}

/// Polls the task every two seconds, emitting its status until it is terminal.
fn handle_sse(task_id: Uuid, engine: Arc<TaskEngine>) -> impl warp::Reply {
  let interval = IntervalStream::new(tokio::time::interval(Duration::from_secs(2)));
  let stream = interval
    .then(move |_| {
      let engine = engine.clone();
      async move {
        match engine.store().find_task(task_id).await {
          Ok(Some(task)) => {
            let event = Event::default()
              .event("status")
              .data(json!({"taskId": task.id, "status": task.status}).to_string());
            (Some(event), task.status.is_terminal())
          }
          Ok(None) => {
            let event = Event::default()
              .event("error")
              .data(json!({"error": format!("Task with ID {} not found", task_id)}).to_string());
            (Some(event), true)
          }
          Err(e) => {
            warn!("Error fetching status of task {}: {}", task_id, e);
            (None, false)
          }
        }
      }
    })
    .scan(false, |finished, (event, terminal)| {
      if *finished {
        return future::ready(None);
      }
      *finished = terminal;
      future::ready(Some(event))
    })
    .filter_map(future::ready)
    .map(Ok::<_, Infallible>);

  warp::sse::reply(warp::sse::keep_alive().stream(stream))
}
