mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use common::{FaultyStore, Harness};
use imgq::error::Error;
use imgq::models::{Derivative, Resolution, TaskStatus};
use imgq::store::{MemoryStore, TaskStore};
use uuid::Uuid;

fn leftover(task_id: Uuid) -> Derivative {
  Derivative {
    id: Uuid::new_v4(),
    task_id,
    resolution: Resolution::W1024,
    width: 1024,
    height: 768,
    content_hash: "stale".into(),
    storage_path: "output/stale/1024/stale.png".into(),
    created_at: Utc::now(),
  }
}

#[tokio::test]
async fn failed_completion_update_leaves_no_derivatives_behind() {
  let faulty = Arc::new(FaultyStore::wrap(MemoryStore::new()));
  faulty.fail_completion.store(true, Ordering::SeqCst);
  let harness = Harness::new(faulty.clone());
  let source = harness.fixture("photo.png", 1600, 1200);

  let task = harness.engine.create_task(Harness::path_str(&source)).await.unwrap();
  let err = harness.engine.process_task(task.id).await.unwrap_err();

  assert!(matches!(err, Error::PersistenceFailure(_)));
  assert!(faulty.list_derivatives(task.id).await.unwrap().is_empty());
  let stored = faulty.find_task(task.id).await.unwrap().unwrap();
  assert_eq!(stored.status, TaskStatus::Failed);
  assert!(stored.derivative_ids.is_empty());
}

#[tokio::test]
async fn failure_midway_through_persisting_is_compensated() {
  let faulty = Arc::new(FaultyStore::wrap(MemoryStore::new()));
  faulty.fail_insert_after.store(1, Ordering::SeqCst);
  let harness = Harness::new(faulty.clone());
  let source = harness.fixture("photo.png", 1600, 1200);

  let task = harness.engine.create_task(Harness::path_str(&source)).await.unwrap();
  let err = harness.engine.process_task(task.id).await.unwrap_err();

  assert!(err.to_string().contains("injected derivative insert failure"));
  assert_eq!(faulty.inner.derivative_count().await, 0);
  assert_eq!(faulty.find_task(task.id).await.unwrap().unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn store_without_atomic_commit_completes_sequentially() {
  let faulty = Arc::new(FaultyStore::wrap(MemoryStore::new()));
  let harness = Harness::new(faulty.clone());
  let source = harness.fixture("photo.png", 2000, 1500);

  let task = harness.engine.create_task(Harness::path_str(&source)).await.unwrap();
  harness.engine.process_task(task.id).await.unwrap();

  assert_eq!(faulty.begin_calls.load(Ordering::SeqCst), 0);
  let view = harness.engine.get_task(task.id).await.unwrap().unwrap();
  assert_eq!(view.task.status, TaskStatus::Completed);
  let widths: Vec<u32> = view.derivatives.unwrap().iter().map(|d| d.width).collect();
  assert_eq!(widths, vec![1024, 800]);
}

#[tokio::test]
async fn runtime_rejection_falls_back_and_sticks() {
  let faulty = Arc::new(FaultyStore::wrap(MemoryStore::transactional()));
  faulty.reject_begin.store(true, Ordering::SeqCst);
  let harness = Harness::new(faulty.clone());
  let source = harness.fixture("photo.png", 1800, 1200);

  let first = harness.engine.create_task(Harness::path_str(&source)).await.unwrap();
  harness.engine.process_task(first.id).await.unwrap();
  assert_eq!(faulty.begin_calls.load(Ordering::SeqCst), 1);
  assert_eq!(harness.engine.coordinator().capability().cached(), Some(false));

  let second = harness.engine.create_task(Harness::path_str(&source)).await.unwrap();
  harness.engine.process_task(second.id).await.unwrap();
  assert_eq!(faulty.begin_calls.load(Ordering::SeqCst), 1);

  for task_id in [first.id, second.id] {
    let stored = faulty.find_task(task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.derivative_ids.len(), 2);
  }
}

#[tokio::test]
async fn probe_failure_is_treated_as_unsupported() {
  let faulty = Arc::new(FaultyStore::wrap(MemoryStore::transactional()));
  faulty.fail_probe.store(true, Ordering::SeqCst);
  let harness = Harness::new(faulty.clone());
  let source = harness.fixture("photo.png", 1200, 900);

  let task = harness.engine.create_task(Harness::path_str(&source)).await.unwrap();
  harness.engine.process_task(task.id).await.unwrap();

  assert_eq!(faulty.begin_calls.load(Ordering::SeqCst), 0);
  assert_eq!(harness.engine.coordinator().capability().cached(), Some(false));
}

#[tokio::test]
async fn atomic_failure_after_staging_rolls_back_every_derivative() {
  let faulty = Arc::new(FaultyStore::wrap(MemoryStore::transactional()));
  faulty.fail_completion.store(true, Ordering::SeqCst);
  let harness = Harness::new(faulty.clone());
  let source = harness.fixture("photo.png", 1600, 1200);

  let task = harness.engine.create_task(Harness::path_str(&source)).await.unwrap();
  let err = harness.engine.process_task(task.id).await.unwrap_err();

  assert!(matches!(err, Error::PersistenceFailure(_)));
  assert_eq!(faulty.begin_calls.load(Ordering::SeqCst), 1);
  assert_eq!(faulty.scope_persisted.load(Ordering::SeqCst), 2);
  assert_eq!(faulty.inner.derivative_count().await, 0);
  let stored = faulty.find_task(task.id).await.unwrap().unwrap();
  assert_eq!(stored.status, TaskStatus::Failed);
  assert!(stored.derivative_ids.is_empty());
  assert_eq!(harness.engine.coordinator().capability().cached(), Some(true));
}

#[tokio::test]
async fn commit_time_rejection_completes_sequentially_in_the_same_call() {
  let faulty = Arc::new(FaultyStore::wrap(MemoryStore::transactional()));
  faulty.reject_commit.store(true, Ordering::SeqCst);
  let harness = Harness::new(faulty.clone());
  let source = harness.fixture("photo.png", 1700, 1100);

  let first = harness.engine.create_task(Harness::path_str(&source)).await.unwrap();
  harness.engine.process_task(first.id).await.unwrap();

  assert_eq!(faulty.begin_calls.load(Ordering::SeqCst), 1);
  assert_eq!(faulty.scope_persisted.load(Ordering::SeqCst), 2);
  assert_eq!(harness.engine.coordinator().capability().cached(), Some(false));
  let stored = faulty.find_task(first.id).await.unwrap().unwrap();
  assert_eq!(stored.status, TaskStatus::Completed);
  let rows: Vec<Uuid> = faulty.list_derivatives(first.id).await.unwrap().iter().map(|d| d.id).collect();
  assert_eq!(rows, stored.derivative_ids);
  assert_eq!(rows.len(), 2);

  let second = harness.engine.create_task(Harness::path_str(&source)).await.unwrap();
  harness.engine.process_task(second.id).await.unwrap();
  assert_eq!(faulty.begin_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_runs_leave_exactly_one_set_of_derivatives() {
  for transactional in [false, true] {
    let store = Arc::new(if transactional {
      MemoryStore::transactional()
    } else {
      MemoryStore::new()
    });
    let harness = Harness::new(store.clone());
    let source = harness.fixture("contested.png", 1500, 1000);

    for _ in 0..5 {
      let task = harness.engine.create_task(Harness::path_str(&source)).await.unwrap();
      let first = harness.engine.dispatch(task.id);
      let second = harness.engine.dispatch(task.id);
      first.await.unwrap();
      second.await.unwrap();

      let stored = store.find_task(task.id).await.unwrap().unwrap();
      assert_eq!(stored.status, TaskStatus::Completed);
      assert_eq!(stored.derivative_ids.len(), 2);
      let mut rows: Vec<Uuid> = store.list_derivatives(task.id).await.unwrap().iter().map(|d| d.id).collect();
      let mut referenced = stored.derivative_ids.clone();
      rows.sort();
      referenced.sort();
      assert_eq!(rows, referenced, "transactional store: {}", transactional);
    }
  }
}

#[tokio::test]
async fn leftovers_from_an_interrupted_attempt_are_replaced() {
  for store in [MemoryStore::new(), MemoryStore::transactional()] {
    let store = Arc::new(store);
    let harness = Harness::new(store.clone());
    let source = harness.fixture("photo.png", 1400, 1000);

    let task = harness.engine.create_task(Harness::path_str(&source)).await.unwrap();
    let stale = leftover(task.id);
    store.insert_derivative(&stale).await.unwrap();

    harness.engine.process_task(task.id).await.unwrap();

    let derivatives = store.list_derivatives(task.id).await.unwrap();
    assert_eq!(derivatives.len(), 2);
    assert!(derivatives.iter().all(|d| d.id != stale.id));
  }
}
