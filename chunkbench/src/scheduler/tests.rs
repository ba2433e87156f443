use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::FutureExt;

use super::{run_bounded, run_whole, ReadTask};
use crate::store::ReadError;

/// Tracks how many instrumented tasks are in flight and the most ever observed.
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }
    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
    fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

fn sleepy_tasks(n: usize, in_flight: &Arc<InFlight>) -> Vec<ReadTask<usize>> {
    (0..n)
        .map(|i| {
            let in_flight = Arc::clone(in_flight);
            async move {
                in_flight.enter();
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.exit();
                Ok::<_, ReadError>(i)
            }
            .boxed()
        })
        .collect()
}

#[tokio::test]
async fn limit_one_is_serial() {
    let in_flight = Arc::new(InFlight::default());
    let completed = run_bounded(sleepy_tasks(6, &in_flight), NonZeroUsize::new(1))
        .await
        .unwrap();
    assert_eq!(in_flight.max(), 1);
    let mut outputs = completed.outputs;
    outputs.sort();
    assert_eq!(outputs, (0..6).collect::<Vec<_>>());
    assert!(completed.elapsed >= Duration::from_millis(12));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn limit_is_never_exceeded() {
    let in_flight = Arc::new(InFlight::default());
    run_bounded(sleepy_tasks(20, &in_flight), NonZeroUsize::new(3))
        .await
        .unwrap();
    assert!(in_flight.max() <= 3, "{}", in_flight.max());
    assert!(in_flight.max() >= 1);
}

#[tokio::test]
async fn unbounded_admits_everything_at_once() {
    let in_flight = Arc::new(InFlight::default());
    // nobody gets past the barrier until all 8 are in flight
    let barrier = Arc::new(tokio::sync::Barrier::new(8));
    let tasks = (0..8).map(|_| {
        let in_flight = Arc::clone(&in_flight);
        let barrier = Arc::clone(&barrier);
        async move {
            in_flight.enter();
            barrier.wait().await;
            in_flight.exit();
            Ok::<_, ReadError>(())
        }
    });
    let completed = tokio::time::timeout(Duration::from_secs(10), run_bounded(tasks, None))
        .await
        .expect("unbounded scheduling must not deadlock on the barrier")
        .unwrap();
    assert_eq!(completed.outputs.len(), 8);
    assert_eq!(in_flight.max(), 8);
}

#[tokio::test]
async fn completion_admits_next_without_batching() {
    // With limit 2, a long task and a stream of short ones: batching would make the
    // short ones wait for the long one, admission-on-completion does not.
    let started_while_long_running = Arc::new(AtomicUsize::new(0));
    let long_done = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut tasks: Vec<ReadTask<()>> = Vec::new();
    {
        let long_done = Arc::clone(&long_done);
        tasks.push(
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                long_done.store(true, Ordering::SeqCst);
                Ok::<_, ReadError>(())
            }
            .boxed(),
        );
    }
    for _ in 0..5 {
        let long_done = Arc::clone(&long_done);
        let started = Arc::clone(&started_while_long_running);
        tasks.push(
            async move {
                if !long_done.load(Ordering::SeqCst) {
                    started.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok::<_, ReadError>(())
            }
            .boxed(),
        );
    }
    run_bounded(tasks, NonZeroUsize::new(2)).await.unwrap();
    assert_eq!(started_while_long_running.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn failure_waits_for_admitted_tasks() {
    let finished = Arc::new(AtomicUsize::new(0));
    let tasks = (0..5).map(|i| {
        let finished = Arc::clone(&finished);
        async move {
            if i == 0 {
                return Err(ReadError::Task("boom".to_owned()));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(i)
        }
    });
    let err = run_bounded(tasks, NonZeroUsize::new(2)).await.unwrap_err();
    assert!(matches!(err, ReadError::Task(ref msg) if msg == "boom"), "{err}");
    assert_eq!(finished.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn first_failure_wins() {
    let tasks = (0..3u64).map(|i| async move {
        tokio::time::sleep(Duration::from_millis(10 * (3 - i))).await;
        Err::<(), _>(ReadError::OutOfGrid(vec![i]))
    });
    let err = run_bounded(tasks, None).await.unwrap_err();
    assert!(matches!(err, ReadError::OutOfGrid(ref index) if index == &[2]), "{err}");
}

#[tokio::test]
async fn panicking_task_is_a_read_failure() {
    let tasks: Vec<ReadTask<()>> = vec![
        async { Ok::<_, ReadError>(()) }.boxed(),
        async {
            let explode = true;
            if explode {
                panic!("chunk decoder exploded");
            }
            Ok::<_, ReadError>(())
        }
        .boxed(),
    ];
    let err = run_bounded(tasks, NonZeroUsize::new(1)).await.unwrap_err();
    assert!(matches!(err, ReadError::Task(_)), "{err}");
}

#[tokio::test]
async fn no_tasks() {
    let completed = run_bounded(Vec::<ReadTask<()>>::new(), None).await.unwrap();
    assert!(completed.outputs.is_empty());
    assert_eq!(completed.elapsed, Duration::ZERO);
}

#[tokio::test]
async fn whole_read() {
    let (elapsed, bytes) = run_whole(async {
        tokio::time::sleep(Duration::from_millis(3)).await;
        Ok::<_, ReadError>(vec![0u8; 16])
    })
    .await
    .unwrap();
    assert_eq!(bytes.len(), 16);
    assert!(elapsed >= Duration::from_millis(3));

    let err = run_whole(async { Err::<(), _>(ReadError::Task("nope".to_owned())) })
        .await
        .unwrap_err();
    assert!(matches!(err, ReadError::Task(_)));
}
