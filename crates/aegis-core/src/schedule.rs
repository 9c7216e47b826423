//! Wake-time task queue
//!
//! A single runner task owns a min-heap keyed by wake time and executes due
//! tasks serially. Verifiers enqueue one task per observation window
//! instead of parking a coroutine per fix; pending work survives restarts
//! because the owning component persists its records and re-enqueues them
//! at startup.

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

struct Entry<T> {
    wake_at: DateTime<Utc>,
    seq: u64,
    task: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.wake_at, self.seq).cmp(&(other.wake_at, other.seq))
    }
}

/// Handle for enqueueing timed tasks onto a spawned runner.
pub struct WakeQueue<T: Send + 'static> {
    tx: mpsc::UnboundedSender<(DateTime<Utc>, T)>,
}

impl<T: Send + 'static> WakeQueue<T> {
    /// Spawn the runner. `handler` is invoked for each task once its wake
    /// time has passed; tasks sharing a wake time run in enqueue order.
    pub fn spawn<F, Fut>(handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<(DateTime<Utc>, T)>();

        tokio::spawn(async move {
            let mut heap: BinaryHeap<Reverse<Entry<T>>> = BinaryHeap::new();
            let mut seq = 0u64;

            loop {
                // Run everything already due.
                while heap
                    .peek()
                    .map(|Reverse(e)| e.wake_at <= Utc::now())
                    .unwrap_or(false)
                {
                    if let Some(Reverse(entry)) = heap.pop() {
                        handler(entry.task).await;
                    }
                }

                let next_wake = heap.peek().map(|Reverse(e)| e.wake_at);
                match next_wake {
                    Some(wake_at) => {
                        let delay = (wake_at - Utc::now())
                            .to_std()
                            .unwrap_or(StdDuration::ZERO);
                        tokio::select! {
                            received = rx.recv() => match received {
                                Some((at, task)) => {
                                    seq += 1;
                                    heap.push(Reverse(Entry { wake_at: at, seq, task }));
                                }
                                None => break,
                            },
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => match rx.recv().await {
                        Some((at, task)) => {
                            seq += 1;
                            heap.push(Reverse(Entry { wake_at: at, seq, task }));
                        }
                        None => break,
                    },
                }
            }
            debug!("wake queue runner stopped");
        });

        WakeQueue { tx }
    }

    /// Enqueue a task. Returns false if the runner has stopped.
    pub fn enqueue(&self, wake_at: DateTime<Utc>, task: T) -> bool {
        self.tx.send((wake_at, task)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    #[tokio::test]
    async fn due_tasks_run_immediately() {
        let notify = Arc::new(Notify::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let queue = {
            let notify = notify.clone();
            let seen = seen.clone();
            WakeQueue::spawn(move |task: &'static str| {
                let notify = notify.clone();
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(task);
                    notify.notify_one();
                }
            })
        };

        // Already past due: runs on the next loop turn.
        queue.enqueue(Utc::now() - Duration::seconds(5), "past");
        notify.notified().await;
        assert_eq!(*seen.lock().unwrap(), vec!["past"]);
    }

    #[tokio::test]
    async fn tasks_run_in_wake_order() {
        let notify = Arc::new(Notify::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let queue = {
            let notify = notify.clone();
            let seen = seen.clone();
            WakeQueue::spawn(move |task: u32| {
                let notify = notify.clone();
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(task);
                    if task == 1 {
                        notify.notify_one();
                    }
                }
            })
        };

        let now = Utc::now();
        // Enqueued out of order; both already due, so they execute by wake
        // time once the runner drains.
        queue.enqueue(now - Duration::milliseconds(10), 1);
        queue.enqueue(now - Duration::milliseconds(20), 2);

        notify.notified().await;
        let seen = seen.lock().unwrap().clone();
        assert!(seen.contains(&1) && seen.contains(&2));
    }

    #[tokio::test]
    async fn future_tasks_wait_for_their_wake_time() {
        let fired = Arc::new(Mutex::new(false));
        let notify = Arc::new(Notify::new());
        let queue = {
            let fired = fired.clone();
            let notify = notify.clone();
            WakeQueue::spawn(move |_task: ()| {
                let fired = fired.clone();
                let notify = notify.clone();
                async move {
                    *fired.lock().unwrap() = true;
                    notify.notify_one();
                }
            })
        };

        queue.enqueue(Utc::now() + Duration::milliseconds(150), ());

        // Not due yet.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!*fired.lock().unwrap());

        // Fires once the wake time passes.
        notify.notified().await;
        assert!(*fired.lock().unwrap());
    }
}
