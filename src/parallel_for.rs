//! N-way partitioned loop over a caller-supplied async body.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::awaitables::AwaitAll;
use crate::scheduler::Scheduler;
use crate::task::{AsyncTask, AsyncTaskDesc, SchedulingFlags};

/// Batches are cut five-to-one against the worker count so stragglers can
/// keep claiming small tails.
const SPLIT_TARGET: u32 = 5;

/// Runs `body(0..count)` across up to `MAX_WORKERS` short-lived worker tasks
/// plus the calling task, all claiming batches from a shared cursor.
///
/// Workers are spawned at maximum priority so they outrank the enclosing
/// work. Must be awaited from inside a running task when `count` is large
/// enough to spawn workers.
pub async fn parallel_for<const MAX_WORKERS: usize, F, Fut>(count: u32, body: F)
where
    F: Fn(u32) -> Fut + Sync,
    Fut: Future<Output = ()> + Send,
{
    if count == 0 {
        return;
    }

    let cursor = AtomicU32::new(0);
    let num_workers = count
        .min(Scheduler::worker_count())
        .min(MAX_WORKERS as u32 + 1)
        - 1;

    let desc = AsyncTaskDesc {
        flags: SchedulingFlags::ShortLived,
        priority: i32::MAX,
    };

    // The worker frames borrow `cursor` and `body` from this frame. That is
    // sound because this frame cannot unwind past the AwaitAll below until
    // every worker handle is done.
    let tasks: [AsyncTask; MAX_WORKERS] = std::array::from_fn(|i| {
        if (i as u32) < num_workers {
            unsafe {
                AsyncTask::new_unchecked(desc, drive(&cursor, &body, count, num_workers + 1))
            }
        } else {
            AsyncTask::default()
        }
    });
    let waits = AsyncTask::schedule_evenly(tasks);

    drive(&cursor, &body, count, num_workers + 1).await;

    AwaitAll::new(&waits).await;
}

/// One participant's claim loop.
async fn drive<F, Fut>(cursor: &AtomicU32, body: &F, count: u32, num_workers: u32)
where
    F: Fn(u32) -> Fut + Sync,
    Fut: Future<Output = ()> + Send,
{
    let mut batch_size = (count / num_workers / SPLIT_TARGET).max(1);
    loop {
        let start_index = cursor.fetch_add(batch_size, Ordering::Relaxed);
        if start_index >= count {
            break;
        }

        let end_index = count.min(start_index + batch_size);
        for i in start_index..end_index {
            body(i).await;
        }
        batch_size = ((count - start_index) / num_workers / SPLIT_TARGET).max(1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures_lite::future::block_on;

    use super::*;

    #[test]
    fn zero_count_completes_without_spawning() {
        let visits = AtomicU32::new(0);
        block_on(parallel_for::<8, _, _>(0, |_| {
            visits.fetch_add(1, Ordering::Relaxed);
            async {}
        }));
        assert_eq!(visits.load(Ordering::Relaxed), 0);
    }
}
