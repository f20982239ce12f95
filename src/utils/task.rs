//! This module provides utilities relating to async tasks, typically for usage
//! only in test

use std::{future::Future, time::Duration};

use tokio::{
    runtime::Builder,
    select,
    task::{spawn_local, LocalSet},
};

/// Run the supplied future on a single-threaded runtime with paused time
pub fn block_on_locally<T>(f: impl Future<Output = T>) -> T {
    let rt = Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("failed to build test runtime");
    LocalSet::new().block_on(&rt, async move {
        select! {
            t = f => t,
            // NOTE: this time should be LARGER than any meaningful delay in the client
            _ = tokio::time::sleep(Duration::from_secs(100000)) => {
                panic!("test appears to be stuck");
            },
        }
    })
}

/// Check if the supplied future immediately resolves.
/// Returns Ok(T) if it resolves, or Err(impl Future<Output = T>) if it does not.
///
/// Unlike spawn_local, try_await guarantees that the future has been polled
/// when it returns. Dropping the returned future does not cancel the
/// underlying task.
///
/// MUST only be run in an environment where time is mocked.
pub async fn try_await<T: 'static>(
    f: impl Future<Output = T> + 'static,
) -> Result<T, impl Future<Output = T>> {
    let mut handle = spawn_local(f);

    select! {
        t = &mut handle => Ok(t.expect("task panicked")),
        // NOTE: since time is frozen in test, this cannot race with anything
        _ = tokio::time::sleep(Duration::from_millis(10)) => {
            Err(async { handle.await.expect("task panicked") })
        },
    }
}
