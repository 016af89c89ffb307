//! One-shot batch fan-out over worker threads.

use std::thread;

use anyhow::{bail, Error};
use crossbeam_channel::bounded;

use crate::cancel::CancelToken;

/// Spread `items` over `threads` named worker threads, run `worker` on
/// each item and gather every `Some` output. Completion order is not
/// preserved.
///
/// Once `cancel` fires, workers stop pulling items and whatever was
/// gathered so far is returned; the caller decides what a partial result
/// means. An error is returned only when a worker thread cannot be
/// spawned or panics.
pub fn scatter_gather<I, T, F>(
    name: &str,
    threads: usize,
    items: Vec<I>,
    cancel: Option<&dyn CancelToken>,
    worker: F,
) -> Result<Vec<T>, Error>
where
    I: Send,
    T: Send,
    F: Fn(I) -> Option<T> + Send + Sync,
{
    let threads = threads.max(1);
    let worker = &worker;

    thread::scope(|scope| {
        let (item_tx, item_rx) = bounded::<I>(threads);

        let mut handles = Vec::new();
        for thread_id in 0..threads {
            let item_rx = item_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{name} ({thread_id})"))
                .spawn_scoped(scope, move || {
                    let mut gathered = Vec::new();
                    while let Ok(item) = item_rx.recv() {
                        if let Some(cancel) = cancel {
                            if cancel.is_cancelled() {
                                break;
                            }
                        }
                        if let Some(output) = worker(item) {
                            gathered.push(output);
                        }
                    }
                    gathered
                })?;
            handles.push(handle);
        }
        drop(item_rx);

        for item in items {
            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    break;
                }
            }
            // send only fails when every worker died; the join below reports it
            if item_tx.send(item).is_err() {
                break;
            }
        }
        drop(item_tx);

        let mut gathered = Vec::new();
        let mut panicked = false;
        for handle in handles {
            match handle.join() {
                Ok(outputs) => gathered.extend(outputs),
                Err(_) => panicked = true,
            }
        }
        if panicked {
            bail!("worker thread of '{name}' panicked");
        }
        Ok(gathered)
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_scatter_gather() {
        let mut squares = scatter_gather(
            "test squares",
            4,
            (1u64..=100).collect(),
            None,
            |value| {
                if value % 2 == 0 {
                    Some(value * value)
                } else {
                    None
                }
            },
        )
        .unwrap();
        squares.sort_unstable();
        let expected: Vec<u64> = (1u64..=50).map(|value| (2 * value) * (2 * value)).collect();
        assert_eq!(squares, expected);
    }

    #[test]
    fn test_scatter_gather_cancelled() {
        let cancel = AtomicBool::new(true);
        let gathered = scatter_gather(
            "test cancelled",
            2,
            (0u64..1000).collect(),
            Some(&cancel),
            Some,
        )
        .unwrap();
        assert!(gathered.is_empty());
    }
}
