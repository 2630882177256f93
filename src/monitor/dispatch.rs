//! Bounded worker pool for one fleet-wide tick.
//!
//! `min(C, N)` workers pull items off a shared index until it runs past the
//! end. A slow item only ties up the worker holding it.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::MonitorError;

/// Counters for one dispatch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub workers: usize,
    pub processed: usize,
    pub failed: usize,
    /// Workers that panicked; their remaining share was picked up by the others.
    pub crashed_workers: usize,
}

/// Run `work` over every item with at most `concurrency` items in flight.
///
/// Errors are logged per item and never stop the run.
pub async fn dispatch<T, F, Fut>(items: Vec<T>, concurrency: usize, work: F) -> DispatchReport
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), MonitorError>> + Send + 'static,
{
    let worker_count = concurrency.max(1).min(items.len());
    if worker_count == 0 {
        return DispatchReport::default();
    }

    let items = Arc::new(items);
    let next = Arc::new(AtomicUsize::new(0));
    let work = Arc::new(work);

    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let items = items.clone();
        let next = next.clone();
        let work = work.clone();

        handles.push(tokio::spawn(async move {
            let mut processed = 0;
            let mut failed = 0;
            loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(item) = items.get(i).cloned() else {
                    break;
                };

                match work(item).await {
                    Ok(()) => processed += 1,
                    Err(e) => {
                        tracing::warn!("Entity processing failed: {}", e);
                        failed += 1;
                    }
                }
            }
            (processed, failed)
        }));
    }

    let mut report = DispatchReport {
        workers: worker_count,
        ..Default::default()
    };
    for handle in handles {
        match handle.await {
            Ok((processed, failed)) => {
                report.processed += processed;
                report.failed += failed;
            }
            Err(e) => {
                tracing::error!("Probe worker crashed: {}", e);
                report.crashed_workers += 1;
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_in_flight_never_exceeds_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let items: Vec<usize> = (0..200).collect();
        let (f, p) = (in_flight.clone(), peak.clone());
        let report = dispatch(items, 7, move |_| {
            let (f, p) = (f.clone(), p.clone());
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(report.workers, 7);
        assert_eq!(report.processed, 200);
        assert!(peak.load(Ordering::SeqCst) <= 7);
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_small_fleet_uses_fewer_workers() {
        let report = dispatch(vec![1, 2, 3], 50, |_| async { Ok(()) }).await;
        assert_eq!(report.workers, 3);
        assert_eq!(report.processed, 3);

        let empty: Vec<u8> = Vec::new();
        let report = dispatch(empty, 50, |_| async { Ok(()) }).await;
        assert_eq!(report, DispatchReport::default());
    }

    #[tokio::test]
    async fn test_errors_do_not_abort_the_run() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let report = dispatch((0..10).collect::<Vec<u32>>(), 3, move |i| {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                if i % 2 == 0 {
                    Err(MonitorError::Storage(format!("item {}", i)))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(seen.load(Ordering::SeqCst), 10);
        assert_eq!(report.failed, 5);
        assert_eq!(report.processed, 5);
    }

    #[tokio::test]
    async fn test_panicking_item_does_not_lose_others() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let report = dispatch((0..20).collect::<Vec<u32>>(), 4, move |i| {
            let s = s.clone();
            async move {
                if i == 5 {
                    panic!("bad entity");
                }
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(report.crashed_workers, 1);
        assert_eq!(seen.load(Ordering::SeqCst), 19);
    }
}
