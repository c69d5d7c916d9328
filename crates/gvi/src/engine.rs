use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinSet};

use crate::error::{panic_message, PointError};
use crate::metrics::PipelineMetrics;
use crate::source::ImageSource;
use crate::types::{AssignmentResult, SpatialPoint};

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Number of workers pulling points concurrently.
    pub concurrency: usize,
    /// Log a progress line every this many finished points.
    pub progress_every: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            progress_every: 100,
        }
    }
}

/// Runs one image lookup per point on a bounded worker pool.
///
/// A failing or panicking lookup only affects its own point. The returned
/// vector always has one result per input point, in input order. Dropping the
/// future returned by [`run`](Self::run) aborts every worker.
pub struct AssignmentEngine {
    config: EngineConfig,
    metrics: Arc<PipelineMetrics>,
}

impl AssignmentEngine {
    pub fn new(config: EngineConfig, metrics: Arc<PipelineMetrics>) -> Self {
        Self { config, metrics }
    }

    pub async fn run(
        &self,
        points: Vec<SpatialPoint>,
        source: Arc<dyn ImageSource>,
    ) -> Vec<AssignmentResult> {
        let total = points.len();
        if total == 0 {
            return Vec::new();
        }

        let point_ids: Vec<usize> = points.iter().map(|p| p.id).collect();
        let workers = self.config.concurrency.clamp(1, total);
        let progress_every = self.config.progress_every.max(1);

        tracing::info!(
            points = total,
            workers,
            source = source.name(),
            max_distance_m = source.max_distance_m(),
            "Starting image assignment"
        );

        // Slot index, not point id, decides where a result lands.
        let queue: Arc<Mutex<VecDeque<(usize, SpatialPoint)>>> =
            Arc::new(Mutex::new(points.into_iter().enumerate().collect()));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, AssignmentResult)>();

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let queue = queue.clone();
            let source = source.clone();
            let metrics = self.metrics.clone();
            let tx = tx.clone();
            set.spawn(async move {
                let mut handled = 0usize;
                loop {
                    let next = queue.lock().pop_front();
                    let Some((slot, point)) = next else {
                        break;
                    };

                    metrics.points_in_flight.inc();
                    let timer = metrics.lookup_latency.start_timer();
                    let outcome = AssertUnwindSafe(source.find_nearest_unassigned(&point))
                        .catch_unwind()
                        .await;
                    timer.observe_duration();
                    metrics.points_in_flight.dec();

                    let result = match outcome {
                        Ok(result) => result,
                        Err(payload) => {
                            let message = panic_message(&*payload);
                            tracing::error!(worker, point_id = point.id, panic = %message, "Lookup panicked");
                            AssignmentResult::failed(point.id, PointError::Internal(message))
                        }
                    };
                    metrics.record_assignment(&result);
                    handled += 1;

                    if tx.send((slot, result)).is_err() {
                        break;
                    }
                }
                tracing::debug!(worker, handled, "Assignment worker finished");
            });
        }
        drop(tx);

        let mut slots: Vec<Option<AssignmentResult>> = (0..total).map(|_| None).collect();
        let mut done = 0usize;
        while let Some((slot, result)) = rx.recv().await {
            slots[slot] = Some(result);
            done += 1;
            if done % progress_every == 0 || done == total {
                tracing::info!(done, total, "Assignment progress");
            }
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Assignment worker terminated abnormally");
            }
        }

        let results: Vec<AssignmentResult> = slots
            .into_iter()
            .zip(point_ids)
            .map(|(slot, point_id)| {
                slot.unwrap_or_else(|| {
                    AssignmentResult::failed(
                        point_id,
                        PointError::Internal("worker exited before reporting".into()),
                    )
                })
            })
            .collect();

        let assigned = results.iter().filter(|r| r.is_assigned()).count();
        let failed = results.iter().filter(|r| r.error.is_some()).count();
        tracing::info!(
            total,
            assigned,
            not_found = results.iter().filter(|r| r.is_not_found()).count(),
            with_errors = failed,
            "Image assignment finished"
        );

        results
    }
}
