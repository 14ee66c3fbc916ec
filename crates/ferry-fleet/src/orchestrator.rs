//! Fleet orchestrator
//!
//! A fixed pool of workers pulls devices from a shared queue. Each worker
//! checks availability, dispatches to the driver, and reports status
//! changes over a channel to a single aggregator that owns every job and
//! publishes the live summary.

use crate::availability::{Availability, AvailabilityProbe};
use crate::driver::DeviceDriver;
use chrono::Utc;
use ferry_model::{FleetJob, FleetReport, JobStatus, Stage, Summary};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Status change reported by a worker
#[derive(Debug)]
enum JobUpdate {
    Started {
        index: usize,
    },
    Finished {
        index: usize,
        status: JobStatus,
        reason: Option<String>,
        final_stage: Option<Stage>,
    },
}

/// Controls and observes a running fleet
#[derive(Clone)]
pub struct FleetHandle {
    progress: watch::Receiver<Summary>,
    cancelled: Arc<AtomicBool>,
    driver: Arc<dyn DeviceDriver>,
}

impl FleetHandle {
    /// Live summary, updated on every status change
    pub fn progress(&self) -> watch::Receiver<Summary> {
        self.progress.clone()
    }

    /// Stop dispatching pending devices; running ones finish normally
    pub fn cancel(&self) {
        info!("Fleet cancellation requested");
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Stop one device before its next stage
    pub fn cancel_device(&self, device_id: &str) {
        self.driver.cancel(device_id);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Runs many device migrations with bounded parallelism
pub struct FleetOrchestrator {
    driver: Arc<dyn DeviceDriver>,
    probe: Arc<dyn AvailabilityProbe>,
    force: bool,
    cancelled: Arc<AtomicBool>,
    progress: watch::Sender<Summary>,
}

impl FleetOrchestrator {
    pub fn new(driver: Arc<dyn DeviceDriver>, probe: Arc<dyn AvailabilityProbe>) -> Self {
        let (progress, _) = watch::channel(Summary::default());
        Self {
            driver,
            probe,
            force: false,
            cancelled: Arc::new(AtomicBool::new(false)),
            progress,
        }
    }

    /// Migrate devices that are in use instead of skipping them
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn handle(&self) -> FleetHandle {
        FleetHandle {
            progress: self.progress.subscribe(),
            cancelled: self.cancelled.clone(),
            driver: self.driver.clone(),
        }
    }

    /// Migrate every device, at most `max_parallel` at a time
    ///
    /// Returns once every job is terminal. Duplicate device ids are run
    /// once.
    pub async fn run(&self, devices: Vec<String>, max_parallel: usize) -> FleetReport {
        let started_at = Utc::now();

        let mut seen = HashSet::new();
        let devices: Vec<String> = devices
            .into_iter()
            .filter(|d| seen.insert(d.clone()))
            .collect();
        let mut jobs: Vec<FleetJob> = devices.iter().map(FleetJob::pending).collect();

        let workers = max_parallel.max(1).min(devices.len().max(1));
        info!(devices = devices.len(), workers, force = self.force, "Starting fleet run");
        self.progress.send_replace(Summary::from_jobs(&jobs));

        let (queue_tx, queue_rx) = mpsc::channel(devices.len().max(1));
        for (index, device_id) in devices.into_iter().enumerate() {
            // Capacity covers every device
            let _ = queue_tx.try_send((index, device_id));
        }
        drop(queue_tx);
        let queue = Arc::new(Mutex::new(queue_rx));

        let (update_tx, mut update_rx) = mpsc::unbounded_channel();
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let worker = Worker {
                    id: worker,
                    queue: queue.clone(),
                    updates: update_tx.clone(),
                    driver: self.driver.clone(),
                    probe: self.probe.clone(),
                    force: self.force,
                    cancelled: self.cancelled.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        drop(update_tx);

        let mut peak_running = 0;
        while let Some(update) = update_rx.recv().await {
            match update {
                JobUpdate::Started { index } => jobs[index].start(),
                JobUpdate::Finished {
                    index,
                    status,
                    reason,
                    final_stage,
                } => jobs[index].finish(status, reason, final_stage),
            }
            let summary = Summary::from_jobs(&jobs);
            peak_running = peak_running.max(summary.running);
            self.progress.send_replace(summary);
        }

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Fleet worker exited abnormally");
            }
        }

        let summary = Summary::from_jobs(&jobs);
        info!(summary = %summary, peak_running, "Fleet run finished");
        FleetReport {
            summary,
            jobs,
            peak_running,
            started_at,
            completed_at: Utc::now(),
        }
    }
}

struct Worker {
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<(usize, String)>>>,
    updates: mpsc::UnboundedSender<JobUpdate>,
    driver: Arc<dyn DeviceDriver>,
    probe: Arc<dyn AvailabilityProbe>,
    force: bool,
    cancelled: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = self.queue.lock().await.recv().await;
            let Some((index, device_id)) = next else {
                break;
            };
            debug!(worker = self.id, device = %device_id, "Picked up device");

            let update = self.process(index, &device_id).await;
            let _ = self.updates.send(update);
        }
        debug!(worker = self.id, "Worker finished");
    }

    async fn process(&self, index: usize, device_id: &str) -> JobUpdate {
        let skipped = |reason: String| JobUpdate::Finished {
            index,
            status: JobStatus::Skipped,
            reason: Some(reason),
            final_stage: None,
        };

        if self.cancelled.load(Ordering::SeqCst) {
            return skipped("fleet run cancelled".to_string());
        }

        match self.probe.check(device_id).await {
            Availability::Available => {}
            Availability::InUse(reason) if self.force => {
                warn!(device = %device_id, reason = %reason, "Device in use, continuing because of --force");
            }
            unavailable => {
                info!(device = %device_id, availability = %unavailable, "Skipping device");
                return skipped(unavailable.to_string());
            }
        }

        let _ = self.updates.send(JobUpdate::Started { index });

        let driver = self.driver.clone();
        let id = device_id.to_string();
        let result = tokio::spawn(async move { driver.drive(&id).await }).await;

        let (status, reason, final_stage) = match result {
            Ok(Ok(outcome)) if outcome.stage == Stage::Completed => {
                (JobStatus::Succeeded, None, Some(outcome.stage))
            }
            Ok(Ok(outcome)) => {
                let reason = match &outcome.verification {
                    Some(v) if !v.overall_success => {
                        format!("verification failed: {}", v.failure_summary())
                    }
                    _ => format!("ended at {}", outcome.stage),
                };
                (JobStatus::Failed, Some(reason), Some(outcome.stage))
            }
            Ok(Err(e)) if e.is_cancelled() => (JobStatus::Skipped, Some(e.to_string()), None),
            Ok(Err(e)) => (JobStatus::Failed, Some(e.to_string()), None),
            Err(e) if e.is_panic() => {
                error!(device = %device_id, "Driver panicked");
                (JobStatus::Failed, Some("driver panicked".to_string()), None)
            }
            Err(e) => (JobStatus::Failed, Some(e.to_string()), None),
        };

        match status {
            JobStatus::Succeeded => info!(device = %device_id, "Device migrated"),
            _ => warn!(
                device = %device_id,
                status = %status,
                reason = reason.as_deref().unwrap_or(""),
                "Device did not complete"
            ),
        }

        JobUpdate::Finished {
            index,
            status,
            reason,
            final_stage,
        }
    }
}
