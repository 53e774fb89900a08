//! Bounded worker pool for concurrent ingestion.
//!
//! Each worker thread runs one pipeline at a time. A worker opens its own
//! `SqliteSceneStore` and detector on its first job and keeps both until it exits;
//! neither is ever handed to another thread.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::config::IngestConfig;
use crate::detect::{DetectorBackend, DetectorFactory};
use crate::error::{IngestError, PipelineError};
use crate::pipeline::{CancelToken, IngestPipeline, IngestRequest, IngestSummary, PipelineState};
use crate::storage::SqliteSceneStore;

type JobResult = Result<IngestSummary, PipelineError>;

struct Job {
    request: IngestRequest,
    cancel: CancelToken,
    reply: Sender<JobResult>,
}

/// Handle to one submitted request.
pub struct IngestJob {
    reply: Receiver<JobResult>,
    cancel: CancelToken,
}

impl IngestJob {
    /// Block until the worker finishes the request.
    pub fn wait(self) -> JobResult {
        self.reply.recv().unwrap_or_else(|_| {
            Err(PipelineError::before_scene(
                PipelineState::Init,
                IngestError::Shutdown("worker exited before finishing the request".to_string()),
            ))
        })
    }

    /// Ask the pipeline to stop at its next duration check.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct IngestPool {
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl IngestPool {
    pub fn new(config: IngestConfig, detectors: DetectorFactory) -> Result<Self, IngestError> {
        if config.workers == 0 {
            return Err(IngestError::validation("workers must be greater than zero"));
        }
        let (sender, receiver) = bounded::<Job>(config.workers * 2);
        let config = Arc::new(config);
        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let receiver = receiver.clone();
            let config = Arc::clone(&config);
            let detectors = Arc::clone(&detectors);
            let handle = std::thread::Builder::new()
                .name(format!("ingest-worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, &config, &detectors, receiver))
                .map_err(|err| {
                    IngestError::Shutdown(format!("failed to spawn worker {}: {}", worker_id, err))
                })?;
            workers.push(handle);
        }
        log::info!("ingest pool started with {} workers", workers.len());
        Ok(Self {
            jobs: Some(sender),
            workers,
        })
    }

    /// Queue a request. Blocks while the queue is full.
    pub fn submit(&self, request: IngestRequest) -> Result<IngestJob, IngestError> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| IngestError::Shutdown("pool is shut down".to_string()))?;
        let (reply, receiver) = bounded(1);
        let cancel = CancelToken::new();
        jobs.send(Job {
            request,
            cancel: cancel.clone(),
            reply,
        })
        .map_err(|_| IngestError::Shutdown("all workers have exited".to_string()))?;
        Ok(IngestJob {
            reply: receiver,
            cancel,
        })
    }

    /// Stop accepting work, finish queued requests, and join the workers.
    pub fn shutdown(&mut self) {
        // Workers leave their loop once the channel is closed and drained.
        self.jobs.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("ingest worker panicked");
            }
        }
    }
}

impl Drop for IngestPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    worker_id: usize,
    config: &IngestConfig,
    detectors: &DetectorFactory,
    jobs: Receiver<Job>,
) {
    let mut store: Option<SqliteSceneStore> = None;
    let mut detector: Option<Box<dyn DetectorBackend>> = None;
    for job in jobs.iter() {
        let result = run_job(config, detectors, &mut store, &mut detector, &job);
        if let Err(err) = &result {
            log::debug!("worker {}: request failed: {}", worker_id, err);
        }
        // The submitter may have dropped its handle.
        let _ = job.reply.send(result);
    }
    log::debug!("worker {} exiting", worker_id);
}

fn run_job(
    config: &IngestConfig,
    detectors: &DetectorFactory,
    store_slot: &mut Option<SqliteSceneStore>,
    detector_slot: &mut Option<Box<dyn DetectorBackend>>,
    job: &Job,
) -> JobResult {
    // Reject bad input before touching the database or loading a model.
    if let Err(err) = job.request.validate() {
        return Err(PipelineError::before_scene(PipelineState::Init, err));
    }
    let mut store = match store_slot.take() {
        Some(store) => store,
        None => SqliteSceneStore::open(&config.db_path, config.busy_timeout)
            .map_err(|err| PipelineError::before_scene(PipelineState::Opening, err.into()))?,
    };
    let mut detector = match detector_slot.take() {
        Some(detector) => detector,
        None => match build_detector(detectors) {
            Ok(detector) => detector,
            Err(err) => {
                *store_slot = Some(store);
                return Err(PipelineError::before_scene(PipelineState::Opening, err));
            }
        },
    };

    let result = IngestPipeline::new(&mut store, detector.as_mut(), &config.capture)
        .with_cancel(job.cancel.clone())
        .run(&job.request);

    *store_slot = Some(store);
    *detector_slot = Some(detector);
    result
}

pub(crate) fn build_detector(
    detectors: &DetectorFactory,
) -> Result<Box<dyn DetectorBackend>, IngestError> {
    let mut detector = detectors().map_err(|err| IngestError::Detector(format!("{:#}", err)))?;
    detector
        .warm_up()
        .map_err(|err| IngestError::Detector(format!("{:#}", err)))?;
    log::debug!("detector {} ready", detector.name());
    Ok(detector)
}
