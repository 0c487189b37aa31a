//! Dedicated inference thread with bounded call time.
//!
//! Requests go over a channel and answers come back tagged with the request
//! id. A caller that times out moves on; the stale answer is discarded by
//! the next caller.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::error::{AgentError, AgentResult};
use crate::frame::Image;

use super::backend::InferenceBackend;
use super::result::FaceRegion;

enum Request {
    Detect(Image),
    Embed(Image),
}

pub(crate) enum Response {
    Regions(Vec<FaceRegion>),
    Vector(Vec<f32>),
}

struct Job {
    id: u64,
    request: Request,
}

type Answer = (u64, std::result::Result<Response, String>);

pub struct InferenceWorker {
    backend_name: &'static str,
    model_version: String,
    embedding_dim: usize,
    timeout: Duration,
    next_id: AtomicU64,
    requests: Mutex<Option<Sender<Job>>>,
    answers: Mutex<Receiver<Answer>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl InferenceWorker {
    /// Warm up the backend and move it onto its own thread.
    pub fn spawn(mut backend: Box<dyn InferenceBackend>, timeout: Duration) -> Result<Self> {
        backend
            .warm_up()
            .with_context(|| format!("warm up inference backend {}", backend.name()))?;
        let backend_name = backend.name();
        let model_version = backend.model_version().to_string();
        let embedding_dim = backend.embedding_dim();
        if embedding_dim == 0 {
            return Err(anyhow!("backend {} reports zero embedding dimension", backend_name));
        }

        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let (answer_tx, answer_rx) = mpsc::channel::<Answer>();
        let handle = thread::Builder::new()
            .name("inference".to_string())
            .spawn(move || run(backend, job_rx, answer_tx))
            .context("spawn inference thread")?;

        log::info!(
            "inference: backend={} model={} dim={} timeout={:?}",
            backend_name,
            model_version,
            embedding_dim,
            timeout
        );

        Ok(Self {
            backend_name,
            model_version,
            embedding_dim,
            timeout,
            next_id: AtomicU64::new(1),
            requests: Mutex::new(Some(job_tx)),
            answers: Mutex::new(answer_rx),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub(crate) fn detect(&self, image: &Image) -> AgentResult<Vec<FaceRegion>> {
        match self.call(Request::Detect(image.clone()))? {
            Response::Regions(regions) => Ok(regions),
            Response::Vector(_) => Err(AgentError::Inference(
                "detect answered with a vector".to_string(),
            )),
        }
    }

    pub(crate) fn embed(&self, face: &Image) -> AgentResult<Vec<f32>> {
        match self.call(Request::Embed(face.clone()))? {
            Response::Vector(v) => Ok(v),
            Response::Regions(_) => Err(AgentError::Inference(
                "embed answered with regions".to_string(),
            )),
        }
    }

    fn call(&self, request: Request) -> AgentResult<Response> {
        // Holding the answer lock serialises callers so ids come back in order.
        let answers = self
            .answers
            .lock()
            .map_err(|_| AgentError::Inference("answer lock poisoned".to_string()))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let requests = self
                .requests
                .lock()
                .map_err(|_| AgentError::Inference("request lock poisoned".to_string()))?;
            let sender = requests
                .as_ref()
                .ok_or_else(|| AgentError::Inference("inference worker stopped".to_string()))?;
            sender
                .send(Job { id, request })
                .map_err(|_| AgentError::Inference("inference worker exited".to_string()))?;
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match answers.recv_timeout(remaining) {
                Ok((answer_id, result)) if answer_id == id => {
                    return result.map_err(AgentError::Inference);
                }
                Ok((stale, _)) => {
                    log::debug!("inference: discarding late answer for request {}", stale);
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(AgentError::Inference(format!(
                        "call timed out after {:?}",
                        self.timeout
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AgentError::Inference("inference worker exited".to_string()));
                }
            }
        }
    }

    /// Stop accepting requests and wait up to `grace` for the in-flight call.
    ///
    /// Returns true when the thread exited within the grace period. A stuck
    /// backend is detached and left to finish on its own.
    pub fn shutdown(&self, grace: Duration) -> bool {
        if let Ok(mut requests) = self.requests.lock() {
            requests.take();
        }
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return true;
        };
        let deadline = Instant::now() + grace;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::warn!(
                    "inference: backend {} still busy after {:?}; detaching",
                    self.backend_name,
                    grace
                );
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if handle.join().is_err() {
            log::warn!("inference: worker thread panicked during shutdown");
        }
        true
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.take();
        }
    }
}

fn run(mut backend: Box<dyn InferenceBackend>, jobs: Receiver<Job>, answers: Sender<Answer>) {
    for job in jobs {
        let outcome = catch_unwind(AssertUnwindSafe(|| match &job.request {
            Request::Detect(image) => backend.detect(image).map(Response::Regions),
            Request::Embed(face) => backend.embed(face).map(Response::Vector),
        }));
        let result = match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(format!("{:#}", err)),
            Err(_) => Err("backend panicked".to_string()),
        };
        if answers.send((job.id, result)).is_err() {
            break;
        }
    }
    log::debug!("inference: worker thread exiting");
}
