use crate::{
    error::InferenceError,
    mask::ClassProbabilities,
    model_service::{ModelError, SegmentationModel},
    palette::MAX_CLASSES,
    preprocess::{InputTensor, TensorShape},
};
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::instrument;

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    in_flight: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InferenceStats {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub in_flight: usize,
}

struct InFlight(Arc<Counters>);

impl InFlight {
    fn enter(counters: &Arc<Counters>) -> Self {
        counters.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(counters.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns the loaded model replicas and hands out exclusive access to them.
///
/// Each replica sits behind its own async mutex and requests are dispatched
/// round-robin. With a single replica every inference queues behind one lock,
/// which is the default. The timeout covers both waiting for a replica and the
/// model call; when it fires the request fails and the replica is released as
/// soon as the running call returns.
pub struct InferenceService<M: SegmentationModel> {
    replicas: Vec<Arc<Mutex<M>>>,
    counter: AtomicUsize,
    shape: TensorShape,
    num_classes: usize,
    timeout: Duration,
    counters: Arc<Counters>,
}

impl<M: SegmentationModel> InferenceService<M> {
    pub fn new(
        replicas: Vec<M>,
        shape: TensorShape,
        num_classes: usize,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        if replicas.is_empty() {
            return Err(ModelError::new("inference service", "no model replicas"));
        }
        if num_classes == 0 || num_classes > MAX_CLASSES {
            return Err(ModelError::new(
                "inference service",
                format!("num_classes must be in 1..={}, got {}", MAX_CLASSES, num_classes),
            ));
        }

        tracing::info!(
            "Inference access policy: {} replica(s), round-robin, {}ms timeout",
            replicas.len(),
            timeout.as_millis()
        );

        Ok(Self {
            replicas: replicas
                .into_iter()
                .map(|model| Arc::new(Mutex::new(model)))
                .collect(),
            counter: AtomicUsize::new(0),
            shape,
            num_classes,
            timeout,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn shape(&self) -> TensorShape {
        self.shape
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> InferenceStats {
        InferenceStats {
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            timed_out: self.counters.timed_out.load(Ordering::SeqCst),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
        }
    }

    #[instrument(skip_all)]
    pub async fn infer(&self, input: InputTensor) -> Result<ClassProbabilities, InferenceError> {
        let expected = self.shape.input_dims();
        if input.shape() != expected {
            self.counters.failed.fetch_add(1, Ordering::SeqCst);
            return Err(InferenceError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: input.shape().to_vec(),
            });
        }

        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.replicas.len();
        let replica = self.replicas[index].clone();
        let counters = self.counters.clone();
        let started = Instant::now();

        let outcome = tokio::time::timeout(self.timeout, async move {
            let mut model = replica.lock_owned().await;
            tracing::debug!(
                "Handling request with replica {} after waiting {:?}",
                index,
                started.elapsed()
            );
            tokio::task::spawn_blocking(move || {
                let _in_flight = InFlight::enter(&counters);
                model.infer(input.view())
            })
            .await
        })
        .await;

        let scores = match outcome {
            Err(_elapsed) => {
                self.counters.timed_out.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(
                    "Inference on replica {} timed out after {:?}",
                    index,
                    self.timeout
                );
                return Err(InferenceError::Timeout(self.timeout));
            }
            Ok(Err(join_error)) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                return Err(InferenceError::Model(format!(
                    "inference task aborted: {}",
                    join_error
                )));
            }
            Ok(Ok(Err(model_error))) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                return Err(InferenceError::Model(model_error.to_string()));
            }
            Ok(Ok(Ok(scores))) => scores,
        };

        let expected = self.shape.output_dims(self.num_classes);
        if scores.shape() != expected {
            self.counters.failed.fetch_add(1, Ordering::SeqCst);
            return Err(InferenceError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: scores.shape().to_vec(),
            });
        }

        self.counters.completed.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Inference finished in {:?}", started.elapsed());

        Ok(ClassProbabilities::new(scores))
    }
}
