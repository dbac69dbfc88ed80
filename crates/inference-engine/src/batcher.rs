//! Inference Batcher
//!
//! Async front door for one engine: many tasks submit single images, one task
//! owns the engine and runs them in batches.

use gpu_device::{DeviceImage, Normalization};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

use crate::engine::Engine;
use crate::EngineError;

/// Outputs for one image: one flattened vector per output binding
pub type ImageFeatures = Vec<Vec<f32>>;

struct InferenceRequest {
    image: DeviceImage,
    reply: oneshot::Sender<Result<ImageFeatures, EngineError>>,
}

/// Handle for submitting images to an [`InferenceBatcher`]
#[derive(Clone)]
pub struct BatchSender {
    tx: mpsc::Sender<InferenceRequest>,
}

impl BatchSender {
    /// Queue one image and wait for its outputs
    pub async fn infer(&self, image: DeviceImage) -> Result<ImageFeatures, EngineError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(InferenceRequest { image, reply })
            .await
            .map_err(|_| EngineError::Runtime("inference batcher has stopped".to_string()))?;
        response
            .await
            .map_err(|_| EngineError::Runtime("inference batcher dropped the request".to_string()))?
    }
}

/// Collects queued images into batches and runs them on one engine
pub struct InferenceBatcher {
    /// Channel receiver for incoming requests
    receiver: mpsc::Receiver<InferenceRequest>,
    /// Batch size threshold
    batch_size: usize,
    /// Timeout for batch collection (ms)
    timeout_ms: u64,
}

impl InferenceBatcher {
    fn new(receiver: mpsc::Receiver<InferenceRequest>, batch_size: usize, timeout_ms: u64) -> Self {
        info!("Creating inference batcher: batch_size={}, timeout={}ms", batch_size, timeout_ms);
        Self {
            receiver,
            batch_size: batch_size.max(1),
            timeout_ms,
        }
    }

    /// Create a sender/batcher pair
    pub fn channel(batch_size: usize, timeout_ms: u64) -> (BatchSender, Self) {
        let (tx, rx) = mpsc::channel(batch_size.max(1) * 2);
        (BatchSender { tx }, Self::new(rx, batch_size, timeout_ms))
    }

    /// Serve requests until every sender is dropped.
    ///
    /// Batches hold at most `min(batch_size, max_batch_size)` images, or the
    /// engine's fixed batch size, which short batches are padded up to.
    /// Inference runs on the calling task.
    pub async fn run(
        &mut self,
        engine: &mut Engine<'_>,
        normalization: &Normalization,
    ) -> Result<(), EngineError> {
        if !engine.is_loaded() {
            return Err(engine.report(EngineError::Artifact(
                "batcher needs a loaded network, call load_network() first".to_string(),
            )));
        }
        let limit = engine
            .fixed_batch_size()
            .unwrap_or(engine.options().max_batch_size as usize)
            .min(self.batch_size)
            .max(1);
        info!("Starting inference batcher (up to {} images per batch)", limit);

        loop {
            let mut batch = Vec::with_capacity(limit);
            let timeout_duration = Duration::from_millis(self.timeout_ms);

            // Wait for first item
            match self.receiver.recv().await {
                Some(request) => batch.push(request),
                None => {
                    debug!("Batcher channel closed");
                    break;
                }
            }

            // Try to collect more until batch is full or timeout
            while batch.len() < limit {
                match timeout(timeout_duration, self.receiver.recv()).await {
                    Ok(Some(request)) => batch.push(request),
                    Ok(None) => break, // Channel closed
                    Err(_) => break,   // Timeout
                }
            }

            debug!("Processing batch of {} image(s)", batch.len());
            process_batch(engine, normalization, batch);
        }

        info!("Inference batcher stopped");
        Ok(())
    }
}

fn process_batch(
    engine: &mut Engine<'_>,
    normalization: &Normalization,
    batch: Vec<InferenceRequest>,
) {
    let (mut images, replies): (Vec<_>, Vec<_>) =
        batch.into_iter().map(|r| (r.image, r.reply)).unzip();
    let requested = replies.len();

    let result = pad_to_fixed_batch(engine, &mut images)
        .and_then(|_| engine.run_inference(&images, normalization));
    match result {
        Ok(features) => {
            for (reply, features) in replies.into_iter().zip(features.into_iter().take(requested)) {
                let _ = reply.send(Ok(features));
            }
        }
        Err(e) => {
            debug!("Inference error for batch of {}: {}", requested, e);
            for reply in replies {
                let _ = reply.send(Err(e.clone()));
            }
        }
    }
}

/// Fixed-batch engines only accept full batches; repeat the last image
fn pad_to_fixed_batch(
    engine: &Engine<'_>,
    images: &mut Vec<DeviceImage>,
) -> Result<(), EngineError> {
    let Some(fixed) = engine.fixed_batch_size() else {
        return Ok(());
    };
    while images.len() < fixed {
        let last = images
            .last()
            .ok_or_else(|| EngineError::Configuration("cannot pad an empty batch".to_string()))?;
        let copy = last.try_clone()?;
        images.push(copy);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::{EngineOptions, Precision};

    fn solid(w: u32, value: u8) -> DeviceImage {
        DeviceImage::filled(w, w, [value, value, value]).unwrap()
    }

    fn engine_for<'a>(options: &'a EngineOptions, dir: &std::path::Path) -> Engine<'a> {
        let model = testing::write_model(dir, "net.onnx", &testing::pooling_model(3, 4, 4));
        let mut engine = Engine::new(options).with_cache_dir(dir);
        engine.build(&model).unwrap();
        engine.load_network().unwrap();
        engine
    }

    #[tokio::test]
    async fn test_batcher_fans_out_results() {
        let dir = tempfile::tempdir().unwrap();
        let options = EngineOptions {
            precision: Precision::Fp32,
            max_batch_size: 4,
            ..Default::default()
        };
        let mut engine = engine_for(&options, dir.path());
        let (tx, mut batcher) = InferenceBatcher::channel(4, 50);

        let normalization = Normalization::default();
        let clients = async move {
            let results = tokio::join!(tx.infer(solid(4, 51)), tx.infer(solid(4, 204)));
            drop(tx);
            results
        };
        let ((dark, bright), run) = tokio::join!(clients, batcher.run(&mut engine, &normalization));
        run.unwrap();

        let dark = dark.unwrap();
        let bright = bright.unwrap();
        assert_eq!(dark.len(), 2);
        assert!((dark[0][0] - 0.2).abs() < 1e-5);
        assert!((bright[0][0] - 0.8).abs() < 1e-5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_batch_is_padded() {
        let dir = tempfile::tempdir().unwrap();
        let options = EngineOptions {
            precision: Precision::Fp32,
            dynamic_batch_supported: false,
            max_batch_size: 3,
            optimal_batch_sizes: vec![3],
            ..Default::default()
        };
        let mut engine = engine_for(&options, dir.path());
        let (tx, mut batcher) = InferenceBatcher::channel(8, 10);

        let normalization = Normalization::default();
        let client = async move {
            let result = tx.infer(solid(4, 102)).await;
            drop(tx);
            result
        };
        let (features, run) = tokio::join!(client, batcher.run(&mut engine, &normalization));
        run.unwrap();

        let features = features.unwrap();
        assert_eq!(features.len(), 2);
        assert!((features[1][2] - 0.4).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_batch_error_reaches_every_requester() {
        let dir = tempfile::tempdir().unwrap();
        let options = EngineOptions {
            precision: Precision::Fp32,
            max_batch_size: 2,
            optimal_batch_sizes: vec![1, 2],
            ..Default::default()
        };
        let mut engine = engine_for(&options, dir.path());
        let (tx, mut batcher) = InferenceBatcher::channel(2, 50);

        let normalization = Normalization::default();
        let clients = async move {
            let results = tokio::join!(tx.infer(solid(4, 1)), tx.infer(solid(6, 1)));
            drop(tx);
            results
        };
        let ((a, b), run) = tokio::join!(clients, batcher.run(&mut engine, &normalization));
        run.unwrap();

        assert!(matches!(a, Err(EngineError::Configuration(_))));
        assert!(matches!(b, Err(EngineError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_unloaded_engine_rejected() {
        let options = EngineOptions::default();
        let mut engine = Engine::new(&options);
        let (tx, mut batcher) = InferenceBatcher::channel(4, 10);
        let err = batcher.run(&mut engine, &Normalization::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::Artifact(_)));

        drop(batcher);
        let err = tx.infer(solid(4, 0)).await.unwrap_err();
        assert!(err.to_string().contains("stopped"));
    }
}
