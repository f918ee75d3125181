use presence_core::{Embedding, EmbeddingExtractor, ExtractError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Extract {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Embedding, ExtractError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    model_version: Arc<str>,
}

impl EngineHandle {
    /// Decode the photo, find the face and compute its embedding.
    ///
    /// Dropping the returned future abandons the request; the engine skips it
    /// if it has not started yet.
    pub async fn extract(&self, image: Vec<u8>) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Model version tagged onto every embedding this engine produces.
    pub fn model_version(&self) -> &str {
        &self.model_version
    }
}

/// Spawn the extractor on a dedicated OS thread.
///
/// Inference is CPU-bound and the ONNX sessions need `&mut` access, so a
/// single thread owns the extractor and serves requests in arrival order.
pub fn spawn_engine<E>(mut extractor: E, queue: usize) -> std::io::Result<EngineHandle>
where
    E: EmbeddingExtractor + Send + 'static,
{
    let model_version: Arc<str> = Arc::from(extractor.model_version());
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue.max(1));

    std::thread::Builder::new()
        .name("presence-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { image, reply } => {
                        if reply.is_closed() {
                            tracing::debug!("extract request abandoned before start");
                            continue;
                        }
                        let started = std::time::Instant::now();
                        let result = extractor.extract(&image);
                        tracing::debug!(
                            bytes = image.len(),
                            ok = result.is_ok(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "extract finished"
                        );
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, model_version })
}
