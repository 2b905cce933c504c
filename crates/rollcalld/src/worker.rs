use rollcall_core::{Embedding, EmbeddingExtractor, ExtractError, Photo};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to spawn extractor thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from request handlers to the extractor thread.
struct ExtractRequest {
    photo: Photo,
    reply: oneshot::Sender<Result<Embedding, ExtractError>>,
}

/// Clone-safe handle to the extractor thread.
#[derive(Clone)]
pub struct ExtractorHandle {
    tx: mpsc::Sender<ExtractRequest>,
    timeout: Duration,
}

impl ExtractorHandle {
    /// Extract one embedding, bounded by the configured timeout.
    ///
    /// On timeout the request is abandoned; the thread finishes it and the
    /// reply is dropped.
    pub async fn extract(&self, photo: Photo) -> Result<Embedding, ExtractError> {
        let call = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(ExtractRequest {
                    photo,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| ExtractError::Unavailable("extractor thread exited".into()))?;
            reply_rx
                .await
                .map_err(|_| ExtractError::Unavailable("extractor thread exited".into()))?
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "extraction timed out"
                );
                Err(ExtractError::Timeout(self.timeout))
            }
        }
    }
}

/// Spawn the extractor on a dedicated OS thread.
///
/// Extraction is blocking (socket I/O or model inference), so it never
/// runs on the async runtime.
pub fn spawn_worker(
    mut extractor: Box<dyn EmbeddingExtractor>,
    timeout: Duration,
) -> Result<ExtractorHandle, WorkerError> {
    let (tx, mut rx) = mpsc::channel::<ExtractRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-extractor".into())
        .spawn(move || {
            tracing::info!("extractor thread started");
            while let Some(req) = rx.blocking_recv() {
                let result = extractor.extract(&req.photo);
                if let Err(e) = &result {
                    tracing::debug!(error = %e, "extraction failed");
                }
                let _ = req.reply.send(result);
            }
            tracing::info!("extractor thread exiting");
        })?;

    Ok(ExtractorHandle { tx, timeout })
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_extract_round_trips_through_thread() {
        let handle = spawn_worker(
            Box::new(ScriptedExtractor::always(Ok(Embedding::new(vec![0.5; 4])))),
            Duration::from_secs(5),
        )
        .unwrap();
        let embedding = handle.extract(photo()).await.unwrap();
        assert_eq!(embedding.values, vec![0.5; 4]);
    }

    #[tokio::test]
    async fn test_extract_failure_passed_through() {
        let handle = spawn_worker(
            Box::new(ScriptedExtractor::always(Err(ExtractError::MultipleFacesDetected {
                count: 2,
            }))),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            handle.extract(photo()).await,
            Err(ExtractError::MultipleFacesDetected { count: 2 })
        );
    }

    #[tokio::test]
    async fn test_slow_extractor_times_out() {
        let mut slow = ScriptedExtractor::always(Ok(Embedding::new(vec![0.0; 4])));
        slow.delay = Duration::from_millis(500);
        let handle = spawn_worker(Box::new(slow), Duration::from_millis(50)).unwrap();
        assert!(matches!(
            handle.extract(photo()).await,
            Err(ExtractError::Timeout(_))
        ));
    }
}
