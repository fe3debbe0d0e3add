use facegate_core::{ComparisonOutcome, FaceComparator};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Pending comparisons allowed to queue before callers wait for capacity.
const QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("cannot spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Compare {
        reference: PathBuf,
        capture: PathBuf,
        threshold: f32,
        reply: oneshot::Sender<ComparisonOutcome>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Compare a registered image with a captured one. Waits behind any
    /// comparison already queued; there is no timeout.
    pub async fn compare(
        &self,
        reference: PathBuf,
        capture: PathBuf,
        threshold: f32,
    ) -> Result<ComparisonOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Compare {
                reference,
                capture,
                threshold,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Whether the engine thread is still accepting requests.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Move the comparator onto a dedicated OS thread and return a handle to it.
///
/// ONNX inference is CPU-bound and the sessions need `&mut`, so all
/// comparisons are serialized on this one thread instead of blocking the
/// async runtime.
pub fn spawn_engine(mut comparator: FaceComparator) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!(verifiers = ?comparator.verifier_names(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Compare {
                        reference,
                        capture,
                        threshold,
                        reply,
                    } => {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            comparator.compare(&reference, &capture, threshold)
                        }))
                        .unwrap_or_else(|_| {
                            tracing::error!("comparison panicked; rejecting");
                            ComparisonOutcome::rejected()
                        });
                        let _ = reply.send(outcome);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
pub mod testing {
    //! Scripted verifiers for exercising the engine without ONNX models.

    use facegate_core::{FaceVerifier, Verification, VerifyError};
    use std::path::Path;

    pub enum Script {
        /// Matched iff the two files have identical bytes; distance 0.1 or 1.6.
        ByteEquality,
        Fail,
        Panic,
    }

    pub struct ScriptedVerifier {
        pub name: &'static str,
        pub script: Script,
    }

    impl FaceVerifier for ScriptedVerifier {
        fn name(&self) -> &str {
            self.name
        }

        fn verify(&mut self, reference: &Path, capture: &Path) -> Result<Verification, VerifyError> {
            match self.script {
                Script::ByteEquality => {
                    let same = std::fs::read(reference).ok() == std::fs::read(capture).ok();
                    let distance = if same { 0.1 } else { 1.6 };
                    Ok(Verification {
                        verified: same,
                        distance,
                        threshold: 0.68,
                        model: self.name.to_string(),
                    })
                }
                Script::Fail => Err(VerifyError::NoFaceDetected(capture.display().to_string())),
                Script::Panic => panic!("scripted verifier panic"),
            }
        }
    }

    pub fn verifier(name: &'static str, script: Script) -> Box<dyn FaceVerifier> {
        Box::new(ScriptedVerifier { name, script })
    }
}
