//! Band-power analysis served off the primary context

use bsp_core::{BspError, BspResult};
use bsp_processing::{AnalysisRegistry, BandPowerAnalyzer, BandPowerRequest, BandPowerResponse};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct AnalysisJob {
    stream: String,
    request: BandPowerRequest,
    reply: oneshot::Sender<BspResult<BandPowerResponse>>,
}

/// Commands accepted by the worker
enum WorkerCommand {
    Analyze(AnalysisJob),
    /// Drop the smoothing state of one stream
    Reset(String),
}

/// Cloneable client for an [`AnalysisWorker`]
#[derive(Clone)]
pub struct AnalysisHandle {
    sender: mpsc::Sender<WorkerCommand>,
}

impl AnalysisHandle {
    /// Analyse one request.
    ///
    /// Smoothing state is kept per `stream` name across requests.
    pub async fn analyze(&self, stream: &str, request: BandPowerRequest) -> BspResult<BandPowerResponse> {
        let (reply, response) = oneshot::channel();
        let job = AnalysisJob {
            stream: stream.to_string(),
            request,
            reply,
        };
        self.sender
            .send(WorkerCommand::Analyze(job))
            .await
            .map_err(|_| BspError::WorkerUnavailable)?;
        response.await.map_err(|_| BspError::WorkerUnavailable)?
    }

    pub async fn reset(&self, stream: &str) -> BspResult<()> {
        self.sender
            .send(WorkerCommand::Reset(stream.to_string()))
            .await
            .map_err(|_| BspError::WorkerUnavailable)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Tokio task owning one analyser per stream
pub struct AnalysisWorker {
    handle: AnalysisHandle,
    task: JoinHandle<u64>,
}

impl AnalysisWorker {
    /// Spawn the worker; must be called inside a tokio runtime
    pub fn spawn(registry: Arc<AnalysisRegistry>, queue_depth: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_depth.max(1));
        let task = tokio::spawn(run_worker(registry, receiver));
        Self {
            handle: AnalysisHandle { sender },
            task,
        }
    }

    pub fn handle(&self) -> AnalysisHandle {
        self.handle.clone()
    }

    pub async fn analyze(&self, stream: &str, request: BandPowerRequest) -> BspResult<BandPowerResponse> {
        self.handle.analyze(stream, request).await
    }

    /// Stop accepting work once every handle is dropped and wait for the
    /// task; resolves to the number of requests served
    pub async fn shutdown(self) -> BspResult<u64> {
        drop(self.handle);
        self.task.await.map_err(|_| BspError::WorkerUnavailable)
    }
}

async fn run_worker(registry: Arc<AnalysisRegistry>, mut receiver: mpsc::Receiver<WorkerCommand>) -> u64 {
    info!("analysis worker started");
    let mut analyzers: HashMap<String, BandPowerAnalyzer> = HashMap::new();
    let mut served = 0u64;

    while let Some(command) = receiver.recv().await {
        match command {
            WorkerCommand::Analyze(job) => {
                let analyzer = analyzers
                    .entry(job.stream)
                    .or_insert_with(|| BandPowerAnalyzer::new(Arc::clone(&registry)));
                let result = analyzer.analyze(&job.request);
                if let Err(err) = &result {
                    warn!(error = %err, "band-power analysis failed");
                }
                served += 1;
                if job.reply.send(result).is_err() {
                    debug!("analysis requester went away");
                }
            }
            WorkerCommand::Reset(stream) => {
                if let Some(analyzer) = analyzers.get_mut(&stream) {
                    analyzer.reset();
                }
            }
        }
    }

    info!(served, "analysis worker stopped");
    served
}
