//! Serialized task queue: one task at a time, in submission order.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::NotifierError;
use crate::notifier::diagnostics::{Diagnostic, DiagnosticSink};

/// One scan request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTask {
    pub label: String,
    /// What the server reported when this scan was triggered; diagnostic only
    pub trigger: Option<u32>,
}

impl ScanTask {
    pub fn initial() -> Self {
        Self {
            label: "scan initial".to_string(),
            trigger: None,
        }
    }

    pub fn triggered(count: u32) -> Self {
        Self {
            label: format!("scan {}", count),
            trigger: Some(count),
        }
    }
}

/// Outcome of one successful scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Messages matched by the search
    pub found: usize,
    /// Mail events emitted
    pub delivered: usize,
    /// Messages not delivered (no UID, unparseable)
    pub skipped: usize,
}

pub type ScanResult = Result<ScanReport, NotifierError>;

/// Completion signal for one pushed task.
pub type Completion = oneshot::Receiver<ScanResult>;

/// Runs scan tasks for a `ScanQueue`.
pub trait ScanWorker: Send + 'static {
    fn run(&mut self, task: &ScanTask) -> impl Future<Output = ScanResult> + Send;
}

struct QueuedTask {
    task: ScanTask,
    done: oneshot::Sender<ScanResult>,
}

/// Strictly serialized FIFO runner over a single `ScanWorker`.
///
/// Dropping the queue stops intake; tasks already queued still run.
pub struct ScanQueue {
    tx: mpsc::UnboundedSender<QueuedTask>,
}

impl ScanQueue {
    pub fn spawn<W: ScanWorker>(worker: W, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_queue(worker, rx, diagnostics));
        Self { tx }
    }

    /// Queue a task. The completion resolves once the task has run; it errors
    /// only if the worker loop is gone.
    pub fn push(&self, task: ScanTask) -> Completion {
        let (done, completion) = oneshot::channel();
        if let Err(mpsc::error::SendError(rejected)) = self.tx.send(QueuedTask { task, done }) {
            tracing::warn!("scan queue stopped, dropping {}", rejected.task.label);
        }
        completion
    }
}

async fn run_queue<W: ScanWorker>(
    mut worker: W,
    mut rx: mpsc::UnboundedReceiver<QueuedTask>,
    diagnostics: Arc<dyn DiagnosticSink>,
) {
    while let Some(QueuedTask { task, done }) = rx.recv().await {
        diagnostics.record(Diagnostic::ScanStarted {
            label: task.label.clone(),
        });

        let result = worker.run(&task).await;

        diagnostics.record(Diagnostic::ScanFinished {
            label: task.label,
            result: result.clone(),
        });
        // Nobody waiting is fine
        done.send(result).ok();

        if rx.is_empty() {
            diagnostics.record(Diagnostic::QueueDrained);
        }
    }
}
