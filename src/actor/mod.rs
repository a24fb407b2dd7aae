pub mod queue;

pub use queue::{Completion, ScanQueue, ScanReport, ScanResult, ScanTask, ScanWorker};
