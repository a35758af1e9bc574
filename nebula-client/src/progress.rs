//! Transfer progress shared between transfer tasks and status pollers
//!
//! Entries live while their transfer runs. A finished entry is kept at 1.0
//! only while it is among the `retain_finished` most recent completions;
//! failed and cancelled transfers drop theirs at once.

use nebula_network::ProgressSink;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct ProgressCell {
    total: u64,
    current: AtomicU64,
}

#[derive(Debug, Default)]
struct Cells {
    active: HashMap<String, Arc<ProgressCell>>,
    /// Completed paths, oldest first
    finished: VecDeque<String>,
}

impl Cells {
    fn forget_finished(&mut self, path: &str) {
        self.finished.retain(|p| p != path);
    }
}

/// Bytes moved per file path, readable while transfers run
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    cells: Arc<RwLock<Cells>>,
    retain_finished: usize,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the last `count` completed entries visible at 1.0
    pub fn retaining_finished(mut self, count: usize) -> Self {
        self.retain_finished = count;
        self
    }

    /// Begin tracking `path`, expecting `total` bytes overall
    pub fn start(&self, path: impl Into<String>, total: u64) -> FileProgress {
        let path = path.into();
        let cell = Arc::new(ProgressCell {
            total,
            current: AtomicU64::new(0),
        });
        let mut cells = self.cells.write();
        cells.forget_finished(&path);
        cells.active.insert(path, Arc::clone(&cell));
        FileProgress { cell }
    }

    /// Mark `path` done; its entry is evicted once enough newer ones finish
    pub fn complete(&self, path: &str, handle: &FileProgress) {
        handle.finish();
        let mut cells = self.cells.write();
        cells.forget_finished(path);
        cells.finished.push_back(path.to_string());
        while cells.finished.len() > self.retain_finished {
            if let Some(evicted) = cells.finished.pop_front() {
                cells.active.remove(&evicted);
            }
        }
    }

    /// Stop tracking `path`
    pub fn remove(&self, path: &str) {
        let mut cells = self.cells.write();
        cells.forget_finished(path);
        cells.active.remove(path);
    }

    /// Completion ratio (0.0 to 1.0) of each requested path that is tracked
    pub fn progress(&self, paths: &[String]) -> HashMap<String, f64> {
        let cells = self.cells.read();
        paths
            .iter()
            .filter_map(|path| cells.active.get(path).map(|cell| (path.clone(), ratio(cell))))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cells.read().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.read().active.is_empty()
    }
}

fn ratio(cell: &ProgressCell) -> f64 {
    if cell.total == 0 {
        return 1.0;
    }
    (cell.current.load(Ordering::Relaxed) as f64 / cell.total as f64).min(1.0)
}

/// Handle for one tracked file
#[derive(Debug, Clone)]
pub struct FileProgress {
    cell: Arc<ProgressCell>,
}

impl FileProgress {
    /// Add bytes completed
    pub fn advance(&self, bytes: u64) {
        self.cell.current.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Mark the file as fully transferred
    pub fn finish(&self) {
        self.cell.current.store(self.cell.total, Ordering::Relaxed);
    }

    pub fn current(&self) -> u64 {
        self.cell.current.load(Ordering::Relaxed)
    }

    /// Sink for a single piece transfer; reports are cumulative per piece, so
    /// only the increase since the previous report is added.
    pub fn piece_sink(&self) -> PieceProgress {
        PieceProgress {
            file: self.clone(),
            last: AtomicU64::new(0),
        }
    }
}

/// Adapts a piece's cumulative byte count onto its file's counter
#[derive(Debug)]
pub struct PieceProgress {
    file: FileProgress,
    last: AtomicU64,
}

impl ProgressSink for PieceProgress {
    fn report(&self, bytes: u64) {
        let previous = self.last.swap(bytes, Ordering::Relaxed);
        self.file.advance(bytes.saturating_sub(previous));
    }
}
