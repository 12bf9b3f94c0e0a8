//! Range orchestration across the files of a scan.
//!
//! Every file starts with one header-only range. Scanning it parses the header,
//! loads the block index, publishes both through the [`HeaderCache`], and
//! issues the file's data ranges. Each data range then decodes the blocks it
//! owns independently of the others.
//!
//! ```text
//! issue_initial_ranges ──► [0, HEADER_SIZE) ──► parse header + index
//!                                                  │  cache.get_or_insert
//!                                                  │  (already cached: nothing issued)
//!                                                  ▼
//!                             indexed? ── yes ──► every split of the file
//!                                      └─ no ───► one whole-file range, other splits complete
//! ```

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::codec::Codec;
use crate::config::ScanConfig;
use crate::error::Result;
use crate::format::{ContainerHeader, HEADER_SIZE};
use crate::index::{self, BlockIndex, IndexStore};
use crate::range::{BlockSink, DataRange, RangeReport};
use crate::source::{RangeStream, ScanRange};

/// A file to scan and the splits the planner cut it into.
#[derive(Debug, Clone)]
pub struct FileDesc {
    pub path: PathBuf,
    pub len: u64,
    pub splits: Vec<ScanRange>,
}

impl FileDesc {
    /// One split covering the whole file.
    pub fn whole(path: impl Into<PathBuf>, len: u64) -> Self {
        Self {
            path: path.into(),
            len,
            splits: vec![ScanRange::new(0, len)],
        }
    }

    /// Consecutive splits of `split_size` bytes; the last one may be shorter.
    pub fn with_split_size(path: impl Into<PathBuf>, len: u64, split_size: u64) -> Self {
        let split_size = split_size.max(1);
        let mut splits = Vec::new();
        let mut offset = 0;
        while offset < len {
            let split_len = split_size.min(len - offset);
            splits.push(ScanRange::new(offset, split_len));
            offset += split_len;
        }
        if splits.is_empty() {
            splits.push(ScanRange::new(0, 0));
        }
        Self {
            path: path.into(),
            len,
            splits,
        }
    }
}

/// Per-file header store: written once per file, then shared read-only.
#[derive(Debug, Default)]
pub struct HeaderCache {
    headers: RwLock<HashMap<PathBuf, Arc<ContainerHeader>>>,
}

impl HeaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until some range has parsed this file's header.
    pub fn get(&self, file: &Path) -> Option<Arc<ContainerHeader>> {
        self.headers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(file)
            .cloned()
    }

    /// Insert `header` unless one is already present. Returns the stored value
    /// and whether this call inserted it.
    pub fn get_or_insert(&self, file: &Path, header: ContainerHeader) -> (Arc<ContainerHeader>, bool) {
        let mut headers = self.headers.write().unwrap_or_else(PoisonError::into_inner);
        match headers.entry(file.to_path_buf()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => (Arc::clone(entry.insert(Arc::new(header))), true),
        }
    }

    pub fn len(&self) -> usize {
        self.headers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receives the ranges the orchestrator wants scanned.
pub trait RangeScheduler: Send + Sync {
    /// Queue `ranges` of `file`. `files_completed` counts files whose ranges are now all queued.
    fn issue_ranges(&self, file: &Path, ranges: Vec<ScanRange>, files_completed: usize);

    /// Report a planned split that needs no scan because another range covers it.
    fn mark_range_complete(&self, file: &Path, range: ScanRange);
}

/// FIFO [`RangeScheduler`] for in-process scans.
#[derive(Debug, Default)]
pub struct RangeQueue {
    pending: Mutex<VecDeque<(PathBuf, ScanRange)>>,
    completed: Mutex<Vec<(PathBuf, ScanRange)>>,
    files_completed: AtomicUsize,
}

impl RangeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<(PathBuf, ScanRange)> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Take every queued range at once.
    pub fn drain(&self) -> Vec<(PathBuf, ScanRange)> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn completed(&self) -> Vec<(PathBuf, ScanRange)> {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub fn files_completed(&self) -> usize {
        self.files_completed.load(Ordering::SeqCst)
    }
}

impl RangeScheduler for RangeQueue {
    fn issue_ranges(&self, file: &Path, ranges: Vec<ScanRange>, files_completed: usize) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.extend(ranges.into_iter().map(|r| (file.to_path_buf(), r)));
        self.files_completed.fetch_add(files_completed, Ordering::SeqCst);
    }

    fn mark_range_complete(&self, file: &Path, range: ScanRange) {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((file.to_path_buf(), range));
    }
}

/// Drives header-only and data ranges for a set of files.
pub struct RangeOrchestrator<'a> {
    config: ScanConfig,
    codec: Arc<dyn Codec>,
    cache: &'a HeaderCache,
    indexes: &'a dyn IndexStore,
    scheduler: &'a dyn RangeScheduler,
}

impl<'a> RangeOrchestrator<'a> {
    pub fn new(
        config: ScanConfig,
        codec: Arc<dyn Codec>,
        cache: &'a HeaderCache,
        indexes: &'a dyn IndexStore,
        scheduler: &'a dyn RangeScheduler,
    ) -> Self {
        Self {
            config,
            codec,
            cache,
            indexes,
            scheduler,
        }
    }

    pub fn config(&self) -> ScanConfig {
        self.config
    }

    /// Issue the header-only range of every file. No file is fully queued yet.
    pub fn issue_initial_ranges(&self, files: &[FileDesc]) {
        for file in files {
            let header_len = (HEADER_SIZE as u64).min(file.len);
            self.scheduler
                .issue_ranges(&file.path, vec![ScanRange::new(0, header_len)], 0);
        }
    }

    /// Scan one range of `file`, writing decoded bytes to `sink`.
    ///
    /// Without a cached header this is the file's header-only range. Header
    /// errors are returned; block errors are handled per the error policy.
    pub fn scan_range<S, K>(&self, file: &FileDesc, stream: S, sink: &mut K) -> Result<RangeReport>
    where
        S: RangeStream,
        K: BlockSink + ?Sized,
    {
        match self.cache.get(&file.path) {
            None => self.scan_header(file, stream),
            Some(header) => self.open_data_range(&file.path, header, stream)?.drain_into(sink),
        }
    }

    /// Open a data range for a file whose header is already known.
    pub fn open_data_range<S: RangeStream>(
        &self,
        file: &Path,
        header: Arc<ContainerHeader>,
        stream: S,
    ) -> Result<DataRange<S>> {
        DataRange::open(file, header, Arc::clone(&self.codec), self.config, stream)
    }

    fn scan_header<S: RangeStream>(&self, file: &FileDesc, mut stream: S) -> Result<RangeReport> {
        let span = stream.read_bytes(HEADER_SIZE)?;
        let mut header = ContainerHeader::parse(span).map_err(|e| {
            tracing::warn!(file = %file.path.display(), error = %e, "invalid lzo header information");
            e
        })?;

        header.block_offsets = match index::read_index(self.indexes, &file.path) {
            Ok(offsets) => offsets,
            Err(e) => {
                tracing::warn!(
                    file = %file.path.display(),
                    error = %e,
                    "index unusable, scanning the file unsplit"
                );
                BlockIndex::default()
            }
        };

        let (header, inserted) = self.cache.get_or_insert(&file.path, header);
        if !inserted {
            tracing::debug!(file = %file.path.display(), "lzo header already cached");
            return Ok(RangeReport::header_only());
        }
        tracing::debug!(
            file = %file.path.display(),
            header_size = header.header_size,
            indexed_blocks = header.block_offsets.len(),
            "lzo header cached"
        );
        self.issue_file_ranges(file, &header);
        Ok(RangeReport::header_only())
    }

    /// Queue the data ranges of a file whose header has been parsed.
    pub fn issue_file_ranges(&self, file: &FileDesc, header: &ContainerHeader) {
        if header.is_splittable() {
            self.scheduler.issue_ranges(&file.path, file.splits.clone(), 1);
            return;
        }

        let mut zero_offset_range = None;
        for split in &file.splits {
            if split.offset != 0 {
                self.scheduler.mark_range_complete(&file.path, *split);
                continue;
            }
            zero_offset_range = Some(ScanRange::new(0, file.len));
        }
        if let Some(range) = zero_offset_range {
            self.scheduler.issue_ranges(&file.path, vec![range], 1);
        }
    }
}
