use crate::error::Result;
use crate::index::BlockIndex;
use crate::source::{RangeStream, ScanRange};

/// Where the next block boundary lies relative to a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSearch {
    /// The first block start after the current offset, inside the range.
    Found(u64),
    /// The current offset is at or past the last indexed block start.
    PastLastBlock,
    /// The next block start is beyond the range end; another range owns it.
    NotInRange(u64),
}

impl BlockSearch {
    pub fn offset(self) -> Option<u64> {
        match self {
            BlockSearch::Found(offset) => Some(offset),
            _ => None,
        }
    }
}

/// Find the first indexed block start strictly after `current`.
///
/// A range owns the block starts in `(range.offset, range.end()]`, so a block
/// starting exactly on a split point is decoded by the range ending there and
/// skipped by the range starting there.
pub fn locate(index: &BlockIndex, current: u64, range: ScanRange) -> BlockSearch {
    match index.first_after(current) {
        None => BlockSearch::PastLastBlock,
        Some(offset) if offset > range.end() => BlockSearch::NotInRange(offset),
        Some(offset) => BlockSearch::Found(offset),
    }
}

/// Advance `stream` to the first block boundary it is responsible for.
///
/// Returns `false` without moving when the range holds no block start.
pub fn find_first_block<S: RangeStream + ?Sized>(
    index: &BlockIndex,
    stream: &mut S,
) -> Result<bool> {
    let current = stream.file_offset();
    match locate(index, current, stream.scan_range()) {
        BlockSearch::Found(offset) => {
            stream.skip(offset - current)?;
            tracing::trace!(from = current, block = offset, "located first block");
            Ok(true)
        }
        BlockSearch::PastLastBlock | BlockSearch::NotInRange(_) => Ok(false),
    }
}

/// Advance `stream` to the first block start at or after `from` that the range owns.
///
/// Used to recover from a bad block: `from` is just past the bad block's
/// start, so the block that immediately follows it is not lost even when the
/// bad block was read to its end. Positions behind the stream are clamped to
/// the stream. Returns `false` without moving when there is no such block.
pub fn skip_to_block<S: RangeStream + ?Sized>(
    index: &BlockIndex,
    stream: &mut S,
    from: u64,
) -> Result<bool> {
    let current = stream.file_offset();
    match index.first_at_or_after(from.max(current)) {
        Some(offset) if offset <= stream.scan_range().end() => {
            stream.skip(offset - current)?;
            tracing::trace!(from = current, block = offset, "resynchronized on block");
            Ok(true)
        }
        _ => Ok(false),
    }
}
