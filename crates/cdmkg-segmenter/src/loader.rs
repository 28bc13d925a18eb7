//! Source loading and segment persistence
//!
//! Reads the converted manual (plain UTF-8 text), optionally as a folder
//! of pre-segmented `milestone{i}.txt` files, and writes segments back out
//! for inspection.

use std::path::{Path, PathBuf};

use cdmkg_core::{KgError, Result, Segment};
use serde::{Deserialize, Serialize};

/// Read the full source text
pub fn read_source(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    std::fs::read_to_string(path).map_err(|e| KgError::io(path, e))
}

/// Load pre-segmented files `{prefix}{i}.txt` for `i` in `1..`.
///
/// With `count` set, every file up to `count` must exist. Without it,
/// loading stops at the first missing index. Offsets are assigned as if
/// the files were concatenated in index order.
pub fn load_presegmented(
    dir: impl AsRef<Path>,
    prefix: &str,
    count: Option<usize>,
) -> Result<Vec<Segment>> {
    let dir = dir.as_ref();
    let mut segments = Vec::new();
    let mut offset = 0;

    for index in 1.. {
        if count.is_some_and(|n| index > n) {
            break;
        }

        let path = dir.join(format!("{prefix}{index}.txt"));
        if count.is_none() && !path.exists() {
            break;
        }

        let text = read_source(&path)?;
        let segment = Segment::new(index - 1, offset, text);
        offset = segment.end;
        segments.push(segment);
    }

    tracing::info!(
        dir = %dir.display(),
        segments = segments.len(),
        "Loaded pre-segmented text"
    );

    Ok(segments)
}

/// Entry of the `segments.json` index written next to the segment files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentIndexEntry {
    pub id: usize,
    pub start: usize,
    pub end: usize,
    pub chars: usize,
    pub file: String,
}

/// Write `segment_{id:03}.txt` per segment plus a `segments.json` index
pub fn write_segments(dir: impl AsRef<Path>, segments: &[Segment]) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).map_err(|e| KgError::io(dir, e))?;

    let mut paths = Vec::with_capacity(segments.len());
    let mut index = Vec::with_capacity(segments.len());

    for segment in segments {
        let file = format!("segment_{:03}.txt", segment.id);
        let path = dir.join(&file);
        std::fs::write(&path, &segment.text).map_err(|e| KgError::io(&path, e))?;

        index.push(SegmentIndexEntry {
            id: segment.id,
            start: segment.start,
            end: segment.end,
            chars: segment.char_len(),
            file,
        });
        paths.push(path);
    }

    let index_path = dir.join("segments.json");
    let json = serde_json::to_string_pretty(&index).map_err(|e| KgError::Other(e.into()))?;
    std::fs::write(&index_path, json).map_err(|e| KgError::io(&index_path, e))?;

    tracing::info!(dir = %dir.display(), files = paths.len(), "Segments written");
    Ok(paths)
}
