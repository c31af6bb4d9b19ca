//! Segment file naming and lifecycle: the byte-addressable backing store
//! for one log's bytes, `SEGMENT_SIZE` at a time. Each segment file is
//! mapped with `mmap-rs`, one file per `(logno, segno)`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use mmap_rs::{Mmap, MmapFlags, MmapMut, MmapOptions};

use crate::layout::SEGMENT_SIZE;

const ZERO_CHUNK: usize = 1 << 20;

/// Path of the segment file holding `segno` of log `logno`, under `base_dir`.
pub fn segment_path(base_dir: &Path, logno: u32, segno: u64) -> PathBuf {
    base_dir
        .join(format!("{logno:06}"))
        .join(format!("{segno:010}.seg"))
}

/// Creates a new segment file, fully zero-filled and fsynced, along with
/// its containing directory entry. Safe to call again on an existing file
/// of the right size (idempotent create-or-open).
///
/// A segment must be durable on disk before the log's `end` is advanced
/// past it — otherwise a crash could leave `end` pointing past a segment
/// that recovery can't find.
pub fn create_segment(base_dir: &Path, logno: u32, segno: u64) -> Result<()> {
    let dir = base_dir.join(format!("{logno:06}"));
    fs::create_dir_all(&dir)
        .with_context(|| format!("create log directory {}", dir.display()))?;

    let path = segment_path(base_dir, logno, segno);

    if let Ok(meta) = fs::metadata(&path)
        && meta.len() == SEGMENT_SIZE
    {
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .with_context(|| format!("create segment file {}", path.display()))?;

    let zeros = vec![0u8; ZERO_CHUNK];
    let mut remaining = SEGMENT_SIZE;
    while remaining > 0 {
        let take = remaining.min(ZERO_CHUNK as u64) as usize;
        file.write_all(&zeros[..take])
            .with_context(|| format!("zero-fill segment file {}", path.display()))?;
        remaining -= take as u64;
    }
    file.sync_all()
        .with_context(|| format!("fsync segment file {}", path.display()))?;

    fsync_dir(&dir).with_context(|| format!("fsync log directory {}", dir.display()))?;

    Ok(())
}

/// Removes a segment file that has fallen behind the discard horizon.
pub fn unlink_segment(base_dir: &Path, logno: u32, segno: u64) -> Result<()> {
    let path = segment_path(base_dir, logno, segno);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("unlink segment file {}", path.display())),
    }
}

pub fn open_mmap_ro(base_dir: &Path, logno: u32, segno: u64) -> Result<Mmap> {
    let path = segment_path(base_dir, logno, segno);
    let file =
        File::open(&path).with_context(|| format!("open segment file {}", path.display()))?;

    let mmap = unsafe {
        MmapOptions::new(SEGMENT_SIZE as usize)
            .context("mmap options for segment")?
            .with_file(&file, 0)
            .with_flags(MmapFlags::SHARED)
            .map()
            .with_context(|| format!("mmap segment file {}", path.display()))?
    };

    Ok(mmap)
}

pub fn open_mmap_rw(base_dir: &Path, logno: u32, segno: u64) -> Result<MmapMut> {
    let path = segment_path(base_dir, logno, segno);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open segment file {}", path.display()))?;

    let mmap = unsafe {
        MmapOptions::new(SEGMENT_SIZE as usize)
            .context("mmap options for segment")?
            .with_file(&file, 0)
            .with_flags(MmapFlags::SHARED)
            .map_mut()
            .with_context(|| format!("mmap segment file {}", path.display()))?
    };

    Ok(mmap)
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
