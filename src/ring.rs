//! Shared-memory audio ring buffers
//!
//! A fixed-capacity circular buffer of interleaved f32 audio frames, mapped
//! from a file under `/tmp` so the bridge, the engine helper, and the virtual
//! audio device all see the same region. Exactly one writer identity advances
//! `write_index` and exactly one reader identity advances `read_index`; the
//! acquire/release pairing on those two indices is the only synchronization.
//! Writes and reads never block: a full ring drops the excess, an empty ring
//! returns zero frames.

// The only unsafe in the crate: raw views over the shared mapping.
#![allow(unsafe_code)]

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;

use crate::{Error, Result};

/// Header magic, "SARB" in ASCII
pub const RING_MAGIC: u32 = 0x5341_5242;

/// Header layout version
pub const RING_VERSION: u32 = 1;

const HEADER_SIZE: usize = size_of::<RingHeader>();

/// Fixed-layout header at the start of the mapping.
///
/// All fields are atomics because the region is shared between processes;
/// the shape fields (magic through capacity) are written once at
/// initialization and only ever read afterwards.
#[repr(C)]
struct RingHeader {
    magic: AtomicU32,
    version: AtomicU32,
    channels: AtomicU32,
    capacity_frames: AtomicU32,
    write_index: AtomicU32,
    read_index: AtomicU32,
}

/// One shared-memory audio ring.
///
/// Closed (unopened) rings accept every operation and report zero frames
/// moved, mirroring the lossy non-blocking contract of the open ring.
pub struct AudioRing {
    mmap: Option<MmapMut>,
    channels: u32,
    capacity_frames: u32,
    path: Option<PathBuf>,
}

/// Map a ring name to its backing file path: strip a leading separator,
/// flatten the rest, and append the ring suffix.
#[must_use]
pub fn backing_path(name: &str) -> PathBuf {
    let trimmed = name.strip_prefix('/').unwrap_or(name);
    let flat = trimmed.replace('/', "_");
    PathBuf::from(format!("/tmp/{flat}.ring"))
}

impl AudioRing {
    /// Create a closed ring
    #[must_use]
    pub fn new() -> Self {
        Self {
            mmap: None,
            channels: 0,
            capacity_frames: 0,
            path: None,
        }
    }

    /// Open (and possibly initialize) the ring's backing file.
    ///
    /// With `create = true` the header is unconditionally reinitialized and
    /// all sample data zeroed (first-writer-wins; the bridge is the sole
    /// initializer). With `create = false` the file must already exist; a
    /// stored header whose magic, version, channels, or capacity mismatch
    /// the requested shape is also reinitialized.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty name, a zero shape, or any filesystem
    /// or mapping failure.
    pub fn open(
        &mut self,
        name: &str,
        create: bool,
        channels: u32,
        capacity_frames: u32,
    ) -> Result<()> {
        self.close();

        if name.is_empty() {
            return Err(Error::Ring("ring name is empty".to_string()));
        }
        if channels == 0 || capacity_frames == 0 {
            return Err(Error::Ring(format!(
                "invalid ring shape: {channels} channels x {capacity_frames} frames"
            )));
        }

        let path = backing_path(name);
        let size = mapping_size(channels, capacity_frames);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
            .map_err(|e| Error::Ring(format!("cannot open {}: {e}", path.display())))?;

        // Both the unprivileged helper and the audio daemon map this file,
        // so force permissive mode regardless of umask.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(std::fs::Permissions::from_mode(0o666));
        }

        file.set_len(size as u64)
            .map_err(|e| Error::Ring(format!("cannot size {}: {e}", path.display())))?;

        // SAFETY: the file stays open for the lifetime of the mapping and is
        // sized above; concurrent mappers follow the SPSC index contract.
        let mut mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|e| Error::Ring(format!("cannot map {}: {e}", path.display())))?
        };

        initialize_if_needed(&mut mmap, create, channels, capacity_frames);

        self.mmap = Some(mmap);
        self.channels = channels;
        self.capacity_frames = capacity_frames;
        self.path = Some(path);
        Ok(())
    }

    /// Unmap the ring; the backing file is left in place for other mappers
    pub fn close(&mut self) {
        self.mmap = None;
        self.channels = 0;
        self.capacity_frames = 0;
        self.path = None;
    }

    /// Write interleaved frames, returning how many frames were accepted.
    ///
    /// `frames.len()` must be a multiple of the channel count; trailing
    /// partial frames are ignored. Frames beyond the free space are dropped.
    pub fn write(&mut self, frames: &[f32]) -> usize {
        let channels = self.channels as usize;
        if channels == 0 || frames.len() < channels {
            return 0;
        }
        let Some(mmap) = self.mmap.as_mut() else {
            return 0;
        };

        let capacity = self.capacity_frames;
        let count = (frames.len() / channels) as u32;

        let (write, read) = {
            let header = header_of(mmap);
            (
                header.write_index.load(Ordering::Acquire),
                header.read_index.load(Ordering::Acquire),
            )
        };
        let used = write.wrapping_sub(read);
        let free = capacity - used.min(capacity);
        let to_write = count.min(free);
        if to_write == 0 {
            return 0;
        }

        {
            let data = data_of(mmap);
            for frame in 0..to_write {
                let src = frame as usize * channels;
                let dst = ((write.wrapping_add(frame)) % capacity) as usize * channels;
                data[dst..dst + channels].copy_from_slice(&frames[src..src + channels]);
            }
        }

        header_of(mmap)
            .write_index
            .store(write.wrapping_add(to_write), Ordering::Release);
        to_write as usize
    }

    /// Read interleaved frames into `frames`, returning how many frames were
    /// copied. Returns 0 immediately when the ring is empty or closed.
    pub fn read(&mut self, frames: &mut [f32]) -> usize {
        let channels = self.channels as usize;
        if channels == 0 || frames.len() < channels {
            return 0;
        }
        let Some(mmap) = self.mmap.as_mut() else {
            return 0;
        };

        let capacity = self.capacity_frames;
        let count = (frames.len() / channels) as u32;

        let (write, read) = {
            let header = header_of(mmap);
            (
                header.write_index.load(Ordering::Acquire),
                header.read_index.load(Ordering::Acquire),
            )
        };
        let available = write.wrapping_sub(read).min(capacity);
        let to_read = count.min(available);
        if to_read == 0 {
            return 0;
        }

        {
            let data = data_of(mmap);
            for frame in 0..to_read {
                let src = ((read.wrapping_add(frame)) % capacity) as usize * channels;
                let dst = frame as usize * channels;
                frames[dst..dst + channels].copy_from_slice(&data[src..src + channels]);
            }
        }

        header_of(mmap)
            .read_index
            .store(read.wrapping_add(to_read), Ordering::Release);
        to_read as usize
    }

    /// Channel count of the open ring, 0 when closed
    #[must_use]
    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// Capacity in frames of the open ring, 0 when closed
    #[must_use]
    pub fn capacity_frames(&self) -> u32 {
        self.capacity_frames
    }

    /// Whether the ring currently holds a mapping
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.mmap.is_some()
    }

    /// Backing file path of the open ring
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Default for AudioRing {
    fn default() -> Self {
        Self::new()
    }
}

fn mapping_size(channels: u32, capacity_frames: u32) -> usize {
    HEADER_SIZE + size_of::<f32>() * channels as usize * capacity_frames as usize
}

fn header_of(mmap: &MmapMut) -> &RingHeader {
    debug_assert!(mmap.len() >= HEADER_SIZE);
    // SAFETY: the mapping is at least HEADER_SIZE bytes and RingHeader is a
    // repr(C) struct of AtomicU32 with alignment 4, which page-aligned
    // mappings always satisfy.
    unsafe { &*mmap.as_ptr().cast::<RingHeader>() }
}

fn data_of(mmap: &mut MmapMut) -> &mut [f32] {
    let len = (mmap.len() - HEADER_SIZE) / size_of::<f32>();
    // SAFETY: the sample region starts right after the header, is within the
    // mapping, and only ever holds plain f32 data. The returned slice does
    // not overlap the header referenced by `header_of`.
    unsafe {
        std::slice::from_raw_parts_mut(mmap.as_mut_ptr().add(HEADER_SIZE).cast::<f32>(), len)
    }
}

fn initialize_if_needed(mmap: &mut MmapMut, create: bool, channels: u32, capacity_frames: u32) {
    let matches = {
        let header = header_of(mmap);
        header.magic.load(Ordering::Acquire) == RING_MAGIC
            && header.version.load(Ordering::Acquire) == RING_VERSION
            && header.channels.load(Ordering::Acquire) == channels
            && header.capacity_frames.load(Ordering::Acquire) == capacity_frames
    };
    if !create && matches {
        return;
    }

    mmap.fill(0);
    let header = header_of(mmap);
    header.channels.store(channels, Ordering::Relaxed);
    header.capacity_frames.store(capacity_frames, Ordering::Relaxed);
    header.write_index.store(0, Ordering::Relaxed);
    header.read_index.store(0, Ordering::Relaxed);
    header.version.store(RING_VERSION, Ordering::Relaxed);
    // Attachers poll for valid magic, so publish it last.
    header.magic.store(RING_MAGIC, Ordering::Release);
}
