// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write overlay over a read-only block image.
//!
//! An [`OverlayImage`] pairs a pristine original image with a writable
//! overlay of identical size. The logical address space is carved into
//! fixed-size groups and a packed bitmap records, per group, which image
//! holds the valid bytes. Writes land in the overlay; before the first
//! write into a group, the group bytes the payload does not cover are
//! promoted (copied) from the original so nothing is lost once the group
//! is routed to the overlay. Reads walk the requested range in maximal
//! runs of same-state groups and fetch each run from the owning image in
//! a single call.

mod bitmap;
mod layout;
mod stats;

use std::cmp::min;
use std::io::{self, Read, Seek, SeekFrom, Write};

use libc::EINVAL;
use log::debug;
use remain::sorted;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::overlay::bitmap::{DirtyBitmap, GroupState};
pub use crate::overlay::layout::OverlayLayout;
pub use crate::overlay::stats::OverlayStats;
use crate::{ImageBackend, SECTOR_SIZE};

#[sorted]
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to extend the overlay image")]
    ExtendingOverlay(#[source] io::Error),
    #[error("Failed to get image size")]
    GettingImageSize(#[source] io::Error),
    #[error("Group count {group_count} exceeds bitmap capacity of {max_groups} groups")]
    GroupCountOverflow { group_count: u64, max_groups: u64 },
    #[error("Group index {group} out of bounds ({group_count} groups)")]
    GroupOutOfBounds { group: u64, group_count: u64 },
    #[error("Bitmap capacity must be non-zero")]
    InvalidBitmapCapacity,
    #[error("Block size must be non-zero")]
    InvalidBlockSize,
    #[error("Scratch capacity must be non-zero")]
    InvalidScratchCapacity,
    #[error("Offset {offset} out of bounds (image size {size})")]
    OffsetOutOfBounds { offset: u64, size: u64 },
    #[error("Failed to read from the original image")]
    ReadingOriginal(#[source] io::Error),
    #[error("Failed to read from the overlay image")]
    ReadingOverlay(#[source] io::Error),
    #[error("Failed to seek image")]
    SeekingImage(#[source] io::Error),
    #[error("Short read while promoting: requested {requested}, read {read}")]
    ShortPromotionRead { requested: usize, read: usize },
    #[error("Short write to the overlay image: requested {requested}, written {written}")]
    ShortWrite { requested: usize, written: usize },
    #[error("Failed to write to the overlay image")]
    WritingOverlay(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Caller-tunable sizing for an [`OverlayImage`].
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct OverlayOptions {
    /// Upper bound, in bytes, for the in-memory dirty bitmap. The group
    /// size is derived from this: the smallest group size whose bitmap
    /// fits the capacity.
    pub bitmap_capacity: usize,
    /// Capacity, in bytes, of the scratch buffer promotion copies move
    /// through. Bounds peak memory regardless of group size.
    pub scratch_capacity: usize,
    /// Logical block size in bytes.
    pub block_size: u32,
}

impl Default for OverlayOptions {
    fn default() -> Self {
        OverlayOptions {
            bitmap_capacity: 1024,
            scratch_capacity: 2048,
            block_size: SECTOR_SIZE as u32,
        }
    }
}

/// A read-only original image and a writable overlay presented as one
/// mutable device.
///
/// Absolute-range I/O goes through [`OverlayImage::read_at`] and
/// [`OverlayImage::write_at`]; the [`Read`], [`Write`] and [`Seek`] impls
/// are thin cursor-tracking wrappers over the same operations.
pub struct OverlayImage<B> {
    original: B,
    overlay: B,
    layout: OverlayLayout,
    bitmap: DirtyBitmap,
    scratch: Vec<u8>,
    current_offset: u64,
    stats: OverlayStats,
}

impl<B: ImageBackend> OverlayImage<B> {
    /// Builds an overlay store over `original`, with `overlay` receiving
    /// all writes. The overlay is sparse-extended to the original's size
    /// so that offsets in the two images line up.
    pub fn new(original: B, mut overlay: B, opts: &OverlayOptions) -> Result<Self> {
        if opts.scratch_capacity == 0 {
            return Err(Error::InvalidScratchCapacity);
        }
        let image_size = original.size().map_err(Error::GettingImageSize)?;
        let layout = OverlayLayout::new(image_size, opts.block_size, opts.bitmap_capacity)?;

        // Writing a single byte at the tail extends the overlay without
        // materializing it on filesystems that support sparse files.
        let overlay_size = overlay.size().map_err(Error::GettingImageSize)?;
        if overlay_size < image_size {
            overlay
                .seek(SeekFrom::Start(image_size - 1))
                .map_err(Error::ExtendingOverlay)?;
            let written = overlay.write(&[0u8]).map_err(Error::ExtendingOverlay)?;
            if written != 1 {
                return Err(Error::ShortWrite {
                    requested: 1,
                    written,
                });
            }
        }

        debug!(
            "overlay image: {} bytes, {} groups of {} blocks ({} bytes), bitmap {} bytes",
            image_size,
            layout.group_count(),
            layout.group_blocks(),
            layout.group_bytes(),
            layout.bitmap_bytes()
        );

        Ok(OverlayImage {
            original,
            overlay,
            bitmap: DirtyBitmap::new(layout.group_count()),
            scratch: vec![0u8; opts.scratch_capacity],
            layout,
            current_offset: 0,
            stats: OverlayStats::default(),
        })
    }

    /// Size of the logical device in bytes.
    pub fn virtual_size(&self) -> u64 {
        self.layout.image_size()
    }

    pub fn layout(&self) -> &OverlayLayout {
        &self.layout
    }

    /// Which image currently owns `group`.
    pub fn group_state(&self, group: u64) -> Result<GroupState> {
        self.bitmap.state(group)
    }

    /// Snapshot of the transfer counters.
    pub fn stats(&self) -> OverlayStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Reads up to `buf.len()` bytes at `address`, routing each run of
    /// same-state groups to the image that owns it.
    ///
    /// The count is clamped at the end of the image. A short read from an
    /// underlying image ends the request; the bytes transferred so far are
    /// returned.
    pub fn read_at(&mut self, address: u64, buf: &mut [u8]) -> Result<usize> {
        if address > self.virtual_size() {
            return Err(Error::OffsetOutOfBounds {
                offset: address,
                size: self.virtual_size(),
            });
        }
        self.stats.read_requested_bytes += buf.len() as u64;
        let count = self.limit_range_file(address, buf.len());

        let mut nread = 0usize;
        while nread < count {
            let curr_addr = address + nread as u64;
            let state = self.bitmap.state(self.layout.group_of(curr_addr))?;
            let chunk = self.span_same_state(curr_addr, count - nread, state)?;

            let n = match state {
                GroupState::Dirty => {
                    self.overlay
                        .seek(SeekFrom::Start(curr_addr))
                        .map_err(Error::SeekingImage)?;
                    self.overlay
                        .read(&mut buf[nread..nread + chunk])
                        .map_err(Error::ReadingOverlay)?
                }
                GroupState::Original => {
                    self.original
                        .seek(SeekFrom::Start(curr_addr))
                        .map_err(Error::SeekingImage)?;
                    self.original
                        .read(&mut buf[nread..nread + chunk])
                        .map_err(Error::ReadingOriginal)?
                }
            };
            match state {
                GroupState::Dirty => self.stats.read_overlay_bytes += n as u64,
                GroupState::Original => self.stats.read_original_bytes += n as u64,
            }
            nread += n;
            // A short read means end-of-resource; hand back what we have.
            if n < chunk {
                break;
            }
        }
        Ok(nread)
    }

    /// Writes `buf` to the overlay at `address`, promoting the bytes of
    /// the two boundary groups that the payload does not cover, then marks
    /// every touched group dirty.
    ///
    /// The count is clamped at the end of the image. The dirty bits flip
    /// only after all promotions and the payload write succeed, so a
    /// failed write is never observable through the store.
    pub fn write_at(&mut self, address: u64, buf: &[u8]) -> Result<usize> {
        if address > self.virtual_size() {
            return Err(Error::OffsetOutOfBounds {
                offset: address,
                size: self.virtual_size(),
            });
        }
        self.stats.write_requested_bytes += buf.len() as u64;
        let count = self.limit_range_file(address, buf.len());
        if count == 0 {
            return Ok(0);
        }
        let end = address + count as u64;
        let first_group = self.layout.group_of(address);
        let last_group = self.layout.group_of(end - 1);

        // Rescue the boundary bytes before anything lands in the overlay.
        // Interior groups are fully covered by the payload and need no
        // copy.
        if self.bitmap.state(first_group)? == GroupState::Original {
            let group_start = self.layout.group_start(first_group);
            if address > group_start {
                let copied = self.promote(group_start, address)?;
                self.stats.promotion_read_bytes += copied;
            }
        }
        if self.bitmap.state(last_group)? == GroupState::Original {
            let group_end = self.layout.group_end(last_group);
            if end < group_end {
                let copied = self.promote(end, group_end)?;
                self.stats.promotion_read_bytes += copied;
            }
        }

        self.overlay
            .seek(SeekFrom::Start(address))
            .map_err(Error::SeekingImage)?;
        let written = self
            .overlay
            .write(&buf[..count])
            .map_err(Error::WritingOverlay)?;
        if written < count {
            // The groups stay clean, so no read ever routes to the
            // partial payload.
            return Err(Error::ShortWrite {
                requested: count,
                written,
            });
        }
        self.stats.write_overlay_bytes += count as u64;

        for group in first_group..=last_group {
            self.bitmap.set(group, GroupState::Dirty)?;
        }
        Ok(count)
    }

    // Copies `[start, end)` from the original into the overlay at the
    // identical offsets, one scratch-buffer chunk at a time. The range
    // must not straddle a group boundary: the caller flips the dirty bit
    // per group, and a copy crossing groups would tie their consistency
    // together.
    fn promote(&mut self, start: u64, end: u64) -> Result<u64> {
        debug_assert!(start < end);
        debug_assert_eq!(self.layout.group_of(start), self.layout.group_of(end - 1));

        self.original
            .seek(SeekFrom::Start(start))
            .map_err(Error::SeekingImage)?;
        self.overlay
            .seek(SeekFrom::Start(start))
            .map_err(Error::SeekingImage)?;

        let mut copied = 0u64;
        while start + copied < end {
            let chunk = min(self.scratch.len() as u64, end - start - copied) as usize;
            let read = self
                .original
                .read(&mut self.scratch[..chunk])
                .map_err(Error::ReadingOriginal)?;
            if read < chunk {
                return Err(Error::ShortPromotionRead {
                    requested: chunk,
                    read,
                });
            }
            let written = self
                .overlay
                .write(&self.scratch[..chunk])
                .map_err(Error::WritingOverlay)?;
            if written < chunk {
                return Err(Error::ShortWrite {
                    requested: chunk,
                    written,
                });
            }
            copied += chunk as u64;
        }
        Ok(copied)
    }

    // Extends a chunk forward from `address` while consecutive groups
    // share `state`, bounded by `count`. This is what keeps a read across
    // k same-state groups down to a single underlying call.
    fn span_same_state(&self, address: u64, count: usize, state: GroupState) -> Result<usize> {
        let end = address + count as u64;
        let mut span_end = self.layout.group_end(self.layout.group_of(address));
        while span_end < end && self.bitmap.state(self.layout.group_of(span_end))? == state {
            span_end = self.layout.group_end(self.layout.group_of(span_end));
        }
        Ok((min(span_end, end) - address) as usize)
    }

    // Limits the range so that it doesn't exceed the addressable size.
    fn limit_range_file(&self, address: u64, count: usize) -> usize {
        if address.checked_add(count as u64).is_none() || address > self.virtual_size() {
            return 0;
        }
        min(count as u64, self.virtual_size() - address) as usize
    }
}

impl<B: ImageBackend> Read for OverlayImage<B> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let nread = self
            .read_at(self.current_offset, buf)
            .map_err(io::Error::other)?;
        self.current_offset += nread as u64;
        Ok(nread)
    }
}

impl<B: ImageBackend> Write for OverlayImage<B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let nwritten = self
            .write_at(self.current_offset, buf)
            .map_err(io::Error::other)?;
        self.current_offset += nwritten as u64;
        Ok(nwritten)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.overlay.flush()
    }
}

impl<B: ImageBackend> Seek for OverlayImage<B> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_offset: Option<u64> = match pos {
            SeekFrom::Start(off) => Some(off),
            SeekFrom::End(off) => {
                if off < 0 {
                    0i64.checked_sub(off)
                        .and_then(|increment| self.virtual_size().checked_sub(increment as u64))
                } else {
                    self.virtual_size().checked_add(off as u64)
                }
            }
            SeekFrom::Current(off) => {
                if off < 0 {
                    0i64.checked_sub(off)
                        .and_then(|increment| self.current_offset.checked_sub(increment as u64))
                } else {
                    self.current_offset.checked_add(off as u64)
                }
            }
        };

        if let Some(o) = new_offset {
            if o <= self.virtual_size() {
                self.current_offset = o;
                return Ok(o);
            }
        }
        Err(io::Error::from_raw_os_error(EINVAL))
    }
}
