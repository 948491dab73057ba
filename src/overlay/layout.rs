// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Pure arithmetic mapping between byte offsets and copy-on-write groups,
//! and the one-time sizing derivation performed at store construction.

use std::cmp::min;

use super::{Error, Result};

/// Immutable geometry of an overlay pair.
///
/// The logical address space is carved into `group_count` groups of
/// `group_blocks` blocks each. The group size is the smallest that lets a
/// bitmap of at most `bitmap_capacity` bytes address every block, so the
/// actual bitmap is usually a little smaller than the capacity. The final
/// group is clamped short when the image size is not a multiple of the
/// group size.
#[derive(Clone, Copy, Debug)]
pub struct OverlayLayout {
    image_size: u64,
    block_size: u32,
    group_blocks: u64,
    group_bytes: u64,
    group_count: u64,
}

impl OverlayLayout {
    pub fn new(image_size: u64, block_size: u32, bitmap_capacity: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::InvalidBlockSize);
        }
        if bitmap_capacity == 0 {
            return Err(Error::InvalidBitmapCapacity);
        }

        // Round up so the bytes of a trailing partial block stay
        // addressable; group_end() clamps the final group instead.
        let total_blocks = image_size.div_ceil(block_size as u64);
        let max_groups = bitmap_capacity as u64 * 8;
        let group_blocks = total_blocks.div_ceil(max_groups).max(1);
        let group_count = total_blocks.div_ceil(group_blocks);
        if group_count > max_groups {
            return Err(Error::GroupCountOverflow {
                group_count,
                max_groups,
            });
        }

        Ok(OverlayLayout {
            image_size,
            block_size,
            group_blocks,
            group_bytes: group_blocks * block_size as u64,
            group_count,
        })
    }

    /// Group containing the byte at `offset`.
    pub fn group_of(&self, offset: u64) -> u64 {
        offset / self.group_bytes
    }

    /// First byte offset of `group`.
    pub fn group_start(&self, group: u64) -> u64 {
        group * self.group_bytes
    }

    /// One past the last byte offset of `group`, clamped to the image size
    /// for the short final group.
    pub fn group_end(&self, group: u64) -> u64 {
        min(self.group_start(group) + self.group_bytes, self.image_size)
    }

    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn group_blocks(&self) -> u64 {
        self.group_blocks
    }

    pub fn group_bytes(&self) -> u64 {
        self.group_bytes
    }

    pub fn group_count(&self) -> u64 {
        self.group_count
    }

    /// Bytes needed to hold one bit per group.
    pub fn bitmap_bytes(&self) -> usize {
        self.group_count.div_ceil(8) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_group_size_from_bitmap_capacity() {
        // 81920 blocks of 512 bytes against a 1 KiB bitmap.
        let layout = OverlayLayout::new(81920 * 512, 512, 1024).unwrap();
        assert_eq!(layout.group_blocks(), 10);
        assert_eq!(layout.group_bytes(), 5120);
        assert_eq!(layout.group_count(), 8192);
        assert_eq!(layout.bitmap_bytes(), 1024);
    }

    #[test]
    fn maps_offsets_to_groups() {
        let layout = OverlayLayout::new(64 * 1024, 512, 4).unwrap();
        assert_eq!(layout.group_bytes(), 2048);
        assert_eq!(layout.group_of(0), 0);
        assert_eq!(layout.group_of(2047), 0);
        assert_eq!(layout.group_of(2048), 1);
        assert_eq!(layout.group_start(3), 6144);
        assert_eq!(layout.group_end(3), 8192);
        assert_eq!(layout.group_end(31), 64 * 1024);
    }

    #[test]
    fn clamps_short_final_group() {
        // 10.5 blocks: 11 addressable blocks, 2-block groups, 6 groups.
        let layout = OverlayLayout::new(10 * 512 + 256, 512, 1).unwrap();
        assert_eq!(layout.group_blocks(), 2);
        assert_eq!(layout.group_count(), 6);
        assert_eq!(layout.group_start(5), 5120);
        assert_eq!(layout.group_end(5), 5376);
        assert_eq!(layout.group_of(5375), 5);
    }

    #[test]
    fn small_images_get_single_block_groups() {
        let layout = OverlayLayout::new(4 * 512, 512, 1024).unwrap();
        assert_eq!(layout.group_blocks(), 1);
        assert_eq!(layout.group_count(), 4);
        assert_eq!(layout.bitmap_bytes(), 1);
    }

    #[test]
    fn handles_empty_image() {
        let layout = OverlayLayout::new(0, 512, 16).unwrap();
        assert_eq!(layout.group_count(), 0);
        assert_eq!(layout.bitmap_bytes(), 0);
    }

    #[test]
    fn rejects_zero_parameters() {
        assert!(matches!(
            OverlayLayout::new(4096, 0, 16),
            Err(Error::InvalidBlockSize)
        ));
        assert!(matches!(
            OverlayLayout::new(4096, 512, 0),
            Err(Error::InvalidBitmapCapacity)
        ));
    }
}
