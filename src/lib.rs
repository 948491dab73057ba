// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Block-image copy-on-write overlay.
//!
//! A large, static block image is often shared or write-protected, so
//! mutating it in place is not an option. [`overlay::OverlayImage`] pairs
//! such an original image with a writable overlay of identical size and
//! routes every read and write so the pair behaves as a single mutable
//! device: disk snapshots, sparse device overlays, and copy-on-write disk
//! emulation all reduce to this layer.

pub mod overlay;

use std::fmt::Debug;
use std::fs::File;
use std::io::{Read, Seek, Write};

const SECTOR_SHIFT: u8 = 9;
/// Logical sector size assumed by the default [`overlay::OverlayOptions`].
pub const SECTOR_SIZE: u64 = 0x01 << SECTOR_SHIFT;

/// Byte-addressable backing resource for one side of an overlay pair.
///
/// A short read signals end-of-resource. A short write means the resource
/// cannot accept the full payload and is treated as fatal by the operation
/// that issued it.
pub trait ImageBackend: Read + Write + Seek + Send + Debug {
    /// Size of the resource in bytes, fixed for its lifetime.
    fn size(&self) -> std::io::Result<u64>;
}

impl ImageBackend for File {
    fn size(&self) -> std::io::Result<u64> {
        Ok(self.metadata()?.len())
    }
}
