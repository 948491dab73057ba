// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

//! Transfer counters accumulated by the overlay store.

use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};

/// Monotonic byte counters for one overlay store instance.
///
/// "Requested" counters grow by the length the caller asked for, once per
/// call; the remaining counters grow by bytes actually moved to or from
/// the underlying images. The gap between the two is the amplification
/// introduced by group-granular copy-on-write.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct OverlayStats {
    pub read_requested_bytes: u64,
    pub read_original_bytes: u64,
    pub read_overlay_bytes: u64,
    pub write_requested_bytes: u64,
    pub write_overlay_bytes: u64,
    /// Bytes read from the original solely to satisfy promotion copies.
    pub promotion_read_bytes: u64,
}

impl OverlayStats {
    /// Extra bytes read from the images versus bytes requested, as a
    /// percentage. 0 when nothing has been requested.
    pub fn over_read_pct(&self) -> f64 {
        Self::amplification(
            self.read_original_bytes + self.read_overlay_bytes,
            self.read_requested_bytes,
        )
    }

    /// Extra bytes transferred for writes (promotion copies plus payload)
    /// versus bytes requested, as a percentage. 0 when nothing has been
    /// requested.
    pub fn over_write_pct(&self) -> f64 {
        Self::amplification(
            self.write_overlay_bytes + self.promotion_read_bytes,
            self.write_requested_bytes,
        )
    }

    fn amplification(actual: u64, requested: u64) -> f64 {
        if requested == 0 {
            return 0.0;
        }
        100.0 * (actual as f64 / requested as f64 - 1.0)
    }

    pub fn reset(&mut self) {
        *self = OverlayStats::default();
    }
}

impl Display for OverlayStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "read {} B requested ({} original, {} overlay, over-read {:.1}%), \
             write {} B requested ({} written, {} promoted, over-write {:.1}%)",
            self.read_requested_bytes,
            self.read_original_bytes,
            self.read_overlay_bytes,
            self.over_read_pct(),
            self.write_requested_bytes,
            self.write_overlay_bytes,
            self.promotion_read_bytes,
            self.over_write_pct(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratios_are_zero_without_requests() {
        let stats = OverlayStats::default();
        assert_eq!(stats.over_read_pct(), 0.0);
        assert_eq!(stats.over_write_pct(), 0.0);
    }

    #[test]
    fn computes_amplification() {
        let stats = OverlayStats {
            read_requested_bytes: 1000,
            read_original_bytes: 600,
            read_overlay_bytes: 400,
            write_requested_bytes: 1024,
            write_overlay_bytes: 1024,
            promotion_read_bytes: 512,
        };
        assert_eq!(stats.over_read_pct(), 0.0);
        assert_eq!(stats.over_write_pct(), 50.0);
    }

    #[test]
    fn reset_clears_all_counters() {
        let mut stats = OverlayStats {
            read_requested_bytes: 1,
            read_original_bytes: 2,
            read_overlay_bytes: 3,
            write_requested_bytes: 4,
            write_overlay_bytes: 5,
            promotion_read_bytes: 6,
        };
        stats.reset();
        assert_eq!(stats.read_requested_bytes, 0);
        assert_eq!(stats.promotion_read_bytes, 0);
        assert_eq!(stats.over_write_pct(), 0.0);
    }
}
