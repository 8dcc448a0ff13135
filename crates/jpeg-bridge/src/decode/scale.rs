//! Choice of the engine's DCT scaling factor for a requested bounding box.
//!
//! The engine can shrink during the inverse DCT by `n/8` for `n` in `1..=8`,
//! which is far cheaper than decoding at full size and resizing afterwards.
//! We pick the smallest factor whose output still covers the box.

use crate::types::ScaleTarget;

/// Denominator of every scale factor the engine is asked for.
pub const SCALE_DENOMINATOR: u32 = 8;

/// A scale of `numerator / 8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleFactor {
    numerator: u32,
}

impl ScaleFactor {
    /// No scaling.
    pub const IDENTITY: ScaleFactor = ScaleFactor {
        numerator: SCALE_DENOMINATOR,
    };

    /// `numerator / 8`, with `numerator` clamped to `1..=8`.
    pub fn new(numerator: u32) -> Self {
        Self {
            numerator: numerator.clamp(1, SCALE_DENOMINATOR),
        }
    }

    pub fn numerator(self) -> u32 {
        self.numerator
    }

    pub fn denominator(self) -> u32 {
        SCALE_DENOMINATOR
    }

    pub fn is_identity(self) -> bool {
        self.numerator == SCALE_DENOMINATOR
    }

    /// Output size the engine produces for a `width`x`height` source.
    ///
    /// The engine rounds up; callers should still size buffers from the
    /// dimensions the engine reports after configuration.
    pub fn apply(self, width: u32, height: u32) -> (u32, u32) {
        let scale = |n: u32| {
            (n as u64 * self.numerator as u64).div_ceil(SCALE_DENOMINATOR as u64) as u32
        };
        (scale(width), scale(height))
    }

    /// Smallest factor whose output covers `target` on both axes.
    ///
    /// No target, an empty target, or a target at least as large as the
    /// source selects [`ScaleFactor::IDENTITY`].
    pub fn select(width: u32, height: u32, target: Option<ScaleTarget>) -> Self {
        let Some(target) = target.filter(|t| !t.is_empty()) else {
            return Self::IDENTITY;
        };
        (1..SCALE_DENOMINATOR)
            .map(ScaleFactor::new)
            .find(|factor| {
                let (w, h) = factor.apply(width, height);
                w >= target.width && h >= target.height
            })
            .unwrap_or(Self::IDENTITY)
    }
}


// ============================================================================
// Property-Based Tests
// ============================================================================
