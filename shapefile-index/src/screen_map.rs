//! Coarse pixel grid used to drop features that would render onto an
//! already painted pixel.

use std::sync::Arc;

use parking_lot::Mutex;
use roaring::RoaringBitmap;

use crate::envelope::Envelope;
use crate::errors::{ShapefileError, ShapefileResult};

/// A `width` x `height` grid laid over `extent`.
///
/// Cloning is cheap; clones share the same pixels, so a caller can hand a
/// clone to a reader and inspect coverage afterwards.
#[derive(Clone)]
pub struct ScreenMap {
    inner: Arc<ScreenMapInner>,
}

struct ScreenMapInner {
    extent: Envelope,
    width: u32,
    height: u32,
    pixels: Mutex<RoaringBitmap>,
}

impl ScreenMap {
    pub fn new(extent: Envelope, width: u32, height: u32) -> ShapefileResult<ScreenMap> {
        if extent.is_null() || width == 0 || height == 0 {
            return Err(ShapefileError::InvalidOperation(format!(
                "Invalid screen map {}x{} over {}",
                width, height, extent
            )));
        }
        if width as u64 * height as u64 > u32::MAX as u64 {
            return Err(ShapefileError::InvalidOperation(format!(
                "Screen map {}x{} is too large",
                width, height
            )));
        }
        Ok(ScreenMap {
            inner: Arc::new(ScreenMapInner {
                extent,
                width,
                height,
                pixels: Mutex::new(RoaringBitmap::new()),
            }),
        })
    }

    pub fn extent(&self) -> Envelope {
        self.inner.extent
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    /// World size of one pixel as `(x, y)`.
    pub fn pixel_size(&self) -> (f64, f64) {
        (
            self.inner.extent.width() / self.inner.width as f64,
            self.inner.extent.height() / self.inner.height as f64,
        )
    }

    fn pixel_of(&self, envelope: &Envelope) -> Option<u32> {
        let extent = &self.inner.extent;
        let (cx, cy) = envelope.center();
        if envelope.is_null() || !extent.contains_point(cx, cy) {
            return None;
        }
        let (pw, ph) = self.pixel_size();
        let col = if pw > 0.0 {
            (((cx - extent.min_x) / pw) as u32).min(self.inner.width - 1)
        } else {
            0
        };
        let row = if ph > 0.0 {
            (((cy - extent.min_y) / ph) as u32).min(self.inner.height - 1)
        } else {
            0
        };
        Some(row * self.inner.width + col)
    }

    /// Marks the pixel under the centre of `envelope`. Returns true if it was
    /// already marked. Envelopes outside the extent are never reported as
    /// covered.
    pub fn check_and_set(&self, envelope: &Envelope) -> bool {
        match self.pixel_of(envelope) {
            Some(pixel) => !self.inner.pixels.lock().insert(pixel),
            None => false,
        }
    }

    pub fn is_set(&self, envelope: &Envelope) -> bool {
        self.pixel_of(envelope)
            .map(|pixel| self.inner.pixels.lock().contains(pixel))
            .unwrap_or(false)
    }

    /// Number of marked pixels.
    pub fn covered(&self) -> u64 {
        self.inner.pixels.lock().len()
    }

    pub fn clear(&self) {
        self.inner.pixels.lock().clear();
    }
}

impl std::fmt::Debug for ScreenMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenMap")
            .field("extent", &self.inner.extent)
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("covered", &self.covered())
            .finish()
    }
}
