use parking_lot::RwLock;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use aperture_core::prelude::Frame;

/// Axis-aligned pixel region within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    /// Region covering the whole of a `width` x `height` frame.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// RGBA color used when overlaying a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    /// Fully opaque color.
    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// Opaque gray of the given level.
    pub const fn gray(level: u8) -> Self {
        Self::opaque(level, level, level)
    }
}

/// Per-detection mask image, one byte per pixel, row-major.
///
/// Segmentation-style backends attach one per detection; box-only backends
/// leave the mask out.
#[derive(Debug, Clone)]
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Mask {
    /// Wrap mask bytes, or `None` when `data` does not cover
    /// `width * height` pixels.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        (data.len() == width as usize * height as usize).then_some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Mask bytes, `width * height` of them.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// One finding produced by a filter.
#[derive(Debug, Clone)]
pub struct Detection {
    /// What was found ("face", "qr-code", ...).
    pub label: String,
    /// Confidence in the unit interval.
    pub confidence: f32,
    /// Where in the frame it was found.
    pub region: Rect,
    /// Color to draw this detection with.
    pub color: Rgba,
    /// Pixel mask of the detected region, when the producer computes one.
    pub mask: Option<Mask>,
}

/// All detections from a single filter on a single frame.
#[derive(Debug, Clone)]
pub struct DetectionSet {
    /// Name of the producing filter.
    pub producer: String,
    /// Findings, possibly empty.
    pub detections: Vec<Detection>,
}

/// Per-frame analysis stage.
///
/// `apply` runs on the rayon pool, never on the consumer thread, and receives
/// the frame by mutable reference: filters may annotate or transform pixels
/// in place, or just read them. Disabled filters are skipped without being
/// removed from their chain.
pub trait VideoFilter: Send + Sync {
    /// Stable name used to tag this filter's detection sets.
    fn name(&self) -> &str;

    /// Whether the filter should run right now.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Analyze (and optionally mutate) one frame.
    fn apply(&self, frame: &mut Frame) -> Vec<Detection>;
}

/// Ordered, shareable list of filters.
///
/// Cloning the chain shares the underlying list, so filters can be added or
/// removed while a session is running; the dispatcher snapshots the list per
/// frame.
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use aperture::prelude::{FilterChain, MeanLevelFilter};
///
/// let chain = FilterChain::default();
/// let filter = Arc::new(MeanLevelFilter::new());
/// chain.add(filter.clone());
/// chain.add(filter.clone()); // second add is ignored
/// assert_eq!(chain.len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct FilterChain {
    inner: Arc<RwLock<Vec<Arc<dyn VideoFilter>>>>,
}

impl FilterChain {
    /// Append a filter unless the same instance is already present.
    pub fn add(&self, filter: Arc<dyn VideoFilter>) {
        let mut filters = self.inner.write();
        if !filters.iter().any(|f| Arc::ptr_eq(f, &filter)) {
            filters.push(filter);
        }
    }

    /// Remove a filter by instance identity.
    pub fn remove(&self, filter: &Arc<dyn VideoFilter>) {
        self.inner.write().retain(|f| !Arc::ptr_eq(f, filter));
    }

    /// Number of attached filters.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether no filters are attached.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Copy of the current filter list.
    pub fn snapshot(&self) -> Vec<Arc<dyn VideoFilter>> {
        self.inner.read().clone()
    }
}

/// Built-in filter reporting the mean luma-ish level of the first plane.
///
/// Mostly a smoke-test and demo filter, but also a rough exposure readout.
pub struct MeanLevelFilter {
    enabled: AtomicBool,
}

impl MeanLevelFilter {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
        }
    }

    /// Enable or disable without detaching from the chain.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

impl Default for MeanLevelFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoFilter for MeanLevelFilter {
    fn name(&self) -> &str {
        "mean-level"
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn apply(&self, frame: &mut Frame) -> Vec<Detection> {
        let planes = frame.planes();
        let Some(plane) = planes.first() else {
            return Vec::new();
        };
        let data = plane.data();
        if data.is_empty() {
            return Vec::new();
        }
        let sum: u64 = data.iter().map(|&b| b as u64).sum();
        let mean = (sum / data.len() as u64) as f32;
        let res = frame.meta().format.resolution;
        vec![Detection {
            label: "mean-level".into(),
            confidence: mean / 255.0,
            region: Rect::full(res.width.get(), res.height.get()),
            color: Rgba::gray(mean as u8),
            mask: None,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_core::prelude::*;

    fn frame_with_fill(fill: u8) -> Frame {
        let pool = FramePool::with_capacity(1, 64);
        let res = Resolution::new(4, 4).unwrap();
        let fmt = MediaFormat::new(FourCc::new(*b"GREY"), res, ColorSpace::Unknown);
        let mut frame = Frame::single_plane(FrameMeta::new(fmt, 0, 0), pool.lease(), 16, 4);
        frame.planes_mut()[0].data().fill(fill);
        frame
    }

    #[test]
    fn mean_level_reports_fill_value() {
        let filter = MeanLevelFilter::new();
        let mut frame = frame_with_fill(128);
        let detections = filter.apply(&mut frame);
        assert_eq!(detections.len(), 1);
        assert!((detections[0].confidence - 128.0 / 255.0).abs() < 0.01);
        assert_eq!(detections[0].color, Rgba::gray(128));
        assert!(detections[0].mask.is_none());
    }

    #[test]
    fn mask_requires_matching_dimensions() {
        assert!(Mask::new(4, 4, vec![0; 16]).is_some());
        assert!(Mask::new(4, 4, vec![0; 15]).is_none());
        let mask = Mask::new(2, 3, vec![255; 6]).unwrap();
        assert_eq!(mask.width(), 2);
        assert_eq!(mask.height(), 3);
        assert_eq!(mask.data().len(), 6);
    }

    #[test]
    fn disabled_filter_reports_disabled() {
        let filter = MeanLevelFilter::new();
        assert!(filter.is_enabled());
        filter.set_enabled(false);
        assert!(!filter.is_enabled());
    }

    #[test]
    fn chain_add_remove() {
        let chain = FilterChain::default();
        let a: Arc<dyn VideoFilter> = Arc::new(MeanLevelFilter::new());
        let b: Arc<dyn VideoFilter> = Arc::new(MeanLevelFilter::new());
        chain.add(a.clone());
        chain.add(b.clone());
        chain.add(a.clone());
        assert_eq!(chain.len(), 2);
        chain.remove(&a);
        assert_eq!(chain.len(), 1);
        assert!(Arc::ptr_eq(&chain.snapshot()[0], &b));
    }
}
