use std::{fmt, sync::Arc};

pub use kurbo::Affine;

/// Bytes per RGBA8 pixel. The only texel format the engine moves around.
pub const BYTES_PER_PIXEL: usize = 4;

/// Unit quad as a triangle strip: `(0,0) (0,1) (1,0) (1,1)`.
///
/// Every filter pass draws this same geometry; contexts upload it once.
pub const QUAD_VERTICES: [f32; 8] = [0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];

/// Width/height pair in pixels.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixel_count(self) -> usize {
        (self.width as usize).saturating_mul(self.height as usize)
    }

    /// RGBA8 byte length of a tightly packed buffer of this size.
    pub fn byte_len(self) -> usize {
        self.pixel_count().saturating_mul(BYTES_PER_PIXEL)
    }

    /// Like [`Extent::byte_len`], but `None` when the length does not fit `usize`.
    pub fn checked_byte_len(self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(BYTES_PER_PIXEL)
    }

    pub fn fits_within(self, other: Extent) -> bool {
        self.width <= other.width && self.height <= other.height
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Caller-supplied identity of a source image whose upload may be reused.
///
/// Two sources sharing a key must have pixel-identical content; the cache
/// never compares pixels.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
