use std::borrow::Cow;

use kurbo::{Affine, Point, Rect};

use crate::foundation::{
    core::{BYTES_PER_PIXEL, Extent},
    error::{RasterFxError, RasterFxResult},
};

/// Tightly packed RGBA8 pixels with their dimensions.
///
/// Bytes are inherently clamped to `0..=255`; this is the descriptor handed to
/// [`RasterSurface::put_image_data`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageData<'a> {
    pub width: u32,
    pub height: u32,
    pub data: Cow<'a, [u8]>,
}

impl<'a> ImageData<'a> {
    pub fn new(width: u32, height: u32, data: impl Into<Cow<'a, [u8]>>) -> RasterFxResult<Self> {
        let data = data.into();
        let expected = Extent::new(width, height).byte_len();
        if data.len() != expected {
            return Err(RasterFxError::validation(format!(
                "image data for {width}x{height} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }
}

/// Anything that can be drawn into a [`RasterSurface`] and uploaded as a texture.
///
/// Implemented for [`RasterSurface`], [`image::RgbaImage`] and [`image::DynamicImage`].
pub trait ImageSource {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// Intrinsic size for sources whose `width`/`height` report zero (e.g. not yet laid out).
    fn original_size(&self) -> Option<Extent> {
        None
    }

    /// Draw the source with its top-left corner at `(dx, dy)` in the target's
    /// user space (the target transform applies).
    fn draw_to(&self, target: &mut RasterSurface, dx: f64, dy: f64);
}

/// Native size of `source`: `width`/`height` when non-zero, otherwise its original size.
pub fn source_extent(source: &dyn ImageSource) -> Extent {
    let own = Extent::new(source.width(), source.height());
    if !own.is_empty() {
        return own;
    }
    source.original_size().unwrap_or(own)
}

/// A CPU raster surface holding straight-alpha RGBA8 pixels and a 2D transform.
///
/// This is the destination of every filter run: the backend may resize it,
/// overwrites its pixels and resets its transform afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterSurface {
    width: u32,
    height: u32,
    data: Vec<u8>,
    transform: Affine,
}

impl RasterSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; Extent::new(width, height).byte_len()],
            transform: Affine::IDENTITY,
        }
    }

    pub fn from_rgba8(width: u32, height: u32, data: Vec<u8>) -> RasterFxResult<Self> {
        let expected = Extent::new(width, height).byte_len();
        if data.len() != expected {
            return Err(RasterFxError::validation(format!(
                "surface {width}x{height} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
            transform: Affine::IDENTITY,
        })
    }

    pub fn from_rgba_image(img: image::RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            data: img.into_raw(),
            transform: Affine::IDENTITY,
        }
    }

    pub fn to_rgba_image(&self) -> RasterFxResult<image::RgbaImage> {
        image::RgbaImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| RasterFxError::validation("surface buffer does not match its size"))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn extent(&self) -> Extent {
        Extent::new(self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = self.offset(x, y);
        Some([
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ])
    }

    /// Resize the backing store. Like resizing a canvas, this discards the
    /// pixels and resets the transform even when the size is unchanged.
    pub fn set_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.data.clear();
        self.data.resize(Extent::new(width, height).byte_len(), 0);
        self.transform = Affine::IDENTITY;
    }

    pub fn transform(&self) -> Affine {
        self.transform
    }

    pub fn set_transform(&mut self, transform: Affine) {
        self.transform = transform;
    }

    pub fn reset_transform(&mut self) {
        self.transform = Affine::IDENTITY;
    }

    /// Replace pixels at `(dx, dy)` with `image`, clipped to the surface.
    ///
    /// No compositing and no transform, matching a canvas `putImageData`.
    pub fn put_image_data(&mut self, image: &ImageData<'_>, dx: i32, dy: i32) {
        let src_row_bytes = image.width as usize * BYTES_PER_PIXEL;
        for sy in 0..image.height {
            let ty = dy as i64 + sy as i64;
            if ty < 0 || ty >= self.height as i64 {
                continue;
            }
            let x0 = (dx as i64).max(0);
            let x1 = (dx as i64 + image.width as i64).min(self.width as i64);
            if x0 >= x1 {
                return;
            }
            let sx0 = (x0 - dx as i64) as usize;
            let count = (x1 - x0) as usize * BYTES_PER_PIXEL;
            let src = sy as usize * src_row_bytes + sx0 * BYTES_PER_PIXEL;
            let dst = self.offset(x0 as u32, ty as u32);
            self.data[dst..dst + count].copy_from_slice(&image.data[src..src + count]);
        }
    }

    /// Source-over draw of tightly packed RGBA8 pixels under the current transform.
    pub fn draw_rgba8(&mut self, width: u32, height: u32, data: &[u8], dx: f64, dy: f64) {
        if width == 0 || height == 0 || self.width == 0 || self.height == 0 {
            return;
        }
        let xf = self.transform * Affine::translate((dx, dy));
        let [a, b, c, d, e, f] = xf.as_coeffs();
        if a == 1.0 && b == 0.0 && c == 0.0 && d == 1.0 && e.fract() == 0.0 && f.fract() == 0.0 {
            self.blit_translated(width, height, data, e as i64, f as i64);
            return;
        }
        if xf.determinant().abs() < f64::EPSILON {
            return;
        }

        let inv = xf.inverse();
        let bbox = xf.transform_rect_bbox(Rect::new(0.0, 0.0, width as f64, height as f64));
        let x0 = bbox.x0.floor().max(0.0) as u32;
        let y0 = bbox.y0.floor().max(0.0) as u32;
        let x1 = (bbox.x1.ceil().max(0.0) as u32).min(self.width);
        let y1 = (bbox.y1.ceil().max(0.0) as u32).min(self.height);
        for ty in y0..y1 {
            for tx in x0..x1 {
                let p = inv * Point::new(tx as f64 + 0.5, ty as f64 + 0.5);
                if p.x < 0.0 || p.y < 0.0 || p.x >= width as f64 || p.y >= height as f64 {
                    continue;
                }
                let src = (p.y as usize * width as usize + p.x as usize) * BYTES_PER_PIXEL;
                let dst = self.offset(tx, ty);
                blend_over(&mut self.data[dst..dst + BYTES_PER_PIXEL], &data[src..src + BYTES_PER_PIXEL]);
            }
        }
    }

    fn blit_translated(&mut self, width: u32, height: u32, data: &[u8], tx: i64, ty: i64) {
        let x0 = tx.max(0);
        let x1 = (tx + width as i64).min(self.width as i64);
        if x0 >= x1 {
            return;
        }
        for sy in 0..height as i64 {
            let y = ty + sy;
            if y < 0 || y >= self.height as i64 {
                continue;
            }
            for x in x0..x1 {
                let sx = (x - tx) as usize;
                let src = (sy as usize * width as usize + sx) * BYTES_PER_PIXEL;
                let dst = self.offset(x as u32, y as u32);
                blend_over(&mut self.data[dst..dst + BYTES_PER_PIXEL], &data[src..src + BYTES_PER_PIXEL]);
            }
        }
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL
    }
}

/// Straight-alpha source-over. Exact copy when the destination is transparent
/// or the source is opaque.
fn blend_over(dst: &mut [u8], src: &[u8]) {
    let sa = src[3];
    if sa == 0 {
        return;
    }
    let da = dst[3];
    if sa == 255 || da == 0 {
        dst.copy_from_slice(src);
        return;
    }
    let sa_f = sa as f32 / 255.0;
    let da_f = da as f32 / 255.0;
    let out_a = sa_f + da_f * (1.0 - sa_f);
    for ch in 0..3 {
        let c = (src[ch] as f32 * sa_f + dst[ch] as f32 * da_f * (1.0 - sa_f)) / out_a;
        dst[ch] = c.round().clamp(0.0, 255.0) as u8;
    }
    dst[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
}

impl ImageSource for RasterSurface {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn draw_to(&self, target: &mut RasterSurface, dx: f64, dy: f64) {
        target.draw_rgba8(self.width, self.height, &self.data, dx, dy);
    }
}

impl ImageSource for image::RgbaImage {
    fn width(&self) -> u32 {
        self.dimensions().0
    }

    fn height(&self) -> u32 {
        self.dimensions().1
    }

    fn draw_to(&self, target: &mut RasterSurface, dx: f64, dy: f64) {
        let (w, h) = self.dimensions();
        target.draw_rgba8(w, h, self.as_raw(), dx, dy);
    }
}

impl ImageSource for image::DynamicImage {
    fn width(&self) -> u32 {
        image::GenericImageView::width(self)
    }

    fn height(&self) -> u32 {
        image::GenericImageView::height(self)
    }

    fn draw_to(&self, target: &mut RasterSurface, dx: f64, dy: f64) {
        match self {
            image::DynamicImage::ImageRgba8(img) => img.draw_to(target, dx, dy),
            other => other.to_rgba8().draw_to(target, dx, dy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(w: u32, h: u32) -> RasterSurface {
        let mut data = Vec::new();
        for y in 0..h {
            for x in 0..w {
                data.extend_from_slice(&[(x * 10) as u8, (y * 10) as u8, 7, 255]);
            }
        }
        RasterSurface::from_rgba8(w, h, data).unwrap()
    }

    #[test]
    fn put_image_data_ignores_transform_and_clips() {
        let mut s = RasterSurface::new(4, 4);
        s.set_transform(Affine::scale(3.0));
        let img = ImageData::new(2, 2, vec![9u8; 16]).unwrap();
        s.put_image_data(&img, 3, 3);
        assert_eq!(s.pixel(3, 3), Some([9, 9, 9, 9]));
        assert_eq!(s.pixel(2, 3), Some([0, 0, 0, 0]));
    }

    #[test]
    fn image_data_rejects_wrong_length() {
        assert!(ImageData::new(2, 2, vec![0u8; 15]).is_err());
    }

    #[test]
    fn draw_onto_transparent_is_exact_copy() {
        let src = checker(3, 2);
        let mut dst = RasterSurface::new(3, 2);
        src.draw_to(&mut dst, 0.0, 0.0);
        assert_eq!(dst.data(), src.data());
    }

    #[test]
    fn draw_honours_transform() {
        let src = checker(2, 2);
        let mut dst = RasterSurface::new(4, 4);
        dst.set_transform(Affine::scale(2.0));
        src.draw_to(&mut dst, 0.0, 0.0);
        assert_eq!(dst.pixel(3, 3), src.pixel(1, 1));
        assert_eq!(dst.pixel(1, 0), src.pixel(0, 0));
    }

    #[test]
    fn set_size_discards_pixels_and_transform() {
        let mut s = checker(2, 2);
        s.set_transform(Affine::translate((1.0, 1.0)));
        s.set_size(3, 1);
        assert_eq!(s.extent(), Extent::new(3, 1));
        assert!(s.data().iter().all(|&b| b == 0));
        assert_eq!(s.transform(), Affine::IDENTITY);
    }

    #[test]
    fn source_extent_falls_back_to_original_size() {
        struct Lazy;
        impl ImageSource for Lazy {
            fn width(&self) -> u32 {
                0
            }
            fn height(&self) -> u32 {
                0
            }
            fn original_size(&self) -> Option<Extent> {
                Some(Extent::new(8, 6))
            }
            fn draw_to(&self, _target: &mut RasterSurface, _dx: f64, _dy: f64) {}
        }
        assert_eq!(source_extent(&Lazy), Extent::new(8, 6));
        assert_eq!(source_extent(&checker(2, 3)), Extent::new(2, 3));
    }

    #[test]
    fn rgba_image_roundtrips_through_surface() {
        let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([1, 2, 3, 4]));
        let s = RasterSurface::from_rgba_image(img.clone());
        assert_eq!(s.to_rgba_image().unwrap(), img);
    }
}
