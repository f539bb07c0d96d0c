use crate::{
    context::{GraphicsContext, TextureHandle},
    foundation::{core::Extent, error::RasterFxResult},
    surface::{ImageSource, RasterSurface},
};

/// Scratch 2D surface used to flatten any [`ImageSource`] into RGBA8 bytes.
///
/// Created once per context setup and resized per upload.
#[derive(Debug)]
pub struct ConversionSurface {
    surface: RasterSurface,
}

impl ConversionSurface {
    pub fn new() -> Self {
        Self {
            surface: RasterSurface::new(0, 0),
        }
    }

    /// Draw `source` at the origin of a transparent `extent` surface and
    /// return its bytes. Larger sources are cropped, smaller ones padded.
    pub fn rgba8(&mut self, source: &dyn ImageSource, extent: Extent) -> &[u8] {
        self.surface.set_size(extent.width, extent.height);
        source.draw_to(&mut self.surface, 0.0, 0.0);
        self.surface.data()
    }
}

impl Default for ConversionSurface {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate a `width` x `height` texture, filled from `source` when given.
///
/// Without a source the texture is left uninitialized (a write target).
/// Sampling is always nearest with clamp-to-edge; there are no mipmaps.
pub fn create_texture(
    ctx: &mut dyn GraphicsContext,
    conversion: &mut ConversionSurface,
    width: u32,
    height: u32,
    source: Option<&dyn ImageSource>,
) -> RasterFxResult<TextureHandle> {
    let texture = ctx.create_texture(width, height)?;
    if let Some(source) = source {
        let pixels = conversion.rgba8(source, Extent::new(width, height));
        if let Err(e) = ctx.upload_texture(texture, pixels) {
            ctx.delete_texture(texture);
            return Err(e);
        }
    }
    Ok(texture)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextAttributes, SoftwareContext};

    fn ctx() -> SoftwareContext {
        SoftwareContext::new(Extent::new(16, 16), ContextAttributes::FILTERING, 64)
    }

    #[test]
    fn source_upload_matches_source_pixels() {
        let mut c = ctx();
        let mut conv = ConversionSurface::new();
        let img = image::RgbaImage::from_fn(3, 2, |x, y| image::Rgba([x as u8, y as u8, 1, 255]));
        let tex = create_texture(&mut c, &mut conv, 3, 2, Some(&img)).unwrap();

        let fb = c.create_framebuffer().unwrap();
        c.bind_framebuffer(Some(fb));
        c.framebuffer_texture(Some(tex)).unwrap();
        let mut out = vec![0u8; 24];
        c.read_pixels(3, 2, &mut out).unwrap();
        assert_eq!(out, img.into_raw());
        assert_eq!(c.stats().uploads, 1);
    }

    #[test]
    fn texture_without_source_skips_upload() {
        let mut c = ctx();
        let mut conv = ConversionSurface::new();
        let tex = create_texture(&mut c, &mut conv, 5, 4, None).unwrap();
        assert_eq!(c.texture_size(tex), Some(Extent::new(5, 4)));
        assert_eq!(c.stats().uploads, 0);
    }

    #[test]
    fn conversion_pads_small_sources() {
        let mut conv = ConversionSurface::new();
        let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([5, 5, 5, 255]));
        let bytes = conv.rgba8(&img, Extent::new(2, 1)).to_vec();
        assert_eq!(bytes, vec![5, 5, 5, 255, 0, 0, 0, 0]);
    }
}
