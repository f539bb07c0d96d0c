//! GPU to CPU pixel transfer.
//!
//! Pixels are read into a byte buffer and written with `put_image_data`
//! rather than drawn from the GPU surface: raw buffer transfer measured faster
//! than a draw-based copy in at least one major browser engine, and it keeps
//! the copy independent of the target's transform. Keep it that way.

use crate::{
    context::GraphicsContext,
    foundation::{
        core::Extent,
        error::{RasterFxError, RasterFxResult},
    },
    surface::{ImageData, RasterSurface},
};

/// Reusable readback buffer, sized once per context setup to the tile size.
#[derive(Debug, Default)]
pub struct ReadbackBuffer {
    bytes: Vec<u8>,
    capacity: Extent,
}

impl ReadbackBuffer {
    /// Allocate a zeroed buffer for `tile`. Fails instead of aborting when
    /// the tile is too large to hold in memory.
    pub fn new(tile: Extent) -> RasterFxResult<Self> {
        let len = tile.checked_byte_len().ok_or_else(|| {
            RasterFxError::validation(format!("{tile} readback buffer overflows usize"))
        })?;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len).map_err(|e| {
            RasterFxError::validation(format!("allocate {tile} readback buffer: {e}"))
        })?;
        bytes.resize(len, 0);
        Ok(Self {
            bytes,
            capacity: tile,
        })
    }

    pub fn capacity(&self) -> Extent {
        self.capacity
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Read `destination` pixels from the bound framebuffer into `target` at the origin.
///
/// `destination` must fit in the buffer's byte capacity; larger reads are a
/// boundary violation and fail without touching `target`.
pub fn copy_to_surface(
    ctx: &mut dyn GraphicsContext,
    buffer: &mut ReadbackBuffer,
    destination: Extent,
    target: &mut RasterSurface,
) -> RasterFxResult<()> {
    let num_bytes = destination.byte_len();
    if num_bytes > buffer.bytes.len() {
        return Err(RasterFxError::validation(format!(
            "readback of {destination} exceeds the {} tile buffer",
            buffer.capacity
        )));
    }
    let bytes = &mut buffer.bytes[..num_bytes];
    ctx.read_pixels(destination.width, destination.height, bytes)?;
    let image = ImageData::new(destination.width, destination.height, &bytes[..])?;
    target.put_image_data(&image, 0, 0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextAttributes, SoftwareContext};

    fn ctx_with_attachment(extent: Extent, fill: u8) -> SoftwareContext {
        let mut c = SoftwareContext::new(extent, ContextAttributes::FILTERING, 64);
        let t = c.create_texture(extent.width, extent.height).unwrap();
        c.upload_texture(t, &vec![fill; extent.byte_len()]).unwrap();
        let fb = c.create_framebuffer().unwrap();
        c.bind_framebuffer(Some(fb));
        c.framebuffer_texture(Some(t)).unwrap();
        c
    }

    #[test]
    fn copies_into_surface_origin() {
        let mut c = ctx_with_attachment(Extent::new(4, 4), 200);
        let mut buf = ReadbackBuffer::new(Extent::new(4, 4)).unwrap();
        let mut target = RasterSurface::new(3, 3);
        copy_to_surface(&mut c, &mut buf, Extent::new(2, 2), &mut target).unwrap();
        assert_eq!(target.pixel(1, 1), Some([200; 4]));
        assert_eq!(target.pixel(2, 2), Some([0; 4]));
    }

    #[test]
    fn oversized_destination_is_rejected() {
        let mut c = ctx_with_attachment(Extent::new(4, 4), 1);
        let mut buf = ReadbackBuffer::new(Extent::new(2, 2)).unwrap();
        let mut target = RasterSurface::new(4, 4);
        let err = copy_to_surface(&mut c, &mut buf, Extent::new(4, 4), &mut target).unwrap_err();
        assert!(err.to_string().contains("tile buffer"));
        assert!(target.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn buffer_is_sized_by_tile() {
        let buf = ReadbackBuffer::new(Extent::new(8, 2)).unwrap();
        assert_eq!(buf.byte_len(), 64);
        assert_eq!(buf.capacity(), Extent::new(8, 2));
    }

    #[test]
    fn unrepresentable_tile_is_an_error() {
        let err = ReadbackBuffer::new(Extent::new(u32::MAX, u32::MAX)).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }
}
