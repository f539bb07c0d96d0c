use std::collections::HashMap;

use crate::foundation::{
    core::{BYTES_PER_PIXEL, Extent},
    error::{RasterFxError, RasterFxResult},
};

use super::{
    ContextAttributes, ContextFactory, ContextMode, ContextStats, DrawCall, FramebufferHandle,
    GpuInfo, GraphicsContext, KernelInput, PixelKernel, Precision, ProgramDesc, ProgramHandle,
    TexelView, TextureHandle, check_draw, check_upload,
};

/// Default texture dimension limit of the software context.
pub const SOFTWARE_MAX_TEXTURE_SIZE: u32 = 16_384;

/// Offscreen factory for [`SoftwareContext`]s.
#[derive(Clone, Debug)]
pub struct SoftwareContextFactory {
    max_texture_size: u32,
    available: bool,
}

impl SoftwareContextFactory {
    pub fn new(max_texture_size: u32) -> Self {
        Self {
            max_texture_size,
            available: true,
        }
    }

    /// A factory whose every creation attempt fails, as on a machine without graphics.
    pub fn unavailable() -> Self {
        Self {
            max_texture_size: 0,
            available: false,
        }
    }
}

impl Default for SoftwareContextFactory {
    fn default() -> Self {
        Self::new(SOFTWARE_MAX_TEXTURE_SIZE)
    }
}

impl ContextFactory for SoftwareContextFactory {
    fn mode(&self) -> ContextMode {
        ContextMode::Offscreen
    }

    fn name(&self) -> &'static str {
        "software"
    }

    fn create(
        &self,
        extent: Extent,
        attributes: &ContextAttributes,
    ) -> Option<Box<dyn GraphicsContext>> {
        let limit = Extent::new(self.max_texture_size, self.max_texture_size);
        if !self.available || !extent.fits_within(limit) {
            return None;
        }
        Some(Box::new(SoftwareContext::new(
            extent,
            *attributes,
            self.max_texture_size,
        )))
    }
}

struct SoftTexture {
    extent: Extent,
    pixels: Vec<u8>,
}

struct SoftProgram {
    inputs: u32,
    kernel: PixelKernel,
}

/// CPU emulation of a graphics context.
///
/// Draws run each program's [`PixelKernel`] once per target pixel.
pub struct SoftwareContext {
    attributes: ContextAttributes,
    drawing_buffer: Extent,
    max_texture_size: u32,
    next_id: u64,
    textures: HashMap<TextureHandle, SoftTexture>,
    framebuffers: HashMap<FramebufferHandle, Option<TextureHandle>>,
    bound: Option<FramebufferHandle>,
    programs: HashMap<ProgramHandle, SoftProgram>,
    lost: bool,
    stats: ContextStats,
}

impl SoftwareContext {
    pub fn new(drawing_buffer: Extent, attributes: ContextAttributes, max_texture_size: u32) -> Self {
        Self {
            attributes,
            drawing_buffer,
            max_texture_size,
            next_id: 1,
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            bound: None,
            programs: HashMap::new(),
            lost: false,
            stats: ContextStats::default(),
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn ensure_live(&self) -> RasterFxResult<()> {
        if self.lost {
            return Err(RasterFxError::context("software context was lost"));
        }
        Ok(())
    }

    fn texture(&self, texture: TextureHandle) -> RasterFxResult<&SoftTexture> {
        self.textures
            .get(&texture)
            .ok_or_else(|| RasterFxError::pipeline(format!("unknown texture {texture:?}")))
    }
}

impl GraphicsContext for SoftwareContext {
    fn attributes(&self) -> ContextAttributes {
        self.attributes
    }

    fn drawing_buffer_size(&self) -> Extent {
        self.drawing_buffer
    }

    fn max_texture_size(&self) -> u32 {
        self.max_texture_size
    }

    fn supports_precision(&mut self, precision: Precision) -> bool {
        // Kernels compute in 8-bit integers and f32.
        precision == Precision::Medium
    }

    fn debug_renderer_info(&self) -> Option<GpuInfo> {
        None
    }

    fn is_context_lost(&self) -> bool {
        self.lost
    }

    fn lose_context(&mut self) {
        self.lost = true;
    }

    fn stats(&self) -> ContextStats {
        ContextStats {
            live_textures: self.textures.len(),
            live_framebuffers: self.framebuffers.len(),
            live_programs: self.programs.len(),
            ..self.stats
        }
    }

    fn create_texture(&mut self, width: u32, height: u32) -> RasterFxResult<TextureHandle> {
        self.ensure_live()?;
        let extent = Extent::new(width, height);
        if !extent.fits_within(Extent::new(self.max_texture_size, self.max_texture_size)) {
            return Err(RasterFxError::validation(format!(
                "texture {extent} exceeds max texture size {}",
                self.max_texture_size
            )));
        }
        let handle = TextureHandle::from_raw(self.alloc_id());
        self.textures.insert(
            handle,
            SoftTexture {
                extent,
                pixels: vec![0; extent.byte_len()],
            },
        );
        Ok(handle)
    }

    fn upload_texture(&mut self, texture: TextureHandle, pixels: &[u8]) -> RasterFxResult<()> {
        self.ensure_live()?;
        let tex = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| RasterFxError::pipeline(format!("unknown texture {texture:?}")))?;
        check_upload(tex.extent, pixels)?;
        tex.pixels.copy_from_slice(pixels);
        self.stats.uploads += 1;
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture);
        for attachment in self.framebuffers.values_mut() {
            if *attachment == Some(texture) {
                *attachment = None;
            }
        }
    }

    fn texture_size(&self, texture: TextureHandle) -> Option<Extent> {
        self.textures.get(&texture).map(|t| t.extent)
    }

    fn create_framebuffer(&mut self) -> RasterFxResult<FramebufferHandle> {
        self.ensure_live()?;
        let handle = FramebufferHandle::from_raw(self.alloc_id());
        self.framebuffers.insert(handle, None);
        Ok(handle)
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>) {
        self.bound = framebuffer.filter(|fb| self.framebuffers.contains_key(fb));
    }

    fn framebuffer_texture(&mut self, texture: Option<TextureHandle>) -> RasterFxResult<()> {
        self.ensure_live()?;
        if let Some(t) = texture {
            self.texture(t)?;
        }
        let fb = self
            .bound
            .ok_or_else(|| RasterFxError::pipeline("no framebuffer bound"))?;
        self.framebuffers.insert(fb, texture);
        Ok(())
    }

    fn framebuffer_attachment(&self) -> Option<TextureHandle> {
        self.bound
            .and_then(|fb| self.framebuffers.get(&fb).copied().flatten())
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer);
        if self.bound == Some(framebuffer) {
            self.bound = None;
        }
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> RasterFxResult<ProgramHandle> {
        self.ensure_live()?;
        let kernel = desc.kernel.ok_or_else(|| {
            RasterFxError::pipeline(format!(
                "program `{}` has no software kernel",
                desc.label
            ))
        })?;
        let handle = ProgramHandle::from_raw(self.alloc_id());
        self.programs.insert(
            handle,
            SoftProgram {
                inputs: desc.inputs,
                kernel,
            },
        );
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> RasterFxResult<()> {
        self.ensure_live()?;
        let program = self
            .programs
            .get(&call.program)
            .ok_or_else(|| RasterFxError::pipeline(format!("unknown program {:?}", call.program)))?;
        let (inputs, kernel) = (program.inputs, program.kernel);
        let target = check_draw(call, self.framebuffer_attachment(), inputs)?;

        let mut out = self
            .textures
            .remove(&target)
            .ok_or_else(|| RasterFxError::pipeline(format!("unknown texture {target:?}")))?;
        let result = (|| -> RasterFxResult<()> {
            let views = call
                .inputs
                .iter()
                .map(|t| {
                    self.texture(*t).map(|tex| TexelView {
                        width: tex.extent.width,
                        height: tex.extent.height,
                        data: &tex.pixels,
                    })
                })
                .collect::<RasterFxResult<Vec<_>>>()?;

            let viewport = call.viewport.unwrap_or(out.extent);
            let w = viewport.width.min(out.extent.width);
            let h = viewport.height.min(out.extent.height);
            for y in 0..h {
                for x in 0..w {
                    let px = kernel(&KernelInput {
                        x,
                        y,
                        width: viewport.width,
                        height: viewport.height,
                        uniforms: call.uniforms,
                        inputs: &views,
                    });
                    let i = (y as usize * out.extent.width as usize + x as usize) * BYTES_PER_PIXEL;
                    out.pixels[i..i + BYTES_PER_PIXEL].copy_from_slice(&px);
                }
            }
            Ok(())
        })();
        self.textures.insert(target, out);
        if result.is_ok() {
            self.stats.draws += 1;
        }
        result
    }

    fn read_pixels(&mut self, width: u32, height: u32, out: &mut [u8]) -> RasterFxResult<()> {
        self.ensure_live()?;
        let wanted = Extent::new(width, height);
        if out.len() < wanted.byte_len() {
            return Err(RasterFxError::validation(format!(
                "read of {wanted} needs {} bytes, buffer has {}",
                wanted.byte_len(),
                out.len()
            )));
        }
        let source = self
            .framebuffer_attachment()
            .ok_or_else(|| RasterFxError::pipeline("read_pixels without a framebuffer attachment"))?;
        let tex = self.texture(source)?;
        let out = &mut out[..wanted.byte_len()];
        out.fill(0);
        let copy_w = width.min(tex.extent.width) as usize * BYTES_PER_PIXEL;
        let row_out = width as usize * BYTES_PER_PIXEL;
        let row_tex = tex.extent.width as usize * BYTES_PER_PIXEL;
        for y in 0..height.min(tex.extent.height) as usize {
            out[y * row_out..y * row_out + copy_w]
                .copy_from_slice(&tex.pixels[y * row_tex..y * row_tex + copy_w]);
        }
        self.stats.readbacks += 1;
        Ok(())
    }
}
