//! One filter-chain execution: per-run textures, the shared pipeline state,
//! the chain itself, and the final readback.

use crate::{
    cache::{HelperLayers, ProgramCache, ProgramKey, ResourceCache},
    context::{DrawCall, FramebufferHandle, GraphicsContext, ProgramDesc, ProgramHandle, TextureHandle},
    foundation::{
        core::{CacheKey, Extent, QUAD_VERTICES},
        error::{RasterFxError, RasterFxResult},
    },
    readback::{ReadbackBuffer, copy_to_surface},
    surface::{ImageSource, RasterSurface, source_extent},
    texture::{ConversionSurface, create_texture},
};

/// A filter unit. It reads [`PipelineState::source_texture`] (or the original
/// on the first pass), writes [`PipelineState::target_texture`], and advances
/// the state itself; the executor never swaps textures between filters.
pub trait Filter {
    fn apply_to(&self, state: &mut PipelineState<'_>) -> RasterFxResult<()>;
}

/// Mutable record threaded through every filter of one run.
///
/// Readback happens from whatever texture is attached to [`Self::framebuffer`]
/// after the last filter.
pub struct PipelineState<'a> {
    pub original_width: u32,
    pub original_height: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub destination_width: u32,
    pub destination_height: u32,
    pub context: &'a mut dyn GraphicsContext,
    pub source_texture: TextureHandle,
    pub target_texture: TextureHandle,
    /// Unfiltered upload of the source. Never written by the executor.
    pub original_texture: TextureHandle,
    pub pass: usize,
    pub passes: usize,
    /// Shared unit-quad geometry.
    pub quad: &'a [f32; 8],
    pub programs: &'a mut ProgramCache,
    /// Helper textures that outlive the run.
    pub helpers: &'a mut HelperLayers,
    pub framebuffer: FramebufferHandle,
    pub target_surface: &'a mut RasterSurface,
}

impl PipelineState<'_> {
    pub fn source_extent(&self) -> Extent {
        Extent::new(self.source_width, self.source_height)
    }

    pub fn destination_extent(&self) -> Extent {
        Extent::new(self.destination_width, self.destination_height)
    }

    /// Texture the current pass should sample: the original on pass 0.
    pub fn input_texture(&self) -> TextureHandle {
        if self.pass == 0 {
            self.original_texture
        } else {
            self.source_texture
        }
    }

    /// Attach the target texture to the run's framebuffer, reallocating it at
    /// the destination size first when the sizes differ.
    pub fn attach_target(&mut self) -> RasterFxResult<()> {
        let destination = self.destination_extent();
        if self.context.texture_size(self.target_texture) != Some(destination)
            && self.target_texture != self.original_texture
        {
            self.context.delete_texture(self.target_texture);
            self.target_texture = self
                .context
                .create_texture(destination.width, destination.height)?;
        }
        self.context.framebuffer_texture(Some(self.target_texture))
    }

    /// The written target becomes the next pass's source.
    pub fn swap_textures(&mut self) {
        std::mem::swap(&mut self.source_texture, &mut self.target_texture);
        self.pass += 1;
    }

    /// Look up or compile the program for `key`.
    pub fn program(
        &mut self,
        key: &ProgramKey,
        desc: impl FnOnce() -> ProgramDesc,
    ) -> RasterFxResult<ProgramHandle> {
        self.programs.get_or_compile(&mut *self.context, key, desc)
    }

    /// A standard single-input pass: attach target, draw, swap.
    pub fn run_program_pass(
        &mut self,
        program: ProgramHandle,
        uniforms: &[f32],
    ) -> RasterFxResult<()> {
        let input = self.input_texture();
        self.attach_target()?;
        self.context.draw(&DrawCall {
            program,
            inputs: &[input],
            uniforms,
            viewport: Some(self.destination_extent()),
        })?;
        self.swap_textures();
        Ok(())
    }

    /// Allocate an extra uninitialized texture. The caller deletes it.
    pub fn create_texture(&mut self, width: u32, height: u32) -> RasterFxResult<TextureHandle> {
        self.context.create_texture(width, height)
    }

    pub fn delete_texture(&mut self, texture: TextureHandle) {
        self.context.delete_texture(texture);
    }

    /// Helper texture `name` kept across runs at `width` x `height`.
    pub fn helper_layer(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
    ) -> RasterFxResult<TextureHandle> {
        self.helpers.ensure(&mut *self.context, name, width, height)
    }

    /// Read a texture's full contents, leaving the framebuffer attachment as it was.
    pub fn read_texture(&mut self, texture: TextureHandle) -> RasterFxResult<Vec<u8>> {
        let extent = self
            .context
            .texture_size(texture)
            .ok_or_else(|| RasterFxError::pipeline(format!("unknown texture {texture:?}")))?;
        let previous = self.context.framebuffer_attachment();
        self.context.framebuffer_texture(Some(texture))?;
        let mut out = vec![0; extent.byte_len()];
        let read = self.context.read_pixels(extent.width, extent.height, &mut out);
        self.context.framebuffer_texture(previous)?;
        read.map(|()| out)
    }

    fn outcome(&self, cached_texture: Option<TextureHandle>) -> PipelineOutcome {
        PipelineOutcome {
            original: Extent::new(self.original_width, self.original_height),
            source: self.source_extent(),
            destination: self.destination_extent(),
            pass: self.pass,
            passes: self.passes,
            cached_texture,
        }
    }
}

/// Final pipeline state of a finished run, detached from its borrows.
///
/// Per-run textures are already released; only the cached texture stays valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub original: Extent,
    pub source: Extent,
    pub destination: Extent,
    pub pass: usize,
    pub passes: usize,
    pub cached_texture: Option<TextureHandle>,
}

struct RunTextures {
    source: TextureHandle,
    target: TextureHandle,
    original: TextureHandle,
}

/// Borrowed backend state one run executes against.
pub(crate) struct Executor<'a> {
    pub(crate) ctx: &'a mut dyn GraphicsContext,
    pub(crate) cache: &'a mut ResourceCache,
    pub(crate) conversion: &'a mut ConversionSurface,
    pub(crate) readback: &'a mut ReadbackBuffer,
}

impl Executor<'_> {
    pub(crate) fn run(
        self,
        filters: &[Option<&dyn Filter>],
        source: &dyn ImageSource,
        width: u32,
        height: u32,
        target: &mut RasterSurface,
        cache_key: Option<&CacheKey>,
    ) -> RasterFxResult<PipelineOutcome> {
        let Executor {
            ctx,
            cache,
            conversion,
            readback,
        } = self;

        let cached = match cache_key {
            Some(key) => Some(cache.get_or_create_texture(ctx, conversion, key, source)?),
            None => None,
        };
        let textures = allocate_run_textures(ctx, conversion, source, width, height, cached)?;
        let framebuffer = match ctx.create_framebuffer() {
            Ok(fb) => fb,
            Err(e) => {
                release(ctx, &[textures.source, textures.target, textures.original], cached);
                return Err(e);
            }
        };
        ctx.bind_framebuffer(Some(framebuffer));

        let original = source_extent(source);
        let mut state = PipelineState {
            original_width: original.width,
            original_height: original.height,
            source_width: width,
            source_height: height,
            destination_width: width,
            destination_height: height,
            context: &mut *ctx,
            source_texture: textures.source,
            target_texture: textures.target,
            original_texture: textures.original,
            pass: 0,
            passes: filters.len(),
            quad: &QUAD_VERTICES,
            programs: &mut cache.programs,
            helpers: &mut cache.helpers,
            framebuffer,
            target_surface: target,
        };

        let mut result = Ok(());
        for filter in filters.iter().flatten() {
            if let Err(e) = filter.apply_to(&mut state) {
                result = Err(e);
                break;
            }
        }
        if result.is_ok() {
            result = finish(&mut state, readback);
        }

        let outcome = state.outcome(cached);
        let (last_source, last_target) = (state.source_texture, state.target_texture);
        release(ctx, &[last_source, last_target, textures.original], cached);
        ctx.bind_framebuffer(None);
        ctx.delete_framebuffer(framebuffer);

        result.map(|()| outcome)
    }
}

fn allocate_run_textures(
    ctx: &mut dyn GraphicsContext,
    conversion: &mut ConversionSurface,
    source: &dyn ImageSource,
    width: u32,
    height: u32,
    cached: Option<TextureHandle>,
) -> RasterFxResult<RunTextures> {
    // With a cached original the first pass samples it, so the working source needs no upload.
    let upload = if cached.is_none() { Some(source) } else { None };
    let source_texture = create_texture(ctx, conversion, width, height, upload)?;
    let target_texture = match create_texture(ctx, conversion, width, height, None) {
        Ok(t) => t,
        Err(e) => {
            ctx.delete_texture(source_texture);
            return Err(e);
        }
    };
    let original_texture = match cached {
        Some(t) => t,
        None => match create_texture(ctx, conversion, width, height, Some(source)) {
            Ok(t) => t,
            Err(e) => {
                ctx.delete_texture(source_texture);
                ctx.delete_texture(target_texture);
                return Err(e);
            }
        },
    };
    Ok(RunTextures {
        source: source_texture,
        target: target_texture,
        original: original_texture,
    })
}

fn finish(state: &mut PipelineState<'_>, readback: &mut ReadbackBuffer) -> RasterFxResult<()> {
    if state.context.framebuffer_attachment().is_none() {
        // Nothing was drawn: the output is the untouched original.
        state.context.framebuffer_texture(Some(state.original_texture))?;
    }
    let destination = state.destination_extent();
    if state.target_surface.extent() != destination {
        state
            .target_surface
            .set_size(destination.width, destination.height);
    }
    copy_to_surface(
        &mut *state.context,
        readback,
        destination,
        &mut *state.target_surface,
    )?;
    state.target_surface.reset_transform();
    Ok(())
}

/// Delete per-run textures, skipping duplicates and the cache-owned texture.
fn release(ctx: &mut dyn GraphicsContext, textures: &[TextureHandle], cached: Option<TextureHandle>) {
    let mut released: Vec<TextureHandle> = Vec::with_capacity(textures.len());
    for &texture in textures {
        if Some(texture) == cached || released.contains(&texture) {
            continue;
        }
        ctx.delete_texture(texture);
        released.push(texture);
    }
}
