//! Graphics contexts: the GL-style command surface the backend drives.
//!
//! A context owns every GPU resource it hands out as an opaque handle.
//! Resources are not portable between contexts; dropping a context frees them all.

use std::{borrow::Cow, fmt};

use crate::foundation::{
    core::{BYTES_PER_PIXEL, Extent},
    error::{RasterFxError, RasterFxResult},
};

pub mod software;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use software::{SoftwareContext, SoftwareContextFactory};

#[cfg(feature = "gpu")]
pub use gpu::{AttachedContextFactory, HeadlessContextFactory, WgpuContext};

/// Maximum number of `f32` uniforms a draw may pass (16 `vec4<f32>`).
pub const MAX_UNIFORM_FLOATS: usize = 64;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

handle!(
    /// RGBA8 texture owned by a context.
    TextureHandle
);
handle!(
    /// Render target binding; its color attachment is where draws land.
    FramebufferHandle
);
handle!(
    /// Compiled filter program.
    ProgramHandle
);

/// Creation attributes. Filtering always uses [`ContextAttributes::FILTERING`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextAttributes {
    pub alpha: bool,
    pub premultiplied_alpha: bool,
    pub depth: bool,
    pub stencil: bool,
    pub antialias: bool,
}

impl ContextAttributes {
    pub const FILTERING: Self = Self {
        alpha: true,
        premultiplied_alpha: false,
        depth: false,
        stencil: false,
        antialias: false,
    };
}

impl Default for ContextAttributes {
    fn default() -> Self {
        Self::FILTERING
    }
}

/// Shader float precision, probed in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Low,
    Medium,
    High,
}

impl Precision {
    pub const PROBE_ORDER: [Precision; 3] = [Precision::Low, Precision::Medium, Precision::High];

    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Low => "lowp",
            Precision::Medium => "mediump",
            Precision::High => "highp",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renderer/vendor strings, lower-cased. Empty when the context cannot tell.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct GpuInfo {
    pub renderer: String,
    pub vendor: String,
}

/// Live resource counts and lifetime operation counters of one context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub live_textures: usize,
    pub live_framebuffers: usize,
    pub live_programs: usize,
    pub uploads: u64,
    pub draws: u64,
    pub readbacks: u64,
}

/// Per-pixel software implementation of a program.
pub type PixelKernel = fn(&KernelInput<'_>) -> [u8; 4];

/// Read-only view of an input texture for [`PixelKernel`]s.
#[derive(Clone, Copy, Debug)]
pub struct TexelView<'a> {
    pub width: u32,
    pub height: u32,
    pub data: &'a [u8],
}

impl TexelView<'_> {
    /// Nearest fetch with clamp-to-edge addressing.
    pub fn fetch(&self, x: i64, y: i64) -> [u8; 4] {
        if self.width == 0 || self.height == 0 {
            return [0; 4];
        }
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        let i = (y * self.width as usize + x) * BYTES_PER_PIXEL;
        [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
    }

    /// Nearest sample at normalized coordinates, origin top-left.
    pub fn sample(&self, u: f32, v: f32) -> [u8; 4] {
        let x = (u * self.width as f32).floor() as i64;
        let y = (v * self.height as f32).floor() as i64;
        self.fetch(x, y)
    }
}

/// Arguments for one [`PixelKernel`] invocation.
#[derive(Clone, Copy, Debug)]
pub struct KernelInput<'a> {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub uniforms: &'a [f32],
    pub inputs: &'a [TexelView<'a>],
}

impl KernelInput<'_> {
    /// Normalized coordinate of the pixel center.
    pub fn uv(&self) -> (f32, f32) {
        (
            (self.x as f32 + 0.5) / self.width as f32,
            (self.y as f32 + 0.5) / self.height as f32,
        )
    }
}

/// Source of a filter program.
///
/// GPU contexts prepend a fixed vertex stage drawing the unit quad and expect
/// a fragment entry point `fs_main` taking `@location(0) uv: vec2<f32>` with:
///
/// - `@group(0) @binding(0) var<uniform> u: array<vec4<f32>, 16>;`
/// - `@group(0) @binding(1) var s: sampler;` (nearest, clamp-to-edge)
/// - `@group(0) @binding(2 + i) var t_i: texture_2d<f32>;` for each input
///
/// The software context runs `kernel` instead and rejects programs without one.
#[derive(Clone, Debug)]
pub struct ProgramDesc {
    pub label: Cow<'static, str>,
    pub fragment_wgsl: Cow<'static, str>,
    pub inputs: u32,
    pub kernel: Option<PixelKernel>,
}

impl ProgramDesc {
    pub fn new(
        label: impl Into<Cow<'static, str>>,
        fragment_wgsl: impl Into<Cow<'static, str>>,
        inputs: u32,
    ) -> Self {
        Self {
            label: label.into(),
            fragment_wgsl: fragment_wgsl.into(),
            inputs,
            kernel: None,
        }
    }

    pub fn with_kernel(mut self, kernel: PixelKernel) -> Self {
        self.kernel = Some(kernel);
        self
    }
}

/// One quad draw into the bound framebuffer's color attachment.
#[derive(Clone, Copy, Debug)]
pub struct DrawCall<'a> {
    pub program: ProgramHandle,
    pub inputs: &'a [TextureHandle],
    pub uniforms: &'a [f32],
    /// Defaults to the full attachment.
    pub viewport: Option<Extent>,
}

/// A GPU command context.
///
/// Textures are RGBA8 with nearest filtering and clamp-to-edge addressing.
/// Pixel rows are top-down everywhere.
pub trait GraphicsContext {
    fn attributes(&self) -> ContextAttributes;

    /// Size of the backing surface the context was created with.
    fn drawing_buffer_size(&self) -> Extent;

    fn max_texture_size(&self) -> u32;

    /// Whether a fragment shader at `precision` compiles on this context.
    fn supports_precision(&mut self, precision: Precision) -> bool;

    /// Unmasked renderer/vendor strings, `None` when not exposed.
    fn debug_renderer_info(&self) -> Option<GpuInfo>;

    fn is_context_lost(&self) -> bool;

    /// Force the context into the lost state.
    fn lose_context(&mut self);

    fn stats(&self) -> ContextStats;

    /// Allocate an uninitialized texture.
    fn create_texture(&mut self, width: u32, height: u32) -> RasterFxResult<TextureHandle>;

    /// Replace the full contents of `texture` with tightly packed RGBA8 bytes.
    fn upload_texture(&mut self, texture: TextureHandle, pixels: &[u8]) -> RasterFxResult<()>;

    /// Unknown handles are ignored.
    fn delete_texture(&mut self, texture: TextureHandle);

    fn texture_size(&self, texture: TextureHandle) -> Option<Extent>;

    fn create_framebuffer(&mut self) -> RasterFxResult<FramebufferHandle>;

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>);

    /// Set the color attachment of the bound framebuffer.
    fn framebuffer_texture(&mut self, texture: Option<TextureHandle>) -> RasterFxResult<()>;

    /// Color attachment of the bound framebuffer.
    fn framebuffer_attachment(&self) -> Option<TextureHandle>;

    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle);

    fn create_program(&mut self, desc: &ProgramDesc) -> RasterFxResult<ProgramHandle>;

    fn delete_program(&mut self, program: ProgramHandle);

    fn draw(&mut self, call: &DrawCall<'_>) -> RasterFxResult<()>;

    /// Read `width * height` pixels from the origin of the bound framebuffer's
    /// attachment into `out`. Pixels outside the attachment read as zero.
    fn read_pixels(&mut self, width: u32, height: u32, out: &mut [u8]) -> RasterFxResult<()>;
}

/// How a context relates to the display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextMode {
    /// Fully offscreen.
    Offscreen,
    /// Bound to a caller-owned presentation surface.
    Attached,
}

/// Creates graphics contexts for a backend.
pub trait ContextFactory {
    fn mode(&self) -> ContextMode;

    fn name(&self) -> &'static str;

    /// `None` when the platform cannot produce a context.
    fn create(
        &self,
        extent: Extent,
        attributes: &ContextAttributes,
    ) -> Option<Box<dyn GraphicsContext>>;
}

/// Context family selected by configuration.
///
/// `Software` and `Headless` are offscreen. `Attached` needs a presentation
/// surface that configuration cannot carry: build an `AttachedContextFactory`
/// and pass it to `FilterBackend::with_factory`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    /// CPU emulation, always available.
    #[default]
    Software,
    /// Headless wgpu device. Requires the `gpu` feature.
    Headless,
    /// wgpu device presenting to a caller-owned surface.
    Attached,
}

impl ContextKind {
    pub fn mode(self) -> ContextMode {
        match self {
            ContextKind::Software | ContextKind::Headless => ContextMode::Offscreen,
            ContextKind::Attached => ContextMode::Attached,
        }
    }
}

/// Map a [`ContextKind`] to its factory.
pub fn create_context_factory(kind: ContextKind) -> RasterFxResult<Box<dyn ContextFactory>> {
    match kind {
        ContextKind::Software => Ok(Box::new(SoftwareContextFactory::default())),
        #[cfg(feature = "gpu")]
        ContextKind::Headless => Ok(Box::new(HeadlessContextFactory::default())),
        ContextKind::Attached => Err(RasterFxError::config(
            "attached contexts need a surface; pass an attached factory to FilterBackend::with_factory",
        )),
        #[allow(unreachable_patterns)]
        _ => Err(RasterFxError::config(
            "headless gpu contexts require the `gpu` feature",
        )),
    }
}

pub(crate) fn check_upload(extent: Extent, pixels: &[u8]) -> RasterFxResult<()> {
    if pixels.len() != extent.byte_len() {
        return Err(RasterFxError::validation(format!(
            "upload into {extent} texture needs {} bytes, got {}",
            extent.byte_len(),
            pixels.len()
        )));
    }
    Ok(())
}

pub(crate) fn check_draw(
    call: &DrawCall<'_>,
    attachment: Option<TextureHandle>,
    expected_inputs: u32,
) -> RasterFxResult<TextureHandle> {
    let target = attachment
        .ok_or_else(|| RasterFxError::pipeline("draw without a framebuffer attachment"))?;
    if call.inputs.len() != expected_inputs as usize {
        return Err(RasterFxError::pipeline(format!(
            "program expects {expected_inputs} input textures, got {}",
            call.inputs.len()
        )));
    }
    if call.inputs.contains(&target) {
        return Err(RasterFxError::pipeline(
            "a texture cannot be sampled while it is the draw target",
        ));
    }
    if call.uniforms.len() > MAX_UNIFORM_FLOATS {
        return Err(RasterFxError::pipeline(format!(
            "at most {MAX_UNIFORM_FLOATS} uniforms per draw, got {}",
            call.uniforms.len()
        )));
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texel_fetch_clamps_to_edge() {
        let data = [1, 1, 1, 1, 2, 2, 2, 2];
        let view = TexelView {
            width: 2,
            height: 1,
            data: &data,
        };
        assert_eq!(view.fetch(-5, 0), [1; 4]);
        assert_eq!(view.fetch(9, 3), [2; 4]);
        assert_eq!(view.sample(0.75, 0.5), [2; 4]);
    }

    #[test]
    fn headless_kind_needs_gpu_feature() {
        let res = create_context_factory(ContextKind::Headless);
        if cfg!(feature = "gpu") {
            assert!(res.is_ok());
        } else {
            assert!(res.is_err());
        }
        let sw = create_context_factory(ContextKind::Software).unwrap();
        assert_eq!(sw.mode(), ContextMode::Offscreen);
    }

    #[test]
    fn attached_kind_is_not_buildable_from_config() {
        let err = match create_context_factory(ContextKind::Attached) {
            Ok(_) => panic!("attached factory built without a surface"),
            Err(e) => e,
        };
        assert!(matches!(err, RasterFxError::Config(_)));
        assert!(err.to_string().contains("surface"));
        assert_eq!(ContextKind::Attached.mode(), ContextMode::Attached);
        assert_eq!(ContextKind::Headless.mode(), ContextMode::Offscreen);
    }

    #[test]
    fn precision_names_match_shader_qualifiers() {
        assert_eq!(Precision::Low.to_string(), "lowp");
        assert_eq!(Precision::PROBE_ORDER[0], Precision::Low);
    }
}
