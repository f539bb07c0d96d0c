#![forbid(unsafe_code)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod foundation;
pub mod pipeline;
pub mod probe;
pub mod readback;
pub mod surface;
pub mod texture;

pub use backend::FilterBackend;
pub use cache::{CacheStats, HelperLayers, ProgramCache, ProgramKey, ResourceCache};
pub use config::{BackendOptions, DEFAULT_TILE_SIZE};
pub use context::{
    ContextAttributes, ContextFactory, ContextKind, ContextMode, ContextStats, DrawCall,
    FramebufferHandle, GpuInfo, GraphicsContext, KernelInput, PixelKernel, Precision, ProgramDesc,
    ProgramHandle, SoftwareContext, SoftwareContextFactory, TexelView, TextureHandle,
    create_context_factory,
};
#[cfg(feature = "gpu")]
pub use context::{AttachedContextFactory, HeadlessContextFactory, WgpuContext};
pub use foundation::core::{CacheKey, Extent};
pub use foundation::error::{RasterFxError, RasterFxResult};
pub use pipeline::{Filter, PipelineOutcome, PipelineState};
pub use probe::{Capabilities, CapabilityProbe, CapabilityQuery, FactoryQuery, capability_probe};
pub use surface::{ImageData, ImageSource, RasterSurface};
