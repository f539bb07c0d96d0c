use crate::{
    cache::{CacheStats, ResourceCache},
    config::BackendOptions,
    context::{
        ContextAttributes, ContextFactory, ContextMode, GpuInfo, GraphicsContext, TextureHandle,
        create_context_factory,
    },
    foundation::{
        core::{CacheKey, Extent},
        error::{RasterFxError, RasterFxResult},
    },
    pipeline::{Executor, Filter, PipelineOutcome},
    readback::ReadbackBuffer,
    surface::{ImageSource, RasterSurface},
    texture::{self, ConversionSurface},
};

/// Filter execution backend owning one graphics context at a time.
///
/// Not reentrant: one [`FilterBackend::apply_filters`] call runs to completion
/// before the next may start. Use one backend per thread for parallel work.
pub struct FilterBackend {
    options: BackendOptions,
    factory: Box<dyn ContextFactory>,
    context: Option<Box<dyn GraphicsContext>>,
    drawing_buffer: Extent,
    readback: ReadbackBuffer,
    conversion: ConversionSurface,
    gpu_info: Option<GpuInfo>,
    cache: ResourceCache,
}

impl FilterBackend {
    /// Build a backend with the factory named by `options.context`.
    pub fn new(options: BackendOptions) -> RasterFxResult<Self> {
        let factory = create_context_factory(options.context)?;
        Self::with_factory(options, factory)
    }

    /// Build a backend around a caller-supplied factory.
    ///
    /// A factory that cannot produce a context is not an error here; check
    /// [`FilterBackend::has_context`] before filtering.
    pub fn with_factory(
        options: BackendOptions,
        factory: Box<dyn ContextFactory>,
    ) -> RasterFxResult<Self> {
        options.validate()?;
        let tile = options.tile_size;
        let mut backend = Self {
            options,
            factory,
            context: None,
            drawing_buffer: Extent::default(),
            readback: ReadbackBuffer::default(),
            conversion: ConversionSurface::new(),
            gpu_info: None,
            cache: ResourceCache::new(),
        };
        backend.setup(tile, tile);
        backend.capture_gpu_info();
        Ok(backend)
    }

    /// Replace the current context with a fresh one backed by a `width` x
    /// `height` surface. Returns whether a context was obtained.
    pub fn setup(&mut self, width: u32, height: u32) -> bool {
        self.dispose();
        let extent = Extent::new(width, height);
        let Some(context) = self.factory.create(extent, &ContextAttributes::FILTERING) else {
            tracing::warn!(
                factory = self.factory.name(),
                %extent,
                "graphics context creation failed; gpu filtering disabled"
            );
            return false;
        };
        let max = context.max_texture_size();
        if !extent.fits_within(Extent::new(max, max)) {
            tracing::warn!(
                factory = self.factory.name(),
                %extent,
                max_texture_size = max,
                "graphics context too small for the requested surface; gpu filtering disabled"
            );
            return false;
        }
        let readback = match ReadbackBuffer::new(extent) {
            Ok(readback) => readback,
            Err(e) => {
                tracing::warn!(
                    factory = self.factory.name(),
                    %extent,
                    error = %e,
                    "readback buffer unavailable; gpu filtering disabled"
                );
                return false;
            }
        };
        self.context = Some(context);
        self.drawing_buffer = extent;
        self.readback = readback;
        self.conversion = ConversionSurface::new();
        tracing::debug!(factory = self.factory.name(), %extent, "graphics context ready");
        true
    }

    /// Drop the context and every cached resource created on it.
    pub fn dispose(&mut self) {
        match self.context.as_deref_mut() {
            Some(ctx) => self.cache.clear(ctx),
            None => self.cache.forget(),
        }
        if self.context.take().is_some() {
            tracing::debug!("graphics context disposed");
        }
        self.drawing_buffer = Extent::default();
        self.readback = ReadbackBuffer::default();
    }

    /// Recover from context loss: dispose and set up again at the tile size.
    pub fn restore(&mut self) -> bool {
        tracing::debug!("restoring graphics context");
        let tile = self.options.tile_size;
        self.setup(tile, tile)
    }

    /// Whether a live (present and not lost) context exists.
    pub fn has_context(&self) -> bool {
        self.context
            .as_deref()
            .is_some_and(|ctx| !ctx.is_context_lost())
    }

    pub fn tile_size(&self) -> u32 {
        self.options.tile_size
    }

    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    pub fn mode(&self) -> ContextMode {
        self.factory.mode()
    }

    /// Surface size of the current context; zero without one.
    pub fn drawing_buffer_size(&self) -> Extent {
        self.drawing_buffer
    }

    pub fn context(&self) -> Option<&dyn GraphicsContext> {
        self.context.as_deref()
    }

    pub fn context_mut(&mut self) -> Option<&mut (dyn GraphicsContext + 'static)> {
        self.context.as_deref_mut()
    }

    /// Lower-cased renderer and vendor strings of the current context.
    ///
    /// Memoized once a live context has answered, even when it exposes no
    /// strings; empty without a live context.
    pub fn capture_gpu_info(&mut self) -> GpuInfo {
        if let Some(info) = &self.gpu_info {
            return info.clone();
        }
        let Some(ctx) = self
            .context
            .as_deref()
            .filter(|ctx| !ctx.is_context_lost())
        else {
            return GpuInfo::default();
        };
        let info = ctx
            .debug_renderer_info()
            .map(|raw| GpuInfo {
                renderer: raw.renderer.to_lowercase(),
                vendor: raw.vendor.to_lowercase(),
            })
            .unwrap_or_default();
        self.gpu_info = Some(info.clone());
        info
    }

    /// Texture cached under `key`, uploading `source` on first use.
    pub fn get_cached_texture(
        &mut self,
        key: &CacheKey,
        source: &dyn ImageSource,
    ) -> RasterFxResult<TextureHandle> {
        let ctx = live(&mut self.context)?;
        self.cache
            .get_or_create_texture(ctx, &mut self.conversion, key, source)
    }

    /// Destroy the texture cached under `key`. Returns whether one existed.
    pub fn evict_caches_for_key(&mut self, key: &CacheKey) -> bool {
        match self.context.as_deref_mut() {
            Some(ctx) => self.cache.evict(ctx, key),
            None => false,
        }
    }

    /// Destroy every cached texture, program and helper layer.
    pub fn clear_caches(&mut self) {
        match self.context.as_deref_mut() {
            Some(ctx) => self.cache.clear(ctx),
            None => self.cache.forget(),
        }
    }

    pub fn cached_texture_count(&self) -> usize {
        self.cache.texture_count()
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Uncached texture of exactly `width` x `height`. The caller owns it and
    /// releases it with [`FilterBackend::delete_texture`].
    pub fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        source: Option<&dyn ImageSource>,
    ) -> RasterFxResult<TextureHandle> {
        let ctx = live(&mut self.context)?;
        texture::create_texture(ctx, &mut self.conversion, width, height, source)
    }

    pub fn delete_texture(&mut self, texture: TextureHandle) {
        if let Some(ctx) = self.context.as_deref_mut() {
            ctx.delete_texture(texture);
        }
    }

    /// Run `filters` over `source` at a `width` x `height` working size and
    /// read the result into `target`.
    ///
    /// `None` entries are skipped; an empty chain copies the source. `target`
    /// is resized to the final destination size when it differs, and its
    /// transform is reset to identity. With `cache_key`, the source upload is
    /// reused across calls: the same key must always mean the same pixels.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(filters = filters.len(), width = width, height = height, cached = cache_key.is_some())
    )]
    pub fn apply_filters(
        &mut self,
        filters: &[Option<&dyn Filter>],
        source: &dyn ImageSource,
        width: u32,
        height: u32,
        target: &mut RasterSurface,
        cache_key: Option<&CacheKey>,
    ) -> RasterFxResult<PipelineOutcome> {
        let ctx = live(&mut self.context)?;
        Executor {
            ctx,
            cache: &mut self.cache,
            conversion: &mut self.conversion,
            readback: &mut self.readback,
        }
        .run(filters, source, width, height, target, cache_key)
    }
}

impl std::fmt::Debug for FilterBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterBackend")
            .field("options", &self.options)
            .field("factory", &self.factory.name())
            .field("has_context", &self.has_context())
            .field("drawing_buffer", &self.drawing_buffer)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

fn live(
    context: &mut Option<Box<dyn GraphicsContext>>,
) -> RasterFxResult<&mut (dyn GraphicsContext + 'static)> {
    match context.as_deref_mut() {
        Some(ctx) if ctx.is_context_lost() => Err(RasterFxError::context(
            "graphics context was lost; restore the backend",
        )),
        Some(ctx) => Ok(ctx),
        None => Err(RasterFxError::context("no graphics context; call setup first")),
    }
}
