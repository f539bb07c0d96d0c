use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use rasterfx::{
    BackendOptions, CacheKey, ContextAttributes, ContextFactory, ContextKind, ContextMode,
    ContextStats, DrawCall, Extent, Filter, FilterBackend, FramebufferHandle, GpuInfo,
    GraphicsContext, PipelineState, Precision, ProgramDesc, ProgramHandle, RasterFxResult,
    RasterSurface, SoftwareContext, SoftwareContextFactory, TextureHandle,
};

fn backend() -> FilterBackend {
    FilterBackend::with_factory(
        BackendOptions {
            tile_size: 32,
            ..BackendOptions::default()
        },
        Box::new(SoftwareContextFactory::default()),
    )
    .unwrap()
}

fn solid(width: u32, height: u32, px: [u8; 4]) -> RasterSurface {
    RasterSurface::from_rgba8(width, height, px.repeat((width * height) as usize)).unwrap()
}

/// Keeps a named helper layer alive across runs.
struct KeepsHelper;

impl Filter for KeepsHelper {
    fn apply_to(&self, state: &mut PipelineState<'_>) -> RasterFxResult<()> {
        let (w, h) = (state.source_width, state.source_height);
        state.helper_layer("scratch", w, h)?;
        Ok(())
    }
}

#[test]
fn new_uses_configured_context_kind() {
    let b = FilterBackend::new(BackendOptions::default()).unwrap();
    assert!(b.has_context());
    assert_eq!(b.tile_size(), 2048);
    assert_eq!(b.drawing_buffer_size(), Extent::new(2048, 2048));
    assert_eq!(b.options().context, ContextKind::Software);
}

#[test]
fn cache_hit_skips_upload() {
    let mut b = backend();
    let key = CacheKey::from("photo");
    let src = solid(4, 4, [1, 2, 3, 255]);

    let first = b.get_cached_texture(&key, &src).unwrap();
    let uploads = b.context().unwrap().stats().uploads;
    let second = b.get_cached_texture(&key, &src).unwrap();

    assert_eq!(first, second);
    assert_eq!(b.context().unwrap().stats().uploads, uploads);
    assert_eq!(b.cache_stats().texture_uploads, 1);
    assert_eq!(b.cache_stats().texture_hits, 1);
}

#[test]
fn eviction_forces_fresh_upload() {
    let mut b = backend();
    let key = CacheKey::from("photo");
    let src = solid(4, 4, [1, 2, 3, 255]);

    let before = b.get_cached_texture(&key, &src).unwrap();
    assert!(b.evict_caches_for_key(&key));
    assert!(!b.evict_caches_for_key(&key));
    assert_eq!(b.context().unwrap().texture_size(before), None);

    let after = b.get_cached_texture(&key, &src).unwrap();
    assert_ne!(before, after);
    assert_eq!(b.cache_stats().texture_uploads, 2);
    assert_eq!(b.cache_stats().evictions, 1);
}

#[test]
fn dispose_invalidates_everything() {
    let mut b = backend();
    let src = solid(2, 2, [9, 9, 9, 255]);
    let mut target = RasterSurface::new(2, 2);
    b.apply_filters(
        &[Some(&KeepsHelper)],
        &src,
        2,
        2,
        &mut target,
        Some(&CacheKey::from("a")),
    )
    .unwrap();
    assert_eq!(b.cached_texture_count(), 1);
    assert_eq!(b.cache().helpers().len(), 1);

    b.dispose();

    assert!(!b.has_context());
    assert!(b.cache().is_empty());
    assert_eq!(b.cached_texture_count(), 0);
    let err = b
        .apply_filters(&[], &src, 2, 2, &mut target, None)
        .unwrap_err();
    assert!(err.is_context());
    assert!(b.get_cached_texture(&"a".into(), &src).unwrap_err().is_context());

    assert!(b.setup(32, 32));
    b.apply_filters(&[], &src, 2, 2, &mut target, None).unwrap();
    assert_eq!(target.pixel(0, 0), Some([9, 9, 9, 255]));
}

#[test]
fn helper_layers_persist_across_runs() {
    let mut b = backend();
    let src = solid(3, 3, [0, 0, 0, 255]);
    let mut target = RasterSurface::new(3, 3);

    for _ in 0..3 {
        b.apply_filters(&[Some(&KeepsHelper)], &src, 3, 3, &mut target, None)
            .unwrap();
    }
    assert_eq!(b.cache().helpers().len(), 1);
    assert_eq!(b.context().unwrap().stats().live_textures, 1);

    b.clear_caches();
    assert_eq!(b.context().unwrap().stats().live_textures, 0);
}

#[test]
fn failed_setup_is_reported_not_fatal() {
    let mut b = FilterBackend::with_factory(
        BackendOptions::default(),
        Box::new(SoftwareContextFactory::unavailable()),
    )
    .unwrap();
    assert!(!b.has_context());
    assert!(b.context().is_none());
    assert!(!b.restore());

    let src = solid(1, 1, [1, 1, 1, 1]);
    let mut target = RasterSurface::new(1, 1);
    let err = b
        .apply_filters(&[], &src, 1, 1, &mut target, None)
        .unwrap_err();
    assert!(err.is_context());
    assert!(!b.evict_caches_for_key(&"x".into()));
    b.clear_caches();
    b.dispose();
}

#[test]
fn setup_beyond_factory_limit_leaves_no_context() {
    let mut b = FilterBackend::with_factory(
        BackendOptions {
            tile_size: 8,
            ..BackendOptions::default()
        },
        Box::new(SoftwareContextFactory::new(16)),
    )
    .unwrap();
    assert!(b.has_context());
    assert!(!b.setup(64, 64));
    assert!(!b.has_context());
    assert!(b.restore());
    assert_eq!(b.drawing_buffer_size(), Extent::new(8, 8));
}

#[test]
fn lost_context_needs_restore() {
    let mut b = backend();
    let src = solid(2, 2, [5, 6, 7, 255]);
    let key = CacheKey::from("k");
    let mut target = RasterSurface::new(2, 2);
    b.get_cached_texture(&key, &src).unwrap();

    b.context_mut().unwrap().lose_context();
    assert!(!b.has_context());
    assert!(
        b.apply_filters(&[], &src, 2, 2, &mut target, Some(&key))
            .unwrap_err()
            .is_context()
    );

    assert!(b.restore());
    assert_eq!(b.cached_texture_count(), 0);
    b.apply_filters(&[], &src, 2, 2, &mut target, Some(&key))
        .unwrap();
    assert_eq!(target.pixel(1, 1), Some([5, 6, 7, 255]));
}

#[test]
fn uncached_textures_belong_to_the_caller() {
    let mut b = backend();
    let src = solid(3, 1, [4, 4, 4, 255]);
    let t = b.create_texture(5, 2, Some(&src)).unwrap();
    assert_eq!(b.context().unwrap().texture_size(t), Some(Extent::new(5, 2)));
    assert_eq!(b.cached_texture_count(), 0);

    b.delete_texture(t);
    assert_eq!(b.context().unwrap().stats().live_textures, 0);
}

/// Software context that reports fixed renderer strings and counts how often
/// they are asked for.
struct BrandedContext {
    inner: SoftwareContext,
    info: Option<GpuInfo>,
    queries: Arc<AtomicUsize>,
}

impl GraphicsContext for BrandedContext {
    fn attributes(&self) -> ContextAttributes {
        self.inner.attributes()
    }
    fn drawing_buffer_size(&self) -> Extent {
        self.inner.drawing_buffer_size()
    }
    fn max_texture_size(&self) -> u32 {
        self.inner.max_texture_size()
    }
    fn supports_precision(&mut self, precision: Precision) -> bool {
        self.inner.supports_precision(precision)
    }
    fn debug_renderer_info(&self) -> Option<GpuInfo> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.info.clone()
    }
    fn is_context_lost(&self) -> bool {
        self.inner.is_context_lost()
    }
    fn lose_context(&mut self) {
        self.inner.lose_context()
    }
    fn stats(&self) -> ContextStats {
        self.inner.stats()
    }
    fn create_texture(&mut self, width: u32, height: u32) -> RasterFxResult<TextureHandle> {
        self.inner.create_texture(width, height)
    }
    fn upload_texture(&mut self, texture: TextureHandle, pixels: &[u8]) -> RasterFxResult<()> {
        self.inner.upload_texture(texture, pixels)
    }
    fn delete_texture(&mut self, texture: TextureHandle) {
        self.inner.delete_texture(texture)
    }
    fn texture_size(&self, texture: TextureHandle) -> Option<Extent> {
        self.inner.texture_size(texture)
    }
    fn create_framebuffer(&mut self) -> RasterFxResult<FramebufferHandle> {
        self.inner.create_framebuffer()
    }
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>) {
        self.inner.bind_framebuffer(framebuffer)
    }
    fn framebuffer_texture(&mut self, texture: Option<TextureHandle>) -> RasterFxResult<()> {
        self.inner.framebuffer_texture(texture)
    }
    fn framebuffer_attachment(&self) -> Option<TextureHandle> {
        self.inner.framebuffer_attachment()
    }
    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.inner.delete_framebuffer(framebuffer)
    }
    fn create_program(&mut self, desc: &ProgramDesc) -> RasterFxResult<ProgramHandle> {
        self.inner.create_program(desc)
    }
    fn delete_program(&mut self, program: ProgramHandle) {
        self.inner.delete_program(program)
    }
    fn draw(&mut self, call: &DrawCall<'_>) -> RasterFxResult<()> {
        self.inner.draw(call)
    }
    fn read_pixels(&mut self, width: u32, height: u32, out: &mut [u8]) -> RasterFxResult<()> {
        self.inner.read_pixels(width, height, out)
    }
}

struct BrandedFactory {
    info: Option<GpuInfo>,
    queries: Arc<AtomicUsize>,
}

impl ContextFactory for BrandedFactory {
    fn mode(&self) -> ContextMode {
        ContextMode::Offscreen
    }

    fn name(&self) -> &'static str {
        "branded"
    }

    fn create(
        &self,
        extent: Extent,
        attributes: &ContextAttributes,
    ) -> Option<Box<dyn GraphicsContext>> {
        Some(Box::new(BrandedContext {
            inner: SoftwareContext::new(extent, *attributes, 1024),
            info: self.info.clone(),
            queries: self.queries.clone(),
        }))
    }
}

fn branded_backend(info: Option<GpuInfo>) -> (FilterBackend, Arc<AtomicUsize>) {
    let queries = Arc::new(AtomicUsize::new(0));
    let b = FilterBackend::with_factory(
        BackendOptions {
            tile_size: 16,
            ..BackendOptions::default()
        },
        Box::new(BrandedFactory {
            info,
            queries: queries.clone(),
        }),
    )
    .unwrap();
    (b, queries)
}

#[test]
fn gpu_info_is_lower_cased_and_captured_once() {
    let (mut b, queries) = branded_backend(Some(GpuInfo {
        renderer: "Mesa X".to_string(),
        vendor: "ACME".to_string(),
    }));

    for _ in 0..3 {
        let info = b.capture_gpu_info();
        assert_eq!(info.renderer, "mesa x");
        assert_eq!(info.vendor, "acme");
    }
    assert_eq!(queries.load(Ordering::SeqCst), 1);

    assert!(b.restore());
    assert_eq!(b.capture_gpu_info().renderer, "mesa x");
    assert_eq!(queries.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_gpu_info_is_captured_once() {
    let (mut b, queries) = branded_backend(None);

    assert_eq!(b.capture_gpu_info(), GpuInfo::default());
    assert_eq!(b.capture_gpu_info(), GpuInfo::default());
    assert_eq!(queries.load(Ordering::SeqCst), 1);
}

#[test]
fn unrepresentable_tile_fails_setup_without_panicking() {
    let b = FilterBackend::with_factory(
        BackendOptions {
            tile_size: u32::MAX,
            ..BackendOptions::default()
        },
        Box::new(SoftwareContextFactory::new(u32::MAX)),
    )
    .unwrap();
    assert!(!b.has_context());
    assert_eq!(b.drawing_buffer_size(), Extent::default());
}

#[test]
fn tile_beyond_context_texture_limit_fails_setup() {
    let (mut b, _) = branded_backend(None);
    assert!(!b.setup(2048, 2048));
    assert!(!b.has_context());
    assert!(b.restore());
}
