use std::{
    collections::HashMap,
    num::NonZeroU64,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::foundation::{
    core::{BYTES_PER_PIXEL, Extent, QUAD_VERTICES},
    error::{RasterFxError, RasterFxResult},
};

use super::{
    ContextAttributes, ContextFactory, ContextMode, ContextStats, DrawCall, FramebufferHandle,
    GpuInfo, GraphicsContext, MAX_UNIFORM_FLOATS, Precision, ProgramDesc, ProgramHandle,
    TextureHandle, check_draw, check_upload,
};

const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const UNIFORM_BYTES: u64 = (MAX_UNIFORM_FLOATS * 4) as u64;
const FIRST_INPUT_BINDING: u32 = 2;

/// Vertex stage prepended to every program's fragment source.
const QUAD_VERTEX_WGSL: &str = r#"
struct QuadOut {
  @builtin(position) pos: vec4<f32>,
  @location(0) uv: vec2<f32>,
};

@vertex
fn vs_quad(@location(0) corner: vec2<f32>) -> QuadOut {
  var o: QuadOut;
  o.pos = vec4<f32>(corner.x * 2.0 - 1.0, 1.0 - corner.y * 2.0, 0.0, 1.0);
  o.uv = corner;
  return o;
}
"#;

fn precision_probe_wgsl(precision: Precision) -> &'static str {
    match precision {
        Precision::Low => {
            "enable f16;\n@fragment fn fs_main() -> @location(0) vec4<f32> { let x: f16 = 0.5h; return vec4<f32>(f32(x)); }"
        }
        Precision::Medium => {
            "@fragment fn fs_main() -> @location(0) vec4<f32> { let x: f32 = 0.5; return vec4<f32>(x); }"
        }
        Precision::High => {
            "@fragment fn fs_main() -> @location(0) vec4<f32> { let x: f64 = 0.5lf; return vec4<f32>(f32(x)); }"
        }
    }
}

fn required_feature(precision: Precision) -> wgpu::Features {
    match precision {
        Precision::Low => wgpu::Features::SHADER_F16,
        Precision::Medium => wgpu::Features::empty(),
        Precision::High => wgpu::Features::SHADER_F64,
    }
}

struct OpenDevice {
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
}

fn open_device(
    instance: &wgpu::Instance,
    compatible_surface: Option<&wgpu::Surface<'_>>,
) -> RasterFxResult<OpenDevice> {
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface,
        force_fallback_adapter: false,
    }))
    .map_err(|e| match e {
        wgpu::RequestAdapterError::NotFound { .. } => {
            RasterFxError::context("no gpu adapter available")
        }
        other => RasterFxError::context(format!("wgpu request_adapter failed: {other:?}")),
    })?;

    let optional = wgpu::Features::SHADER_F16 | wgpu::Features::SHADER_F64;
    let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
        label: Some("rasterfx"),
        required_features: adapter.features() & optional,
        required_limits: adapter.limits(),
        experimental_features: wgpu::ExperimentalFeatures::default(),
        memory_hints: wgpu::MemoryHints::Performance,
        trace: wgpu::Trace::Off,
    }))
    .map_err(|e| RasterFxError::context(format!("wgpu request_device failed: {e:?}")))?;

    Ok(OpenDevice {
        adapter,
        device,
        queue,
    })
}

impl OpenDevice {
    /// Reject surfaces the device cannot back with a single texture.
    fn check_extent(&self, extent: Extent) -> RasterFxResult<()> {
        let max = self.device.limits().max_texture_dimension_2d;
        if !fits_texture_limit(extent, max) {
            return Err(RasterFxError::context(format!(
                "{extent} surface does not fit the device texture limit of {max}"
            )));
        }
        Ok(())
    }
}

fn fits_texture_limit(extent: Extent, max_dimension: u32) -> bool {
    !extent.is_empty() && extent.fits_within(Extent::new(max_dimension, max_dimension))
}

/// Surface alpha mode matching the context's alpha attributes.
fn surface_alpha_mode(
    supported: &[wgpu::CompositeAlphaMode],
    premultiplied_alpha: bool,
) -> wgpu::CompositeAlphaMode {
    use wgpu::CompositeAlphaMode as Mode;
    let preferred: &[Mode] = if premultiplied_alpha {
        &[Mode::PreMultiplied, Mode::Opaque]
    } else {
        &[Mode::PostMultiplied, Mode::Opaque]
    };
    preferred
        .iter()
        .copied()
        .find(|mode| supported.contains(mode))
        .or_else(|| supported.first().copied())
        .unwrap_or(Mode::Auto)
}

/// Offscreen wgpu contexts on the default adapter.
#[derive(Clone, Debug, Default)]
pub struct HeadlessContextFactory {
    backends: Option<wgpu::Backends>,
}

impl HeadlessContextFactory {
    /// Restrict adapter discovery to `backends`.
    pub fn with_backends(backends: wgpu::Backends) -> Self {
        Self {
            backends: Some(backends),
        }
    }
}

impl ContextFactory for HeadlessContextFactory {
    fn mode(&self) -> ContextMode {
        ContextMode::Offscreen
    }

    fn name(&self) -> &'static str {
        "wgpu-headless"
    }

    fn create(
        &self,
        extent: Extent,
        attributes: &ContextAttributes,
    ) -> Option<Box<dyn GraphicsContext>> {
        let mut desc = wgpu::InstanceDescriptor::default();
        if let Some(backends) = self.backends {
            desc.backends = backends;
        }
        let instance = wgpu::Instance::new(&desc);
        let opened = open_device(&instance, None).and_then(|d| {
            d.check_extent(extent)?;
            WgpuContext::new(d, extent, *attributes)
        });
        match opened {
            Ok(ctx) => Some(Box::new(ctx)),
            Err(e) => {
                tracing::debug!(error = %e, "headless wgpu context unavailable");
                None
            }
        }
    }
}

/// wgpu contexts on an adapter that can present to a caller-owned surface.
///
/// The surface is reconfigured at the requested extent on every creation.
pub struct AttachedContextFactory {
    instance: wgpu::Instance,
    surface: wgpu::Surface<'static>,
}

impl AttachedContextFactory {
    pub fn new(instance: wgpu::Instance, surface: wgpu::Surface<'static>) -> Self {
        Self { instance, surface }
    }

    pub fn surface(&self) -> &wgpu::Surface<'static> {
        &self.surface
    }

    fn attach(&self, extent: Extent, attributes: ContextAttributes) -> RasterFxResult<WgpuContext> {
        if extent.is_empty() {
            return Err(RasterFxError::validation(format!(
                "cannot configure a {extent} surface"
            )));
        }
        let opened = open_device(&self.instance, Some(&self.surface))?;
        opened.check_extent(extent)?;
        let caps = self.surface.get_capabilities(&opened.adapter);
        let format = caps
            .formats
            .first()
            .copied()
            .ok_or_else(|| RasterFxError::context("surface reports no supported formats"))?;
        let alpha_mode = surface_alpha_mode(&caps.alpha_modes, attributes.premultiplied_alpha);
        self.surface.configure(
            &opened.device,
            &wgpu::SurfaceConfiguration {
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                format,
                width: extent.width,
                height: extent.height,
                present_mode: wgpu::PresentMode::Fifo,
                desired_maximum_frame_latency: 2,
                alpha_mode,
                view_formats: vec![],
            },
        );
        WgpuContext::new(opened, extent, attributes)
    }
}

impl ContextFactory for AttachedContextFactory {
    fn mode(&self) -> ContextMode {
        ContextMode::Attached
    }

    fn name(&self) -> &'static str {
        "wgpu-attached"
    }

    fn create(
        &self,
        extent: Extent,
        attributes: &ContextAttributes,
    ) -> Option<Box<dyn GraphicsContext>> {
        match self.attach(extent, *attributes) {
            Ok(ctx) => Some(Box::new(ctx)),
            Err(e) => {
                tracing::debug!(error = %e, "attached wgpu context unavailable");
                None
            }
        }
    }
}

struct GpuTexture {
    extent: Extent,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct GpuProgram {
    inputs: u32,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

/// A [`GraphicsContext`] on a wgpu device.
pub struct WgpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    attributes: ContextAttributes,
    drawing_buffer: Extent,
    lost: Arc<AtomicBool>,

    next_id: u64,
    textures: HashMap<TextureHandle, GpuTexture>,
    framebuffers: HashMap<FramebufferHandle, Option<TextureHandle>>,
    bound: Option<FramebufferHandle>,
    programs: HashMap<ProgramHandle, GpuProgram>,

    quad: wgpu::Buffer,
    uniforms: wgpu::Buffer,
    sampler: wgpu::Sampler,
    staging: Option<(wgpu::Buffer, u64)>,
    precision: HashMap<Precision, bool>,
    stats: ContextStats,
}

impl WgpuContext {
    fn new(opened: OpenDevice, drawing_buffer: Extent, attributes: ContextAttributes) -> RasterFxResult<Self> {
        let OpenDevice {
            adapter,
            device,
            queue,
        } = opened;

        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            tracing::warn!(?reason, %message, "wgpu device lost");
            flag.store(true, Ordering::SeqCst);
        });

        let quad = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("rasterfx_quad"),
            size: std::mem::size_of_val(&QUAD_VERTICES) as u64,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        queue.write_buffer(&quad, 0, bytemuck::cast_slice(&QUAD_VERTICES));

        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("rasterfx_uniforms"),
            size: UNIFORM_BYTES,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("rasterfx_nearest_clamp"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Ok(Self {
            adapter_info: adapter.get_info(),
            device,
            queue,
            attributes,
            drawing_buffer,
            lost,
            next_id: 1,
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            bound: None,
            programs: HashMap::new(),
            quad,
            uniforms,
            sampler,
            staging: None,
            precision: HashMap::new(),
            stats: ContextStats::default(),
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn ensure_live(&self) -> RasterFxResult<()> {
        if self.is_context_lost() {
            return Err(RasterFxError::context("wgpu device was lost"));
        }
        Ok(())
    }

    fn texture(&self, texture: TextureHandle) -> RasterFxResult<&GpuTexture> {
        self.textures
            .get(&texture)
            .ok_or_else(|| RasterFxError::pipeline(format!("unknown texture {texture:?}")))
    }

    fn naga_capabilities(&self) -> naga::valid::Capabilities {
        let features = self.device.features();
        let mut caps = naga::valid::Capabilities::empty();
        if features.contains(wgpu::Features::SHADER_F16) {
            caps |= naga::valid::Capabilities::SHADER_FLOAT16;
        }
        if features.contains(wgpu::Features::SHADER_F64) {
            caps |= naga::valid::Capabilities::FLOAT64;
        }
        caps
    }

    /// Run `f` inside a validation error scope, turning captured errors into pipeline errors.
    fn scoped<T>(&self, what: &str, f: impl FnOnce(&wgpu::Device) -> T) -> RasterFxResult<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(RasterFxError::pipeline(format!("{what}: {err}"))),
            None => Ok(out),
        }
    }

    fn bind_group_layout(&self, inputs: u32) -> wgpu::BindGroupLayout {
        let mut entries = vec![
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: NonZeroU64::new(UNIFORM_BYTES),
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ];
        entries.extend((0..inputs).map(|i| wgpu::BindGroupLayoutEntry {
            binding: FIRST_INPUT_BINDING + i,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                multisampled: false,
                view_dimension: wgpu::TextureViewDimension::D2,
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
            },
            count: None,
        }));
        self.device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("rasterfx_program_bgl"),
                entries: &entries,
            })
    }

    fn build_program(&self, label: &str, fragment_wgsl: &str, inputs: u32) -> RasterFxResult<GpuProgram> {
        let source = assemble_wgsl(fragment_wgsl);
        validate_wgsl(&source, self.naga_capabilities())
            .map_err(|e| RasterFxError::pipeline(format!("program `{label}`: {e}")))?;

        let bind_group_layout = self.bind_group_layout(inputs);
        let pipeline = self.scoped(&format!("program `{label}`"), |device| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
            });
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: Some("vs_quad"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: 8,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &wgpu::vertex_attr_array![0 => Float32x2],
                    }],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &module,
                    entry_point: Some("fs_main"),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: TEXTURE_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleStrip,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        })?;

        Ok(GpuProgram {
            inputs,
            pipeline,
            bind_group_layout,
        })
    }

    fn staging_buffer(&mut self, size: u64) -> wgpu::Buffer {
        if let Some((buffer, capacity)) = &self.staging
            && *capacity >= size
        {
            return buffer.clone();
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("rasterfx_readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.staging = Some((buffer.clone(), size));
        buffer
    }
}

/// Prepend the quad vertex stage, keeping `enable` directives first.
fn assemble_wgsl(fragment_wgsl: &str) -> String {
    let (directives, body): (Vec<&str>, Vec<&str>) = fragment_wgsl
        .lines()
        .partition(|line| line.trim_start().starts_with("enable "));
    format!(
        "{}\n{QUAD_VERTEX_WGSL}\n{}",
        directives.join("\n"),
        body.join("\n")
    )
}

fn validate_wgsl(source: &str, capabilities: naga::valid::Capabilities) -> Result<(), String> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;
    naga::valid::Validator::new(naga::valid::ValidationFlags::all(), capabilities)
        .validate(&module)
        .map_err(|e| e.to_string())?;
    Ok(())
}

fn vendor_name(info: &wgpu::AdapterInfo) -> String {
    match info.vendor {
        0x10de => "nvidia".to_string(),
        0x1002 | 0x1022 => "amd".to_string(),
        0x8086 => "intel".to_string(),
        0x106b => "apple".to_string(),
        0x13b5 => "arm".to_string(),
        0x5143 => "qualcomm".to_string(),
        0x1010 => "imagination technologies".to_string(),
        0 if !info.driver.is_empty() => info.driver.clone(),
        id => format!("{id:#06x}"),
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

impl GraphicsContext for WgpuContext {
    fn attributes(&self) -> ContextAttributes {
        self.attributes
    }

    fn drawing_buffer_size(&self) -> Extent {
        self.drawing_buffer
    }

    fn max_texture_size(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    fn supports_precision(&mut self, precision: Precision) -> bool {
        if let Some(ok) = self.precision.get(&precision) {
            return *ok;
        }
        let ok = !self.is_context_lost()
            && self.device.features().contains(required_feature(precision))
            && self
                .build_program(
                    &format!("precision_probe_{precision}"),
                    precision_probe_wgsl(precision),
                    0,
                )
                .is_ok();
        self.precision.insert(precision, ok);
        ok
    }

    fn debug_renderer_info(&self) -> Option<GpuInfo> {
        if self.adapter_info.name.is_empty() {
            return None;
        }
        Some(GpuInfo {
            renderer: self.adapter_info.name.clone(),
            vendor: vendor_name(&self.adapter_info),
        })
    }

    fn is_context_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn lose_context(&mut self) {
        self.device.destroy();
        self.lost.store(true, Ordering::SeqCst);
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
        let max = self.max_texture_size();
        if extent.is_empty() || !extent.fits_within(Extent::new(max, max)) {
            return Err(RasterFxError::validation(format!(
                "texture {extent} is outside 1..={max} per side"
            )));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("rasterfx_texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let handle = TextureHandle::from_raw(self.alloc_id());
        self.textures.insert(
            handle,
            GpuTexture {
                extent,
                texture,
                view,
            },
        );
        Ok(handle)
    }

    fn upload_texture(&mut self, texture: TextureHandle, pixels: &[u8]) -> RasterFxResult<()> {
        self.ensure_live()?;
        let tex = self.texture(texture)?;
        check_upload(tex.extent, pixels)?;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(tex.extent.width * BYTES_PER_PIXEL as u32),
                rows_per_image: Some(tex.extent.height),
            },
            wgpu::Extent3d {
                width: tex.extent.width,
                height: tex.extent.height,
                depth_or_array_layers: 1,
            },
        );
        self.stats.uploads += 1;
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        if let Some(tex) = self.textures.remove(&texture) {
            tex.texture.destroy();
        }
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
        let program = self.build_program(&desc.label, &desc.fragment_wgsl, desc.inputs)?;
        let handle = ProgramHandle::from_raw(self.alloc_id());
        self.programs.insert(handle, program);
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
        let target = self.texture(check_draw(call, self.framebuffer_attachment(), program.inputs)?)?;
        let inputs = call
            .inputs
            .iter()
            .map(|t| self.texture(*t))
            .collect::<RasterFxResult<Vec<_>>>()?;

        let mut uniforms = [0f32; MAX_UNIFORM_FLOATS];
        uniforms[..call.uniforms.len()].copy_from_slice(call.uniforms);
        self.queue
            .write_buffer(&self.uniforms, 0, bytemuck::cast_slice(&uniforms));

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: self.uniforms.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Sampler(&self.sampler),
            },
        ];
        entries.extend(inputs.iter().enumerate().map(|(i, tex)| wgpu::BindGroupEntry {
            binding: FIRST_INPUT_BINDING + i as u32,
            resource: wgpu::BindingResource::TextureView(&tex.view),
        }));
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("rasterfx_draw_bg"),
            layout: &program.bind_group_layout,
            entries: &entries,
        });

        let viewport = call.viewport.unwrap_or(target.extent);
        let vw = viewport.width.min(target.extent.width);
        let vh = viewport.height.min(target.extent.height);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("rasterfx_draw_encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("rasterfx_draw_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            if vw > 0 && vh > 0 {
                pass.set_viewport(0.0, 0.0, vw as f32, vh as f32, 0.0, 1.0);
                pass.set_pipeline(&program.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.set_vertex_buffer(0, self.quad.slice(..));
                pass.draw(0..4, 0..1);
            }
        }
        self.queue.submit(Some(encoder.finish()));
        self.stats.draws += 1;
        Ok(())
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
        let extent = self.texture(source)?.extent;
        let out = &mut out[..wanted.byte_len()];
        out.fill(0);

        let copy = Extent::new(width.min(extent.width), height.min(extent.height));
        if copy.is_empty() {
            self.stats.readbacks += 1;
            return Ok(());
        }
        let bytes_per_row = align_to(
            copy.width * BYTES_PER_PIXEL as u32,
            wgpu::COPY_BYTES_PER_ROW_ALIGNMENT,
        );
        let staging = self.staging_buffer(bytes_per_row as u64 * copy.height as u64);
        let tex = self.texture(source)?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("rasterfx_readback_encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(copy.height),
                },
            },
            wgpu::Extent3d {
                width: copy.width,
                height: copy.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..bytes_per_row as u64 * copy.height as u64);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| RasterFxError::context(format!("wgpu poll failed: {e:?}")))?;
        rx.recv()
            .map_err(|_| RasterFxError::context("readback channel closed"))?
            .map_err(|e| RasterFxError::context(format!("readback map failed: {e:?}")))?;

        {
            let mapped = slice.get_mapped_range();
            let row_bytes = copy.width as usize * BYTES_PER_PIXEL;
            let out_row = width as usize * BYTES_PER_PIXEL;
            for row in 0..copy.height as usize {
                let start = row * bytes_per_row as usize;
                out[row * out_row..row * out_row + row_bytes]
                    .copy_from_slice(&mapped[start..start + row_bytes]);
            }
        }
        staging.unmap();
        self.stats.readbacks += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_vertex_stage_validates() {
        let src = assemble_wgsl(
            "@fragment fn fs_main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> { return vec4<f32>(uv, 0.0, 1.0); }",
        );
        validate_wgsl(&src, naga::valid::Capabilities::empty()).unwrap();
    }

    #[test]
    fn enable_directives_stay_in_front() {
        let src = assemble_wgsl(precision_probe_wgsl(Precision::Low));
        assert!(src.starts_with("enable f16;"));
        assert!(src.contains("fn vs_quad"));
    }

    #[test]
    fn malformed_wgsl_is_reported() {
        let err = validate_wgsl("@fragment fn fs_main( {", naga::valid::Capabilities::empty())
            .unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn readback_rows_are_padded() {
        assert_eq!(align_to(4, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
    }

    #[test]
    fn surfaces_beyond_the_device_limit_are_refused() {
        assert!(fits_texture_limit(Extent::new(2048, 2048), 8192));
        assert!(!fits_texture_limit(Extent::new(8193, 16), 8192));
        assert!(!fits_texture_limit(Extent::new(0, 16), 8192));
    }

    #[test]
    fn surface_alpha_follows_context_attributes() {
        use wgpu::CompositeAlphaMode as Mode;
        let all = [Mode::Opaque, Mode::PreMultiplied, Mode::PostMultiplied];
        assert_eq!(surface_alpha_mode(&all, false), Mode::PostMultiplied);
        assert_eq!(surface_alpha_mode(&all, true), Mode::PreMultiplied);
        assert_eq!(surface_alpha_mode(&[Mode::PreMultiplied, Mode::Opaque], false), Mode::Opaque);
        assert_eq!(surface_alpha_mode(&[Mode::Inherit], false), Mode::Inherit);
        assert_eq!(surface_alpha_mode(&[], false), Mode::Auto);
    }
}
