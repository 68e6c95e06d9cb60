//! Buffered pipeline on [`wgpu`].
//!
//! Draw calls only append [`QuadInstance`]s to a CPU-side list, split into
//! batches that share a texture. [`end_frame`](Renderer::end_frame) uploads
//! the list into one instance buffer and encodes a single render pass with
//! one instanced draw per batch. Presentation timing is left to the surface.
//!
//! Views either present to a window surface or, for headless use, render
//! into an offscreen texture that [`WgpuRenderer::read_pixels`] can copy
//! back.

mod pipeline;

use std::ops::Range;
use std::sync::Arc;

use crate::arena::{Arena, Key};
use crate::config::{Compression, DeviceId, RendererSettings};
use crate::error::{RendererError, Result};
use crate::format::{FormatCaps, PixelBuffer, PixelLayout};
use crate::identity::WidgetId;
use crate::present::{choose_present_mode, PresentConfig, PresentMode};
use crate::quad::{PickInstance, QuadInstance, ViewUniform};
use crate::renderer::{DeviceEntry, DeviceInfo, FrameStatus, Renderer, Texture};
use crate::types::{Color, Point, Rect, ViewId, ViewInfo};
use crate::upload::{self, Filter, Upload, UploadContext};
use crate::view::{self, NativeWindow, View, ViewTarget};

use pipeline::{Pipelines, PICK_FORMAT};

/// Color format of offscreen views.
const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Window stand-in for offscreen views.
struct Offscreen {
    id: u64,
    size: (u32, u32),
}

impl NativeWindow for Offscreen {
    fn window_id(&self) -> u64 {
        self.id
    }

    fn drawable_size(&self) -> (u32, u32) {
        self.size
    }
}

/// Where a view's frames go.
enum Target {
    /// A configured window surface.
    Surface {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        /// Present modes the surface offers.
        modes: Vec<PresentMode>,
    },
    /// A texture readable through [`WgpuRenderer::read_pixels`].
    Offscreen(wgpu::Texture),
}

/// Per-view GPU state.
struct WgpuView {
    target: Target,
    /// [`ViewUniform`] of the view.
    uniform: wgpu::Buffer,
    /// Group 0 bound to [`uniform`](Self::uniform).
    bind_group: wgpu::BindGroup,
}

/// A sampled texture and its bind group.
struct GpuTexture {
    texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
}

/// A growable vertex buffer for per-instance data.
struct InstanceBuffer {
    label: &'static str,
    buffer: wgpu::Buffer,
}

impl InstanceBuffer {
    const MIN_SIZE: u64 = 64 * 1024;

    fn new(device: &wgpu::Device, label: &'static str) -> Self {
        Self {
            label,
            buffer: Self::allocate(device, label, Self::MIN_SIZE),
        }
    }

    fn allocate(device: &wgpu::Device, label: &'static str, size: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Queue `bytes` for upload, growing the buffer to the next power of two.
    fn write(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, bytes: &[u8]) {
        let needed = bytes.len() as u64;
        if needed > self.buffer.size() {
            self.buffer = Self::allocate(device, self.label, needed.next_power_of_two());
        }
        queue.write_buffer(&self.buffer, 0, bytes);
    }
}

/// A run of instances sharing one texture.
struct Batch {
    /// `None` for the blank texture.
    texture: Option<Key>,
    instances: Range<u32>,
}

/// The draw or pick cycle in progress.
enum Cycle {
    Frame {
        view: usize,
        surface: Option<wgpu::SurfaceTexture>,
        instances: Vec<QuadInstance>,
        batches: Vec<Batch>,
    },
    Skipped(usize),
    Pick {
        view: usize,
        instances: Vec<PickInstance>,
    },
}

impl Cycle {
    fn name(cycle: Option<&Self>) -> &'static str {
        match cycle {
            None => "Idle",
            Some(Self::Frame { .. } | Self::Skipped(_)) => "Recording",
            Some(Self::Pick { .. }) => "Picking",
        }
    }
}

/// Resources of the pick pass.
struct PickTarget {
    view: wgpu::TextureView,
    texture: wgpu::Texture,
    /// One padded row, mapped after each pick.
    readback: wgpu::Buffer,
    uniform: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

/// The wgpu backend.
pub struct WgpuRenderer {
    /// Kept alive for the surfaces.
    _instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    views: Vec<View<Arc<dyn NativeWindow>, WgpuView>>,
    pipelines: Pipelines,
    blank: GpuTexture,
    textures: Arena<GpuTexture>,
    quad_instances: InstanceBuffer,
    pick_instances: InstanceBuffer,
    pick: PickTarget,
    caps: FormatCaps,
    max_texture_size: u32,
    clear_color: Color,
    present: PresentConfig,
    compression: Compression,
    max_picture_res: u32,
    cycle: Option<Cycle>,
}

/// A view's target before the device exists.
enum Pending {
    Surface(wgpu::Surface<'static>, Arc<dyn NativeWindow>),
    Offscreen,
}

impl WgpuRenderer {
    /// Create a renderer presenting to window surfaces.
    ///
    /// All surfaces must accept the color format chosen for the first one.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::Surface`] if a surface cannot be created or
    /// configured, [`RendererError::NoDevice`] if no adapter can present to
    /// every surface, or a device/shader error.
    #[tracing::instrument(skip_all, fields(views = targets.len()))]
    pub fn new<W>(targets: Vec<ViewTarget<W>>, settings: &RendererSettings) -> Result<Self>
    where
        W: NativeWindow + wgpu::WindowHandle + Clone + 'static,
    {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let views = view::build_views(
            targets,
            |window, _| {
                let surface = instance
                    .create_surface(window.clone())
                    .map_err(|err| RendererError::surface(err.to_string()))?;
                Ok(Pending::Surface(surface, Arc::new(window.clone())))
            },
            drop,
        )?;
        Self::build(instance, views, settings)
    }

    /// Create a headless renderer whose views render into textures.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::NoDevice`] when no adapter is available, or a
    /// device/shader error.
    #[tracing::instrument(skip_all, fields(views = targets.len()))]
    pub fn offscreen(targets: &[(ViewId, Rect)], settings: &RendererSettings) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let targets = targets
            .iter()
            .map(|&(id, rect)| ViewTarget {
                id,
                window: (),
                rect,
            })
            .collect();
        let views = view::build_views(targets, |(), _| Ok(Pending::Offscreen), drop)?;
        Self::build(instance, views, settings)
    }

    fn build<W>(instance: wgpu::Instance, pending: Vec<View<W, Pending>>, settings: &RendererSettings) -> Result<Self> {
        let surfaces: Vec<&wgpu::Surface<'static>> = pending
            .iter()
            .filter_map(|v| match &v.present {
                Pending::Surface(surface, _) => Some(surface),
                Pending::Offscreen => None,
            })
            .collect();
        let first_surface = surfaces.first().copied();
        let configured = settings
            .device
            .and_then(|wanted| configured_adapter(&instance, &surfaces, wanted));
        let adapter = match configured {
            Some(adapter) => adapter,
            None => pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: first_surface,
                force_fallback_adapter: false,
            }))
            .map_err(|err| {
                tracing::warn!(%err, "no wgpu adapter");
                RendererError::NoDevice
            })?,
        };
        let info = adapter.get_info();
        tracing::info!(adapter = %info.name, backend = ?info.backend, "wgpu adapter selected");
        for view in &pending {
            if let Pending::Surface(surface, _) = &view.present {
                if !adapter.is_surface_supported(surface) {
                    return Err(RendererError::NoDevice);
                }
            }
        }

        let limits = wgpu::Limits {
            max_texture_dimension_2d: adapter.limits().max_texture_dimension_2d,
            ..wgpu::Limits::downlevel_defaults()
        };
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("widget renderer"),
            required_features: wgpu::Features::empty(),
            required_limits: limits,
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            experimental_features: Default::default(),
            trace: Default::default(),
        }))
        .map_err(|err| RendererError::api("request_device", err))?;

        let format = match first_surface {
            Some(surface) => choose_format(&surface.get_capabilities(&adapter).formats)?,
            None => OFFSCREEN_FORMAT,
        };
        let pipelines = Pipelines::new(&device, format)?;
        let present = PresentConfig::new(settings.vsync);

        let mut views = Vec::with_capacity(pending.len());
        for (index, view) in pending.into_iter().enumerate() {
            let uniform = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("view uniform"),
                size: std::mem::size_of::<ViewUniform>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let bind_group = pipelines.view_bind_group(&device, &uniform);
            let (w, h) = view.rect.size();
            let (target, window): (Target, Arc<dyn NativeWindow>) = match view.present {
                Pending::Surface(surface, window) => {
                    let caps = surface.get_capabilities(&adapter);
                    if !caps.formats.contains(&format) {
                        return Err(RendererError::surface(format!(
                            "view {:?} cannot present {format:?}",
                            view.id
                        )));
                    }
                    let modes = caps.present_modes.iter().filter_map(|m| from_wgpu_mode(*m)).collect::<Vec<_>>();
                    let config = wgpu::SurfaceConfiguration {
                        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                        format,
                        width: w.max(1),
                        height: h.max(1),
                        present_mode: to_wgpu_mode(choose_present_mode(present.vsync(), &modes)),
                        alpha_mode: caps
                            .alpha_modes
                            .first()
                            .copied()
                            .unwrap_or(wgpu::CompositeAlphaMode::Auto),
                        view_formats: vec![],
                        desired_maximum_frame_latency: 2,
                    };
                    if w > 0 && h > 0 {
                        surface.configure(&device, &config);
                    }
                    tracing::debug!(view = ?view.id, mode = ?config.present_mode, "surface configured");
                    (
                        Target::Surface {
                            surface,
                            config,
                            modes,
                        },
                        window,
                    )
                }
                Pending::Offscreen => (
                    Target::Offscreen(create_offscreen(&device, w, h)),
                    Arc::new(Offscreen {
                        id: index as u64,
                        size: (w, h),
                    }),
                ),
            };
            views.push(View {
                id: view.id,
                window,
                rect: view.rect,
                present: WgpuView {
                    target,
                    uniform,
                    bind_group,
                },
            });
        }

        let blank_upload = Upload {
            bytes: std::borrow::Cow::Borrowed(&[255u8; 4]),
            width: 1,
            height: 1,
            plan: crate::format::UploadPlan {
                layout: PixelLayout::Rgba8,
                conversion: crate::format::Conversion::None,
                compressed: false,
            },
            source: PixelLayout::Rgba8,
            palette: None,
            filter: Filter::Nearest,
        };
        let blank = create_texture(&device, &queue, &pipelines, &blank_upload)?;
        let pick = create_pick_target(&device, &pipelines);

        Ok(Self {
            quad_instances: InstanceBuffer::new(&device, "quad instances"),
            pick_instances: InstanceBuffer::new(&device, "pick instances"),
            max_texture_size: device.limits().max_texture_dimension_2d,
            caps: FormatCaps::from_layouts([PixelLayout::Rgba8, PixelLayout::Bgra8, PixelLayout::Rgb10a2]),
            _instance: instance,
            adapter,
            device,
            queue,
            views,
            pipelines,
            blank,
            textures: Arena::new(),
            pick,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            present,
            compression: settings.compression,
            max_picture_res: settings.max_picture_res,
            cycle: None,
        })
    }

    /// Copy an offscreen view's pixels back as tightly packed RGBA8 rows.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::UnknownView`] for unknown ids,
    /// [`RendererError::Surface`] for views that present to a window, or an
    /// API error if the readback fails.
    pub fn read_pixels(&self, id: ViewId) -> Result<Vec<u8>> {
        let index = view::find_view(&self.views, id)?;
        let Target::Offscreen(texture) = &self.views[index].present.target else {
            return Err(RendererError::surface("window surfaces cannot be read back"));
        };
        let (width, height) = (texture.width(), texture.height());
        let row = width * 4;
        let padded = row.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("view readback"),
            size: u64::from(padded) * u64::from(height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("view readback") });
        encoder.copy_texture_to_buffer(
            texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            texture.size(),
        );
        self.queue.submit(Some(encoder.finish()));

        let data = self.map_read(&buffer)?;
        let mut pixels = Vec::with_capacity(row as usize * height as usize);
        for chunk in data.chunks_exact(padded as usize) {
            pixels.extend_from_slice(&chunk[..row as usize]);
        }
        Ok(pixels)
    }

    /// Map `buffer` and block until its contents are available.
    fn map_read(&self, buffer: &wgpu::Buffer) -> Result<Vec<u8>> {
        let slice = buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            sender.send(result).ok();
        });
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|err| RendererError::api("poll", err))?;

        match receiver.recv() {
            Ok(Ok(())) => {
                let data = slice.get_mapped_range().to_vec();
                buffer.unmap();
                Ok(data)
            }
            Ok(Err(err)) => Err(RendererError::api("map_async", err)),
            Err(err) => Err(RendererError::api("map_async", err)),
        }
    }

    fn upload_context(&self) -> UploadContext<'_> {
        UploadContext {
            caps: &self.caps,
            compression: self.compression,
            max_texture_size: self.max_texture_size,
        }
    }

    fn insert_texture(&mut self, upload: Option<Upload<'_>>) -> Option<Texture> {
        let upload = upload?;
        match create_texture(&self.device, &self.queue, &self.pipelines, &upload) {
            Ok(gpu) => match self.textures.insert(gpu) {
                Ok(key) => Some(Texture::new(key, upload.width, upload.height)),
                Err(_) => {
                    tracing::warn!("texture table full");
                    None
                }
            },
            Err(err) => {
                tracing::warn!(%err, "texture creation failed");
                None
            }
        }
    }

    /// Resize a view's target to its rectangle, reconfiguring the surface.
    fn resize_target(&mut self, index: usize) {
        let (w, h) = self.views[index].rect.size();
        let device = &self.device;
        match &mut self.views[index].present.target {
            Target::Surface { surface, config, .. } => {
                if w > 0 && h > 0 && (config.width, config.height) != (w, h) {
                    config.width = w;
                    config.height = h;
                    surface.configure(device, config);
                    tracing::debug!(width = w, height = h, "surface reconfigured");
                }
            }
            Target::Offscreen(texture) => {
                if w > 0 && h > 0 && (texture.width(), texture.height()) != (w, h) {
                    *texture = create_offscreen(device, w, h);
                }
            }
        }
    }

    /// Encode and submit the collected quads of a frame.
    fn submit_frame(
        &mut self,
        index: usize,
        surface: Option<wgpu::SurfaceTexture>,
        instances: &[QuadInstance],
        batches: &[Batch],
    ) {
        if !instances.is_empty() {
            self.quad_instances
                .write(&self.device, &self.queue, bytemuck::cast_slice(instances));
        }
        let view = &self.views[index];
        let target_view = match (&surface, &view.present.target) {
            (Some(frame), _) => frame.texture.create_view(&wgpu::TextureViewDescriptor::default()),
            (None, Target::Offscreen(texture)) => texture.create_view(&wgpu::TextureViewDescriptor::default()),
            (None, Target::Surface { .. }) => return,
        };
        let [r, g, b, a] = self.clear_color.map(f64::from);

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("frame") });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("frame pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            if !instances.is_empty() {
                pass.set_pipeline(&self.pipelines.quad);
                pass.set_bind_group(0, &view.present.bind_group, &[]);
                pass.set_vertex_buffer(0, self.quad_instances.buffer.slice(..));
                for batch in batches {
                    let texture = batch
                        .texture
                        .and_then(|key| self.textures.get(key))
                        .unwrap_or(&self.blank);
                    pass.set_bind_group(1, &texture.bind_group, &[]);
                    pass.draw(0..4, batch.instances.clone());
                }
            }
        }
        self.queue.submit(Some(encoder.finish()));

        if let Some(frame) = surface {
            let suboptimal = frame.suboptimal;
            frame.present();
            if suboptimal {
                if let Target::Surface { surface, config, .. } = &self.views[index].present.target {
                    surface.configure(&self.device, config);
                }
            }
        }
    }
}

/// Prefer an 8-bit UNORM format so blending matches the other backends.
fn choose_format(formats: &[wgpu::TextureFormat]) -> Result<wgpu::TextureFormat> {
    [wgpu::TextureFormat::Bgra8Unorm, wgpu::TextureFormat::Rgba8Unorm]
        .into_iter()
        .find(|f| formats.contains(f))
        .or_else(|| formats.iter().copied().find(|f| !f.is_srgb()))
        .or_else(|| formats.first().copied())
        .ok_or_else(|| RendererError::surface("surface reports no formats"))
}

fn from_wgpu_mode(mode: wgpu::PresentMode) -> Option<PresentMode> {
    match mode {
        wgpu::PresentMode::Immediate => Some(PresentMode::Immediate),
        wgpu::PresentMode::Mailbox => Some(PresentMode::Mailbox),
        wgpu::PresentMode::FifoRelaxed => Some(PresentMode::FifoRelaxed),
        wgpu::PresentMode::Fifo => Some(PresentMode::Fifo),
        _ => None,
    }
}

fn to_wgpu_mode(mode: PresentMode) -> wgpu::PresentMode {
    match mode {
        PresentMode::Immediate => wgpu::PresentMode::Immediate,
        PresentMode::Mailbox => wgpu::PresentMode::Mailbox,
        PresentMode::FifoRelaxed => wgpu::PresentMode::FifoRelaxed,
        PresentMode::Fifo => wgpu::PresentMode::Fifo,
    }
}

fn texture_format(layout: PixelLayout) -> Option<wgpu::TextureFormat> {
    match layout {
        PixelLayout::Rgba8 => Some(wgpu::TextureFormat::Rgba8Unorm),
        PixelLayout::Bgra8 => Some(wgpu::TextureFormat::Bgra8Unorm),
        PixelLayout::Rgb10a2 => Some(wgpu::TextureFormat::Rgb10a2Unorm),
        _ => None,
    }
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width,
        height,
        depth_or_array_layers: 1,
    }
}

fn adapter_id(info: &wgpu::AdapterInfo) -> DeviceId {
    DeviceId {
        vendor: info.vendor,
        device: info.device,
    }
}

/// Index of the `wanted` adapter among `(id, usable)` pairs, if it can
/// present to every surface.
fn find_configured(adapters: &[(DeviceId, bool)], wanted: DeviceId) -> Option<usize> {
    adapters.iter().position(|&(id, usable)| usable && id == wanted)
}

/// The configured adapter, when one with that id presents to `surfaces`.
fn configured_adapter(
    instance: &wgpu::Instance,
    surfaces: &[&wgpu::Surface<'static>],
    wanted: DeviceId,
) -> Option<wgpu::Adapter> {
    let mut adapters = instance.enumerate_adapters(wgpu::Backends::all());
    let candidates: Vec<(DeviceId, bool)> = adapters
        .iter()
        .map(|adapter| {
            let usable = surfaces.iter().all(|surface| adapter.is_surface_supported(surface));
            (adapter_id(&adapter.get_info()), usable)
        })
        .collect();
    match find_configured(&candidates, wanted) {
        Some(index) => Some(adapters.swap_remove(index)),
        None => {
            tracing::warn!(?wanted, "configured device unavailable, choosing automatically");
            None
        }
    }
}

fn create_offscreen(device: &wgpu::Device, width: u32, height: u32) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some("offscreen view"),
        size: extent(width.max(1), height.max(1)),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: OFFSCREEN_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

fn create_pick_target(device: &wgpu::Device, pipelines: &Pipelines) -> PickTarget {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("pick target"),
        size: extent(1, 1),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: PICK_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let readback = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("pick readback"),
        size: u64::from(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let uniform = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("pick uniform"),
        size: std::mem::size_of::<ViewUniform>() as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    PickTarget {
        view: texture.create_view(&wgpu::TextureViewDescriptor::default()),
        bind_group: pipelines.view_bind_group(device, &uniform),
        texture,
        readback,
        uniform,
    }
}

/// Create a sampled texture and queue its contents.
///
/// Allocation failures are caught through an error scope instead of reaching
/// the device's uncaptured-error handler.
fn create_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    pipelines: &Pipelines,
    upload: &Upload<'_>,
) -> Result<GpuTexture> {
    let format = texture_format(upload.plan.layout).ok_or_else(|| {
        RendererError::api("create_texture", format!("layout {:?} is not sampleable", upload.plan.layout))
    })?;
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("widget texture"),
        size: extent(upload.width, upload.height),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    write_texture(queue, &texture, upload);
    let validation = pollster::block_on(device.pop_error_scope());
    let memory = pollster::block_on(device.pop_error_scope());
    if let Some(err) = validation.or(memory) {
        return Err(RendererError::api("create_texture", err));
    }
    Ok(GpuTexture {
        bind_group: pipelines.texture_bind_group(device, &texture, upload.filter),
        texture,
    })
}

fn write_texture(queue: &wgpu::Queue, texture: &wgpu::Texture, upload: &Upload<'_>) {
    queue.write_texture(
        texture.as_image_copy(),
        &upload.bytes,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(upload.width * upload.plan.layout.bytes_per_pixel()),
            rows_per_image: Some(upload.height),
        },
        extent(upload.width, upload.height),
    );
}

impl Renderer for WgpuRenderer {
    fn views(&self) -> Vec<ViewInfo> {
        self.views.iter().map(View::info).collect()
    }

    fn set_clear_color(&mut self, color: Color) {
        self.clear_color = color;
    }

    fn set_vsync(&mut self, vsync: bool) -> Result<()> {
        if !self.present.set_vsync(vsync) {
            return Ok(());
        }
        for view in &mut self.views {
            if let Target::Surface { surface, config, modes } = &mut view.present.target {
                config.present_mode = to_wgpu_mode(choose_present_mode(vsync, modes));
                if config.width > 0 && config.height > 0 {
                    surface.configure(&self.device, config);
                }
                tracing::debug!(view = ?view.id, mode = ?config.present_mode, "present mode changed");
            }
        }
        Ok(())
    }

    fn set_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }

    fn update_view(&mut self, id: ViewId, rect: Option<Rect>) -> Result<()> {
        let index = view::find_view(&self.views, id)?;
        let view = &mut self.views[index];
        view.rect = view.resized_rect(rect);
        self.resize_target(index);
        Ok(())
    }

    fn begin_frame(&mut self, id: ViewId) -> Result<FrameStatus> {
        let index = view::find_view(&self.views, id)?;
        if self.cycle.is_some() {
            return Err(RendererError::InvalidState {
                state: Cycle::name(self.cycle.as_ref()),
                event: "begin_frame",
            });
        }
        let (w, h) = self.views[index].rect.size();
        if w == 0 || h == 0 {
            self.cycle = Some(Cycle::Skipped(index));
            return Ok(FrameStatus::Skipped);
        }
        self.resize_target(index);

        let view = &self.views[index];
        let surface = match &view.present.target {
            Target::Surface { surface, config, .. } => match surface.get_current_texture() {
                Ok(frame) => Some(frame),
                Err(wgpu::SurfaceError::OutOfMemory) => {
                    return Err(RendererError::api("get_current_texture", wgpu::SurfaceError::OutOfMemory));
                }
                Err(err) => {
                    tracing::debug!(view = ?id, %err, "surface stale, reconfiguring");
                    surface.configure(&self.device, config);
                    self.cycle = Some(Cycle::Skipped(index));
                    return Ok(FrameStatus::Skipped);
                }
            },
            Target::Offscreen(_) => None,
        };
        self.queue.write_buffer(
            &view.present.uniform,
            0,
            bytemuck::bytes_of(&ViewUniform::for_view(view.rect)),
        );
        self.cycle = Some(Cycle::Frame {
            view: index,
            surface,
            instances: Vec::new(),
            batches: Vec::new(),
        });
        Ok(FrameStatus::Ready)
    }

    fn draw_rect(&mut self, texture: Option<&Texture>, rect: Rect, frame: Rect, color: Color) {
        let Some(Cycle::Frame { instances, batches, .. }) = &mut self.cycle else {
            return;
        };
        let key = texture.map(Texture::key);
        let index = u32::try_from(instances.len()).unwrap_or(u32::MAX);
        instances.push(QuadInstance::new(rect, frame, color));
        match batches.last_mut() {
            Some(batch) if batch.texture == key => batch.instances.end = index + 1,
            _ => batches.push(Batch {
                texture: key,
                instances: index..index + 1,
            }),
        }
    }

    fn end_frame(&mut self, id: ViewId) -> Result<()> {
        let index = view::find_view(&self.views, id)?;
        match self.cycle.take() {
            Some(Cycle::Frame {
                view,
                surface,
                instances,
                batches,
            }) if view == index => {
                self.submit_frame(index, surface, &instances, &batches);
                Ok(())
            }
            Some(Cycle::Skipped(view)) if view == index => Ok(()),
            other => {
                let state = Cycle::name(other.as_ref());
                self.cycle = other;
                Err(RendererError::InvalidState {
                    state,
                    event: "end_frame",
                })
            }
        }
    }

    fn begin_pick(&mut self, id: ViewId, point: Point) -> Result<()> {
        let index = view::find_view(&self.views, id)?;
        if self.cycle.is_some() {
            return Err(RendererError::InvalidState {
                state: Cycle::name(self.cycle.as_ref()),
                event: "begin_pick",
            });
        }
        self.queue
            .write_buffer(&self.pick.uniform, 0, bytemuck::bytes_of(&ViewUniform::for_pick(point)));
        self.cycle = Some(Cycle::Pick {
            view: index,
            instances: Vec::new(),
        });
        Ok(())
    }

    fn draw_sel_rect(&mut self, widget: WidgetId, rect: Rect, frame: Rect) {
        if let Some(Cycle::Pick { instances, .. }) = &mut self.cycle {
            instances.push(PickInstance::new(widget, rect, frame));
        }
    }

    fn end_pick(&mut self, id: ViewId) -> Result<Option<WidgetId>> {
        let index = view::find_view(&self.views, id)?;
        let instances = match self.cycle.take() {
            Some(Cycle::Pick { view, instances }) if view == index => instances,
            other => {
                let state = Cycle::name(other.as_ref());
                self.cycle = other;
                return Err(RendererError::InvalidState {
                    state,
                    event: "end_pick",
                });
            }
        };
        if !instances.is_empty() {
            self.pick_instances
                .write(&self.device, &self.queue, bytemuck::cast_slice(&instances));
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("pick") });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("pick pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.pick.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            if !instances.is_empty() {
                let count = u32::try_from(instances.len()).unwrap_or(u32::MAX);
                pass.set_pipeline(&self.pipelines.pick);
                pass.set_bind_group(0, &self.pick.bind_group, &[]);
                pass.set_vertex_buffer(0, self.pick_instances.buffer.slice(..));
                pass.draw(0..4, 0..count);
            }
        }
        encoder.copy_texture_to_buffer(
            self.pick.texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &self.pick.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT),
                    rows_per_image: Some(1),
                },
            },
            extent(1, 1),
        );
        self.queue.submit(Some(encoder.finish()));

        let data = self.map_read(&self.pick.readback)?;
        let halves: [u32; 2] = bytemuck::pod_read_unaligned(&data[..8]);
        Ok(WidgetId::from_halves(halves))
    }

    fn texture_from_image(&mut self, image: &PixelBuffer<'_>) -> Option<Texture> {
        let upload = upload::plan_image(image, self.upload_context());
        self.insert_texture(upload)
    }

    fn texture_from_picture(&mut self, image: &PixelBuffer<'_>) -> Option<Texture> {
        let upload = upload::plan_picture(image, self.upload_context(), self.max_picture_res);
        self.insert_texture(upload)
    }

    fn texture_from_text(&mut self, image: &PixelBuffer<'_>) -> Option<Texture> {
        let upload = upload::plan_text(image, self.upload_context());
        self.insert_texture(upload)
    }

    fn replace_texture(&mut self, texture: &mut Texture, image: &PixelBuffer<'_>) -> bool {
        let Some(upload) = upload::plan_image(image, self.upload_context()) else {
            return false;
        };
        let Some(gpu) = self.textures.get_mut(texture.key()) else {
            tracing::warn!("replacing a texture this renderer does not own");
            return false;
        };
        let same_shape = (gpu.texture.width(), gpu.texture.height()) == (upload.width, upload.height)
            && Some(gpu.texture.format()) == texture_format(upload.plan.layout);
        if same_shape {
            write_texture(&self.queue, &gpu.texture, &upload);
        } else {
            // The old texture stays alive until submitted frames using it retire.
            match create_texture(&self.device, &self.queue, &self.pipelines, &upload) {
                Ok(new) => *gpu = new,
                Err(err) => {
                    tracing::warn!(%err, "texture replacement failed");
                    return false;
                }
            }
        }
        texture.set_size(upload.width, upload.height);
        true
    }

    fn free_texture(&mut self, texture: Texture) {
        self.textures.remove(texture.key());
    }

    fn synch_transfers(&mut self) {
        if let Err(err) = self.device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        }) {
            tracing::warn!(%err, "waiting for uploads failed");
        }
    }

    fn device_info(&self) -> DeviceInfo {
        let info = self.adapter.get_info();
        DeviceInfo {
            devices: vec![DeviceEntry {
                id: adapter_id(&info),
                name: info.name,
            }],
            max_texture_size: self.max_texture_size,
            compressions: self.caps.compressions(),
            current: self.compression,
        }
    }
}
