//! Render pipelines, bind group layouts and samplers of the wgpu backend.

use crate::error::{RendererError, Result};
use crate::quad::{PickInstance, QuadInstance};
use crate::shaders;
use crate::upload::Filter;

/// Format of the pick target: two 32-bit halves of a widget token.
pub(crate) const PICK_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rg32Uint;

const QUAD_ATTRIBUTES: [wgpu::VertexAttribute; 3] =
    wgpu::vertex_attr_array![0 => Float32x4, 1 => Float32x4, 2 => Float32x4];

const PICK_ATTRIBUTES: [wgpu::VertexAttribute; 2] = wgpu::vertex_attr_array![0 => Float32x4, 1 => Uint32x2];

/// Pipelines and the layouts their bind groups are created from.
pub(crate) struct Pipelines {
    /// Group 0: the view transform uniform.
    pub view_layout: wgpu::BindGroupLayout,
    /// Group 1: texture and sampler.
    pub texture_layout: wgpu::BindGroupLayout,
    /// Alpha-blended textured quads into the color format.
    pub quad: wgpu::RenderPipeline,
    /// Widget tokens into [`PICK_FORMAT`], last write wins.
    pub pick: wgpu::RenderPipeline,
    linear: wgpu::Sampler,
    nearest: wgpu::Sampler,
}

impl Pipelines {
    /// Build both pipelines for views of `format`.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::Shader`] when the WGSL module or a pipeline
    /// fails validation.
    pub fn new(device: &wgpu::Device, format: wgpu::TextureFormat) -> Result<Self> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("widget shaders"),
            source: wgpu::ShaderSource::Wgsl(shaders::WGPU_WGSL.into()),
        });

        let view_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("view layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });

        let texture_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("texture layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let quad_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("quad pipeline layout"),
            bind_group_layouts: &[&view_layout, &texture_layout],
            push_constant_ranges: &[],
        });
        let pick_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("pick pipeline layout"),
            bind_group_layouts: &[&view_layout],
            push_constant_ranges: &[],
        });

        let quad = create_pipeline(
            device,
            "quad pipeline",
            &quad_layout,
            &shader,
            ("vs_quad", "fs_quad"),
            wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<QuadInstance>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Instance,
                attributes: &QUAD_ATTRIBUTES,
            },
            wgpu::ColorTargetState {
                format,
                blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                write_mask: wgpu::ColorWrites::ALL,
            },
        );
        let pick = create_pipeline(
            device,
            "pick pipeline",
            &pick_layout,
            &shader,
            ("vs_pick", "fs_pick"),
            wgpu::VertexBufferLayout {
                array_stride: std::mem::size_of::<PickInstance>() as wgpu::BufferAddress,
                step_mode: wgpu::VertexStepMode::Instance,
                attributes: &PICK_ATTRIBUTES,
            },
            wgpu::ColorTargetState {
                format: PICK_FORMAT,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            },
        );

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(RendererError::shader(err.to_string()));
        }

        Ok(Self {
            view_layout,
            texture_layout,
            quad,
            pick,
            linear: create_sampler(device, wgpu::FilterMode::Linear),
            nearest: create_sampler(device, wgpu::FilterMode::Nearest),
        })
    }

    /// Bind group for a view transform buffer.
    pub fn view_bind_group(&self, device: &wgpu::Device, buffer: &wgpu::Buffer) -> wgpu::BindGroup {
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("view bind group"),
            layout: &self.view_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        })
    }

    /// Bind group sampling `texture` with `filter`.
    pub fn texture_bind_group(&self, device: &wgpu::Device, texture: &wgpu::Texture, filter: Filter) -> wgpu::BindGroup {
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = match filter {
            Filter::Linear => &self.linear,
            Filter::Nearest => &self.nearest,
        };
        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("texture bind group"),
            layout: &self.texture_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
            ],
        })
    }
}

fn create_pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::PipelineLayout,
    shader: &wgpu::ShaderModule,
    (vs, fs): (&str, &str),
    instances: wgpu::VertexBufferLayout<'_>,
    target: wgpu::ColorTargetState,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: shader,
            entry_point: Some(vs),
            buffers: &[instances],
            compilation_options: Default::default(),
        },
        fragment: Some(wgpu::FragmentState {
            module: shader,
            entry_point: Some(fs),
            targets: &[Some(target)],
            compilation_options: Default::default(),
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleStrip,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState {
            count: 1,
            mask: !0,
            alpha_to_coverage_enabled: false,
        },
        multiview: None,
        cache: None,
    })
}

fn create_sampler(device: &wgpu::Device, filter: wgpu::FilterMode) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("widget sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: filter,
        min_filter: filter,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}
