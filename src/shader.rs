use std::{borrow::Cow, fs, mem::size_of};

use wgpu::util::DeviceExt;

use crate::agents;
use crate::config::{self, SessionConfig};
use crate::constants::*;
use crate::error::{Error, Result};
use crate::field::{Cell, FieldExtent, TrailField};
use crate::frame::{FramePlan, RenderSource, Stage};
use crate::layout::{self, Agent, AgentData, GpuRecord, ShaderOptions, Vertex};

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

const VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 2] = [
    wgpu::VertexAttribute {
        format: wgpu::VertexFormat::Float32x2,
        offset: Vertex::FIELDS[0].offset as wgpu::BufferAddress,
        shader_location: 0,
    },
    wgpu::VertexAttribute {
        format: wgpu::VertexFormat::Float32x2,
        offset: Vertex::FIELDS[1].offset as wgpu::BufferAddress,
        shader_location: 1,
    },
];

/// Buffer layout of the quad, taken from the `Vertex` record.
pub fn vertex_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: size_of::<Vertex>() as wgpu::BufferAddress,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &VERTEX_ATTRIBUTES,
    }
}

/// Compute module: record declarations, bindings and the trail pass, followed
/// by the agent kernel when one is given. The kernel must define
/// `update_agents` with a workgroup size of `AGENT_WORKGROUP_SIZE`.
pub fn compute_source(agent_kernel: Option<&str>) -> String {
    let mut source = layout::wgsl_declarations();
    source.push('\n');
    source.push_str(include_str!("compute.wgsl"));
    if let Some(kernel) = agent_kernel {
        source.push('\n');
        source.push_str(kernel);
    }
    source
}

pub fn draw_source() -> String {
    let mut source = layout::wgsl_declarations();
    source.push('\n');
    source.push_str(include_str!("draw.wgsl"));
    source
}

/// Parses and validates WGSL so errors surface with the offending source line.
pub fn validate(name: &'static str, source: &str) -> Result<()> {
    let module = layout::parse_wgsl(name, source)?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|err| Error::Shader {
        name,
        message: err.to_string(),
    })?;
    Ok(())
}

fn storage_entry(
    binding: u32,
    visibility: wgpu::ShaderStages,
    read_only: bool,
    min_size: usize,
) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: wgpu::BufferSize::new(min_size as _),
        },
        count: None,
    }
}

fn stage_write(
    belt: &mut wgpu::util::StagingBelt,
    encoder: &mut wgpu::CommandEncoder,
    device: &wgpu::Device,
    target: &wgpu::Buffer,
    bytes: &[u8],
) {
    if let Some(size) = wgpu::BufferSize::new(bytes.len() as _) {
        belt.write_buffer(encoder, target, 0, size, device)
            .copy_from_slice(bytes);
    }
}

pub struct Gpu {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl Gpu {
    /// Headless device. Adapters without compute or fragment storage support are refused.
    pub async fn request() -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or(Error::NoAdapter)?;

        let info = adapter.get_info();
        if !adapter.get_downlevel_capabilities().is_webgpu_compliant() {
            log::warn!("adapter {} ({:?}) lacks required capabilities", info.name, info.backend);
            return Err(Error::NoAdapter);
        }
        log::info!("using adapter {} ({:?})", info.name, info.backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Slime device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                },
                None,
            )
            .await?;

        Ok(Gpu { device, queue })
    }

    fn read_buffer<T: bytemuck::Pod>(&self, source: &wgpu::Buffer, count: usize) -> Result<Vec<T>> {
        let size = (count * size_of::<T>()) as wgpu::BufferAddress;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("Readback") });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver.recv().map_err(|_| Error::MapCancelled)??;

        let values = {
            let data = slice.get_mapped_range();
            data.chunks_exact(size_of::<T>())
                .map(bytemuck::pod_read_unaligned)
                .collect()
        };
        staging.unmap();
        Ok(values)
    }
}

/// GPU resources of one simulation session.
pub struct GpuSession {
    agent_buffer: wgpu::Buffer,
    agent_data_buffer: wgpu::Buffer,
    shader_options_buffer: wgpu::Buffer,
    trail_buffers: [wgpu::Buffer; 2],
    deposit_buffer: wgpu::Buffer,
    vertex_buffer: wgpu::Buffer,

    /// `[i]` reads trail buffer `i` and writes the other one.
    compute_bind_groups: [wgpu::BindGroup; 2],
    /// Trail buffer 0, trail buffer 1, deposits.
    render_bind_groups: [wgpu::BindGroup; 3],

    agent_pipeline: Option<wgpu::ComputePipeline>,
    trail_pipeline: wgpu::ComputePipeline,
    render_pipeline: wgpu::RenderPipeline,

    target: wgpu::Texture,
    target_view: wgpu::TextureView,

    staging_belt: wgpu::util::StagingBelt,
    extent: FieldExtent,
    agent_data: AgentData,
    shader_options: ShaderOptions,
    number_agents: u32,
    palette_len: usize,
    current: usize,
    frame_num: usize,
}

impl GpuSession {
    pub fn new(
        gpu: &Gpu,
        config: &SessionConfig,
        agents: &[Agent],
        agent_kernel: Option<&str>,
    ) -> Result<Self> {
        config.validate()?;
        agents::verify(agents, config.number_agents as usize)?;

        let device = &gpu.device;
        let agent_data = config.agent_data();
        let extent = FieldExtent::of(&agent_data);

        let limits = device.limits();
        if extent.width > limits.max_texture_dimension_2d
            || extent.height > limits.max_texture_dimension_2d
        {
            return Err(Error::InvalidConfig(format!(
                "{}x{} field exceeds the device texture limit {}",
                extent.width, extent.height, limits.max_texture_dimension_2d
            )));
        }
        let agent_bytes = (agents.len() * size_of::<Agent>()) as u64;
        for (what, bytes) in [("agent buffer", agent_bytes), ("trail field", extent.byte_len())] {
            if bytes > limits.max_storage_buffer_binding_size as u64 {
                return Err(Error::InvalidConfig(format!(
                    "{} needs {} bytes, the device binds at most {}",
                    what, bytes, limits.max_storage_buffer_binding_size
                )));
            }
        }

        let compute_source = compute_source(agent_kernel);
        validate("compute", &compute_source)?;
        let draw_source = draw_source();
        validate("draw", &draw_source)?;

        let agent_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Agent buffer"),
            contents: bytemuck::cast_slice(agents),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
        });
        let agent_data_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Agent data buffer"),
            contents: bytemuck::bytes_of(&agent_data),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        });
        let palette = config.palette();
        let species_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Species buffer"),
            contents: bytemuck::cast_slice(&palette),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let shader_options_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Shader options buffer"),
            contents: bytemuck::bytes_of(&config.shader_options),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        });

        let field_buffer = |label: &'static str| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: extent.byte_len(),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let trail_buffers = [field_buffer("Trail buffer A"), field_buffer("Trail buffer B")];
        let deposit_buffer = field_buffer("Deposit buffer");

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Vertex buffer"),
            contents: bytemuck::cast_slice(&QUAD[..]),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let compute = wgpu::ShaderStages::COMPUTE;
        let compute_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Compute bind group layout"),
                entries: &[
                    storage_entry(0, compute, false, Agent::size()),
                    storage_entry(1, compute, true, AgentData::size()),
                    storage_entry(2, compute, true, size_of::<[f32; 4]>()),
                    storage_entry(3, compute, true, ShaderOptions::size()),
                    storage_entry(4, compute, true, CELL_BYTES as usize),
                    storage_entry(5, compute, false, CELL_BYTES as usize),
                    storage_entry(6, compute, false, CELL_BYTES as usize),
                ],
            });

        let compute_bind_group = |src: &wgpu::Buffer, dst: &wgpu::Buffer| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Compute bind group"),
                layout: &compute_bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: agent_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: agent_data_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: species_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: shader_options_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: src.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 5,
                        resource: deposit_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 6,
                        resource: dst.as_entire_binding(),
                    },
                ],
            })
        };
        let compute_bind_groups = [
            compute_bind_group(&trail_buffers[0], &trail_buffers[1]),
            compute_bind_group(&trail_buffers[1], &trail_buffers[0]),
        ];

        let fragment = wgpu::ShaderStages::FRAGMENT;
        let render_bind_group_layout =
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Render bind group layout"),
                entries: &[
                    storage_entry(0, fragment, true, AgentData::size()),
                    storage_entry(1, fragment, true, CELL_BYTES as usize),
                    storage_entry(2, fragment, true, size_of::<[f32; 4]>()),
                ],
            });
        let render_bind_group = |field: &wgpu::Buffer| {
            device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Render bind group"),
                layout: &render_bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: agent_data_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: field.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: species_buffer.as_entire_binding(),
                    },
                ],
            })
        };
        let render_bind_groups = [
            render_bind_group(&trail_buffers[0]),
            render_bind_group(&trail_buffers[1]),
            render_bind_group(&deposit_buffer),
        ];

        let compute_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Compute shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(compute_source)),
        });
        let draw_shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Draw shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(draw_source)),
        });

        let compute_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Compute pipeline layout"),
                bind_group_layouts: &[&compute_bind_group_layout],
                push_constant_ranges: &[],
            });
        let trail_pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Trail compute pipeline"),
            layout: Some(&compute_pipeline_layout),
            module: &compute_shader,
            entry_point: "diffuse_decay",
        });
        let agent_pipeline = agent_kernel.map(|_| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Agents compute pipeline"),
                layout: Some(&compute_pipeline_layout),
                module: &compute_shader,
                entry_point: "update_agents",
            })
        });

        let render_pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Render pipeline layout"),
                bind_group_layouts: &[&render_bind_group_layout],
                push_constant_ranges: &[],
            });
        let render_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Render pipeline"),
            layout: Some(&render_pipeline_layout),
            vertex: wgpu::VertexState {
                module: &draw_shader,
                entry_point: "vs_texture",
                buffers: &[vertex_layout()],
            },
            fragment: Some(wgpu::FragmentState {
                module: &draw_shader,
                entry_point: "fs_texture",
                targets: &[Some(TARGET_FORMAT.into())],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });

        let target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Render target"),
            size: wgpu::Extent3d {
                width: extent.width,
                height: extent.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());

        log::debug!(
            "gpu session: {} agents, {}x{} field, agent kernel {}",
            agents.len(),
            extent.width,
            extent.height,
            if agent_kernel.is_some() { "loaded" } else { "absent" }
        );

        Ok(GpuSession {
            agent_buffer,
            agent_data_buffer,
            shader_options_buffer,
            trail_buffers,
            deposit_buffer,
            vertex_buffer,
            compute_bind_groups,
            render_bind_groups,
            agent_pipeline,
            trail_pipeline,
            render_pipeline,
            target,
            target_view,
            staging_belt: wgpu::util::StagingBelt::new(256),
            extent,
            agent_data,
            shader_options: config.shader_options,
            number_agents: config.number_agents,
            palette_len: palette.len(),
            current: 0,
            frame_num: 0,
        })
    }

    pub fn target(&self) -> &wgpu::Texture {
        &self.target
    }

    pub fn frame_num(&self) -> usize {
        self.frame_num
    }

    /// Uploaded with the next frame.
    pub fn set_shader_options(&mut self, options: ShaderOptions) {
        self.shader_options = options;
    }

    /// Uploaded with the next frame, which fails if the record is invalid or
    /// its dimensions no longer match the allocation.
    pub fn set_agent_data(&mut self, agent_data: AgentData) {
        self.agent_data = agent_data;
    }

    /// Replaces the current trail field.
    pub fn upload_trail(&self, gpu: &Gpu, field: &TrailField) -> Result<()> {
        if field.extent() != self.extent {
            let extent = field.extent();
            return Err(Error::FieldSizeMismatch {
                allocated_width: self.extent.width,
                allocated_height: self.extent.height,
                width: extent.width as i32,
                height: extent.height as i32,
            });
        }
        gpu.queue
            .write_buffer(&self.trail_buffers[self.current], 0, field.as_bytes());
        Ok(())
    }

    pub fn encode_frame(&mut self, gpu: &Gpu, plan: &FramePlan) -> Result<()> {
        config::check_agent_data(&self.agent_data, self.palette_len)?;
        self.extent.check(&self.agent_data)?;

        let device = &gpu.device;
        let mut command_encoder =
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });

        let options = self.shader_options;
        let agent_data = self.agent_data;
        stage_write(
            &mut self.staging_belt,
            &mut command_encoder,
            device,
            &self.shader_options_buffer,
            bytemuck::bytes_of(&options),
        );
        stage_write(
            &mut self.staging_belt,
            &mut command_encoder,
            device,
            &self.agent_data_buffer,
            bytemuck::bytes_of(&agent_data),
        );
        self.staging_belt.finish();

        for stage in plan.stages() {
            match *stage {
                Stage::UpdateAgents => {
                    command_encoder.clear_buffer(&self.deposit_buffer, 0, None);
                    match &self.agent_pipeline {
                        Some(pipeline) => {
                            command_encoder.push_debug_group("compute agent movement");
                            {
                                let mut cpass =
                                    command_encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                                        label: Some("Agent pass"),
                                        timestamp_writes: None,
                                    });
                                cpass.set_pipeline(pipeline);
                                cpass.set_bind_group(0, &self.compute_bind_groups[self.current], &[]);
                                cpass.dispatch_workgroups(
                                    self.number_agents.div_ceil(AGENT_WORKGROUP_SIZE),
                                    1,
                                    1,
                                );
                            }
                            command_encoder.pop_debug_group();
                        }
                        None => log::trace!("no agent kernel, skipping agent pass"),
                    }
                }
                Stage::DiffuseTrails => {
                    command_encoder.push_debug_group("compute trail diffusion");
                    {
                        let mut cpass =
                            command_encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                                label: Some("Trail pass"),
                                timestamp_writes: None,
                            });
                        cpass.set_pipeline(&self.trail_pipeline);
                        cpass.set_bind_group(0, &self.compute_bind_groups[self.current], &[]);
                        cpass.dispatch_workgroups(
                            self.extent.width.div_ceil(FIELD_WORKGROUP_SIZE),
                            self.extent.height.div_ceil(FIELD_WORKGROUP_SIZE),
                            1,
                        );
                    }
                    command_encoder.pop_debug_group();
                    self.current = 1 - self.current;
                }
                Stage::Render(source) => {
                    let bind_group = match source {
                        RenderSource::Trails => &self.render_bind_groups[self.current],
                        RenderSource::Deposits => &self.render_bind_groups[2],
                    };
                    command_encoder.push_debug_group("render trail field");
                    {
                        let mut rpass =
                            command_encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                                label: Some("Render pass"),
                                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                                    view: &self.target_view,
                                    resolve_target: None,
                                    ops: wgpu::Operations {
                                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                                        store: wgpu::StoreOp::Store,
                                    },
                                })],
                                depth_stencil_attachment: None,
                                timestamp_writes: None,
                                occlusion_query_set: None,
                            });
                        rpass.set_pipeline(&self.render_pipeline);
                        rpass.set_bind_group(0, bind_group, &[]);
                        rpass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
                        rpass.draw(0..QUAD.len() as u32, 0..1);
                    }
                    command_encoder.pop_debug_group();
                }
            }
        }

        gpu.queue.submit(Some(command_encoder.finish()));
        self.staging_belt.recall();

        log::trace!("frame {} submitted: {:?}", self.frame_num, plan.stages());
        self.frame_num += 1;
        Ok(())
    }

    pub fn read_agents(&self, gpu: &Gpu) -> Result<Vec<Agent>> {
        gpu.read_buffer(&self.agent_buffer, self.number_agents as usize)
    }

    pub fn read_trail(&self, gpu: &Gpu) -> Result<Vec<Cell>> {
        gpu.read_buffer(&self.trail_buffers[self.current], self.extent.cells())
    }
}

/// Runs `frames` frames without a window, then checks the agent buffer came back intact.
pub async fn run_headless(config: &SessionConfig, frames: u32) -> Result<()> {
    config.validate()?;
    layout::verify_wgsl_layouts()?;

    let kernel = match &config.agent_kernel {
        Some(path) => Some(fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.clone(),
            source,
        })?),
        None => {
            log::warn!("no agent kernel configured, agents will not move");
            None
        }
    };

    let gpu = Gpu::request().await?;
    let agents = agents::spawn(config, &mut agents::session_rng(config));
    let mut session = GpuSession::new(&gpu, config, &agents, kernel.as_deref())?;

    let plan = FramePlan::for_config(config);
    log::debug!("frame plan: {:?}", plan.stages());
    for _ in 0..frames {
        session.encode_frame(&gpu, &plan)?;
    }

    let agents = session.read_agents(&gpu)?;
    agents::verify(&agents, config.number_agents as usize)?;
    log::info!(
        "ran {} frames, {} agents intact",
        session.frame_num(),
        agents.len()
    );
    Ok(())
}
