//! GPU context and device management

use anyhow::{anyhow, Context as _, Result};
use std::sync::Arc;
use tracing::{debug, info};
use wgpu::util::DeviceExt;

/// Backend fallback order: Vulkan, Metal, DX12, GL.
const FALLBACK_BACKENDS: &[(wgpu::Backends, &str)] = &[
    (wgpu::Backends::VULKAN, "Vulkan"),
    (wgpu::Backends::METAL, "Metal"),
    (wgpu::Backends::DX12, "DX12"),
    (wgpu::Backends::GL, "OpenGL"),
];

/// Shared handles to one compute device.
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
    limits: wgpu::Limits,
}

impl GpuContext {
    /// Open the device at `device_index`, preferring hardware adapters and
    /// falling back to software renderers only when nothing else exists.
    pub async fn new(device_index: u32) -> Result<Self> {
        for &(backends, name) in FALLBACK_BACKENDS {
            debug!("trying {name} backend (hardware only)");
            if let Ok(ctx) = Self::try_backend(device_index, backends, true).await {
                info!("using {name} backend: {}", ctx.device_name());
                return Ok(ctx);
            }
        }
        for &(backends, name) in FALLBACK_BACKENDS {
            debug!("trying {name} backend (including software)");
            if let Ok(ctx) = Self::try_backend(device_index, backends, false).await {
                info!("using {name} backend (software): {}", ctx.device_name());
                return Ok(ctx);
            }
        }
        Err(anyhow!("no usable GPU backends available"))
    }

    fn is_software_adapter(info: &wgpu::AdapterInfo) -> bool {
        if info.device_type == wgpu::DeviceType::Cpu {
            return true;
        }
        let name = info.name.to_lowercase();
        name.contains("llvmpipe")
            || name.contains("swiftshader")
            || name.contains("lavapipe")
            || name.contains("software")
    }

    async fn try_backend(
        device_index: u32,
        backends: wgpu::Backends,
        hardware_only: bool,
    ) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let mut adapters: Vec<_> = instance.enumerate_adapters(backends).await;
        if hardware_only {
            adapters.retain(|a| !Self::is_software_adapter(&a.get_info()));
        }
        if adapters.is_empty() {
            anyhow::bail!("no adapters found");
        }

        adapters.sort_by_key(|a| match a.get_info().device_type {
            wgpu::DeviceType::DiscreteGpu => 0,
            wgpu::DeviceType::VirtualGpu => 1,
            wgpu::DeviceType::IntegratedGpu => 2,
            wgpu::DeviceType::Cpu => 3,
            _ => 4,
        });

        let adapter = adapters
            .into_iter()
            .nth(device_index as usize)
            .context("GPU device index out of range")?;
        let adapter_info = adapter.get_info();

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("bsgs-walk"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
                ..Default::default()
            })
            .await
            .context("failed to create GPU device")?;
        let limits = device.limits();

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            limits,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.adapter_info.name
    }

    pub fn max_workgroups(&self) -> u32 {
        self.limits.max_compute_workgroups_per_dimension
    }

    /// Lanes the walk kernel should run; bounded to avoid TDR-length
    /// dispatches.
    pub fn preferred_lanes(&self) -> u32 {
        (self.max_workgroups().min(256)) * 64
    }

    pub fn create_buffer(&self, label: &str, usage: wgpu::BufferUsages, size: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        })
    }

    pub fn create_buffer_init<T: bytemuck::Pod>(
        &self,
        label: &str,
        usage: wgpu::BufferUsages,
        data: &[T],
    ) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage,
            })
    }

    pub fn create_shader_module(&self, label: &str, source: &str) -> wgpu::ShaderModule {
        self.device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
    }

    /// Blocking read of a mappable buffer.
    pub fn read_buffer<T: bytemuck::Pod>(
        &self,
        buffer: &wgpu::Buffer,
        offset: u64,
        count: u64,
    ) -> Result<Vec<T>> {
        let size = count * std::mem::size_of::<T>() as u64;
        let slice = buffer.slice(offset..offset + size);

        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| anyhow!("GPU poll failed while mapping staging buffer: {e:?}"))?;
        rx.recv()
            .map_err(|e| anyhow!("staging map result lost: {e}"))?
            .map_err(|e| anyhow!("failed to map staging buffer: {e:?}"))?;

        let data = slice.get_mapped_range();
        let out: Vec<T> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        buffer.unmap();
        Ok(out)
    }
}
