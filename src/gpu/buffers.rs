//! GPU buffer management for the walk kernel

use super::context::GpuContext;
use super::pipeline::WalkPipeline;
use super::{GpuJacobian, GpuWalkConfig};
use anyhow::Result;

const JAC_SIZE: u64 = std::mem::size_of::<GpuJacobian>() as u64;

/// Device buffers sized for a maximum lane count and point count; grown by
/// reallocation when a walk exceeds them.
pub struct WalkBuffers {
    pub config: wgpu::Buffer,
    pub lane_starts: wgpu::Buffer,
    pub step_point: wgpu::Buffer,
    pub out_points: wgpu::Buffer,
    pub staging: wgpu::Buffer,
    pub bind_group: wgpu::BindGroup,
    pub max_lanes: u64,
    pub max_points: u64,
}

impl WalkBuffers {
    pub fn new(
        ctx: &GpuContext,
        pipeline: &WalkPipeline,
        max_lanes: u64,
        max_points: u64,
    ) -> Result<Self> {
        let config = ctx.create_buffer(
            "walk-config",
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            std::mem::size_of::<GpuWalkConfig>() as u64,
        );
        let lane_starts = ctx.create_buffer(
            "walk-lane-starts",
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            max_lanes * JAC_SIZE,
        );
        // the step point reuses the Jacobian layout's first two coordinates
        let step_point = ctx.create_buffer(
            "walk-step-point",
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            64,
        );
        let out_points = ctx.create_buffer(
            "walk-out-points",
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            max_points * JAC_SIZE,
        );
        let staging = ctx.create_buffer(
            "walk-staging",
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            max_points * JAC_SIZE,
        );

        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Walk Bind Group"),
            layout: &pipeline.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: config.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: lane_starts.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: step_point.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: out_points.as_entire_binding(),
                },
            ],
        });

        Ok(Self {
            config,
            lane_starts,
            step_point,
            out_points,
            staging,
            bind_group,
            max_lanes,
            max_points,
        })
    }

    pub fn fits(&self, lanes: u64, points: u64) -> bool {
        lanes <= self.max_lanes && points <= self.max_points
    }
}
