//! wgpu compute backend
//!
//! Runs the strided point walk on the GPU with the same 8 x 32-bit limb
//! representation the host uses, so coordinates cross the bus without
//! repacking. Lanes walk disjoint sub-chains in Jacobian form; the host
//! computes the lane start points, then batch-normalizes the results with
//! a single field inversion. Probing and verification stay on the CPU.

mod buffers;
mod context;
mod pipeline;

pub use context::GpuContext;

use crate::backend::StepperBackend;
use crate::math::{batch_to_affine, AffinePoint, Fe, JacobianPoint, U256};
use anyhow::{bail, Result};
use buffers::WalkBuffers;
use bytemuck::{Pod, Zeroable};
use pipeline::{WalkPipeline, WORKGROUP_SIZE};
use std::sync::Mutex;

/// Kernel configuration, mirrored in walk.wgsl.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuWalkConfig {
    pub num_lanes: u32,
    pub steps_per_lane: u32,
    pub pad0: u32,
    pub pad1: u32,
}

/// Jacobian point in kernel layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuJacobian {
    pub x: [u32; 8],
    pub y: [u32; 8],
    pub z: [u32; 8],
}

impl GpuJacobian {
    fn from_point(p: &JacobianPoint) -> Self {
        Self {
            x: p.x.as_u256().limbs,
            y: p.y.as_u256().limbs,
            z: p.z.as_u256().limbs,
        }
    }

    fn to_point(self) -> JacobianPoint {
        JacobianPoint {
            x: Fe::from_u256(U256::new(self.x)),
            y: Fe::from_u256(U256::new(self.y)),
            z: Fe::from_u256(U256::new(self.z)),
        }
    }
}

/// Affine point in kernel layout (x then y, no flag; callers guarantee the
/// step point is finite).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct GpuAffine {
    x: [u32; 8],
    y: [u32; 8],
}

/// GPU implementation of the walk contract.
pub struct GpuStepper {
    ctx: GpuContext,
    pipeline: WalkPipeline,
    buffers: Mutex<Option<WalkBuffers>>,
}

impl GpuStepper {
    pub fn new(ctx: GpuContext) -> Result<Self> {
        let pipeline = WalkPipeline::new(&ctx)?;
        Ok(Self {
            ctx,
            pipeline,
            buffers: Mutex::new(None),
        })
    }

    /// Compute the per-lane start points on the host: one scalar
    /// multiplication for the lane stride, then a chain of additions.
    fn lane_starts(
        start: &JacobianPoint,
        step: &AffinePoint,
        lanes: u64,
        per_lane: u64,
    ) -> Vec<GpuJacobian> {
        let step_jac = JacobianPoint::from_affine(step);
        let lane_stride = JacobianPoint::scalar_mul(&U256::from_u64(per_lane), &step_jac);

        let mut starts = Vec::with_capacity(lanes as usize);
        let mut cursor = *start;
        for i in 0..lanes {
            starts.push(GpuJacobian::from_point(&cursor));
            if i + 1 < lanes {
                cursor = cursor.add(&lane_stride);
            }
        }
        starts
    }
}

impl StepperBackend for GpuStepper {
    fn name(&self) -> &str {
        "gpu"
    }

    fn walk(
        &self,
        start: &JacobianPoint,
        step: &AffinePoint,
        count: usize,
    ) -> Result<Vec<AffinePoint>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if step.infinity {
            bail!("walk step point must be finite");
        }

        let preferred = self.ctx.preferred_lanes() as u64;
        let lanes = (count as u64).min(preferred).max(1);
        let per_lane = (count as u64).div_ceil(lanes);
        let padded = lanes * per_lane;

        let starts = Self::lane_starts(start, step, lanes, per_lane);
        let step_gpu = GpuAffine {
            x: step.x.as_u256().limbs,
            y: step.y.as_u256().limbs,
        };
        let config = GpuWalkConfig {
            num_lanes: lanes as u32,
            steps_per_lane: per_lane as u32,
            pad0: 0,
            pad1: 0,
        };

        let mut guard = self.buffers.lock().expect("walk buffers poisoned");
        if !guard.as_ref().map(|b| b.fits(lanes, padded)).unwrap_or(false) {
            *guard = Some(WalkBuffers::new(
                &self.ctx,
                &self.pipeline,
                lanes,
                padded,
            )?);
        }
        let buffers = guard.as_ref().expect("buffers just ensured");

        self.ctx
            .queue
            .write_buffer(&buffers.config, 0, bytemuck::bytes_of(&config));
        self.ctx
            .queue
            .write_buffer(&buffers.lane_starts, 0, bytemuck::cast_slice(&starts));
        self.ctx
            .queue
            .write_buffer(&buffers.step_point, 0, bytemuck::bytes_of(&step_gpu));

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Walk Encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Walk Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline.pipeline);
            pass.set_bind_group(0, &buffers.bind_group, &[]);
            pass.dispatch_workgroups((lanes as u32).div_ceil(WORKGROUP_SIZE), 1, 1);
        }
        let copy_size = padded * std::mem::size_of::<GpuJacobian>() as u64;
        encoder.copy_buffer_to_buffer(&buffers.out_points, 0, &buffers.staging, 0, copy_size);
        self.ctx.queue.submit(Some(encoder.finish()));

        let raw: Vec<GpuJacobian> = self.ctx.read_buffer(&buffers.staging, 0, padded)?;
        drop(guard);

        // lanes are row-major [lane][step]; flattening preserves walk
        // order, and the padded tail past `count` is discarded
        let jacobians: Vec<JacobianPoint> = raw
            .into_iter()
            .take(count)
            .map(GpuJacobian::to_point)
            .collect();
        Ok(batch_to_affine(&jacobians))
    }
}
