//! GPU kernel execution
//!
//! Each operation binds its buffers to one entry point of
//! `shaders/deconv.wgsl`, dispatches one invocation per output element, and
//! waits for the submission to finish.

use super::{GpuBuffer, get_gpu_context};
use crate::ops::DeconvAlgo;
use crate::ops::geometry::DeconvGeometry;
use wgpu::util::DeviceExt;

/// Threads per workgroup (must match `@workgroup_size` in the shader)
const WORKGROUP_SIZE: u32 = 256;
/// Per-dimension dispatch limit guaranteed by wgpu's default limits
const MAX_WORKGROUPS_PER_DIM: u32 = 65535;

/// Uniform block shared by every deconvolution entry point
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DeconvParams {
    pub batch: u32,
    pub in_channels: u32,
    pub out_channels: u32,
    pub in_h: u32,
    pub in_w: u32,
    pub out_h: u32,
    pub out_w: u32,
    pub kernel_h: u32,
    pub kernel_w: u32,
    pub stride_h: u32,
    pub stride_w: u32,
    pub pad_h: u32,
    pub pad_w: u32,
    pub has_bias: u32,
    /// Number of output elements (invocations past this exit early)
    pub total: u32,
    pub _padding: u32, // Align to 16 bytes
}

fn to_u32(v: usize) -> Option<u32> {
    u32::try_from(v).ok()
}

fn checked_len(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Element count of the col2im column buffer, `None` on overflow
fn col_len(g: &DeconvGeometry) -> Option<usize> {
    checked_len(&[g.batch, g.out_channels, g.kernel.h, g.kernel.w, g.in_h, g.in_w])
}

impl DeconvParams {
    /// `None` when a size or `total` does not fit the shader's `u32` fields
    pub fn new(g: &DeconvGeometry, has_bias: bool, total: usize) -> Option<Self> {
        Some(DeconvParams {
            batch: to_u32(g.batch)?,
            in_channels: to_u32(g.in_channels)?,
            out_channels: to_u32(g.out_channels)?,
            in_h: to_u32(g.in_h)?,
            in_w: to_u32(g.in_w)?,
            out_h: to_u32(g.out_h)?,
            out_w: to_u32(g.out_w)?,
            kernel_h: to_u32(g.kernel.h)?,
            kernel_w: to_u32(g.kernel.w)?,
            stride_h: to_u32(g.stride.h)?,
            stride_w: to_u32(g.stride.w)?,
            pad_h: to_u32(g.pad.h)?,
            pad_w: to_u32(g.pad.w)?,
            has_bias: u32::from(has_bias),
            total: to_u32(total)?,
            _padding: 0,
        })
    }
}

/// High-level interface for GPU kernel execution
pub struct GpuKernels;

impl GpuKernels {
    /// Whether every size of `g` and every buffer a kernel indexes (input,
    /// weight, output, col2im columns) fits the shader's 32-bit indices
    pub fn fits_u32(g: &DeconvGeometry) -> bool {
        DeconvParams::new(g, false, 0).is_some()
            && [
                checked_len(&g.x_shape()),
                checked_len(&g.w_shape()),
                checked_len(&g.y_shape()),
                col_len(g),
            ]
            .into_iter()
            .all(|len| len.and_then(to_u32).is_some())
    }

    /// Bind `(binding, buffer)` pairs plus the params uniform at binding 4,
    /// dispatch `params.total` invocations, and wait for completion.
    fn dispatch(
        pipeline: &wgpu::ComputePipeline,
        label: &str,
        buffers: &[(u32, &GpuBuffer)],
        params: &DeconvParams,
    ) -> Option<()> {
        let ctx = get_gpu_context()?;

        let params_buffer = ctx
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Deconv Params"),
                contents: bytemuck::bytes_of(params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let mut entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .map(|(binding, buf)| wgpu::BindGroupEntry {
                binding: *binding,
                resource: buf.buffer().as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: 4,
            resource: params_buffer.as_entire_binding(),
        });

        let bind_group_layout = pipeline.get_bind_group_layout(0);
        let bind_group = ctx.device().create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &bind_group_layout,
            entries: &entries,
        });

        let mut encoder = ctx
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });

        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);

            // Fold large dispatches into a second dimension
            let groups = params.total.div_ceil(WORKGROUP_SIZE).max(1);
            let groups_x = groups.min(MAX_WORKGROUPS_PER_DIM);
            let groups_y = groups.div_ceil(groups_x);
            compute_pass.dispatch_workgroups(groups_x, groups_y, 1);
        }

        ctx.queue().submit(Some(encoder.finish()));
        ctx.increment_pending();
        log::debug!("GPU dispatched {label} over {} elements", params.total);

        ctx.sync().then_some(())
    }

    /// Element-wise `a + b`
    pub fn add(a: &GpuBuffer, b: &GpuBuffer) -> Option<GpuBuffer> {
        if a.len() != b.len() {
            return None;
        }
        let ctx = get_gpu_context()?;
        let result = GpuBuffer::zeros(a.len())?;
        let params = DeconvParams {
            total: to_u32(a.len())?,
            ..DeconvParams::default()
        };
        Self::dispatch(
            &ctx.pipelines().add,
            "Add",
            &[(0, a), (1, b), (3, &result)],
            &params,
        )?;
        Some(result)
    }

    /// Deconvolution forward with the chosen algorithm
    ///
    /// `bias` may be `None`; a one-element placeholder is bound in its slot.
    pub fn deconv_forward(
        x: &GpuBuffer,
        w: &GpuBuffer,
        bias: Option<&GpuBuffer>,
        g: &DeconvGeometry,
        algo: DeconvAlgo,
    ) -> Option<GpuBuffer> {
        let ctx = get_gpu_context()?;
        let placeholder;
        let bias_buf = match bias {
            Some(b) => b,
            None => {
                placeholder = GpuBuffer::zeros(1)?;
                &placeholder
            }
        };
        let y = GpuBuffer::zeros(g.y_len())?;

        match algo {
            DeconvAlgo::Fused => {
                let params = DeconvParams::new(g, bias.is_some(), g.y_len())?;
                Self::dispatch(
                    &ctx.pipelines().deconv_fused,
                    "Deconv Fused",
                    &[(0, x), (1, w), (2, bias_buf), (3, &y)],
                    &params,
                )?;
            }
            DeconvAlgo::Col2im => {
                let col_len = col_len(g)?;
                let col = GpuBuffer::zeros(col_len)?;
                Self::dispatch(
                    &ctx.pipelines().deconv_col2im_gemm,
                    "Deconv GEMM",
                    &[(0, x), (1, w), (3, &col)],
                    &DeconvParams::new(g, false, col_len)?,
                )?;
                Self::dispatch(
                    &ctx.pipelines().deconv_col2im_fold,
                    "Deconv Col2im",
                    &[(0, &col), (2, bias_buf), (3, &y)],
                    &DeconvParams::new(g, bias.is_some(), g.y_len())?,
                )?;
            }
        }
        Some(y)
    }

    /// Input gradient: convolution of `gy` with `w`
    pub fn conv_backward_input(
        gy: &GpuBuffer,
        w: &GpuBuffer,
        g: &DeconvGeometry,
    ) -> Option<GpuBuffer> {
        let ctx = get_gpu_context()?;
        let gx = GpuBuffer::zeros(g.x_len())?;
        Self::dispatch(
            &ctx.pipelines().conv_backward_input,
            "Conv Backward Input",
            &[(0, gy), (1, w), (3, &gx)],
            &DeconvParams::new(g, false, g.x_len())?,
        )?;
        Some(gx)
    }

    /// Weight gradient, one invocation per weight element
    pub fn weight_grad(x: &GpuBuffer, gy: &GpuBuffer, g: &DeconvGeometry) -> Option<GpuBuffer> {
        let ctx = get_gpu_context()?;
        let gw = GpuBuffer::zeros(g.w_len())?;
        Self::dispatch(
            &ctx.pipelines().deconv_backward_weight,
            "Deconv Backward Weight",
            &[(0, x), (1, gy), (3, &gw)],
            &DeconvParams::new(g, false, g.w_len())?,
        )?;
        Some(gw)
    }

    /// Bias gradient, one invocation per output channel
    pub fn bias_grad(gy: &GpuBuffer, g: &DeconvGeometry) -> Option<GpuBuffer> {
        let ctx = get_gpu_context()?;
        let gb = GpuBuffer::zeros(g.out_channels)?;
        Self::dispatch(
            &ctx.pipelines().deconv_backward_bias,
            "Deconv Backward Bias",
            &[(0, gy), (3, &gb)],
            &DeconvParams::new(g, true, g.out_channels)?,
        )?;
        Some(gb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> DeconvGeometry {
        DeconvGeometry::new(&[2, 3, 3, 2], &[3, 2, 3, 3], 2.into(), 1.into()).unwrap()
    }

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<DeconvParams>(), 64);
    }

    #[test]
    fn test_params_from_geometry() {
        let g = geometry();
        let params = DeconvParams::new(&g, true, g.y_len()).unwrap();
        assert_eq!((params.out_h, params.out_w, params.total), (5, 3, 60));
        assert_eq!(params.has_bias, 1);
        assert!(GpuKernels::fits_u32(&g));
    }

    #[test]
    fn test_sizes_past_u32_rejected() {
        let g = geometry();
        let beyond = u32::MAX as usize + 1;
        assert!(DeconvParams::new(&g, false, beyond).is_none());

        let wide = DeconvGeometry { in_w: beyond, ..g };
        assert!(DeconvParams::new(&wide, false, 1).is_none());
        assert!(!GpuKernels::fits_u32(&wide));

        // Every dimension fits, but the output buffer does not
        let large = DeconvGeometry {
            batch: 1 << 16,
            out_channels: 1 << 16,
            ..g
        };
        assert!(DeconvParams::new(&large, false, 1).is_some());
        assert!(!GpuKernels::fits_u32(&large));
    }
}
