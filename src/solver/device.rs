//! Accelerated `SolverBackend` on top of wgpu.
//!
//! Adapter selection follows the bridge configuration: the accelerator mode
//! picks the wgpu backends to enumerate and `device_id` indexes the adapters
//! found. The kernel strategy is probed once the device exists.

use crate::config::{AcceleratorMode, BridgeConfig};
use crate::error::{FlowbridgeError, Result};
use crate::sparse::BlockCsrMatrix;

use super::backend::{IluFactors, LevelRange, SolverBackend};
use super::kernels::{
    select_kernels, DeviceBuffer, DeviceIluView, DeviceKernels, DeviceMatrix, HardwareCaps,
    KernelContext,
};

/// Device-resident BiCGSTAB backend.
pub struct WgpuBackend {
    ctx: KernelContext,
    kernels: Box<dyn DeviceKernels>,
    accelerator: AcceleratorMode,
}

impl WgpuBackend {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        pollster::block_on(Self::new_async(config))
    }

    async fn new_async(config: &BridgeConfig) -> Result<Self> {
        if !config.accelerator.uses_device() {
            return Err(FlowbridgeError::DeviceInit(
                "accelerator 'none' does not select a device".into(),
            ));
        }
        if config.platform_id != 0 {
            return Err(FlowbridgeError::DeviceInit(format!(
                "could not get platform {}: wgpu exposes a single platform",
                config.platform_id
            )));
        }

        let backends = config.accelerator.backends();
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });
        let adapters: Vec<wgpu::Adapter> = instance.enumerate_adapters(backends).await;
        let found = adapters.len();
        let adapter = adapters.into_iter().nth(config.device_id).ok_or_else(|| {
            FlowbridgeError::DeviceInit(format!(
                "could not get device {} ({found} {} adapters found)",
                config.device_id, config.accelerator
            ))
        })?;

        let info = adapter.get_info();
        let accelerator = AcceleratorMode::from_backend(info.backend).ok_or_else(|| {
            FlowbridgeError::DeviceInit(format!(
                "adapter '{}' uses unsupported backend {:?}",
                info.name, info.backend
            ))
        })?;
        let features = adapter.features() & wgpu::Features::SHADER_F64;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("flowbridge"),
                required_features: features,
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await
            .map_err(|e| FlowbridgeError::DeviceInit(format!("failed to get device: {e}")))?;

        let mut caps = HardwareCaps::from_adapter(&info, features);
        if let Some(width) = config.execution_width {
            caps.execution_width = width;
        }
        tracing::info!(
            adapter = %caps.adapter_name,
            backend = %accelerator,
            vendor = format_args!("{:#06x}", caps.vendor),
            execution_width = caps.execution_width,
            f64 = caps.supports_f64,
            "selected accelerator"
        );

        let ctx = KernelContext::new(device, queue, caps, config.verbosity);
        let kernels = select_kernels(&ctx);
        Ok(Self {
            ctx,
            kernels,
            accelerator,
        })
    }

    /// Backend of the adapter actually in use.
    pub fn accelerator(&self) -> AcceleratorMode {
        self.accelerator
    }

    pub fn caps(&self) -> &HardwareCaps {
        &self.ctx.caps
    }

    pub fn context(&self) -> &KernelContext {
        &self.ctx
    }

    fn ilu_view<'a>(factors: &IluFactors<'a, Self>, level: LevelRange) -> DeviceIluView<'a> {
        DeviceIluView {
            lu: factors.lu,
            diag_ptr: factors.diag_ptr,
            level_rows: factors.level_rows,
            offset: level.offset,
            count: level.count,
            serial: level.serial,
        }
    }
}

fn check_len(op: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(FlowbridgeError::Solve(format!(
            "{op}: expected {expected} values, got {got}"
        )));
    }
    Ok(())
}

impl SolverBackend for WgpuBackend {
    type Buffer = DeviceBuffer<f64>;
    type Matrix = DeviceMatrix;
    type Indices = DeviceBuffer<u32>;

    fn name(&self) -> String {
        format!(
            "{} on {} ({} kernels)",
            self.accelerator,
            self.ctx.caps.adapter_name,
            self.kernels.name()
        )
    }

    fn new_buffer(&self, n: usize) -> Result<DeviceBuffer<f64>> {
        Ok(DeviceBuffer::zeroed(&self.ctx, "vector", n))
    }

    fn resize_buffer(&self, buffer: &mut DeviceBuffer<f64>, n: usize) -> Result<()> {
        if n > buffer.capacity {
            *buffer = DeviceBuffer::zeroed(&self.ctx, "vector", n);
        } else {
            buffer.len = n;
        }
        Ok(())
    }

    fn upload_vec(&self, data: &[f64], buffer: &DeviceBuffer<f64>) -> Result<()> {
        check_len("upload", buffer.len, data.len())?;
        if !data.is_empty() {
            self.ctx
                .queue
                .write_buffer(&buffer.buffer, 0, bytemuck::cast_slice(data));
        }
        Ok(())
    }

    fn download_vec(&self, buffer: &DeviceBuffer<f64>, out: &mut [f64]) -> Result<()> {
        check_len("download", buffer.len, out.len())?;
        let values: Vec<f64> = self.ctx.read_buffer(&buffer.buffer, out.len())?;
        out.copy_from_slice(&values);
        Ok(())
    }

    fn upload_indices(&self, data: &[u32]) -> Result<DeviceBuffer<u32>> {
        Ok(DeviceBuffer::from_slice(&self.ctx, "indices", data))
    }

    fn upload_matrix(&self, matrix: &BlockCsrMatrix) -> Result<DeviceMatrix> {
        DeviceMatrix::upload(&self.ctx, matrix)
    }

    fn update_matrix(&self, target: &mut DeviceMatrix, matrix: &BlockCsrMatrix) -> Result<()> {
        target.update(&self.ctx, matrix)
    }

    fn zero(&self, x: &DeviceBuffer<f64>) -> Result<()> {
        let mut encoder = self.ctx.device.create_command_encoder(&Default::default());
        encoder.clear_buffer(&x.buffer, 0, None);
        self.ctx.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn spmv(&self, a: &DeviceMatrix, x: &DeviceBuffer<f64>, y: &DeviceBuffer<f64>) -> Result<()> {
        check_len("spmv", a.nb_cols * a.block_size, x.len)?;
        check_len("spmv", a.nb * a.block_size, y.len)?;
        self.kernels.spmv(&self.ctx, a, x, y)
    }

    fn residual(
        &self,
        a: &DeviceMatrix,
        x: &DeviceBuffer<f64>,
        rhs: &DeviceBuffer<f64>,
        out: &DeviceBuffer<f64>,
    ) -> Result<()> {
        check_len("residual", a.nb_cols * a.block_size, x.len)?;
        check_len("residual", a.nb * a.block_size, rhs.len)?;
        check_len("residual", a.nb * a.block_size, out.len)?;
        self.kernels.residual(&self.ctx, a, x, rhs, out)
    }

    fn dot(&self, x: &DeviceBuffer<f64>, y: &DeviceBuffer<f64>) -> Result<f64> {
        check_len("dot", x.len, y.len)?;
        self.kernels.dot(&self.ctx, x, y)
    }

    fn axpy(&self, alpha: f64, x: &DeviceBuffer<f64>, y: &DeviceBuffer<f64>) -> Result<()> {
        check_len("axpy", x.len, y.len)?;
        self.kernels.axpy(&self.ctx, alpha, x, y)
    }

    fn scale(&self, alpha: f64, x: &DeviceBuffer<f64>) -> Result<()> {
        self.kernels.scale(&self.ctx, alpha, x)
    }

    fn copy(&self, src: &DeviceBuffer<f64>, dst: &DeviceBuffer<f64>) -> Result<()> {
        check_len("copy", src.len, dst.len)?;
        self.kernels.copy(&self.ctx, src, dst)
    }

    fn vmul(
        &self,
        alpha: f64,
        in1: &DeviceBuffer<f64>,
        in2: &DeviceBuffer<f64>,
        out: &DeviceBuffer<f64>,
    ) -> Result<()> {
        check_len("vmul", out.len, in1.len)?;
        check_len("vmul", out.len, in2.len)?;
        self.kernels.vmul(&self.ctx, alpha, in1, in2, out)
    }

    fn restrict_to_pressure(
        &self,
        fine: &DeviceBuffer<f64>,
        weights: &DeviceBuffer<f64>,
        coarse: &DeviceBuffer<f64>,
        nb: usize,
        block_size: usize,
    ) -> Result<()> {
        check_len("restrict_to_pressure", nb * block_size, fine.len)?;
        check_len("restrict_to_pressure", nb * block_size, weights.len)?;
        check_len("restrict_to_pressure", nb, coarse.len)?;
        self.kernels
            .restrict_to_pressure(&self.ctx, fine, weights, coarse, nb, block_size)
    }

    fn add_coarse_pressure_correction(
        &self,
        coarse: &DeviceBuffer<f64>,
        fine: &DeviceBuffer<f64>,
        nb: usize,
        block_size: usize,
        pressure_index: usize,
    ) -> Result<()> {
        check_len("add_coarse_pressure_correction", nb * block_size, fine.len)?;
        self.kernels.add_coarse_pressure_correction(
            &self.ctx,
            coarse,
            fine,
            nb,
            block_size,
            pressure_index,
        )
    }

    fn prolongate_vector(
        &self,
        input: &DeviceBuffer<f64>,
        output: &DeviceBuffer<f64>,
        col_map: &DeviceBuffer<u32>,
        n: usize,
    ) -> Result<()> {
        if n > output.len || n > col_map.len {
            return Err(FlowbridgeError::Solve(format!(
                "prolongate_vector: {n} rows exceed output ({}) or map ({})",
                output.len, col_map.len
            )));
        }
        self.kernels
            .prolongate_vector(&self.ctx, input, output, col_map, n)
    }

    fn block_jacobi_apply(
        &self,
        inv_diag: &DeviceBuffer<f64>,
        r: &DeviceBuffer<f64>,
        x: &DeviceBuffer<f64>,
        n: usize,
        block_size: usize,
    ) -> Result<()> {
        check_len("block_jacobi_apply", n, x.len)?;
        self.kernels
            .block_jacobi(&self.ctx, inv_diag, r, x, n, block_size)
    }

    fn ilu_lower_level(
        &self,
        factors: &IluFactors<'_, Self>,
        level: LevelRange,
        r: &DeviceBuffer<f64>,
        y: &DeviceBuffer<f64>,
    ) -> Result<()> {
        self.kernels
            .ilu_lower(&self.ctx, &Self::ilu_view(factors, level), r, y)
    }

    fn ilu_upper_level(
        &self,
        factors: &IluFactors<'_, Self>,
        level: LevelRange,
        y: &DeviceBuffer<f64>,
        x: &DeviceBuffer<f64>,
    ) -> Result<()> {
        self.kernels
            .ilu_upper(&self.ctx, &Self::ilu_view(factors, level), y, x)
    }

    fn synchronize(&self) -> Result<()> {
        self.ctx.wait()
    }

    fn counters(&self) -> (u32, u32) {
        (self.ctx.dispatch_count(), self.ctx.readback_count())
    }
}
