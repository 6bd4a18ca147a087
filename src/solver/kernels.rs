//! Device kernel library.
//!
//! A `KernelContext` owns the device, the queue and what is known about the
//! hardware. It is passed explicitly to every kernel call. The kernels
//! themselves sit behind `DeviceKernels`, chosen when the context is created:
//! `CompiledKernels` when the adapter runs f64 shaders, `StubKernels`
//! otherwise. The stub rejects every call with `Unsupported`.
//!
//! Kernels are submitted to the queue and return without waiting. The host
//! waits when it reads results back, when a solve ends, and after every
//! kernel when verbosity is 4 or more so that each launch can be timed.

use std::cell::{Cell, RefCell, RefMut};
use std::marker::PhantomData;
use std::time::Instant;

use wgpu::util::DeviceExt;

use super::shaders;
use crate::error::{FlowbridgeError, Result};
use crate::sparse::BlockCsrMatrix;

pub(crate) const WORKGROUP_SIZE: u32 = 64;
/// Dispatch size limit per dimension guaranteed by wgpu's default limits.
pub(crate) const MAX_WORKGROUPS: u32 = 65_535;

/// Workgroups for a grid-stride loop over `n` items.
pub(crate) fn workgroup_count(n: usize) -> u32 {
    let groups = n.div_ceil(WORKGROUP_SIZE as usize).max(1);
    groups.min(MAX_WORKGROUPS as usize) as u32
}

fn to_u32(op: &'static str, value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| FlowbridgeError::Unsupported {
        op,
        reason: format!("size {value} does not fit in 32-bit device indices"),
    })
}

/// What the kernels need to know about the hardware.
#[derive(Debug, Clone)]
pub struct HardwareCaps {
    pub adapter_name: String,
    pub vendor: u32,
    pub backend: wgpu::Backend,
    pub supports_f64: bool,
    /// Lanes that execute in lockstep; sizes the lane groups of the
    /// blocked SpMV and residual kernels.
    pub execution_width: u32,
}

impl HardwareCaps {
    pub fn from_adapter(info: &wgpu::AdapterInfo, features: wgpu::Features) -> Self {
        Self {
            adapter_name: info.name.clone(),
            vendor: info.vendor,
            backend: info.backend,
            supports_f64: features.contains(wgpu::Features::SHADER_F64),
            execution_width: execution_width_for_vendor(info.vendor),
        }
    }
}

/// Wavefront width of AMD GCN parts, warp width elsewhere.
pub fn execution_width_for_vendor(vendor: u32) -> u32 {
    match vendor {
        0x1002 => 64,
        0x10DE => 32,
        _ => 32,
    }
}

/// Device, queue and per-bridge kernel state.
pub struct KernelContext {
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    pub caps: HardwareCaps,
    pub verbosity: u32,
    dispatch_count: Cell<u32>,
    readback_count: Cell<u32>,
    dot_scratch: RefCell<Option<DotScratch>>,
}

/// Partial-sum and staging buffers shared by all dot products.
pub(crate) struct DotScratch {
    pub(crate) partials: DeviceBuffer<f64>,
    pub(crate) staging: wgpu::Buffer,
}

impl DotScratch {
    fn new(ctx: &KernelContext, groups: usize) -> Self {
        let partials = DeviceBuffer::zeroed(ctx, "dot_partials", groups);
        let staging = ctx.staging_buffer("dot_staging", partials.capacity);
        Self { partials, staging }
    }
}

impl KernelContext {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, caps: HardwareCaps, verbosity: u32) -> Self {
        Self {
            device,
            queue,
            caps,
            verbosity,
            dispatch_count: Cell::new(0),
            readback_count: Cell::new(0),
            dot_scratch: RefCell::new(None),
        }
    }

    pub fn dispatch_count(&self) -> u32 {
        self.dispatch_count.get()
    }

    pub fn readback_count(&self) -> u32 {
        self.readback_count.get()
    }

    /// Block until the queue is drained.
    pub fn wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| FlowbridgeError::Device(format!("device poll failed: {e}")))?;
        Ok(())
    }

    /// Entries of the cached dot-product partials, 0 before the first dot.
    pub fn reduction_capacity(&self) -> usize {
        self.dot_scratch
            .borrow()
            .as_ref()
            .map_or(0, |s| s.partials.capacity)
    }

    /// Reduction buffers holding at least `groups` partial sums; grown only
    /// when a larger dispatch needs them.
    pub(crate) fn reduction_scratch(&self, groups: usize) -> RefMut<'_, DotScratch> {
        let mut slot = self.dot_scratch.borrow_mut();
        if !matches!(&*slot, Some(s) if s.partials.capacity >= groups) {
            *slot = Some(DotScratch::new(self, groups));
        }
        RefMut::map(slot, |s| s.get_or_insert_with(|| DotScratch::new(self, groups)))
    }

    fn staging_buffer(&self, label: &str, len: usize) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (len.max(1) * std::mem::size_of::<f64>()) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Read the first `len` elements of a buffer back to the host.
    pub(crate) fn read_buffer<T: bytemuck::Pod>(&self, src: &wgpu::Buffer, len: usize) -> Result<Vec<T>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let words = (len * std::mem::size_of::<T>()).div_ceil(std::mem::size_of::<f64>());
        let staging = self.staging_buffer("read_staging", words);
        self.read_through(src, &staging, len)
    }

    /// Read back through a caller-owned staging buffer of sufficient size.
    pub(crate) fn read_through<T: bytemuck::Pod>(
        &self,
        src: &wgpu::Buffer,
        staging: &wgpu::Buffer,
        len: usize,
    ) -> Result<Vec<T>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        self.readback_count.set(self.readback_count.get() + 1);
        let size = (len * std::mem::size_of::<T>()) as u64;
        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(src, 0, staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..size);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = sender.send(r);
        });
        self.wait()?;
        receiver
            .recv()
            .map_err(|_| FlowbridgeError::Device("buffer map callback dropped".into()))?
            .map_err(|e| FlowbridgeError::Device(format!("buffer map failed: {e}")))?;

        let data = slice.get_mapped_range();
        let result: Vec<T> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(result)
    }
}

/// Typed device array with separate length and capacity so that it can be
/// reused for smaller or equal sizes.
pub struct DeviceBuffer<T> {
    pub(crate) buffer: wgpu::Buffer,
    pub(crate) len: usize,
    pub(crate) capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: bytemuck::Pod> DeviceBuffer<T> {
    /// Zero-initialized buffer. Empty buffers get one element so that they
    /// can still be bound.
    pub(crate) fn zeroed(ctx: &KernelContext, label: &str, len: usize) -> Self {
        let capacity = len.max(1);
        let buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: (capacity * std::mem::size_of::<T>()) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            len,
            capacity,
            _marker: PhantomData,
        }
    }

    pub(crate) fn from_slice(ctx: &KernelContext, label: &str, data: &[T]) -> Self {
        if data.is_empty() {
            return Self::zeroed(ctx, label, 0);
        }
        let buffer = ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
        });
        Self {
            buffer,
            len: data.len(),
            capacity: data.len(),
            _marker: PhantomData,
        }
    }

    /// Write `data` at the start of the buffer, reallocating when it does
    /// not fit.
    pub(crate) fn write(&mut self, ctx: &KernelContext, label: &str, data: &[T]) {
        if data.len() > self.capacity {
            *self = Self::from_slice(ctx, label, data);
            return;
        }
        if !data.is_empty() {
            ctx.queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(data));
        }
        self.len = data.len();
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Block-CSR matrix resident on the device.
pub struct DeviceMatrix {
    pub(crate) values: DeviceBuffer<f64>,
    pub(crate) col_indices: DeviceBuffer<u32>,
    pub(crate) row_pointers: DeviceBuffer<u32>,
    pub(crate) nb: usize,
    pub(crate) nb_cols: usize,
    pub(crate) block_size: usize,
}

fn index_arrays(matrix: &BlockCsrMatrix) -> Result<(Vec<u32>, Vec<u32>)> {
    let cols = matrix
        .col_indices
        .iter()
        .map(|&c| to_u32("upload_matrix", c))
        .collect::<Result<Vec<u32>>>()?;
    let rows = matrix
        .row_pointers
        .iter()
        .map(|&p| to_u32("upload_matrix", p))
        .collect::<Result<Vec<u32>>>()?;
    Ok((cols, rows))
}

impl DeviceMatrix {
    pub(crate) fn upload(ctx: &KernelContext, matrix: &BlockCsrMatrix) -> Result<Self> {
        let (cols, rows) = index_arrays(matrix)?;
        Ok(Self {
            values: DeviceBuffer::from_slice(ctx, "bsr_values", &matrix.values),
            col_indices: DeviceBuffer::from_slice(ctx, "bsr_col_indices", &cols),
            row_pointers: DeviceBuffer::from_slice(ctx, "bsr_row_pointers", &rows),
            nb: matrix.nb,
            nb_cols: matrix.nb_cols,
            block_size: matrix.block_size,
        })
    }

    /// Rewrite in place; each array is reallocated only if it grew.
    pub(crate) fn update(&mut self, ctx: &KernelContext, matrix: &BlockCsrMatrix) -> Result<()> {
        let (cols, rows) = index_arrays(matrix)?;
        self.values.write(ctx, "bsr_values", &matrix.values);
        self.col_indices.write(ctx, "bsr_col_indices", &cols);
        self.row_pointers.write(ctx, "bsr_row_pointers", &rows);
        self.nb = matrix.nb;
        self.nb_cols = matrix.nb_cols;
        self.block_size = matrix.block_size;
        Ok(())
    }
}

// Shader Params layout: { alpha: f64, n, block_size, offset, count, width, aux: u32 }
// 32 bytes, no implicit padding on either side.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    alpha: f64,
    n: u32,
    block_size: u32,
    offset: u32,
    count: u32,
    width: u32,
    aux: u32,
}

/// Triangular-solve operands on the device.
pub struct DeviceIluView<'a> {
    pub lu: &'a DeviceMatrix,
    pub diag_ptr: &'a DeviceBuffer<u32>,
    pub level_rows: &'a DeviceBuffer<u32>,
    pub offset: usize,
    pub count: usize,
    pub serial: bool,
}

/// Sparse primitives executed on the accelerator.
pub trait DeviceKernels {
    fn name(&self) -> &'static str;

    /// y = A x
    fn spmv(
        &self,
        ctx: &KernelContext,
        a: &DeviceMatrix,
        x: &DeviceBuffer<f64>,
        y: &DeviceBuffer<f64>,
    ) -> Result<()>;

    /// out = rhs - A x
    fn residual(
        &self,
        ctx: &KernelContext,
        a: &DeviceMatrix,
        x: &DeviceBuffer<f64>,
        rhs: &DeviceBuffer<f64>,
        out: &DeviceBuffer<f64>,
    ) -> Result<()>;

    /// out += alpha * in1 * in2
    fn vmul(
        &self,
        ctx: &KernelContext,
        alpha: f64,
        in1: &DeviceBuffer<f64>,
        in2: &DeviceBuffer<f64>,
        out: &DeviceBuffer<f64>,
    ) -> Result<()>;

    fn restrict_to_pressure(
        &self,
        ctx: &KernelContext,
        fine: &DeviceBuffer<f64>,
        weights: &DeviceBuffer<f64>,
        coarse: &DeviceBuffer<f64>,
        nb: usize,
        block_size: usize,
    ) -> Result<()>;

    fn add_coarse_pressure_correction(
        &self,
        ctx: &KernelContext,
        coarse: &DeviceBuffer<f64>,
        fine: &DeviceBuffer<f64>,
        nb: usize,
        block_size: usize,
        pressure_index: usize,
    ) -> Result<()>;

    fn prolongate_vector(
        &self,
        ctx: &KernelContext,
        input: &DeviceBuffer<f64>,
        output: &DeviceBuffer<f64>,
        col_map: &DeviceBuffer<u32>,
        n: usize,
    ) -> Result<()>;

    fn dot(&self, ctx: &KernelContext, x: &DeviceBuffer<f64>, y: &DeviceBuffer<f64>) -> Result<f64>;

    fn axpy(
        &self,
        ctx: &KernelContext,
        alpha: f64,
        x: &DeviceBuffer<f64>,
        y: &DeviceBuffer<f64>,
    ) -> Result<()>;

    fn scale(&self, ctx: &KernelContext, alpha: f64, x: &DeviceBuffer<f64>) -> Result<()>;

    fn copy(&self, ctx: &KernelContext, src: &DeviceBuffer<f64>, dst: &DeviceBuffer<f64>) -> Result<()>;

    fn block_jacobi(
        &self,
        ctx: &KernelContext,
        inv_diag: &DeviceBuffer<f64>,
        r: &DeviceBuffer<f64>,
        x: &DeviceBuffer<f64>,
        n: usize,
        block_size: usize,
    ) -> Result<()>;

    fn ilu_lower(
        &self,
        ctx: &KernelContext,
        view: &DeviceIluView<'_>,
        r: &DeviceBuffer<f64>,
        y: &DeviceBuffer<f64>,
    ) -> Result<()>;

    fn ilu_upper(
        &self,
        ctx: &KernelContext,
        view: &DeviceIluView<'_>,
        y: &DeviceBuffer<f64>,
        x: &DeviceBuffer<f64>,
    ) -> Result<()>;
}

/// Pick the kernel strategy for the adapter behind `ctx`.
pub fn select_kernels(ctx: &KernelContext) -> Box<dyn DeviceKernels> {
    if ctx.caps.supports_f64 {
        tracing::info!(adapter = %ctx.caps.adapter_name, "f64 shaders available, compiling kernels");
        Box::new(CompiledKernels::new(ctx))
    } else {
        tracing::warn!(adapter = %ctx.caps.adapter_name, "adapter lacks f64 shader support");
        Box::new(StubKernels::new(format!(
            "adapter '{}' does not support f64 shaders",
            ctx.caps.adapter_name
        )))
    }
}

/// Kernels compiled from `shaders::SHADER_SOURCE`.
pub struct CompiledKernels {
    spmv_scalar: wgpu::ComputePipeline,
    residual_scalar: wgpu::ComputePipeline,
    spmv_blocked: wgpu::ComputePipeline,
    residual_blocked: wgpu::ComputePipeline,
    vmul: wgpu::ComputePipeline,
    restrict_pressure: wgpu::ComputePipeline,
    add_coarse_pressure_correction: wgpu::ComputePipeline,
    prolongate_vector: wgpu::ComputePipeline,
    dot_partial: wgpu::ComputePipeline,
    axpy: wgpu::ComputePipeline,
    scale: wgpu::ComputePipeline,
    copy: wgpu::ComputePipeline,
    block_jacobi: wgpu::ComputePipeline,
    ilu_lower: wgpu::ComputePipeline,
    ilu_upper: wgpu::ComputePipeline,
}

impl CompiledKernels {
    pub fn new(ctx: &KernelContext) -> Self {
        let shader_module = ctx.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("flowbridge_kernels"),
            source: wgpu::ShaderSource::Wgsl(shaders::SHADER_SOURCE.into()),
        });

        let make_pipeline = |entry_point: &str| -> wgpu::ComputePipeline {
            ctx.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: None,
                module: &shader_module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
        };

        Self {
            spmv_scalar: make_pipeline("spmv_scalar"),
            residual_scalar: make_pipeline("residual_scalar"),
            spmv_blocked: make_pipeline("spmv_blocked"),
            residual_blocked: make_pipeline("residual_blocked"),
            vmul: make_pipeline("vmul"),
            restrict_pressure: make_pipeline("restrict_pressure"),
            add_coarse_pressure_correction: make_pipeline("add_coarse_pressure_correction"),
            prolongate_vector: make_pipeline("prolongate_vector"),
            dot_partial: make_pipeline("dot_partial"),
            axpy: make_pipeline("axpy_vec"),
            scale: make_pipeline("scale_vec"),
            copy: make_pipeline("copy_vec"),
            block_jacobi: make_pipeline("block_jacobi"),
            ilu_lower: make_pipeline("ilu_lower"),
            ilu_upper: make_pipeline("ilu_upper"),
        }
    }

    /// Bind `resources` to bindings 0.., the params uniform after them, and
    /// submit one dispatch.
    fn dispatch(
        &self,
        ctx: &KernelContext,
        op: &'static str,
        pipeline: &wgpu::ComputePipeline,
        resources: &[&wgpu::Buffer],
        params: Params,
        workgroups: u32,
    ) -> Result<()> {
        let device = &ctx.device;
        let params_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("kernel_params"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let mut entries: Vec<wgpu::BindGroupEntry> = resources
            .iter()
            .enumerate()
            .map(|(i, buf)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buf.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: resources.len() as u32,
            resource: params_buf.as_entire_binding(),
        });
        let bg = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(op),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &entries,
        });

        let start = (ctx.verbosity >= 4).then(Instant::now);
        let mut encoder = device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, Some(&bg), &[]);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }
        ctx.queue.submit(Some(encoder.finish()));
        ctx.dispatch_count.set(ctx.dispatch_count.get() + 1);

        if let Some(start) = start {
            ctx.wait()?;
            tracing::info!(
                kernel = op,
                workgroups,
                elapsed_us = start.elapsed().as_micros() as u64,
                "kernel finished"
            );
        }
        Ok(())
    }

    fn lane_groups(ctx: &KernelContext, op: &'static str, block_size: usize) -> Result<u32> {
        let width = ctx.caps.execution_width;
        if (block_size * block_size) as u32 > width {
            return Err(FlowbridgeError::Unsupported {
                op,
                reason: format!(
                    "{block_size}x{block_size} blocks do not fit a lane group of {width}"
                ),
            });
        }
        Ok(WORKGROUP_SIZE / width)
    }
}

impl DeviceKernels for CompiledKernels {
    fn name(&self) -> &'static str {
        "compiled"
    }

    fn spmv(
        &self,
        ctx: &KernelContext,
        a: &DeviceMatrix,
        x: &DeviceBuffer<f64>,
        y: &DeviceBuffer<f64>,
    ) -> Result<()> {
        let resources = [
            &a.values.buffer,
            &a.col_indices.buffer,
            &a.row_pointers.buffer,
            &x.buffer,
            &y.buffer,
        ];
        let mut params = Params {
            n: to_u32("spmv", a.nb)?,
            block_size: a.block_size as u32,
            ..Default::default()
        };
        if a.block_size == 1 {
            let wg = (a.nb as u32).clamp(1, MAX_WORKGROUPS);
            self.dispatch(ctx, "spmv", &self.spmv_scalar, &resources, params, wg)
        } else {
            let groups = Self::lane_groups(ctx, "spmv", a.block_size)?;
            params.width = ctx.caps.execution_width;
            let wg = (a.nb as u32).div_ceil(groups).clamp(1, MAX_WORKGROUPS);
            self.dispatch(ctx, "spmv", &self.spmv_blocked, &resources, params, wg)
        }
    }

    fn residual(
        &self,
        ctx: &KernelContext,
        a: &DeviceMatrix,
        x: &DeviceBuffer<f64>,
        rhs: &DeviceBuffer<f64>,
        out: &DeviceBuffer<f64>,
    ) -> Result<()> {
        let resources = [
            &a.values.buffer,
            &a.col_indices.buffer,
            &a.row_pointers.buffer,
            &x.buffer,
            &rhs.buffer,
            &out.buffer,
        ];
        let mut params = Params {
            n: to_u32("residual", a.nb)?,
            block_size: a.block_size as u32,
            ..Default::default()
        };
        if a.block_size == 1 {
            let wg = (a.nb as u32).clamp(1, MAX_WORKGROUPS);
            self.dispatch(ctx, "residual", &self.residual_scalar, &resources, params, wg)
        } else {
            let groups = Self::lane_groups(ctx, "residual", a.block_size)?;
            params.width = ctx.caps.execution_width;
            let wg = (a.nb as u32).div_ceil(groups).clamp(1, MAX_WORKGROUPS);
            self.dispatch(ctx, "residual", &self.residual_blocked, &resources, params, wg)
        }
    }

    fn vmul(
        &self,
        ctx: &KernelContext,
        alpha: f64,
        in1: &DeviceBuffer<f64>,
        in2: &DeviceBuffer<f64>,
        out: &DeviceBuffer<f64>,
    ) -> Result<()> {
        let n = out.len.min(in1.len).min(in2.len);
        let params = Params {
            alpha,
            n: to_u32("vmul", n)?,
            ..Default::default()
        };
        self.dispatch(
            ctx,
            "vmul",
            &self.vmul,
            &[&in1.buffer, &in2.buffer, &out.buffer],
            params,
            workgroup_count(n),
        )
    }

    fn restrict_to_pressure(
        &self,
        ctx: &KernelContext,
        fine: &DeviceBuffer<f64>,
        weights: &DeviceBuffer<f64>,
        coarse: &DeviceBuffer<f64>,
        nb: usize,
        block_size: usize,
    ) -> Result<()> {
        let params = Params {
            n: to_u32("restrict_to_pressure", nb)?,
            block_size: block_size as u32,
            ..Default::default()
        };
        self.dispatch(
            ctx,
            "restrict_to_pressure",
            &self.restrict_pressure,
            &[&fine.buffer, &weights.buffer, &coarse.buffer],
            params,
            workgroup_count(nb),
        )
    }

    fn add_coarse_pressure_correction(
        &self,
        ctx: &KernelContext,
        coarse: &DeviceBuffer<f64>,
        fine: &DeviceBuffer<f64>,
        nb: usize,
        block_size: usize,
        pressure_index: usize,
    ) -> Result<()> {
        let params = Params {
            n: to_u32("add_coarse_pressure_correction", nb)?,
            block_size: block_size as u32,
            aux: pressure_index as u32,
            ..Default::default()
        };
        self.dispatch(
            ctx,
            "add_coarse_pressure_correction",
            &self.add_coarse_pressure_correction,
            &[&coarse.buffer, &fine.buffer],
            params,
            workgroup_count(nb),
        )
    }

    fn prolongate_vector(
        &self,
        ctx: &KernelContext,
        input: &DeviceBuffer<f64>,
        output: &DeviceBuffer<f64>,
        col_map: &DeviceBuffer<u32>,
        n: usize,
    ) -> Result<()> {
        let params = Params {
            n: to_u32("prolongate_vector", n)?,
            ..Default::default()
        };
        self.dispatch(
            ctx,
            "prolongate_vector",
            &self.prolongate_vector,
            &[&input.buffer, &col_map.buffer, &output.buffer],
            params,
            workgroup_count(n),
        )
    }

    fn dot(&self, ctx: &KernelContext, x: &DeviceBuffer<f64>, y: &DeviceBuffer<f64>) -> Result<f64> {
        let n = x.len.min(y.len);
        let wg = workgroup_count(n);
        let params = Params {
            n: to_u32("dot", n)?,
            ..Default::default()
        };
        let scratch = ctx.reduction_scratch(wg as usize);
        self.dispatch(
            ctx,
            "dot",
            &self.dot_partial,
            &[&x.buffer, &y.buffer, &scratch.partials.buffer],
            params,
            wg,
        )?;
        // Partial sums come back in f64 and are reduced on the host
        let values: Vec<f64> = ctx.read_through(&scratch.partials.buffer, &scratch.staging, wg as usize)?;
        Ok(values.iter().sum())
    }

    fn axpy(
        &self,
        ctx: &KernelContext,
        alpha: f64,
        x: &DeviceBuffer<f64>,
        y: &DeviceBuffer<f64>,
    ) -> Result<()> {
        let n = x.len.min(y.len);
        let params = Params {
            alpha,
            n: to_u32("axpy", n)?,
            ..Default::default()
        };
        self.dispatch(ctx, "axpy", &self.axpy, &[&x.buffer, &y.buffer], params, workgroup_count(n))
    }

    fn scale(&self, ctx: &KernelContext, alpha: f64, x: &DeviceBuffer<f64>) -> Result<()> {
        let params = Params {
            alpha,
            n: to_u32("scale", x.len)?,
            ..Default::default()
        };
        self.dispatch(ctx, "scale", &self.scale, &[&x.buffer], params, workgroup_count(x.len))
    }

    fn copy(&self, ctx: &KernelContext, src: &DeviceBuffer<f64>, dst: &DeviceBuffer<f64>) -> Result<()> {
        let n = src.len.min(dst.len);
        let params = Params {
            n: to_u32("copy", n)?,
            ..Default::default()
        };
        self.dispatch(ctx, "copy", &self.copy, &[&src.buffer, &dst.buffer], params, workgroup_count(n))
    }

    fn block_jacobi(
        &self,
        ctx: &KernelContext,
        inv_diag: &DeviceBuffer<f64>,
        r: &DeviceBuffer<f64>,
        x: &DeviceBuffer<f64>,
        n: usize,
        block_size: usize,
    ) -> Result<()> {
        let params = Params {
            n: to_u32("block_jacobi_apply", n)?,
            block_size: block_size as u32,
            ..Default::default()
        };
        self.dispatch(
            ctx,
            "block_jacobi_apply",
            &self.block_jacobi,
            &[&inv_diag.buffer, &r.buffer, &x.buffer],
            params,
            workgroup_count(n),
        )
    }

    fn ilu_lower(
        &self,
        ctx: &KernelContext,
        view: &DeviceIluView<'_>,
        r: &DeviceBuffer<f64>,
        y: &DeviceBuffer<f64>,
    ) -> Result<()> {
        let params = Params {
            block_size: view.lu.block_size as u32,
            offset: to_u32("ilu_lower_level", view.offset)?,
            count: to_u32("ilu_lower_level", view.count)?,
            aux: u32::from(view.serial),
            ..Default::default()
        };
        let wg = if view.serial { 1 } else { workgroup_count(view.count) };
        self.dispatch(
            ctx,
            "ilu_lower_level",
            &self.ilu_lower,
            &[
                &view.lu.values.buffer,
                &view.lu.col_indices.buffer,
                &view.lu.row_pointers.buffer,
                &view.diag_ptr.buffer,
                &view.level_rows.buffer,
                &r.buffer,
                &y.buffer,
            ],
            params,
            wg,
        )
    }

    fn ilu_upper(
        &self,
        ctx: &KernelContext,
        view: &DeviceIluView<'_>,
        y: &DeviceBuffer<f64>,
        x: &DeviceBuffer<f64>,
    ) -> Result<()> {
        let params = Params {
            block_size: view.lu.block_size as u32,
            offset: to_u32("ilu_upper_level", view.offset)?,
            count: to_u32("ilu_upper_level", view.count)?,
            aux: u32::from(view.serial),
            ..Default::default()
        };
        let wg = if view.serial { 1 } else { workgroup_count(view.count) };
        self.dispatch(
            ctx,
            "ilu_upper_level",
            &self.ilu_upper,
            &[
                &view.lu.values.buffer,
                &view.lu.col_indices.buffer,
                &view.lu.row_pointers.buffer,
                &view.diag_ptr.buffer,
                &view.level_rows.buffer,
                &y.buffer,
                &x.buffer,
            ],
            params,
            wg,
        )
    }
}

/// Installed when the adapter cannot run the compiled kernels.
pub struct StubKernels {
    reason: String,
}

impl StubKernels {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn fail<T>(&self, op: &'static str) -> Result<T> {
        Err(FlowbridgeError::Unsupported {
            op,
            reason: self.reason.clone(),
        })
    }
}

impl DeviceKernels for StubKernels {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn spmv(&self, _: &KernelContext, _: &DeviceMatrix, _: &DeviceBuffer<f64>, _: &DeviceBuffer<f64>) -> Result<()> {
        self.fail("spmv")
    }

    fn residual(
        &self,
        _: &KernelContext,
        _: &DeviceMatrix,
        _: &DeviceBuffer<f64>,
        _: &DeviceBuffer<f64>,
        _: &DeviceBuffer<f64>,
    ) -> Result<()> {
        self.fail("residual")
    }

    fn vmul(
        &self,
        _: &KernelContext,
        _: f64,
        _: &DeviceBuffer<f64>,
        _: &DeviceBuffer<f64>,
        _: &DeviceBuffer<f64>,
    ) -> Result<()> {
        self.fail("vmul")
    }

    fn restrict_to_pressure(
        &self,
        _: &KernelContext,
        _: &DeviceBuffer<f64>,
        _: &DeviceBuffer<f64>,
        _: &DeviceBuffer<f64>,
        _: usize,
        _: usize,
    ) -> Result<()> {
        self.fail("restrict_to_pressure")
    }

    fn add_coarse_pressure_correction(
        &self,
        _: &KernelContext,
        _: &DeviceBuffer<f64>,
        _: &DeviceBuffer<f64>,
        _: usize,
        _: usize,
        _: usize,
    ) -> Result<()> {
        self.fail("add_coarse_pressure_correction")
    }

    fn prolongate_vector(
        &self,
        _: &KernelContext,
        _: &DeviceBuffer<f64>,
        _: &DeviceBuffer<f64>,
        _: &DeviceBuffer<u32>,
        _: usize,
    ) -> Result<()> {
        self.fail("prolongate_vector")
    }

    fn dot(&self, _: &KernelContext, _: &DeviceBuffer<f64>, _: &DeviceBuffer<f64>) -> Result<f64> {
        self.fail("dot")
    }

    fn axpy(&self, _: &KernelContext, _: f64, _: &DeviceBuffer<f64>, _: &DeviceBuffer<f64>) -> Result<()> {
        self.fail("axpy")
    }

    fn scale(&self, _: &KernelContext, _: f64, _: &DeviceBuffer<f64>) -> Result<()> {
        self.fail("scale")
    }

    fn copy(&self, _: &KernelContext, _: &DeviceBuffer<f64>, _: &DeviceBuffer<f64>) -> Result<()> {
        self.fail("copy")
    }

    fn block_jacobi(
        &self,
        _: &KernelContext,
        _: &DeviceBuffer<f64>,
        _: &DeviceBuffer<f64>,
        _: &DeviceBuffer<f64>,
        _: usize,
        _: usize,
    ) -> Result<()> {
        self.fail("block_jacobi_apply")
    }

    fn ilu_lower(
        &self,
        _: &KernelContext,
        _: &DeviceIluView<'_>,
        _: &DeviceBuffer<f64>,
        _: &DeviceBuffer<f64>,
    ) -> Result<()> {
        self.fail("ilu_lower_level")
    }

    fn ilu_upper(
        &self,
        _: &KernelContext,
        _: &DeviceIluView<'_>,
        _: &DeviceBuffer<f64>,
        _: &DeviceBuffer<f64>,
    ) -> Result<()> {
        self.fail("ilu_upper_level")
    }
}
