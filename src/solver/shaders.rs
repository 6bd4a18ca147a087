//! WGSL compute kernels for the block-sparse solver.
//!
//! Everything is double precision, so the module only compiles on adapters
//! exposing `SHADER_F64`. Matrices use the block-CSR layout of
//! `crate::sparse::BlockCsrMatrix` with `u32` indices.
//!
//! Every entry point runs with 64-thread workgroups and walks its index space
//! with a grid-stride loop, so the host may cap the dispatch size. All entry
//! points share one uniform layout, `Params`; fields an entry point does not
//! need are ignored.
//!
//! Entry points:
//! - `spmv_scalar`, `residual_scalar`: block size 1, one workgroup per row
//! - `spmv_blocked`, `residual_blocked`: lane groups of `width` threads per block row
//! - `vmul`: out += alpha * in1 * in2
//! - `restrict_pressure`: coarse[i] = sum_k fine[i*bs+k] * weights[i*bs+k]
//! - `add_coarse_pressure_correction`: fine[i*bs+aux] += coarse[i]
//! - `prolongate_vector`: out[i] += in[col_map[i]]
//! - `dot_partial`: per-workgroup partial sums of x*y
//! - `axpy_vec`, `scale_vec`, `copy_vec`
//! - `block_jacobi`: x_i = D_i^-1 r_i
//! - `ilu_lower`, `ilu_upper`: one level of the block triangular sweeps
pub const SHADER_SOURCE: &str = r#"
struct Params {
    alpha: f64,
    n: u32,
    block_size: u32,
    offset: u32,
    count: u32,
    width: u32,
    aux: u32,
}

const WG_SIZE: u32 = 64u;

// --- SpMV, block size 1 ---
// A workgroup owns a row at a time and reduces the row's products in
// workgroup memory.

var<workgroup> ss_tmp: array<f64, 64>;

@group(0) @binding(0) var<storage, read> ss_values: array<f64>;
@group(0) @binding(1) var<storage, read> ss_cols: array<u32>;
@group(0) @binding(2) var<storage, read> ss_rows: array<u32>;
@group(0) @binding(3) var<storage, read> ss_x: array<f64>;
@group(0) @binding(4) var<storage, read_write> ss_y: array<f64>;
@group(0) @binding(5) var<uniform> ss_params: Params;

@compute @workgroup_size(64)
fn spmv_scalar(
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let lane = lid.x;
    var row = wid.x;
    while row < ss_params.n {
        var sum = f64(0.0);
        let end = ss_rows[row + 1u];
        for (var k = ss_rows[row] + lane; k < end; k = k + WG_SIZE) {
            sum = sum + ss_values[k] * ss_x[ss_cols[k]];
        }
        ss_tmp[lane] = sum;
        workgroupBarrier();

        var stride = WG_SIZE / 2u;
        while stride > 0u {
            if lane < stride {
                ss_tmp[lane] = ss_tmp[lane] + ss_tmp[lane + stride];
            }
            workgroupBarrier();
            stride = stride / 2u;
        }
        if lane == 0u {
            ss_y[row] = ss_tmp[0];
        }
        workgroupBarrier();
        row = row + nwg.x;
    }
}

// --- residual, block size 1: out = rhs - A*x ---

var<workgroup> rs_tmp: array<f64, 64>;

@group(0) @binding(0) var<storage, read> rs_values: array<f64>;
@group(0) @binding(1) var<storage, read> rs_cols: array<u32>;
@group(0) @binding(2) var<storage, read> rs_rows: array<u32>;
@group(0) @binding(3) var<storage, read> rs_x: array<f64>;
@group(0) @binding(4) var<storage, read> rs_rhs: array<f64>;
@group(0) @binding(5) var<storage, read_write> rs_out: array<f64>;
@group(0) @binding(6) var<uniform> rs_params: Params;

@compute @workgroup_size(64)
fn residual_scalar(
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let lane = lid.x;
    var row = wid.x;
    while row < rs_params.n {
        var sum = f64(0.0);
        let end = rs_rows[row + 1u];
        for (var k = rs_rows[row] + lane; k < end; k = k + WG_SIZE) {
            sum = sum + rs_values[k] * rs_x[rs_cols[k]];
        }
        rs_tmp[lane] = sum;
        workgroupBarrier();

        var stride = WG_SIZE / 2u;
        while stride > 0u {
            if lane < stride {
                rs_tmp[lane] = rs_tmp[lane] + rs_tmp[lane + stride];
            }
            workgroupBarrier();
            stride = stride / 2u;
        }
        if lane == 0u {
            rs_out[row] = rs_rhs[row] - rs_tmp[0];
        }
        workgroupBarrier();
        row = row + nwg.x;
    }
}

// --- SpMV, block size > 1 ---
// The workgroup is split into lane groups of `width` threads (the hardware
// execution width), each owning one block row. Within a group, lane l works on
// entry (l % bs2) of blocks first + l / bs2, first + l / bs2 + block_stride, ...
// Lanes below bs then sum the partial products of their block row.

var<workgroup> sb_tmp: array<f64, 64>;

@group(0) @binding(0) var<storage, read> sb_values: array<f64>;
@group(0) @binding(1) var<storage, read> sb_cols: array<u32>;
@group(0) @binding(2) var<storage, read> sb_rows: array<u32>;
@group(0) @binding(3) var<storage, read> sb_x: array<f64>;
@group(0) @binding(4) var<storage, read_write> sb_y: array<f64>;
@group(0) @binding(5) var<uniform> sb_params: Params;

@compute @workgroup_size(64)
fn spmv_blocked(
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let lane = lid.x;
    let width = sb_params.width;
    let groups = WG_SIZE / width;
    let grp = lane / width;
    let glane = lane % width;
    let bs = sb_params.block_size;
    let bs2 = bs * bs;
    let usable = (width / bs2) * bs2;
    let block_stride = usable / bs2;
    let r = (glane % bs2) / bs;
    let c = glane % bs;

    var first_row = wid.x * groups;
    while first_row < sb_params.n {
        let row = first_row + grp;
        var sum = f64(0.0);
        if row < sb_params.n && glane < usable {
            let end = sb_rows[row + 1u];
            for (var b = sb_rows[row] + glane / bs2; b < end; b = b + block_stride) {
                sum = sum + sb_values[b * bs2 + r * bs + c] * sb_x[sb_cols[b] * bs + c];
            }
        }
        sb_tmp[lane] = sum;
        workgroupBarrier();

        if row < sb_params.n && glane < bs {
            var total = f64(0.0);
            for (var l = glane * bs; l < usable; l = l + bs2) {
                for (var cc = 0u; cc < bs; cc = cc + 1u) {
                    total = total + sb_tmp[grp * width + l + cc];
                }
            }
            sb_y[row * bs + glane] = total;
        }
        workgroupBarrier();
        first_row = first_row + nwg.x * groups;
    }
}

// --- residual, block size > 1 ---

var<workgroup> rb_tmp: array<f64, 64>;

@group(0) @binding(0) var<storage, read> rb_values: array<f64>;
@group(0) @binding(1) var<storage, read> rb_cols: array<u32>;
@group(0) @binding(2) var<storage, read> rb_rows: array<u32>;
@group(0) @binding(3) var<storage, read> rb_x: array<f64>;
@group(0) @binding(4) var<storage, read> rb_rhs: array<f64>;
@group(0) @binding(5) var<storage, read_write> rb_out: array<f64>;
@group(0) @binding(6) var<uniform> rb_params: Params;

@compute @workgroup_size(64)
fn residual_blocked(
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let lane = lid.x;
    let width = rb_params.width;
    let groups = WG_SIZE / width;
    let grp = lane / width;
    let glane = lane % width;
    let bs = rb_params.block_size;
    let bs2 = bs * bs;
    let usable = (width / bs2) * bs2;
    let block_stride = usable / bs2;
    let r = (glane % bs2) / bs;
    let c = glane % bs;

    var first_row = wid.x * groups;
    while first_row < rb_params.n {
        let row = first_row + grp;
        var sum = f64(0.0);
        if row < rb_params.n && glane < usable {
            let end = rb_rows[row + 1u];
            for (var b = rb_rows[row] + glane / bs2; b < end; b = b + block_stride) {
                sum = sum + rb_values[b * bs2 + r * bs + c] * rb_x[rb_cols[b] * bs + c];
            }
        }
        rb_tmp[lane] = sum;
        workgroupBarrier();

        if row < rb_params.n && glane < bs {
            var total = f64(0.0);
            for (var l = glane * bs; l < usable; l = l + bs2) {
                for (var cc = 0u; cc < bs; cc = cc + 1u) {
                    total = total + rb_tmp[grp * width + l + cc];
                }
            }
            rb_out[row * bs + glane] = rb_rhs[row * bs + glane] - total;
        }
        workgroupBarrier();
        first_row = first_row + nwg.x * groups;
    }
}

// --- vmul: out += alpha * in1 * in2 ---

@group(0) @binding(0) var<storage, read> vm_in1: array<f64>;
@group(0) @binding(1) var<storage, read> vm_in2: array<f64>;
@group(0) @binding(2) var<storage, read_write> vm_out: array<f64>;
@group(0) @binding(3) var<uniform> vm_params: Params;

@compute @workgroup_size(64)
fn vmul(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    for (var i = gid.x; i < vm_params.n; i = i + nwg.x * WG_SIZE) {
        vm_out[i] = vm_out[i] + vm_params.alpha * vm_in1[i] * vm_in2[i];
    }
}

// --- pressure restriction ---

@group(0) @binding(0) var<storage, read> rp_fine: array<f64>;
@group(0) @binding(1) var<storage, read> rp_weights: array<f64>;
@group(0) @binding(2) var<storage, read_write> rp_coarse: array<f64>;
@group(0) @binding(3) var<uniform> rp_params: Params;

@compute @workgroup_size(64)
fn restrict_pressure(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let bs = rp_params.block_size;
    for (var i = gid.x; i < rp_params.n; i = i + nwg.x * WG_SIZE) {
        var sum = f64(0.0);
        for (var k = 0u; k < bs; k = k + 1u) {
            sum = sum + rp_fine[i * bs + k] * rp_weights[i * bs + k];
        }
        rp_coarse[i] = sum;
    }
}

// --- coarse pressure correction ---

@group(0) @binding(0) var<storage, read> cp_coarse: array<f64>;
@group(0) @binding(1) var<storage, read_write> cp_fine: array<f64>;
@group(0) @binding(2) var<uniform> cp_params: Params;

@compute @workgroup_size(64)
fn add_coarse_pressure_correction(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let bs = cp_params.block_size;
    for (var i = gid.x; i < cp_params.n; i = i + nwg.x * WG_SIZE) {
        let idx = i * bs + cp_params.aux;
        cp_fine[idx] = cp_fine[idx] + cp_coarse[i];
    }
}

// --- prolongation by column map ---

@group(0) @binding(0) var<storage, read> pv_in: array<f64>;
@group(0) @binding(1) var<storage, read> pv_map: array<u32>;
@group(0) @binding(2) var<storage, read_write> pv_out: array<f64>;
@group(0) @binding(3) var<uniform> pv_params: Params;

@compute @workgroup_size(64)
fn prolongate_vector(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    for (var i = gid.x; i < pv_params.n; i = i + nwg.x * WG_SIZE) {
        pv_out[i] = pv_out[i] + pv_in[pv_map[i]];
    }
}

// --- dot product: per-workgroup partial sums, final sum on the host ---

var<workgroup> dot_scratch: array<f64, 64>;

@group(0) @binding(0) var<storage, read> dot_x: array<f64>;
@group(0) @binding(1) var<storage, read> dot_y: array<f64>;
@group(0) @binding(2) var<storage, read_write> dot_out: array<f64>;
@group(0) @binding(3) var<uniform> dot_params: Params;

@compute @workgroup_size(64)
fn dot_partial(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(local_invocation_id) lid: vec3<u32>,
    @builtin(workgroup_id) wid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let local_id = lid.x;
    var sum = f64(0.0);
    for (var i = gid.x; i < dot_params.n; i = i + nwg.x * WG_SIZE) {
        sum = sum + dot_x[i] * dot_y[i];
    }
    dot_scratch[local_id] = sum;
    workgroupBarrier();

    var stride = WG_SIZE / 2u;
    while stride > 0u {
        if local_id < stride {
            dot_scratch[local_id] = dot_scratch[local_id] + dot_scratch[local_id + stride];
        }
        workgroupBarrier();
        stride = stride / 2u;
    }

    if local_id == 0u {
        dot_out[wid.x] = dot_scratch[0];
    }
}

// --- axpy: y += alpha * x ---

@group(0) @binding(0) var<storage, read> axpy_x: array<f64>;
@group(0) @binding(1) var<storage, read_write> axpy_y: array<f64>;
@group(0) @binding(2) var<uniform> axpy_params: Params;

@compute @workgroup_size(64)
fn axpy_vec(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    for (var i = gid.x; i < axpy_params.n; i = i + nwg.x * WG_SIZE) {
        axpy_y[i] = axpy_y[i] + axpy_params.alpha * axpy_x[i];
    }
}

// --- scale: x *= alpha ---

@group(0) @binding(0) var<storage, read_write> scale_x: array<f64>;
@group(0) @binding(1) var<uniform> scale_params: Params;

@compute @workgroup_size(64)
fn scale_vec(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    for (var i = gid.x; i < scale_params.n; i = i + nwg.x * WG_SIZE) {
        scale_x[i] = scale_params.alpha * scale_x[i];
    }
}

// --- copy: dst = src ---

@group(0) @binding(0) var<storage, read> copy_src: array<f64>;
@group(0) @binding(1) var<storage, read_write> copy_dst: array<f64>;
@group(0) @binding(2) var<uniform> copy_params: Params;

@compute @workgroup_size(64)
fn copy_vec(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    for (var i = gid.x; i < copy_params.n; i = i + nwg.x * WG_SIZE) {
        copy_dst[i] = copy_src[i];
    }
}

// --- block Jacobi: x_i = D_i^-1 r_i, one thread per scalar row ---

@group(0) @binding(0) var<storage, read> bj_inv_diag: array<f64>;
@group(0) @binding(1) var<storage, read> bj_r: array<f64>;
@group(0) @binding(2) var<storage, read_write> bj_x: array<f64>;
@group(0) @binding(3) var<uniform> bj_params: Params;

@compute @workgroup_size(64)
fn block_jacobi(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let bs = bj_params.block_size;
    for (var i = gid.x; i < bj_params.n; i = i + nwg.x * WG_SIZE) {
        let row = i / bs;
        let k = i % bs;
        let block_start = row * bs * bs + k * bs;
        var sum = f64(0.0);
        for (var m = 0u; m < bs; m = m + 1u) {
            sum = sum + bj_inv_diag[block_start + m] * bj_r[row * bs + m];
        }
        bj_x[i] = sum;
    }
}

// --- ILU(0) forward sweep over one level: y_i = r_i - sum_{j<i} L_ij y_j ---
// Rows of a level are independent. With aux == 1 a single thread walks the
// level in order, which is how the serial sweep runs.

@group(0) @binding(0) var<storage, read> il_lu: array<f64>;
@group(0) @binding(1) var<storage, read> il_cols: array<u32>;
@group(0) @binding(2) var<storage, read> il_rows: array<u32>;
@group(0) @binding(3) var<storage, read> il_diag: array<u32>;
@group(0) @binding(4) var<storage, read> il_level_rows: array<u32>;
@group(0) @binding(5) var<storage, read> il_r: array<f64>;
@group(0) @binding(6) var<storage, read_write> il_y: array<f64>;
@group(0) @binding(7) var<uniform> il_params: Params;

fn il_row(row: u32) {
    let bs = il_params.block_size;
    let bs2 = bs * bs;
    let start = il_rows[row];
    let diag = il_diag[row];
    for (var k = 0u; k < bs; k = k + 1u) {
        var sum = il_r[row * bs + k];
        for (var idx = start; idx < diag; idx = idx + 1u) {
            let col = il_cols[idx];
            for (var m = 0u; m < bs; m = m + 1u) {
                sum = sum - il_lu[idx * bs2 + k * bs + m] * il_y[col * bs + m];
            }
        }
        il_y[row * bs + k] = sum;
    }
}

@compute @workgroup_size(64)
fn ilu_lower(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    if il_params.aux == 1u {
        if gid.x == 0u {
            for (var t = 0u; t < il_params.count; t = t + 1u) {
                il_row(il_level_rows[il_params.offset + t]);
            }
        }
        return;
    }
    for (var t = gid.x; t < il_params.count; t = t + nwg.x * WG_SIZE) {
        il_row(il_level_rows[il_params.offset + t]);
    }
}

// --- ILU(0) backward sweep over one level: x_i = D_i^-1 (y_i - sum_{j>i} U_ij x_j) ---
// The diagonal blocks of the factor hold D_i^-1. y is used as scratch.

@group(0) @binding(0) var<storage, read> iu_lu: array<f64>;
@group(0) @binding(1) var<storage, read> iu_cols: array<u32>;
@group(0) @binding(2) var<storage, read> iu_rows: array<u32>;
@group(0) @binding(3) var<storage, read> iu_diag: array<u32>;
@group(0) @binding(4) var<storage, read> iu_level_rows: array<u32>;
@group(0) @binding(5) var<storage, read_write> iu_y: array<f64>;
@group(0) @binding(6) var<storage, read_write> iu_x: array<f64>;
@group(0) @binding(7) var<uniform> iu_params: Params;

fn iu_row(row: u32) {
    let bs = iu_params.block_size;
    let bs2 = bs * bs;
    let end = iu_rows[row + 1u];
    let diag = iu_diag[row];
    for (var k = 0u; k < bs; k = k + 1u) {
        var sum = iu_y[row * bs + k];
        for (var idx = diag + 1u; idx < end; idx = idx + 1u) {
            let col = iu_cols[idx];
            for (var m = 0u; m < bs; m = m + 1u) {
                sum = sum - iu_lu[idx * bs2 + k * bs + m] * iu_x[col * bs + m];
            }
        }
        iu_y[row * bs + k] = sum;
    }
    for (var k = 0u; k < bs; k = k + 1u) {
        var acc = f64(0.0);
        for (var m = 0u; m < bs; m = m + 1u) {
            acc = acc + iu_lu[diag * bs2 + k * bs + m] * iu_y[row * bs + m];
        }
        iu_x[row * bs + k] = acc;
    }
}

@compute @workgroup_size(64)
fn ilu_upper(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    if iu_params.aux == 1u {
        if gid.x == 0u {
            for (var t = 0u; t < iu_params.count; t = t + 1u) {
                iu_row(iu_level_rows[iu_params.offset + t]);
            }
        }
        return;
    }
    for (var t = gid.x; t < iu_params.count; t = t + nwg.x * WG_SIZE) {
        iu_row(iu_level_rows[iu_params.offset + t]);
    }
}
"#;

/// Entry points the kernel library dispatches.
pub const ENTRY_POINTS: &[&str] = &[
    "spmv_scalar",
    "residual_scalar",
    "spmv_blocked",
    "residual_blocked",
    "vmul",
    "restrict_pressure",
    "add_coarse_pressure_correction",
    "prolongate_vector",
    "dot_partial",
    "axpy_vec",
    "scale_vec",
    "copy_vec",
    "block_jacobi",
    "ilu_lower",
    "ilu_upper",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_parses() {
        let result = naga::front::wgsl::parse_str(SHADER_SOURCE);
        match result {
            Ok(module) => {
                let entry_names: Vec<&str> =
                    module.entry_points.iter().map(|ep| ep.name.as_str()).collect();
                for name in ENTRY_POINTS {
                    assert!(
                        entry_names.contains(name),
                        "missing entry point: {name}. Found: {entry_names:?}"
                    );
                }
                assert_eq!(entry_names.len(), ENTRY_POINTS.len());
            }
            Err(e) => {
                panic!("WGSL parse error:\n{}", e.emit_to_string(SHADER_SOURCE));
            }
        }
    }

    #[test]
    fn test_entry_points_use_64_thread_workgroups() {
        let module = naga::front::wgsl::parse_str(SHADER_SOURCE).unwrap();
        for ep in &module.entry_points {
            assert_eq!(ep.workgroup_size, [64, 1, 1], "entry point {}", ep.name);
        }
    }
}
