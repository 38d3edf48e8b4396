//! WGSL kernels used by the benchmarks.
//!
//! Every kernel declares `@workgroup_size(WG_X, WG_Y, WG_Z)`; the backend
//! prepends the constants once the group size of a launch is known.

use crate::DeviceCapability;

pub const COPY_KERNEL: &str = "single_copy_peer_to_peer";
pub const KERNEL_LATENCY: &str = "kernel_latency";

/// Number of vectors each global bandwidth work item reads.
pub const FETCHES_PER_ITEM: u64 = 16;
/// Operations per lane performed by one compute work item.
pub const OPS_PER_ITEM: u64 = 4096;

pub const VECTOR_WIDTHS: [u32; 3] = [1, 2, 4];

/// What a kernel argument slot accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Buffer,
    /// Raw bytes of exactly this size.
    Scalar(usize),
}

/// Optional device support a kernel cannot run without.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelFeature {
    Fp16,
    Fp64,
}

impl KernelFeature {
    pub fn supported_by(self, capability: &DeviceCapability) -> bool {
        match self {
            KernelFeature::Fp16 => capability.fp16,
            KernelFeature::Fp64 => capability.fp64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct KernelSource {
    pub name: String,
    pub wgsl: String,
    pub arguments: Vec<ArgKind>,
    pub requires: Option<KernelFeature>,
}

#[derive(Clone, Debug, Default)]
pub struct KernelLibrary {
    kernels: Vec<KernelSource>,
}

impl KernelLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kernel(self, name: &str, wgsl: String, arguments: &[ArgKind]) -> Self {
        self.with_gated_kernel(name, wgsl, arguments, None)
    }

    /// Adds a kernel that only devices with `requires` can create.
    pub fn with_gated_kernel(
        mut self,
        name: &str,
        wgsl: String,
        arguments: &[ArgKind],
        requires: Option<KernelFeature>,
    ) -> Self {
        self.kernels.push(KernelSource {
            name: name.to_string(),
            wgsl,
            arguments: arguments.to_vec(),
            requires,
        });
        self
    }

    /// The copy kernel plus every peak benchmark kernel.
    pub fn builtin() -> Self {
        use ArgKind::{Buffer, Scalar};

        let mut library = Self::new()
            .with_kernel(COPY_KERNEL, WGSL_COPY.to_string(), &[Buffer, Buffer])
            .with_kernel(KERNEL_LATENCY, WGSL_KERNEL_LATENCY.to_string(), &[Buffer]);
        for width in VECTOR_WIDTHS {
            library = library.with_kernel(
                &global_bandwidth_name(width),
                wgsl_global_bandwidth(width),
                &[Buffer, Buffer],
            );
            for flavor in COMPUTE_FLAVORS {
                library = library.with_gated_kernel(
                    &(flavor.name)(width),
                    wgsl_compute(&flavor, width),
                    &[Buffer, Scalar(flavor.argument_bytes)],
                    flavor.requires,
                );
            }
        }
        library
    }

    pub fn get(&self, name: &str) -> Option<&KernelSource> {
        self.kernels.iter().find(|k| k.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kernels.iter().map(|k| k.name.as_str())
    }
}

pub fn global_bandwidth_name(width: u32) -> String {
    format!("global_bandwidth_v{}", width)
}

pub fn compute_sp_name(width: u32) -> String {
    format!("compute_sp_v{}", width)
}

pub fn compute_int_name(width: u32) -> String {
    format!("compute_int_v{}", width)
}

pub fn compute_hp_name(width: u32) -> String {
    format!("compute_hp_v{}", width)
}

pub fn compute_dp_name(width: u32) -> String {
    format!("compute_dp_v{}", width)
}

/// Prefixes `source` with the workgroup size constants it is compiled for.
/// `enable` directives stay ahead of the constants.
pub fn with_group_size(source: &str, size: [u32; 3]) -> String {
    let (directives, body): (Vec<&str>, Vec<&str>) = source
        .lines()
        .partition(|line| line.trim_start().starts_with("enable "));
    let mut out = String::new();
    for directive in directives {
        out.push_str(directive.trim());
        out.push('\n');
    }
    out.push_str(&format!(
        "const WG_X: u32 = {}u;\nconst WG_Y: u32 = {}u;\nconst WG_Z: u32 = {}u;\n",
        size[0], size[1], size[2]
    ));
    out.push_str(&body.join("\n"));
    out
}

fn vector_type(scalar: &str, width: u32) -> String {
    if width == 1 {
        scalar.to_string()
    } else {
        format!("vec{}<{}>", width, scalar)
    }
}

fn horizontal_sum(var: &str, width: u32) -> String {
    match width {
        1 => var.to_string(),
        2 => format!("{v}.x + {v}.y", v = var),
        _ => format!("{v}.x + {v}.y + {v}.z + {v}.w", v = var),
    }
}

// Copies 8-byte elements as u32 pairs with a grid-stride loop so a clamped
// group count still covers the whole buffer.
const WGSL_COPY: &str = r#"
@group(0) @binding(0) var<storage, read_write> dst: array<u32>;
@group(0) @binding(1) var<storage, read_write> src: array<u32>;

@compute @workgroup_size(WG_X, WG_Y, WG_Z)
fn single_copy_peer_to_peer(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {
    let n = min(arrayLength(&dst), arrayLength(&src));
    let stride = groups.x * WG_X;
    for (var i = gid.x; i < n; i = i + stride) {
        dst[i] = src[i];
    }
}
"#;

const WGSL_KERNEL_LATENCY: &str = r#"
@group(0) @binding(0) var<storage, read_write> output: array<f32>;

@compute @workgroup_size(WG_X, WG_Y, WG_Z)
fn kernel_latency(@builtin(global_invocation_id) gid: vec3<u32>) {
    output[gid.x % arrayLength(&output)] = f32(gid.x);
}
"#;

const WGSL_LINEAR_ITEM: &str = r#"
fn linear_item(gid: vec3<u32>, groups: vec3<u32>) -> u32 {
    let width = groups.x * WG_X;
    let height = groups.y * WG_Y;
    return gid.x + gid.y * width + gid.z * width * height;
}
"#;

fn wgsl_global_bandwidth(width: u32) -> String {
    let ty = vector_type("f32", width);
    format!(
        r#"
@group(0) @binding(0) var<storage, read_write> input: array<{ty}>;
@group(0) @binding(1) var<storage, read_write> output: array<f32>;
{linear}
@compute @workgroup_size(WG_X, WG_Y, WG_Z)
fn {name}(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {{
    let item = linear_item(gid, groups);
    let stride = groups.x * WG_X * groups.y * WG_Y * groups.z * WG_Z;
    let n = arrayLength(&input);
    var sum = {ty}(0.0);
    for (var k = 0u; k < {fetches}u; k = k + 1u) {{
        sum = sum + input[(item + k * stride) % n];
    }}
    output[item % arrayLength(&output)] = {reduce};
}}
"#,
        ty = ty,
        linear = WGSL_LINEAR_ITEM,
        name = global_bandwidth_name(width),
        fetches = FETCHES_PER_ITEM,
        reduce = horizontal_sum("sum", width),
    )
}

/// Scalar type set of one compute kernel family.
struct ComputeFlavor {
    name: fn(u32) -> String,
    scalar: &'static str,
    /// Type of the uniform argument; f16 is widened for uniform layout.
    param: &'static str,
    output: &'static str,
    argument_bytes: usize,
    requires: Option<KernelFeature>,
}

const COMPUTE_FLAVORS: [ComputeFlavor; 4] = [
    ComputeFlavor {
        name: compute_hp_name,
        scalar: "f16",
        param: "f32",
        output: "f32",
        argument_bytes: 4,
        requires: Some(KernelFeature::Fp16),
    },
    ComputeFlavor {
        name: compute_sp_name,
        scalar: "f32",
        param: "f32",
        output: "f32",
        argument_bytes: 4,
        requires: None,
    },
    ComputeFlavor {
        name: compute_dp_name,
        scalar: "f64",
        param: "f64",
        output: "f32",
        argument_bytes: 8,
        requires: Some(KernelFeature::Fp64),
    },
    ComputeFlavor {
        name: compute_int_name,
        scalar: "i32",
        param: "i32",
        output: "i32",
        argument_bytes: 4,
        requires: None,
    },
];

// 128 iterations of 16 multiply-adds, two operations each: OPS_PER_ITEM.
fn wgsl_compute(flavor: &ComputeFlavor, width: u32) -> String {
    let scalar = flavor.scalar;
    let ty = vector_type(scalar, width);
    let directive = if flavor.requires == Some(KernelFeature::Fp16) {
        "enable f16;\n"
    } else {
        ""
    };
    let mad = "        x = y * x + y;\n        y = x * y + x;\n".repeat(8);
    format!(
        r#"{directive}
struct Params {{
    a: {param},
}}

@group(0) @binding(0) var<storage, read_write> output: array<{output}>;
@group(0) @binding(1) var<uniform> params: Params;
{linear}
@compute @workgroup_size(WG_X, WG_Y, WG_Z)
fn {name}(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) groups: vec3<u32>,
) {{
    let item = linear_item(gid, groups);
    var x = {ty}({scalar}(params.a));
    var y = {ty}({scalar}(item));
    for (var i = 0u; i < 128u; i = i + 1u) {{
{mad}    }}
    output[item % arrayLength(&output)] = {output}({reduce});
}}
"#,
        directive = directive,
        param = flavor.param,
        output = flavor.output,
        scalar = scalar,
        ty = ty,
        linear = WGSL_LINEAR_ITEM,
        name = (flavor.name)(width),
        mad = mad,
        reduce = horizontal_sum("y", width),
    )
}
