//! Kernel selection and the process-wide kernel registry.
//!
//! Every kernel is a WGSL compute shader assembled once from the templates in
//! `shaders/`: a small per-variant prelude fixes the element types, followed by
//! the shared launch helpers and the kernel body. The registry is built on
//! first use and read-only afterwards.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::enums::{ElementType, Method};
use crate::error::{ResampleError, Result};
use crate::volume::Shape;

const LAUNCH: &str = include_str!("shaders/launch.wgsl");
const RESAMPLE_COMMON: &str = include_str!("shaders/resample_common.wgsl");
const NEAREST: &str = include_str!("shaders/nearest.wgsl");
const LINEAR: &str = include_str!("shaders/linear.wgsl");
const CUBSPL: &str = include_str!("shaders/cubspl.wgsl");
const MAX_BLEND: &str = include_str!("shaders/max_blend.wgsl");
const MEAN_BLEND: &str = include_str!("shaders/mean_blend.wgsl");
const MEAN_FINALIZE: &str = include_str!("shaders/mean_finalize.wgsl");

/// Identifies one compiled kernel variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KernelId {
    /// Affine resampling from `input` samples into `output` samples.
    Transform {
        method: Method,
        input: ElementType,
        output: ElementType,
    },
    /// In-place `existing = max(existing, new_view)`.
    MaxBlend(ElementType),
    /// Coverage-gated running sum and count, keyed by the new view's type.
    MeanBlend(ElementType),
    /// `sum / count` where `count > 0`, background elsewhere.
    MeanFinalize,
}

/// A registered kernel: its identity, a readable name and the WGSL source.
#[derive(Debug)]
pub struct KernelHandle {
    pub id: KernelId,
    pub name: String,
    pub source: String,
}

pub struct KernelRegistry {
    kernels: HashMap<KernelId, KernelHandle>,
}

static REGISTRY: OnceLock<KernelRegistry> = OnceLock::new();

impl KernelRegistry {
    /// The registry shared by the whole process.
    pub fn global() -> &'static KernelRegistry {
        REGISTRY.get_or_init(Self::build)
    }

    fn build() -> Self {
        let mut kernels = HashMap::new();
        let mut insert = |id: KernelId, name: String, source: String| {
            kernels.insert(id, KernelHandle { id, name, source });
        };

        for method in Method::ALL {
            for input in ElementType::ALL {
                for output in KernelSelector::output_types(input) {
                    let id = KernelId::Transform {
                        method,
                        input,
                        output,
                    };
                    let name = format!("affine_transform_{method}<{input},{output}>");
                    insert(id, name, transform_source(method, input, output));
                }
            }
        }
        for dtype in ElementType::ALL {
            insert(
                KernelId::MaxBlend(dtype),
                format!("max_blend<{dtype}>"),
                blend_source(dtype, MAX_BLEND),
            );
            insert(
                KernelId::MeanBlend(dtype),
                format!("mean_blend<{dtype}>"),
                blend_source(dtype, MEAN_BLEND),
            );
        }
        insert(
            KernelId::MeanFinalize,
            "mean_finalize".to_string(),
            format!("{LAUNCH}\n{MEAN_FINALIZE}"),
        );

        Self { kernels }
    }

    pub fn get(&self, id: &KernelId) -> Result<&KernelHandle> {
        self.kernels
            .get(id)
            .ok_or_else(|| ResampleError::unsupported(format!("no kernel registered for {id:?}")))
    }

    pub fn handles(&self) -> impl Iterator<Item = &KernelHandle> {
        self.kernels.values()
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

/// Device storage type of an element: uint16 is widened to 32-bit words.
fn wgsl_type(dtype: ElementType) -> &'static str {
    match dtype {
        ElementType::U16 => "u32",
        ElementType::F32 => "f32",
    }
}

fn decode_body(dtype: ElementType) -> &'static str {
    match dtype {
        ElementType::U16 => "return f32(x);",
        ElementType::F32 => "return x;",
    }
}

fn transform_source(method: Method, input: ElementType, output: ElementType) -> String {
    let encode = match output {
        ElementType::U16 => "return u32(clamp(floor(v + 0.5), 0.0, 65535.0));",
        ElementType::F32 => "return v;",
    };
    let body = match method {
        Method::Nearest => NEAREST,
        Method::Linear => LINEAR,
        Method::CubicSpline => CUBSPL,
    };
    format!(
        "alias InElem = {in_ty};\n\
         alias OutElem = {out_ty};\n\
         fn decode_input(x: InElem) -> f32 {{ {decode} }}\n\
         fn encode_output(v: f32) -> OutElem {{ {encode} }}\n\
         {LAUNCH}\n{RESAMPLE_COMMON}\n{body}",
        in_ty = wgsl_type(input),
        out_ty = wgsl_type(output),
        decode = decode_body(input),
    )
}

fn blend_source(dtype: ElementType, body: &str) -> String {
    format!(
        "alias Elem = {ty};\n\
         fn decode_elem(x: Elem) -> f32 {{ {decode} }}\n\
         {LAUNCH}\n{body}",
        ty = wgsl_type(dtype),
        decode = decode_body(dtype),
    )
}

/// Maps (element type, method, preserve-dtype) onto a registered kernel.
pub struct KernelSelector;

impl KernelSelector {
    /// Output element type for a transform. Only uint16 input can keep its
    /// type; float32 input always yields float32.
    pub fn output_type(input: ElementType, preserve_dtype: bool) -> ElementType {
        match (input, preserve_dtype) {
            (ElementType::U16, true) => ElementType::U16,
            _ => ElementType::F32,
        }
    }

    fn output_types(input: ElementType) -> Vec<ElementType> {
        match input {
            ElementType::U16 => vec![ElementType::U16, ElementType::F32],
            ElementType::F32 => vec![ElementType::F32],
        }
    }

    pub fn select(
        input: ElementType,
        method: Method,
        preserve_dtype: bool,
    ) -> Result<&'static KernelHandle> {
        KernelRegistry::global().get(&KernelId::Transform {
            method,
            input,
            output: Self::output_type(input, preserve_dtype),
        })
    }

    /// Same as [`KernelSelector::select`] for names coming from configuration.
    pub fn select_by_name(
        dtype: &str,
        method: &str,
        preserve_dtype: bool,
    ) -> Result<&'static KernelHandle> {
        Self::select(dtype.parse()?, method.parse()?, preserve_dtype)
    }

    pub fn max_blend(dtype: ElementType) -> Result<&'static KernelHandle> {
        KernelRegistry::global().get(&KernelId::MaxBlend(dtype))
    }

    pub fn mean_blend(dtype: ElementType) -> Result<&'static KernelHandle> {
        KernelRegistry::global().get(&KernelId::MeanBlend(dtype))
    }

    pub fn mean_finalize() -> Result<&'static KernelHandle> {
        KernelRegistry::global().get(&KernelId::MeanFinalize)
    }
}

/// Block shape used when the caller does not pick one.
pub const DEFAULT_BLOCK_SHAPE: Shape = (4, 8, 8);

/// Grid and block extents of a kernel launch, both in (Z, Y, X) order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchParameters {
    pub grid: Shape,
    pub block: Shape,
}

impl LaunchParameters {
    /// One thread per voxel: `grid = ceil(shape / block)` per axis.
    pub fn for_volume(shape: Shape, block: Shape) -> Result<Self> {
        if block.0 == 0 || block.1 == 0 || block.2 == 0 {
            return Err(ResampleError::invalid_input(format!(
                "block shape {block:?} has a zero dimension"
            )));
        }
        Ok(Self {
            grid: (
                shape.0.div_ceil(block.0),
                shape.1.div_ceil(block.1),
                shape.2.div_ceil(block.2),
            ),
            block,
        })
    }

    /// Region reached by the launched threads; never smaller than the shape
    /// the parameters were derived from.
    pub fn covered_shape(&self) -> Shape {
        (
            self.grid.0 * self.block.0,
            self.grid.1 * self.block.1,
            self.grid.2 * self.block.2,
        )
    }
}
