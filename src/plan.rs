//! Evaluation plans (§3 `EvalPlan`) and the compiled artifact (§3 `Expr`).

use crate::dtype::DType;
use crate::jit::cache::LoadedKernel;
use crate::typed::Node;

/// A plan for the chunked vector interpreter (§4.4).
pub struct VectorPlan {
    pub tree: Node,
    pub output_dtype: DType,
    pub input_dtypes: Vec<DType>,
    /// UCS-4 cell width for `String`-dtype inputs, `None` otherwise, in
    /// `input_dtypes` order.
    pub input_item_sizes: Vec<Option<usize>>,
    pub has_reduction: bool,
    pub chunk_size: usize,
}

/// A plan for the N-dimensional block evaluator (§4.5).
pub struct NDPlan {
    pub tree: Node,
    pub output_dtype: DType,
    pub input_dtypes: Vec<DType>,
    pub input_item_sizes: Vec<Option<usize>>,
    pub shape: Vec<i64>,
    pub chunk_shape: Vec<i64>,
    pub block_shape: Vec<i64>,
    pub has_reduction: bool,
}

impl NDPlan {
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of blocks along each axis, rounding up for padding.
    pub fn blocks_per_chunk_axis(&self) -> Vec<i64> {
        self.chunk_shape
            .iter()
            .zip(&self.block_shape)
            .map(|(c, b)| (c + b - 1) / b)
            .collect()
    }

    pub fn chunks_per_axis(&self) -> Vec<i64> {
        self.shape
            .iter()
            .zip(&self.chunk_shape)
            .map(|(s, c)| (s + c - 1) / c)
            .collect()
    }
}

/// A plan for a DSL kernel (§4.6, §4.7): the IR fingerprint used as the
/// JIT cache key, the canonical parameter order, and an interpreter
/// fallback plan that is always present and always correct, regardless of
/// whether a JIT kernel is attached.
pub struct KernelPlan {
    pub ir_fingerprint: u64,
    pub parameter_order: Vec<String>,
    pub output_dtype: DType,
    pub jit_kernel: Option<LoadedKernel>,
    pub interp_fallback: InterpFallback,
}

pub enum InterpFallback {
    Vector(Box<VectorPlan>),
    Nd(Box<NDPlan>),
    /// A typechecked DSL kernel body, executed per-element by
    /// [`crate::interpreter::dsl_exec`].
    Stmt(Box<crate::dsl::typecheck::TypedKernel>),
}

pub enum EvalPlan {
    Vector(VectorPlan),
    Nd(NDPlan),
    Kernel(KernelPlan),
}

/// The opaque compiled artifact returned by `compile`/`compile_nd` (§3
/// `Expr`). Exclusively owned by its creator; there is no explicit
/// `free()` beyond Rust's `Drop` (the C-ABI-shaped `free` in §6.1 is a
/// no-op wrapper for callers used to manual lifetime management — see
/// `src/lib.rs`).
pub struct Expr {
    pub plan: EvalPlan,
    pub inferred_output_dtype: DType,
    pub parameter_names: Vec<String>,
    pub variable_dtypes: Vec<DType>,
}

impl Expr {
    pub fn output_dtype(&self) -> DType {
        self.inferred_output_dtype
    }

    pub fn has_jit_kernel(&self) -> bool {
        matches!(&self.plan, EvalPlan::Kernel(k) if k.jit_kernel.is_some())
    }
}
