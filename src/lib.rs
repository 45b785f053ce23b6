//! MiniExpr: a compile-once / evaluate-many numeric expression engine for
//! typed array data (§1). Source (either the infix expression language or
//! the kernel DSL) compiles to an opaque [`Expr`]; the same `Expr`
//! evaluates over arbitrarily large input arrays via `eval`/`eval_nd`.
//!
//! The pipeline mirrors §2: lexer/infix parser or DSL parser → semantic
//! analysis → an evaluation plan, optionally backed by a JIT-compiled
//! kernel that falls back to the interpreter whenever compilation isn't
//! available or fails.

pub mod ast;
pub mod config;
pub mod dsl;
pub mod dtype;
pub mod error;
pub mod interpreter;
pub mod jit;
pub mod lexer;
pub mod parser;
pub mod plan;
pub mod semantic;
pub mod simd;
pub mod typed;
pub mod variable;

pub use config::RuntimeConfig;
pub use dtype::DType;
pub use error::{CompileError, CompileStatus, EvalError, EvalStatus, SourcePos};
pub use plan::Expr;
pub use variable::Variable;

use error::CompileError as CErr;
use plan::{EvalPlan, InterpFallback, KernelPlan, NDPlan, VectorPlan};
use semantic::Analyzer;

/// Source starting with `def` (ignoring a leading `#` pragma comment or
/// blank lines) is a kernel DSL program (§4.2); anything else is the
/// infix expression language (§4.1).
fn looks_like_dsl(source: &str) -> bool {
    source
        .lines()
        .map(str::trim_start)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .is_some_and(|line| line.starts_with("def "))
}

impl Expr {
    /// Compile `source` against `vars` (§6.1 `compile`). `requested` may be
    /// [`DType::Auto`] to infer the output dtype from the expression.
    pub fn compile(source: &str, vars: &[Variable], requested: DType) -> Result<Expr, CompileError> {
        let parameter_names = vars.iter().map(|v| v.name.clone()).collect::<Vec<_>>();
        let variable_dtypes = vars.iter().map(|v| v.dtype).collect::<Vec<_>>();

        if looks_like_dsl(source) {
            let plan = compile_kernel(source, vars, requested, false)?;
            let inferred_output_dtype = plan.output_dtype;
            return Ok(Expr { plan: EvalPlan::Kernel(plan), inferred_output_dtype, parameter_names, variable_dtypes });
        }

        let plan = Analyzer::compile_vector(source, vars, requested)?;
        let inferred_output_dtype = plan.output_dtype;
        Ok(Expr { plan: EvalPlan::Vector(plan), inferred_output_dtype, parameter_names, variable_dtypes })
    }

    /// Compile `source` against a fixed N-dimensional shape (§6.1
    /// `compile_nd`, §4.5). Only the infix language is accepted here: ND
    /// reserved-index expressions are plain trees the block evaluator
    /// walks directly, unlike the DSL's statement sequence.
    pub fn compile_nd(
        source: &str,
        vars: &[Variable],
        requested: DType,
        shape: &[i64],
        chunk_shape: &[i64],
        block_shape: &[i64],
    ) -> Result<Expr, CompileError> {
        if looks_like_dsl(source) {
            return Err(CErr::Unsupported("compile_nd only accepts the infix expression language, not kernel DSL source".into()));
        }
        let parameter_names = vars.iter().map(|v| v.name.clone()).collect::<Vec<_>>();
        let variable_dtypes = vars.iter().map(|v| v.dtype).collect::<Vec<_>>();
        let plan = Analyzer::compile_nd(source, vars, requested, shape, chunk_shape, block_shape)?;
        let inferred_output_dtype = plan.output_dtype;
        Ok(Expr { plan: EvalPlan::Nd(plan), inferred_output_dtype, parameter_names, variable_dtypes })
    }

    /// Evaluate over `n` elements (§6.1 `eval`). `inputs[k]` must point to
    /// at least `n` valid elements of the dtype `vars[k]` was compiled
    /// with (or `n` UCS-4 cells of its `item_size`, for `String`); `output`
    /// must point to at least `n` elements of [`Expr::output_dtype`] (or
    /// exactly 1, for a top-level reduction).
    ///
    /// # Safety
    /// See the pointer-validity requirements above; they are not checked.
    pub unsafe fn eval(&self, inputs: &[*const u8], n: usize, output: *mut u8) -> Result<(), EvalError> {
        match &self.plan {
            EvalPlan::Vector(plan) => {
                let inputs = interpreter::vector::Inputs { ptrs: inputs };
                interpreter::vector::eval_vector(plan, &inputs, n, output)
            }
            EvalPlan::Nd(_) => Err(EvalError::InvalidArg("this Expr was compiled with compile_nd; call eval_nd instead".into())),
            EvalPlan::Kernel(kernel) => eval_kernel(kernel, &self.parameter_names, &self.variable_dtypes, inputs, n, output),
        }
    }

    /// Evaluate one ND block (§6.1 `eval_nd`, §4.5). `output` must point to
    /// at least `padded_nitems` elements of [`Expr::output_dtype`].
    ///
    /// # Safety
    /// `inputs[k]` must point at the full backing array declared by the
    /// plan's `shape` for variable `k`; `output` must have room for
    /// `padded_nitems` elements.
    pub unsafe fn eval_nd(
        &self,
        inputs: &[*const u8],
        output: *mut u8,
        padded_nitems: usize,
        chunk_linear_idx: i64,
        block_linear_idx: i64,
    ) -> Result<(), EvalError> {
        match &self.plan {
            EvalPlan::Nd(plan) => {
                let inputs = interpreter::vector::Inputs { ptrs: inputs };
                interpreter::nd::eval_nd(plan, &inputs, output, padded_nitems, chunk_linear_idx, block_linear_idx)
            }
            _ => Err(EvalError::InvalidArg("this Expr was not compiled with compile_nd".into())),
        }
    }

    /// `nd_valid_nitems` (§6.1, §4.5): the number of elements in the
    /// requested block that lie within the unpadded array, without
    /// evaluating anything.
    pub fn nd_valid_nitems(&self, chunk_linear_idx: i64, block_linear_idx: i64) -> Result<usize, EvalError> {
        match &self.plan {
            EvalPlan::Nd(plan) => interpreter::nd::valid_nitems(plan, chunk_linear_idx, block_linear_idx),
            _ => Err(EvalError::InvalidArg("this Expr was not compiled with compile_nd".into())),
        }
    }
}

fn compile_kernel(source: &str, vars: &[Variable], requested: DType, _nd: bool) -> Result<KernelPlan, CompileError> {
    for v in vars {
        v.validate()?;
    }
    let prog = dsl::parse(source)?;
    let typed = dsl::typecheck(&prog, vars)?;

    let output_dtype = if requested == DType::Auto {
        typed.output_dtype
    } else if typed.output_dtype != requested && !typed.output_dtype.castable_to(requested) {
        return Err(CErr::InvalidArgType {
            pos: error::SourcePos::default(),
            message: format!("cannot cast inferred dtype {} to requested {}", typed.output_dtype, requested),
        });
    } else {
        requested
    };

    let parameter_order = dsl::ast::canonical_parameter_order(&prog.params, &typed.reserved_used);

    let (ir_fingerprint, jit_kernel) = match jit::ir::build_ir(prog, typed.clone()) {
        Ok(built_ir) => {
            let fingerprint = built_ir.fingerprint;
            let config = config::RuntimeConfig::from_env();
            (fingerprint, jit::cache::load_or_compile(&built_ir, &config))
        }
        Err(e) => {
            tracing::debug!(error = %e, "DSL kernel cannot be lowered to JIT IR; interpreter-only");
            (0, None)
        }
    };

    Ok(KernelPlan {
        ir_fingerprint,
        parameter_order,
        output_dtype,
        jit_kernel,
        interp_fallback: InterpFallback::Stmt(Box::new(typed)),
    })
}

unsafe fn eval_kernel(
    kernel: &KernelPlan,
    parameter_names: &[String],
    variable_dtypes: &[DType],
    inputs: &[*const u8],
    n: usize,
    output: *mut u8,
) -> Result<(), EvalError> {
    if inputs.len() != parameter_names.len() {
        return Err(EvalError::InvalidArg(format!("expected {} input pointers, got {}", parameter_names.len(), inputs.len())));
    }

    #[cfg(feature = "jit")]
    if let Some(loaded) = &kernel.jit_kernel {
        // The JIT kernel's parameter order may interleave reserved indices
        // among user params; since the flat kernel ABI synthesizes those
        // internally (see `jit::emit`), only user-variable pointers are
        // ever passed through `inputs` here.
        if let Err(e) = loaded.invoke(inputs, output, n as i64) {
            tracing::warn!(error = %e, "loaded JIT kernel failed at call time; falling back to interpreter");
        } else {
            return Ok(());
        }
    }

    match &kernel.interp_fallback {
        InterpFallback::Stmt(typed) => {
            interpreter::dsl_exec::eval_kernel_flat(&typed.body, parameter_names, variable_dtypes, inputs, n, kernel.output_dtype, output)
        }
        InterpFallback::Vector(plan) => {
            let inputs = interpreter::vector::Inputs { ptrs: inputs };
            interpreter::vector::eval_vector(plan, &inputs, n, output)
        }
        InterpFallback::Nd(_) => Err(EvalError::Runtime("an ND interpreter fallback cannot run through the flat eval() path".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_and_evaluates_infix_expression() {
        let vars = vec![Variable::new("a", DType::Float64), Variable::new("b", DType::Float64)];
        let expr = Expr::compile("a + b * 2.0", &vars, DType::Auto).unwrap();
        assert_eq!(expr.output_dtype(), DType::Float64);

        let a = [1.0f64, 2.0, 3.0];
        let b = [10.0f64, 20.0, 30.0];
        let mut out = [0.0f64; 3];
        unsafe {
            expr.eval(&[a.as_ptr() as *const u8, b.as_ptr() as *const u8], 3, out.as_mut_ptr() as *mut u8).unwrap();
        }
        assert_eq!(out, [21.0, 42.0, 63.0]);
    }

    #[test]
    fn dsl_source_is_detected_and_evaluated_through_the_interpreter_fallback() {
        let vars = vec![Variable::new("x", DType::Float64)];
        let expr = Expr::compile("def kernel(x):\n    if x < 0.0:\n        return 0.0\n    return x * x\n", &vars, DType::Auto).unwrap();
        assert!(matches!(expr.plan, EvalPlan::Kernel(_)));

        let x = [-2.0f64, 3.0, 0.0];
        let mut out = [0.0f64; 3];
        unsafe {
            expr.eval(&[x.as_ptr() as *const u8], 3, out.as_mut_ptr() as *mut u8).unwrap();
        }
        assert_eq!(out, [0.0, 9.0, 0.0]);
    }

    #[test]
    fn eval_nd_rejects_a_flat_expr() {
        let vars = vec![Variable::new("a", DType::Float64)];
        let expr = Expr::compile("a", &vars, DType::Auto).unwrap();
        let err = expr.nd_valid_nitems(0, 0).unwrap_err();
        assert!(matches!(err, EvalError::InvalidArg(_)));
    }

    #[test]
    fn compile_nd_rejects_dsl_source() {
        let vars: Vec<Variable> = vec![];
        let err = Expr::compile_nd("def kernel():\n    return 1\n", &vars, DType::Auto, &[2], &[2], &[2]).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported(_)));
    }

    #[test]
    fn compile_nd_end_to_end_matches_scenario_s5() {
        let vars: Vec<Variable> = vec![];
        let expr = Expr::compile_nd("_i0 * _n1 + _i1", &vars, DType::Int64, &[3, 5], &[2, 4], &[2, 3]).unwrap();
        let valid = expr.nd_valid_nitems(1, 0).unwrap();
        assert_eq!(valid, 2);
        let mut out = [-1i64; 6];
        unsafe {
            expr.eval_nd(&[], out.as_mut_ptr() as *mut u8, 6, 1, 0).unwrap();
        }
        assert_eq!(out, [4, 0, 0, 9, 0, 0]);
    }
}
