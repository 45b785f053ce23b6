//! The chunked vector interpreter (§4.4): walks a [`VectorPlan`]'s typed
//! tree once per element, precomputing any embedded reductions as
//! broadcast scalars first.

use std::collections::HashMap;

use tracing::trace;

use crate::ast::{BinaryOp, UnaryOp};
use crate::dtype::DType;
use crate::error::EvalError;
use crate::plan::VectorPlan;
use crate::typed::{ConstValue, FnId, Node, NodeKind, ReduceKind};

use super::{read_promoted, write_narrowed};

/// Target size, in bytes of promoted working-set, for one chunk (§4.4).
pub const DEFAULT_CHUNK_TARGET_BYTES: usize = 64 * 1024;

/// Caller-supplied raw input pointers plus the dtype/item-size metadata
/// needed to read them, in the plan's `input_dtypes` order.
pub struct Inputs<'a> {
    pub ptrs: &'a [*const u8],
}

#[derive(Debug, Clone)]
enum Value {
    Num(f64),
    Str(Vec<u32>),
}

impl Value {
    fn as_f64(&self) -> f64 {
        match self {
            Value::Num(v) => *v,
            Value::Str(_) => 0.0,
        }
    }
}

struct Ctx<'a> {
    inputs: &'a Inputs<'a>,
    input_dtypes: &'a [DType],
    input_item_sizes: &'a [Option<usize>],
}

/// Evaluate `plan` over `n` input elements, writing `n` (or, for a
/// top-level reduction, exactly 1) output elements through `out`.
///
/// # Safety
/// Every pointer in `inputs.ptrs` must point to at least `n` valid
/// elements of its declared dtype (or `n` UCS-4 cells of the declared
/// item size for `String`); `out` must point to at least `n` valid
/// elements of `plan.output_dtype` (or 1, for a top-level reduction).
pub unsafe fn eval_vector(plan: &VectorPlan, inputs: &Inputs, n: usize, out: *mut u8) -> Result<(), EvalError> {
    if inputs.ptrs.len() != plan.input_dtypes.len() {
        return Err(EvalError::InvalidArg(format!(
            "expected {} input pointers, got {}",
            plan.input_dtypes.len(),
            inputs.ptrs.len()
        )));
    }

    let ctx = Ctx { inputs, input_dtypes: &plan.input_dtypes, input_item_sizes: &plan.input_item_sizes };
    let mut reductions = HashMap::new();
    precompute_reductions(&plan.tree, &ctx, n, &mut reductions)?;

    if plan.tree.is_top_level_reduction() {
        let value = eval_node(&plan.tree, &ctx, 0, &reductions)?;
        write_narrowed(out, 0, plan.output_dtype, value.as_f64());
        return Ok(());
    }

    let max_elem_bytes = plan.output_dtype.byte_size().unwrap_or(8).max(
        plan.input_dtypes.iter().filter_map(|d| d.byte_size()).max().unwrap_or(8),
    );
    let elems_per_chunk = (DEFAULT_CHUNK_TARGET_BYTES / max_elem_bytes).max(1);

    let mut start = 0;
    while start < n {
        let end = (start + elems_per_chunk).min(n);
        trace!(chunk_start = start, chunk_end = end, "evaluating vector chunk");
        for idx in start..end {
            let value = eval_node(&plan.tree, &ctx, idx, &reductions)?;
            write_narrowed(out, idx, plan.output_dtype, value.as_f64());
        }
        start = end;
    }
    Ok(())
}

/// Walk the tree, computing every `Reduce` subtree's full-array value once
/// and keying the result by the node's pointer identity, so the main
/// per-element pass can treat it as a broadcast constant (§4.4).
unsafe fn precompute_reductions(
    node: &Node,
    ctx: &Ctx,
    n: usize,
    out: &mut HashMap<usize, f64>,
) -> Result<(), EvalError> {
    match &node.kind {
        NodeKind::Const(_) | NodeKind::Var(_) | NodeKind::Param(_) | NodeKind::Reserved(_) | NodeKind::Local(_) => Ok(()),
        NodeKind::Unary(_, a) | NodeKind::Cast(a) => precompute_reductions(a, ctx, n, out),
        NodeKind::Binary(_, a, b) => {
            precompute_reductions(a, ctx, n, out)?;
            precompute_reductions(b, ctx, n, out)
        }
        NodeKind::Call(_, args) => {
            for a in args {
                precompute_reductions(a, ctx, n, out)?;
            }
            Ok(())
        }
        NodeKind::Reduce(kind, child) => {
            let empty = HashMap::new();
            let value = reduce_full(*kind, child, ctx, n, &empty)?;
            out.insert(node.id(), value);
            Ok(())
        }
    }
}

unsafe fn reduce_full(kind: ReduceKind, child: &Node, ctx: &Ctx, n: usize, reductions: &HashMap<usize, f64>) -> Result<f64, EvalError> {
    if n == 0 {
        return match kind {
            ReduceKind::Min | ReduceKind::Max if child.dtype.is_integer() => Err(EvalError::Runtime(format!(
                "{:?} reduction over an empty integer input has no identity",
                kind
            ))),
            _ => Ok(kind.float_identity()),
        };
    }

    let mut acc = eval_node(child, ctx, 0, reductions)?.as_f64();
    for idx in 1..n {
        let v = eval_node(child, ctx, idx, reductions)?.as_f64();
        acc = match kind {
            ReduceKind::Sum => acc + v,
            ReduceKind::Prod => acc * v,
            ReduceKind::Min => {
                if v.is_nan() || acc.is_nan() {
                    f64::NAN
                } else {
                    acc.min(v)
                }
            }
            ReduceKind::Max => {
                if v.is_nan() || acc.is_nan() {
                    f64::NAN
                } else {
                    acc.max(v)
                }
            }
            ReduceKind::Any => ((acc != 0.0) || (v != 0.0)) as u8 as f64,
            ReduceKind::All => ((acc != 0.0) && (v != 0.0)) as u8 as f64,
        };
    }
    Ok(acc)
}

unsafe fn eval_node(node: &Node, ctx: &Ctx, idx: usize, reductions: &HashMap<usize, f64>) -> Result<Value, EvalError> {
    Ok(match &node.kind {
        NodeKind::Const(c) => match &c.value {
            ConstValue::Bool(b) => Value::Num(*b as u8 as f64),
            ConstValue::Int(v) => Value::Num(*v as f64),
            ConstValue::Float(v) => Value::Num(*v),
            ConstValue::Str(s) => Value::Str(s.chars().map(|c| c as u32).collect()),
        },
        NodeKind::Var(i) => read_var(*i, ctx, idx),
        NodeKind::Param(_) | NodeKind::Reserved(_) | NodeKind::Local(_) => {
            return Err(EvalError::Runtime(
                "DSL-only node kind reached the infix vector interpreter".into(),
            ))
        }
        NodeKind::Unary(op, a) => {
            let v = eval_node(a, ctx, idx, reductions)?.as_f64();
            Value::Num(eval_unary(*op, v, a.dtype))
        }
        NodeKind::Binary(op, a, b) => {
            let l = eval_node(a, ctx, idx, reductions)?.as_f64();
            let r = eval_node(b, ctx, idx, reductions)?.as_f64();
            Value::Num(eval_binary(*op, l, r, node.dtype)?)
        }
        NodeKind::Call(fn_id, args) => eval_call(*fn_id, args, ctx, idx, reductions)?,
        NodeKind::Reduce(_, _) => Value::Num(*reductions.get(&node.id()).ok_or_else(|| {
            EvalError::Runtime("reduction value was not precomputed".into())
        })?),
        NodeKind::Cast(a) => {
            let v = eval_node(a, ctx, idx, reductions)?.as_f64();
            Value::Num(cast_value(v, a.dtype, node.dtype))
        }
    })
}

unsafe fn read_var(i: usize, ctx: &Ctx, idx: usize) -> Value {
    let dtype = ctx.input_dtypes[i];
    let ptr = ctx.inputs.ptrs[i];
    if dtype == DType::String {
        let item_size = ctx.input_item_sizes[i].unwrap_or(0);
        Value::Str(read_ucs4_cell(ptr, item_size, idx))
    } else {
        Value::Num(read_promoted(ptr, idx, dtype))
    }
}

unsafe fn read_ucs4_cell(ptr: *const u8, item_size: usize, idx: usize) -> Vec<u32> {
    let cell_bytes = item_size * 4;
    let base = ptr.add(idx * cell_bytes) as *const u32;
    let mut out = Vec::with_capacity(item_size);
    for k in 0..item_size {
        let cp = *base.add(k);
        if cp == 0 {
            break;
        }
        out.push(cp);
    }
    out
}

pub(crate) fn eval_unary(op: UnaryOp, v: f64, dtype: DType) -> f64 {
    match op {
        UnaryOp::Plus => v,
        UnaryOp::Neg => -v,
        UnaryOp::Not => (v == 0.0) as u8 as f64,
        UnaryOp::BitNot => bitwise_not(v, dtype),
    }
}

fn bitwise_not(v: f64, dtype: DType) -> f64 {
    if dtype.is_signed() {
        -(v) - 1.0
    } else {
        let width = dtype.byte_size().unwrap_or(8) * 8;
        let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
        (mask.wrapping_sub(v as u64)) as f64
    }
}

pub(crate) fn eval_binary(op: BinaryOp, l: f64, r: f64, result_dtype: DType) -> Result<f64, EvalError> {
    Ok(match op {
        BinaryOp::Pow => l.powf(r),
        BinaryOp::Mul => l * r,
        BinaryOp::Div => l / r,
        BinaryOp::Mod => {
            if result_dtype.is_integer() && r == 0.0 {
                return Err(EvalError::Runtime("integer division/modulo by zero".into()));
            }
            l % r
        }
        BinaryOp::Add => l + r,
        BinaryOp::Sub => l - r,
        BinaryOp::Shl => ((l as i64) << (r as i64)) as f64,
        BinaryOp::Shr => ((l as i64) >> (r as i64)) as f64,
        BinaryOp::Lt => (l < r) as u8 as f64,
        BinaryOp::Le => (l <= r) as u8 as f64,
        BinaryOp::Gt => (l > r) as u8 as f64,
        BinaryOp::Ge => (l >= r) as u8 as f64,
        BinaryOp::Eq => (l == r) as u8 as f64,
        BinaryOp::Ne => (l != r) as u8 as f64,
        BinaryOp::BitAnd => (((l as i64) & (r as i64)) as f64),
        BinaryOp::BitXor => (((l as i64) ^ (r as i64)) as f64),
        BinaryOp::BitOr => (((l as i64) | (r as i64)) as f64),
        BinaryOp::And => ((l != 0.0) && (r != 0.0)) as u8 as f64,
        BinaryOp::Or => ((l != 0.0) || (r != 0.0)) as u8 as f64,
    })
}

pub(crate) fn cast_value(v: f64, from: DType, to: DType) -> f64 {
    if to == DType::Bool {
        return (v != 0.0) as u8 as f64;
    }
    if to.is_integer() {
        return v.trunc();
    }
    let _ = from;
    v
}

/// Dispatch a builtin call given already-evaluated numeric arguments, for
/// contexts (the ND reserved-index evaluator) where operands are plain
/// `f64` rather than chunk-local [`Value`]s. String predicates are not
/// meaningful over reserved indices and are rejected.
pub(crate) fn call_builtin_numeric(fn_id: FnId, vals: &[f64]) -> Result<f64, EvalError> {
    Ok(match fn_id {
        FnId::Sin => vals[0].sin(),
        FnId::Cos => vals[0].cos(),
        FnId::Exp => vals[0].exp(),
        FnId::Log => vals[0].ln(),
        FnId::Sqrt => vals[0].sqrt(),
        FnId::Abs => vals[0].abs(),
        FnId::Where => {
            if vals[0] != 0.0 {
                vals[1]
            } else {
                vals[2]
            }
        }
        FnId::StartsWith | FnId::EndsWith | FnId::Contains => {
            return Err(EvalError::Runtime(
                "string predicates are not supported in ND reserved-index kernels".into(),
            ))
        }
    })
}

unsafe fn eval_call(fn_id: FnId, args: &[Node], ctx: &Ctx, idx: usize, reductions: &HashMap<usize, f64>) -> Result<Value, EvalError> {
    Ok(match fn_id {
        FnId::Sin => Value::Num(eval_node(&args[0], ctx, idx, reductions)?.as_f64().sin()),
        FnId::Cos => Value::Num(eval_node(&args[0], ctx, idx, reductions)?.as_f64().cos()),
        FnId::Exp => Value::Num(eval_node(&args[0], ctx, idx, reductions)?.as_f64().exp()),
        FnId::Log => Value::Num(eval_node(&args[0], ctx, idx, reductions)?.as_f64().ln()),
        FnId::Sqrt => Value::Num(eval_node(&args[0], ctx, idx, reductions)?.as_f64().sqrt()),
        FnId::Abs => Value::Num(eval_node(&args[0], ctx, idx, reductions)?.as_f64().abs()),
        FnId::Where => {
            let cond = eval_node(&args[0], ctx, idx, reductions)?.as_f64();
            if cond != 0.0 {
                eval_node(&args[1], ctx, idx, reductions)?
            } else {
                eval_node(&args[2], ctx, idx, reductions)?
            }
        }
        FnId::StartsWith | FnId::EndsWith | FnId::Contains => {
            let subject = match eval_node(&args[0], ctx, idx, reductions)? {
                Value::Str(s) => s,
                Value::Num(_) => return Err(EvalError::Runtime("string predicate subject was not a string".into())),
            };
            let needle = match &args[1].kind {
                NodeKind::Const(c) => match &c.value {
                    ConstValue::Str(s) => s.chars().map(|c| c as u32).collect::<Vec<u32>>(),
                    _ => return Err(EvalError::Runtime("string predicate needle was not a string constant".into())),
                },
                _ => return Err(EvalError::Runtime("string predicate needle must be a constant".into())),
            };
            let matched = match fn_id {
                FnId::StartsWith => subject.starts_with(needle.as_slice()),
                FnId::EndsWith => subject.ends_with(needle.as_slice()),
                FnId::Contains => subject.windows(needle.len().max(1)).any(|w| w == needle.as_slice()) || needle.is_empty(),
                _ => unreachable!(),
            };
            Value::Num(matched as u8 as f64)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::semantic::Analyzer;
    use crate::variable::Variable;

    #[test]
    fn simple_add_matches_scenario_s1() {
        let vars = vec![Variable::new("a", DType::Float64), Variable::new("b", DType::Float64)];
        let plan = Analyzer::compile_vector("a + b", &vars, DType::Float64).unwrap();
        let a: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let b: Vec<f64> = (0..100).map(|i| (2 * i) as f64).collect();
        let mut out = vec![0.0f64; 100];
        unsafe {
            let inputs = Inputs { ptrs: &[a.as_ptr() as *const u8, b.as_ptr() as *const u8] };
            eval_vector(&plan, &inputs, 100, out.as_mut_ptr() as *mut u8).unwrap();
        }
        assert_eq!(out[1], 3.0);
        assert_eq!(out[99], 297.0);
    }

    #[test]
    fn sum_reduction_matches_scenario_s3() {
        let vars = vec![Variable::new("x", DType::Int32)];
        let plan = Analyzer::compile_vector("sum(x)", &vars, DType::Auto).unwrap();
        let x: Vec<i32> = vec![1, 2, 3, 4];
        let mut out = vec![777i64; 2];
        unsafe {
            let inputs = Inputs { ptrs: &[x.as_ptr() as *const u8] };
            eval_vector(&plan, &inputs, 4, out.as_mut_ptr() as *mut u8).unwrap();
        }
        assert_eq!(out[0], 10);
        assert_eq!(out[1], 777, "reduction must not touch output[1..]");
    }

    #[test]
    fn any_on_empty_bool_is_false() {
        let vars = vec![Variable::new("x", DType::Bool)];
        let plan = Analyzer::compile_vector("any(x)", &vars, DType::Auto).unwrap();
        let x: Vec<u8> = vec![];
        let mut out = vec![9u8];
        unsafe {
            let inputs = Inputs { ptrs: &[x.as_ptr()] };
            eval_vector(&plan, &inputs, 0, out.as_mut_ptr()).unwrap();
        }
        assert_eq!(out[0], 0);
    }

    #[test]
    fn chunk_independence_holds_across_split_point() {
        let vars = vec![Variable::new("a", DType::Float64)];
        let plan = Analyzer::compile_vector("a * 2.0", &vars, DType::Float64).unwrap();
        let a: Vec<f64> = (0..5000).map(|i| i as f64 * 0.5).collect();
        let mut whole = vec![0.0f64; 5000];
        unsafe {
            let inputs = Inputs { ptrs: &[a.as_ptr() as *const u8] };
            eval_vector(&plan, &inputs, 5000, whole.as_mut_ptr() as *mut u8).unwrap();
        }
        for &k in &[0usize, 1, 2500, 4999, 5000] {
            let mut first = vec![0.0f64; k];
            let mut second = vec![0.0f64; 5000 - k];
            unsafe {
                let inputs = Inputs { ptrs: &[a.as_ptr() as *const u8] };
                eval_vector(&plan, &inputs, k, first.as_mut_ptr() as *mut u8).unwrap();
                let inputs2 = Inputs { ptrs: &[a.as_ptr().add(k) as *const u8] };
                eval_vector(&plan, &inputs2, 5000 - k, second.as_mut_ptr() as *mut u8).unwrap();
            }
            let mut joined = first;
            joined.extend(second);
            assert_eq!(joined, whole, "split at {k} disagrees with whole-array evaluation");
        }
    }

    #[test]
    fn embedded_reduction_broadcasts_across_every_element() {
        let vars = vec![Variable::new("x", DType::Float64)];
        let plan = Analyzer::compile_vector("x - sum(x)", &vars, DType::Auto).unwrap();
        let x: Vec<f64> = vec![1.0, 2.0, 3.0];
        let mut out = vec![0.0f64; 3];
        unsafe {
            let inputs = Inputs { ptrs: &[x.as_ptr() as *const u8] };
            eval_vector(&plan, &inputs, 3, out.as_mut_ptr() as *mut u8).unwrap();
        }
        assert_eq!(out, vec![1.0 - 6.0, 2.0 - 6.0, 3.0 - 6.0]);
    }
}
