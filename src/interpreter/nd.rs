//! The N-dimensional block evaluator (§4.5): two-level chunk/block
//! partition over a fixed shape, zero-padded at the array's edges.

use std::collections::HashMap;

use crate::dtype::DType;
use crate::error::EvalError;
use crate::plan::NDPlan;
use crate::typed::{ConstValue, Node, NodeKind};

use super::vector::Inputs;
use super::write_narrowed;

/// The multi-dimensional origin of a block and the number of elements of
/// it that fall inside the full (unpadded) array.
struct BlockGeometry {
    origin: Vec<i64>,
    /// Per-axis count of in-bounds positions: clamped by both the array
    /// edge and the enclosing chunk's inner edge (§4.5).
    block_shape_clamped: Vec<i64>,
    valid_nitems: usize,
    padded_nitems: usize,
}

fn block_geometry(plan: &NDPlan, chunk_linear_idx: i64, block_linear_idx: i64) -> Result<BlockGeometry, EvalError> {
    let ndim = plan.ndim();
    let chunks_per_axis = plan.chunks_per_axis();
    let blocks_per_chunk_axis = plan.blocks_per_chunk_axis();

    let total_chunks: i64 = chunks_per_axis.iter().product();
    if chunk_linear_idx < 0 || chunk_linear_idx >= total_chunks {
        return Err(EvalError::InvalidArg(format!("chunk_linear_idx {chunk_linear_idx} out of range [0,{total_chunks})")));
    }
    let total_blocks: i64 = blocks_per_chunk_axis.iter().product();
    if block_linear_idx < 0 || block_linear_idx >= total_blocks {
        return Err(EvalError::InvalidArg(format!("block_linear_idx {block_linear_idx} out of range [0,{total_blocks})")));
    }

    let chunk_coord = unravel(chunk_linear_idx, &chunks_per_axis);
    let block_coord = unravel(block_linear_idx, &blocks_per_chunk_axis);

    let mut origin = vec![0i64; ndim];
    let mut block_shape_clamped = vec![0i64; ndim];
    for d in 0..ndim {
        let chunk_origin = chunk_coord[d] * plan.chunk_shape[d];
        let block_origin_in_chunk = block_coord[d] * plan.block_shape[d];
        origin[d] = chunk_origin + block_origin_in_chunk;
        let remaining_in_array = (plan.shape[d] - origin[d]).max(0);
        let remaining_in_chunk = (plan.chunk_shape[d] - block_origin_in_chunk).max(0);
        block_shape_clamped[d] = plan.block_shape[d].min(remaining_in_array).min(remaining_in_chunk).max(0);
    }

    let valid_nitems: i64 = block_shape_clamped.iter().product();
    let padded_nitems: i64 = plan.block_shape.iter().product();
    Ok(BlockGeometry {
        origin,
        block_shape_clamped,
        valid_nitems: valid_nitems as usize,
        padded_nitems: padded_nitems as usize,
    })
}

fn unravel(mut linear: i64, shape: &[i64]) -> Vec<i64> {
    let mut coord = vec![0i64; shape.len()];
    for d in (0..shape.len()).rev() {
        let dim = shape[d].max(1);
        coord[d] = linear % dim;
        linear /= dim;
    }
    coord
}

/// `valid_nitems(chunk_linear_idx, block_linear_idx)` (§4.5): the count of
/// elements inside the requested block that lie within the full array,
/// without evaluating anything.
pub fn valid_nitems(plan: &NDPlan, chunk_linear_idx: i64, block_linear_idx: i64) -> Result<usize, EvalError> {
    Ok(block_geometry(plan, chunk_linear_idx, block_linear_idx)?.valid_nitems)
}

/// Evaluate one block of an [`NDPlan`] (§4.5). `out` must have room for at
/// least `padded_nitems = ∏ block_shape` elements; positions beyond
/// `valid_nitems` are zero-filled (except for a reduction's output[1..],
/// per §4.5's documented sentinel-preserving rule).
///
/// # Safety
/// `inputs.ptrs` must point at the full backing arrays described by
/// `plan.shape`; `out` must point to at least `padded_nitems` elements of
/// `plan.output_dtype`.
pub unsafe fn eval_nd(
    plan: &NDPlan,
    inputs: &Inputs,
    out: *mut u8,
    padded_nitems: usize,
    chunk_linear_idx: i64,
    block_linear_idx: i64,
) -> Result<(), EvalError> {
    let geom = block_geometry(plan, chunk_linear_idx, block_linear_idx)?;
    if padded_nitems < geom.padded_nitems {
        return Err(EvalError::Shape {
            expected: format!("{} elements", geom.padded_nitems),
            got: format!("{padded_nitems} elements"),
        });
    }

    if plan.tree.is_top_level_reduction() {
        let value = reduce_block(plan, inputs, &geom)?;
        write_narrowed(out, 0, plan.output_dtype, value);
        return Ok(());
    }

    let ndim = plan.ndim();
    let block_shape = &plan.block_shape;
    let mut local = vec![0i64; ndim];
    for flat in 0..geom.padded_nitems {
        let mut rem = flat as i64;
        for d in (0..ndim).rev() {
            local[d] = rem % block_shape[d].max(1);
            rem /= block_shape[d].max(1);
        }
        let inside = (0..ndim).all(|d| local[d] < geom.block_shape_clamped[d]);
        if !inside {
            write_narrowed(out, flat, plan.output_dtype, 0.0);
            continue;
        }
        let value = eval_element(plan, inputs, &geom.origin, &local)?;
        write_narrowed(out, flat, plan.output_dtype, value);
    }
    Ok(())
}

unsafe fn reduce_block(plan: &NDPlan, inputs: &Inputs, geom: &BlockGeometry) -> Result<f64, EvalError> {
    let (kind, child) = match &plan.tree.kind {
        NodeKind::Reduce(k, c) => (*k, c.as_ref()),
        NodeKind::Cast(inner) => match &inner.kind {
            NodeKind::Reduce(k, c) => (*k, c.as_ref()),
            _ => return Err(EvalError::Runtime("internal: top-level reduction tree malformed".into())),
        },
        _ => return Err(EvalError::Runtime("internal: top-level reduction tree malformed".into())),
    };

    if geom.valid_nitems == 0 {
        return Ok(kind.float_identity());
    }

    let ndim = plan.ndim();
    let block_shape = &plan.block_shape;
    let mut local = vec![0i64; ndim];
    let mut acc: Option<f64> = None;
    for flat in 0..geom.padded_nitems {
        let mut rem = flat as i64;
        for d in (0..ndim).rev() {
            local[d] = rem % block_shape[d].max(1);
            rem /= block_shape[d].max(1);
        }
        let inside = (0..ndim).all(|d| local[d] < geom.block_shape_clamped[d]);
        if !inside {
            continue;
        }
        let v = eval_scalar_node(child, plan, inputs, &geom.origin, &local)?;
        acc = Some(match acc {
            None => v,
            Some(a) => match kind {
                crate::typed::ReduceKind::Sum => a + v,
                crate::typed::ReduceKind::Prod => a * v,
                crate::typed::ReduceKind::Min => {
                    if v.is_nan() || a.is_nan() {
                        f64::NAN
                    } else {
                        a.min(v)
                    }
                }
                crate::typed::ReduceKind::Max => {
                    if v.is_nan() || a.is_nan() {
                        f64::NAN
                    } else {
                        a.max(v)
                    }
                }
                crate::typed::ReduceKind::Any => ((a != 0.0) || (v != 0.0)) as u8 as f64,
                crate::typed::ReduceKind::All => ((a != 0.0) && (v != 0.0)) as u8 as f64,
            },
        });
    }
    Ok(acc.unwrap_or_else(|| kind.float_identity()))
}

/// Compute the reserved-index bindings for one element at `local` offset
/// within the block whose origin in the full array is `origin`, then
/// evaluate the whole tree (used for non-reduction plans).
unsafe fn eval_element(plan: &NDPlan, inputs: &Inputs, origin: &[i64], local: &[i64]) -> Result<f64, EvalError> {
    eval_scalar_node(&plan.tree, plan, inputs, origin, local)
}

unsafe fn eval_scalar_node(node: &Node, plan: &NDPlan, inputs: &Inputs, origin: &[i64], local: &[i64]) -> Result<f64, EvalError> {
    let ndim = plan.ndim();
    Ok(match &node.kind {
        NodeKind::Const(c) => match &c.value {
            ConstValue::Bool(b) => *b as u8 as f64,
            ConstValue::Int(v) => *v as f64,
            ConstValue::Float(v) => *v,
            ConstValue::Str(_) => return Err(EvalError::Runtime("string constants are not evaluable in ND kernels".into())),
        },
        NodeKind::Var(i) => {
            let mut global_linear = 0i64;
            for d in 0..ndim {
                global_linear = global_linear * plan.shape[d] + (origin[d] + local[d]);
            }
            let dtype = plan.input_dtypes[*i];
            super::read_promoted(inputs.ptrs[*i], global_linear.max(0) as usize, dtype)
        }
        NodeKind::Reserved(name) => reserved_value(name, plan, origin, local),
        NodeKind::Param(_) | NodeKind::Local(_) => {
            return Err(EvalError::Runtime("locals/params must be lowered before ND evaluation".into()))
        }
        NodeKind::Unary(op, a) => {
            let v = eval_scalar_node(a, plan, inputs, origin, local)?;
            super::vector::eval_unary(*op, v, a.dtype)
        }
        NodeKind::Binary(op, a, b) => {
            let l = eval_scalar_node(a, plan, inputs, origin, local)?;
            let r = eval_scalar_node(b, plan, inputs, origin, local)?;
            super::vector::eval_binary(*op, l, r, node.dtype)?
        }
        NodeKind::Call(fn_id, args) => {
            let mut vals = Vec::with_capacity(args.len());
            for a in args {
                vals.push(eval_scalar_node(a, plan, inputs, origin, local)?);
            }
            super::vector::call_builtin_numeric(*fn_id, &vals)?
        }
        NodeKind::Reduce(..) => return Err(EvalError::Runtime("nested reduction reached ND scalar evaluator".into())),
        NodeKind::Cast(a) => {
            let v = eval_scalar_node(a, plan, inputs, origin, local)?;
            super::vector::cast_value(v, a.dtype, node.dtype)
        }
    })
}

fn reserved_value(name: &str, plan: &NDPlan, origin: &[i64], local: &[i64]) -> f64 {
    use crate::dsl::ast::{RESERVED_GLOBAL_LINEAR_IDX, RESERVED_NDIM};
    if name == RESERVED_NDIM {
        return plan.ndim() as f64;
    }
    if name == RESERVED_GLOBAL_LINEAR_IDX {
        let mut idx = 0i64;
        for d in 0..plan.ndim() {
            idx = idx * plan.shape[d] + (origin[d] + local[d]);
        }
        return idx as f64;
    }
    if let Some(k) = name.strip_prefix("_i").and_then(|s| s.parse::<usize>().ok()) {
        return (origin[k] + local[k]) as f64;
    }
    if let Some(k) = name.strip_prefix("_n").and_then(|s| s.parse::<usize>().ok()) {
        return plan.shape[k] as f64;
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::NDPlan;
    use crate::typed::{Node, NodeKind, ReduceKind};

    fn mul_add_i0_n1_i1() -> Node {
        // _i0 * _n1 + _i1
        let i0 = Node::new(DType::Int64, NodeKind::Reserved("_i0".into()));
        let n1 = Node::new(DType::Int64, NodeKind::Reserved("_n1".into()));
        let i1 = Node::new(DType::Int64, NodeKind::Reserved("_i1".into()));
        let mul = Node::new(DType::Int64, NodeKind::Binary(crate::ast::BinaryOp::Mul, Box::new(i0), Box::new(n1)));
        Node::new(DType::Int64, NodeKind::Binary(crate::ast::BinaryOp::Add, Box::new(mul), Box::new(i1)))
    }

    #[test]
    fn nd_block_padding_matches_scenario_s5() {
        let plan = NDPlan {
            tree: mul_add_i0_n1_i1(),
            output_dtype: DType::Int64,
            input_dtypes: vec![],
            input_item_sizes: vec![],
            shape: vec![3, 5],
            chunk_shape: vec![2, 4],
            block_shape: vec![2, 3],
            has_reduction: false,
        };
        let inputs = Inputs { ptrs: &[] };
        let mut out = vec![-1i64; 6];
        let valid = unsafe { valid_nitems(&plan, 1, 0).unwrap() };
        assert_eq!(valid, 2);
        unsafe {
            eval_nd(&plan, &inputs, out.as_mut_ptr() as *mut u8, 6, 1, 0).unwrap();
        }
        assert_eq!(out, vec![4, 0, 0, 9, 0, 0]);
    }

    #[test]
    fn nd_block_padding_respects_chunk_inner_boundary() {
        // chunk_shape=[2,4] is not a multiple of block_shape=[2,3]: the
        // second block of chunk 0 along axis 1 only has 1 column (3) that
        // belongs to this chunk, even though the array itself extends two
        // more columns (3,4) past the block's origin. Column 4 belongs to
        // chunk 1 and must never be read into this block's output.
        let plan = NDPlan {
            tree: mul_add_i0_n1_i1(),
            output_dtype: DType::Int64,
            input_dtypes: vec![],
            input_item_sizes: vec![],
            shape: vec![3, 5],
            chunk_shape: vec![2, 4],
            block_shape: vec![2, 3],
            has_reduction: false,
        };
        let inputs = Inputs { ptrs: &[] };
        let valid = unsafe { valid_nitems(&plan, 0, 1).unwrap() };
        assert_eq!(valid, 2);
        let mut out = vec![-1i64; 6];
        unsafe {
            eval_nd(&plan, &inputs, out.as_mut_ptr() as *mut u8, 6, 0, 1).unwrap();
        }
        assert_eq!(out, vec![3, 0, 0, 8, 0, 0]);
    }

    #[test]
    fn reduction_only_writes_output_zero() {
        let inner = Node::new(DType::Int64, NodeKind::Reserved("_i0".into()));
        let tree = Node::new(DType::Int64, NodeKind::Reduce(ReduceKind::Sum, Box::new(inner)));
        let plan = NDPlan {
            tree,
            output_dtype: DType::Int64,
            input_dtypes: vec![],
            input_item_sizes: vec![],
            shape: vec![4],
            chunk_shape: vec![4],
            block_shape: vec![4],
            has_reduction: true,
        };
        let inputs = Inputs { ptrs: &[] };
        let mut out = vec![42i64; 4];
        unsafe {
            eval_nd(&plan, &inputs, out.as_mut_ptr() as *mut u8, 4, 0, 0).unwrap();
        }
        assert_eq!(out[0], 0 + 1 + 2 + 3);
        assert_eq!(&out[1..], &[42, 42, 42], "positions beyond output[0] must be left untouched");
    }
}
