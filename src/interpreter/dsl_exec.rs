//! Interpreter fallback for a lowered DSL kernel (§4.6): walks the typed
//! statement sequence once per element, maintaining a local-variable scope.

use std::collections::HashMap;

use crate::dsl::typecheck::TStmt;
use crate::dtype::DType;
use crate::error::EvalError;
use crate::typed::{ConstValue, Node, NodeKind};

use super::read_promoted;
use super::vector::{call_builtin_numeric, cast_value, eval_binary, eval_unary};

/// Signals non-local control flow while walking a statement list.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(f64),
}

/// Per-element execution context: user parameter pointers (by canonical
/// name), reserved-index bindings for this element, and the growing local
/// scope.
pub struct ElementCtx<'a> {
    pub params: &'a HashMap<String, (*const u8, DType)>,
    pub reserved: &'a HashMap<String, i64>,
    locals: HashMap<String, f64>,
}

impl<'a> ElementCtx<'a> {
    pub fn new(params: &'a HashMap<String, (*const u8, DType)>, reserved: &'a HashMap<String, i64>) -> Self {
        ElementCtx { params, reserved, locals: HashMap::new() }
    }
}

/// Execute a lowered kernel body for a single element, returning the
/// value of the `return` statement reached. A typechecked body (§4.6) is
/// statically guaranteed to always reach a `return` on every path, so
/// falling off the end here indicates a loop guard that never fires
/// despite the static check — surfaced as a runtime error rather than a
/// panic.
///
/// # Safety
/// Every pointer in `ctx.params` must point to at least one valid element
/// of its declared dtype at the element index implied by `ctx.reserved`.
pub unsafe fn exec_kernel(body: &[TStmt], ctx: &mut ElementCtx) -> Result<f64, EvalError> {
    match exec_stmts(body, ctx)? {
        Flow::Return(v) => Ok(v),
        _ => Err(EvalError::Runtime("kernel execution fell off the end without returning".into())),
    }
}

unsafe fn exec_stmts(stmts: &[TStmt], ctx: &mut ElementCtx) -> Result<Flow, EvalError> {
    for s in stmts {
        match exec_stmt(s, ctx)? {
            Flow::Normal => continue,
            other => return Ok(other),
        }
    }
    Ok(Flow::Normal)
}

unsafe fn exec_stmt(stmt: &TStmt, ctx: &mut ElementCtx) -> Result<Flow, EvalError> {
    Ok(match stmt {
        TStmt::Assign { name, value } => {
            let v = eval(value, ctx)?;
            ctx.locals.insert(name.clone(), v);
            Flow::Normal
        }
        TStmt::If { cond, then_body, elifs, else_body } => {
            if eval(cond, ctx)? != 0.0 {
                exec_stmts(then_body, ctx)?
            } else {
                let mut taken = None;
                for (c, body) in elifs {
                    if eval(c, ctx)? != 0.0 {
                        taken = Some(exec_stmts(body, ctx)?);
                        break;
                    }
                }
                match taken {
                    Some(flow) => flow,
                    None => match else_body {
                        Some(body) => exec_stmts(body, ctx)?,
                        None => Flow::Normal,
                    },
                }
            }
        }
        TStmt::For { var, start, stop, step, body } => {
            let start_v = eval(start, ctx)?;
            let stop_v = eval(stop, ctx)?;
            let step_v = eval(step, ctx)?;
            if step_v == 0.0 {
                return Err(EvalError::Runtime("for loop step must not be zero".into()));
            }
            let mut i = start_v;
            let mut result = Flow::Normal;
            while (step_v > 0.0 && i < stop_v) || (step_v < 0.0 && i > stop_v) {
                ctx.locals.insert(var.clone(), i);
                match exec_stmts(body, ctx)? {
                    Flow::Normal => {}
                    Flow::Continue => {}
                    Flow::Break => break,
                    r @ Flow::Return(_) => {
                        result = r;
                        break;
                    }
                }
                i += step_v;
            }
            result
        }
        TStmt::Break { cond } => {
            let taken = match cond {
                Some(c) => eval(c, ctx)? != 0.0,
                None => true,
            };
            if taken {
                Flow::Break
            } else {
                Flow::Normal
            }
        }
        TStmt::Continue { cond } => {
            let taken = match cond {
                Some(c) => eval(c, ctx)? != 0.0,
                None => true,
            };
            if taken {
                Flow::Continue
            } else {
                Flow::Normal
            }
        }
        TStmt::Return(e) => Flow::Return(eval(e, ctx)?),
    })
}

unsafe fn eval(node: &Node, ctx: &ElementCtx) -> Result<f64, EvalError> {
    Ok(match &node.kind {
        NodeKind::Const(c) => match &c.value {
            ConstValue::Bool(b) => *b as u8 as f64,
            ConstValue::Int(v) => *v as f64,
            ConstValue::Float(v) => *v,
            ConstValue::Str(_) => return Err(EvalError::Runtime("string constants are not scalar-evaluable".into())),
        },
        NodeKind::Var(_) => return Err(EvalError::Runtime("positional Var nodes do not occur in DSL trees".into())),
        NodeKind::Param(name) => {
            let (ptr, dtype) = ctx.params.get(name).ok_or_else(|| EvalError::InvalidArg(format!("missing parameter '{name}'")))?;
            read_promoted(*ptr, 0, *dtype)
        }
        NodeKind::Reserved(name) => *ctx.reserved.get(name).unwrap_or(&0) as f64,
        NodeKind::Local(name) => *ctx.locals.get(name).ok_or_else(|| EvalError::Runtime(format!("local '{name}' read before assignment")))?,
        NodeKind::Unary(op, a) => eval_unary(*op, eval(a, ctx)?, a.dtype),
        NodeKind::Binary(op, a, b) => eval_binary(*op, eval(a, ctx)?, eval(b, ctx)?, node.dtype)?,
        NodeKind::Call(fn_id, args) => {
            let mut vals = Vec::with_capacity(args.len());
            for a in args {
                vals.push(eval(a, ctx)?);
            }
            call_builtin_numeric(*fn_id, &vals)?
        }
        NodeKind::Reduce(..) => return Err(EvalError::Runtime("reductions are not valid inside a per-element kernel body".into())),
        NodeKind::Cast(a) => cast_value(eval(a, ctx)?, a.dtype, node.dtype),
    })
}

/// Run a typechecked kernel's interpreter fallback over `n` flat elements
/// (§4.4's chunking model applied to §4.6's per-element DSL semantics). The
/// reserved indices available here are the flat set only (`_i0`, `_n0`,
/// `_ndim`, `_global_linear_idx`); ND reserved indices are bound instead by
/// [`super::nd`]'s block geometry.
///
/// # Safety
/// `inputs[k]` must point to at least `n` valid elements of
/// `param_dtypes[k]`'s native representation; `out` must point to at least
/// `n` valid elements of `output_dtype`'s native representation.
pub unsafe fn eval_kernel_flat(
    body: &[TStmt],
    param_names: &[String],
    param_dtypes: &[DType],
    inputs: &[*const u8],
    n: usize,
    output_dtype: DType,
    out: *mut u8,
) -> Result<(), EvalError> {
    for idx in 0..n {
        let mut params = HashMap::with_capacity(param_names.len());
        for ((name, &dtype), &ptr) in param_names.iter().zip(param_dtypes).zip(inputs) {
            let byte_size = dtype.byte_size().unwrap_or(8);
            params.insert(name.clone(), (ptr.add(idx * byte_size), dtype));
        }
        let mut reserved = HashMap::with_capacity(4);
        reserved.insert("_i0".to_string(), idx as i64);
        reserved.insert("_n0".to_string(), n as i64);
        reserved.insert("_ndim".to_string(), 1);
        reserved.insert("_global_linear_idx".to_string(), idx as i64);

        let mut ctx = ElementCtx::new(&params, &reserved);
        let value = exec_kernel(body, &mut ctx)?;
        crate::interpreter::write_narrowed(out, idx, output_dtype, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinaryOp;
    use crate::typed::{Const, Node, NodeKind};

    fn local(name: &str, dtype: DType) -> Node {
        Node::new(dtype, NodeKind::Local(name.to_string()))
    }

    fn int_const(v: i64) -> Node {
        Node::new(DType::Int64, NodeKind::Const(Const { value: ConstValue::Int(v), dtype: DType::Int64 }))
    }

    #[test]
    fn for_loop_accumulates_and_returns() {
        // acc = 0; for i in range(5): acc = acc + i; return acc
        let body = vec![
            TStmt::Assign { name: "acc".into(), value: int_const(0) },
            TStmt::For {
                var: "i".into(),
                start: int_const(0),
                stop: int_const(5),
                step: int_const(1),
                body: vec![TStmt::Assign {
                    name: "acc".into(),
                    value: Node::new(
                        DType::Int64,
                        NodeKind::Binary(BinaryOp::Add, Box::new(local("acc", DType::Int64)), Box::new(local("i", DType::Int64))),
                    ),
                }],
            },
            TStmt::Return(local("acc", DType::Int64)),
        ];
        let params = HashMap::new();
        let reserved = HashMap::new();
        let mut ctx = ElementCtx::new(&params, &reserved);
        let result = unsafe { exec_kernel(&body, &mut ctx).unwrap() };
        assert_eq!(result, 10.0);
    }

    #[test]
    fn break_exits_loop_early() {
        let body = vec![
            TStmt::Assign { name: "acc".into(), value: int_const(0) },
            TStmt::For {
                var: "i".into(),
                start: int_const(0),
                stop: int_const(100),
                step: int_const(1),
                body: vec![
                    TStmt::Break {
                        cond: Some(Node::new(
                            DType::Bool,
                            NodeKind::Binary(BinaryOp::Ge, Box::new(local("i", DType::Int64)), Box::new(int_const(3))),
                        )),
                    },
                    TStmt::Assign {
                        name: "acc".into(),
                        value: Node::new(
                            DType::Int64,
                            NodeKind::Binary(BinaryOp::Add, Box::new(local("acc", DType::Int64)), Box::new(int_const(1))),
                        ),
                    },
                ],
            },
            TStmt::Return(local("acc", DType::Int64)),
        ];
        let params = HashMap::new();
        let reserved = HashMap::new();
        let mut ctx = ElementCtx::new(&params, &reserved);
        let result = unsafe { exec_kernel(&body, &mut ctx).unwrap() };
        assert_eq!(result, 3.0);
    }
}
