//! Semantic analysis / plan builder (§4.3): resolves names, infers dtypes
//! bottom-up over the untyped [`crate::ast::Expr`], validates reductions,
//! decides the output dtype, and emits a [`crate::plan::VectorPlan`].

use crate::ast::{self, BinaryOp, ExprKind, Literal, UnaryOp};
use crate::dsl::ast::is_reserved_index;
use crate::dtype::DType;
use crate::error::CompileError;
use crate::plan::{NDPlan, VectorPlan};
use crate::typed::{Const, ConstValue, FnId, Node, NodeKind, ReduceKind};
use crate::variable::Variable;

/// Builtin function argument-kind classification (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    RealOnly,
    Numeric,
    AnyNumeric,
}

pub struct Analyzer<'a> {
    vars: &'a [Variable],
    /// True when every variable referenced in scope is Float32 or
    /// narrower; used for suffix-less fractional literal typing (§4.1).
    all_vars_leq_f32: bool,
    /// Whether bare identifiers matching `_iK`/`_nK`/`_ndim`/
    /// `_global_linear_idx` resolve to [`NodeKind::Reserved`] when not
    /// otherwise bound to a variable. Set for [`Analyzer::compile_nd`]; the
    /// flat infix language in [`Analyzer::compile_vector`] has no such
    /// indices to offer.
    allow_reserved: bool,
}

impl<'a> Analyzer<'a> {
    pub fn new(vars: &'a [Variable]) -> Self {
        let all_vars_leq_f32 = vars.iter().all(|v| matches!(v.dtype, DType::Float32) || v.dtype.is_integer() || v.dtype == DType::Bool);
        Analyzer { vars, all_vars_leq_f32, allow_reserved: false }
    }

    fn find_var(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v.name == name)
    }

    /// Resolve a full untyped expression into a typed [`Node`].
    pub fn resolve(&self, e: &ast::Expr) -> Result<Node, CompileError> {
        match &e.kind {
            ExprKind::Literal(lit) => self.resolve_literal(lit),
            ExprKind::Ident(name) => {
                if let Some(idx) = self.find_var(name) {
                    return Ok(Node::new(self.vars[idx].dtype, NodeKind::Var(idx)));
                }
                if self.allow_reserved && is_reserved_index(name) {
                    return Ok(Node::new(DType::Int64, NodeKind::Reserved(name.clone())));
                }
                Err(CompileError::UnknownName(name.clone()))
            }
            ExprKind::Unary(op, inner) => self.resolve_unary(*op, inner, e),
            ExprKind::Binary(op, lhs, rhs) => self.resolve_binary(*op, lhs, rhs, e),
            ExprKind::Call(name, args) => self.resolve_call(name, args, e),
        }
    }

    fn resolve_literal(&self, lit: &Literal) -> Result<Node, CompileError> {
        match lit {
            Literal::Int(v) => {
                let dtype = if i32::try_from(*v).is_ok() { DType::Int32 } else { DType::Int64 };
                Ok(Node::new(dtype, NodeKind::Const(Const { value: ConstValue::Int(*v), dtype })))
            }
            Literal::Float(v) => {
                let dtype = if self.all_vars_leq_f32 { DType::Float32 } else { DType::Float64 };
                Ok(Node::new(dtype, NodeKind::Const(Const { value: ConstValue::Float(*v), dtype })))
            }
            Literal::Str(_) => Err(CompileError::Unsupported(
                "string literals are only valid as direct arguments to string predicates".into(),
            )),
        }
    }

    fn resolve_unary(&self, op: UnaryOp, inner: &ast::Expr, at: &ast::Expr) -> Result<Node, CompileError> {
        let node = self.resolve(inner)?;
        resolve_unary_public(op, node, at)
    }

    fn resolve_binary(&self, op: BinaryOp, lhs: &ast::Expr, rhs: &ast::Expr, at: &ast::Expr) -> Result<Node, CompileError> {
        let l = self.resolve(lhs)?;
        let r = self.resolve(rhs)?;
        resolve_binary_public(op, l, r, at)
    }

    fn resolve_call(&self, name: &str, args: &[ast::Expr], at: &ast::Expr) -> Result<Node, CompileError> {
        let mut resolved = Vec::with_capacity(args.len());
        for a in args {
            resolved.push(self.resolve(a)?);
        }
        resolve_call_public(name, args, resolved, at)
    }

    /// Build a full [`VectorPlan`] from source text: parse, resolve, and
    /// insert a final cast to `requested` (or use the inferred dtype when
    /// `requested == DType::Auto`).
    pub fn compile_vector(src: &str, vars: &[Variable], requested: DType) -> Result<VectorPlan, CompileError> {
        for v in vars {
            v.validate()?;
        }
        let ast = crate::parser::parse(src)?;
        let analyzer = Analyzer::new(vars);
        let mut tree = analyzer.resolve(&ast)?;

        let output_dtype = if requested == DType::Auto {
            tree.dtype
        } else {
            if tree.dtype != requested {
                if !tree.dtype.castable_to(requested) {
                    return Err(CompileError::InvalidArgType {
                        pos: ast.pos,
                        message: format!("cannot cast inferred dtype {} to requested {}", tree.dtype, requested),
                    });
                }
                tree = Node::new(requested, NodeKind::Cast(Box::new(tree)));
            }
            requested
        };

        let has_reduction = tree.contains_reduction();
        let input_dtypes = vars.iter().map(|v| v.dtype).collect();
        let input_item_sizes = vars.iter().map(|v| v.item_size).collect();
        Ok(VectorPlan {
            tree,
            output_dtype,
            input_dtypes,
            input_item_sizes,
            has_reduction,
            chunk_size: crate::interpreter::vector::DEFAULT_CHUNK_TARGET_BYTES,
        })
    }

    /// Build an [`NDPlan`] from infix source text over reserved indices
    /// (§4.5): `shape`/`chunk_shape`/`block_shape` must each have `ndim`
    /// entries.
    pub fn compile_nd(
        src: &str,
        vars: &[Variable],
        requested: DType,
        shape: &[i64],
        chunk_shape: &[i64],
        block_shape: &[i64],
    ) -> Result<NDPlan, CompileError> {
        for v in vars {
            v.validate()?;
        }
        let ndim = shape.len();
        if chunk_shape.len() != ndim || block_shape.len() != ndim {
            return Err(CompileError::Unsupported(format!(
                "shape/chunk_shape/block_shape must agree on rank: got {}/{}/{}",
                ndim,
                chunk_shape.len(),
                block_shape.len()
            )));
        }
        if shape.iter().any(|&d| d <= 0) || chunk_shape.iter().any(|&d| d <= 0) || block_shape.iter().any(|&d| d <= 0) {
            return Err(CompileError::Unsupported("shape/chunk_shape/block_shape entries must be positive".into()));
        }

        let ast = crate::parser::parse(src)?;
        let mut analyzer = Analyzer::new(vars);
        analyzer.allow_reserved = true;
        let mut tree = analyzer.resolve(&ast)?;

        for name in collect_reserved_names(&tree) {
            if let Some(k) = name.strip_prefix("_i").and_then(|s| s.parse::<usize>().ok()) {
                if k >= ndim {
                    return Err(CompileError::Unsupported(format!("'{name}' refers to axis {k}, but ndim is {ndim}")));
                }
            }
            if let Some(k) = name.strip_prefix("_n").and_then(|s| s.parse::<usize>().ok()) {
                if k >= ndim {
                    return Err(CompileError::Unsupported(format!("'{name}' refers to axis {k}, but ndim is {ndim}")));
                }
            }
        }

        let output_dtype = if requested == DType::Auto {
            tree.dtype
        } else {
            if tree.dtype != requested {
                if !tree.dtype.castable_to(requested) {
                    return Err(CompileError::InvalidArgType {
                        pos: ast.pos,
                        message: format!("cannot cast inferred dtype {} to requested {}", tree.dtype, requested),
                    });
                }
                tree = Node::new(requested, NodeKind::Cast(Box::new(tree)));
            }
            requested
        };

        let has_reduction = tree.contains_reduction();
        let input_dtypes = vars.iter().map(|v| v.dtype).collect();
        let input_item_sizes = vars.iter().map(|v| v.item_size).collect();
        Ok(NDPlan {
            tree,
            output_dtype,
            input_dtypes,
            input_item_sizes,
            shape: shape.to_vec(),
            chunk_shape: chunk_shape.to_vec(),
            block_shape: block_shape.to_vec(),
            has_reduction,
        })
    }
}

fn collect_reserved_names(node: &Node) -> Vec<String> {
    let mut out = Vec::new();
    fn walk(node: &Node, out: &mut Vec<String>) {
        match &node.kind {
            NodeKind::Reserved(name) => out.push(name.clone()),
            NodeKind::Unary(_, a) | NodeKind::Cast(a) => walk(a, out),
            NodeKind::Binary(_, a, b) => {
                walk(a, out);
                walk(b, out);
            }
            NodeKind::Call(_, args) => args.iter().for_each(|a| walk(a, out)),
            NodeKind::Reduce(_, child) => walk(child, out),
            _ => {}
        }
    }
    walk(node, &mut out);
    out
}

fn type_err(at: &ast::Expr, message: impl Into<String>) -> CompileError {
    CompileError::InvalidArgType { pos: at.pos, message: message.into() }
}

/// Combine an already-resolved operand with a unary operator. Shared by
/// the infix [`Analyzer`] and the DSL typechecker
/// ([`crate::dsl::typecheck`]), which resolve their operands through
/// different name-lookup rules but the same operator semantics.
pub fn resolve_unary_public(op: UnaryOp, node: Node, at: &ast::Expr) -> Result<Node, CompileError> {
    match op {
        UnaryOp::Plus | UnaryOp::Neg => {
            if !node.dtype.is_numeric() {
                return Err(type_err(at, format!("unary +/- requires a numeric operand, got {}", node.dtype)));
            }
            Ok(Node::new(node.dtype, NodeKind::Unary(op, Box::new(node))))
        }
        UnaryOp::BitNot => {
            if !(node.dtype.is_integer() || node.dtype == DType::Bool) {
                return Err(type_err(at, format!("'~' requires an integer/bool operand, got {}", node.dtype)));
            }
            Ok(Node::new(node.dtype, NodeKind::Unary(op, Box::new(node))))
        }
        UnaryOp::Not => {
            let coerced = coerce_to_bool(node, at)?;
            Ok(Node::new(DType::Bool, NodeKind::Unary(op, Box::new(coerced))))
        }
    }
}

/// Combine two already-resolved operands with a binary operator.
pub fn resolve_binary_public(op: BinaryOp, l: Node, r: Node, at: &ast::Expr) -> Result<Node, CompileError> {
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let l = coerce_to_bool(l, at)?;
        let r = coerce_to_bool(r, at)?;
        return Ok(Node::new(DType::Bool, NodeKind::Binary(op, Box::new(l), Box::new(r))));
    }

    let is_comparison = matches!(op, BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne);
    let is_bitwise = matches!(op, BinaryOp::Shl | BinaryOp::Shr | BinaryOp::BitAnd | BinaryOp::BitXor | BinaryOp::BitOr);

    if l.dtype == DType::String || r.dtype == DType::String {
        if l.dtype == DType::String && r.dtype == DType::String && is_comparison {
            return Ok(Node::new(DType::Bool, NodeKind::Binary(op, Box::new(l), Box::new(r))));
        }
        return Err(type_err(at, "strings only support string-with-string comparisons"));
    }

    let promoted = l
        .dtype
        .promote(r.dtype)
        .ok_or_else(|| type_err(at, format!("cannot promote {} and {}", l.dtype, r.dtype)))?;

    if is_bitwise && !(promoted.is_integer() || promoted == DType::Bool) {
        return Err(type_err(at, format!("bitwise operator requires integer operands, got {promoted}")));
    }

    let l = cast_if_needed(l, promoted);
    let r = cast_if_needed(r, promoted);

    let result_dtype = if is_comparison { DType::Bool } else { promoted };
    Ok(Node::new(result_dtype, NodeKind::Binary(op, Box::new(l), Box::new(r))))
}

/// Combine a call's already-resolved arguments (`resolved`) with its
/// builtin semantics; `args` (the untyped AST) is retained only to
/// recover string-literal needles for the string predicates.
pub fn resolve_call_public(name: &str, args: &[ast::Expr], resolved: Vec<Node>, at: &ast::Expr) -> Result<Node, CompileError> {
    if let Some(kind) = reduce_kind_of(name) {
        if resolved.len() != 1 {
            return Err(type_err(at, format!("{name}() takes exactly one argument")));
        }
        let child = resolved.into_iter().next().unwrap();
        if child.contains_reduction() {
            return Err(CompileError::Unsupported(format!("{name}() may not contain a nested reduction")));
        }
        let out_dtype = kind
            .output_dtype(child.dtype)
            .ok_or_else(|| type_err(at, format!("{name}() is not defined for dtype {}", child.dtype)))?;
        return Ok(Node::new(out_dtype, NodeKind::Reduce(kind, Box::new(child))));
    }

    match name {
        "startswith" | "endswith" | "contains" => {
            if resolved.len() != 2 {
                return Err(type_err(at, format!("{name}() takes exactly two arguments")));
            }
            let mut it = resolved.into_iter();
            let subject = it.next().unwrap();
            if subject.dtype != DType::String {
                return Err(type_err(at, format!("{name}() requires a string subject")));
            }
            let needle = match &args[1].kind {
                ExprKind::Literal(Literal::Str(s)) => s.clone(),
                _ => return Err(type_err(at, format!("{name}() requires a string-literal second argument"))),
            };
            let fn_id = FnId::from_name(name).unwrap();
            let needle_node =
                Node::new(DType::String, NodeKind::Const(Const { value: ConstValue::Str(needle), dtype: DType::String }));
            Ok(Node::new(DType::Bool, NodeKind::Call(fn_id, vec![subject, needle_node])))
        }
        "where" => {
            if resolved.len() != 3 {
                return Err(type_err(at, "where() takes exactly three arguments"));
            }
            let mut it = resolved.into_iter();
            let cond = coerce_to_bool(it.next().unwrap(), at)?;
            let a = it.next().unwrap();
            let b = it.next().unwrap();
            let promoted = a
                .dtype
                .promote(b.dtype)
                .ok_or_else(|| type_err(at, format!("where() branches don't promote: {} vs {}", a.dtype, b.dtype)))?;
            let a = cast_if_needed(a, promoted);
            let b = cast_if_needed(b, promoted);
            Ok(Node::new(promoted, NodeKind::Call(FnId::Where, vec![cond, a, b])))
        }
        _ => {
            let fn_id = FnId::from_name(name).ok_or_else(|| CompileError::UnknownName(name.to_string()))?;
            if resolved.len() != 1 {
                return Err(type_err(at, format!("{name}() takes exactly one argument")));
            }
            let arg = resolved.into_iter().next().unwrap();
            let kind = builtin_arg_kind(fn_id);
            match kind {
                ArgKind::RealOnly => {
                    let out = arg
                        .dtype
                        .transcendental_float()
                        .ok_or_else(|| type_err(at, format!("{name}() requires a real numeric argument")))?;
                    let arg = cast_if_needed(arg, out);
                    Ok(Node::new(out, NodeKind::Call(fn_id, vec![arg])))
                }
                ArgKind::Numeric | ArgKind::AnyNumeric => {
                    if !arg.dtype.is_numeric() {
                        return Err(type_err(at, format!("{name}() requires a numeric argument")));
                    }
                    let out = if arg.dtype.is_complex() {
                        if fn_id == FnId::Abs {
                            if arg.dtype == DType::Complex64 { DType::Float32 } else { DType::Float64 }
                        } else {
                            return Err(type_err(at, format!("{name}() is not defined for complex")));
                        }
                    } else {
                        arg.dtype
                    };
                    Ok(Node::new(out, NodeKind::Call(fn_id, vec![arg])))
                }
            }
        }
    }
}

fn coerce_to_bool(node: Node, at: &ast::Expr) -> Result<Node, CompileError> {
    if node.dtype == DType::String {
        return Err(type_err(at, "strings cannot be coerced to bool"));
    }
    if node.dtype == DType::Bool {
        Ok(node)
    } else {
        Ok(Node::new(DType::Bool, NodeKind::Cast(Box::new(node))))
    }
}

fn cast_if_needed(node: Node, target: DType) -> Node {
    if node.dtype == target {
        node
    } else {
        Node::new(target, NodeKind::Cast(Box::new(node)))
    }
}

fn reduce_kind_of(name: &str) -> Option<ReduceKind> {
    Some(match name {
        "sum" => ReduceKind::Sum,
        "prod" => ReduceKind::Prod,
        "min" => ReduceKind::Min,
        "max" => ReduceKind::Max,
        "any" => ReduceKind::Any,
        "all" => ReduceKind::All,
        _ => return None,
    })
}

fn builtin_arg_kind(id: FnId) -> ArgKind {
    match id {
        FnId::Sin | FnId::Cos | FnId::Exp | FnId::Log | FnId::Sqrt => ArgKind::RealOnly,
        FnId::Abs => ArgKind::AnyNumeric,
        FnId::Where | FnId::StartsWith | FnId::EndsWith | FnId::Contains => ArgKind::Numeric,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_add_promotes_to_float64() {
        let vars = vec![Variable::new("a", DType::Float64), Variable::new("b", DType::Float64)];
        let plan = Analyzer::compile_vector("a + b", &vars, DType::Auto).unwrap();
        assert_eq!(plan.output_dtype, DType::Float64);
        assert!(!plan.has_reduction);
    }

    #[test]
    fn mixed_promotion_then_cast_to_f32() {
        let vars = vec![Variable::new("a", DType::Int32), Variable::new("b", DType::Float64)];
        let plan = Analyzer::compile_vector("a + b", &vars, DType::Float32).unwrap();
        assert_eq!(plan.output_dtype, DType::Float32);
        assert!(matches!(plan.tree.kind, NodeKind::Cast(_)));
    }

    #[test]
    fn sum_reduces_int32_to_int64() {
        let vars = vec![Variable::new("x", DType::Int32)];
        let plan = Analyzer::compile_vector("sum(x)", &vars, DType::Auto).unwrap();
        assert_eq!(plan.output_dtype, DType::Int64);
        assert!(plan.has_reduction);
    }

    #[test]
    fn nested_reduction_rejected() {
        let vars = vec![Variable::new("x", DType::Int32)];
        let err = Analyzer::compile_vector("sum(sum(x))", &vars, DType::Auto).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported(_)));
    }

    #[test]
    fn unknown_name_rejected() {
        let vars = vec![Variable::new("x", DType::Int32)];
        let err = Analyzer::compile_vector("y + 1", &vars, DType::Auto).unwrap_err();
        assert!(matches!(err, CompileError::UnknownName(_)));
    }

    #[test]
    fn xor_on_float_is_a_compile_error() {
        let vars = vec![Variable::new("a", DType::Float64)];
        let err = Analyzer::compile_vector("a ^ a", &vars, DType::Auto).unwrap_err();
        assert!(matches!(err, CompileError::InvalidArgType { .. }));
    }

    #[test]
    fn compile_nd_resolves_reserved_indices() {
        let vars: Vec<Variable> = vec![];
        let plan = Analyzer::compile_nd("_i0 * _n1 + _i1", &vars, DType::Int64, &[3, 5], &[2, 4], &[2, 3]).unwrap();
        assert_eq!(plan.output_dtype, DType::Int64);
        assert_eq!(plan.ndim(), 2);
    }

    #[test]
    fn compile_nd_rejects_out_of_range_axis() {
        let vars: Vec<Variable> = vec![];
        let err = Analyzer::compile_nd("_i5", &vars, DType::Auto, &[3, 5], &[2, 4], &[2, 3]).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported(_)));
    }

    #[test]
    fn compile_nd_rejects_mismatched_ranks() {
        let vars: Vec<Variable> = vec![];
        let err = Analyzer::compile_nd("_i0", &vars, DType::Auto, &[3, 5], &[2], &[2, 3]).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported(_)));
    }
}
