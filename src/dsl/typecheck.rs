//! Resolves a parsed DSL [`Program`] against a variable list into typed
//! statements (§4.3 applied to §4.2's grammar), and validates the
//! missing-`return`-path rule (§4.6, §7).

use crate::ast::{self, ExprKind, Literal};
use crate::dsl::ast::{is_reserved_index, Program, Stmt};
use crate::dtype::DType;
use crate::error::CompileError;
use crate::typed::{Const, ConstValue, Node, NodeKind};
use crate::variable::Variable;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub enum TStmt {
    Assign { name: String, value: Node },
    If { cond: Node, then_body: Vec<TStmt>, elifs: Vec<(Node, Vec<TStmt>)>, else_body: Option<Vec<TStmt>> },
    For { var: String, start: Node, stop: Node, step: Node, body: Vec<TStmt> },
    Break { cond: Option<Node> },
    Continue { cond: Option<Node> },
    Return(Node),
}

#[derive(Clone)]
pub struct TypedKernel {
    pub body: Vec<TStmt>,
    pub output_dtype: DType,
    pub reserved_used: Vec<String>,
}

struct Resolver<'a> {
    vars: &'a [Variable],
    locals: HashMap<String, DType>,
    reserved_used: Vec<String>,
}

impl<'a> Resolver<'a> {
    fn find_param(&self, name: &str) -> Option<DType> {
        self.vars.iter().find(|v| v.name == name).map(|v| v.dtype)
    }

    fn resolve(&mut self, e: &ast::Expr) -> Result<Node, CompileError> {
        match &e.kind {
            ExprKind::Literal(Literal::Int(v)) => {
                let dtype = if i32::try_from(*v).is_ok() { DType::Int32 } else { DType::Int64 };
                Ok(Node::new(dtype, NodeKind::Const(Const { value: ConstValue::Int(*v), dtype })))
            }
            ExprKind::Literal(Literal::Float(v)) => {
                Ok(Node::new(DType::Float64, NodeKind::Const(Const { value: ConstValue::Float(*v), dtype: DType::Float64 })))
            }
            ExprKind::Literal(Literal::Str(s)) => {
                Ok(Node::new(DType::String, NodeKind::Const(Const { value: ConstValue::Str(s.clone()), dtype: DType::String })))
            }
            ExprKind::Ident(name) => {
                if let Some(&dtype) = self.locals.get(name) {
                    return Ok(Node::new(dtype, NodeKind::Local(name.clone())));
                }
                if let Some(dtype) = self.find_param(name) {
                    return Ok(Node::new(dtype, NodeKind::Param(name.clone())));
                }
                if is_reserved_index(name) {
                    if !self.reserved_used.contains(name) {
                        self.reserved_used.push(name.clone());
                    }
                    return Ok(Node::new(DType::Int64, NodeKind::Reserved(name.clone())));
                }
                Err(CompileError::UnknownName(name.clone()))
            }
            ExprKind::Unary(op, inner) => {
                let node = self.resolve(inner)?;
                crate::semantic::resolve_unary_public(*op, node, e)
            }
            ExprKind::Binary(op, lhs, rhs) => {
                let l = self.resolve(lhs)?;
                let r = self.resolve(rhs)?;
                crate::semantic::resolve_binary_public(*op, l, r, e)
            }
            ExprKind::Call(name, args) => {
                let mut resolved = Vec::with_capacity(args.len());
                for a in args {
                    resolved.push(self.resolve(a)?);
                }
                crate::semantic::resolve_call_public(name, args, resolved, e)
            }
        }
    }
}

fn resolve_stmts(resolver: &mut Resolver, stmts: &[Stmt]) -> Result<Vec<TStmt>, CompileError> {
    let mut out = Vec::with_capacity(stmts.len());
    for s in stmts {
        out.push(resolve_stmt(resolver, s)?);
    }
    Ok(out)
}

fn resolve_stmt(resolver: &mut Resolver, s: &Stmt) -> Result<TStmt, CompileError> {
    Ok(match s {
        Stmt::Assign { name, value } => {
            let v = resolver.resolve(value)?;
            let dtype = match resolver.locals.get(name) {
                Some(&existing) => existing.promote(v.dtype).unwrap_or(existing),
                None => v.dtype,
            };
            resolver.locals.insert(name.clone(), dtype);
            TStmt::Assign { name: name.clone(), value: v }
        }
        Stmt::If { cond, then_body, elifs, else_body } => {
            let cond = coerce_bool(resolver.resolve(cond)?)?;
            let then_body = resolve_stmts(resolver, then_body)?;
            let mut t_elifs = Vec::with_capacity(elifs.len());
            for (c, b) in elifs {
                let c = coerce_bool(resolver.resolve(c)?)?;
                let b = resolve_stmts(resolver, b)?;
                t_elifs.push((c, b));
            }
            let else_body = else_body.as_ref().map(|b| resolve_stmts(resolver, b)).transpose()?;
            TStmt::If { cond, then_body, elifs: t_elifs, else_body }
        }
        Stmt::For { var, range, body } => {
            let start = match &range.start {
                Some(e) => resolver.resolve(e)?,
                None => Node::new(DType::Int64, NodeKind::Const(Const { value: ConstValue::Int(0), dtype: DType::Int64 })),
            };
            let stop = resolver.resolve(&range.stop)?;
            let step = match &range.step {
                Some(e) => resolver.resolve(e)?,
                None => Node::new(DType::Int64, NodeKind::Const(Const { value: ConstValue::Int(1), dtype: DType::Int64 })),
            };
            resolver.locals.insert(var.clone(), DType::Int64);
            let body = resolve_stmts(resolver, body)?;
            TStmt::For { var: var.clone(), start, stop, step, body }
        }
        Stmt::Break { cond } => {
            let cond = cond.as_ref().map(|c| resolver.resolve(c)).transpose()?;
            TStmt::Break { cond }
        }
        Stmt::Continue { cond } => {
            let cond = cond.as_ref().map(|c| resolver.resolve(c)).transpose()?;
            TStmt::Continue { cond }
        }
        Stmt::Return(e) => TStmt::Return(resolver.resolve(e)?),
    })
}

fn coerce_bool(node: Node) -> Result<Node, CompileError> {
    if node.dtype == DType::Bool {
        Ok(node)
    } else if node.dtype.is_numeric() {
        Ok(Node::new(DType::Bool, NodeKind::Cast(Box::new(node))))
    } else {
        Err(CompileError::Unsupported("condition must be numeric/bool".into()))
    }
}

/// Every control-flow path must reach a `return` (§4.6, §7): checked
/// structurally rather than by data-flow, since loops are never assumed
/// to execute.
fn always_returns(stmts: &[TStmt]) -> bool {
    stmts.iter().any(|s| match s {
        TStmt::Return(_) => true,
        TStmt::If { then_body, elifs, else_body, .. } => {
            let Some(else_body) = else_body else { return false };
            always_returns(then_body) && elifs.iter().all(|(_, b)| always_returns(b)) && always_returns(else_body)
        }
        _ => false,
    })
}

fn collect_return_dtypes(stmts: &[TStmt], out: &mut Vec<DType>) {
    for s in stmts {
        match s {
            TStmt::Return(n) => out.push(n.dtype),
            TStmt::If { then_body, elifs, else_body, .. } => {
                collect_return_dtypes(then_body, out);
                for (_, b) in elifs {
                    collect_return_dtypes(b, out);
                }
                if let Some(b) = else_body {
                    collect_return_dtypes(b, out);
                }
            }
            TStmt::For { body, .. } => collect_return_dtypes(body, out),
            _ => {}
        }
    }
}

pub fn typecheck(prog: &Program, vars: &[Variable]) -> Result<TypedKernel, CompileError> {
    for p in &prog.params {
        if !vars.iter().any(|v| &v.name == p) {
            return Err(CompileError::UnknownName(p.clone()));
        }
    }
    let mut resolver = Resolver { vars, locals: HashMap::new(), reserved_used: Vec::new() };
    let body = resolve_stmts(&mut resolver, &prog.body)?;

    if !always_returns(&body) {
        return Err(CompileError::Unsupported(
            "kernel has a control-flow path that does not reach a 'return'".into(),
        ));
    }

    let mut dtypes = Vec::new();
    collect_return_dtypes(&body, &mut dtypes);
    let mut output_dtype = dtypes[0];
    for &d in &dtypes[1..] {
        output_dtype = output_dtype
            .promote(d)
            .ok_or_else(|| CompileError::InvalidArgType {
                pos: crate::error::SourcePos::default(),
                message: format!("kernel return paths disagree: {output_dtype} vs {d}"),
            })?;
    }

    Ok(TypedKernel { body, output_dtype, reserved_used: resolver.reserved_used })
}
