//! Kernel DSL AST (§4.2): `def kernel(params): BODY` with assignments,
//! branches, bounded loops, and pragmas.

use crate::ast::Expr;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpMode {
    Strict,
    Contract,
    Fast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerBackend {
    Cc,
    Tcc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Vector,
    Element,
}

/// Parsed `# me:KEY=VALUE` pragmas, collected ahead of the kernel body.
#[derive(Debug, Clone)]
pub struct Pragmas {
    pub fp: FpMode,
    pub compiler: CompilerBackend,
    pub dialect: Dialect,
}

impl Default for Pragmas {
    fn default() -> Self {
        Pragmas { fp: FpMode::Strict, compiler: CompilerBackend::Cc, dialect: Dialect::Element }
    }
}

#[derive(Debug, Clone)]
pub struct ForRange {
    pub start: Option<Expr>,
    pub stop: Expr,
    pub step: Option<Expr>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Assign { name: String, value: Expr },
    If { cond: Expr, then_body: Vec<Stmt>, elifs: Vec<(Expr, Vec<Stmt>)>, else_body: Option<Vec<Stmt>> },
    For { var: String, range: ForRange, body: Vec<Stmt> },
    Break { cond: Option<Expr> },
    Continue { cond: Option<Expr> },
    Return(Expr),
}

#[derive(Debug, Clone)]
pub struct Program {
    pub pragmas: Pragmas,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    /// Raw key/value pairs, retained for fingerprinting (§4.7: dialect is
    /// part of the fingerprint input alongside the operator tree).
    pub raw_pragmas: BTreeMap<String, String>,
}

/// The reserved, implicitly-bound index identifiers (§4.2). `max_rank`
/// bounds how many `_iK`/`_nK` pairs a program may reference.
pub const RESERVED_GLOBAL_LINEAR_IDX: &str = "_global_linear_idx";
pub const RESERVED_NDIM: &str = "_ndim";

pub fn is_reserved_index(name: &str) -> bool {
    name == RESERVED_GLOBAL_LINEAR_IDX
        || name == RESERVED_NDIM
        || (name.starts_with("_i") && name[2..].parse::<u32>().is_ok())
        || (name.starts_with("_n") && name[2..].parse::<u32>().is_ok())
}

/// Canonical parameter order (§4.2, §4.8): user variables first in their
/// declared order, then reserved indices in the fixed order
/// `_i0..iK, _n0..nK, _ndim, _global_linear_idx`.
pub fn canonical_parameter_order(user_params: &[String], reserved_used: &[String]) -> Vec<String> {
    let mut order: Vec<String> = user_params.to_vec();
    let max_i = reserved_used
        .iter()
        .filter_map(|n| n.strip_prefix("_i").and_then(|s| s.parse::<u32>().ok()))
        .max();
    let max_n = reserved_used
        .iter()
        .filter_map(|n| n.strip_prefix("_n").and_then(|s| s.parse::<u32>().ok()))
        .max();
    if let Some(max_i) = max_i {
        for k in 0..=max_i {
            order.push(format!("_i{k}"));
        }
    }
    if let Some(max_n) = max_n {
        for k in 0..=max_n {
            order.push(format!("_n{k}"));
        }
    }
    if reserved_used.iter().any(|n| n == RESERVED_NDIM) {
        order.push(RESERVED_NDIM.to_string());
    }
    if reserved_used.iter().any(|n| n == RESERVED_GLOBAL_LINEAR_IDX) {
        order.push(RESERVED_GLOBAL_LINEAR_IDX.to_string());
    }
    order
}
