//! The typed operator tree (§3 `Node`) produced by semantic analysis.

use crate::ast::{BinaryOp, UnaryOp};
use crate::dtype::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceKind {
    Sum,
    Prod,
    Min,
    Max,
    Any,
    All,
}

impl ReduceKind {
    pub fn output_dtype(self, input: DType) -> Option<DType> {
        match self {
            ReduceKind::Sum | ReduceKind::Prod => input.reduce_sum_prod_dtype(),
            ReduceKind::Min | ReduceKind::Max => input.reduce_minmax_dtype(),
            ReduceKind::Any | ReduceKind::All => input.reduce_any_all_dtype(),
        }
    }

    /// Identity element for an empty reduction, as an f64 for numeric
    /// kinds (interpreted per dtype at evaluation) or a bool for
    /// any/all (§4.4).
    pub fn float_identity(self) -> f64 {
        match self {
            ReduceKind::Sum => 0.0,
            ReduceKind::Prod => 1.0,
            ReduceKind::Min => f64::INFINITY,
            ReduceKind::Max => f64::NEG_INFINITY,
            ReduceKind::Any => 0.0,
            ReduceKind::All => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// A scalar constant, typed.
#[derive(Debug, Clone, PartialEq)]
pub struct Const {
    pub value: ConstValue,
    pub dtype: DType,
}

/// A builtin function identifier, resolved from its source name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FnId {
    Sin,
    Cos,
    Exp,
    Log,
    Sqrt,
    Abs,
    Where,
    StartsWith,
    EndsWith,
    Contains,
}

impl FnId {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => FnId::Sin,
            "cos" => FnId::Cos,
            "exp" => FnId::Exp,
            "log" => FnId::Log,
            "sqrt" => FnId::Sqrt,
            "abs" => FnId::Abs,
            "where" => FnId::Where,
            "startswith" => FnId::StartsWith,
            "endswith" => FnId::EndsWith,
            "contains" => FnId::Contains,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            FnId::Sin => "sin",
            FnId::Cos => "cos",
            FnId::Exp => "exp",
            FnId::Log => "log",
            FnId::Sqrt => "sqrt",
            FnId::Abs => "abs",
            FnId::Where => "where",
            FnId::StartsWith => "startswith",
            FnId::EndsWith => "endswith",
            FnId::Contains => "contains",
        }
    }

    pub fn is_transcendental(self) -> bool {
        matches!(self, FnId::Sin | FnId::Cos | FnId::Exp | FnId::Log | FnId::Sqrt)
    }
}

/// A typed operator-tree node. Every node carries its resolved element
/// dtype (§3). The tree is strictly a DAG-free tree: owners are unique,
/// there are no cycles (§9).
#[derive(Debug, Clone)]
pub struct Node {
    pub dtype: DType,
    pub kind: NodeKind,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Const(Const),
    /// Index into the compiled plan's parameter list (infix `VectorPlan`/
    /// `NDPlan` trees only).
    Var(usize),
    /// A named kernel input parameter (DSL trees only); resolved to a
    /// canonical parameter-order index during IR building / emission.
    Param(String),
    /// A reserved index identifier (`_iK`, `_nK`, `_ndim`,
    /// `_global_linear_idx`), always `Int64` (DSL trees only).
    Reserved(String),
    /// A kernel-local name bound by an `Assign` statement (DSL trees
    /// only).
    Local(String),
    Unary(UnaryOp, Box<Node>),
    Binary(BinaryOp, Box<Node>, Box<Node>),
    Call(FnId, Vec<Node>),
    /// A reduction. Per §3, never nested inside another `Reduce`, and
    /// never used as a per-element value directly: the analyzer hoists a
    /// `Reduce` used mid-expression into a precomputed scalar broadcast
    /// (§4.4 "Reductions embedded in per-element expressions").
    Reduce(ReduceKind, Box<Node>),
    /// A final cast inserted when the requested output dtype differs
    /// from the inferred one.
    Cast(Box<Node>),
}

impl Node {
    pub fn new(dtype: DType, kind: NodeKind) -> Self {
        Node { dtype, kind }
    }

    /// True if this subtree contains a `Reduce` node anywhere.
    pub fn contains_reduction(&self) -> bool {
        match &self.kind {
            NodeKind::Const(_) | NodeKind::Var(_) | NodeKind::Param(_) | NodeKind::Reserved(_) | NodeKind::Local(_) => false,
            NodeKind::Unary(_, a) => a.contains_reduction(),
            NodeKind::Binary(_, a, b) => a.contains_reduction() || b.contains_reduction(),
            NodeKind::Call(_, args) => args.iter().any(Node::contains_reduction),
            NodeKind::Reduce(..) => true,
            NodeKind::Cast(a) => a.contains_reduction(),
        }
    }

    /// True when the whole tree's value *is* a reduction (possibly wrapped
    /// in a final output cast), meaning the plan's output is a length-1
    /// scalar rather than a per-element array (§4.4, §9 open question 2).
    pub fn is_top_level_reduction(&self) -> bool {
        match &self.kind {
            NodeKind::Reduce(..) => true,
            NodeKind::Cast(inner) => inner.is_top_level_reduction(),
            _ => false,
        }
    }

    /// Stable identity for this node within one evaluation call, used to
    /// key the precomputed-reduction cache. Valid only while the tree is
    /// not moved or reallocated.
    pub fn id(&self) -> usize {
        self as *const Node as usize
    }
}
