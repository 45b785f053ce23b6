//! Lowers a typechecked DSL kernel to the restricted IR the C emitter
//! consumes, and computes its deterministic fingerprint (§4.7).

use sha3::{Digest, Sha3_256};

use crate::dsl::ast::{CompilerBackend, Dialect, FpMode, Program};
use crate::dsl::typecheck::{TStmt, TypedKernel};
use crate::dtype::DType;
use crate::error::CompileError;
use crate::typed::{ConstValue, Node, NodeKind};

/// The restricted IR handed to the emitter: a typechecked kernel body plus
/// the metadata that must be part of the cache key.
pub struct Ir {
    pub kernel: TypedKernel,
    pub dialect: Dialect,
    pub fp_mode: FpMode,
    pub compiler: CompilerBackend,
    pub parameter_order: Vec<String>,
    pub fingerprint: u64,
}

/// Build the IR for `prog`/`typed`, rejecting constructs the emitter
/// cannot lower (§4.7: "bare expression statements, `print`" — none of
/// which the DSL grammar can even produce, so this is a closed check over
/// the typed statement shapes we do support).
pub fn build_ir(prog: Program, typed: TypedKernel) -> Result<Ir, CompileError> {
    reject_unsupported(&typed.body)?;
    reject_nd_reserved_indices(&typed.reserved_used)?;

    let parameter_order = crate::dsl::ast::canonical_parameter_order(&prog.params, &typed.reserved_used);
    let fingerprint = compute_fingerprint(&typed, prog.pragmas.dialect, prog.pragmas.fp, &parameter_order);

    Ok(Ir {
        kernel: typed,
        dialect: prog.pragmas.dialect,
        fp_mode: prog.pragmas.fp,
        compiler: prog.pragmas.compiler,
        parameter_order,
        fingerprint,
    })
}

fn reject_unsupported(stmts: &[TStmt]) -> Result<(), CompileError> {
    for s in stmts {
        match s {
            TStmt::If { then_body, elifs, else_body, .. } => {
                reject_unsupported(then_body)?;
                for (_, b) in elifs {
                    reject_unsupported(b)?;
                }
                if let Some(b) = else_body {
                    reject_unsupported(b)?;
                }
            }
            TStmt::For { body, .. } => reject_unsupported(body)?,
            TStmt::Assign { value, .. } | TStmt::Return(value) => reject_node(value)?,
            TStmt::Break { cond } | TStmt::Continue { cond } => {
                if let Some(c) = cond {
                    reject_node(c)?;
                }
            }
        }
    }
    Ok(())
}

/// The C emitter only materializes the flat (non-ND) reserved indices
/// `_i0`/`_n0`/`_ndim`/`_global_linear_idx` (§4.8); a kernel referencing a
/// higher-rank index only has meaning relative to an ND block origin the
/// flat kernel ABI doesn't carry, so JIT is skipped and the interpreter
/// fallback (which does carry that context) handles it instead.
fn reject_nd_reserved_indices(reserved_used: &[String]) -> Result<(), CompileError> {
    for name in reserved_used {
        if !matches!(name.as_str(), "_i0" | "_n0" | "_ndim" | "_global_linear_idx") {
            return Err(CompileError::Unsupported(format!(
                "reserved index '{name}' cannot be lowered to a flat JIT kernel"
            )));
        }
    }
    Ok(())
}

fn reject_node(node: &Node) -> Result<(), CompileError> {
    if matches!(node.kind, NodeKind::Reduce(..)) {
        return Err(CompileError::Unsupported("reductions cannot be lowered to a JIT kernel body".into()));
    }
    match &node.kind {
        NodeKind::Unary(_, a) | NodeKind::Cast(a) => reject_node(a),
        NodeKind::Binary(_, a, b) => {
            reject_node(a)?;
            reject_node(b)
        }
        NodeKind::Call(_, args) => args.iter().try_for_each(reject_node),
        _ => Ok(()),
    }
}

/// Deterministic 64-bit fingerprint: same IR (tree shape, dtypes, literal
/// values, dialect, reserved-index set, canonical parameter order) always
/// yields the same value, independent of textual source order (§4.7,
/// testable property 12). Truncates a SHA3-256 digest of a canonical
/// textual encoding to its first 8 bytes.
fn compute_fingerprint(kernel: &TypedKernel, dialect: Dialect, fp_mode: FpMode, parameter_order: &[String]) -> u64 {
    let mut text = String::new();
    text.push_str(match dialect {
        Dialect::Vector => "dialect=vector;",
        Dialect::Element => "dialect=element;",
    });
    text.push_str(match fp_mode {
        FpMode::Strict => "fp=strict;",
        FpMode::Contract => "fp=contract;",
        FpMode::Fast => "fp=fast;",
    });
    text.push_str("params=[");
    for p in parameter_order {
        text.push_str(p);
        text.push(',');
    }
    text.push_str("];output=");
    text.push_str(&kernel.output_dtype.to_string());
    text.push_str(";body=");
    for s in &kernel.body {
        describe_stmt(s, &mut text);
    }

    let mut hasher = Sha3_256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

fn describe_stmt(stmt: &TStmt, out: &mut String) {
    match stmt {
        TStmt::Assign { name, value } => {
            out.push_str("(assign ");
            out.push_str(name);
            out.push(' ');
            describe_node(value, out);
            out.push(')');
        }
        TStmt::If { cond, then_body, elifs, else_body } => {
            out.push_str("(if ");
            describe_node(cond, out);
            out.push_str(" then(");
            then_body.iter().for_each(|s| describe_stmt(s, out));
            out.push(')');
            for (c, b) in elifs {
                out.push_str(" elif(");
                describe_node(c, out);
                b.iter().for_each(|s| describe_stmt(s, out));
                out.push(')');
            }
            if let Some(b) = else_body {
                out.push_str(" else(");
                b.iter().for_each(|s| describe_stmt(s, out));
                out.push(')');
            }
            out.push(')');
        }
        TStmt::For { var, start, stop, step, body } => {
            out.push_str("(for ");
            out.push_str(var);
            out.push(' ');
            describe_node(start, out);
            describe_node(stop, out);
            describe_node(step, out);
            out.push_str(" body(");
            body.iter().for_each(|s| describe_stmt(s, out));
            out.push_str("))");
        }
        TStmt::Break { cond } => {
            out.push_str("(break");
            if let Some(c) = cond {
                out.push(' ');
                describe_node(c, out);
            }
            out.push(')');
        }
        TStmt::Continue { cond } => {
            out.push_str("(continue");
            if let Some(c) = cond {
                out.push(' ');
                describe_node(c, out);
            }
            out.push(')');
        }
        TStmt::Return(e) => {
            out.push_str("(return ");
            describe_node(e, out);
            out.push(')');
        }
    }
}

fn describe_node(node: &Node, out: &mut String) {
    out.push('[');
    out.push_str(&node.dtype.to_string());
    out.push(':');
    match &node.kind {
        NodeKind::Const(c) => match &c.value {
            ConstValue::Bool(b) => out.push_str(&format!("const({b})")),
            ConstValue::Int(v) => out.push_str(&format!("const({v})")),
            ConstValue::Float(v) => out.push_str(&format!("const({v:?})")),
            ConstValue::Str(s) => out.push_str(&format!("const({s:?})")),
        },
        NodeKind::Var(i) => out.push_str(&format!("var({i})")),
        NodeKind::Param(name) => out.push_str(&format!("param({name})")),
        NodeKind::Reserved(name) => out.push_str(&format!("reserved({name})")),
        NodeKind::Local(name) => out.push_str(&format!("local({name})")),
        NodeKind::Unary(op, a) => {
            out.push_str(&format!("unary({op:?},"));
            describe_node(a, out);
            out.push(')');
        }
        NodeKind::Binary(op, a, b) => {
            out.push_str(&format!("binary({op:?},"));
            describe_node(a, out);
            describe_node(b, out);
            out.push(')');
        }
        NodeKind::Call(fn_id, args) => {
            out.push_str(&format!("call({},", fn_id.name()));
            for a in args {
                describe_node(a, out);
            }
            out.push(')');
        }
        NodeKind::Reduce(kind, child) => {
            out.push_str(&format!("reduce({kind:?},"));
            describe_node(child, out);
            out.push(')');
        }
        NodeKind::Cast(a) => {
            out.push_str("cast(");
            describe_node(a, out);
            out.push(')');
        }
    }
    out.push(']');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::Variable;

    fn parse_and_typecheck(src: &str, vars: &[Variable]) -> TypedKernel {
        let prog = crate::dsl::parse(src).unwrap();
        crate::dsl::typecheck(&prog, vars).unwrap()
    }

    #[test]
    fn fingerprint_is_deterministic_across_identical_compiles() {
        let vars = vec![Variable::new("x", DType::Float64)];
        let src = "def kernel(x):\n    return x + 1.0\n";
        let prog1 = crate::dsl::parse(src).unwrap();
        let typed1 = crate::dsl::typecheck(&prog1, &vars).unwrap();
        let ir1 = build_ir(prog1, typed1).unwrap();

        let prog2 = crate::dsl::parse(src).unwrap();
        let typed2 = crate::dsl::typecheck(&prog2, &vars).unwrap();
        let ir2 = build_ir(prog2, typed2).unwrap();

        assert_eq!(ir1.fingerprint, ir2.fingerprint);
    }

    #[test]
    fn reserved_index_reorder_does_not_change_fingerprint() {
        // build_ir itself only accepts the flat reserved indices, so the
        // reorder-independence of canonical_parameter_order (the actual
        // property under test, §8 testable property 12) is exercised
        // directly rather than through an ND-shaped kernel.
        let vars: Vec<Variable> = vec![];
        let a = parse_and_typecheck("def kernel():\n    return _i0 + _n0\n", &vars);
        let b = parse_and_typecheck("def kernel():\n    return _n0 + _i0\n", &vars);
        let prog_a = crate::dsl::parse("def kernel():\n    return _i0 + _n0\n").unwrap();
        let prog_b = crate::dsl::parse("def kernel():\n    return _n0 + _i0\n").unwrap();
        let ir_a = build_ir(prog_a, a).unwrap();
        let ir_b = build_ir(prog_b, b).unwrap();
        assert_eq!(ir_a.parameter_order, ir_b.parameter_order);

        let order1 = crate::dsl::ast::canonical_parameter_order(&[], &["_i0".into(), "_i1".into()]);
        let order2 = crate::dsl::ast::canonical_parameter_order(&[], &["_i1".into(), "_i0".into()]);
        assert_eq!(order1, order2);
    }

    #[test]
    fn fp_mode_differentiates_fingerprint() {
        let vars = vec![Variable::new("x", DType::Float64)];
        let strict_src = "def kernel(x):\n    return x + 1.0\n";
        let fast_src = "# me:fp=fast\ndef kernel(x):\n    return x + 1.0\n";
        let typed_strict = parse_and_typecheck(strict_src, &vars);
        let typed_fast = parse_and_typecheck(fast_src, &vars);
        let ir_strict = build_ir(crate::dsl::parse(strict_src).unwrap(), typed_strict).unwrap();
        let ir_fast = build_ir(crate::dsl::parse(fast_src).unwrap(), typed_fast).unwrap();
        assert_ne!(ir_strict.fingerprint, ir_fast.fingerprint);
    }
}
