//! The frozen math bridge (§4.11): extern symbol names shared between the
//! interpreter's transcendental calls and JIT-emitted C kernels.

/// Scalar bridge symbol for a builtin transcendental, e.g. `me_jit_sin`.
/// Frozen per §4.11 — these names appear verbatim in emitted C and must
/// never change independent of a bridge ABI version bump.
pub fn scalar_symbol(name: &str) -> String {
    format!("me_jit_{name}")
}

/// Vector bridge symbol for a builtin transcendental at a given float
/// width, e.g. `me_jit_vec_sin_f64`.
pub fn vector_symbol(name: &str, width_bits: u32) -> String {
    format!("me_jit_vec_{name}_f{width_bits}")
}

/// The full set of bridge names a kernel may reference, used by the IR
/// builder to validate calls and by the emitter to forward-declare externs.
pub const BRIDGE_SCALAR_OPS: &[&str] = &["sin", "cos", "exp", "log", "sqrt", "abs", "where"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_symbol_naming() {
        assert_eq!(scalar_symbol("sin"), "me_jit_sin");
    }

    #[test]
    fn vector_symbol_naming() {
        assert_eq!(vector_symbol("cos", 32), "me_jit_vec_cos_f32");
        assert_eq!(vector_symbol("cos", 64), "me_jit_vec_cos_f64");
    }
}
