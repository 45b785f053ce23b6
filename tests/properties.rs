//! Property-based tests for the testable properties named in the ambient
//! test-tooling plan: promotion totality/commutativity, chunk independence,
//! and reduction identities (§8).

use miniexpr::{DType, Expr, Variable};
use quickcheck::{Arbitrary, Gen};
use quickcheck_macros::quickcheck;
use strum::IntoEnumIterator;

/// Wraps `DType` so quickcheck can generate arbitrary instances; `String` is
/// excluded since promotion is defined only over the numeric/bool lattice.
#[derive(Debug, Clone, Copy)]
struct NumericDType(DType);

impl Arbitrary for NumericDType {
    fn arbitrary(g: &mut Gen) -> Self {
        let choices: Vec<DType> = DType::iter().filter(|d| *d != DType::String && *d != DType::Auto).collect();
        NumericDType(*g.choose(&choices).unwrap())
    }
}

#[quickcheck]
fn promotion_is_commutative(a: NumericDType, b: NumericDType) -> bool {
    a.0.promote(b.0) == b.0.promote(a.0)
}

#[quickcheck]
fn promotion_is_total_over_numeric_dtypes(a: NumericDType, b: NumericDType) -> bool {
    a.0.promote(b.0).is_some()
}

#[quickcheck]
fn sum_reduction_matches_naive_accumulation(xs: Vec<i32>) -> bool {
    let xs: Vec<i32> = xs.into_iter().take(2000).collect();
    let vars = vec![Variable::new("x", DType::Int32)];
    let expr = Expr::compile("sum(x)", &vars, DType::Auto).unwrap();
    let mut out = 0i64;
    unsafe {
        expr.eval(&[xs.as_ptr() as *const u8], xs.len(), &mut out as *mut i64 as *mut u8).unwrap();
    }
    let expected: i64 = xs.iter().map(|&v| v as i64).sum();
    out == expected
}

#[quickcheck]
fn chunk_boundary_split_does_not_change_elementwise_result(a: Vec<f64>, b: Vec<f64>) -> bool {
    let n = a.len().min(b.len()).min(500_000);
    if n == 0 {
        return true;
    }
    let a = &a[..n];
    let b = &b[..n];
    let vars = vec![Variable::new("a", DType::Float64), Variable::new("b", DType::Float64)];
    let expr = Expr::compile("a + b", &vars, DType::Float64).unwrap();
    let mut out = vec![0.0f64; n];
    unsafe {
        expr.eval(&[a.as_ptr() as *const u8, b.as_ptr() as *const u8], n, out.as_mut_ptr() as *mut u8).unwrap();
    }
    out.iter().zip(a.iter().zip(b.iter())).all(|(&o, (&x, &y))| {
        let sum = x + y;
        o == sum || (o.is_nan() && sum.is_nan())
    })
}

#[quickcheck]
fn any_reduction_matches_naive_or(xs: Vec<bool>) -> bool {
    let xs: Vec<u8> = xs.into_iter().take(5000).map(|b| b as u8).collect();
    let vars = vec![Variable::new("x", DType::Bool)];
    let expr = Expr::compile("any(x)", &vars, DType::Auto).unwrap();
    let mut out = 0u8;
    unsafe {
        expr.eval(&[xs.as_ptr()], xs.len(), &mut out as *mut u8).unwrap();
    }
    let expected = xs.iter().any(|&v| v != 0);
    (out != 0) == expected
}
