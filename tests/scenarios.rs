//! End-to-end scenarios exercised through the public `Expr` API (§8).

use miniexpr::{CompileError, DType, Expr, Variable};

#[test]
fn s1_simple_add_float64() {
    let vars = vec![Variable::new("a", DType::Float64), Variable::new("b", DType::Float64)];
    let expr = Expr::compile("a + b", &vars, DType::Float64).unwrap();

    let a: Vec<f64> = (0..100).map(|i| i as f64).collect();
    let b: Vec<f64> = (0..100).map(|i| (2 * i) as f64).collect();
    let mut out = vec![0.0f64; 100];
    unsafe {
        expr.eval(&[a.as_ptr() as *const u8, b.as_ptr() as *const u8], 100, out.as_mut_ptr() as *mut u8).unwrap();
    }
    let expected: Vec<f64> = (0..100).map(|i| 3.0 * i as f64).collect();
    assert_eq!(out, expected);
}

#[test]
fn s2_mixed_promotion_then_cast_to_f32() {
    let vars = vec![Variable::new("a", DType::Int32), Variable::new("b", DType::Float64)];
    let expr = Expr::compile("a + b", &vars, DType::Float32).unwrap();
    assert_eq!(expr.output_dtype(), DType::Float32);

    let a: Vec<i32> = (0..10).collect();
    let b: Vec<f64> = (0..10).map(|i| i as f64 * 0.5).collect();
    let mut out = vec![0.0f32; 10];
    unsafe {
        expr.eval(&[a.as_ptr() as *const u8, b.as_ptr() as *const u8], 10, out.as_mut_ptr() as *mut u8).unwrap();
    }
    let expected: Vec<f32> = vec![0.0, 1.5, 3.0, 4.5, 6.0, 7.5, 9.0, 10.5, 12.0, 13.5];
    assert_eq!(out, expected);
}

#[test]
fn s3_sum_over_int32_to_int64() {
    let vars = vec![Variable::new("x", DType::Int32)];
    let expr = Expr::compile("sum(x)", &vars, DType::Auto).unwrap();
    assert_eq!(expr.output_dtype(), DType::Int64);

    let x: Vec<i32> = vec![1, 2, 3, 4];
    let mut out = vec![777i64; 2];
    unsafe {
        expr.eval(&[x.as_ptr() as *const u8], 4, out.as_mut_ptr() as *mut u8).unwrap();
    }
    assert_eq!(out[0], 10);
    assert_eq!(out[1], 777, "reduction must only write output[0]");
}

#[test]
fn s4_any_on_empty_bool() {
    let vars = vec![Variable::new("x", DType::Bool)];
    let any_expr = Expr::compile("any(x)", &vars, DType::Auto).unwrap();
    let all_expr = Expr::compile("all(x)", &vars, DType::Auto).unwrap();

    let x: Vec<u8> = vec![];
    let mut any_out = [9u8];
    let mut all_out = [9u8];
    unsafe {
        any_expr.eval(&[x.as_ptr()], 0, any_out.as_mut_ptr()).unwrap();
        all_expr.eval(&[x.as_ptr()], 0, all_out.as_mut_ptr()).unwrap();
    }
    assert_eq!(any_out[0], 0, "any() over empty input must be false");
    assert_eq!(all_out[0], 1, "all() over empty input must be true");
}

#[test]
fn s5_nd_block_padding() {
    let vars: Vec<Variable> = vec![];
    let expr = Expr::compile_nd("_i0 * _n1 + _i1", &vars, DType::Int64, &[3, 5], &[2, 4], &[2, 3]).unwrap();

    let valid = expr.nd_valid_nitems(1, 0).unwrap();
    assert_eq!(valid, 2);

    let mut out = [-1i64; 6];
    unsafe {
        expr.eval_nd(&[], out.as_mut_ptr() as *mut u8, 6, 1, 0).unwrap();
    }
    assert_eq!(out, [4, 0, 0, 9, 0, 0]);
}

#[test]
fn s6_jit_negative_cache_avoids_repeated_source_emission() {
    // Force compile failure deterministically rather than relying on a
    // broken CC being present: point ME_DSL_JIT's compiler at a
    // guaranteed-nonexistent binary via CC, scoped to a private TMPDIR so
    // this test cannot race other tests' cache directories.
    let dir = std::env::temp_dir().join(format!("miniexpr-jit-test-s6-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();

    let prev_tmpdir = std::env::var("TMPDIR").ok();
    let prev_cc = std::env::var("CC").ok();
    std::env::set_var("TMPDIR", &dir);
    std::env::set_var("CC", "me-definitely-not-a-real-compiler");

    let vars = vec![Variable::new("x", DType::Float64)];
    let expr1 = Expr::compile("def kernel(x):\n    return x * 2.0\n", &vars, DType::Auto).unwrap();
    assert!(!expr1.has_jit_kernel(), "compile must still succeed via interpreter fallback when JIT compile fails");

    let so_count = std::fs::read_dir(&dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.ends_with(".so") || name.ends_with(".dylib")
        })
        .count();
    assert_eq!(so_count, 0, "a failed compile must never leave a shared object behind");

    // Second compile within cooldown must still succeed (interpreter
    // fallback) without panicking on the negative cache path.
    let expr2 = Expr::compile("def kernel(x):\n    return x * 2.0\n", &vars, DType::Auto).unwrap();
    assert!(!expr2.has_jit_kernel());

    let x = [3.0f64];
    let mut out = [0.0f64];
    unsafe {
        expr2.eval(&[x.as_ptr() as *const u8], 1, out.as_mut_ptr() as *mut u8).unwrap();
    }
    assert_eq!(out[0], 6.0);

    match prev_tmpdir {
        Some(v) => std::env::set_var("TMPDIR", v),
        None => std::env::remove_var("TMPDIR"),
    }
    match prev_cc {
        Some(v) => std::env::set_var("CC", v),
        None => std::env::remove_var("CC"),
    }
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn s7_escape_iteration_kernel_interpreter_parity() {
    // Mandelbrot-style escape-count kernel: bounded for-loop, conditional
    // break once the squared modulus exceeds 4.0. Only the interpreter
    // path is exercised directly here (via the public eval() API, which
    // always falls back correctly whether or not a JIT kernel attached),
    // since invoking an external C compiler is out of scope for a test
    // that must not depend on the host toolchain.
    let src = "def kernel(cre, cim):\n\
               \u{20}   zre = 0.0\n\
               \u{20}   zim = 0.0\n\
               \u{20}   count = 0.0\n\
               \u{20}   for i in range(50):\n\
               \u{20}       new_re = zre * zre - zim * zim + cre\n\
               \u{20}       new_im = 2.0 * zre * zim + cim\n\
               \u{20}       zre = new_re\n\
               \u{20}       zim = new_im\n\
               \u{20}       count = count + 1.0\n\
               \u{20}       break if zre * zre + zim * zim > 4.0\n\
               \u{20}   return count\n";

    let vars = vec![Variable::new("cre", DType::Float64), Variable::new("cim", DType::Float64)];
    let expr = Expr::compile(src, &vars, DType::Auto).unwrap();
    assert_eq!(expr.output_dtype(), DType::Float64);

    // A handful of deterministic points standing in for the 1000 random
    // inputs a fuller benchmark harness would draw: one inside the set
    // (never escapes within 50 iterations), one well outside (escapes
    // immediately), one on the boundary region.
    let cre = [0.0f64, 2.0, -1.0];
    let cim = [0.0f64, 2.0, 0.0];
    let mut out = [0.0f64; 3];
    unsafe {
        expr.eval(&[cre.as_ptr() as *const u8, cim.as_ptr() as *const u8], 3, out.as_mut_ptr() as *mut u8).unwrap();
    }
    assert_eq!(out[0], 50.0, "the origin never escapes within the iteration bound");
    assert_eq!(out[1], 1.0, "(2,2) escapes on the first iteration");
    assert!(out[2] > 1.0, "(-1,0) is inside the main cardioid-adjacent region and should iterate a while");
}

#[test]
fn compile_rejects_unknown_name_with_stable_status() {
    let vars = vec![Variable::new("x", DType::Int32)];
    let err = Expr::compile("y + 1", &vars, DType::Auto).unwrap_err();
    assert!(matches!(err, CompileError::UnknownName(_)));
    assert_eq!(err.status(), miniexpr::CompileStatus::ErrUnknownName);
}

#[test]
fn eval_reports_invalid_arg_count() {
    let vars = vec![Variable::new("a", DType::Float64), Variable::new("b", DType::Float64)];
    let expr = Expr::compile("a + b", &vars, DType::Auto).unwrap();
    let a = [1.0f64];
    let err = unsafe { expr.eval(&[a.as_ptr() as *const u8], 1, std::ptr::null_mut()).unwrap_err() };
    assert_eq!(err.status(), miniexpr::EvalStatus::ErrInvalidArg);
}
