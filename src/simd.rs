//! SIMD sin/cos backend selector (§4.10, SPEC_FULL.md item J): process-wide
//! math-backend state (ULP mode, scalar-vs-SIMD selection), lazily
//! initialized and guarded behind an internal lock rather than exposed as
//! a writable global (§9 design notes).

use std::sync::RwLock;

use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UlpMode {
    /// Default accuracy target for vectorized sin/cos.
    Ulp10,
    /// Relaxed accuracy target, allowing a faster backend.
    Ulp35,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinCosBackend {
    /// Scalar libm `sin`/`cos`, called once per element.
    ScalarLibm,
    /// A SIMD-batched approximation, selected only under the relaxed
    /// 35-ULP tolerance.
    SimdBatched,
}

#[derive(Debug, Clone, Copy)]
struct MathBackendState {
    ulp_mode: UlpMode,
    simd_enabled: bool,
}

impl Default for MathBackendState {
    fn default() -> Self {
        MathBackendState { ulp_mode: UlpMode::Ulp10, simd_enabled: true }
    }
}

static STATE: Lazy<RwLock<MathBackendState>> = Lazy::new(|| RwLock::new(MathBackendState::default()));

/// Set the process-wide ULP accuracy target. Not thread-safe to call
/// concurrently with evaluation; intended for one-time startup
/// configuration (§9).
pub fn set_ulp_mode(mode: UlpMode) {
    STATE.write().unwrap().ulp_mode = mode;
}

pub fn ulp_mode() -> UlpMode {
    STATE.read().unwrap().ulp_mode
}

/// Globally enable or disable the SIMD sin/cos path; with SIMD disabled,
/// [`select_backend`] always returns [`SinCosBackend::ScalarLibm`].
pub fn set_simd_enabled(enabled: bool) {
    STATE.write().unwrap().simd_enabled = enabled;
}

pub fn simd_enabled() -> bool {
    STATE.read().unwrap().simd_enabled
}

/// Choose the sin/cos backend for the current process state. The SIMD
/// batched path is only offered under the relaxed 35-ULP tolerance; the
/// default 10-ULP mode always uses scalar libm (§4.10).
pub fn select_backend() -> SinCosBackend {
    let state = *STATE.read().unwrap();
    if state.simd_enabled && state.ulp_mode == UlpMode::Ulp35 {
        SinCosBackend::SimdBatched
    } else {
        SinCosBackend::ScalarLibm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These share process-wide state; each leaves it as it found it
    // (default 10-ULP, SIMD enabled) so ordering between tests doesn't
    // matter, but they are not safe to run concurrently with each other.

    #[test]
    fn default_backend_is_scalar_libm() {
        assert_eq!(select_backend(), SinCosBackend::ScalarLibm);
    }

    #[test]
    fn relaxed_ulp_mode_with_simd_enabled_selects_batched_backend() {
        set_ulp_mode(UlpMode::Ulp35);
        assert_eq!(select_backend(), SinCosBackend::SimdBatched);
        set_ulp_mode(UlpMode::Ulp10);
    }

    #[test]
    fn disabling_simd_forces_scalar_backend_regardless_of_ulp_mode() {
        set_ulp_mode(UlpMode::Ulp35);
        set_simd_enabled(false);
        assert_eq!(select_backend(), SinCosBackend::ScalarLibm);
        set_simd_enabled(true);
        set_ulp_mode(UlpMode::Ulp10);
    }
}
