//! Centralized environment parsing (§6.2): a `RuntimeConfig` snapshot taken
//! once per compile/load rather than re-reading `std::env` scattered across
//! the JIT cache path.

/// A snapshot of the environment variables that gate JIT behavior. Taken
/// fresh by each call into [`crate::jit::cache::load_or_compile`] so tests
/// can vary `ME_DSL_JIT` between compiles within one process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub jit_enabled: bool,
    pub jit_positive_cache_reuse: bool,
    pub cc: Option<String>,
    pub extra_cflags: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        RuntimeConfig {
            jit_enabled: env_flag("ME_DSL_JIT", true),
            jit_positive_cache_reuse: env_flag("ME_DSL_JIT_POS_CACHE", false),
            cc: std::env::var("CC").ok(),
            extra_cflags: std::env::var("CFLAGS").unwrap_or_default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::from_env()
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v != "0",
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_flag_defaults_when_unset() {
        std::env::remove_var("ME_DSL_JIT_TEST_PROBE");
        assert!(env_flag("ME_DSL_JIT_TEST_PROBE", true));
        assert!(!env_flag("ME_DSL_JIT_TEST_PROBE", false));
    }

    #[test]
    fn env_flag_honors_explicit_zero() {
        std::env::set_var("ME_DSL_JIT_TEST_PROBE_2", "0");
        assert!(!env_flag("ME_DSL_JIT_TEST_PROBE_2", true));
        std::env::remove_var("ME_DSL_JIT_TEST_PROBE_2");
    }
}
