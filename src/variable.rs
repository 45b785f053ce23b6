//! Named input variable bindings (§3 `Variable`).

use crate::dtype::DType;

/// A named input, with its element dtype and (for `String`) the
/// mandatory per-cell item size. The data pointer is supplied separately
/// at each evaluation call (`eval`/`eval_nd`), not at compile time: a
/// `Variable` here only fixes the *shape* of the binding the compiler
/// type-checks against.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub dtype: DType,
    /// Number of UCS-4 code points per cell; required when `dtype ==
    /// DType::String`, ignored otherwise.
    pub item_size: Option<usize>,
}

impl Variable {
    pub fn new(name: impl Into<String>, dtype: DType) -> Self {
        Variable { name: name.into(), dtype, item_size: None }
    }

    pub fn with_item_size(mut self, item_size: usize) -> Self {
        self.item_size = Some(item_size);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::CompileError> {
        if self.dtype == DType::String && self.item_size.unwrap_or(0) == 0 {
            return Err(crate::error::CompileError::Unsupported(format!(
                "variable '{}' has dtype String but no positive item_size",
                self.name
            )));
        }
        Ok(())
    }
}
