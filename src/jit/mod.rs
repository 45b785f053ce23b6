//! JIT subsystem (§4.7-§4.11): lowers a typechecked DSL kernel to IR,
//! emits C, and compiles/caches/loads it as a shared object.

pub mod bridge;
pub mod cache;
pub mod emit;
pub mod ir;

pub use cache::LoadedKernel;
pub use ir::Ir;
