//! On-disk JIT cache and loader (§4.9): hashes the cache key, manages
//! `kernel_<hex>.{c,meta,so,lock}` under `$TMPDIR/miniexpr-jit/`, and keeps
//! an in-process positive/negative table so repeated compiles of the same
//! kernel within a process don't re-touch disk.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use sha3::{Digest, Sha3_256};

use crate::dsl::ast::{CompilerBackend, FpMode};
use crate::error::CompileError;
use crate::jit::emit::EmittedSource;
use crate::jit::ir::Ir;

/// ABI version stamped into every metadata file; bumping it invalidates
/// every entry written by a previous build of this crate.
const ABI_VERSION: u32 = 1;

const NEGATIVE_COOLDOWN: Duration = Duration::from_secs(30);

/// A successfully loaded kernel, shared between an `Expr` and the cache
/// table. Reference-counted implicitly via `Arc` at the call site in
/// `plan.rs`; here it owns the `dlopen`'d handle directly.
pub struct LoadedKernel {
    pub cache_key: u64,
    pub entry_symbol: String,
    #[cfg(feature = "jit")]
    library: libloading::Library,
    pub owns_library: bool,
}

impl LoadedKernel {
    /// Resolve and invoke the kernel entry point. Caller guarantees the
    /// pointer/nitems contract matches the kernel ABI (§6.4).
    ///
    /// # Safety
    /// `inputs` must contain one valid pointer per canonical parameter,
    /// `output` must be writable for `nitems` output-dtype elements.
    #[cfg(feature = "jit")]
    pub unsafe fn invoke(&self, inputs: &[*const u8], output: *mut u8, nitems: i64) -> Result<(), CompileError> {
        type KernelFn = unsafe extern "C" fn(*const *const u8, *mut u8, i64);
        let symbol: libloading::Symbol<KernelFn> = self
            .library
            .get(self.entry_symbol.as_bytes())
            .map_err(|e| CompileError::Internal(format!("failed to resolve kernel symbol: {e}")))?;
        symbol(inputs.as_ptr(), output, nitems);
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Positive,
    Negative,
}

struct CacheEntry {
    state: EntryState,
    cooldown_until: Option<Instant>,
}

static IN_PROCESS_TABLE: Lazy<Mutex<HashMap<u64, CacheEntry>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn cache_key(ir: &Ir, compiler_tag: &str, extra_cflags: &str) -> u64 {
    let mut hasher = Sha3_256::new();
    hasher.update(ir.fingerprint.to_be_bytes());
    hasher.update(match ir.dialect {
        crate::dsl::ast::Dialect::Vector => b"vector".as_slice(),
        crate::dsl::ast::Dialect::Element => b"element".as_slice(),
    });
    hasher.update(fp_mode_tag(ir.fp_mode).as_bytes());
    hasher.update(compiler_tag.as_bytes());
    hasher.update(extra_cflags.as_bytes());
    hasher.update(ABI_VERSION.to_be_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().unwrap())
}

fn fp_mode_tag(mode: FpMode) -> &'static str {
    match mode {
        FpMode::Strict => "strict",
        FpMode::Contract => "contract",
        FpMode::Fast => "fast",
    }
}

fn cache_dir() -> PathBuf {
    let tmp = std::env::var_os("TMPDIR").map(PathBuf::from).unwrap_or_else(std::env::temp_dir);
    tmp.join("miniexpr-jit")
}

struct Paths {
    source: PathBuf,
    meta: PathBuf,
    library: PathBuf,
    lock: PathBuf,
}

fn paths_for(dir: &Path, key: u64) -> Paths {
    let hex = format!("{key:016x}");
    let ext = if cfg!(target_os = "macos") { "dylib" } else { "so" };
    Paths {
        source: dir.join(format!("kernel_{hex}.c")),
        meta: dir.join(format!("kernel_{hex}.meta")),
        library: dir.join(format!("kernel_{hex}.{ext}")),
        lock: dir.join(format!("kernel_{hex}.lock")),
    }
}

/// Serialized metadata record (§4.9): every field must match the current
/// plan and the on-disk artifact on reopen, or the entry is invalidated.
struct Metadata {
    abi_version: u32,
    ir_fingerprint: u64,
    compiler_tag: String,
    fp_mode: String,
    symbol_name: String,
    library_relpath: String,
    library_size: u64,
    library_hash: String,
}

impl Metadata {
    fn encode(&self) -> String {
        format!(
            "abi_version={}\nir_fingerprint={:016x}\ncompiler_tag={}\nfp_mode={}\nsymbol_name={}\nlibrary_relpath={}\nlibrary_size={}\nlibrary_hash={}\n",
            self.abi_version,
            self.ir_fingerprint,
            self.compiler_tag,
            self.fp_mode,
            self.symbol_name,
            self.library_relpath,
            self.library_size,
            self.library_hash,
        )
    }

    fn decode(text: &str) -> Option<Metadata> {
        let mut fields = HashMap::new();
        for line in text.lines() {
            let (k, v) = line.split_once('=')?;
            fields.insert(k.to_string(), v.to_string());
        }
        Some(Metadata {
            abi_version: fields.get("abi_version")?.parse().ok()?,
            ir_fingerprint: u64::from_str_radix(fields.get("ir_fingerprint")?, 16).ok()?,
            compiler_tag: fields.get("compiler_tag")?.clone(),
            fp_mode: fields.get("fp_mode")?.clone(),
            symbol_name: fields.get("symbol_name")?.clone(),
            library_relpath: fields.get("library_relpath")?.clone(),
            library_size: fields.get("library_size")?.parse().ok()?,
            library_hash: fields.get("library_hash")?.clone(),
        })
    }

    fn matches_artifact(&self, ir: &Ir, library_path: &Path) -> bool {
        if self.abi_version != ABI_VERSION || self.ir_fingerprint != ir.fingerprint || self.fp_mode != fp_mode_tag(ir.fp_mode) {
            return false;
        }
        let Ok(bytes) = std::fs::read(library_path) else { return false };
        bytes.len() as u64 == self.library_size && hash_bytes(&bytes) == self.library_hash
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Load or compile the kernel for `ir`, honoring `ME_DSL_JIT` /
/// `ME_DSL_JIT_POS_CACHE` from `config`. Returns `Ok(None)` whenever JIT is
/// unavailable or the compile failed; callers fall back to the
/// interpreter without treating this as fatal (§7, §4.9).
pub fn load_or_compile(ir: &Ir, config: &crate::config::RuntimeConfig) -> Option<LoadedKernel> {
    if !config.jit_enabled {
        return None;
    }
    let compiler_tag = match ir.compiler {
        CompilerBackend::Cc => config.cc.as_deref().unwrap_or("cc"),
        CompilerBackend::Tcc => "tcc",
    };
    let key = cache_key(ir, compiler_tag, &config.extra_cflags);

    {
        let table = IN_PROCESS_TABLE.lock().unwrap();
        if let Some(entry) = table.get(&key) {
            match entry.state {
                EntryState::Negative => {
                    if entry.cooldown_until.is_some_and(|t| Instant::now() < t) {
                        return None;
                    }
                }
                EntryState::Positive => {}
            }
        }
    }

    let dir = cache_dir();
    if std::fs::create_dir_all(&dir).is_err() {
        return None;
    }
    let paths = paths_for(&dir, key);

    let _lock = acquire_lock(&paths.lock);

    if config.jit_positive_cache_reuse {
        if let Some(kernel) = try_reopen(ir, &paths, key) {
            mark(key, EntryState::Positive, None);
            return Some(kernel);
        }
    }

    let emitted = match crate::jit::emit::emit(ir, &format!("{key:016x}")) {
        Ok(e) => e,
        Err(_) => {
            mark(key, EntryState::Negative, Some(NEGATIVE_COOLDOWN));
            return None;
        }
    };

    match compile_and_load(ir, &emitted, &paths, compiler_tag, key) {
        Some(kernel) => {
            mark(key, EntryState::Positive, None);
            Some(kernel)
        }
        None => {
            mark(key, EntryState::Negative, Some(NEGATIVE_COOLDOWN));
            None
        }
    }
}

fn mark(key: u64, state: EntryState, cooldown: Option<Duration>) {
    let mut table = IN_PROCESS_TABLE.lock().unwrap();
    table.insert(key, CacheEntry { state, cooldown_until: cooldown.map(|d| Instant::now() + d) });
}

/// Advisory cross-process lock: `create_new` on the lock file serializes
/// concurrent compiles for the same key, with a short spin-wait for
/// losers per §4.9/§4.12. Released on drop by removing the file.
struct FileLock {
    path: PathBuf,
    held: bool,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.held {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn acquire_lock(path: &Path) -> FileLock {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => return FileLock { path: path.to_path_buf(), held: true },
            Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(10)),
            Err(_) => return FileLock { path: path.to_path_buf(), held: false },
        }
    }
}

fn try_reopen(ir: &Ir, paths: &Paths, key: u64) -> Option<LoadedKernel> {
    let meta_text = std::fs::read_to_string(&paths.meta).ok()?;
    let meta = Metadata::decode(&meta_text)?;
    if !meta.matches_artifact(ir, &paths.library) {
        return None;
    }
    open_library(&paths.library, &meta.symbol_name, key)
}

fn compile_and_load(ir: &Ir, emitted: &EmittedSource, paths: &Paths, compiler_tag: &str, key: u64) -> Option<LoadedKernel> {
    std::fs::write(&paths.source, &emitted.source).ok()?;

    let cc = std::env::var("CC").unwrap_or_else(|_| compiler_tag.to_string());
    let cflags = std::env::var("CFLAGS").unwrap_or_default();
    let mut cmd = std::process::Command::new(&cc);
    cmd.arg("-shared").arg("-fPIC").arg("-O2");
    for flag in cflags.split_whitespace() {
        cmd.arg(flag);
    }
    cmd.arg("-o").arg(&paths.library).arg(&paths.source);

    tracing::debug!(compiler = %cc, source = %paths.source.display(), "invoking JIT compiler");
    let status = cmd.status().ok()?;
    if !status.success() {
        tracing::warn!(compiler = %cc, "JIT compile failed; falling back to interpreter");
        return None;
    }

    let bytes = std::fs::read(&paths.library).ok()?;
    let meta = Metadata {
        abi_version: ABI_VERSION,
        ir_fingerprint: ir.fingerprint,
        compiler_tag: compiler_tag.to_string(),
        fp_mode: fp_mode_tag(ir.fp_mode).to_string(),
        symbol_name: emitted.entry_symbol.clone(),
        library_relpath: paths.library.file_name().unwrap().to_string_lossy().into_owned(),
        library_size: bytes.len() as u64,
        library_hash: hash_bytes(&bytes),
    };
    let mut f = std::fs::File::create(&paths.meta).ok()?;
    f.write_all(meta.encode().as_bytes()).ok()?;

    open_library(&paths.library, &emitted.entry_symbol, key)
}

#[cfg(feature = "jit")]
fn open_library(path: &Path, symbol_name: &str, key: u64) -> Option<LoadedKernel> {
    // Loaded with the platform default (RTLD_GLOBAL-less) flags; the
    // emitted kernel only calls the frozen `me_jit_*` bridge symbols,
    // which are resolved by the dynamic linker against this process's
    // own exported symbol table.
    let library = unsafe { libloading::Library::new(path).ok()? };
    Some(LoadedKernel { cache_key: key, entry_symbol: symbol_name.to_string(), library, owns_library: true })
}

#[cfg(not(feature = "jit"))]
fn open_library(_path: &Path, _symbol_name: &str, _key: u64) -> Option<LoadedKernel> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trips_through_text_encoding() {
        let meta = Metadata {
            abi_version: 1,
            ir_fingerprint: 0xdeadbeefcafef00d,
            compiler_tag: "cc".into(),
            fp_mode: "strict".into(),
            symbol_name: "me_kernel_deadbeef".into(),
            library_relpath: "kernel_deadbeef.so".into(),
            library_size: 4096,
            library_hash: "abc123".into(),
        };
        let decoded = Metadata::decode(&meta.encode()).unwrap();
        assert_eq!(decoded.ir_fingerprint, meta.ir_fingerprint);
        assert_eq!(decoded.symbol_name, meta.symbol_name);
        assert_eq!(decoded.library_size, meta.library_size);
    }

    #[test]
    fn paths_use_lowercase_hex_key_and_platform_extension() {
        let dir = PathBuf::from("/tmp/miniexpr-jit");
        let p = paths_for(&dir, 0x00ff);
        assert_eq!(p.source.file_name().unwrap(), "kernel_00000000000000ff.c");
        assert_eq!(p.lock.file_name().unwrap(), "kernel_00000000000000ff.lock");
    }
}
