//! Native library wrapper.
//!
//! Loads the streaming-compression shared library, resolves its export
//! table once, and exposes it behind the [`CompressionBackend`] seam so the
//! manager (and its tests) never touch raw symbols directly.
//!
//! Discovery order: explicit path → `VNLIB_COMPRESS_DLL_PATH` environment
//! variable → platform default name `vnlib_compress`. The process-wide
//! handle lives until exit.

#![allow(unsafe_code)]

use std::os::raw::c_void;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing::debug;

use crate::error::{CompressionError, Result};
use crate::ffi::{map_native_status, CompressionOperation, MethodTable};

/// Environment variable consulted when no explicit path is configured.
pub const COMPRESS_LIB_ENV: &str = "VNLIB_COMPRESS_DLL_PATH";

/// Default library name resolved through the platform loader.
pub const DEFAULT_LIB_NAME: &str = "vnlib_compress";

/// Compression methods as advertised by the native library (bit flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CompressionMethod {
    /// No compression.
    None = 0,
    /// RFC 1952 gzip.
    Gzip = 1,
    /// RFC 1951 deflate.
    Deflate = 2,
    /// Brotli.
    Brotli = 4,
}

impl CompressionMethod {
    /// Flag value used in the advertised-method bitset.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self as u32
    }
}

/// Bitset of methods the loaded library reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSet(u32);

impl MethodSet {
    /// Wrap a raw advertised bitset.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bitset value.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether `method` is advertised.
    #[must_use]
    pub const fn contains(self, method: CompressionMethod) -> bool {
        method.bits() != 0 && self.0 & method.bits() == method.bits()
    }

    /// Whether the library advertises nothing at all.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Compression levels understood by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "i32")]
#[repr(i32)]
pub enum CompressionLevel {
    /// Store without compressing.
    NoCompression = 0,
    /// Favor speed.
    #[default]
    Fastest = 1,
    /// Balanced.
    Optimal = 2,
    /// Favor ratio.
    SmallestSize = 3,
}

impl TryFrom<i32> for CompressionLevel {
    type Error = CompressionError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::NoCompression),
            1 => Ok(Self::Fastest),
            2 => Ok(Self::Optimal),
            3 => Ok(Self::SmallestSize),
            _ => Err(CompressionError::Config(format!(
                "unknown compression level {value}"
            ))),
        }
    }
}

/// Opaque handle to a native state allocation.
///
/// Not thread-safe; per-state use must be serialized by the owner, which
/// the manager enforces through `&mut` access.
#[derive(Debug)]
pub struct StateHandle(*mut c_void);

// SAFETY: the native state carries no thread affinity; the manager
// serializes all use per handle.
unsafe impl Send for StateHandle {}

impl StateHandle {
    /// Wrap a raw state pointer produced by a backend.
    ///
    /// The backend owns the pointed-to allocation and must release it in
    /// its `free_state`.
    #[must_use]
    pub const fn from_ptr(ptr: *mut c_void) -> Self {
        Self(ptr)
    }

    /// Raw pointer for native calls.
    #[must_use]
    pub const fn as_ptr(&self) -> *mut c_void {
        self.0
    }
}

/// Seam between the compressor manager and the native method table.
///
/// The production implementation is [`NativeLibrary`]; tests substitute an
/// in-process backend to pin lifecycle and error-mapping behavior.
pub trait CompressionBackend: Send + Sync {
    /// Bitset of methods the library advertises.
    fn supported_methods(&self) -> Result<MethodSet>;

    /// Allocate a long-lived native state.
    fn alloc_state(&self) -> Result<StateHandle>;

    /// Free a native state (and any compressor still attached to it).
    fn free_state(&self, state: StateHandle) -> Result<()>;

    /// Allocate a compressor of `method`/`level` inside `state`; returns
    /// the compressor's preferred block size.
    fn alloc_compressor(
        &self,
        state: &StateHandle,
        method: CompressionMethod,
        level: CompressionLevel,
    ) -> Result<u32>;

    /// Free only the compressor, preserving the state.
    fn free_compressor(&self, state: &StateHandle) -> Result<()>;

    /// Run one compression operation; the native side fills the counters.
    fn compress(&self, state: &StateHandle, op: &mut CompressionOperation) -> Result<()>;

    /// Preferred block size of the compressor in `state`.
    fn block_size(&self, state: &StateHandle) -> Result<u32>;

    /// Worst-case output size for `input_len` bytes.
    fn max_compressed_size(&self, state: &StateHandle, input_len: u64, flush: bool)
        -> Result<u64>;
}

/// The loaded shared library plus its resolved export table.
pub struct NativeLibrary {
    table: MethodTable,
    // Dropped last: the table's function pointers borrow from it.
    _lib: libloading::Library,
}

static SHARED: OnceCell<NativeLibrary> = OnceCell::new();

impl NativeLibrary {
    /// Load the library via the discovery chain and resolve all exports.
    ///
    /// # Errors
    ///
    /// `Load` when the library or a symbol cannot be resolved.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::discover(explicit_path);
        debug!("[Compress] Loading native library from {}", path.display());
        // SAFETY: library initialization runs arbitrary native code; the
        // operator controls the path through configuration.
        let lib = unsafe { libloading::Library::new(&path) }?;
        let table = unsafe { MethodTable::resolve(&lib)? };
        Ok(Self { table, _lib: lib })
    }

    /// Process-wide handle, loaded on first use via the discovery chain.
    ///
    /// # Errors
    ///
    /// `Load` when the first initialization fails; later calls retry.
    pub fn shared() -> Result<&'static Self> {
        SHARED.get_or_try_init(|| Self::load(None))
    }

    fn discover(explicit_path: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit_path.filter(|p| !p.as_os_str().is_empty()) {
            return path.to_path_buf();
        }
        if let Ok(env_path) = std::env::var(COMPRESS_LIB_ENV) {
            if !env_path.is_empty() {
                return PathBuf::from(env_path);
            }
        }
        PathBuf::from(libloading::library_filename(DEFAULT_LIB_NAME))
    }
}

impl CompressionBackend for NativeLibrary {
    fn supported_methods(&self) -> Result<MethodSet> {
        // SAFETY: symbol resolved against the declared signature.
        let bits = unsafe { (self.table.get_supported_compressors)() };
        let bits = map_native_status(i64::from(bits), "GetSupportedCompressors")?;
        Ok(MethodSet::from_bits(bits as u32))
    }

    fn alloc_state(&self) -> Result<StateHandle> {
        // SAFETY: symbol resolved against the declared signature.
        let ptr = unsafe { (self.table.alloc_state)() };
        if ptr.is_null() {
            return Err(CompressionError::OutOfMemory);
        }
        Ok(StateHandle(ptr))
    }

    fn free_state(&self, state: StateHandle) -> Result<()> {
        // SAFETY: the handle came from alloc_state and is consumed here.
        let code = unsafe { (self.table.free_state)(state.as_ptr()) };
        map_native_status(i64::from(code), "CompressionFreeState").map(|_| ())
    }

    fn alloc_compressor(
        &self,
        state: &StateHandle,
        method: CompressionMethod,
        level: CompressionLevel,
    ) -> Result<u32> {
        // SAFETY: state is a live allocation owned by the caller.
        let code =
            unsafe { (self.table.alloc_compressor)(state.as_ptr(), method as i32, level as i32) };
        let block = map_native_status(code, "CompressionAllocCompressor")?;
        u32::try_from(block).map_err(|_| CompressionError::Overflow("compressor block size"))
    }

    fn free_compressor(&self, state: &StateHandle) -> Result<()> {
        // SAFETY: state is a live allocation owned by the caller.
        let code = unsafe { (self.table.free_compressor)(state.as_ptr()) };
        map_native_status(i64::from(code), "CompressionFreeCompressor").map(|_| ())
    }

    fn compress(&self, state: &StateHandle, op: &mut CompressionOperation) -> Result<()> {
        // SAFETY: both operation buffers are caller-pinned slices for the
        // duration of this synchronous call.
        let code = unsafe { (self.table.compress_block)(state.as_ptr(), op) };
        map_native_status(i64::from(code), "CompressBlock").map(|_| ())
    }

    fn block_size(&self, state: &StateHandle) -> Result<u32> {
        // SAFETY: state is a live allocation owned by the caller.
        let code = unsafe { (self.table.get_compressor_block_size)(state.as_ptr()) };
        let block = map_native_status(code, "GetCompressorBlockSize")?;
        u32::try_from(block).map_err(|_| CompressionError::Overflow("compressor block size"))
    }

    fn max_compressed_size(
        &self,
        state: &StateHandle,
        input_len: u64,
        flush: bool,
    ) -> Result<u64> {
        // SAFETY: state is a live allocation owned by the caller.
        let code =
            unsafe { (self.table.get_compressed_size)(state.as_ptr(), input_len, i32::from(flush)) };
        let size = map_native_status(code, "GetCompressedSize")?;
        Ok(size as u64)
    }
}
