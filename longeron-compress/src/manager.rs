//! Compressor manager.
//!
//! Adapts the native per-stream compressor to the host's streaming
//! interface, with the versioned memory lifecycle:
//!
//! - **Legacy callers**: `init_compressor` allocates state and compressor
//!   together; `deinit_compressor` frees everything.
//! - **Commit API callers**: `commit_memory` allocates the state once;
//!   `init`/`deinit` then only touch the compressor, and the state lives
//!   until `decommit_memory`.
//!
//! `supports_commit_api` on the state wrapper is the single source of truth
//! for which behavior `deinit` takes.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::config::CompressionConfig;
use crate::error::{CompressionError, Result};
use crate::ffi::CompressionOperation;
use crate::native::{
    CompressionBackend, CompressionLevel, CompressionMethod, MethodSet, NativeLibrary, StateHandle,
};

/// Counters reported by one compression operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionResult {
    /// Input bytes the native library consumed.
    pub bytes_read: usize,
    /// Output bytes the native library produced.
    pub bytes_written: usize,
}

/// Opaque per-stream compressor state container.
///
/// Holds the native state handle and the two lifecycle flags. Releases
/// whatever is still allocated on drop, panic included.
pub struct Compressor {
    backend: Arc<dyn CompressionBackend>,
    state: Option<StateHandle>,
    instance_allocated: bool,
    supports_commit_api: bool,
    block_size: u32,
}

impl Compressor {
    /// Whether a native compressor is currently allocated.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.instance_allocated
    }

    /// Whether this state follows the commit lifecycle.
    #[must_use]
    pub const fn supports_commit_api(&self) -> bool {
        self.supports_commit_api
    }

    /// Preferred block size reported by the last successful init.
    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    fn state(&self) -> Result<&StateHandle> {
        self.state
            .as_ref()
            .ok_or(CompressionError::InvalidState("no native state allocated"))
    }
}

impl Drop for Compressor {
    fn drop(&mut self) {
        if self.instance_allocated {
            if let Some(state) = &self.state {
                if let Err(e) = self.backend.free_compressor(state) {
                    warn!("[Compress] Leaked compressor on drop: {e}");
                }
            }
            self.instance_allocated = false;
        }
        if let Some(state) = self.state.take() {
            if let Err(e) = self.backend.free_state(state) {
                warn!("[Compress] Leaked native state on drop: {e}");
            }
        }
    }
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("state_allocated", &self.state.is_some())
            .field("instance_allocated", &self.instance_allocated)
            .field("supports_commit_api", &self.supports_commit_api)
            .field("block_size", &self.block_size)
            .finish()
    }
}

/// Lifecycle and operation front-end over a [`CompressionBackend`].
pub struct CompressorManager {
    backend: Arc<dyn CompressionBackend>,
    level: CompressionLevel,
}

impl CompressorManager {
    /// Create a manager over an explicit backend.
    #[must_use]
    pub fn new(backend: Arc<dyn CompressionBackend>, level: CompressionLevel) -> Self {
        Self { backend, level }
    }

    /// Create a manager over the native library selected by `config`.
    ///
    /// With no `lib_path` the process-wide handle is used (env var or
    /// default name); an explicit path gets its own load.
    ///
    /// # Errors
    ///
    /// `Load` when the library cannot be loaded or lacks an export.
    pub fn from_config(config: &CompressionConfig) -> Result<Self> {
        let backend: Arc<dyn CompressionBackend> = match &config.lib_path {
            Some(path) => Arc::new(NativeLibrary::load(Some(path.as_path()))?),
            None => {
                // Keep the process-wide handle; wrap the static borrow.
                struct Shared(&'static NativeLibrary);
                impl CompressionBackend for Shared {
                    fn supported_methods(&self) -> Result<MethodSet> {
                        self.0.supported_methods()
                    }
                    fn alloc_state(&self) -> Result<StateHandle> {
                        self.0.alloc_state()
                    }
                    fn free_state(&self, state: StateHandle) -> Result<()> {
                        self.0.free_state(state)
                    }
                    fn alloc_compressor(
                        &self,
                        state: &StateHandle,
                        method: CompressionMethod,
                        level: CompressionLevel,
                    ) -> Result<u32> {
                        self.0.alloc_compressor(state, method, level)
                    }
                    fn free_compressor(&self, state: &StateHandle) -> Result<()> {
                        self.0.free_compressor(state)
                    }
                    fn compress(
                        &self,
                        state: &StateHandle,
                        op: &mut CompressionOperation,
                    ) -> Result<()> {
                        self.0.compress(state, op)
                    }
                    fn block_size(&self, state: &StateHandle) -> Result<u32> {
                        self.0.block_size(state)
                    }
                    fn max_compressed_size(
                        &self,
                        state: &StateHandle,
                        input_len: u64,
                        flush: bool,
                    ) -> Result<u64> {
                        self.0.max_compressed_size(state, input_len, flush)
                    }
                }
                Arc::new(Shared(NativeLibrary::shared()?))
            }
        };
        Ok(Self::new(backend, config.level))
    }

    /// Configured compression level applied at init.
    #[must_use]
    pub const fn level(&self) -> CompressionLevel {
        self.level
    }

    /// Methods the loaded library advertises.
    ///
    /// # Errors
    ///
    /// Propagates the native status translation.
    pub fn supported_methods(&self) -> Result<MethodSet> {
        self.backend.supported_methods()
    }

    /// Allocate an empty state container.
    #[must_use]
    pub fn alloc_compressor(&self) -> Compressor {
        Compressor {
            backend: self.backend.clone(),
            state: None,
            instance_allocated: false,
            supports_commit_api: false,
            block_size: 0,
        }
    }

    /// Allocate the long-lived native state once and switch the container
    /// to the commit lifecycle. Idempotent.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` when the native allocation fails.
    pub fn commit_memory(&self, compressor: &mut Compressor) -> Result<()> {
        if compressor.state.is_none() {
            compressor.state = Some(self.backend.alloc_state()?);
            trace!("[Compress] Committed native state");
        }
        compressor.supports_commit_api = true;
        Ok(())
    }

    /// Free the native state and any compressor still attached, leaving
    /// the container empty.
    ///
    /// # Errors
    ///
    /// Propagates native free failures; the container is emptied anyway.
    pub fn decommit_memory(&self, compressor: &mut Compressor) -> Result<()> {
        let mut first_error = None;
        if compressor.instance_allocated {
            if let Some(state) = &compressor.state {
                if let Err(e) = self.backend.free_compressor(state) {
                    first_error = Some(e);
                }
            }
            compressor.instance_allocated = false;
        }
        if let Some(state) = compressor.state.take() {
            if let Err(e) = self.backend.free_state(state) {
                first_error.get_or_insert(e);
            }
        }
        compressor.supports_commit_api = false;
        compressor.block_size = 0;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Allocate a native compressor of `method` at the configured level.
    ///
    /// Under the legacy lifecycle this also allocates the state; under the
    /// commit lifecycle the committed state is reused. Returns the
    /// compressor's preferred block size.
    ///
    /// # Errors
    ///
    /// `InvalidState` when already initialized; native errors otherwise.
    pub fn init_compressor(
        &self,
        compressor: &mut Compressor,
        method: CompressionMethod,
    ) -> Result<u32> {
        if compressor.instance_allocated {
            return Err(CompressionError::InvalidState(
                "compressor already initialized",
            ));
        }
        let fresh_state = compressor.state.is_none();
        if fresh_state {
            compressor.state = Some(self.backend.alloc_state()?);
        }
        let state = compressor.state.as_ref().expect("state allocated above");
        match self.backend.alloc_compressor(state, method, self.level) {
            Ok(block_size) => {
                compressor.instance_allocated = true;
                compressor.block_size = block_size;
                Ok(block_size)
            }
            Err(e) => {
                // Do not leak a state this init allocated for a legacy
                // caller that will never see it.
                if fresh_state && !compressor.supports_commit_api {
                    if let Some(state) = compressor.state.take() {
                        let _ = self.backend.free_state(state);
                    }
                }
                Err(e)
            }
        }
    }

    /// Free the native compressor.
    ///
    /// Under the commit lifecycle the state is preserved for the next
    /// init; under the legacy lifecycle the entire state is freed so older
    /// callers cannot leak.
    ///
    /// # Errors
    ///
    /// `InvalidState` without a successful init; native errors otherwise.
    pub fn deinit_compressor(&self, compressor: &mut Compressor) -> Result<()> {
        if !compressor.instance_allocated {
            return Err(CompressionError::InvalidState("compressor not initialized"));
        }
        self.backend.free_compressor(compressor.state()?)?;
        compressor.instance_allocated = false;
        compressor.block_size = 0;
        if !compressor.supports_commit_api {
            if let Some(state) = compressor.state.take() {
                self.backend.free_state(state)?;
            }
        }
        Ok(())
    }

    /// Compress one block without flushing.
    ///
    /// Both slices stay borrowed (and therefore pinned) across the
    /// synchronous native call.
    ///
    /// # Errors
    ///
    /// `InvalidState` without an initialized compressor, `Overflow` when a
    /// buffer exceeds the 32-bit ABI sizes, native errors otherwise.
    pub fn compress_block(
        &self,
        compressor: &mut Compressor,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<CompressionResult> {
        self.run_operation(compressor, input, output, false)
    }

    /// Flush the compressor, finalizing the current block.
    ///
    /// # Errors
    ///
    /// Same as [`compress_block`](Self::compress_block).
    pub fn flush(&self, compressor: &mut Compressor, output: &mut [u8]) -> Result<usize> {
        self.run_operation(compressor, &[], output, true)
            .map(|r| r.bytes_written)
    }

    /// Worst-case output size the library reports for `input_len` bytes.
    ///
    /// # Errors
    ///
    /// `InvalidState` without an initialized compressor.
    pub fn max_compressed_size(&self, compressor: &Compressor, input_len: u64) -> Result<u64> {
        if !compressor.instance_allocated {
            return Err(CompressionError::InvalidState("compressor not initialized"));
        }
        self.backend
            .max_compressed_size(compressor.state()?, input_len, true)
    }

    fn run_operation(
        &self,
        compressor: &mut Compressor,
        input: &[u8],
        output: &mut [u8],
        flush: bool,
    ) -> Result<CompressionResult> {
        if !compressor.instance_allocated {
            return Err(CompressionError::InvalidState("compressor not initialized"));
        }
        if output.is_empty() {
            return Err(CompressionError::InvalidArgument("empty output buffer"));
        }
        let input_size =
            u32::try_from(input.len()).map_err(|_| CompressionError::Overflow("input size"))?;
        let output_size =
            u32::try_from(output.len()).map_err(|_| CompressionError::Overflow("output size"))?;

        let mut op = CompressionOperation {
            input: if input.is_empty() {
                std::ptr::null()
            } else {
                input.as_ptr()
            },
            output: output.as_mut_ptr(),
            flush: i32::from(flush),
            input_size,
            output_size,
            bytes_read: 0,
            bytes_written: 0,
        };
        self.backend.compress(compressor.state()?, &mut op)?;

        if op.bytes_written > output_size || op.bytes_read > input_size {
            return Err(CompressionError::Corrupted(
                "native counters exceed buffer sizes",
            ));
        }
        Ok(CompressionResult {
            bytes_read: op.bytes_read as usize,
            bytes_written: op.bytes_written as usize,
        })
    }
}
