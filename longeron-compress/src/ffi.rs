//! Native compression ABI.
//!
//! The operation struct and exported-function signatures are bit-exact
//! against the native streaming-compression library. All exports are cdecl
//! with fixed-width integer parameters; any negative return is a status
//! from the table below, any non-negative return carries data.

#![allow(unsafe_code)]

use std::os::raw::c_void;

use crate::error::{CompressionError, Result};

/// Wire-identical operation block passed to the native library.
///
/// Layout is sequential with native alignment. Both buffer pointers must
/// stay pinned for the duration of the native call; the native side fills
/// `bytes_read` and `bytes_written`.
#[repr(C)]
#[derive(Debug)]
pub struct CompressionOperation {
    /// Input buffer, may be null when `input_size` is 0.
    pub input: *const u8,
    /// Output buffer.
    pub output: *mut u8,
    /// 0 = compress only; non-zero = flush and finalize this block.
    pub flush: i32,
    /// Valid bytes at `input`.
    pub input_size: u32,
    /// Capacity at `output`.
    pub output_size: u32,
    /// Out: input bytes consumed (≤ `input_size`).
    pub bytes_read: u32,
    /// Out: output bytes produced (≤ `output_size`).
    pub bytes_written: u32,
}

// Status codes published by the native library.
pub const ERR_INVALID_PTR: i64 = -1;
pub const ERR_OUT_OF_MEMORY: i64 = -2;
pub const ERR_COMP_TYPE_NOT_SUPPORTED: i64 = -9;
pub const ERR_COMP_LEVEL_NOT_SUPPORTED: i64 = -10;
pub const ERR_INVALID_INPUT_DATA: i64 = -11;
pub const ERR_INVALID_OUTPUT_DATA: i64 = -12;
pub const ERR_COMPRESSION_FAILED: i64 = -13;
pub const ERR_COMPRESSION_OVERFLOW: i64 = -14;
pub const ERR_GZ_INVALID_STATE: i64 = -16;
pub const ERR_GZ_OVERFLOW: i64 = -17;
pub const ERR_BR_INVALID_STATE: i64 = -24;

pub(crate) type GetSupportedCompressorsFn = unsafe extern "C" fn() -> i32;
pub(crate) type GetCompressorBlockSizeFn = unsafe extern "C" fn(state: *const c_void) -> i64;
pub(crate) type GetCompressorTypeFn = unsafe extern "C" fn(state: *const c_void) -> i32;
pub(crate) type GetCompressorLevelFn = unsafe extern "C" fn(state: *const c_void) -> i32;
pub(crate) type GetCompressedSizeFn =
    unsafe extern "C" fn(state: *const c_void, length: u64, flush: i32) -> i64;
pub(crate) type CompressBlockFn =
    unsafe extern "C" fn(state: *const c_void, operation: *mut CompressionOperation) -> i32;
pub(crate) type CompressionAllocStateFn = unsafe extern "C" fn() -> *mut c_void;
pub(crate) type CompressionFreeStateFn = unsafe extern "C" fn(state: *mut c_void) -> i32;
pub(crate) type CompressionAllocCompressorFn =
    unsafe extern "C" fn(state: *mut c_void, comp_type: i32, level: i32) -> i64;
pub(crate) type CompressionFreeCompressorFn = unsafe extern "C" fn(state: *mut c_void) -> i32;

/// Exported functions resolved from the loaded library, by published name.
pub(crate) struct MethodTable {
    pub get_supported_compressors: GetSupportedCompressorsFn,
    pub get_compressor_block_size: GetCompressorBlockSizeFn,
    #[allow(dead_code)]
    pub get_compressor_type: GetCompressorTypeFn,
    #[allow(dead_code)]
    pub get_compressor_level: GetCompressorLevelFn,
    pub get_compressed_size: GetCompressedSizeFn,
    pub compress_block: CompressBlockFn,
    pub alloc_state: CompressionAllocStateFn,
    pub free_state: CompressionFreeStateFn,
    pub alloc_compressor: CompressionAllocCompressorFn,
    pub free_compressor: CompressionFreeCompressorFn,
}

impl MethodTable {
    /// Resolve the full export set.
    ///
    /// # Safety
    ///
    /// The library must actually export these names with the declared
    /// signatures; a mismatch is undefined behavior on first call.
    pub(crate) unsafe fn resolve(lib: &libloading::Library) -> Result<Self> {
        Ok(Self {
            get_supported_compressors: *lib.get(b"GetSupportedCompressors\0")?,
            get_compressor_block_size: *lib.get(b"GetCompressorBlockSize\0")?,
            get_compressor_type: *lib.get(b"GetCompressorType\0")?,
            get_compressor_level: *lib.get(b"GetCompressorLevel\0")?,
            get_compressed_size: *lib.get(b"GetCompressedSize\0")?,
            compress_block: *lib.get(b"CompressBlock\0")?,
            alloc_state: *lib.get(b"CompressionAllocState\0")?,
            free_state: *lib.get(b"CompressionFreeState\0")?,
            alloc_compressor: *lib.get(b"CompressionAllocCompressor\0")?,
            free_compressor: *lib.get(b"CompressionFreeCompressor\0")?,
        })
    }
}

/// Translate a native status into a typed error, passing non-negative
/// values through as data.
///
/// # Errors
///
/// The mapped error for every documented negative code; `Unrecognized`
/// for anything else below zero.
pub fn map_native_status(code: i64, context: &'static str) -> Result<i64> {
    if code >= 0 {
        return Ok(code);
    }
    Err(match code {
        ERR_INVALID_PTR => CompressionError::InvalidState("invalid pointer"),
        ERR_OUT_OF_MEMORY => CompressionError::OutOfMemory,
        ERR_COMP_TYPE_NOT_SUPPORTED => CompressionError::NotSupported("compression method"),
        ERR_COMP_LEVEL_NOT_SUPPORTED => CompressionError::NotSupported("compression level"),
        ERR_INVALID_INPUT_DATA => CompressionError::InvalidArgument("invalid input data"),
        ERR_INVALID_OUTPUT_DATA => CompressionError::InvalidArgument("invalid output data"),
        ERR_COMPRESSION_FAILED => CompressionError::Corrupted("compression failed"),
        ERR_COMPRESSION_OVERFLOW => CompressionError::Overflow("compression overflow"),
        ERR_GZ_INVALID_STATE => CompressionError::InvalidState("gzip state"),
        ERR_GZ_OVERFLOW => CompressionError::Overflow("gzip overflow"),
        ERR_BR_INVALID_STATE => CompressionError::InvalidState("brotli state"),
        _ => CompressionError::Unrecognized { code, context },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use longeron_core::ErrorKind;

    #[test]
    fn documented_codes_map_to_kinds() {
        let table = [
            (ERR_INVALID_PTR, ErrorKind::InvalidState),
            (ERR_OUT_OF_MEMORY, ErrorKind::OutOfMemory),
            (ERR_COMP_TYPE_NOT_SUPPORTED, ErrorKind::NotSupported),
            (ERR_COMP_LEVEL_NOT_SUPPORTED, ErrorKind::NotSupported),
            (ERR_INVALID_INPUT_DATA, ErrorKind::InvalidArgument),
            (ERR_INVALID_OUTPUT_DATA, ErrorKind::InvalidArgument),
            (ERR_COMPRESSION_FAILED, ErrorKind::Corrupted),
            (ERR_COMPRESSION_OVERFLOW, ErrorKind::Overflow),
            (ERR_GZ_INVALID_STATE, ErrorKind::InvalidState),
            (ERR_GZ_OVERFLOW, ErrorKind::Overflow),
            (ERR_BR_INVALID_STATE, ErrorKind::InvalidState),
        ];
        for (code, kind) in table {
            let err = map_native_status(code, "test").unwrap_err();
            assert_eq!(err.kind(), kind, "code {code} mapped to {:?}", err.kind());
        }
    }

    #[test]
    fn non_negative_passes_through() {
        assert_eq!(map_native_status(0, "test").unwrap(), 0);
        assert_eq!(map_native_status(32 * 1024, "test").unwrap(), 32 * 1024);
    }

    #[test]
    fn unknown_negative_is_unrecognized() {
        let err = map_native_status(-99, "CompressBlock").unwrap_err();
        assert!(matches!(
            err,
            CompressionError::Unrecognized { code: -99, .. }
        ));
    }

    #[test]
    fn operation_layout_matches_native_expectations() {
        use std::mem::{offset_of, size_of};

        // Pointer pair first, then the five 32-bit fields in order.
        assert_eq!(offset_of!(CompressionOperation, input), 0);
        assert_eq!(
            offset_of!(CompressionOperation, output),
            size_of::<*const u8>()
        );
        let base = 2 * size_of::<*const u8>();
        assert_eq!(offset_of!(CompressionOperation, flush), base);
        assert_eq!(offset_of!(CompressionOperation, input_size), base + 4);
        assert_eq!(offset_of!(CompressionOperation, output_size), base + 8);
        assert_eq!(offset_of!(CompressionOperation, bytes_read), base + 12);
        assert_eq!(offset_of!(CompressionOperation, bytes_written), base + 16);
    }
}
