//! Compressor lifecycle against an in-process backend.
//!
//! The backend seam lets these tests pin the commit/legacy state machine
//! and the native status translation without the shared library present.

use std::os::raw::c_void;
use std::sync::Arc;

use longeron_compress::ffi::{map_native_status, ERR_COMP_TYPE_NOT_SUPPORTED};
use longeron_compress::{
    CompressionBackend, CompressionError, CompressionLevel, CompressionMethod,
    CompressionOperation, CompressorManager, MethodSet,
};
use longeron_compress::native::StateHandle;
use parking_lot::Mutex;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counters {
    alloc_state: usize,
    free_state: usize,
    alloc_compressor: usize,
    free_compressor: usize,
}

/// In-process stand-in for the native library.
///
/// Produces a stored "gzip" stream: compress buffers input, flush emits the
/// gzip magic followed by the buffered bytes.
#[derive(Default)]
struct MockBackend {
    counters: Mutex<Counters>,
    buffered: Mutex<Vec<u8>>,
    /// When set, `alloc_compressor` reports this native status.
    fail_alloc_with: Mutex<Option<i64>>,
}

impl MockBackend {
    fn counters(&self) -> Counters {
        *self.counters.lock()
    }

    fn sentinel_state() -> StateHandle {
        // Never dereferenced by the mock; a stable leaked allocation keeps
        // the pointer plausibly unique per state.
        let raw: *mut u64 = Box::leak(Box::new(0));
        StateHandle::from_ptr(raw.cast::<c_void>())
    }
}

impl CompressionBackend for MockBackend {
    fn supported_methods(&self) -> longeron_compress::Result<MethodSet> {
        Ok(MethodSet::from_bits(
            CompressionMethod::Gzip.bits() | CompressionMethod::Deflate.bits(),
        ))
    }

    fn alloc_state(&self) -> longeron_compress::Result<StateHandle> {
        self.counters.lock().alloc_state += 1;
        Ok(Self::sentinel_state())
    }

    fn free_state(&self, _state: StateHandle) -> longeron_compress::Result<()> {
        self.counters.lock().free_state += 1;
        Ok(())
    }

    fn alloc_compressor(
        &self,
        _state: &StateHandle,
        _method: CompressionMethod,
        _level: CompressionLevel,
    ) -> longeron_compress::Result<u32> {
        if let Some(code) = *self.fail_alloc_with.lock() {
            map_native_status(code, "CompressionAllocCompressor")?;
        }
        self.counters.lock().alloc_compressor += 1;
        self.buffered.lock().clear();
        Ok(8192)
    }

    fn free_compressor(&self, _state: &StateHandle) -> longeron_compress::Result<()> {
        self.counters.lock().free_compressor += 1;
        Ok(())
    }

    fn compress(
        &self,
        _state: &StateHandle,
        op: &mut CompressionOperation,
    ) -> longeron_compress::Result<()> {
        let mut buffered = self.buffered.lock();
        if op.input_size > 0 {
            let input =
                unsafe { std::slice::from_raw_parts(op.input, op.input_size as usize) };
            buffered.extend_from_slice(input);
            op.bytes_read = op.input_size;
            op.bytes_written = 0;
            return Ok(());
        }
        // Flush: gzip magic, then the stored payload.
        let mut frame = vec![0x1f, 0x8b];
        frame.extend_from_slice(&buffered);
        buffered.clear();
        let n = frame.len().min(op.output_size as usize);
        let output = unsafe { std::slice::from_raw_parts_mut(op.output, n) };
        output.copy_from_slice(&frame[..n]);
        op.bytes_read = 0;
        op.bytes_written = n as u32;
        Ok(())
    }

    fn block_size(&self, _state: &StateHandle) -> longeron_compress::Result<u32> {
        Ok(8192)
    }

    fn max_compressed_size(
        &self,
        _state: &StateHandle,
        input_len: u64,
        _flush: bool,
    ) -> longeron_compress::Result<u64> {
        Ok(input_len + 32)
    }
}

fn manager_with_mock() -> (CompressorManager, Arc<MockBackend>) {
    let backend = Arc::new(MockBackend::default());
    (
        CompressorManager::new(backend.clone(), CompressionLevel::Fastest),
        backend,
    )
}

#[test]
fn commit_api_reuses_one_state_allocation() {
    let (manager, backend) = manager_with_mock();
    let mut compressor = manager.alloc_compressor();

    manager.commit_memory(&mut compressor).unwrap();
    assert!(compressor.supports_commit_api());

    for _ in 0..5 {
        manager
            .init_compressor(&mut compressor, CompressionMethod::Gzip)
            .unwrap();
        manager.deinit_compressor(&mut compressor).unwrap();
    }
    manager.decommit_memory(&mut compressor).unwrap();
    drop(compressor);

    let counters = backend.counters();
    assert_eq!(counters.alloc_state, 1, "state must be allocated exactly once");
    assert_eq!(counters.free_state, 1, "state must be freed exactly once");
    assert_eq!(counters.alloc_compressor, 5);
    assert_eq!(counters.free_compressor, 5);
}

#[test]
fn legacy_deinit_frees_the_entire_state() {
    let (manager, backend) = manager_with_mock();
    let mut compressor = manager.alloc_compressor();

    for _ in 0..3 {
        manager
            .init_compressor(&mut compressor, CompressionMethod::Deflate)
            .unwrap();
        manager.deinit_compressor(&mut compressor).unwrap();
    }
    drop(compressor);

    let counters = backend.counters();
    assert_eq!(counters.alloc_state, 3);
    assert_eq!(counters.free_state, 3, "legacy deinit leaked a state");
    assert_eq!(counters.alloc_compressor, 3);
    assert_eq!(counters.free_compressor, 3);
}

#[test]
fn lifecycle_misuse_is_rejected() {
    let (manager, _backend) = manager_with_mock();
    let mut compressor = manager.alloc_compressor();

    assert!(matches!(
        manager.deinit_compressor(&mut compressor),
        Err(CompressionError::InvalidState(_))
    ));
    assert!(matches!(
        manager.compress_block(&mut compressor, b"x", &mut [0u8; 8]),
        Err(CompressionError::InvalidState(_))
    ));

    manager
        .init_compressor(&mut compressor, CompressionMethod::Gzip)
        .unwrap();
    assert!(matches!(
        manager.init_compressor(&mut compressor, CompressionMethod::Gzip),
        Err(CompressionError::InvalidState(_))
    ));
}

#[test]
fn drop_releases_whatever_is_allocated() {
    let (manager, backend) = manager_with_mock();
    let mut compressor = manager.alloc_compressor();
    manager
        .init_compressor(&mut compressor, CompressionMethod::Gzip)
        .unwrap();
    drop(compressor);

    let counters = backend.counters();
    assert_eq!(counters.free_compressor, 1);
    assert_eq!(counters.free_state, 1);
}

#[test]
fn failed_init_does_not_leak_legacy_state() {
    let (manager, backend) = manager_with_mock();
    let mut compressor = manager.alloc_compressor();
    *backend.fail_alloc_with.lock() = Some(ERR_COMP_TYPE_NOT_SUPPORTED);

    let err = manager
        .init_compressor(&mut compressor, CompressionMethod::Brotli)
        .unwrap_err();
    assert!(matches!(err, CompressionError::NotSupported(_)));

    let counters = backend.counters();
    assert_eq!(counters.alloc_state, 1);
    assert_eq!(counters.free_state, 1, "failed legacy init leaked the state");
}

#[test]
fn committed_state_survives_failed_init() {
    let (manager, backend) = manager_with_mock();
    let mut compressor = manager.alloc_compressor();
    manager.commit_memory(&mut compressor).unwrap();
    *backend.fail_alloc_with.lock() = Some(ERR_COMP_TYPE_NOT_SUPPORTED);

    assert!(manager
        .init_compressor(&mut compressor, CompressionMethod::Brotli)
        .is_err());
    assert_eq!(backend.counters().free_state, 0);

    // The committed state is still usable once the failure clears.
    *backend.fail_alloc_with.lock() = None;
    manager
        .init_compressor(&mut compressor, CompressionMethod::Gzip)
        .unwrap();
    manager.deinit_compressor(&mut compressor).unwrap();
    manager.decommit_memory(&mut compressor).unwrap();
    assert_eq!(backend.counters().alloc_state, 1);
    assert_eq!(backend.counters().free_state, 1);
}

#[test]
fn gzip_flush_produces_a_framed_stream() {
    let (manager, _backend) = manager_with_mock();
    let mut compressor = manager.alloc_compressor();
    let block = manager
        .init_compressor(&mut compressor, CompressionMethod::Gzip)
        .unwrap();
    assert!(block > 0);

    let input = b"hello world";
    let mut output = [0u8; 64];
    let result = manager
        .compress_block(&mut compressor, input, &mut output)
        .unwrap();
    assert_eq!(result.bytes_read, input.len());

    let flushed = manager.flush(&mut compressor, &mut output).unwrap();
    assert!(result.bytes_written + flushed > 0);
    assert_eq!(&output[..2], &hex::decode("1f8b").unwrap()[..]);

    manager.deinit_compressor(&mut compressor).unwrap();
}

#[test]
fn supported_methods_pass_through() {
    let (manager, _backend) = manager_with_mock();
    let methods = manager.supported_methods().unwrap();
    assert!(methods.contains(CompressionMethod::Gzip));
    assert!(methods.contains(CompressionMethod::Deflate));
    assert!(!methods.contains(CompressionMethod::Brotli));
}
