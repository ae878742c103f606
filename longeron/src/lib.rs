//! # Longeron
//!
//! Reusable HTTP service infrastructure with clean layering:
//!
//! - **`longeron-core`**: byte pipes, socket pipelines, the multi-worker
//!   TCP listener node and connection pooling
//! - **`longeron-compress`**: the native streaming-compression bridge with
//!   its versioned memory lifecycle
//! - **`longeron`**: the service stack: virtual hosts composed into
//!   groups, one server per group, plugins attached and detached at
//!   runtime (this crate)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use longeron::hosting::{GroupServer, ServiceHost, ServiceStackBuilder};
//!
//! # fn example(
//! #     host: Arc<dyn ServiceHost>,
//! #     factory: impl Fn(Arc<longeron::hosting::ServiceGroup>) -> Box<dyn GroupServer>,
//! # ) -> longeron::Result<()> {
//! let stack = ServiceStackBuilder::new()
//!     .with_host(host)
//!     .build(factory)?;
//!
//! stack.start_servers(None)?;
//! // ... later:
//! // stack.stop_and_wait().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Data flow
//!
//! Listener node → server socket → socket pipeline → stream → group
//! server. Control flow for plugins: stack → plugin manager → managed
//! plugin → service groups → hosts.

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::future_not_send)] // Runtime-agnostic design
#![allow(clippy::missing_errors_doc)]

// Re-export core types
pub use longeron_core::cancel::CancelToken;
pub use longeron_core::config::TcpConfig;
pub use longeron_core::descriptor::ServerSocket;
pub use longeron_core::listener::TcpServer;
pub use longeron_core::pipeline::{PipeStream, SocketPipeline};
pub use longeron_core::{CoreError, ErrorKind, Result};

// Re-export the compression bridge surface
pub use longeron_compress::{
    CompressionConfig, CompressionLevel, CompressionMethod, CompressorManager,
};

pub mod hosting;

/// Development helpers (benches/tests)
pub mod dev_tracing;
