//! IPC bridge between the parent process and the worker.
//!
//! # Architecture
//!
//! - **protocol**: Message envelope and type set
//! - **codec**: Length-prefixed framing for AsyncRead/AsyncWrite
//! - **pool**: Recycled buffers for the frame read/write path
//! - **transport**: Stdio and local socket endpoints

pub mod codec;
pub mod pool;
pub mod protocol;
pub mod transport;
