//! Messaging bridge between the dispatcher and the worker fleet.
//!
//! # Architecture
//!
//! - **protocol**: Envelope types (job, fragment, failure) and their multipart layout
//! - **codec**: Length-delimited multipart framing for AsyncRead/AsyncWrite
//! - **transport**: Sink/source traits with in-process and TCP backings

pub mod codec;
pub mod protocol;
pub mod transport;
