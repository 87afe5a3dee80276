//! Transparent TCP relay with traffic capture.
//!
//! Every accepted client connection is paired with a fresh upstream
//! connection and handed to a [`Relay`], which copies bytes both ways and
//! mirrors each chunk it reads into the [`FrameSink`] for that direction.
//!
//! # Architecture
//!
//! ```text
//! Client  <--TCP-->  Relay  <--TCP-->  Upstream
//!                      |
//!             [Transformer chain]
//!                      |
//!                 [Frame sink]
//! ```
//!
//! The [`Dispatcher`] accepts clients, dials upstream, numbers sessions from
//! 0 and starts one relay per pair. Each relay runs two pumps
//! (client-to-upstream and upstream-to-client) that share a close-once
//! session lock; whichever side fails first tears the session down.
//!
//! [`FrameSink`]: frame_capture::FrameSink

pub mod listener;
pub mod relay;

// Re-export the primary public types at the crate root for convenience.
pub use listener::{
    sniff, Acceptor, DialFailurePolicy, Dialer, DispatchError, Dispatcher, FrameSinks, TcpDialer,
};
pub use relay::{Close, ConnectionCloser, Relay, RelayHandle, SessionState, BUFFER_SIZE};
