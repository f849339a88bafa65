//! arq256 - reliable ARQ transport with Reed-Solomon FEC over UDP
//!
//! A reliable, ordered, message-oriented transport for unreliable datagram
//! links. Selective acknowledgement, fast retransmit and an adjustable
//! congestion window give TCP-like delivery with much lower head-of-line
//! latency under loss; an optional Cauchy Reed-Solomon erasure layer
//! recovers most lost datagrams without waiting a round trip at all.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::{Duration, Instant};
//!
//! # fn main() -> Result<(), arq256::Error> {
//! // Server: accept one peer and echo a message back.
//! let listener = arq256::listen_with_options("127.0.0.1:9000", 10, 3)?;
//! std::thread::spawn(move || {
//!     let sess = listener.accept().unwrap();
//!     let mut buf = [0u8; 1500];
//!     let n = sess.read(&mut buf).unwrap();
//!     sess.write(&buf[..n]).unwrap();
//! });
//!
//! // Client: send, then wait for the echo with a deadline.
//! let sess = arq256::dial_with_options("127.0.0.1:9000", 10, 3)?;
//! sess.write(b"hello")?;
//! sess.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)));
//! let mut buf = [0u8; 1500];
//! let n = sess.read(&mut buf)?;
//! assert_eq!(&buf[..n], b"hello");
//! sess.close()?;
//! # Ok(())
//! # }
//! ```

use std::io;

mod control;
pub mod entropy;
pub mod erasure;
pub mod fec;
mod gf;
mod listener;
pub mod pool;
pub mod protocol;
mod session;
pub mod stats;
mod updater;

pub use control::ControlBlock;
pub use entropy::{ChainedNonce, Entropy};
pub use erasure::{Codec, ShardMut};
pub use fec::{FecDecoder, FecEncoder};
pub use listener::{dial, dial_with_options, listen, listen_with_options, Listener, ACCEPT_BACKLOG};
pub use protocol::{Command, SegmentHeader};
pub use session::Session;
pub use stats::{stats, StatsSnapshot, TransportStats};

/// Error type for every fallible operation in the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No complete message is queued, or the send window is full.
    #[error("operation would block")]
    WouldBlock,
    /// A read, write or accept deadline passed.
    #[error("i/o timeout")]
    Timeout,
    /// The supplied buffer is smaller than the next whole message.
    #[error("buffer too small for the next message")]
    ShortBuffer,
    /// The session or listener is closed.
    #[error("broken pipe")]
    BrokenPipe,
    /// Inbound segment carried a foreign conversation id.
    #[error("conversation id mismatch")]
    MalformedConv,
    /// Inbound segment carried an unrecognised command byte.
    #[error("unrecognised command")]
    BadCmd,
    /// Inbound datagram declared more payload than it carried.
    #[error("truncated segment")]
    Truncated,
    /// A send would fragment into more than 255 segments.
    #[error("message too large")]
    TooLarge,
    /// A zero-length payload was submitted.
    #[error("empty payload")]
    Empty,
    /// The conversation exceeded its retransmission budget.
    #[error("dead link")]
    Dead,
    /// The operation needs a socket this session does not own.
    #[error("invalid operation")]
    InvalidOperation,
    /// Codec or tuning parameters out of range.
    #[error("invalid parameters")]
    InvalidParams,
    /// Too few shards survived to reconstruct a block.
    #[error("insufficient shards")]
    InsufficientShards,
    /// An underlying socket error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True when the error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// True when retrying later may succeed.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Error::Timeout | Error::WouldBlock)
    }
}

/// Milliseconds since an arbitrary process-local epoch, wrapping at 2^32.
pub(crate) fn current_ms() -> u32 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_markers() {
        assert!(Error::Timeout.is_timeout());
        assert!(Error::Timeout.is_temporary());
        assert!(Error::WouldBlock.is_temporary());
        assert!(!Error::BrokenPipe.is_temporary());
        assert!(!Error::Dead.is_timeout());
    }

    #[test]
    fn io_errors_convert() {
        let err: Error = io::Error::new(io::ErrorKind::ConnectionRefused, "nope").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
