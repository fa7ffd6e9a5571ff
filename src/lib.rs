//! Connection-dispatch front end for a QUIC transport stack: public-header
//! parsing, frame (de)coding, early-packet buffering, ClientHello
//! extraction, and the dispatcher state machine that ties them together
//! into routing decisions for a per-connection session layer this crate
//! does not itself implement.

extern crate byteorder;
extern crate bytes;
extern crate fnv;
extern crate failure_derive;
extern crate failure;
extern crate rand;
extern crate ring;
extern crate slab;
#[macro_use]
extern crate slog;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
#[cfg(test)]
#[macro_use]
extern crate hex_literal;
#[cfg(test)]
extern crate slog_term;

/// The only QUIC version label this dispatcher creates sessions for without
/// asking its `Visitor` first.
pub const VERSION: u32 = 0x0000_0001;

pub mod buffered;
pub mod chlo;
pub mod cid;
pub mod coding;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod packet;
pub mod session;
pub mod timewait;

pub use config::Config;
pub use dispatch::{ConnectionCloseSource, Dispatcher, Outcome, Visitor};
pub use error::{DispatchError, ErrorKind, TransportError};
pub use packet::Dialect;
pub use session::{Session, SessionFactory, SessionHandle};
