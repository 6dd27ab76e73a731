// Some content Copyright 2018 Serde Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A compact binary serde format for streams of many similar records.
//!
//! Field names, variant names and (optionally) string values are replaced in the payload by
//! small symbol IDs. The text behind each ID travels once per session in a session block,
//! either inline ahead of the payload that first used it or over a separate channel.
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use serde_session::{from_reader, to_writer, ChunkPool};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! enum Shape {
//!     Circle { radius: f64 },
//!     Square { side: f64 },
//! }
//!
//! let pool = ChunkPool::default();
//! let mut record = vec![];
//! to_writer(&pool, &Shape::Circle { radius: 1.0 }, &mut record)?;
//! let shape: Shape = from_reader(&mut record.as_slice())?;
//! assert_eq!(shape, Shape::Circle { radius: 1.0 });
//! # Ok::<(), serde_session::Error>(())
//! ```
//!
//! [`BinarySerializer`] keeps the session between calls so that each symbol is sent only
//! once.

#[macro_use]
extern crate num_derive;

mod binary;
pub mod de;
mod error;
mod options;
mod pool;
pub mod ser;
mod session;
mod staging;
pub mod symbols;


use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::error::{Error, Result, SymbolError};
pub use crate::options::{Framing, Options, SessionScope};
pub use crate::pool::{ChunkPool, PoolStats, DEFAULT_BLOCK_SIZE};
pub use crate::session::BinarySerializer;
pub use crate::staging::StagingBuffer;
pub use crate::symbols::{Interner, Resolver, Symbol, SymbolTable, WriterSession};

/// Writes `value` as a self-contained record: a session block holding every symbol the value
/// uses, followed by the payload.
pub fn to_writer<T, W>(pool: &ChunkPool, value: &T, destination: &mut W) -> Result<()>
where
    T: Serialize + ?Sized,
    W: Write + ?Sized,
{
    let mut session = WriterSession::new();
    let payload = session::stage_payload(pool, &Options::default(), &mut session, value)?;
    session.write_block(destination)?;
    payload.drain(destination)?;
    Ok(())
}

/// Reads a record written by [`to_writer`]. The payload extends to the end of `source`.
pub fn from_reader<T, R>(source: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: Read + ?Sized,
{
    from_reader_with_session(source, None)
}

/// Reads one unframed record. With a `session` the payload is decoded against it and
/// `source` must not start with a session block; without one, the block is read from the
/// head of `source` as in [`from_reader`].
pub fn from_reader_with_session<T, R>(source: &mut R, session: Option<&SymbolTable>) -> Result<T>
where
    T: DeserializeOwned,
    R: Read + ?Sized,
{
    let table = session::session_or_block(source, session)?;
    let payload = session::read_payload(source, false)?;
    de::from_slice(&payload, &*table)
}
