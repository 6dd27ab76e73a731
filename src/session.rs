//! The serializer instance: a writer session and a reader session bound to one value type.
//!
//! ## Writing
//!
//! Every call to [`BinarySerializer::serialize`] runs the structural encoder against the
//! writer's symbol table. Strings seen for the first time become pending symbols, and the
//! caller picks how they reach readers:
//!
//! * inline, where the pending symbols are written as a session block right ahead of the
//!   payload. The block can only be computed once encoding is done, so the payload is staged
//!   in pooled blocks and spliced in after it;
//! * deferred, where nothing but the payload is written and the pending symbols accumulate
//!   until [`BinarySerializer::write_session_data`] sends them over a separate channel.
//!
//! ```text
//!   inline:    | block | payload |   | block | payload |   ...
//!   deferred:  | payload | payload | ...         and elsewhere: | block |
//! ```
//!
//! ## Reading
//!
//! Without a retained table, each [`BinarySerializer::deserialize`] reads a session block
//! from the head of the record and forgets it afterwards. After
//! [`BinarySerializer::load_shared_session_data`] the retained table resolves every payload,
//! and records are expected to carry no block.

use std::borrow::Cow;
use std::convert::TryFrom;
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;

use log::{debug, trace};
use serde::de::{Deserialize, DeserializeOwned};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::de;
use crate::error::{Error, Result};
use crate::options::{Options, SessionScope};
use crate::pool::ChunkPool;
use crate::ser::Serializer;
use crate::staging::StagingBuffer;
use crate::symbols::{encode_block, Interner, SymbolTable, WriterSession};

/// Octets of the big-endian payload length written when framing is enabled.
pub(crate) const FRAME_HEADER_LEN: usize = 4;

/// Encodes and decodes values of type `T`, remembering symbols across calls.
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use serde_session::BinarySerializer;
///
/// #[derive(Serialize, Deserialize, Debug, PartialEq)]
/// struct Reading {
///     sensor: u32,
///     celsius: f64,
/// }
///
/// let mut writer = BinarySerializer::<Reading>::new();
/// let mut record = vec![];
/// writer.serialize(&Reading { sensor: 7, celsius: 21.5 }, &mut record, false)?;
///
/// let mut reader = BinarySerializer::<Reading>::new();
/// let reading = reader.deserialize(&mut record.as_slice())?;
/// assert_eq!(reading, Reading { sensor: 7, celsius: 21.5 });
/// # Ok::<(), serde_session::Error>(())
/// ```
pub struct BinarySerializer<T> {
    writer: WriterSession,
    retained: Option<SymbolTable>,
    options: Options,
    pool: ChunkPool,
    marker: PhantomData<fn() -> T>,
}

// A payload encoded into staging together with what must precede it on the stream.
struct Staged {
    block: Option<Vec<u8>>,
    payload: StagingBuffer,
    checkpoint: bool,
}

impl<T> BinarySerializer<T> {
    /// A serializer with default [`Options`] and a pool of its own.
    pub fn new() -> Self {
        BinarySerializer::with_options(Options::default())
    }

    /// A serializer with a pool of its own, sized by `options.block_size`.
    pub fn with_options(options: Options) -> Self {
        let pool = ChunkPool::new(options.block_size);
        BinarySerializer::with_pool(pool, options)
    }

    /// A serializer drawing staging blocks from a pool shared with other serializers.
    /// `options.block_size` is ignored in favor of the pool's.
    pub fn with_pool(pool: ChunkPool, options: Options) -> Self {
        BinarySerializer {
            writer: WriterSession::new(),
            retained: None,
            options,
            pool,
            marker: PhantomData,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }

    /// The writer side of the session.
    pub fn session(&self) -> &WriterSession {
        &self.writer
    }

    /// The table loaded by [`load_shared_session_data`](Self::load_shared_session_data) or
    /// given to [`set_shared_table`](Self::set_shared_table), if any.
    pub fn shared_table(&self) -> Option<&SymbolTable> {
        self.retained.as_ref()
    }

    /// Retains `table` for later calls to [`deserialize`](Self::deserialize), replacing any
    /// table retained before. The table is typically a snapshot cloned from another instance
    /// or from a writer's [`session`](Self::session).
    ///
    /// A [`SessionScope::PerCall`] instance keeps the table but never decodes against it.
    pub fn set_shared_table(&mut self, table: SymbolTable) {
        debug!("retaining a shared session of {} symbols", table.len());
        self.retained = Some(table);
    }

    /// Reads a session block from `source` and retains it for later calls to
    /// [`deserialize`](Self::deserialize). When a table is already retained the block is
    /// appended to it, so successive outputs of
    /// [`write_session_data`](Self::write_session_data) can be loaded one after another.
    ///
    /// Returns the number of symbols loaded.
    ///
    /// A [`SessionScope::PerCall`] instance keeps the table but never decodes against it: each
    /// of its records carries a complete block.
    pub fn load_shared_session_data<S: Read + ?Sized>(&mut self, source: &mut S) -> Result<usize> {
        match self.retained.as_mut() {
            Some(table) => {
                let added = table.extend_from(source)?;
                debug!(
                    "appended {} symbols to the shared session ({} in total)",
                    added,
                    table.len()
                );
                Ok(added)
            }
            None => {
                let table = SymbolTable::load(source)?;
                let loaded = table.len();
                debug!("loaded shared session of {} symbols", loaded);
                self.retained = Some(table);
                Ok(loaded)
            }
        }
    }

    /// Clears the writer's pending symbols and discards any retained reader table.
    ///
    /// Symbol IDs already assigned by the writer are kept, so a reader that saw the earlier
    /// blocks stays in step.
    pub fn reset(&mut self) {
        debug!(
            "resetting session ({} pending symbols dropped, shared table {})",
            self.writer.pending().len(),
            if self.retained.is_some() {
                "discarded"
            } else {
                "absent"
            }
        );
        self.writer.reset();
        self.retained = None;
    }

    /// Writes the symbols added since the last checkpoint as a session block and checkpoints.
    ///
    /// Returns `false`, writing nothing, when there is nothing new.
    pub fn write_session_data<D: Write + ?Sized>(&mut self, destination: &mut D) -> Result<bool> {
        if !self.writer.has_pending() {
            trace!("no pending symbols to write");
            return Ok(false);
        }
        let written = self.writer.write_block(destination)?;
        let delivered = self.writer.checkpoint();
        debug!(
            "wrote session block of {} symbols ({} bytes)",
            delivered.len(),
            written
        );
        Ok(true)
    }

    /// Asynchronous [`write_session_data`](Self::write_session_data).
    pub async fn write_session_data_async<D>(&mut self, destination: &mut D) -> Result<bool>
    where
        D: AsyncWrite + Unpin + ?Sized,
    {
        if !self.writer.has_pending() {
            trace!("no pending symbols to write");
            return Ok(false);
        }
        let block = encode_block(self.writer.pending());
        destination.write_all(&block).await?;
        let delivered = self.writer.checkpoint();
        debug!(
            "wrote session block of {} symbols ({} bytes)",
            delivered.len(),
            block.len()
        );
        Ok(true)
    }

    fn session_table<S: Read + ?Sized>(&self, source: &mut S) -> Result<Cow<'_, SymbolTable>> {
        let retained = match self.options.scope {
            SessionScope::Shared => self.retained.as_ref(),
            SessionScope::PerCall => None,
        };
        session_or_block(source, retained)
    }

    /// Decodes one record held entirely in `input`.
    pub fn deserialize_slice<'a>(&mut self, input: &'a [u8]) -> Result<T>
    where
        T: Deserialize<'a>,
    {
        let mut rest = input;
        let table = self.session_table(&mut rest)?;
        let payload = split_frame(rest, self.options.is_framed())?;
        de::from_slice(payload, &*table)
    }
}

impl<T> BinarySerializer<T>
where
    T: Serialize,
{
    /// Encodes `value` to `destination`.
    ///
    /// Unless `defer_session_write` is set, a session block (possibly just its terminator) is
    /// written ahead of the payload and the writer checkpoints once both reached
    /// `destination`. With `defer_session_write`, only the payload is written and the new
    /// symbols stay pending until [`write_session_data`](Self::write_session_data).
    ///
    /// A [`SessionScope::PerCall`] serializer always inlines.
    pub fn serialize<D: Write + ?Sized>(
        &mut self,
        value: &T,
        destination: &mut D,
        defer_session_write: bool,
    ) -> Result<()> {
        if defer_session_write
            && self.options.scope == SessionScope::Shared
            && !self.options.is_framed()
        {
            trace!("encoding payload directly to the destination");
            let mut serializer = Serializer::new(&mut *destination, &mut self.writer)
                .intern_values(self.options.intern_values);
            return value.serialize(&mut serializer);
        }

        let staged = self.stage(value, defer_session_write)?;
        if let Some(block) = &staged.block {
            destination.write_all(block)?;
        }
        staged.payload.drain(destination)?;
        if staged.checkpoint {
            self.checkpoint();
        }
        Ok(())
    }

    /// Asynchronous [`serialize`](Self::serialize). The payload is always staged.
    ///
    /// Dropping the future returns the staged blocks to the pool and leaves the pending
    /// symbols in place.
    pub async fn serialize_async<D>(
        &mut self,
        value: &T,
        destination: &mut D,
        defer_session_write: bool,
    ) -> Result<()>
    where
        D: AsyncWrite + Unpin + ?Sized,
    {
        let staged = self.stage(value, defer_session_write)?;
        if let Some(block) = &staged.block {
            destination.write_all(block).await?;
        }
        staged.payload.drain_async(destination).await?;
        if staged.checkpoint {
            self.checkpoint();
        }
        Ok(())
    }

    fn stage(&mut self, value: &T, defer_session_write: bool) -> Result<Staged> {
        match self.options.scope {
            SessionScope::PerCall => {
                if defer_session_write {
                    debug!("per-call sessions are always inlined, ignoring the deferred write");
                }
                let mut session = WriterSession::new();
                let payload = stage_payload(&self.pool, &self.options, &mut session, value)?;
                Ok(Staged {
                    block: Some(encode_block(session.pending())),
                    payload,
                    checkpoint: false,
                })
            }
            SessionScope::Shared => {
                let payload = stage_payload(&self.pool, &self.options, &mut self.writer, value)?;
                let block = if defer_session_write {
                    None
                } else {
                    Some(encode_block(self.writer.pending()))
                };
                Ok(Staged {
                    block,
                    payload,
                    checkpoint: !defer_session_write,
                })
            }
        }
    }

    fn checkpoint(&mut self) {
        let delivered = self.writer.checkpoint();
        debug!("inlined session block of {} symbols", delivered.len());
    }
}

impl<T> BinarySerializer<T>
where
    T: DeserializeOwned,
{
    /// Decodes one record from `source`.
    ///
    /// Without a retained table the record must start with a session block, which is used
    /// for this call only. Unframed payloads extend to the end of `source`.
    pub fn deserialize<S: Read + ?Sized>(&mut self, source: &mut S) -> Result<T> {
        let table = self.session_table(source)?;
        let payload = read_payload(source, self.options.is_framed())?;
        de::from_slice(&payload, &*table)
    }
}

impl<T> Default for BinarySerializer<T> {
    fn default() -> Self {
        BinarySerializer::new()
    }
}

impl<T> std::fmt::Debug for BinarySerializer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinarySerializer")
            .field("writer", &self.writer)
            .field("retained", &self.retained.as_ref().map(SymbolTable::len))
            .field("options", &self.options)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Encodes `value` into a fresh staging buffer, reserving and patching the frame header when
/// framing is enabled.
pub(crate) fn stage_payload<V, I>(
    pool: &ChunkPool,
    options: &Options,
    interner: &mut I,
    value: &V,
) -> Result<StagingBuffer>
where
    V: Serialize + ?Sized,
    I: Interner + ?Sized,
{
    let mut staging = StagingBuffer::new(pool);
    if options.is_framed() {
        staging.write_all(&[0; FRAME_HEADER_LEN])?;
    }
    {
        let mut serializer =
            Serializer::new(&mut staging, interner).intern_values(options.intern_values);
        value.serialize(&mut serializer)?;
    }
    if options.is_framed() {
        let payload_len = staging.len() - FRAME_HEADER_LEN;
        let header = u32::try_from(payload_len).map_err(|_| Error::FrameTooLarge(payload_len))?;
        staging.seek(SeekFrom::Start(0))?;
        staging.write_all(&header.to_be_bytes())?;
        staging.seek(SeekFrom::End(0))?;
    }
    trace!("staged {} bytes", staging.len());
    Ok(staging)
}

/// `session` if there is one, otherwise a one-shot table read from the head of `source`.
pub(crate) fn session_or_block<'t, S: Read + ?Sized>(
    source: &mut S,
    session: Option<&'t SymbolTable>,
) -> Result<Cow<'t, SymbolTable>> {
    match session {
        Some(table) => Ok(Cow::Borrowed(table)),
        None => {
            let table = SymbolTable::load(source)?;
            trace!("read session block of {} symbols", table.len());
            Ok(Cow::Owned(table))
        }
    }
}

/// Reads one payload from `source`: a whole frame when framed, otherwise everything left.
pub(crate) fn read_payload<S: Read + ?Sized>(source: &mut S, framed: bool) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    if framed {
        let mut header = [0; FRAME_HEADER_LEN];
        source.read_exact(&mut header)?;
        let len = u32::from_be_bytes(header) as usize;
        Read::take(&mut *source, len as u64).read_to_end(&mut payload)?;
        if payload.len() < len {
            return Err(Error::malformed_payload(
                payload.len(),
                format!("frame ends before its announced {} bytes", len),
            ));
        }
    } else {
        source.read_to_end(&mut payload)?;
    }
    Ok(payload)
}

// The payload of a record held in memory. A framed record must end with its frame.
fn split_frame(input: &[u8], framed: bool) -> Result<&[u8]> {
    if !framed {
        return Ok(input);
    }
    if input.len() < FRAME_HEADER_LEN {
        return Err(Error::malformed_payload(0, "record too short for a frame header"));
    }
    let (header, rest) = input.split_at(FRAME_HEADER_LEN);
    let mut len = [0; FRAME_HEADER_LEN];
    len.copy_from_slice(header);
    let len = u32::from_be_bytes(len) as usize;
    if rest.len() < len {
        return Err(Error::malformed_payload(
            rest.len(),
            format!("frame ends before its announced {} bytes", len),
        ));
    }
    if rest.len() > len {
        return Err(Error::TrailingBytes(rest.len() - len));
    }
    Ok(rest)
}
