//! # Symbols and sessions
//!
//! A symbol is a string that the codec expects to see again: a struct field name, an enum
//! variant name, and optionally a repeated string value. Instead of writing the text every time,
//! the payload carries the symbol's ID, a small integer assigned by first use.
//!
//! The id→text mapping is the *session*. Writers grow it as they encounter new text and
//! periodically hand the newly added entries to readers as a *session block*:
//!
//! ```text
//!                +------------------------+
//! session block  :  length [VarUInt]      :  ┐
//!                +------------------------+  │ one entry per new symbol,
//!                :  text [UTF8]           :  ┘ in ascending ID order
//!                +========================+
//!                          ⋮
//!                +------------------------+
//!                |  0x80 (empty string)   |    terminator
//!                +------------------------+
//! ```
//!
//! The block carries no IDs. Entries are appended to the reader's table in order, so both sides
//! must apply blocks in the order the writer produced them.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use itertools::Itertools;
use log::{debug, trace};

use crate::binary::append_var_uint;
use crate::error::{Error, Result, SymbolError};

/// Assigns symbol IDs to strings on the write side.
pub trait Interner {
    /// Returns the ID for `text`, assigning the next one if it is new, or `None` if this text
    /// must be written literally.
    fn intern(&mut self, text: &str) -> Option<usize>;
}

/// Resolves symbol IDs back to text on the read side.
pub trait Resolver {
    fn resolve(&self, id: usize) -> std::result::Result<&str, SymbolError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Symbol {
    pub id: usize,
    pub text: String,
}

/// ## SymbolTable
///
/// Stores the ordered symbol list used to convert symbol IDs back into text, together with the
/// reverse index used when writing.
///
/// IDs start at zero and follow insertion order. A text is never assigned two IDs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SymbolTable {
    symbols: Vec<String>,
    offsets: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn id_of(&self, text: &str) -> Option<usize> {
        self.offsets.get(text).copied()
    }

    pub fn resolve(&self, id: usize) -> std::result::Result<&str, SymbolError> {
        match self.symbols.get(id) {
            Some(text) => Ok(text),
            None => Err(SymbolError::UnknownId {
                symbol_id: id,
                table_size: self.symbols.len(),
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Symbol> + '_ {
        self.symbols.iter().enumerate().map(|(id, text)| Symbol {
            id,
            text: text.clone(),
        })
    }

    /// Decodes a session block from the head of `reader` into a fresh table.
    ///
    /// Exactly the block is consumed, so the reader is left at the first byte after the
    /// terminator.
    pub fn load<R: Read + ?Sized>(reader: &mut R) -> Result<SymbolTable> {
        let mut table = SymbolTable::new();
        table.extend_from(reader)?;
        Ok(table)
    }

    /// Decodes a session block from `reader` and appends its entries, the first of which
    /// receives the ID `self.len()`. Returns the number of symbols added.
    ///
    /// On error the table is left exactly as it was.
    pub fn extend_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<usize> {
        let first_id = self.symbols.len();
        if let Err(e) = self.append_block(reader) {
            self.truncate(first_id);
            return Err(e);
        }
        let added = self.symbols.len() - first_id;
        debug!(
            "loaded {} session symbols, table now holds {}",
            added,
            self.symbols.len()
        );
        Ok(added)
    }

    fn append_block<R: Read + ?Sized>(&mut self, reader: &mut R) -> Result<()> {
        loop {
            let length = read_block_var_uint(reader)?;
            if length == 0 {
                return Ok(());
            }
            let text = read_block_text(reader, length)?;
            if self.offsets.contains_key(&text) {
                return Err(Error::MalformedSessionBlock(format!(
                    "symbol {:?} is defined twice",
                    text
                )));
            }
            self.push(text);
        }
    }

    fn truncate(&mut self, len: usize) {
        for text in self.symbols.drain(len..) {
            self.offsets.remove(&text);
        }
    }

    fn push(&mut self, text: String) -> usize {
        let id = self.symbols.len();
        self.offsets.insert(text.clone(), id);
        self.symbols.push(text);
        id
    }
}

impl Resolver for SymbolTable {
    fn resolve(&self, id: usize) -> std::result::Result<&str, SymbolError> {
        SymbolTable::resolve(self, id)
    }
}

/// The writer's view of a session: a symbol table plus a checkpoint marking which of its
/// entries have already been handed to readers.
///
/// Because IDs are assigned sequentially, the entries added since the last checkpoint are
/// always a suffix of the table.
#[derive(Clone, Debug, Default)]
pub struct WriterSession {
    table: SymbolTable,
    flushed: usize,
}

impl WriterSession {
    pub fn new() -> WriterSession {
        WriterSession::default()
    }

    /// Returns the ID of `text`, interning it as a new pending symbol if needed.
    ///
    /// The empty string is never interned because it terminates a session block.
    pub fn intern_or_lookup(&mut self, text: &str) -> Option<usize> {
        if text.is_empty() {
            return None;
        }
        if let Some(id) = self.table.id_of(text) {
            return Some(id);
        }
        let id = self.table.push(text.to_owned());
        trace!("interned {:?} as symbol {}", text, id);
        Some(id)
    }

    /// Symbols added since the last checkpoint, in ID order.
    pub fn pending(&self) -> &[String] {
        &self.table.symbols[self.flushed..]
    }

    pub fn has_pending(&self) -> bool {
        self.flushed < self.table.len()
    }

    /// Returns the symbols added since the last checkpoint and marks them as delivered.
    pub fn checkpoint(&mut self) -> Vec<Symbol> {
        let first_id = self.flushed;
        let symbols = self
            .pending()
            .iter()
            .enumerate()
            .map(|(offset, text)| Symbol {
                id: first_id + offset,
                text: text.clone(),
            })
            .collect_vec();
        self.flushed = self.table.len();
        if !symbols.is_empty() {
            trace!(
                "checkpoint delivered symbols {}",
                symbols.iter().map(|s| &s.text).format(", ")
            );
        }
        symbols
    }

    /// Clears the pending markers without forgetting any assigned ID.
    pub fn reset(&mut self) {
        self.flushed = self.table.len();
    }

    pub fn table(&self) -> &SymbolTable {
        &self.table
    }

    /// Writes the pending symbols as a session block. The pending markers are not cleared.
    pub fn write_block<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<usize> {
        let block = encode_block(self.pending());
        writer.write_all(&block)?;
        Ok(block.len())
    }
}

impl Interner for WriterSession {
    fn intern(&mut self, text: &str) -> Option<usize> {
        self.intern_or_lookup(text)
    }
}

/// Encodes `symbols` as a terminated session block.
pub(crate) fn encode_block<S: AsRef<str>>(symbols: &[S]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for symbol in symbols {
        let text = symbol.as_ref();
        append_var_uint(&mut bytes, text.len());
        bytes.extend_from_slice(text.as_bytes());
    }
    append_var_uint(&mut bytes, 0);
    bytes
}

fn read_block_byte<R: Read + ?Sized>(reader: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    match reader.read_exact(&mut byte) {
        Ok(()) => Ok(byte[0]),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Error::MalformedSessionBlock(
            "input ended before the block terminator".to_owned(),
        )),
        Err(e) => Err(Error::Io(e)),
    }
}

// Byte-wise twin of the payload's `take_var_uint`: the block is read from a stream and must
// stop exactly at its terminator. Only the minimal encoding is accepted, so the terminator is
// always the single octet 0x80.
fn read_block_var_uint<R: Read + ?Sized>(reader: &mut R) -> Result<usize> {
    let mut value: usize = 0;
    loop {
        let byte = read_block_byte(reader)?;
        if value == 0 && byte == 0 {
            return Err(Error::MalformedSessionBlock(
                "string length has a leading zero group".to_owned(),
            ));
        }
        value = value
            .checked_mul(128)
            .map(|v| v | (byte & 0x7F) as usize)
            .ok_or_else(|| {
                Error::MalformedSessionBlock("string length overflows usize".to_owned())
            })?;
        if byte & 0x80 != 0 {
            return Ok(value);
        }
    }
}

fn read_block_text<R: Read + ?Sized>(reader: &mut R, length: usize) -> Result<String> {
    let mut bytes = Vec::new();
    Read::take(&mut *reader, length as u64).read_to_end(&mut bytes)?;
    if bytes.len() != length {
        return Err(Error::MalformedSessionBlock(format!(
            "string of {} bytes truncated after {}",
            length,
            bytes.len()
        )));
    }
    String::from_utf8(bytes)
        .map_err(|e| Error::MalformedSessionBlock(format!("symbol text is not UTF-8: {}", e)))
}
