//! Configuration of a [`BinarySerializer`](crate::BinarySerializer).

use crate::pool::DEFAULT_BLOCK_SIZE;

/// Whether symbols are remembered across calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionScope {
    /// One session lives as long as the serializer, so every symbol is sent once.
    Shared,
    /// Every call starts from an empty table and inlines its complete session block ahead of
    /// the payload. Records written this way can be decoded in any order by any reader.
    PerCall,
}

/// How a payload is delimited on the stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// The payload runs to the end of the stream.
    None,
    /// The payload is preceded by its length as a 4-byte big-endian integer, so that several
    /// records can follow each other on one stream.
    LengthPrefixed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// Block size of the pool created by [`BinarySerializer::new`](crate::BinarySerializer::new).
    pub block_size: usize,
    pub scope: SessionScope,
    pub framing: Framing,
    /// Intern string values as well as field and variant names.
    pub intern_values: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            block_size: DEFAULT_BLOCK_SIZE,
            scope: SessionScope::Shared,
            framing: Framing::None,
            intern_values: false,
        }
    }
}

impl Options {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_scope(mut self, scope: SessionScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_intern_values(mut self, intern_values: bool) -> Self {
        self.intern_values = intern_values;
        self
    }

    pub(crate) fn is_framed(&self) -> bool {
        self.framing == Framing::LengthPrefixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builder_overrides_defaults() {
        let options = Options::default()
            .with_scope(SessionScope::PerCall)
            .with_framing(Framing::LengthPrefixed)
            .with_intern_values(true);
        assert_eq!(
            options,
            Options {
                block_size: DEFAULT_BLOCK_SIZE,
                scope: SessionScope::PerCall,
                framing: Framing::LengthPrefixed,
                intern_values: true,
            }
        );
    }
}
