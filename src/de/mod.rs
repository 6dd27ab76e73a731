mod subfield;

use std::convert::TryFrom;

use nom::{Err, IResult};
use serde::de::{
    self, DeserializeSeed, EnumAccess, IntoDeserializer, MapAccess, SeqAccess, VariantAccess,
    Visitor,
};
use serde::forward_to_deserialize_any;

use self::subfield::*;
use crate::binary::{TypeCode, VariantKind, END, NULL, NULL_LENGTH, OPEN_LENGTH, SOME};
use crate::error::{Error, Result};
use crate::symbols::Resolver;

// Containers nested deeper than this are rejected instead of recursing further.
const MAX_DEPTH: usize = 128;

//////////////////////////////////////////////////////////////////////////////

/// A structure that deserializes the binary payload format into Rust values.
///
/// Symbol values and symbol field names are resolved through the [`Resolver`]; an ID the
/// resolver does not know fails with [`Error::Lookup`].
pub struct Deserializer<'de, 'r, R: ?Sized> {
    origin: &'de [u8],
    input: &'de [u8],
    resolver: &'r R,
    depth: usize,
}

// Text either borrowed from the input or resolved from the session.
enum Text<'de, 'r> {
    Literal(&'de str),
    Symbol(&'r str),
}

impl<'de, 'r, R> Deserializer<'de, 'r, R>
where
    R: Resolver + ?Sized,
{
    /// Create a Deserializer from a slice of bytes.
    pub fn from_slice(input: &'de [u8], resolver: &'r R) -> Self {
        Deserializer {
            origin: input,
            input,
            resolver,
            depth: 0,
        }
    }

    /// The `Deserializer::end` method should be called after a value has been fully deserialized.
    /// This allows the `Deserializer` to validate that the input is at its end.
    pub fn end(&mut self) -> Result<()> {
        if self.input.is_empty() {
            Ok(())
        } else {
            Err(Error::TrailingBytes(self.input.len()))
        }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.origin.len() - self.input.len()
    }

    fn parse<O, F>(&mut self, mut parser: F) -> Result<O>
    where
        F: FnMut(&'de [u8]) -> IResult<&'de [u8], O>,
    {
        match parser(self.input) {
            Ok((rest, output)) => {
                self.input = rest;
                Ok(output)
            }
            Err(Err::Error(e)) | Err(Err::Failure(e)) => Err(Error::malformed_payload(
                self.origin.len() - e.input.len(),
                e.code.description(),
            )),
            Err(Err::Incomplete(_)) => Err(Error::malformed_payload(
                self.origin.len(),
                "unexpected end of input",
            )),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.first().copied()
    }

    fn malformed(&self, reason: impl std::fmt::Display) -> Error {
        Error::malformed_payload(self.offset(), reason)
    }

    fn read_text(&mut self, code: TypeCode, l: u8) -> Result<Text<'de, 'r>> {
        match code {
            TypeCode::Symbol => {
                let id = self.read_uint(l)?;
                let resolver: &'r R = self.resolver;
                let id = usize::try_from(id)
                    .map_err(|_| crate::error::SymbolError::IdOverflow(id))?;
                Ok(Text::Symbol(resolver.resolve(id)?))
            }
            TypeCode::String => {
                let length = self.parse(take_length(l))?;
                let bytes = self.parse(nom::bytes::complete::take(length))?;
                std::str::from_utf8(bytes)
                    .map(Text::Literal)
                    .map_err(|e| self.malformed(e))
            }
            other => Err(self.malformed(format!(
                "expected a string or symbol, found {:?}",
                other
            ))),
        }
    }

    fn read_uint(&mut self, l: u8) -> Result<u128> {
        let length = self.parse(take_length(l))?;
        self.parse(take_uint(length))
    }

    fn read_name(&mut self) -> Result<Text<'de, 'r>> {
        let (code, l) = self.parse(take_descriptor)?;
        self.read_text(code, l)
    }

    fn read_count(&mut self, l: u8) -> Result<Option<usize>> {
        if l == OPEN_LENGTH {
            Ok(None)
        } else {
            self.parse(take_length(l)).map(Some)
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.malformed("containers nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // The value behind a `SOME` marker, which has already been consumed.
    fn visit_some<V>(&mut self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.enter()?;
        let value = visitor.visit_some(&mut *self)?;
        self.leave();
        Ok(value)
    }

    fn visit_seq<V>(&mut self, count: Option<usize>, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.enter()?;
        let mut access = Elements {
            de: self,
            remaining: count,
            closed: false,
        };
        let value = visitor.visit_seq(&mut access)?;
        access.finish()?;
        self.leave();
        Ok(value)
    }

    fn visit_map<V>(&mut self, count: Option<usize>, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.enter()?;
        let mut access = Elements {
            de: self,
            remaining: count,
            closed: false,
        };
        let value = visitor.visit_map(&mut access)?;
        access.finish()?;
        self.leave();
        Ok(value)
    }
}

/// Deserializes one value from `input`, resolving symbols through `resolver`. The value must
/// take up the whole input.
pub fn from_slice<'a, T, R>(input: &'a [u8], resolver: &R) -> Result<T>
where
    T: de::Deserialize<'a>,
    R: Resolver + ?Sized,
{
    let mut deserializer = Deserializer::from_slice(input, resolver);
    let value = T::deserialize(&mut deserializer)?;
    deserializer.end()?;
    Ok(value)
}

impl<'de, 'a, 'r, R> de::Deserializer<'de> for &'a mut Deserializer<'de, 'r, R>
where
    R: Resolver + ?Sized,
{
    type Error = Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        let (code, l) = self.parse(take_descriptor)?;
        match code {
            TypeCode::Null if l == NULL_LENGTH => visitor.visit_unit(),
            TypeCode::Null if l == 0 => self.visit_some(visitor),
            TypeCode::Bool if l <= 1 => visitor.visit_bool(l == 1),
            TypeCode::PosInt => {
                let magnitude = self.read_uint(l)?;
                match u64::try_from(magnitude) {
                    Ok(v) => visitor.visit_u64(v),
                    Err(_) => visitor.visit_u128(magnitude),
                }
            }
            TypeCode::NegInt => {
                let magnitude = self.read_uint(l)?;
                if magnitude <= 1u128 << 63 {
                    visitor.visit_i64((magnitude as i128).wrapping_neg() as i64)
                } else if magnitude <= 1u128 << 127 {
                    visitor.visit_i128((magnitude as i128).wrapping_neg())
                } else {
                    Err(self.malformed("negative integer below i128::MIN"))
                }
            }
            TypeCode::Float if l == 4 => {
                let v = self.parse(nom::number::complete::be_f32)?;
                visitor.visit_f32(v)
            }
            TypeCode::Float if l == 8 => {
                let v = self.parse(nom::number::complete::be_f64)?;
                visitor.visit_f64(v)
            }
            TypeCode::Symbol | TypeCode::String => match self.read_text(code, l)? {
                Text::Literal(text) => visitor.visit_borrowed_str(text),
                Text::Symbol(text) => visitor.visit_str(text),
            },
            TypeCode::Bytes => {
                let length = self.parse(take_length(l))?;
                let bytes = self.parse(nom::bytes::complete::take(length))?;
                visitor.visit_borrowed_bytes(bytes)
            }
            TypeCode::List => {
                let count = self.read_count(l)?;
                self.visit_seq(count, visitor)
            }
            TypeCode::Map | TypeCode::Struct => {
                let count = self.read_count(l)?;
                self.visit_map(count, visitor)
            }
            TypeCode::Variant => {
                let kind = num_traits::FromPrimitive::from_u8(l)
                    .ok_or_else(|| self.malformed(format!("unknown variant kind {}", l)))?;
                visitor.visit_enum(Variant { de: self, kind })
            }
            other => Err(self.malformed(format!(
                "invalid type descriptor {:?} with length {}",
                other, l
            ))),
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        match self.peek() {
            Some(NULL) => {
                self.input = &self.input[1..];
                visitor.visit_none()
            }
            Some(SOME) => {
                self.input = &self.input[1..];
                self.visit_some(visitor)
            }
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_newtype_struct<V>(self, _name: &'static str, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn is_human_readable(&self) -> bool {
        false
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }
}

// Elements of a list, or key/value pairs of a map or struct.
struct Elements<'a, 'de, 'r, R: ?Sized> {
    de: &'a mut Deserializer<'de, 'r, R>,
    remaining: Option<usize>,
    closed: bool,
}

impl<'a, 'de, 'r, R> Elements<'a, 'de, 'r, R>
where
    R: Resolver + ?Sized,
{
    fn has_next(&mut self) -> bool {
        match self.remaining {
            Some(0) => false,
            Some(ref mut n) => {
                *n -= 1;
                true
            }
            None if self.closed => false,
            None if self.de.peek() == Some(END) => {
                self.de.input = &self.de.input[1..];
                self.closed = true;
                false
            }
            None => true,
        }
    }

    // The visitor may stop early; anything it did not consume is an error.
    fn finish(mut self) -> Result<()> {
        if self.has_next() {
            Err(self
                .de
                .malformed("container has elements the target type does not"))
        } else {
            Ok(())
        }
    }
}

impl<'a, 'de, 'r, R> SeqAccess<'de> for Elements<'a, 'de, 'r, R>
where
    R: Resolver + ?Sized,
{
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
    where
        T: DeserializeSeed<'de>,
    {
        if self.has_next() {
            seed.deserialize(&mut *self.de).map(Some)
        } else {
            Ok(None)
        }
    }

    fn size_hint(&self) -> Option<usize> {
        self.remaining
    }
}

impl<'a, 'de, 'r, R> MapAccess<'de> for Elements<'a, 'de, 'r, R>
where
    R: Resolver + ?Sized,
{
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
    where
        K: DeserializeSeed<'de>,
    {
        if self.has_next() {
            seed.deserialize(&mut *self.de).map(Some)
        } else {
            Ok(None)
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
    where
        V: DeserializeSeed<'de>,
    {
        seed.deserialize(&mut *self.de)
    }

    fn size_hint(&self) -> Option<usize> {
        self.remaining
    }
}

// An enum value: the variant name token followed by data shaped according to `kind`.
struct Variant<'a, 'de, 'r, R: ?Sized> {
    de: &'a mut Deserializer<'de, 'r, R>,
    kind: VariantKind,
}

impl<'a, 'de, 'r, R> EnumAccess<'de> for Variant<'a, 'de, 'r, R>
where
    R: Resolver + ?Sized,
{
    type Error = Error;
    type Variant = Self;

    fn variant_seed<V>(self, seed: V) -> Result<(V::Value, Self)>
    where
        V: DeserializeSeed<'de>,
    {
        let name = match self.de.read_name()? {
            Text::Literal(name) => name,
            Text::Symbol(name) => name,
        };
        let value = seed.deserialize(IntoDeserializer::<Error>::into_deserializer(name))?;
        Ok((value, self))
    }
}

impl<'a, 'de, 'r, R> Variant<'a, 'de, 'r, R>
where
    R: Resolver + ?Sized,
{
    fn expect_kind(&self, kind: VariantKind) -> Result<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(self.de.malformed(format!(
                "expected a {:?} variant, found a {:?} variant",
                kind, self.kind
            )))
        }
    }
}

impl<'a, 'de, 'r, R> VariantAccess<'de> for Variant<'a, 'de, 'r, R>
where
    R: Resolver + ?Sized,
{
    type Error = Error;

    fn unit_variant(self) -> Result<()> {
        self.expect_kind(VariantKind::Unit)
    }

    // Visitors that ignore the variant (such as `IgnoredAny`) ask for a newtype whatever the
    // encoded kind, so every kind is accepted here.
    fn newtype_variant_seed<T>(self, seed: T) -> Result<T::Value>
    where
        T: DeserializeSeed<'de>,
    {
        match self.kind {
            VariantKind::Unit => seed.deserialize(de::value::UnitDeserializer::<Error>::new()),
            _ => seed.deserialize(&mut *self.de),
        }
    }

    fn tuple_variant<V>(self, _len: usize, visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.expect_kind(VariantKind::Tuple)?;
        de::Deserializer::deserialize_seq(&mut *self.de, visitor)
    }

    fn struct_variant<V>(self, _fields: &'static [&'static str], visitor: V) -> Result<V::Value>
    where
        V: Visitor<'de>,
    {
        self.expect_kind(VariantKind::Struct)?;
        de::Deserializer::deserialize_map(&mut *self.de, visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SymbolError;
    use crate::symbols::SymbolTable;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    fn decode<'de, T: Deserialize<'de>>(bytes: &'de [u8], table: &SymbolTable) -> Result<T> {
        from_slice(bytes, table)
    }

    fn table(symbols: &[&str]) -> SymbolTable {
        let block = crate::symbols::encode_block(symbols);
        SymbolTable::load(&mut block.as_slice()).unwrap()
    }

    #[derive(Deserialize, Debug, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn scalars() {
        let empty = SymbolTable::new();
        assert_eq!(decode::<bool>(&[0x11], &empty).unwrap(), true);
        assert_eq!(decode::<u16>(&[0x22, 0x01, 0x2C], &empty).unwrap(), 300);
        assert_eq!(decode::<i64>(&[0x31, 0x01], &empty).unwrap(), -1);
        assert_eq!(decode::<f32>(&[0x44, 0x3F, 0xC0, 0x00, 0x00], &empty).unwrap(), 1.5);
        assert_eq!(decode::<Option<u8>>(&[0x0F], &empty).unwrap(), None);
        assert_eq!(decode::<&str>(&[0x82, b'h', b'i'], &empty).unwrap(), "hi");
    }

    #[test]
    fn wide_integers_spill_their_length() {
        let mut session = crate::symbols::WriterSession::new();
        let mut bytes = vec![];
        let value = (u128::MAX, i128::MIN, 1u128 << 104);
        value
            .serialize(&mut crate::ser::Serializer::new(&mut bytes, &mut session))
            .unwrap();
        assert_eq!(&bytes[..3], &[0xB3, 0x2E, 0x90]);
        assert_eq!(
            decode::<(u128, i128, u128)>(&bytes, session.table()).unwrap(),
            value
        );
    }

    #[test]
    fn struct_field_names_resolve_through_the_table() {
        let bytes = hex::decode("d270210171013102").unwrap();
        assert_eq!(
            decode::<Point>(&bytes, &table(&["x", "y"])).unwrap(),
            Point { x: 1, y: -2 }
        );
    }

    #[test]
    fn unknown_symbol_ids_are_lookup_errors() {
        // struct(1) $5 1
        let bytes = [0xD1, 0x71, 0x05, 0x21, 0x01];
        match decode::<Point>(&bytes, &table(&["x", "y", "z"])) {
            Err(Error::Lookup(SymbolError::UnknownId {
                symbol_id,
                table_size,
            })) => {
                assert_eq!(symbol_id, 5);
                assert_eq!(table_size, 3);
            }
            other => panic!("expected a lookup error, got {:?}", other),
        }
    }

    #[test]
    fn some_markers_guard_nested_nulls() {
        let empty = SymbolTable::new();
        assert_eq!(decode::<Option<Option<u8>>>(&[0x00, 0x0F], &empty).unwrap(), Some(None));
        assert_eq!(decode::<Option<Option<u8>>>(&[0x0F], &empty).unwrap(), None);
        assert_eq!(decode::<Option<Option<u8>>>(&[0x21, 0x05], &empty).unwrap(), Some(Some(5)));
        assert_eq!(decode::<Option<()>>(&[0x00, 0x0F], &empty).unwrap(), Some(()));
        decode::<serde::de::IgnoredAny>(&[0x00, 0x00, 0x0F], &empty).unwrap();
    }

    #[test]
    fn truncated_input_is_malformed() {
        let bytes = [0x82, b'h'];
        assert!(matches!(
            decode::<String>(&bytes, &SymbolTable::new()),
            Err(Error::MalformedPayload { .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_reported() {
        assert!(matches!(
            decode::<bool>(&[0x11, 0x0F], &SymbolTable::new()),
            Err(Error::TrailingBytes(1))
        ));
    }

    #[test]
    fn open_lists_run_to_the_end_marker() {
        assert_eq!(
            decode::<Vec<bool>>(&[0xBF, 0x11, 0x10, 0xF0], &SymbolTable::new()).unwrap(),
            vec![true, false]
        );
    }

    #[test]
    fn extra_tuple_elements_are_rejected() {
        assert!(decode::<(bool,)>(&[0xB2, 0x11, 0x10], &SymbolTable::new()).is_err());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let mut bytes = vec![0xB1; MAX_DEPTH + 1];
        bytes.push(0x0F);
        assert!(matches!(
            decode::<serde::de::IgnoredAny>(&bytes, &SymbolTable::new()),
            Err(Error::MalformedPayload { .. })
        ));
    }
}
