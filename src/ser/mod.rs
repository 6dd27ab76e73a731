use std::io::Write;

use serde::ser::{
    self, SerializeMap, SerializeSeq, SerializeStruct, SerializeStructVariant, SerializeTuple,
    SerializeTupleStruct, SerializeTupleVariant,
};
use serde::Serialize;

use crate::binary::{
    append_header, type_descriptor, uint_bytes, TypeCode, VariantKind, END, NULL, OPEN_LENGTH, SOME,
};
use crate::error::{Error, Result};
use crate::symbols::Interner;

//////////////////////////////////////////////////////////////////////////////

/// A structure for serializing Rust values into the binary payload format.
///
/// Field names and variant names are handed to the [`Interner`] and written as symbol IDs.
/// The serializer never writes symbol text; delivering the session to the reader is the
/// caller's job (see [`BinarySerializer`](crate::BinarySerializer)).
pub struct Serializer<'a, W, I: ?Sized> {
    output: W,
    interner: &'a mut I,
    intern_values: bool,
    // `Some`s entered whose value has not started yet.
    open_options: usize,
    // Header bytes are assembled here before being written as one slice.
    scratch: Vec<u8>,
}

impl<'a, W, I> Serializer<'a, W, I>
where
    W: Write,
    I: Interner + ?Sized,
{
    pub fn new(output: W, interner: &'a mut I) -> Self {
        Serializer {
            output,
            interner,
            intern_values: false,
            open_options: 0,
            scratch: Vec::with_capacity(16),
        }
    }

    /// Also intern string values, not just names.
    pub fn intern_values(mut self, intern_values: bool) -> Self {
        self.intern_values = intern_values;
        self
    }

    /// Unwrap the output from the `Serializer`.
    pub fn into_inner(self) -> W {
        self.output
    }

    fn write_scratch(&mut self) -> Result<()> {
        self.open_options = 0;
        self.output.write_all(&self.scratch)?;
        self.scratch.clear();
        Ok(())
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.open_options = 0;
        self.output.write_all(&[byte])?;
        Ok(())
    }

    // A null value under one or more `Some`s keeps a marker per `Some`.
    fn write_null(&mut self) -> Result<()> {
        for _ in 0..self.open_options {
            self.output.write_all(&[SOME])?;
        }
        self.write_byte(NULL)
    }

    fn write_header(&mut self, code: TypeCode, length: usize) -> Result<()> {
        append_header(&mut self.scratch, code, length);
        self.write_scratch()
    }

    // A UInt representation whose L is its octet count.
    fn write_uint(&mut self, code: TypeCode, value: u128) -> Result<()> {
        let (bytes, skip) = uint_bytes(value);
        append_header(&mut self.scratch, code, bytes.len() - skip);
        self.scratch.extend_from_slice(&bytes[skip..]);
        self.write_scratch()
    }

    fn write_string(&mut self, text: &str) -> Result<()> {
        self.write_header(TypeCode::String, text.len())?;
        self.output.write_all(text.as_bytes())?;
        Ok(())
    }

    // Field and variant names always go through the interner; values only when configured.
    fn write_token(&mut self, text: &str, intern: bool) -> Result<()> {
        let id = if intern {
            self.interner.intern(text)
        } else {
            None
        };
        match id {
            Some(id) => self.write_uint(TypeCode::Symbol, id as u128),
            None => self.write_string(text),
        }
    }

    fn write_variant(&mut self, kind: VariantKind, variant: &str) -> Result<()> {
        self.write_byte(type_descriptor(TypeCode::Variant, kind as u8))?;
        self.write_token(variant, true)
    }

    fn write_signed(&mut self, v: i128) -> Result<()> {
        if v < 0 {
            self.write_uint(TypeCode::NegInt, v.unsigned_abs())
        } else {
            self.write_uint(TypeCode::PosInt, v as u128)
        }
    }

    fn begin(&mut self, code: TypeCode, len: Option<usize>) -> Result<Compound<'_, 'a, W, I>> {
        match len {
            Some(len) => self.write_header(code, len)?,
            None => self.write_byte(type_descriptor(code, OPEN_LENGTH))?,
        }
        Ok(Compound {
            ser: self,
            expected: len,
            count: 0,
        })
    }
}

impl<'s, 'a, W, I> ser::Serializer for &'s mut Serializer<'a, W, I>
where
    W: Write,
    I: Interner + ?Sized,
{
    type Ok = ();
    type Error = Error;
    type SerializeSeq = Compound<'s, 'a, W, I>;
    type SerializeTuple = Compound<'s, 'a, W, I>;
    type SerializeTupleStruct = Compound<'s, 'a, W, I>;
    type SerializeTupleVariant = Compound<'s, 'a, W, I>;
    type SerializeMap = Compound<'s, 'a, W, I>;
    type SerializeStruct = Compound<'s, 'a, W, I>;
    type SerializeStructVariant = Compound<'s, 'a, W, I>;

    fn serialize_bool(self, v: bool) -> Result<()> {
        self.write_byte(type_descriptor(TypeCode::Bool, v as u8))
    }

    fn serialize_i8(self, v: i8) -> Result<()> {
        self.write_signed(i128::from(v))
    }

    fn serialize_i16(self, v: i16) -> Result<()> {
        self.write_signed(i128::from(v))
    }

    fn serialize_i32(self, v: i32) -> Result<()> {
        self.write_signed(i128::from(v))
    }

    fn serialize_i64(self, v: i64) -> Result<()> {
        self.write_signed(i128::from(v))
    }

    fn serialize_i128(self, v: i128) -> Result<()> {
        self.write_signed(v)
    }

    fn serialize_u8(self, v: u8) -> Result<()> {
        self.write_uint(TypeCode::PosInt, u128::from(v))
    }

    fn serialize_u16(self, v: u16) -> Result<()> {
        self.write_uint(TypeCode::PosInt, u128::from(v))
    }

    fn serialize_u32(self, v: u32) -> Result<()> {
        self.write_uint(TypeCode::PosInt, u128::from(v))
    }

    fn serialize_u64(self, v: u64) -> Result<()> {
        self.write_uint(TypeCode::PosInt, u128::from(v))
    }

    fn serialize_u128(self, v: u128) -> Result<()> {
        self.write_uint(TypeCode::PosInt, v)
    }

    fn serialize_f32(self, v: f32) -> Result<()> {
        self.scratch.push(type_descriptor(TypeCode::Float, 4));
        self.scratch.extend_from_slice(&v.to_be_bytes());
        self.write_scratch()
    }

    fn serialize_f64(self, v: f64) -> Result<()> {
        self.scratch.push(type_descriptor(TypeCode::Float, 8));
        self.scratch.extend_from_slice(&v.to_be_bytes());
        self.write_scratch()
    }

    fn serialize_char(self, v: char) -> Result<()> {
        let mut buf = [0u8; 4];
        self.write_string(v.encode_utf8(&mut buf))
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        let intern = self.intern_values;
        self.write_token(v, intern)
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<()> {
        self.write_header(TypeCode::Bytes, v.len())?;
        self.output.write_all(v)?;
        Ok(())
    }

    fn serialize_none(self) -> Result<()> {
        self.serialize_unit()
    }

    // `Some(v)` is written as `v`, unless `v` is written as a null.
    fn serialize_some<T: ?Sized>(self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.open_options += 1;
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<()> {
        self.write_null()
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<()> {
        self.serialize_unit()
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<()> {
        self.write_variant(VariantKind::Unit, variant)
    }

    // Newtype structs are treated as insignificant wrappers around the data they contain.
    fn serialize_newtype_struct<T: ?Sized>(self, _name: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<()>
    where
        T: Serialize,
    {
        self.write_variant(VariantKind::Newtype, variant)?;
        value.serialize(self)
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq> {
        self.begin(TypeCode::List, len)
    }

    fn serialize_tuple(self, len: usize) -> Result<Self::SerializeTuple> {
        self.begin(TypeCode::List, Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        self.begin(TypeCode::List, Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        self.write_variant(VariantKind::Tuple, variant)?;
        self.begin(TypeCode::List, Some(len))
    }

    fn serialize_map(self, len: Option<usize>) -> Result<Self::SerializeMap> {
        self.begin(TypeCode::Map, len)
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<Self::SerializeStruct> {
        self.begin(TypeCode::Struct, Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        self.write_variant(VariantKind::Struct, variant)?;
        self.begin(TypeCode::Struct, Some(len))
    }

    fn is_human_readable(&self) -> bool {
        false
    }
}

/// State for an in-progress list, map or struct.
///
/// Containers that announced their length are checked against it on `end`; the others are
/// closed with an `End` descriptor.
pub struct Compound<'s, 'a, W, I: ?Sized> {
    ser: &'s mut Serializer<'a, W, I>,
    expected: Option<usize>,
    count: usize,
}

impl<'s, 'a, W, I> Compound<'s, 'a, W, I>
where
    W: Write,
    I: Interner + ?Sized,
{
    fn element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
        self.count += 1;
        value.serialize(&mut *self.ser)
    }

    fn field<T: ?Sized + Serialize>(&mut self, key: &'static str, value: &T) -> Result<()> {
        self.count += 1;
        self.ser.write_token(key, true)?;
        value.serialize(&mut *self.ser)
    }

    fn finish(self) -> Result<()> {
        match self.expected {
            None => self.ser.write_byte(END),
            Some(expected) if expected == self.count => Ok(()),
            Some(expected) => Err(Error::Message(format!(
                "container announced {} elements but produced {}",
                expected, self.count
            ))),
        }
    }
}

impl<'s, 'a, W, I> SerializeSeq for Compound<'s, 'a, W, I>
where
    W: Write,
    I: Interner + ?Sized,
{
    type Ok = ();
    type Error = Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        self.element(value)
    }

    fn end(self) -> Result<()> {
        self.finish()
    }
}

impl<'s, 'a, W, I> SerializeTuple for Compound<'s, 'a, W, I>
where
    W: Write,
    I: Interner + ?Sized,
{
    type Ok = ();
    type Error = Error;

    fn serialize_element<T>(&mut self, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        self.element(value)
    }

    fn end(self) -> Result<()> {
        self.finish()
    }
}

impl<'s, 'a, W, I> SerializeTupleStruct for Compound<'s, 'a, W, I>
where
    W: Write,
    I: Interner + ?Sized,
{
    type Ok = ();
    type Error = Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        self.element(value)
    }

    fn end(self) -> Result<()> {
        self.finish()
    }
}

impl<'s, 'a, W, I> SerializeTupleVariant for Compound<'s, 'a, W, I>
where
    W: Write,
    I: Interner + ?Sized,
{
    type Ok = ();
    type Error = Error;

    fn serialize_field<T>(&mut self, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        self.element(value)
    }

    fn end(self) -> Result<()> {
        self.finish()
    }
}

// Map keys are ordinary values. The element count covers key/value pairs.
impl<'s, 'a, W, I> SerializeMap for Compound<'s, 'a, W, I>
where
    W: Write,
    I: Interner + ?Sized,
{
    type Ok = ();
    type Error = Error;

    fn serialize_key<T>(&mut self, key: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        self.element(key)
    }

    fn serialize_value<T>(&mut self, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        value.serialize(&mut *self.ser)
    }

    fn end(self) -> Result<()> {
        self.finish()
    }
}

impl<'s, 'a, W, I> SerializeStruct for Compound<'s, 'a, W, I>
where
    W: Write,
    I: Interner + ?Sized,
{
    type Ok = ();
    type Error = Error;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        self.field(key, value)
    }

    fn end(self) -> Result<()> {
        self.finish()
    }
}

impl<'s, 'a, W, I> SerializeStructVariant for Compound<'s, 'a, W, I>
where
    W: Write,
    I: Interner + ?Sized,
{
    type Ok = ();
    type Error = Error;

    fn serialize_field<T>(&mut self, key: &'static str, value: &T) -> Result<()>
    where
        T: ?Sized + Serialize,
    {
        self.field(key, value)
    }

    fn end(self) -> Result<()> {
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::WriterSession;
    use pretty_assertions::assert_eq;
    use serde::Serialize;

    fn encode<T: Serialize>(value: &T, session: &mut WriterSession) -> Vec<u8> {
        let mut serializer = Serializer::new(Vec::new(), session);
        value.serialize(&mut serializer).unwrap();
        serializer.into_inner()
    }

    #[derive(Serialize)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn scalars() {
        let mut session = WriterSession::new();
        assert_eq!(hex::encode(encode(&true, &mut session)), "11");
        assert_eq!(hex::encode(encode(&0u8, &mut session)), "20");
        assert_eq!(hex::encode(encode(&300u16, &mut session)), "22012c");
        assert_eq!(hex::encode(encode(&-1i64, &mut session)), "3101");
        assert_eq!(hex::encode(encode(&1.5f32, &mut session)), "443fc00000");
        assert_eq!(hex::encode(encode(&(), &mut session)), "0f");
        assert_eq!(hex::encode(encode(&"hi", &mut session)), "826869");
        assert_eq!(hex::encode(encode(&Some(5u8), &mut session)), "2105");
        assert!(!session.has_pending());
    }

    #[test]
    fn options_around_nulls_keep_their_markers() {
        let mut session = WriterSession::new();
        assert_eq!(hex::encode(encode(&None::<u8>, &mut session)), "0f");
        assert_eq!(hex::encode(encode(&Some(()), &mut session)), "000f");
        assert_eq!(
            hex::encode(encode(&Some(Some(None::<u8>)), &mut session)),
            "00000f"
        );
        assert_eq!(
            hex::encode(encode(&Some(vec![None::<u8>]), &mut session)),
            "b10f"
        );
    }

    #[test]
    fn struct_field_names_become_symbols() {
        let mut session = WriterSession::new();
        let bytes = encode(&Point { x: 1, y: -2 }, &mut session);
        // struct(2) $0 1 $1 -2
        assert_eq!(hex::encode(&bytes), "d270210171013102");
        assert_eq!(session.pending(), &["x".to_owned(), "y".to_owned()]);

        // A second encoding reuses the same IDs.
        let again = encode(&Point { x: 1, y: -2 }, &mut session);
        assert_eq!(bytes, again);
        assert_eq!(session.table().len(), 2);
    }

    #[test]
    fn interned_values_share_the_session() {
        let mut session = WriterSession::new();
        let mut serializer = Serializer::new(Vec::new(), &mut session).intern_values(true);
        vec!["CA", "CA", "NY"].serialize(&mut serializer).unwrap();
        let bytes = serializer.into_inner();
        assert_eq!(hex::encode(&bytes), "b370707101");
        assert_eq!(session.table().id_of("NY"), Some(1));
    }

    #[test]
    fn length_mismatch_is_an_error() {
        struct Liar;
        impl Serialize for Liar {
            fn serialize<S: ser::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element(&1u8)?;
                seq.end()
            }
        }
        let mut session = WriterSession::new();
        let mut serializer = Serializer::new(Vec::new(), &mut session);
        assert!(matches!(Liar.serialize(&mut serializer), Err(Error::Message(_))));
    }

    #[test]
    fn unknown_length_sequences_are_terminated() {
        struct Open;
        impl Serialize for Open {
            fn serialize<S: ser::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                let mut seq = serializer.serialize_seq(None)?;
                seq.serialize_element(&true)?;
                seq.end()
            }
        }
        let mut session = WriterSession::new();
        assert_eq!(hex::encode(encode(&Open, &mut session)), "bf11f0");
    }
}
