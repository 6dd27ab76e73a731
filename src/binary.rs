//! Special values and types related to the binary payload format.

/// ## Typed Value Formats
///
/// A value consists of a one-octet type descriptor, possibly followed by a length,
/// possibly followed by a representation.
///
/// ```text
///        7       4 3       0
///       +---------+---------+
/// value |    T    |    L    |
///       +---------+---------+======+
///       :     length [VarUInt]     :
///       +==========================+
///       :      representation      :
///       +==========================+
/// ```
///
/// The type descriptor octet has two subfields: a four-bit type code T, and a four-bit length L.
///
/// For scalars L counts octets of the representation. For containers L counts elements
/// (or element pairs). In both cases a length of at least 14 sets L to 14 and writes the
/// length as a VarUInt field. For containers, L of 15 means the element count was not known
/// up front and the elements are followed by an `End` descriptor.
///
/// Strings that the session interns are written as `Symbol` values holding the symbol ID as a
/// big-endian UInt, so that the text itself only ever travels inside a session block.
///
/// # Panics
///
/// While TypeCode itself obviously does not have any mechanism to originate a panic, other code
/// depends via the FromPrimitive derivation on the fact that there are 16 variants of this enum.
#[derive(Clone, Debug, PartialEq, FromPrimitive, Copy)]
pub(crate) enum TypeCode {
    Null = 0,
    Bool = 1,
    PosInt = 2,
    NegInt = 3,
    Float = 4,
    Reserved5 = 5,
    Reserved6 = 6,
    Symbol = 7,
    String = 8,
    Reserved9 = 9,
    Bytes = 10,
    List = 11,
    Map = 12,
    Struct = 13,
    Variant = 14,
    End = 15,
}

impl TypeCode {
    pub(crate) const fn to_byte(self) -> u8 {
        (self as u8) << 4
    }
}

/// L value of the unit null, `0x0F`.
pub(crate) const NULL_LENGTH: u8 = 15;
/// L values at or above this one do not hold the length themselves.
pub(crate) const VAR_LENGTH: u8 = 14;
/// L value of a container whose elements run until an `End` descriptor.
pub(crate) const OPEN_LENGTH: u8 = 15;

pub(crate) const NULL: u8 = type_descriptor(TypeCode::Null, NULL_LENGTH);
pub(crate) const END: u8 = type_descriptor(TypeCode::End, 0);
/// Marks a present option whose value is itself written as `NULL`, so that `Some(None)` and
/// `Some(())` stay distinct from `None`.
pub(crate) const SOME: u8 = type_descriptor(TypeCode::Null, 0);

/// The shape of the data carried by a `Variant` value, stored in its L subfield.
#[derive(Clone, Debug, PartialEq, FromPrimitive, Copy)]
pub(crate) enum VariantKind {
    Unit = 0,
    Newtype = 1,
    Tuple = 2,
    Struct = 3,
}

pub(crate) const fn type_descriptor(t: TypeCode, l: u8) -> u8 {
    t.to_byte() | (l & 0x0F)
}

/// Splits a descriptor octet into its type code and L subfield.
pub(crate) fn split_descriptor(byte: u8) -> (TypeCode, u8) {
    // All 16 values of the high nibble are variants of TypeCode.
    let code = num_traits::FromPrimitive::from_u8(byte >> 4).unwrap_or(TypeCode::End);
    (code, byte & 0x0F)
}

/// ## VarUInt Fields
///
/// VarUInt fields represent self-delimiting, variable-length unsigned integer values.
/// These field formats are always used in a context that does not indicate the number of octets
/// in the field; the last octet (and only the last octet) has its high-order bit set to
/// terminate the field.
///
/// ```text
///                 7  6                   0       n+7 n+6                 n
///               +===+=====================+     +---+---------------------+
/// VarUInt field : 0 :         bits        :  …  | 1 |         bits        |
///               +===+=====================+     +---+---------------------+
/// ```
pub(crate) fn append_var_uint(bytestream: &mut Vec<u8>, value: usize) {
    let mut groups = [0u8; 10];
    let mut index = groups.len();
    let mut rest = value;
    loop {
        index -= 1;
        groups[index] = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    let last = groups.len() - 1;
    groups[last] |= 0x80;
    bytestream.extend_from_slice(&groups[index..]);
}

/// ## UInt Fields
///
/// UInts are sequences of octets, interpreted as big-endian, with no leading zero octets.
/// Zero is represented by no octets at all.
pub(crate) fn uint_bytes(value: u128) -> ([u8; 16], usize) {
    let bytes = value.to_be_bytes();
    let skip = (value.leading_zeros() / 8) as usize;
    (bytes, skip)
}

/// Appends a descriptor whose L subfield is `length`, spilling into a VarUInt when needed.
pub(crate) fn append_header(bytestream: &mut Vec<u8>, code: TypeCode, length: usize) {
    if length < VAR_LENGTH as usize {
        bytestream.push(type_descriptor(code, length as u8));
    } else {
        bytestream.push(type_descriptor(code, VAR_LENGTH));
        append_var_uint(bytestream, length);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn var_uint(value: usize) -> Vec<u8> {
        let mut bytes = vec![];
        append_var_uint(&mut bytes, value);
        bytes
    }

    #[test]
    fn var_uint_sets_the_high_bit_only_on_the_last_octet() {
        assert_eq!(var_uint(0), vec![0x80]);
        assert_eq!(var_uint(0x7F), vec![0xFF]);
        assert_eq!(var_uint(0x80), vec![0x01, 0x80]);
        assert_eq!(var_uint(0x3FFF), vec![0x7F, 0xFF]);
        assert_eq!(var_uint(0x4000), vec![0x01, 0x00, 0x80]);
    }

    #[test]
    fn uint_bytes_drop_leading_zeros() {
        let (bytes, skip) = uint_bytes(0);
        assert_eq!(&bytes[skip..], &[] as &[u8]);
        let (bytes, skip) = uint_bytes(0x01_00);
        assert_eq!(&bytes[skip..], &[0x01, 0x00]);
    }

    #[test]
    fn headers_spill_at_fourteen() {
        let mut bytes = vec![];
        append_header(&mut bytes, TypeCode::String, 13);
        append_header(&mut bytes, TypeCode::String, 14);
        assert_eq!(bytes, vec![0x8D, 0x8E, 0x8E]);
    }

    #[test]
    fn descriptors_split_back_into_parts() {
        assert_eq!(split_descriptor(NULL), (TypeCode::Null, 15));
        assert_eq!(split_descriptor(END), (TypeCode::End, 0));
        assert_eq!(split_descriptor(SOME), (TypeCode::Null, 0));
        assert_eq!(split_descriptor(0xE3), (TypeCode::Variant, 3));
    }
}
