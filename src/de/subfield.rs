use nom::{
    bytes::complete::{take, take_while},
    error::{Error as NomError, ErrorKind, ParseError},
    number::complete::be_u8,
    Err, IResult,
};

use crate::binary::{split_descriptor, TypeCode, VAR_LENGTH};

/// ## Basic Field Formats
///
/// Payload values are made of a descriptor octet and a few basic field formats:
///
/// * UInt: big-endian octets, with the octet count taken from the descriptor's L subfield.
/// * VarUInt: seven bits per octet, the last octet flagged by its high bit.
///
/// The parsers below work on complete input. Running out of input is an error, never a
/// request for more.

pub(crate) fn take_descriptor(i: &[u8]) -> IResult<&[u8], (TypeCode, u8)> {
    let (rest, byte) = be_u8::<_, NomError<&[u8]>>(i)?;
    Ok((rest, split_descriptor(byte)))
}

fn high_bit_unset(byte: u8) -> bool {
    byte & 0b1000_0000 == 0
}

pub(crate) fn take_var_uint(i: &[u8]) -> IResult<&[u8], usize> {
    let (rest, sequence) = take_while::<_, _, NomError<&[u8]>>(high_bit_unset)(i)?;
    if sequence.first() == Some(&0) {
        return Err(Err::Failure(NomError::from_error_kind(i, ErrorKind::Verify)));
    }
    let (rest, terminator) = take::<_, _, NomError<&[u8]>>(1usize)(rest)?;
    let mut value: usize = 0;
    for byte in sequence.iter().chain(terminator.iter()) {
        value = match value.checked_mul(128) {
            Some(shifted) => shifted | (byte & 0b0111_1111) as usize,
            None => {
                return Err(Err::Failure(NomError::from_error_kind(
                    i,
                    ErrorKind::TooLarge,
                )))
            }
        };
    }
    Ok((rest, value))
}

/// A UInt field of `length` octets. Values wider than 128 bits are rejected.
pub(crate) fn take_uint(length: usize) -> impl Fn(&[u8]) -> IResult<&[u8], u128> {
    move |i: &[u8]| {
        if length > 16 {
            return Err(Err::Failure(NomError::from_error_kind(
                i,
                ErrorKind::TooLarge,
            )));
        }
        let (rest, bytes) = take::<_, _, NomError<&[u8]>>(length)(i)?;
        let value = bytes
            .iter()
            .fold(0u128, |acc, byte| (acc << 8) | u128::from(*byte));
        Ok((rest, value))
    }
}

/// The length (or element count) announced by an L subfield, reading the VarUInt that follows
/// the descriptor when L is 14.
pub(crate) fn take_length(l: u8) -> impl Fn(&[u8]) -> IResult<&[u8], usize> {
    move |i: &[u8]| {
        if l < VAR_LENGTH {
            Ok((i, l as usize))
        } else {
            take_var_uint(i)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn var_uint() {
        assert_eq!(take_var_uint(&[0x80, 0x01]), Ok((&[0x01][..], 0)));
        assert_eq!(take_var_uint(&[0x01, 0x80]), Ok((&[][..], 128)));
        assert!(take_var_uint(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn var_uint_rejects_leading_zero_groups() {
        assert!(matches!(take_var_uint(&[0x00, 0x80]), Err(Err::Failure(_))));
        assert!(matches!(take_var_uint(&[0x00, 0x01, 0x80]), Err(Err::Failure(_))));
    }

    #[test]
    fn var_uint_overflow_fails() {
        let mut bytes = vec![0x7F; 12];
        bytes.push(0xFF);
        assert!(matches!(take_var_uint(&bytes), Err(Err::Failure(_))));
    }

    #[test]
    fn uint() {
        assert_eq!(take_uint(0)(&[0xAA][..]), Ok((&[0xAA][..], 0)));
        assert_eq!(take_uint(2)(&[0x01, 0x2C, 0xAA][..]), Ok((&[0xAA][..], 300)));
        assert!(take_uint(3)(&[0x01][..]).is_err());
        assert!(take_uint(17)(&[0; 17][..]).is_err());
    }

    #[test]
    fn lengths() {
        assert_eq!(take_length(13)(&[0x01][..]), Ok((&[0x01][..], 13)));
        assert_eq!(take_length(14)(&[0x01, 0x80][..]), Ok((&[][..], 128)));
    }
}
