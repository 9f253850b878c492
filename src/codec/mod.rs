//! BER/DER tag-length codec used by the envelope state machines.
//!
//! Every read is all-or-nothing over the supplied slice: a function either
//! returns the decoded value plus the number of bytes it consumed, or
//! `Underflow` having consumed nothing. That discipline is what makes the
//! state machines resumable: a partial field simply stays in the buffer and
//! the same read is retried once more input arrives.
//!
//! Writers append to a `Vec<u8>` and never fail.

use crate::domain::constants;
use crate::infra::error::{EnvelopeError, EnvelopeResult};

/// A decoded BER length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Length {
    /// Definite length in bytes.
    Definite(usize),
    /// Indefinite length; the element runs until end-of-contents octets.
    Indefinite,
}

impl Length {
    pub fn is_indefinite(&self) -> bool {
        matches!(self, Length::Indefinite)
    }
}

/// A decoded tag-length header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u8,
    pub length: Length,
}

/// Peek the tag octet without consuming anything.
pub fn peek_tag(buf: &[u8]) -> EnvelopeResult<u8> {
    buf.first().copied().ok_or(EnvelopeError::Underflow)
}

/// Read a tag-length header. Returns the header and the bytes consumed.
pub fn read_header(buf: &[u8]) -> EnvelopeResult<(Header, usize)> {
    if buf.len() < 2 {
        return Err(EnvelopeError::Underflow);
    }
    let tag = buf[0];
    if tag == 0x00 {
        // A zero tag only appears inside end-of-contents octets, which are
        // read with check_end_of_contents, never as a header.
        return Err(EnvelopeError::BadData(
            "unexpected zero tag where a header was required".to_string(),
        ));
    }
    if tag & 0x1f == 0x1f {
        return Err(EnvelopeError::BadData(
            "multi-byte tag numbers are not supported".to_string(),
        ));
    }
    let first = buf[1];
    if first == constants::BER_INDEFINITE_LENGTH {
        return Ok((
            Header {
                tag,
                length: Length::Indefinite,
            },
            2,
        ));
    }
    if first < 0x80 {
        return Ok((
            Header {
                tag,
                length: Length::Definite(first as usize),
            },
            2,
        ));
    }
    let num_octets = (first & 0x7f) as usize;
    if num_octets == 0x7f {
        return Err(EnvelopeError::BadData(
            "reserved length-of-length encoding".to_string(),
        ));
    }
    if num_octets > 4 {
        return Err(EnvelopeError::BadData(format!(
            "length field of {num_octets} octets exceeds the supported range"
        )));
    }
    if buf.len() < 2 + num_octets {
        return Err(EnvelopeError::Underflow);
    }
    let mut length = 0usize;
    for &b in &buf[2..2 + num_octets] {
        length = (length << 8) | b as usize;
    }
    if length > constants::MAX_DEFINITE_LENGTH {
        return Err(EnvelopeError::BadData(format!(
            "declared length {length} exceeds the structural limit"
        )));
    }
    Ok((
        Header {
            tag,
            length: Length::Definite(length),
        },
        2 + num_octets,
    ))
}

/// Read a header and require a specific tag.
pub fn expect_header(buf: &[u8], tag: u8) -> EnvelopeResult<(Length, usize)> {
    let (header, used) = read_header(buf)?;
    if header.tag != tag {
        return Err(EnvelopeError::BadData(format!(
            "expected tag 0x{tag:02x}, found 0x{:02x}",
            header.tag
        )));
    }
    Ok((header.length, used))
}

/// Read a complete primitive element with the given tag, returning its value
/// bytes and the total bytes consumed.
pub fn read_primitive<'a>(buf: &'a [u8], tag: u8) -> EnvelopeResult<(&'a [u8], usize)> {
    let (length, used) = expect_header(buf, tag)?;
    let len = match length {
        Length::Definite(n) => n,
        Length::Indefinite => {
            return Err(EnvelopeError::BadData(format!(
                "primitive element 0x{tag:02x} cannot use indefinite length"
            )))
        }
    };
    if buf.len() < used + len {
        return Err(EnvelopeError::Underflow);
    }
    Ok((&buf[used..used + len], used + len))
}

/// Read an OBJECT IDENTIFIER value.
pub fn read_oid<'a>(buf: &'a [u8]) -> EnvelopeResult<(&'a [u8], usize)> {
    let (value, used) = read_primitive(buf, constants::ASN1_OID_TAG)?;
    if value.is_empty() {
        return Err(EnvelopeError::BadData("empty OID".to_string()));
    }
    Ok((value, used))
}

/// Read an OCTET STRING value.
pub fn read_octet_string<'a>(buf: &'a [u8]) -> EnvelopeResult<(&'a [u8], usize)> {
    read_primitive(buf, constants::ASN1_OCTET_STRING_TAG)
}

/// Read a small non-negative INTEGER.
pub fn read_small_integer(buf: &[u8]) -> EnvelopeResult<(u32, usize)> {
    let (value, used) = read_primitive(buf, constants::ASN1_INTEGER_TAG)?;
    if value.is_empty() || value.len() > 4 {
        return Err(EnvelopeError::BadData(format!(
            "integer of {} bytes outside the supported range",
            value.len()
        )));
    }
    let mut n = 0u32;
    for &b in value {
        n = (n << 8) | b as u32;
    }
    Ok((n, used))
}

/// Probe for end-of-contents octets. Returns `(true, 2)` if EOC is present,
/// `(false, 0)` if some other element starts here. Underflows when fewer than
/// two bytes are available and the first byte is a zero (so the answer cannot
/// be decided yet).
pub fn check_end_of_contents(buf: &[u8]) -> EnvelopeResult<(bool, usize)> {
    match buf {
        [] => Err(EnvelopeError::Underflow),
        [0x00] => Err(EnvelopeError::Underflow),
        [0x00, 0x00, ..] => Ok((true, 2)),
        [0x00, _, ..] => Err(EnvelopeError::BadData(
            "half end-of-contents octet pair".to_string(),
        )),
        _ => Ok((false, 0)),
    }
}

/// Read an AlgorithmIdentifier: SEQUENCE { algorithm OID, parameters }.
/// Parameters may be absent, NULL, or an OCTET STRING (an IV). Returns the
/// OID value, the optional parameter bytes, and the total bytes consumed.
pub fn read_algorithm_identifier<'a>(
    buf: &'a [u8],
) -> EnvelopeResult<(&'a [u8], Option<&'a [u8]>, usize)> {
    let (length, hdr) = expect_header(buf, constants::ASN1_SEQUENCE_TAG)?;
    let body_len = match length {
        Length::Definite(n) => n,
        Length::Indefinite => {
            return Err(EnvelopeError::BadData(
                "AlgorithmIdentifier must use definite length".to_string(),
            ))
        }
    };
    if buf.len() < hdr + body_len {
        return Err(EnvelopeError::Underflow);
    }
    // The body is fully buffered from here on; a short inner field is a
    // structural defect, not missing input.
    let truncated = |err| match err {
        EnvelopeError::Underflow => EnvelopeError::BadData(
            "truncated field inside AlgorithmIdentifier".to_string(),
        ),
        other => other,
    };
    let body = &buf[hdr..hdr + body_len];
    let (oid, oid_used) = read_oid(body).map_err(truncated)?;
    let rest = &body[oid_used..];
    let params = match rest {
        [] => None,
        [0x05, 0x00] => None,
        _ => {
            let (iv, iv_used) = read_octet_string(rest).map_err(truncated)?;
            if iv_used != rest.len() {
                return Err(EnvelopeError::BadData(
                    "trailing bytes inside AlgorithmIdentifier".to_string(),
                ));
            }
            Some(iv)
        }
    };
    Ok((oid, params, hdr + body_len))
}

// === Writers ===

/// Encode a definite length field (short form below 128, long form above).
pub fn encode_length(length: usize) -> Vec<u8> {
    if length < 128 {
        vec![length as u8]
    } else if length < 256 {
        vec![constants::DER_LONG_FORM_1_BYTE, length as u8]
    } else if length < 65536 {
        vec![
            constants::DER_LONG_FORM_2_BYTE,
            (length >> 8) as u8,
            (length & 0xff) as u8,
        ]
    } else {
        vec![
            constants::DER_LONG_FORM_3_BYTE,
            ((length >> 16) & 0xff) as u8,
            ((length >> 8) & 0xff) as u8,
            (length & 0xff) as u8,
        ]
    }
}

/// Append a tag-length header.
pub fn write_header(out: &mut Vec<u8>, tag: u8, length: Length) {
    out.push(tag);
    match length {
        Length::Definite(n) => out.extend_from_slice(&encode_length(n)),
        Length::Indefinite => out.push(constants::BER_INDEFINITE_LENGTH),
    }
}

/// Append end-of-contents octets for one nesting level.
pub fn write_end_of_contents(out: &mut Vec<u8>) {
    out.extend_from_slice(constants::BER_EOC);
}

/// Append a complete OID element.
pub fn write_oid(out: &mut Vec<u8>, oid: &[u8]) {
    write_header(out, constants::ASN1_OID_TAG, Length::Definite(oid.len()));
    out.extend_from_slice(oid);
}

/// Append a complete primitive OCTET STRING element.
pub fn write_octet_string(out: &mut Vec<u8>, value: &[u8]) {
    write_header(
        out,
        constants::ASN1_OCTET_STRING_TAG,
        Length::Definite(value.len()),
    );
    out.extend_from_slice(value);
}

/// Append an AlgorithmIdentifier with NULL parameters.
pub fn write_algorithm_identifier(out: &mut Vec<u8>, oid: &[u8]) {
    let body_len = 2 + oid.len() + constants::ASN1_NULL.len();
    write_header(out, constants::ASN1_SEQUENCE_TAG, Length::Definite(body_len));
    write_oid(out, oid);
    out.extend_from_slice(constants::ASN1_NULL);
}

/// Append an AlgorithmIdentifier carrying an IV as its parameter.
pub fn write_algorithm_identifier_iv(out: &mut Vec<u8>, oid: &[u8], iv: &[u8]) {
    let body_len = 2 + oid.len() + 2 + iv.len();
    write_header(out, constants::ASN1_SEQUENCE_TAG, Length::Definite(body_len));
    write_oid(out, oid);
    write_octet_string(out, iv);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip_short_and_long() {
        for len in [0usize, 1, 127, 128, 255, 256, 65535, 65536, 1 << 20] {
            let mut out = Vec::new();
            write_header(&mut out, constants::ASN1_SEQUENCE_TAG, Length::Definite(len));
            let (header, used) = read_header(&out).expect("read back");
            assert_eq!(used, out.len());
            assert_eq!(header.tag, constants::ASN1_SEQUENCE_TAG);
            assert_eq!(header.length, Length::Definite(len));
        }
    }

    #[test]
    fn indefinite_header() {
        let mut out = Vec::new();
        write_header(&mut out, constants::ASN1_SEQUENCE_TAG, Length::Indefinite);
        assert_eq!(out, [0x30, 0x80]);
        let (header, used) = read_header(&out).unwrap();
        assert_eq!(used, 2);
        assert!(header.length.is_indefinite());
    }

    #[test]
    fn truncated_header_underflows() {
        assert!(matches!(read_header(&[0x30]), Err(EnvelopeError::Underflow)));
        // Long form promising two length octets but delivering one.
        assert!(matches!(
            read_header(&[0x30, 0x82, 0x01]),
            Err(EnvelopeError::Underflow)
        ));
    }

    #[test]
    fn truncated_primitive_underflows_without_consuming() {
        let mut out = Vec::new();
        write_octet_string(&mut out, &[1, 2, 3, 4]);
        let short = &out[..out.len() - 1];
        assert!(matches!(
            read_octet_string(short),
            Err(EnvelopeError::Underflow)
        ));
        let (value, used) = read_octet_string(&out).unwrap();
        assert_eq!(value, &[1, 2, 3, 4]);
        assert_eq!(used, out.len());
    }

    #[test]
    fn oversized_length_is_bad_data() {
        // 0x84 with a 256MiB length crosses MAX_DEFINITE_LENGTH.
        let buf = [0x30, 0x84, 0x10, 0x00, 0x00, 0x00];
        assert!(matches!(read_header(&buf), Err(EnvelopeError::BadData(_))));
    }

    #[test]
    fn eoc_probe() {
        assert_eq!(check_end_of_contents(&[0x00, 0x00, 0xff]).unwrap(), (true, 2));
        assert_eq!(check_end_of_contents(&[0x30, 0x80]).unwrap(), (false, 0));
        assert!(matches!(
            check_end_of_contents(&[0x00]),
            Err(EnvelopeError::Underflow)
        ));
        assert!(matches!(
            check_end_of_contents(&[]),
            Err(EnvelopeError::Underflow)
        ));
        assert!(matches!(
            check_end_of_contents(&[0x00, 0x01]),
            Err(EnvelopeError::BadData(_))
        ));
    }

    #[test]
    fn algorithm_identifier_roundtrip() {
        let mut out = Vec::new();
        write_algorithm_identifier(&mut out, constants::OID_SHA256);
        let (oid, params, used) = read_algorithm_identifier(&out).unwrap();
        assert_eq!(oid, constants::OID_SHA256);
        assert!(params.is_none());
        assert_eq!(used, out.len());

        let iv = [0xaa; 12];
        let mut out = Vec::new();
        write_algorithm_identifier_iv(&mut out, constants::OID_AES256_GCM, &iv);
        let (oid, params, used) = read_algorithm_identifier(&out).unwrap();
        assert_eq!(oid, constants::OID_AES256_GCM);
        assert_eq!(params, Some(&iv[..]));
        assert_eq!(used, out.len());
    }

    #[test]
    fn small_integer_roundtrip() {
        let buf = [0x02, 0x01, 0x01];
        assert_eq!(read_small_integer(&buf).unwrap(), (1, 3));
        let buf = [0x02, 0x02, 0x01, 0x00];
        assert_eq!(read_small_integer(&buf).unwrap(), (256, 4));
    }
}
