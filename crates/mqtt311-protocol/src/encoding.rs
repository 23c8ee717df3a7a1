//! Primitive field codecs shared by all packets: the variable-length
//! remaining-length integer and 16-bit length-prefixed strings and
//! byte fields.

use bytes::{Buf, BufMut};

use crate::error::{MqttError, Result};

/// Largest value representable by the 4-byte remaining-length field.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Number of bytes the remaining-length field uses for `len`.
#[must_use]
pub fn remaining_length_len(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Encodes the remaining-length field and returns the bytes written.
///
/// # Errors
/// Returns an encode error if `len` exceeds [`MAX_REMAINING_LENGTH`].
pub fn encode_remaining_length<B: BufMut>(buf: &mut B, len: usize) -> Result<usize> {
    if len > MAX_REMAINING_LENGTH {
        return Err(MqttError::Encode(format!(
            "remaining length {len} exceeds maximum {MAX_REMAINING_LENGTH}"
        )));
    }

    let mut value = len;
    let mut written = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        written += 1;
        if value == 0 {
            return Ok(written);
        }
    }
}

/// Decodes the remaining-length field.
///
/// # Errors
/// Returns a decode error on a truncated buffer or when the fourth
/// length byte still has its continuation bit set.
pub fn decode_remaining_length<B: Buf>(buf: &mut B) -> Result<usize> {
    let mut value: usize = 0;
    let mut shift = 0u32;
    for _ in 0..4 {
        if !buf.has_remaining() {
            return Err(MqttError::Decode("truncated remaining length".to_string()));
        }
        let byte = buf.get_u8();
        value |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err(MqttError::Decode(
        "remaining length exceeds 4 bytes".to_string(),
    ))
}

/// Encodes a UTF-8 string with a 16-bit big-endian length prefix.
///
/// # Errors
/// Returns an encode error if the string is longer than 65 535 bytes.
pub fn encode_string<B: BufMut>(buf: &mut B, s: &str) -> Result<()> {
    encode_bytes(buf, s.as_bytes())
}

/// Decodes a 16-bit length-prefixed UTF-8 string.
///
/// # Errors
/// Returns a decode error on a truncated prefix, truncated payload,
/// or invalid UTF-8.
pub fn decode_string<B: Buf>(buf: &mut B) -> Result<String> {
    let bytes = decode_bytes(buf)?;
    String::from_utf8(bytes).map_err(|_| MqttError::Decode("invalid UTF-8 in string".to_string()))
}

/// Encodes a byte field with a 16-bit big-endian length prefix.
///
/// # Errors
/// Returns an encode error if the field is longer than 65 535 bytes.
pub fn encode_bytes<B: BufMut>(buf: &mut B, bytes: &[u8]) -> Result<()> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| MqttError::Encode(format!("field too long: {} bytes", bytes.len())))?;
    buf.put_u16(len);
    buf.put_slice(bytes);
    Ok(())
}

/// Decodes a 16-bit length-prefixed byte field.
///
/// # Errors
/// Returns a decode error on a truncated prefix or payload.
pub fn decode_bytes<B: Buf>(buf: &mut B) -> Result<Vec<u8>> {
    if buf.remaining() < 2 {
        return Err(MqttError::Decode("truncated length prefix".to_string()));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(MqttError::Decode(format!(
            "field length {len} exceeds remaining {} bytes",
            buf.remaining()
        )));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

/// Byte count of a length-prefixed field holding `len` payload bytes.
#[must_use]
pub fn prefixed_len(len: usize) -> usize {
    2 + len
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    #[test]
    fn test_remaining_length_boundaries() {
        let cases: [(usize, usize); 8] = [
            (0, 1),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
            (268_435_455, 4),
        ];

        for (value, expected_len) in cases {
            let mut buf = BytesMut::new();
            let written = encode_remaining_length(&mut buf, value).unwrap();
            assert_eq!(written, expected_len, "encoded width for {value}");
            assert_eq!(remaining_length_len(value), expected_len);

            let mut rd = buf.freeze();
            assert_eq!(decode_remaining_length(&mut rd).unwrap(), value);
            assert!(!rd.has_remaining());
        }
    }

    #[test]
    fn test_remaining_length_overflow() {
        let mut buf = BytesMut::new();
        assert!(encode_remaining_length(&mut buf, 268_435_456).is_err());

        // Five bytes with continuation still set on the fourth.
        let mut rd = &[0xFF, 0xFF, 0xFF, 0xFF, 0x7F][..];
        assert!(decode_remaining_length(&mut rd).is_err());
    }

    #[test]
    fn test_remaining_length_truncated() {
        let mut rd = &[0x80][..];
        assert!(decode_remaining_length(&mut rd).is_err());
    }

    #[test]
    fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        encode_string(&mut buf, "a/b/c").unwrap();
        assert_eq!(buf.len(), prefixed_len(5));

        let mut rd = buf.freeze();
        assert_eq!(decode_string(&mut rd).unwrap(), "a/b/c");
    }

    #[test]
    fn test_string_truncated() {
        // Prefix claims 5 bytes, only 2 present.
        let mut rd = &[0x00, 0x05, b'a', b'b'][..];
        assert!(decode_string(&mut rd).is_err());

        let mut rd = &[0x00][..];
        assert!(decode_string(&mut rd).is_err());
    }

    #[test]
    fn test_string_invalid_utf8() {
        let mut rd = &[0x00, 0x02, 0xC3, 0x28][..];
        assert!(decode_string(&mut rd).is_err());
    }

    proptest! {
        #[test]
        fn prop_remaining_length_round_trip(value in 0usize..=268_435_455) {
            let mut buf = BytesMut::new();
            let written = encode_remaining_length(&mut buf, value).unwrap();
            prop_assert_eq!(written, remaining_length_len(value));
            let mut rd = buf.freeze();
            prop_assert_eq!(decode_remaining_length(&mut rd).unwrap(), value);
        }

        #[test]
        fn prop_bytes_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut buf = BytesMut::new();
            encode_bytes(&mut buf, &payload).unwrap();
            let mut rd = buf.freeze();
            prop_assert_eq!(decode_bytes(&mut rd).unwrap(), payload);
        }
    }
}
