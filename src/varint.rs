//! # Varint and Blob Codec
//!
//! Purpose: Provide the self-delimiting base-128 varint and the map/list
//! blob format built on top of it. `play_script` itself frames requests and
//! responses with plain `u32` length prefixes, but its server-side scripts
//! may themselves produce or consume values encoded in this varint-prefixed
//! blob shape — the format the server's own scripting layer uses
//! internally. Exposed here as a standalone codec so callers can build or
//! parse such values.

use crate::error::{Error, Result};

/// Largest value `write_varint` accepts (`2^56 - 1`); matches the 8-byte cap
/// the wire format allows.
pub const VARINT_MAX: u64 = (1u64 << 56) - 1;

/// Encodes `n` as 1-8 big-endian base-128 digits and appends them to `out`.
///
/// Every byte but the last has its high bit set. Fails with
/// [`Error::BadArgument`] if `n >= 2^56`.
pub fn write_varint(n: u64, out: &mut Vec<u8>) -> Result<()> {
    if n > VARINT_MAX {
        return Err(Error::BadArgument(format!(
            "varint value {n} exceeds 2^56-1"
        )));
    }

    let mut digits = [0u8; 8];
    let mut len = 0;
    let mut rest = n;
    loop {
        digits[len] = (rest & 0x7f) as u8;
        rest >>= 7;
        len += 1;
        if rest == 0 {
            break;
        }
    }

    // digits were pushed least-significant-first; emit most-significant-first
    // with continuation bits set on every byte but the last.
    for idx in (1..len).rev() {
        out.push(digits[idx] | 0x80);
    }
    out.push(digits[0]);
    Ok(())
}

/// Reads one varint from the front of `data`, returning the decoded value and
/// the number of bytes consumed.
///
/// Fails with [`Error::Protocol`] if `data` is exhausted before a
/// terminating (high-bit-clear) byte is found.
pub fn read_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for (idx, &byte) in data.iter().enumerate() {
        value = (value << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok((value, idx + 1));
        }
    }
    Err(Error::Protocol("truncated varint".into()))
}

/// Serializes an ordered `(key, value)` sequence into the varint-prefixed
/// blob format: `varint(klen) varint(vlen) key value`, repeated.
pub fn encode_blob_map<'a, I>(entries: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut out = Vec::new();
    for (key, value) in entries {
        write_varint(key.len() as u64, &mut out)?;
        write_varint(value.len() as u64, &mut out)?;
        out.extend_from_slice(key);
        out.extend_from_slice(value);
    }
    Ok(out)
}

/// Parses the varint-prefixed blob map format back into `(key, value)` pairs.
///
/// Fails with [`Error::Protocol`] on any truncated item.
pub fn decode_blob_map(data: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let (klen, consumed) = read_varint(&data[pos..])?;
        pos += consumed;
        let (vlen, consumed) = read_varint(&data[pos..])?;
        pos += consumed;

        let klen = klen as usize;
        let vlen = vlen as usize;
        let key_end = pos.checked_add(klen).ok_or(truncated())?;
        let value_end = key_end.checked_add(vlen).ok_or(truncated())?;
        if value_end > data.len() {
            return Err(truncated());
        }

        out.push((data[pos..key_end].to_vec(), data[key_end..value_end].to_vec()));
        pos = value_end;
    }
    Ok(out)
}

/// Serializes an ordered byte-string sequence into the varint-prefixed blob
/// list format: `varint(len) bytes`, repeated.
pub fn encode_blob_list<'a, I>(items: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = Vec::new();
    for item in items {
        write_varint(item.len() as u64, &mut out)?;
        out.extend_from_slice(item);
    }
    Ok(out)
}

/// Parses the varint-prefixed blob list format back into byte strings.
pub fn decode_blob_list(data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let (len, consumed) = read_varint(&data[pos..])?;
        pos += consumed;
        let end = pos.checked_add(len as usize).ok_or(truncated())?;
        if end > data.len() {
            return Err(truncated());
        }
        out.push(data[pos..end].to_vec());
        pos = end;
    }
    Ok(out)
}

fn truncated() -> Error {
    Error::Protocol("truncated blob item".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(n: u64) {
        let mut buf = Vec::new();
        write_varint(n, &mut buf).unwrap();
        let (value, consumed) = read_varint(&buf).unwrap();
        assert_eq!(value, n);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn varint_roundtrip_boundaries() {
        let boundaries = [
            0,
            1,
            0x7f,
            0x80,
            (1 << 14) - 1,
            1 << 14,
            (1 << 21) - 1,
            1 << 21,
            (1 << 49) - 1,
            1 << 49,
            VARINT_MAX,
        ];
        for &n in &boundaries {
            roundtrip(n);
        }
    }

    #[test]
    fn varint_roundtrip_sampled_range() {
        // Exhaustive over 2^56 is infeasible; sample densely near byte-count
        // transitions and a spread of the rest.
        for shift in 0..56 {
            for delta in [-1i64, 0, 1, 37] {
                let n = (1i64 << shift).saturating_add(delta);
                if n >= 0 && (n as u64) <= VARINT_MAX {
                    roundtrip(n as u64);
                }
            }
        }
    }

    #[test]
    fn write_rejects_too_large() {
        let mut buf = Vec::new();
        let err = write_varint(VARINT_MAX + 1, &mut buf).unwrap_err();
        assert!(matches!(err, Error::BadArgument(_)));
    }

    #[test]
    fn read_rejects_truncated_input() {
        let err = read_varint(&[0x80, 0x81]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn single_byte_values_have_no_continuation_bit() {
        let mut buf = Vec::new();
        write_varint(42, &mut buf).unwrap();
        assert_eq!(buf, vec![42]);
    }

    #[test]
    fn multi_byte_values_set_continuation_on_all_but_last() {
        let mut buf = Vec::new();
        write_varint(300, &mut buf).unwrap();
        assert_eq!(buf.len(), 2);
        assert_eq!(buf[0] & 0x80, 0x80);
        assert_eq!(buf[1] & 0x80, 0);
    }

    #[test]
    fn blob_map_roundtrip() {
        let entries: Vec<(&[u8], &[u8])> = vec![
            (b"k1", b"v1"),
            (b"", b"empty-key-value"),
            (b"binary\x00key", b"\x01\x02\x03"),
        ];
        let encoded = encode_blob_map(entries.iter().copied()).unwrap();
        let decoded = decode_blob_map(&encoded).unwrap();
        let expected: Vec<(Vec<u8>, Vec<u8>)> = entries
            .into_iter()
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn blob_map_empty_roundtrip() {
        let encoded = encode_blob_map(std::iter::empty()).unwrap();
        assert!(encoded.is_empty());
        assert_eq!(decode_blob_map(&encoded).unwrap(), Vec::new());
    }

    #[test]
    fn blob_list_roundtrip() {
        let items: Vec<&[u8]> = vec![b"a", b"", b"longer item here"];
        let encoded = encode_blob_list(items.iter().copied()).unwrap();
        let decoded = decode_blob_list(&encoded).unwrap();
        let expected: Vec<Vec<u8>> = items.into_iter().map(|i| i.to_vec()).collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn blob_map_truncated_item_is_corrupt() {
        let mut encoded = encode_blob_map(vec![(b"k".as_slice(), b"v".as_slice())]).unwrap();
        encoded.pop();
        let err = decode_blob_map(&encoded).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn blob_list_truncated_item_is_corrupt() {
        let mut encoded = encode_blob_list(vec![b"hello".as_slice()]).unwrap();
        encoded.truncate(2);
        let err = decode_blob_list(&encoded).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
