//! DER encoding of entitlements for the slot -7 blob
//!
//! Apple's DER entitlements use a small subset of ASN.1:
//! - 0x01: BOOLEAN
//! - 0x02: INTEGER
//! - 0x0c: UTF8String
//! - 0x30: SEQUENCE (arrays, and each dictionary entry)
//! - 0x31: SET (dictionaries)
//!
//! Dictionary entries are emitted in map order so the output stays stable
//! for a given insertion order.

use crate::{Error, Result};
use plist::Value;

const DER_TAG_BOOLEAN: u8 = 0x01;
const DER_TAG_INTEGER: u8 = 0x02;
const DER_TAG_UTF8STRING: u8 = 0x0c;
const DER_TAG_SEQUENCE: u8 = 0x30;
const DER_TAG_SET: u8 = 0x31;

/// Append a DER length, short form below 128.
fn encode_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        output.push(length as u8);
    } else {
        let bytes_needed = (usize::BITS - length.leading_zeros()).div_ceil(8) as usize;
        output.push(0x80 | bytes_needed as u8);
        for i in (0..bytes_needed).rev() {
            output.push((length >> (i * 8)) as u8);
        }
    }
}

fn write_tlv(output: &mut Vec<u8>, tag: u8, content: &[u8]) {
    output.push(tag);
    encode_length(output, content.len());
    output.extend_from_slice(content);
}

/// Minimal two's-complement big-endian bytes of `value`.
fn integer_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let (cur, next) = (bytes[start], bytes[start + 1]);
        let redundant = (cur == 0x00 && next & 0x80 == 0) || (cur == 0xff && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn encode_value(output: &mut Vec<u8>, key_path: &str, value: &Value) -> Result<()> {
    match value {
        Value::Boolean(b) => write_tlv(output, DER_TAG_BOOLEAN, &[if *b { 0xff } else { 0x00 }]),
        Value::Integer(i) => {
            let value = match (i.as_signed(), i.as_unsigned()) {
                (Some(v), _) => v,
                (None, Some(_)) => {
                    return Err(Error::Signing(format!(
                        "entitlement {key_path}: integer out of range"
                    )))
                }
                (None, None) => 0,
            };
            write_tlv(output, DER_TAG_INTEGER, &integer_bytes(value));
        }
        Value::String(s) => write_tlv(output, DER_TAG_UTF8STRING, s.as_bytes()),
        Value::Array(items) => {
            let mut content = Vec::new();
            for item in items {
                encode_value(&mut content, key_path, item)?;
            }
            write_tlv(output, DER_TAG_SEQUENCE, &content);
        }
        Value::Dictionary(dict) => encode_dictionary(output, key_path, dict)?,
        _ => {
            return Err(Error::Signing(format!(
                "entitlement {key_path}: value type has no DER form"
            )))
        }
    }
    Ok(())
}

fn encode_dictionary(output: &mut Vec<u8>, key_path: &str, dict: &plist::Dictionary) -> Result<()> {
    let mut set_content = Vec::new();
    for (key, value) in dict {
        let path = if key_path.is_empty() {
            key.clone()
        } else {
            format!("{key_path}.{key}")
        };
        let mut pair = Vec::new();
        write_tlv(&mut pair, DER_TAG_UTF8STRING, key.as_bytes());
        encode_value(&mut pair, &path, value)?;
        write_tlv(&mut set_content, DER_TAG_SEQUENCE, &pair);
    }
    write_tlv(output, DER_TAG_SET, &set_content);
    Ok(())
}

/// Encode an entitlements dictionary as DER.
///
/// Data, date and real values have no DER form and are rejected.
pub fn encode_entitlements(dict: &plist::Dictionary) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    encode_dictionary(&mut output, "", dict)?;
    Ok(output)
}
