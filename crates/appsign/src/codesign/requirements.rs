//! Designated requirement blobs
//!
//! Requirements are compiled expressions of Apple's requirement language.
//! The blob produced here is the one Xcode emits for development and
//! distribution signing:
//!
//! ```text
//! identifier "<id>" and anchor apple generic
//!     and certificate leaf[subject.CN] = "<common name>"
//!     and certificate 1[field.1.2.840.113635.100.6.2.1] exists
//! ```
//!
//! Binary operators are prefix-encoded, so `a and b and c and d` is written
//! as `and(a, and(b, and(c, d)))`.

use super::constants::*;
use super::superblob::wrap_blob;

/// Requirement set with no entries.
pub fn empty_requirements() -> Vec<u8> {
    wrap_blob(CSMAGIC_REQUIREMENTS, &0u32.to_be_bytes())
}

/// Length-prefixed, 4-byte padded data operand.
fn push_data(expr: &mut Vec<u8>, data: &[u8]) {
    expr.extend(&(data.len() as u32).to_be_bytes());
    expr.extend(data);
    let padding = (4 - data.len() % 4) % 4;
    expr.extend(std::iter::repeat(0u8).take(padding));
}

fn push_op(expr: &mut Vec<u8>, op: u32) {
    expr.extend(&op.to_be_bytes());
}

/// Compile the designated requirement for `identifier` signed by a
/// certificate with `common_name`.
pub fn designated_requirement(identifier: &str, common_name: &str) -> Vec<u8> {
    let mut expr = Vec::new();
    push_op(&mut expr, REQUIREMENT_KIND_EXPR);

    push_op(&mut expr, OP_AND);
    push_op(&mut expr, OP_IDENT);
    push_data(&mut expr, identifier.as_bytes());

    push_op(&mut expr, OP_AND);
    push_op(&mut expr, OP_APPLE_GENERIC_ANCHOR);

    push_op(&mut expr, OP_AND);
    push_op(&mut expr, OP_CERT_FIELD);
    expr.extend(&0i32.to_be_bytes()); // leaf
    push_data(&mut expr, b"subject.CN");
    push_op(&mut expr, MATCH_EQUAL);
    push_data(&mut expr, common_name.as_bytes());

    push_op(&mut expr, OP_CERT_GENERIC);
    expr.extend(&1i32.to_be_bytes());
    push_data(&mut expr, OID_APPLE_WWDR_INTERMEDIATE);
    push_op(&mut expr, MATCH_EXISTS);

    let requirement = wrap_blob(CSMAGIC_REQUIREMENT, &expr);

    // Set header: magic, length, count, then (type, offset) per requirement.
    let offset = (BLOB_HEADER_SIZE + 4 + 8) as u32;
    let mut payload = Vec::with_capacity(12 + requirement.len());
    payload.extend(&1u32.to_be_bytes());
    payload.extend(&CSREQ_DESIGNATED.to_be_bytes());
    payload.extend(&offset.to_be_bytes());
    payload.extend(&requirement);

    wrap_blob(CSMAGIC_REQUIREMENTS, &payload)
}
