use xxhash_rust::xxh64::xxh64;

use crate::types::NodeKind;

const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Encode a u64 value as a base62 string (11 chars, zero-padded).
fn base62_encode(mut value: u64) -> String {
    let mut result = Vec::with_capacity(11);
    while value > 0 {
        let idx = (value % 62) as usize;
        result.push(BASE62_CHARS[idx] as char);
        value /= 62;
    }
    while result.len() < 11 {
        result.push('0');
    }
    result.iter().rev().collect()
}

/// Collapse runs of whitespace so formatting-only edits do not change a UID.
pub fn normalize_signature(signature: &str) -> String {
    signature.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hash of the normalized signature text, base62-encoded.
pub fn signature_hash(signature: &str) -> String {
    base62_encode(xxh64(normalize_signature(signature).as_bytes(), 0))
}

/// Compute the stable structural UID for an interface node.
///
/// uid = base62(xxhash64(module_path + kind + name + signature_hash + owner))
///
/// `owner` is the UID of the enclosing impl block for associated items and is
/// empty otherwise, so two `fmt` methods in one module stay distinct.
pub fn compute_uid(module_path: &str, kind: NodeKind, name: &str, signature: &str, owner: &str) -> String {
    let sig_hash = signature_hash(signature);
    let mut input = String::with_capacity(
        module_path.len() + name.len() + sig_hash.len() + owner.len() + 16,
    );
    input.push_str(module_path);
    input.push('\0');
    input.push_str(kind.as_str());
    input.push('\0');
    input.push_str(name);
    input.push('\0');
    input.push_str(&sig_hash);
    input.push('\0');
    input.push_str(owner);
    base62_encode(xxh64(input.as_bytes(), 0))
}

/// Content hash over a set of `(path, content)` pairs.
///
/// Pairs are sorted by path first, so the result does not depend on the
/// order the edits were produced in.
pub fn content_hash<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut parts: Vec<(&str, &str)> = parts.into_iter().collect();
    parts.sort();
    let mut input = String::new();
    for (path, content) in parts {
        input.push_str(path);
        input.push('\0');
        input.push_str(content);
        input.push('\u{1}');
    }
    base62_encode(xxh64(input.as_bytes(), 0))
}
