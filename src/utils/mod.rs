//! Common utilities and helper functions

pub mod retry;

/// Java `String.hashCode` over UTF-16 code units.
///
/// Hash-based sharding strategies use it so that every deployment sharing a
/// registry derives the same order for the same job name.
pub fn java_string_hash(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Current process id
pub fn process_id() -> u32 {
    std::process::id()
}
