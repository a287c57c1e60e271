// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Correlation ids and the FNV hashes CAL uses.
//!
//! A correlation id ties together every transaction an execution context
//! logs. It is derived once per context from the hostname, process id and
//! the current time, and cached in the context until it ends.

use std::hash::Hasher;
use std::time::{SystemTime, UNIX_EPOCH};

use fnv::FnvHasher;

use crate::context;
use crate::hostname;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
/// Offset basis of the FNV-1a variant collectors use for SQL statements.
const SQL_OFFSET_BASIS: u64 = 0x8422_2325_cbf2_9ce4;

pub const CORRELATION_FIELD: &str = "corr_id_";

/// 64-bit FNV-1 (multiply, then xor).
#[must_use]
pub fn fnv1_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        hash.wrapping_mul(FNV_PRIME) ^ u64::from(b)
    })
}

/// 64-bit FNV-1a with the SQL offset basis.
#[must_use]
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::with_key(SQL_OFFSET_BASIS);
    hasher.write(bytes);
    hasher.finish()
}

/// Hash identifying a SQL statement, folded to 32 bits.
#[must_use]
pub fn sql_hash(query: &str) -> u32 {
    let hash = fnv1a_64(query.as_bytes());
    ((hash >> 32) ^ (hash & 0xFFFF_FFFF)) as u32
}

/// Formats a correlation id from its inputs.
#[must_use]
pub fn compose_correlation_id(host: &str, pid: u32, secs: u64, micros: u32) -> String {
    let seed = format!("{host}{pid}{secs}{micros}");
    format!("{:x}{:x}", fnv1_64(seed.as_bytes()) & 0xFFFF_FFFF, micros)
}

/// A fresh correlation id for this host, process and instant.
#[must_use]
pub fn generate_correlation_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    compose_correlation_id(
        hostname::hostname(),
        std::process::id(),
        now.as_secs(),
        now.subsec_micros(),
    )
}

/// The calling context's correlation id, generated on first use.
#[must_use]
pub fn current_correlation_id() -> String {
    context::correlation_id(generate_correlation_id)
}

/// Appends `corr_id_=<id>` to URL-encoded `data` unless it already carries
/// one.
#[must_use]
pub fn add_correlation_id(data: &str) -> String {
    if data.contains(CORRELATION_FIELD) {
        return data.to_string();
    }
    let id = current_correlation_id();
    if data.is_empty() {
        format!("{CORRELATION_FIELD}={id}")
    } else {
        format!("{data}&{CORRELATION_FIELD}={id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1_reference_values() {
        assert_eq!(fnv1_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1_64(b"a"), 0xaf63_bd4c_8601_b7be);
        assert_eq!(fnv1_64(b"select * from t"), 0x0c55_5e64_7264_6ded);
    }

    #[test]
    fn test_fnv1a_uses_sql_basis() {
        assert_eq!(fnv1a_64(b""), SQL_OFFSET_BASIS);
        assert_eq!(fnv1a_64(b"a"), 0x789e_3e39_8d3f_f5ff);
    }

    #[test]
    fn test_sql_hash_folds_halves() {
        assert_eq!(sql_hash(""), 1_339_080_641);
        assert_eq!(sql_hash("a"), 4_121_021_382);
        assert_eq!(sql_hash("select * from t"), 3_395_790_354);
    }

    #[test]
    fn test_compose_correlation_id() {
        assert_eq!(
            compose_correlation_id("host", 123, 1_700_000_000, 123_456),
            "97bcd1081e240"
        );
    }

    #[test]
    fn test_correlation_id_stable_within_context() {
        let (first, second) = context::run_in_context(|| {
            (current_correlation_id(), current_correlation_id())
        });
        assert_eq!(first, second);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_add_correlation_id() {
        context::run_in_context(|| {
            context::set_correlation_id("beef");
            assert_eq!(add_correlation_id(""), "corr_id_=beef");
            assert_eq!(add_correlation_id("a=1"), "a=1&corr_id_=beef");
            assert_eq!(add_correlation_id("corr_id_=up"), "corr_id_=up");
        });
    }
}
