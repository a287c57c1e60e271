// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! CAL status codes.
//!
//! Statuses travel as short strings on the wire. The well-known values are
//! single characters, but collectors accept anything, so [`Status`] keeps the
//! raw text and only normalizes integers to their decimal form.

use std::fmt;

/// Processing succeeded.
pub const SUCCESS: &str = "0";
/// System failure that lead to a failure in processing.
pub const FATAL: &str = "1";
/// Input errors that lead to a failure in processing.
pub const ERROR: &str = "2";
pub const WARNING: &str = "3";
pub const UNKNOWN: &str = "U";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Status(String);

impl Status {
    #[must_use]
    pub fn success() -> Self {
        Status(SUCCESS.to_string())
    }

    #[must_use]
    pub fn fatal() -> Self {
        Status(FATAL.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether this status is too mild to describe a failed transaction.
    ///
    /// Success and warning statuses are promoted when an error escapes a
    /// transaction scope.
    #[must_use]
    pub fn below_error(&self) -> bool {
        matches!(self.0.as_bytes().first(), Some(b'0') | Some(b'3'))
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::success()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Status {
    fn from(value: &str) -> Self {
        Status(value.to_string())
    }
}

impl From<String> for Status {
    fn from(value: String) -> Self {
        Status(value)
    }
}

impl From<&Status> for Status {
    fn from(value: &Status) -> Self {
        value.clone()
    }
}

macro_rules! status_from_int {
    ($($int:ty),*) => {
        $(
            impl From<$int> for Status {
                fn from(value: $int) -> Self {
                    Status(value.to_string())
                }
            }
        )*
    };
}

status_from_int!(u8, u16, u32, u64, i32, i64);
