// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced synchronously by the CAL client.
///
/// Transport failures never show up here once the dispatcher is running; they
/// are retried in the background. Only programmer misuse and setup problems
/// reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum CalError {
    #[error("Unrecognized CAL message kind: {0:?}")]
    UnknownMessageKind(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
