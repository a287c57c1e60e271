// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hostname reported in the machine header.

use std::env;
use std::sync::OnceLock;

use tracing::warn;

static HOSTNAME: OnceLock<String> = OnceLock::new();

/// The process hostname, detected once and cached.
pub fn hostname() -> &'static str {
    HOSTNAME.get_or_init(detect_hostname)
}

/// Detects the hostname, in order of preference:
/// 1. `CAL_HOSTNAME`
/// 2. `HOSTNAME`
/// 3. the system hostname
/// 4. `"unknown"`
#[must_use]
pub fn detect_hostname() -> String {
    detect_hostname_with(|var| env::var(var).ok())
}

fn detect_hostname_with(var: impl Fn(&str) -> Option<String>) -> String {
    for name in ["CAL_HOSTNAME", "HOSTNAME"] {
        if let Some(hostname) = var(name).filter(|h| !h.is_empty()) {
            return hostname;
        }
    }

    if let Some(hostname) = system_hostname() {
        return hostname;
    }

    warn!("Could not determine hostname, using 'unknown'");
    "unknown".to_string()
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    match nix::unistd::gethostname() {
        Ok(hostname) => hostname
            .to_str()
            .filter(|h| !h.is_empty())
            .map(str::to_string),
        Err(e) => {
            warn!("Failed to get system hostname: {}", e);
            None
        }
    }
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    env::var("COMPUTERNAME").ok().filter(|h| !h.is_empty())
}
