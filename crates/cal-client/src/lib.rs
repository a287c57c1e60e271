// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for the CAL application-logging protocol.
//!
//! Events, transactions and SQL statements are encoded into framed records
//! and shipped to a CAL collector over TCP by a background dispatcher.
//! Logging never blocks the caller and never fails because the collector is
//! unreachable.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod backoff;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod correlation;
pub mod dispatcher;
pub mod errors;
pub mod hostname;
pub mod identity;
pub mod overflow;
pub mod status;
pub mod transaction;

pub use client::{Client, Message};
pub use codec::{Frame, MessageKind, ParsedMessage};
pub use config::Config;
pub use dispatcher::DispatcherStats;
pub use errors::CalError;
pub use status::Status;
pub use transaction::{Failure, StatusError, Transaction, TransactionMsg, TransactionSpec};
