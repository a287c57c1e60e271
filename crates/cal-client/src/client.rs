// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The CAL client.
//!
//! Every emit call encodes its frame on the caller's thread, tags it with the
//! calling context's identity and hands it to the dispatcher without
//! blocking. Transport trouble never reaches the caller.

use std::fmt::Display;
use std::future::Future;
use std::io;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, error};

use crate::codec::{self, MessageKind, IDENTITY_MASK};
use crate::config::{Config, DEFAULT_ENVIRONMENT};
use crate::connection::{Connection, MachineHeader};
use crate::context;
use crate::correlation::{add_correlation_id, sql_hash};
use crate::dispatcher::{Dispatcher, DispatcherStats, HEARTBEAT_IDENTITY};
use crate::errors::CalError;
use crate::identity::IdentityAllocator;
use crate::overflow::{is_overloaded, overflow_tag, OverflowBuffers};
use crate::status::Status;
use crate::transaction::{Transaction, TransactionSpec};

/// Fields of one message. Unused fields are ignored by the chosen kind.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub cal_type: String,
    pub name: String,
    pub status: Status,
    /// Data payload, or the statement for SQL messages.
    pub data: String,
    /// Rendered duration of transaction frames, in milliseconds.
    pub duration: String,
    /// Wire identity to use instead of the calling context's.
    pub identity: Option<u32>,
    /// Statement hash; computed from the statement when unset.
    pub sql_hash: Option<u32>,
}

impl Message {
    #[must_use]
    pub fn new(cal_type: &str, name: &str) -> Self {
        Message {
            cal_type: cal_type.to_string(),
            name: name.to_string(),
            ..Message::default()
        }
    }

    #[must_use]
    pub fn status(mut self, status: impl Into<Status>) -> Self {
        self.status = status.into();
        self
    }

    #[must_use]
    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = codec::format_duration(duration);
        self
    }

    #[must_use]
    pub fn identity(mut self, identity: u32) -> Self {
        self.identity = Some(identity);
        self
    }
}

#[derive(Debug)]
struct DispatchRuntime {
    pid: u32,
    dispatcher: Arc<Dispatcher>,
}

#[derive(Debug)]
struct Inner {
    config: Config,
    header: MachineHeader,
    identities: IdentityAllocator,
    overflow: OverflowBuffers,
    runtime: Mutex<DispatchRuntime>,
    closed: AtomicBool,
}

fn spawn_dispatcher(config: &Config, header: &MachineHeader) -> io::Result<Arc<Dispatcher>> {
    let dispatcher = Dispatcher::new(config.dispatcher.clone());
    let connection = Connection::new(
        &config.host,
        config.port,
        config.connect_timeout,
        header.clone(),
    );
    dispatcher.start(connection)?;
    Ok(Arc::new(dispatcher))
}

impl Inner {
    /// The dispatcher owned by this process, rebuilt after a fork.
    fn dispatcher(&self) -> Arc<Dispatcher> {
        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        let pid = std::process::id();
        if runtime.pid != pid && !self.closed.load(Ordering::Acquire) {
            match spawn_dispatcher(&self.config, &self.header) {
                Ok(fresh) => {
                    let stale = std::mem::replace(&mut runtime.dispatcher, fresh);
                    // its worker thread does not exist in this process
                    std::mem::forget(stale);
                    runtime.pid = pid;
                    debug!("Process id changed to {pid}, restarted CAL dispatcher");
                }
                Err(e) => error!("Failed to restart CAL dispatcher after fork: {e}"),
            }
        }
        Arc::clone(&runtime.dispatcher)
    }

    fn suppressed(&self, status: &Status) -> bool {
        let min_status = self.config.min_status.as_str();
        !status.is_empty() && min_status != "0" && status.as_str() > min_status
    }

    fn current_identity(&self) -> u32 {
        let alias = self.identities.acquire_current();
        let identity = (u64::from(std::process::id()) << 16) + u64::from(alias);
        (identity & u64::from(IDENTITY_MASK)) as u32
    }

    fn body(&self, kind: MessageKind, message: &Message) -> String {
        let Message {
            cal_type,
            name,
            status,
            data,
            duration,
            ..
        } = message;
        match kind {
            MessageKind::Heartbeat => codec::heartbeat(cal_type, name, status, data),
            MessageKind::Event => codec::event(cal_type, name, status, data),
            MessageKind::StartTransaction => codec::start_transaction(cal_type, name),
            MessageKind::DataFragment => codec::data_fragment(data),
            MessageKind::EndTransaction => {
                if self.config.environment == DEFAULT_ENVIRONMENT {
                    let data = add_correlation_id(data);
                    codec::end_transaction(cal_type, name, status, duration, &data)
                } else {
                    codec::end_transaction(cal_type, name, status, duration, data)
                }
            }
            MessageKind::AtomicTransaction => {
                codec::atomic_transaction(cal_type, name, status, duration, data)
            }
            MessageKind::Sql => {
                let hash = message.sql_hash.unwrap_or_else(|| sql_hash(data));
                codec::sql(data, hash)
            }
        }
    }

    /// Emits `message`. A `pinned` wire identity is used as is; otherwise
    /// the message's own identity, then the calling context's.
    fn emit(&self, kind: MessageKind, message: &Message, pinned: Option<u32>) {
        if kind == MessageKind::Event && self.suppressed(&message.status) {
            return;
        }
        let identity = match (pinned, message.identity) {
            (Some(identity), _) => identity,
            (None, None) => self.current_identity(),
            (None, Some(0)) => HEARTBEAT_IDENTITY,
            (None, Some(identity)) => identity,
        };
        let body = self.body(kind, message);

        let frames = if is_overloaded(identity) {
            let frame = codec::pack(&body, overflow_tag(identity), true);
            self.overflow.record(identity, frame)
        } else {
            vec![codec::pack(&body, identity, true)]
        };
        if !frames.is_empty() {
            self.dispatcher().enqueue_batch(frames);
        }
    }
}

/// Handle to a CAL client. Cheap to clone; clones share one dispatcher.
///
/// A disabled client accepts every call and sends nothing.
#[derive(Debug, Clone, Default)]
pub struct Client {
    inner: Option<Arc<Inner>>,
}

impl Client {
    /// Validates `config` and starts the dispatcher. A config with
    /// `enabled: false` yields a disabled client.
    pub fn init(config: Config) -> Result<Self, CalError> {
        config.validate()?;
        if !config.enabled {
            debug!("CAL disabled by configuration");
            return Ok(Client::disabled());
        }

        let header = MachineHeader::new(&config.pool, &config.environment, &config.label);
        let dispatcher = spawn_dispatcher(&config, &header)?;
        debug!(
            "CAL client for pool {} logging to {}:{}",
            config.pool, config.host, config.port
        );
        Ok(Client {
            inner: Some(Arc::new(Inner {
                config,
                header,
                identities: IdentityAllocator::new(),
                overflow: OverflowBuffers::new(),
                runtime: Mutex::new(DispatchRuntime {
                    pid: std::process::id(),
                    dispatcher,
                }),
                closed: AtomicBool::new(false),
            })),
        })
    }

    #[must_use]
    pub fn disabled() -> Self {
        Client { inner: None }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    #[must_use]
    pub fn config(&self) -> Option<&Config> {
        self.inner.as_deref().map(|inner| &inner.config)
    }

    /// Sends one message of `kind`.
    pub fn send(&self, kind: MessageKind, message: Message) {
        if let Some(inner) = &self.inner {
            inner.emit(kind, &message, None);
        }
    }

    /// Wire identity of the calling context, `None` when disabled.
    pub(crate) fn current_identity(&self) -> Option<u32> {
        self.inner.as_deref().map(Inner::current_identity)
    }

    /// Sends under a wire identity resolved earlier, wherever the caller runs.
    pub(crate) fn send_as(&self, kind: MessageKind, message: Message, identity: Option<u32>) {
        if let Some(inner) = &self.inner {
            inner.emit(kind, &message, identity);
        }
    }

    /// Sends one message whose kind is given by name or type character.
    pub fn send_named(&self, kind: &str, message: Message) -> Result<(), CalError> {
        let kind = kind.parse::<MessageKind>()?;
        self.send(kind, message);
        Ok(())
    }

    pub fn event(&self, cal_type: &str, name: &str, status: impl Into<Status>, data: &str) {
        self.send(
            MessageKind::Event,
            Message::new(cal_type, name).status(status).data(data),
        );
    }

    /// Like [`Client::event`], with the caller's `src=<file>:<line>` appended
    /// to the data.
    #[track_caller]
    pub fn event_with_src(
        &self,
        cal_type: &str,
        name: &str,
        status: impl Into<Status>,
        data: &str,
    ) {
        let caller = Location::caller();
        let src = format!("src={}:{}", caller.file(), caller.line());
        let data = if data.is_empty() {
            src
        } else {
            format!("{data}&{src}")
        };
        self.event(cal_type, name, status, &data);
    }

    pub fn heartbeat(&self, cal_type: &str, name: &str, status: impl Into<Status>, data: &str) {
        self.send(
            MessageKind::Heartbeat,
            Message::new(cal_type, name).status(status).data(data),
        );
    }

    /// Opens a transaction on the wire. Pair with [`Client::end_transaction`];
    /// [`Client::transaction`] does both.
    pub fn start_transaction(&self, cal_type: &str, name: &str) {
        self.send(MessageKind::StartTransaction, Message::new(cal_type, name));
    }

    /// Adds data to the currently open transaction.
    pub fn data_fragment(&self, data: &str) {
        self.send(MessageKind::DataFragment, Message::default().data(data));
    }

    pub fn end_transaction(
        &self,
        cal_type: &str,
        name: &str,
        status: impl Into<Status>,
        duration: Duration,
        data: &str,
    ) {
        self.send(
            MessageKind::EndTransaction,
            Message::new(cal_type, name)
                .status(status)
                .duration(duration)
                .data(data),
        );
    }

    pub fn atomic_transaction(
        &self,
        cal_type: &str,
        name: &str,
        status: impl Into<Status>,
        duration: Duration,
        data: &str,
    ) {
        self.send(
            MessageKind::AtomicTransaction,
            Message::new(cal_type, name)
                .status(status)
                .duration(duration)
                .data(data),
        );
    }

    pub fn sql(&self, query: &str) {
        self.send(MessageKind::Sql, Message::default().data(query));
    }

    pub fn sql_with_hash(&self, query: &str, hash: u32) {
        let mut message = Message::default().data(query);
        message.sql_hash = Some(hash);
        self.send(MessageKind::Sql, message);
    }

    /// Logs `value` as the duration of an atomic `METRIC` transaction, so
    /// collectors aggregate it with their duration statistics.
    pub fn metric(&self, name: &str, value: impl Display) {
        let mut message = Message::new("METRIC", name);
        message.duration = value.to_string();
        self.send(MessageKind::AtomicTransaction, message);
    }

    /// Logs a business event, which collectors route separately.
    pub fn biz_event(&self, name: &str, data: &str) {
        self.event("BIZ", name, Status::success(), data);
    }

    /// Opens a transaction scope.
    #[must_use]
    pub fn transaction(&self, cal_type: &str, name: &str) -> Transaction {
        TransactionSpec::new(cal_type, name).start(self)
    }

    /// Opens an atomic transaction scope.
    #[must_use]
    pub fn atomic(&self, cal_type: &str, name: &str) -> Transaction {
        TransactionSpec::new(cal_type, name).atomic(true).start(self)
    }

    /// Runs `fut` as its own logging context, with an identity held for as
    /// long as the future lives.
    pub fn in_context<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> {
        context::scope(fut)
    }

    /// Gives up the calling context's identity, for contexts about to idle
    /// for a long time with no open transaction.
    pub fn release_identity(&self) -> Option<u32> {
        self.inner
            .as_deref()
            .and_then(|inner| inner.identities.release_current())
    }

    /// Waits for queued frames to be delivered (a zero timeout waits
    /// indefinitely), then closes. Returns whether everything was delivered.
    pub fn wait_and_close(&self, timeout: Duration) -> bool {
        let Some(inner) = &self.inner else {
            return true;
        };
        let drained = inner.dispatcher().drain(timeout);
        self.close();
        drained
    }

    /// Stops the dispatcher. Frames still queued are discarded and later
    /// calls are dropped. Closing twice is a no-op.
    pub fn close(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        let dispatcher = inner.dispatcher();
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        dispatcher.join();
        let stats = dispatcher.stats();
        debug!(
            "CAL client closed: {} delivered, {} dropped, {} delivery failures",
            stats.delivered, stats.dropped, stats.failures
        );
    }

    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        self.inner
            .as_deref()
            .map(|inner| inner.dispatcher().stats())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn unreachable_config() -> Config {
        // port 9 (discard) on localhost is closed in test environments
        Config {
            port: 9,
            connect_timeout: Duration::from_millis(50),
            ..Config::new("unit-test")
        }
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let result = Client::init(Config::default());
        assert!(matches!(result, Err(CalError::InvalidConfig(_))));
    }

    #[test]
    fn test_disabled_client_accepts_everything() {
        let client = Client::init(Config {
            enabled: false,
            ..Config::new("off")
        })
        .expect("init failed");
        assert!(!client.is_enabled());
        client.event("E", "n", 0, "");
        client.sql("select 1");
        client.transaction("API", "noop").end();
        assert_eq!(client.release_identity(), None);
        assert!(client.wait_and_close(Duration::ZERO));
        assert_eq!(client.stats(), DispatcherStats::default());
    }

    #[test]
    fn test_send_named_rejects_unknown_kind() {
        let client = Client::disabled();
        let result = client.send_named("bogus", Message::new("K", "N"));
        assert!(matches!(result, Err(CalError::UnknownMessageKind(ref k)) if k == "bogus"));
        assert!(client.send_named("E", Message::new("K", "N")).is_ok());
        assert!(client.send_named("event", Message::new("K", "N")).is_ok());
    }

    #[test]
    fn test_min_status_suppression() {
        let client = Client::init(Config {
            min_status: Status::from(2),
            ..unreachable_config()
        })
        .expect("init failed");

        client.event("E", "ok", 0, "");
        client.event("E", "error", 2, "");
        client.event("E", "warning", 3, "");
        client.event("E", "unknown", "U", "");
        client.event("E", "empty", "", "");
        client.atomic_transaction("T", "kept", 3, Duration::ZERO, "");

        assert_eq!(client.stats().enqueued, 4);
        client.close();
    }

    #[test]
    fn test_no_suppression_when_min_status_is_zero() {
        let client = Client::init(unreachable_config()).expect("init failed");
        client.event("E", "a", 1, "");
        client.event("E", "b", 3, "");
        client.event("E", "c", "U", "");
        assert_eq!(client.stats().enqueued, 3);
        client.close();
    }

    #[test]
    fn test_context_identity_released() {
        let client = Client::init(unreachable_config()).expect("init failed");
        let worker = client.clone();
        std::thread::spawn(move || worker.event("E", "n", 0, ""))
            .join()
            .expect("thread panicked");

        let inner = client.inner.as_deref().expect("enabled client");
        assert!(inner.identities.is_empty());

        client.event("E", "n", 0, "");
        assert_eq!(inner.identities.len(), 1);
        assert_eq!(client.release_identity(), Some(0));
        assert!(inner.identities.is_empty());
        client.close();
    }

    #[test]
    #[traced_test]
    fn test_close_is_idempotent_and_drops_later_frames() {
        let client = Client::init(unreachable_config()).expect("init failed");
        client.close();
        client.close();
        client.event("E", "late", 0, "");
        let stats = client.stats();
        assert_eq!(stats.enqueued, 0);
        assert_eq!(stats.dropped, 1);
        assert!(logs_contain("CAL client closed"));
    }

    #[test]
    fn test_explicit_identity_zero_becomes_heartbeat_identity() {
        let client = Client::init(unreachable_config()).expect("init failed");
        let inner = client.inner.as_deref().expect("enabled client");
        client.send(
            MessageKind::AtomicTransaction,
            Message::new("T", "n").identity(0),
        );
        assert!(inner.identities.is_empty());
        assert_eq!(client.stats().enqueued, 1);
        client.close();
    }
}
