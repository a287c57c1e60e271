// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transaction scopes.
//!
//! A [`Transaction`] is a guard: starting it logs the start marker (unless the
//! transaction is atomic) and ending or dropping it logs the closing frame
//! with the measured duration. Errors observed while it is open, and panics
//! unwinding through it, turn into a failed status and a trace in the data.
//!
//! [`TransactionSpec`] holds the reusable configuration and builds the
//! wrappers: [`TransactionSpec::call`], [`TransactionSpec::wrap`] and
//! [`TransactionSpec::call_async`].

use std::any::{type_name, Any};
use std::backtrace::Backtrace;
use std::error::Error;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use crate::client::{Client, Message};
use crate::codec::{self, MessageKind};
use crate::context;
use crate::correlation::add_correlation_id;
use crate::status::{self, Status};

/// Well-known transaction types. Anything else is accepted too.
pub mod txn_type {
    /// Root transaction of a mid-tier service.
    pub const API: &str = "API";
    pub const RAPI: &str = "RAPI";
    pub const ACCEPT: &str = "ACCEPT";
    /// Root transaction of a web service.
    pub const URL: &str = "URL";
    pub const CONNECT: &str = "CONNECT";
    pub const SEND: &str = "SEND";
    pub const RECV: &str = "RECV";
    /// Nested service call, connect, send and receive together.
    pub const CALL: &str = "CALL";
    pub const DISPATCH: &str = "DISPATCH";
    pub const CLOSE: &str = "CLOSE";
}

const M_ERR: &str = "m_err";
const GREEN_EXIT: &str = "green_exit";
const PANIC: &str = "panic";

/// Joins key/value pairs as `k=v&k=v`, the data layout collectors index.
#[must_use]
pub fn encode_fields(fields: &[(String, String)]) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn set_field(fields: &mut Vec<(String, String)>, key: &str, value: String) {
    match fields.iter_mut().find(|(k, _)| k == key) {
        Some(slot) => slot.1 = value,
        None => fields.push((key.to_string(), value)),
    }
}

/// Payload logged with the closing frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionMsg {
    /// Merged over the extra fields and encoded as `k=v&...`.
    Fields(Vec<(String, String)>),
    /// Sent verbatim; extra fields are ignored.
    Text(String),
}

impl Default for TransactionMsg {
    fn default() -> Self {
        TransactionMsg::Fields(Vec::new())
    }
}

/// Error wrapper that tells a transaction which status and `m_err` to log.
///
/// Found anywhere in an error's source chain.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct StatusError {
    status: Option<Status>,
    m_err: Option<String>,
    source: Box<dyn Error + Send + Sync>,
}

impl StatusError {
    pub fn new(status: impl Into<Status>, source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        StatusError {
            status: Some(status.into()),
            m_err: None,
            source: source.into(),
        }
    }

    #[must_use]
    pub fn with_m_err(mut self, m_err: impl Into<String>) -> Self {
        self.m_err = Some(m_err.into());
        self
    }
}

/// What went wrong inside a transaction.
#[derive(Debug, Clone)]
pub struct Failure {
    pub type_name: String,
    pub message: String,
    pub causes: Vec<String>,
    /// Overrides the transaction status.
    pub status: Option<Status>,
    /// Overrides the `m_err` field, which otherwise is the type name.
    pub m_err: Option<String>,
    backtrace: String,
}

impl Failure {
    #[must_use]
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Failure {
            type_name: type_name.into(),
            message: message.into(),
            causes: Vec::new(),
            status: None,
            m_err: None,
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    /// Describes `error`, its source chain and any [`StatusError`] in it.
    #[must_use]
    pub fn from_error<E: Error + 'static>(error: &E) -> Self {
        let mut failure = Failure::new(short_type_name::<E>(), error.to_string());
        let mut current: Option<&(dyn Error + 'static)> = Some(error);
        while let Some(e) = current {
            if let Some(tagged) = e.downcast_ref::<StatusError>() {
                failure.status = failure.status.or_else(|| tagged.status.clone());
                failure.m_err = failure.m_err.or_else(|| tagged.m_err.clone());
            }
            current = e.source();
            if let Some(cause) = current {
                failure.causes.push(cause.to_string());
            }
        }
        failure
    }

    /// Describes a caught panic by its payload message.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "panicked inside the transaction".to_string()
        };
        Failure::new(PANIC, message)
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<Status>) -> Self {
        self.status = Some(status.into());
        self
    }

    #[must_use]
    pub fn with_m_err(mut self, m_err: impl Into<String>) -> Self {
        self.m_err = Some(m_err.into());
        self
    }

    fn m_err(&self) -> String {
        self.m_err.clone().unwrap_or_else(|| self.type_name.clone())
    }

    /// Message first, so truncation cuts the backtrace rather than the cause.
    fn render(&self) -> String {
        let mut out = format!("{}: {}", self.type_name, self.message);
        for cause in &self.causes {
            out.push_str("\nCaused by: ");
            out.push_str(cause);
        }
        if !self.backtrace.is_empty() {
            out.push('\n');
            out.push_str(self.backtrace.trim_end());
        }
        out
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = type_name::<T>();
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::").next().unwrap_or(path)
}

/// Reusable transaction configuration.
#[derive(Debug, Clone)]
pub struct TransactionSpec {
    cal_type: String,
    name: String,
    status: Status,
    msg: TransactionMsg,
    atomic: bool,
    extra: Vec<(String, String)>,
}

impl TransactionSpec {
    /// The type is upper-cased.
    #[must_use]
    pub fn new(cal_type: &str, name: &str) -> Self {
        TransactionSpec {
            cal_type: cal_type.to_uppercase(),
            name: name.to_string(),
            status: Status::success(),
            msg: TransactionMsg::default(),
            atomic: false,
            extra: Vec::new(),
        }
    }

    #[must_use]
    pub fn status(mut self, status: impl Into<Status>) -> Self {
        self.status = status.into();
        self
    }

    #[must_use]
    pub fn msg(mut self, msg: TransactionMsg) -> Self {
        self.msg = msg;
        self
    }

    /// Atomic transactions log one self-contained frame at the end.
    #[must_use]
    pub fn atomic(mut self, atomic: bool) -> Self {
        self.atomic = atomic;
        self
    }

    /// Adds a field logged under the msg fields.
    #[must_use]
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn cal_type(&self) -> &str {
        &self.cal_type
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    /// Opens a transaction with this configuration.
    #[must_use]
    pub fn start(&self, client: &Client) -> Transaction {
        Transaction::start(client.clone(), self.clone())
    }

    /// Runs `f` inside a transaction. An error is recorded, then returned
    /// unchanged. A panic is recorded with its message, then resumed.
    pub fn call<T, E, F>(&self, client: &Client, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: Error + 'static,
    {
        let mut txn = self.start(client);
        let result = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => {
                txn.fail(Failure::from_panic(payload.as_ref()));
                txn.end();
                panic::resume_unwind(payload)
            }
        };
        if let Err(e) = &result {
            txn.fail_with(e);
        }
        txn.end();
        result
    }

    /// Wraps `f` so every invocation runs inside its own transaction.
    pub fn wrap<A, T, E, F>(&self, client: &Client, f: F) -> impl Fn(A) -> Result<T, E>
    where
        F: Fn(A) -> Result<T, E>,
        E: Error + 'static,
    {
        let spec = self.clone();
        let client = client.clone();
        move |arg| spec.call(&client, || f(arg))
    }

    /// Awaits `fut` inside a transaction.
    ///
    /// Dropping the returned future before completion logs the transaction
    /// as cancelled rather than failed. Outside a task context the future
    /// gets its own, so its frames share one identity wherever it is polled.
    pub async fn call_async<T, E, Fut>(&self, client: &Client, fut: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let traced = async {
            let mut txn = self.start(client);
            txn.cancel_on_drop = true;
            let result = fut.await;
            txn.cancel_on_drop = false;
            if let Err(e) = &result {
                txn.fail_with(e);
            }
            txn.end();
            result
        };
        if context::in_task_context() {
            traced.await
        } else {
            context::scope(traced).await
        }
    }
}

/// An open transaction. Logged when ended or dropped.
#[derive(Debug)]
pub struct Transaction {
    client: Client,
    spec: TransactionSpec,
    /// Wire identity of the opening context; closing frames reuse it.
    identity: Option<u32>,
    started: Instant,
    failure: Option<Failure>,
    green_exit: bool,
    cancel_on_drop: bool,
    finished: bool,
}

impl Transaction {
    fn start(client: Client, spec: TransactionSpec) -> Self {
        let identity = client.current_identity();
        if !spec.atomic {
            client.send_as(
                MessageKind::StartTransaction,
                Message::new(&spec.cal_type, &spec.name),
                identity,
            );
        }
        Transaction {
            client,
            spec,
            identity,
            started: Instant::now(),
            failure: None,
            green_exit: false,
            cancel_on_drop: false,
            finished: false,
        }
    }

    pub fn set_status(&mut self, status: impl Into<Status>) {
        self.spec.status = status.into();
    }

    pub fn set_msg(&mut self, msg: TransactionMsg) {
        self.spec.msg = msg;
    }

    /// Sets one msg field, turning a text msg into fields.
    pub fn add_field(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match &mut self.spec.msg {
            TransactionMsg::Fields(fields) => set_field(fields, key, value),
            TransactionMsg::Text(_) => {
                self.spec.msg = TransactionMsg::Fields(vec![(key.to_string(), value)]);
            }
        }
    }

    /// Marks the transaction failed.
    pub fn fail(&mut self, failure: Failure) {
        self.failure = Some(failure);
    }

    /// Marks the transaction failed by `error`.
    pub fn fail_with<E: Error + 'static>(&mut self, error: &E) {
        self.fail(Failure::from_error(error));
    }

    /// Ends as a cooperative cancellation: any failure is cleared and
    /// `green_exit` is logged instead.
    pub fn cancel(&mut self) {
        self.failure = None;
        self.green_exit = true;
    }

    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if self.cancel_on_drop {
            self.cancel();
        } else if std::thread::panicking() && self.failure.is_none() {
            self.failure = Some(Failure::new(PANIC, "panicked inside the transaction"));
        }

        let duration = codec::format_duration(self.started.elapsed());
        let (status, data) = self.closing_status_and_data();
        let kind = if self.spec.atomic {
            MessageKind::AtomicTransaction
        } else {
            MessageKind::EndTransaction
        };
        self.client.send_as(
            kind,
            Message {
                cal_type: self.spec.cal_type.clone(),
                name: self.spec.name.clone(),
                status,
                data,
                duration,
                ..Message::default()
            },
            self.identity,
        );
    }

    fn closing_status_and_data(&self) -> (Status, String) {
        let failure = self.failure.as_ref();

        let mut data = match &self.spec.msg {
            TransactionMsg::Fields(msg) => {
                let mut fields = self.spec.extra.clone();
                for (key, value) in msg {
                    set_field(&mut fields, key, value.clone());
                }
                if let Some(failure) = failure {
                    if !fields.iter().any(|(k, _)| k == M_ERR) {
                        fields.push((M_ERR.to_string(), failure.m_err()));
                    }
                }
                if self.green_exit {
                    set_field(&mut fields, GREEN_EXIT, "True".to_string());
                }
                encode_fields(&fields)
            }
            TransactionMsg::Text(text) => text.clone(),
        };
        data = add_correlation_id(&data);

        let Some(failure) = failure else {
            return (self.spec.status.clone(), data);
        };
        let status = match &failure.status {
            Some(status) => status.clone(),
            None if self.spec.status.below_error() => Status::from(status::FATAL),
            None => self.spec.status.clone(),
        };
        if !data.is_empty() {
            data.push('&');
        }
        data.push_str("\n\tmsg=");
        data.push_str(&failure.render().replace('\n', "\n\t"));
        (status, data)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Timeout;

    impl fmt::Display for Timeout {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("backend timed out")
        }
    }

    impl Error for Timeout {}

    #[derive(Debug, thiserror::Error)]
    #[error("lookup failed")]
    struct Lookup(#[source] Timeout);

    fn detached(spec: TransactionSpec) -> Transaction {
        Transaction {
            client: Client::disabled(),
            spec,
            identity: None,
            started: Instant::now(),
            failure: None,
            green_exit: false,
            cancel_on_drop: false,
            finished: true,
        }
    }

    fn with_id<R>(f: impl FnOnce() -> R) -> R {
        context::run_in_context(|| {
            context::set_correlation_id("c0ffee");
            f()
        })
    }

    #[test]
    fn test_type_is_upper_cased() {
        let spec = TransactionSpec::new("url", "/health");
        assert_eq!(spec.cal_type(), "URL");
        assert_eq!(spec.name(), "/health");
        assert!(!spec.is_atomic());
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<std::io::Error>(), "Error");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
        assert_eq!(short_type_name::<Lookup>(), "Lookup");
    }

    #[test]
    fn test_success_data_merges_msg_over_extra() {
        let spec = TransactionSpec::new("API", "get")
            .extra("a", "1")
            .extra("b", "2")
            .msg(TransactionMsg::Fields(vec![("b".to_string(), "3".to_string())]));
        let txn = detached(spec);
        let (status, data) = with_id(|| txn.closing_status_and_data());
        assert_eq!(status.as_str(), "0");
        assert_eq!(data, "a=1&b=3&corr_id_=c0ffee");
    }

    #[test]
    fn test_existing_correlation_id_kept() {
        let spec = TransactionSpec::new("API", "get").extra("corr_id_", "upstream");
        let txn = detached(spec);
        let (_, data) = with_id(|| txn.closing_status_and_data());
        assert_eq!(data, "corr_id_=upstream");
    }

    #[test]
    fn test_failure_promotes_status_and_appends_trace() {
        let mut txn = detached(TransactionSpec::new("API", "get"));
        txn.fail_with(&Lookup(Timeout));
        let (status, data) = with_id(|| txn.closing_status_and_data());

        assert_eq!(status.as_str(), "1");
        assert!(data.starts_with("m_err=Lookup&corr_id_=c0ffee&\n\tmsg=Lookup: lookup failed"));
        assert!(data.contains("\n\tCaused by: backend timed out"));
        assert!(data.lines().skip(1).all(|line| line.starts_with('\t')));
    }

    #[test]
    fn test_failure_keeps_error_status() {
        let mut txn = detached(TransactionSpec::new("API", "get").status(status::ERROR));
        txn.fail(Failure::new("Custom", "bad input"));
        let (status, _) = with_id(|| txn.closing_status_and_data());
        assert_eq!(status.as_str(), "2");

        let mut txn = detached(TransactionSpec::new("API", "get").status(status::WARNING));
        txn.fail(Failure::new("Custom", "bad input"));
        let (status, _) = with_id(|| txn.closing_status_and_data());
        assert_eq!(status.as_str(), "1");
    }

    #[test]
    fn test_status_error_overrides_status_and_m_err() {
        let error = StatusError::new(status::ERROR, Timeout).with_m_err("UpstreamDown");
        let failure = Failure::from_error(&error);
        assert_eq!(failure.status, Some(Status::from("2")));
        assert_eq!(failure.m_err(), "UpstreamDown");
        assert_eq!(failure.causes, ["backend timed out"]);

        let mut txn = detached(TransactionSpec::new("API", "get"));
        txn.fail(failure);
        let (status, data) = with_id(|| txn.closing_status_and_data());
        assert_eq!(status.as_str(), "2");
        assert!(data.starts_with("m_err=UpstreamDown&"));
    }

    #[test]
    fn test_explicit_m_err_field_wins() {
        let spec = TransactionSpec::new("API", "get").extra("m_err", "Mine");
        let mut txn = detached(spec);
        txn.fail(Failure::new("Other", "x"));
        let (_, data) = with_id(|| txn.closing_status_and_data());
        assert!(data.starts_with("m_err=Mine&corr_id_=c0ffee&"));
    }

    #[test]
    fn test_cancel_clears_failure() {
        let mut txn = detached(TransactionSpec::new("API", "get"));
        txn.fail(Failure::new("Other", "x"));
        txn.cancel();
        assert!(txn.failure().is_none());
        let (status, data) = with_id(|| txn.closing_status_and_data());
        assert_eq!(status.as_str(), "0");
        assert_eq!(data, "green_exit=True&corr_id_=c0ffee");
    }

    #[test]
    fn test_text_msg_is_sent_verbatim() {
        let spec = TransactionSpec::new("API", "get")
            .extra("ignored", "1")
            .msg(TransactionMsg::Text("free form".to_string()));
        let mut txn = detached(spec);
        let (_, data) = with_id(|| txn.closing_status_and_data());
        assert_eq!(data, "free form&corr_id_=c0ffee");

        txn.add_field("k", "v");
        let (_, data) = with_id(|| txn.closing_status_and_data());
        assert_eq!(data, "ignored=1&k=v&corr_id_=c0ffee");
    }

    #[test]
    fn test_call_returns_error_unchanged() {
        let client = Client::disabled();
        let spec = TransactionSpec::new("API", "get");
        let result: Result<(), Lookup> = spec.call(&client, || Err(Lookup(Timeout)));
        assert_eq!(result.map_err(|e| e.to_string()), Err("lookup failed".to_string()));

        let double = spec.wrap(&client, |x: u32| Ok::<_, Timeout>(x * 2));
        assert_eq!(double(21).ok(), Some(42));
    }

    #[test]
    fn test_failure_from_panic_payload() {
        let failure = Failure::from_panic(&"kaboom");
        assert_eq!(failure.type_name, "panic");
        assert_eq!(failure.message, "kaboom");
        assert_eq!(failure.m_err(), "panic");

        let failure = Failure::from_panic(&format!("bad index {}", 3));
        assert_eq!(failure.message, "bad index 3");

        let failure = Failure::from_panic(&42u8);
        assert_eq!(failure.message, "panicked inside the transaction");
    }

    #[test]
    fn test_call_records_and_resumes_panic() {
        let client = Client::disabled();
        let spec = TransactionSpec::new("API", "boom");
        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            spec.call(&client, || -> Result<(), Timeout> { panic!("kaboom") })
        }));
        let payload = caught.expect_err("panic was swallowed");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"kaboom"));
    }

    #[test]
    fn test_encode_fields() {
        let fields = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "x y".to_string()),
        ];
        assert_eq!(encode_fields(&fields), "a=1&b=x y");
        assert_eq!(encode_fields(&[]), "");
    }
}
