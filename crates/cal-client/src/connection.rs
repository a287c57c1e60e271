// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP connection to the CAL collector.
//!
//! The collector expects a machine header before the first frame of every
//! identity on a socket. The connection tracks which identity tags were
//! introduced on the current socket and forgets them whenever the socket is
//! replaced.

use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::codec::{self, Frame};
use crate::dispatcher::FrameSink;
use crate::hostname;

pub const DEFAULT_PORT: u16 = 1118;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Process description sent ahead of each identity's first frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineHeader {
    pub pool: String,
    pub environment: String,
    pub label: String,
    pub hostname: String,
    /// Local time the client started, `dd-mm-YYYY HH:MM:SS`.
    pub start: String,
}

impl MachineHeader {
    #[must_use]
    pub fn new(pool: &str, environment: &str, label: &str) -> Self {
        MachineHeader {
            pool: pool.to_string(),
            environment: environment.to_string(),
            label: label.to_string(),
            hostname: hostname::hostname().to_string(),
            start: Local::now().format("%d-%m-%Y %H:%M:%S").to_string(),
        }
    }

    /// Header text for a socket bound to `local_ip`.
    #[must_use]
    pub fn render(&self, local_ip: IpAddr) -> String {
        format!(
            "SQLLog for {}:{}:{}\r\nEnvironment: {}\r\nLabel: {}\r\nStart: {}",
            self.pool, self.hostname, local_ip, self.environment, self.label, self.start
        )
    }
}

/// At most one live socket to the collector, reopened on demand.
#[derive(Debug)]
pub struct Connection {
    host: String,
    port: u16,
    connect_timeout: Duration,
    header: MachineHeader,
    stream: Option<TcpStream>,
    handshaken: HashSet<[u8; 4]>,
}

impl Connection {
    #[must_use]
    pub fn new(host: &str, port: u16, connect_timeout: Duration, header: MachineHeader) -> Self {
        Connection {
            host: host.to_string(),
            port,
            connect_timeout,
            header,
            stream: None,
            handshaken: HashSet::new(),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Opens a socket unless one is already open.
    pub async fn ensure_connected(&mut self) -> io::Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.handshaken.clear();

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "connecting to {}:{} took longer than {:?}",
                        self.host, self.port, self.connect_timeout
                    ),
                )
            })??;
        stream.set_nodelay(true)?;
        debug!("Connected to CAL collector at {}:{}", self.host, self.port);
        self.stream = Some(stream);
        Ok(())
    }

    /// Writes `frame`, preceded by the machine header if its identity has not
    /// been introduced on this socket. Any failure closes the socket.
    pub async fn send(&mut self, frame: &Frame) -> io::Result<()> {
        let result = self.try_send(frame).await;
        if let Err(e) = &result {
            debug!("Dropping CAL collector connection: {e}");
            self.teardown();
        }
        result
    }

    async fn try_send(&mut self, frame: &Frame) -> io::Result<()> {
        self.ensure_connected().await?;
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };

        let tag = frame.identity_tag();
        if !self.handshaken.contains(&tag) {
            let local_ip = stream.local_addr()?.ip();
            let header = codec::pack(&self.header.render(local_ip), frame.identity(), false);
            stream.write_all(header.as_bytes()).await?;
            self.handshaken.insert(tag);
        }
        stream.write_all(frame.as_bytes()).await
    }

    fn teardown(&mut self) {
        self.stream = None;
        self.handshaken.clear();
    }

    /// Shuts the socket down politely. Errors are ignored.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.handshaken.clear();
    }
}

#[async_trait]
impl FrameSink for Connection {
    async fn deliver(&mut self, frame: &Frame) -> io::Result<()> {
        self.send(frame).await
    }

    async fn close(&mut self) {
        Connection::close(self).await;
    }
}
