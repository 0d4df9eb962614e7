// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Line-oriented stdin/stdout transport used by the `hdds-repub` CLI.
//!
//! Inbound messages are read from stdin as `topic<TAB>payload` lines (a
//! single space is accepted as separator too). Outbound messages are written
//! to stdout as `destination<TAB>payload`; payloads that are not UTF-8 are
//! written as `hex:` followed by the hex bytes.

use super::{topic_matches, BrokerClient, DeliveryCallback, TransportError};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex};

/// Stdio transport.
pub struct StdioBroker {
    stdout: Mutex<tokio::io::Stdout>,
    eof_tx: watch::Sender<bool>,
}

impl StdioBroker {
    /// Create a new stdio transport.
    pub fn new() -> Self {
        let (eof_tx, _) = watch::channel(false);
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
            eof_tx,
        }
    }

    /// Resolves once stdin reached end of input.
    pub async fn wait_eof(&self) {
        let mut rx = self.eof_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for StdioBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Split an input line into topic and payload.
pub fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (topic, payload) = match line.split_once('\t') {
        Some(parts) => parts,
        None => line.split_once(' ')?,
    };
    let topic = topic.trim();
    if topic.is_empty() {
        return None;
    }
    Some((topic, payload))
}

/// Render a payload for output.
pub fn format_payload(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => {
            let hex: String = payload.iter().map(|b| format!("{:02x}", b)).collect();
            format!("hex:{}", hex)
        }
    }
}

/// Deliver input lines until end of input, then raise the EOF flag.
async fn read_input<R>(
    reader: R,
    filters: Vec<String>,
    callback: Arc<dyn DeliveryCallback>,
    eof_tx: watch::Sender<bool>,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let Some((topic, payload)) = parse_line(&line) else {
                    tracing::debug!("Ignoring malformed input line: {:?}", line);
                    continue;
                };
                if filters.iter().any(|f| topic_matches(f, topic)) {
                    callback.on_message(topic, payload.as_bytes());
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("stdin read failed: {}", e);
                break;
            }
        }
    }
    // Stored even when nobody is waiting yet
    eof_tx.send_replace(true);
}

impl BrokerClient for StdioBroker {
    type Handle = ();

    async fn connect(&self, endpoints: &[String]) -> Result<(), TransportError> {
        tracing::debug!("stdio transport ignores endpoints {:?}", endpoints);
        Ok(())
    }

    async fn publish(
        &self,
        _handle: &(),
        destination: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let line = format!("{}\t{}\n", destination, format_payload(payload));
        let mut stdout = self.stdout.lock().await;
        stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))
    }

    async fn subscribe(
        &self,
        _handle: &(),
        topics: &[String],
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<(), TransportError> {
        let filters = topics.to_vec();
        let eof_tx = self.eof_tx.clone();
        let stdin = BufReader::new(tokio::io::stdin());

        tokio::spawn(read_input(stdin, filters, callback, eof_tx));

        Ok(())
    }
}
