//! Bridge for a foreign interpreter running on another thread.
//!
//! The foreign side holds a [`BridgeClient`] and issues one command at a
//! time, blocking until the scheduler replies.  The scheduler owns the
//! [`BridgeServer`] and services at most one request per tick while no
//! script is running, dispatching it as a line of script text.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError};
use thiserror::Error;

use crate::script::value::{format_float, Value};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeRequest {
    pub command: String,
    pub args: Vec<String>,
    /// Numeric arguments, appended after `args`.
    pub numbers: Vec<f64>,
}

impl BridgeRequest {
    pub fn new(command: impl Into<String>) -> Self {
        BridgeRequest { command: command.into(), args: Vec::new(), numbers: Vec::new() }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn number(mut self, x: f64) -> Self {
        self.numbers.push(x);
        self
    }

    /// The request as one line of script text.
    pub fn line(&self) -> String {
        let mut line = self.command.clone();
        for a in &self.args {
            line.push(' ');
            if a.is_empty() || a.contains(char::is_whitespace) {
                line.push('"');
                line.push_str(&a.replace('"', "\\\""));
                line.push('"');
            } else {
                line.push_str(a);
            }
        }
        for x in &self.numbers {
            line.push(' ');
            line.push_str(&format_float(*x));
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeResponse {
    pub ok: bool,
    pub message: String,
    pub report: Vec<Value>,
}

impl BridgeResponse {
    pub fn success(report: Vec<Value>) -> Self {
        BridgeResponse { ok: true, message: String::new(), report }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        BridgeResponse { ok: false, message: message.into(), report: Vec::new() }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("the script engine has shut down")]
    Disconnected,
    #[error("no reply from the script engine within {0:?}")]
    Timeout(Duration),
}

struct Envelope {
    request: BridgeRequest,
    reply: Sender<BridgeResponse>,
}

/// Create a bridge whose queue holds at most `capacity` waiting requests.
pub fn channel(capacity: usize) -> (BridgeClient, BridgeServer) {
    let (tx, rx) = bounded(capacity.max(1));
    (BridgeClient { tx, timeout: DEFAULT_TIMEOUT }, BridgeServer { rx })
}

// ── Client ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct BridgeClient {
    tx: Sender<Envelope>,
    timeout: Duration,
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient").field("timeout", &self.timeout).finish()
    }
}

impl BridgeClient {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `request` and block until the engine replies.
    pub fn call(&self, request: BridgeRequest) -> Result<BridgeResponse, BridgeError> {
        let (reply, response) = bounded(1);
        self.tx.send_timeout(Envelope { request, reply }, self.timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(_) => BridgeError::Timeout(self.timeout),
            SendTimeoutError::Disconnected(_) => BridgeError::Disconnected,
        })?;
        response.recv_timeout(self.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => BridgeError::Timeout(self.timeout),
            RecvTimeoutError::Disconnected => BridgeError::Disconnected,
        })
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct BridgeServer {
    rx: Receiver<Envelope>,
}

impl std::fmt::Debug for BridgeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeServer").field("queued", &self.rx.len()).finish()
    }
}

impl BridgeServer {
    /// Take the next waiting request, if any.
    pub fn try_next(&self) -> Option<PendingCall> {
        match self.rx.try_recv() {
            Ok(Envelope { request, reply }) => Some(PendingCall { request, reply }),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

/// A request taken from the queue that still owes its caller a reply.
#[derive(Debug)]
pub struct PendingCall {
    pub request: BridgeRequest,
    reply: Sender<BridgeResponse>,
}

impl PendingCall {
    /// Reply to the caller.  A caller that gave up waiting is ignored.
    pub fn respond(self, response: BridgeResponse) {
        let _ = self.reply.send(response);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_quotes_arguments() {
        let r = BridgeRequest::new("Echo").arg("two words").arg("x").number(1.5).number(2.0);
        assert_eq!(r.line(), "Echo \"two words\" x 1.5 2");
    }

    #[test]
    fn round_trip_through_threads() {
        let (client, server) = channel(2);
        let worker = std::thread::spawn(move || client.call(BridgeRequest::new("Ping")));
        let call = loop {
            if let Some(c) = server.try_next() {
                break c;
            }
            std::thread::yield_now();
        };
        assert_eq!(call.request.command, "Ping");
        call.respond(BridgeResponse::success(vec![Value::Int(1)]));
        let resp = worker.join().unwrap().unwrap();
        assert!(resp.ok);
        assert_eq!(resp.report, vec![Value::Int(1)]);
    }

    #[test]
    fn times_out_and_disconnects() {
        let (client, server) = channel(1);
        let client = client.with_timeout(Duration::from_millis(20));
        assert_eq!(client.call(BridgeRequest::new("X")), Err(BridgeError::Timeout(Duration::from_millis(20))));
        drop(server);
        assert_eq!(client.call(BridgeRequest::new("X")), Err(BridgeError::Disconnected));
    }
}
