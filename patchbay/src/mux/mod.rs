//! Session multiplexing over one framed channel.
//!
//! A [`Multiplexer`] carves one base channel into any number of logical
//! sessions, keyed by a small non-negative integer. Every outbound object is
//! wrapped as `{"session": <id>, "content": <obj>}`; an inbound envelope
//! without `"content"` closes that session half. Base frames that are not a
//! well-formed envelope (no `"session"`, a non-integer id, or extra fields)
//! are dropped as noise.
//!
//! A server-mode multiplexer hands sessions opened by the peer to
//! [`Multiplexer::accept`]; a client-mode one ignores unknown inbound ids and
//! closes the base channel once its last locally opened session closes.
//!
//! Objects within one session are delivered in send order. Across sessions
//! there is no ordering guarantee.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{self, AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, trace};

use crate::codec::{BoxRead, BoxWrite, CodecError, FramedRead, FramedWrite};

/// Errors surfaced to session users.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The base channel is gone; no session can write any more.
    #[error("base channel closed")]
    BaseClosed,
    /// This session's local end was already closed.
    #[error("session closed locally")]
    SessionClosed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Client,
    Server,
}

/// Many logical channels over one base channel.
pub struct Multiplexer {
    shared: Arc<Shared>,
    accept_rx: Option<mpsc::UnboundedReceiver<Session>>,
}

struct Shared {
    mode: Mode,
    writer: AsyncMutex<Option<FramedWrite<BoxWrite>>>,
    state: Mutex<MuxState>,
}

struct MuxState {
    inbound: HashMap<u32, mpsc::UnboundedSender<Value>>,
    local_open: HashSet<u32>,
    next_id: u32,
    opened_any: bool,
    base_closed: bool,
}

impl Multiplexer {
    /// Build a server-mode multiplexer over pre-framed halves and start its
    /// reader task.
    pub fn server(read: FramedRead<BoxRead>, write: FramedWrite<BoxWrite>) -> Multiplexer {
        Multiplexer::new(read, write, Mode::Server)
    }

    /// Build a client-mode multiplexer over pre-framed halves.
    pub fn client(read: FramedRead<BoxRead>, write: FramedWrite<BoxWrite>) -> Multiplexer {
        Multiplexer::new(read, write, Mode::Client)
    }

    /// Convenience constructor splitting and framing a whole stream.
    pub fn server_on<T>(io: T) -> Multiplexer
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = io::split(io);
        Multiplexer::server(
            FramedRead::new(Box::new(r) as BoxRead),
            FramedWrite::new(Box::new(w) as BoxWrite),
        )
    }

    /// See [`Multiplexer::server_on`].
    pub fn client_on<T>(io: T) -> Multiplexer
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = io::split(io);
        Multiplexer::client(
            FramedRead::new(Box::new(r) as BoxRead),
            FramedWrite::new(Box::new(w) as BoxWrite),
        )
    }

    fn new(read: FramedRead<BoxRead>, write: FramedWrite<BoxWrite>, mode: Mode) -> Multiplexer {
        let shared = Arc::new(Shared {
            mode,
            writer: AsyncMutex::new(Some(write)),
            state: Mutex::new(MuxState {
                inbound: HashMap::new(),
                local_open: HashSet::new(),
                next_id: 0,
                opened_any: false,
                base_closed: false,
            }),
        });

        let (accept_tx, accept_rx) = match mode {
            Mode::Server => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            Mode::Client => (None, None),
        };

        tokio::spawn(run_reader(shared.clone(), read, accept_tx));

        Multiplexer { shared, accept_rx }
    }

    /// Open a new locally numbered session.
    pub fn open(&self) -> Result<Session, MuxError> {
        let (id, rx) = {
            let mut state = self.shared.state.lock().unwrap();
            if state.base_closed {
                return Err(MuxError::BaseClosed);
            }
            let mut id = state.next_id;
            while state.inbound.contains_key(&id) || state.local_open.contains(&id) {
                id = id.wrapping_add(1);
            }
            state.next_id = id.wrapping_add(1);
            let (tx, rx) = mpsc::unbounded_channel();
            state.inbound.insert(id, tx);
            state.local_open.insert(id);
            state.opened_any = true;
            (id, rx)
        };
        trace!(session = id, "session opened locally");
        Ok(Session {
            id,
            shared: self.shared.clone(),
            rx,
            closed: false,
        })
    }

    /// Wait for the peer to open a session. Returns `None` once the base
    /// channel is gone, or immediately on a client-mode multiplexer.
    pub async fn accept(&mut self) -> Option<Session> {
        self.accept_rx.as_mut()?.recv().await
    }

    /// Tear the base channel down, ending every session with EOS.
    pub async fn shutdown(&self) {
        self.shared.close_base().await;
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer").finish()
    }
}

/// One logical channel of a [`Multiplexer`].
pub struct Session {
    id: u32,
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Value>,
    closed: bool,
}

impl Session {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Read the next object sent by the peer on this session.
    ///
    /// Returns `None` when the peer closed the session, the base channel
    /// went away, or [`Session::close`] was called locally.
    pub async fn read(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Send one object on this session.
    pub async fn write(&mut self, content: Value) -> Result<(), MuxError> {
        if self.closed {
            return Err(MuxError::SessionClosed);
        }
        self.shared
            .send(json!({"session": self.id, "content": content}))
            .await
    }

    /// Close the local end: tell the peer, wake any pending read with EOS,
    /// and, on a client-mode multiplexer whose last session this was, close
    /// the base channel.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.rx.close();
        // best effort: the base may already be gone
        let _ = self.shared.send(json!({"session": self.id})).await;
        self.shared.finish_session(self.id).await;
        trace!(session = self.id, "session closed locally");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            // Deregister so the reader stops delivering; the peer is only
            // notified on an explicit close().
            let mut state = self.shared.state.lock().unwrap();
            state.inbound.remove(&self.id);
            state.local_open.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl Shared {
    async fn send(&self, envelope: Value) -> Result<(), MuxError> {
        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(MuxError::BaseClosed)?;
        match w.write(&envelope).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // a write failure poisons the base for everyone
                *writer = None;
                drop(writer);
                self.drop_sessions();
                Err(MuxError::Codec(e))
            }
        }
    }

    async fn finish_session(&self, id: u32) {
        let close_base = {
            let mut state = self.state.lock().unwrap();
            state.inbound.remove(&id);
            state.local_open.remove(&id);
            self.mode == Mode::Client
                && state.opened_any
                && state.local_open.is_empty()
                && !state.base_closed
        };
        if close_base {
            self.close_base().await;
        }
    }

    async fn close_base(&self) {
        self.drop_sessions();
        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = w.close().await;
        }
    }

    fn drop_sessions(&self) {
        let mut state = self.state.lock().unwrap();
        state.base_closed = true;
        state.inbound.clear();
    }
}

async fn run_reader(
    shared: Arc<Shared>,
    mut read: FramedRead<BoxRead>,
    accept_tx: Option<mpsc::UnboundedSender<Session>>,
) {
    loop {
        match read.read().await {
            Ok(Some(envelope)) => dispatch(&shared, envelope, accept_tx.as_ref()),
            Ok(None) => {
                debug!("base channel end of stream");
                break;
            }
            Err(e) => {
                debug!(error = %e, "base channel failed");
                break;
            }
        }
    }
    shared.close_base().await;
}

fn dispatch(shared: &Arc<Shared>, envelope: Value, accept_tx: Option<&mpsc::UnboundedSender<Session>>) {
    let obj = match envelope.as_object() {
        Some(obj) => obj,
        None => return,
    };
    if !obj.keys().all(|k| k == "session" || k == "content") {
        debug!("envelope with extra fields dropped");
        return;
    }
    let id = match obj.get("session").and_then(Value::as_u64) {
        Some(id) if id <= u64::from(u32::MAX) => id as u32,
        _ => {
            debug!("envelope without usable session id dropped");
            return;
        }
    };

    match obj.get("content") {
        Some(content) => {
            let mut state = shared.state.lock().unwrap();
            if let Some(tx) = state.inbound.get(&id) {
                let _ = tx.send(content.clone());
                return;
            }
            // an unknown id opens a session, but only on a server
            let accept_tx = match accept_tx {
                Some(tx) if shared.mode == Mode::Server => tx,
                _ => {
                    trace!(session = id, "content for unknown session ignored");
                    return;
                }
            };
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(content.clone());
            state.inbound.insert(id, tx);
            state.local_open.insert(id);
            drop(state);
            trace!(session = id, "session opened by peer");
            let _ = accept_tx.send(Session {
                id,
                shared: shared.clone(),
                rx,
                closed: false,
            });
        }
        None => {
            // peer half-close
            let mut state = shared.state.lock().unwrap();
            if state.inbound.remove(&id).is_some() {
                trace!(session = id, "session closed by peer");
            }
        }
    }
}

#[cfg(test)]
mod tests;
