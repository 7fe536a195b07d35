//! The broker's RPC surface.
//!
//! A connection is handled in three phases. Phase A is a line-oriented
//! handshake granting *managables* and *controllables* and (optionally)
//! setting auth tokens; a final line names the network to bind to. Phase B
//! writes the select response (or an error, and closes). Phase C wraps the
//! stream in the framed codec and a server-mode multiplexer and runs one
//! command loop per session.

pub(crate) mod dispatch;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use regex::Regex;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::codec::{BoxRead, BoxWrite, FramedRead, FramedWrite};
use crate::mux::Multiplexer;
use crate::network::Broker;

use self::dispatch::ConnContext;

/// What phase A granted a connection.
#[derive(Debug, Default)]
pub struct Grants {
    pub managables: HashSet<String>,
    pub controllables: HashSet<String>,
    pub token: Option<String>,
    pub auth_match: Option<Regex>,
}

/// Phase A failures. All of them close the connection before any JSON is
/// written.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("connection closed during handshake")]
    Eof,
    #[error("malformed handshake line {0:?}")]
    Malformed(String),
    #[error("bad auth-match pattern: {0}")]
    BadPattern(#[from] regex::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>) -> std::io::Result<()> {
    serve_with_shutdown(listener, broker, std::future::pending::<()>()).await
}

/// Accept connections until `signal` completes, then shut down in order:
/// close the accept socket, tear every live connection's base channel down
/// (which unwinds its sessions and cancels blocked reads), and wait for the
/// connection tasks to finish.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    broker: Arc<Broker>,
    signal: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    info!(addr = ?listener.local_addr().ok(), "accepting connections");
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut connections = JoinSet::new();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "connection accepted");
                let broker = broker.clone();
                let stop = stop_rx.clone();
                connections.spawn(async move {
                    if let Err(e) =
                        handle_connection_with_shutdown(stream, broker, Some(stop)).await
                    {
                        debug!(%peer, error = %e, "connection ended");
                    }
                });
            }
            () = &mut signal => break,
        }
    }

    // accept socket first, then the live transports
    drop(listener);
    let _ = stop_tx.send(true);
    while connections.join_next().await.is_some() {}
    info!("shutdown complete");
    Ok(())
}

/// Drive one connection through all three phases.
pub async fn handle_connection<T>(io: T, broker: Arc<Broker>) -> Result<(), crate::Error>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    handle_connection_with_shutdown(io, broker, None).await
}

/// [`handle_connection`], additionally ending the connection when
/// `shutdown` turns true: the base channel closes and every session sees
/// EOS promptly.
pub async fn handle_connection_with_shutdown<T>(
    io: T,
    broker: Arc<Broker>,
    shutdown: Option<watch::Receiver<bool>>,
) -> Result<(), crate::Error>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let stop = wait_stop(shutdown);
    tokio::pin!(stop);

    let (read, write) = tokio::io::split(io);
    let mut lines = BufReader::new(read);

    let (grants, network_name) = tokio::select! {
        handshake = read_handshake(&mut lines) => handshake?,
        () = &mut stop => return Ok(()),
    };
    debug!(
        network = %network_name,
        managables = ?grants.managables,
        controllables = ?grants.controllables,
        "handshake complete"
    );

    let mut framed_write = FramedWrite::new(Box::new(write) as BoxWrite);

    if !grants.controllables.contains(&network_name) {
        warn!(network = %network_name, "connection lacks a controllable grant");
        framed_write
            .write(&json!({"error": "unauthorized", "network": network_name}))
            .await?;
        framed_write.close().await?;
        return Ok(());
    }
    let Some(network) = broker.network(&network_name) else {
        framed_write
            .write(&json!({"error": "no-network", "network-name": network_name}))
            .await?;
        framed_write.close().await?;
        return Ok(());
    };

    let mut select = Map::new();
    select.insert("network-name".to_owned(), json!(network.name()));
    select.insert(network.kind().flag().to_owned(), json!(true));
    framed_write.write(&Value::Object(select)).await?;

    let managed = grants.managables.contains(&network_name);
    let ctx = Arc::new(ConnContext {
        network,
        managed,
        auth_match: grants.auth_match,
        token: grants.token,
    });

    let framed_read = FramedRead::new(Box::new(lines) as BoxRead);
    let mut mux = Multiplexer::server(framed_read, framed_write);
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = mux.accept() => {
                let Some(session) = accepted else { break };
                let ctx = ctx.clone();
                sessions.spawn(dispatch::run_session(session, ctx));
            }
            () = &mut stop => {
                debug!(network = %network_name, "connection stopping");
                mux.shutdown().await;
                break;
            }
        }
    }
    // the session handlers run their cleanup (listener removal, session
    // close) before the connection counts as finished
    while sessions.join_next().await.is_some() {}
    Ok(())
}

async fn wait_stop(shutdown: Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(mut rx) => {
            // a dropped sender reads as a stop: the acceptor is gone
            let _ = rx.wait_for(|stop| *stop).await;
        }
        None => std::future::pending().await,
    }
}

async fn read_handshake<R>(lines: &mut R) -> Result<(Grants, String), HandshakeError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut grants = Grants::default();
    loop {
        let line = read_line(lines).await?;
        if line == "drop" {
            break;
        }
        match line.split_once(' ') {
            Some(("manage", name)) if !name.is_empty() => {
                // a manage grant implies control
                grants.managables.insert(name.to_owned());
                grants.controllables.insert(name.to_owned());
            }
            Some(("control", name)) if !name.is_empty() => {
                grants.controllables.insert(name.to_owned());
            }
            Some(("auth", arg)) => {
                let token = arg
                    .strip_prefix(':')
                    .ok_or_else(|| HandshakeError::Malformed(line.clone()))?;
                grants.token = Some(token.to_owned());
            }
            Some(("auth-match", arg)) => {
                let pattern = arg
                    .strip_prefix(':')
                    .ok_or_else(|| HandshakeError::Malformed(line.clone()))?;
                grants.auth_match = Some(Regex::new(pattern)?);
            }
            _ => return Err(HandshakeError::Malformed(line)),
        }
    }
    let network = read_line(lines).await?;
    Ok((grants, network))
}

async fn read_line<R>(lines: &mut R) -> Result<String, HandshakeError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut buf = String::new();
    if lines.read_line(&mut buf).await? == 0 {
        return Err(HandshakeError::Eof);
    }
    while buf.ends_with('\n') || buf.ends_with('\r') {
        buf.pop();
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_collects_grants() {
        let input = b"manage netA\ncontrol netB\nauth :tok-1\nauth-match :^tok-\ndrop\nnetA\n";
        let mut lines = BufReader::new(&input[..]);
        let (grants, network) = read_handshake(&mut lines).await.unwrap();
        assert_eq!(network, "netA");
        assert!(grants.managables.contains("netA"));
        assert!(grants.controllables.contains("netA"));
        assert!(grants.controllables.contains("netB"));
        assert!(!grants.managables.contains("netB"));
        assert_eq!(grants.token.as_deref(), Some("tok-1"));
        assert!(grants.auth_match.unwrap().is_match("tok-1"));
    }

    #[tokio::test]
    async fn auth_without_colon_is_malformed() {
        let input = b"auth tok-1\ndrop\nnetA\n";
        let mut lines = BufReader::new(&input[..]);
        assert!(matches!(
            read_handshake(&mut lines).await,
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn unknown_verbs_are_malformed() {
        let input = b"administer netA\ndrop\nnetA\n";
        let mut lines = BufReader::new(&input[..]);
        assert!(matches!(
            read_handshake(&mut lines).await,
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn eof_before_drop_is_an_error() {
        let input = b"manage netA\n";
        let mut lines = BufReader::new(&input[..]);
        assert!(matches!(
            read_handshake(&mut lines).await,
            Err(HandshakeError::Eof)
        ));
    }
}
