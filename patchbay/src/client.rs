//! The client-side surface.
//!
//! [`Access`] drives a connection through the handshake and select phases
//! and then multiplexes typed calls over it. Command sessions are cheap;
//! one-shot calls share a session while `watch`/`await` traffic gets its
//! own, so a slow stream never holds up a quick question.
//!
//! Service proxies are reference counted. Dropping the last clone of a
//! [`ServiceHandle`] issues `release-service` on the broker, unless the
//! handle was [`ServiceHandle::detach`]ed first. There is no garbage
//! collector to lean on; the count is the release discipline.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::codec::{BoxRead, BoxWrite, FramedRead, FramedWrite};
use crate::fault::Fault;
use crate::model::Endpoint;
use crate::mux::{Multiplexer, MuxError, Session};
use crate::service::ServiceStatus;

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("i/o during handshake: {0}")]
    Io(#[from] std::io::Error),
    /// The broker refused the select phase.
    #[error("select refused: {0}")]
    Refused(Fault),
    /// The broker reported a fault for a call.
    #[error(transparent)]
    Fault(#[from] Fault),
    #[error("transport: {0}")]
    Transport(#[from] MuxError),
    /// The broker went away mid-call.
    #[error("connection closed")]
    Closed,
    /// A response arrived without the expected correlation id.
    #[error("response correlation mismatch")]
    BadCorrelation,
    #[error("unexpected response shape: {0}")]
    BadResponse(String),
}

/// What to claim during phase A.
#[derive(Clone, Debug, Default)]
pub struct AccessOptions {
    pub manage: Vec<String>,
    pub control: Vec<String>,
    /// Token stamped on services this connection creates.
    pub token: Option<String>,
    /// Pattern matched against existing services' tokens.
    pub token_match: Option<String>,
}

impl AccessOptions {
    pub fn manage(name: &str) -> AccessOptions {
        AccessOptions {
            manage: vec![name.to_owned()],
            ..AccessOptions::default()
        }
    }

    pub fn control(name: &str) -> AccessOptions {
        AccessOptions {
            control: vec![name.to_owned()],
            ..AccessOptions::default()
        }
    }

    pub fn with_token(mut self, token: &str, pattern: &str) -> AccessOptions {
        self.token = Some(token.to_owned());
        self.token_match = Some(pattern.to_owned());
        self
    }

    fn handshake(&self, network: &str) -> String {
        let mut out = String::new();
        for name in &self.manage {
            out.push_str("manage ");
            out.push_str(name);
            out.push('\n');
        }
        for name in &self.control {
            out.push_str("control ");
            out.push_str(name);
            out.push('\n');
        }
        if let Some(token) = &self.token {
            out.push_str("auth :");
            out.push_str(token);
            out.push('\n');
        }
        if let Some(pattern) = &self.token_match {
            out.push_str("auth-match :");
            out.push_str(pattern);
            out.push('\n');
        }
        out.push_str("drop\n");
        out.push_str(network);
        out.push('\n');
        out
    }
}

struct AccessShared {
    mux: Multiplexer,
    commands: Mutex<Option<Session>>,
    next_txn: AtomicU64,
    network: String,
}

/// A bound connection to one network of a broker.
#[derive(Clone)]
pub struct Access {
    shared: Arc<AccessShared>,
}

impl std::fmt::Debug for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Access")
            .field("network", &self.shared.network)
            .finish_non_exhaustive()
    }
}

impl Access {
    /// Handshake and select over a fresh byte stream.
    pub async fn connect<T>(
        stream: T,
        network: &str,
        options: &AccessOptions,
    ) -> Result<Access, ClientError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, mut write) = io::split(stream);
        write
            .write_all(options.handshake(network).as_bytes())
            .await?;

        let mut framed_read = FramedRead::new(Box::new(read) as BoxRead);
        let select = framed_read
            .read()
            .await
            .map_err(MuxError::from)?
            .ok_or(ClientError::Closed)?;
        if let Some(fault) = Fault::from_value(&select) {
            return Err(ClientError::Refused(fault));
        }
        debug!(network, select = %select, "access granted");

        let mux = Multiplexer::client(framed_read, FramedWrite::new(Box::new(write) as BoxWrite));
        Ok(Access {
            shared: Arc::new(AccessShared {
                mux,
                commands: Mutex::new(None),
                next_txn: AtomicU64::new(1),
                network: network.to_owned(),
            }),
        })
    }

    pub fn network(&self) -> &str {
        &self.shared.network
    }

    /// Close the connection, ending every session with EOS.
    pub async fn close(&self) {
        self.shared.mux.shutdown().await;
    }

    /// Create a service, optionally under a client handle.
    pub async fn new_service(&self, handle: Option<&str>) -> Result<ServiceHandle, ClientError> {
        let mut request = json!({"type": "new-service"});
        if let Some(handle) = handle {
            request["handle"] = json!(handle);
        }
        let response = self.call(request).await?;
        let id = field_u32(&response, "service-id")?;
        Ok(ServiceHandle {
            inner: Arc::new(ServiceProxy {
                access: self.clone(),
                id,
                detached: AtomicBool::new(false),
            }),
        })
    }

    /// Look a handle up and wrap the service it names.
    pub async fn find_service(&self, handle: &str) -> Result<Option<ServiceHandle>, ClientError> {
        let response = self
            .call(json!({"type": "find-service", "handle": handle}))
            .await?;
        if response.get("service-id").is_none() {
            return Ok(None);
        }
        let id = field_u32(&response, "service-id")?;
        Ok(Some(ServiceHandle {
            inner: Arc::new(ServiceProxy {
                access: self.clone(),
                id,
                detached: AtomicBool::new(false),
            }),
        }))
    }

    pub async fn check_service(&self, id: u32) -> Result<bool, ClientError> {
        let response = self
            .call(json!({"type": "check-service", "service-id": id}))
            .await?;
        field_bool(&response, "exists")
    }

    pub async fn terminals(&self) -> Result<Vec<String>, ClientError> {
        let response = self.call(json!({"type": "get-terminals"})).await?;
        let names = response
            .get("terminal-names")
            .and_then(Value::as_array)
            .ok_or_else(|| ClientError::BadResponse("terminal-names missing".into()))?;
        Ok(names
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect())
    }

    pub async fn services(&self) -> Result<Vec<u32>, ClientError> {
        let response = self.call(json!({"type": "get-services"})).await?;
        let ids = response
            .get("service-ids")
            .and_then(Value::as_array)
            .ok_or_else(|| ClientError::BadResponse("service-ids missing".into()))?;
        Ok(ids
            .iter()
            .filter_map(Value::as_u64)
            .map(|id| id as u32)
            .collect())
    }

    pub async fn check_terminal(&self, name: &str) -> Result<bool, ClientError> {
        let response = self
            .call(json!({"type": "check-terminal", "terminal-name": name}))
            .await?;
        field_bool(&response, "exists")
    }

    /// The weighted terminal graph, filtered by minimum capacity.
    pub async fn model(&self, min_bw: f64) -> Result<Vec<Value>, ClientError> {
        let response = self
            .call(json!({"type": "get-model", "min-bw": min_bw}))
            .await?;
        response
            .get("edges")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| ClientError::BadResponse("edges missing".into()))
    }

    /// Management only.
    pub async fn dump_status(&self) -> Result<String, ClientError> {
        let response = self.call(json!({"type": "dump-status"})).await?;
        response
            .get("output")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| ClientError::BadResponse("output missing".into()))
    }

    /// Management only.
    pub async fn add_terminal(&self, name: &str, config: &str) -> Result<(), ClientError> {
        self.call(json!({
            "type": "add-terminal",
            "terminal-name": name,
            "terminal-config": config,
        }))
        .await?;
        Ok(())
    }

    /// Management only.
    pub async fn remove_terminal(&self, name: &str) -> Result<(), ClientError> {
        self.call(json!({"type": "remove-terminal", "terminal-name": name}))
            .await?;
        Ok(())
    }

    /// One request, one response, on the shared command session.
    async fn call(&self, mut request: Value) -> Result<Value, ClientError> {
        let txn = self.shared.next_txn.fetch_add(1, Ordering::Relaxed);
        let txn = format!("c-{}", txn);
        request["txn"] = json!(txn);

        let mut commands = self.shared.commands.lock().await;
        if commands.is_none() {
            *commands = Some(self.shared.mux.open()?);
        }
        let session = commands.as_mut().expect("command session present");
        session.write(request).await?;
        let response = session.read().await.ok_or(ClientError::Closed)?;
        if response.get("txn").and_then(Value::as_str) != Some(txn.as_str()) {
            return Err(ClientError::BadCorrelation);
        }
        if let Some(fault) = Fault::from_value(&response) {
            return Err(ClientError::Fault(fault));
        }
        Ok(response)
    }

    /// One request on a dedicated session, for streams and long waits.
    async fn call_detached(&self, request: Value) -> Result<Session, ClientError> {
        let mut session = self.shared.mux.open()?;
        session.write(request).await?;
        Ok(session)
    }
}

struct ServiceProxy {
    access: Access,
    id: u32,
    detached: AtomicBool,
}

impl Drop for ServiceProxy {
    fn drop(&mut self) {
        if self.detached.load(Ordering::Relaxed) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(service = self.id, "dropped outside a runtime; not released");
            return;
        };
        let access = self.access.clone();
        let id = self.id;
        // last reference gone; hand the broker its release
        runtime.spawn(async move {
            if let Err(e) = access
                .call(json!({"type": "release-service", "service-id": id}))
                .await
            {
                warn!(service = id, error = %e, "implicit release failed");
            }
        });
    }
}

/// A reference-counted proxy for one service.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<ServiceProxy>,
}

impl ServiceHandle {
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Keep the service alive past the last handle: the implicit release on
    /// drop is disarmed for every clone.
    pub fn detach(&self) {
        self.inner.detached.store(true, Ordering::Relaxed);
    }

    pub async fn define(&self, endpoints: &[Endpoint]) -> Result<(), ClientError> {
        self.inner
            .access
            .call(json!({
                "type": "define-service",
                "service-id": self.inner.id,
                "segment": endpoints,
            }))
            .await?;
        Ok(())
    }

    pub async fn activate(&self) -> Result<(), ClientError> {
        self.op("activate-service").await
    }

    pub async fn deactivate(&self) -> Result<(), ClientError> {
        self.op("deactivate-service").await
    }

    /// Release explicitly. Disarms the drop path.
    pub async fn release(&self) -> Result<(), ClientError> {
        self.detach();
        self.op("release-service").await
    }

    async fn op(&self, verb: &str) -> Result<(), ClientError> {
        self.inner
            .access
            .call(json!({"type": verb, "service-id": self.inner.id}))
            .await?;
        Ok(())
    }

    pub async fn await_status(
        &self,
        acceptable: &HashSet<ServiceStatus>,
        timeout: Duration,
    ) -> Result<ServiceStatus, ClientError> {
        let names: Vec<&str> = acceptable.iter().map(ServiceStatus::as_str).collect();
        let mut session = self
            .inner
            .access
            .call_detached(json!({
                "type": "await-service-status",
                "service-id": self.inner.id,
                "acceptable": names,
                "timeout-millis": timeout.as_millis() as u64,
            }))
            .await?;
        let response = session.read().await.ok_or(ClientError::Closed)?;
        session.close().await;
        if let Some(fault) = Fault::from_value(&response) {
            return Err(ClientError::Fault(fault));
        }
        parse_status(&response)
    }

    /// Subscribe to the service's transitions on a dedicated session.
    pub async fn watch(&self) -> Result<StatusStream, ClientError> {
        let session = self
            .inner
            .access
            .call_detached(json!({
                "type": "watch-service",
                "service-id": self.inner.id,
            }))
            .await?;
        Ok(StatusStream { session })
    }
}

/// The statuses streamed by a `watch-service` subscription.
pub struct StatusStream {
    session: Session,
}

impl StatusStream {
    /// The next transition; `None` once the service is RELEASED (the broker
    /// closes the session) or the connection is gone.
    pub async fn next(&mut self) -> Option<Result<ServiceStatus, ClientError>> {
        let response = self.session.read().await?;
        if let Some(fault) = Fault::from_value(&response) {
            return Some(Err(ClientError::Fault(fault)));
        }
        Some(parse_status(&response))
    }

    /// Cancel the subscription; the broker drops the listener.
    pub async fn cancel(mut self) {
        self.session.close().await;
    }
}

fn parse_status(response: &Value) -> Result<ServiceStatus, ClientError> {
    response
        .get("status")
        .and_then(Value::as_str)
        .and_then(ServiceStatus::from_str)
        .ok_or_else(|| ClientError::BadResponse("status missing".into()))
}

fn field_u32(response: &Value, field: &str) -> Result<u32, ClientError> {
    response
        .get(field)
        .and_then(Value::as_u64)
        .filter(|v| *v <= u64::from(u32::MAX))
        .map(|v| v as u32)
        .ok_or_else(|| ClientError::BadResponse(format!("{} missing", field)))
}

fn field_bool(response: &Value, field: &str) -> Result<bool, ClientError> {
    response
        .get(field)
        .and_then(Value::as_bool)
        .ok_or_else(|| ClientError::BadResponse(format!("{} missing", field)))
}
