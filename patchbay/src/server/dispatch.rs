//! The per-session command loop.
//!
//! Each accepted session reads request objects and answers them in order.
//! A request's optional `"txn"` is echoed verbatim on every response it
//! produces. `watch-service` takes the session over: it streams status
//! objects until RELEASED (then closes the session) or until the peer
//! closes first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::fault::Fault;
use crate::model::Endpoint;
use crate::mux::Session;
use crate::network::Network;
use crate::service::{Service, ServiceStatus};

/// Per-connection state shared by its sessions.
pub(crate) struct ConnContext {
    pub network: Arc<Network>,
    /// The bound network is in the connection's managables.
    pub managed: bool,
    pub auth_match: Option<Regex>,
    pub token: Option<String>,
}

pub(crate) async fn run_session(mut session: Session, ctx: Arc<ConnContext>) {
    trace!(session = session.id(), "command loop started");
    loop {
        let Some(request) = session.read().await else {
            break;
        };
        let txn = request.get("txn").cloned();
        let verb = request
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let outcome = match verb.as_deref() {
            None => Err(Fault::bad_argument("request has no type")),
            Some("watch-service") => {
                match watch_service(&mut session, &ctx, &request, txn.as_ref()).await {
                    Ok(()) => break,
                    Err(fault) => Err(fault),
                }
            }
            Some(verb) => dispatch(verb, &ctx, &request).await,
        };

        let response = match outcome {
            Ok(response) => response,
            Err(fault) => fault.annotate_network(ctx.network.name()).to_value(),
        };
        if session.write(with_txn(response, txn.as_ref())).await.is_err() {
            break;
        }
    }
    session.close().await;
    trace!("command loop ended");
}

fn with_txn(mut response: Value, txn: Option<&Value>) -> Value {
    if let (Value::Object(obj), Some(txn)) = (&mut response, txn) {
        obj.insert("txn".to_owned(), txn.clone());
    }
    response
}

async fn dispatch(verb: &str, ctx: &ConnContext, request: &Value) -> Result<Value, Fault> {
    match verb {
        "new-service" => new_service(ctx, request).await,
        "find-service" => find_service(ctx, request).await,
        "check-service" => {
            let id = service_id(request)?;
            Ok(json!({"exists": ctx.network.check_service(id).await}))
        }
        "define-service" => {
            let id = service_id(request)?;
            let endpoints: Vec<Endpoint> =
                serde_json::from_value(request.get("segment").cloned().unwrap_or(Value::Null))
                    .map_err(|e| Fault::bad_argument(format!("bad segment: {}", e)))?;
            authorized_service(ctx, id).await?;
            ctx.network
                .define_service(id, endpoints)
                .await
                .map_err(|f| f.annotate_service(id))?;
            Ok(json!({}))
        }
        "activate-service" => {
            let id = service_id(request)?;
            let service = authorized_service(ctx, id).await?;
            service
                .activate()
                .await
                .map_err(|f| f.annotate_service(id))?;
            Ok(json!({}))
        }
        "deactivate-service" => {
            let id = service_id(request)?;
            let service = authorized_service(ctx, id).await?;
            service
                .deactivate()
                .await
                .map_err(|f| f.annotate_service(id))?;
            Ok(json!({}))
        }
        "release-service" => {
            let id = service_id(request)?;
            authorized_service(ctx, id).await?;
            ctx.network
                .release_service(id)
                .await
                .map_err(|f| f.annotate_service(id))?;
            Ok(json!({}))
        }
        "await-service-status" => await_service_status(ctx, request).await,
        "get-terminals" => Ok(json!({"terminal-names": ctx.network.terminals().await})),
        "get-services" => Ok(json!({"service-ids": ctx.network.service_ids().await})),
        "check-terminal" => {
            let name = required_str(request, "terminal-name")?;
            Ok(json!({"exists": ctx.network.has_terminal(name).await}))
        }
        "get-model" => {
            let min_bw = request
                .get("min-bw")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            Ok(json!({"edges": ctx.network.model(min_bw).await}))
        }
        "dump-status" => {
            require_managed(ctx)?;
            Ok(json!({"output": ctx.network.dump_status().await}))
        }
        "add-terminal" => {
            require_managed(ctx)?;
            let name = required_str(request, "terminal-name")?;
            let config = required_str(request, "terminal-config")?;
            let ingress = request.get("ingress-limit").and_then(Value::as_f64);
            let egress = request.get("egress-limit").and_then(Value::as_f64);
            let labels = match (
                request.get("min-label").and_then(Value::as_u64),
                request.get("max-label").and_then(Value::as_u64),
            ) {
                (Some(lo), Some(hi)) => Some((lo as u32, hi as u32)),
                (None, None) => None,
                _ => {
                    return Err(Fault::bad_argument(
                        "min-label and max-label come as a pair",
                    ))
                }
            };
            ctx.network
                .add_terminal(name, config, ingress, egress, labels)
                .await?;
            Ok(json!({}))
        }
        "remove-terminal" => {
            require_managed(ctx)?;
            let name = required_str(request, "terminal-name")?;
            ctx.network.remove_terminal(name).await?;
            Ok(json!({}))
        }
        other => Err(Fault::bad_argument(format!(
            "unknown request type {:?}",
            other
        ))),
    }
}

async fn new_service(ctx: &ConnContext, request: &Value) -> Result<Value, Fault> {
    let handle = match request.get("handle") {
        None | Some(Value::Null) => None,
        Some(Value::String(handle)) => Some(handle.clone()),
        Some(_) => return Err(Fault::bad_argument("handle is not a string")),
    };
    let service = ctx
        .network
        .new_service(handle, ctx.token.clone())
        .await?;
    Ok(json!({"service-id": service.id()}))
}

async fn find_service(ctx: &ConnContext, request: &Value) -> Result<Value, Fault> {
    let handle = required_str(request, "handle")?;
    match ctx.network.find_service(handle).await {
        Some(id) => Ok(json!({"service-id": id})),
        None => Ok(json!({})),
    }
}

async fn await_service_status(ctx: &ConnContext, request: &Value) -> Result<Value, Fault> {
    let id = service_id(request)?;
    let acceptable = request
        .get("acceptable")
        .and_then(Value::as_array)
        .ok_or_else(|| Fault::bad_argument("acceptable is not an array"))?;
    let mut statuses = HashSet::new();
    for status in acceptable {
        let name = status
            .as_str()
            .and_then(ServiceStatus::from_str)
            .ok_or_else(|| Fault::bad_argument(format!("{} is not a status", status)))?;
        statuses.insert(name);
    }
    let timeout = request
        .get("timeout-millis")
        .and_then(Value::as_u64)
        .ok_or_else(|| Fault::bad_argument("timeout-millis missing"))?;
    let service = authorized_service(ctx, id).await?;
    let status = service
        .await_status(&statuses, Duration::from_millis(timeout))
        .await;
    Ok(json!({"status": status.as_str()}))
}

/// Stream status transitions on the session until RELEASED or peer close.
async fn watch_service(
    session: &mut Session,
    ctx: &ConnContext,
    request: &Value,
    txn: Option<&Value>,
) -> Result<(), Fault> {
    let id = service_id(request)?;
    // a watch may outlive the service: even a RELEASED one is still
    // observable for its one terminal delivery
    let service = ctx.network.service_any(id).await?;
    service.authorize(ctx.auth_match.as_ref()).await?;
    let mut statuses: mpsc::UnboundedReceiver<ServiceStatus> = service.watch().await;
    debug!(service = id, session = session.id(), "watch started");

    loop {
        tokio::select! {
            status = statuses.recv() => {
                let Some(status) = status else { break };
                let response = with_txn(json!({"status": status.as_str()}), txn);
                if session.write(response).await.is_err() {
                    break;
                }
                if status == ServiceStatus::Released {
                    break;
                }
            }
            next = session.read() => {
                match next {
                    // the peer closed the session; dropping the receiver
                    // removes the listener
                    None => break,
                    Some(extra) => {
                        warn!(service = id, "request during watch ignored: {}", extra);
                    }
                }
            }
        }
    }
    debug!(service = id, "watch ended");
    Ok(())
}

fn require_managed(ctx: &ConnContext) -> Result<(), Fault> {
    if ctx.managed {
        Ok(())
    } else {
        Err(Fault::network_resource("management calls forbidden"))
    }
}

fn service_id(request: &Value) -> Result<u32, Fault> {
    request
        .get("service-id")
        .and_then(Value::as_u64)
        .filter(|id| *id <= u64::from(u32::MAX))
        .map(|id| id as u32)
        .ok_or_else(|| Fault::bad_argument("service-id missing or not an integer"))
}

fn required_str<'r>(request: &'r Value, field: &str) -> Result<&'r str, Fault> {
    request
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| Fault::bad_argument(format!("{} missing or not a string", field)))
}

async fn authorized_service(ctx: &ConnContext, id: u32) -> Result<Service, Fault> {
    let service = ctx.network.service(id).await?;
    service.authorize(ctx.auth_match.as_ref()).await?;
    Ok(service)
}
