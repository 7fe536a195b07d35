//! Per-network registries: terminals, services, handles.
//!
//! A [`Network`] owns the terminal table, the service table and its handle
//! index, and the resource accounting (committed bandwidth and labels). It
//! is the layer that validates a requested segment against real terminals
//! before the service state machine and the fabric ever see it, and the one
//! that recomputes the fabric's retain set when a service releases.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::fabric::{BridgeRef, Fabric};
use crate::fault::{Direction, Fault};
use crate::model::{validate_name, CanonicalFlows, Endpoint, Segment, Terminal};
use crate::service::{Service, ServiceStatus};

/// The management level a network advertises at select time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkKind {
    Plain,
    Switch,
    Aggregator,
}

impl NetworkKind {
    /// The flag name used in the select response.
    pub fn flag(&self) -> &'static str {
        match self {
            NetworkKind::Plain => "network",
            NetworkKind::Switch => "switch",
            NetworkKind::Aggregator => "aggregator",
        }
    }
}

struct Commitment {
    labels: Vec<(String, u32)>,
    bandwidth: Vec<(String, f64, f64)>,
}

#[derive(Default)]
struct NetworkState {
    terminals: HashMap<String, Terminal>,
    services: HashMap<u32, Service>,
    handles: HashMap<String, u32>,
    next_service: u32,
    labels: HashMap<(String, u32), u32>,
    bw_used: HashMap<String, (f64, f64)>,
    commitments: HashMap<u32, Commitment>,
}

/// A named container of terminals and the services wired between them.
pub struct Network {
    name: String,
    kind: NetworkKind,
    fabric: Arc<dyn Fabric>,
    state: Mutex<NetworkState>,
}

impl Network {
    pub fn new(name: &str, kind: NetworkKind, fabric: Arc<dyn Fabric>) -> Network {
        Network {
            name: name.to_owned(),
            kind,
            fabric,
            state: Mutex::new(NetworkState {
                next_service: 1,
                ..NetworkState::default()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NetworkKind {
        self.kind
    }

    // ===== terminal management =====

    pub async fn add_terminal(
        &self,
        name: &str,
        config: &str,
        ingress_limit: Option<f64>,
        egress_limit: Option<f64>,
        labels: Option<(u32, u32)>,
    ) -> Result<(), Fault> {
        validate_name(name)?;
        let iface = self.fabric.interface(config)?;
        let mut st = self.state.lock().await;
        if st.terminals.contains_key(name) {
            return Err(Fault::terminal_exists(name));
        }
        let mut terminal = Terminal::new(name, iface)?.with_limits(ingress_limit, egress_limit);
        if let Some((lo, hi)) = labels {
            if lo > hi {
                return Err(Fault::terminal_config(config, "empty label range"));
            }
            terminal = terminal.with_labels(lo, hi);
        }
        info!(network = %self.name, terminal = name, config, "terminal added");
        st.terminals.insert(name.to_owned(), terminal);
        Ok(())
    }

    pub async fn remove_terminal(&self, name: &str) -> Result<(), Fault> {
        let mut st = self.state.lock().await;
        if !st.terminals.contains_key(name) {
            return Err(Fault::terminal_unknown(name));
        }
        if st.labels.keys().any(|(terminal, _)| terminal == name) {
            return Err(Fault::terminal_busy(name));
        }
        st.terminals.remove(name);
        info!(network = %self.name, terminal = name, "terminal removed");
        Ok(())
    }

    pub async fn terminals(&self) -> Vec<String> {
        let st = self.state.lock().await;
        let mut names: Vec<String> = st.terminals.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn has_terminal(&self, name: &str) -> bool {
        self.state.lock().await.terminals.contains_key(name)
    }

    // ===== service lifecycle =====

    /// Create a DORMANT service, stamped with the caller's auth token.
    pub async fn new_service(
        &self,
        handle: Option<String>,
        token: Option<String>,
    ) -> Result<Service, Fault> {
        if self.fabric.capacity().await == 0 {
            return Err(Fault::network_resource("no bridge capacity left")
                .annotate_network(&self.name));
        }
        let mut st = self.state.lock().await;
        if let Some(handle) = &handle {
            if st.handles.contains_key(handle) {
                return Err(Fault::bad_argument(format!(
                    "service handle {:?} is taken",
                    handle
                )));
            }
        }
        let id = st.next_service;
        st.next_service += 1;
        let service = Service::new(id, &self.name, self.fabric.clone(), handle.clone(), token);
        if let Some(handle) = handle {
            st.handles.insert(handle, id);
        }
        st.services.insert(id, service.clone());
        debug!(network = %self.name, service = id, "service created");
        Ok(service)
    }

    pub async fn find_service(&self, handle: &str) -> Option<u32> {
        self.state.lock().await.handles.get(handle).copied()
    }

    /// Look a live service up; released and unknown ids read the same.
    pub async fn service(&self, id: u32) -> Result<Service, Fault> {
        let service = {
            let st = self.state.lock().await;
            st.services.get(&id).cloned()
        };
        match service {
            Some(service) if service.status().await != ServiceStatus::Released => Ok(service),
            _ => Err(Fault::expired_service(id)),
        }
    }

    /// Look a service up for observation. Unlike [`Network::service`] this
    /// still resolves a RELEASED service, so a late watcher can be handed
    /// the terminal status; only ids that never existed fail.
    pub async fn service_any(&self, id: u32) -> Result<Service, Fault> {
        let st = self.state.lock().await;
        st.services
            .get(&id)
            .cloned()
            .ok_or_else(|| Fault::expired_service(id))
    }

    pub async fn check_service(&self, id: u32) -> bool {
        self.service(id).await.is_ok()
    }

    pub async fn service_ids(&self) -> Vec<u32> {
        let services: Vec<Service> = {
            let st = self.state.lock().await;
            st.services.values().cloned().collect()
        };
        let mut ids = Vec::new();
        for service in services {
            if service.status().await != ServiceStatus::Released {
                ids.push(service.id());
            }
        }
        ids.sort_unstable();
        ids
    }

    /// Validate, commit resources, and define the service's segment.
    pub async fn define_service(&self, id: u32, endpoints: Vec<Endpoint>) -> Result<(), Fault> {
        let service = self.service(id).await?;
        let resolution = {
            let mut st = self.state.lock().await;
            self.resolve_and_commit(&mut st, id, endpoints)
        };
        let committed = resolution.is_ok();
        match service.define(resolution).await {
            Ok(()) => Ok(()),
            Err(fault) => {
                if committed {
                    self.uncommit(id).await;
                }
                Err(fault)
            }
        }
    }

    /// Release a service and reconcile the fabric against the survivors.
    pub async fn release_service(&self, id: u32) -> Result<(), Fault> {
        let service = self.service(id).await?;
        let dropped = service.release().await?;
        self.uncommit(id).await;

        let remaining = self.live_bridge_refs(id).await;
        match dropped {
            Some(bridge) if remaining.contains(&bridge) => {
                // another service still holds the same circuit set
                service.complete_release().await;
            }
            _ => self.fabric.retain(&remaining).await,
        }
        Ok(())
    }

    async fn live_bridge_refs(&self, exclude: u32) -> HashSet<BridgeRef> {
        let services: Vec<Service> = {
            let st = self.state.lock().await;
            st.services
                .values()
                .filter(|s| s.id() != exclude)
                .cloned()
                .collect()
        };
        let mut refs = HashSet::new();
        for service in services {
            if let Some(bridge) = service.bridge_ref().await {
                refs.insert(bridge);
            }
        }
        refs
    }

    fn resolve_and_commit(
        &self,
        st: &mut NetworkState,
        id: u32,
        endpoints: Vec<Endpoint>,
    ) -> Result<(Segment, CanonicalFlows), Fault> {
        // one commitment per service; a second define must not clobber it
        if st.commitments.contains_key(&id) {
            return Err(Fault::service_logic("service already holds a segment"));
        }
        let segment = Segment::from_endpoints(endpoints)?;

        let mut flows = CanonicalFlows::new();
        for (circuit, flow) in segment.iter() {
            let terminal = st
                .terminals
                .get(&circuit.terminal)
                .ok_or_else(|| Fault::terminal_unknown(&*circuit.terminal))?;
            if st
                .labels
                .contains_key(&(circuit.terminal.clone(), circuit.label))
            {
                return Err(Fault::labels_in_use([circuit.label]));
            }
            let key = terminal.circuit(circuit.label)?;
            if flows.insert(key, *flow).is_some() {
                return Err(Fault::segment_invalid(format!(
                    "circuit {} duplicates another endpoint's canonical circuit",
                    circuit
                )));
            }
        }

        // per-terminal bandwidth, against configured caps
        let mut need: HashMap<&str, (f64, f64)> = HashMap::new();
        for (circuit, flow) in segment.iter() {
            let entry = need.entry(circuit.terminal.as_str()).or_default();
            entry.0 += flow.ingress;
            entry.1 += flow.egress;
        }
        for (name, (ingress, egress)) in &need {
            let terminal = &st.terminals[*name];
            let used = st.bw_used.get(*name).copied().unwrap_or_default();
            if let Some(limit) = terminal.ingress_limit() {
                if used.0 + ingress > limit {
                    return Err(Fault::bw_unavailable(Direction::Ingress, *ingress));
                }
            }
            if let Some(limit) = terminal.egress_limit() {
                if used.1 + egress > limit {
                    return Err(Fault::bw_unavailable(Direction::Egress, *egress));
                }
            }
        }

        // all checks passed; commit
        let mut commitment = Commitment {
            labels: Vec::new(),
            bandwidth: Vec::new(),
        };
        for (circuit, _) in segment.iter() {
            st.labels
                .insert((circuit.terminal.clone(), circuit.label), id);
            commitment
                .labels
                .push((circuit.terminal.clone(), circuit.label));
        }
        for (name, (ingress, egress)) in need {
            let used = st.bw_used.entry(name.to_owned()).or_default();
            used.0 += ingress;
            used.1 += egress;
            commitment.bandwidth.push((name.to_owned(), ingress, egress));
        }
        st.commitments.insert(id, commitment);
        Ok((segment, flows))
    }

    async fn uncommit(&self, id: u32) {
        let mut st = self.state.lock().await;
        if let Some(commitment) = st.commitments.remove(&id) {
            for key in commitment.labels {
                st.labels.remove(&key);
            }
            for (name, ingress, egress) in commitment.bandwidth {
                if let Some(used) = st.bw_used.get_mut(&name) {
                    used.0 = (used.0 - ingress).max(0.0);
                    used.1 = (used.1 - egress).max(0.0);
                }
            }
        }
    }

    // ===== model and status =====

    /// The network model: one weighted edge per terminal pair, with the
    /// remaining capacity per direction. Edges whose capacity falls below
    /// `min_bw` are omitted; uncapped directions are reported as null.
    pub async fn model(&self, min_bw: f64) -> Vec<Value> {
        let st = self.state.lock().await;
        let mut names: Vec<&String> = st.terminals.keys().collect();
        names.sort();

        let avail = |name: &str| -> (Option<f64>, Option<f64>) {
            let terminal = &st.terminals[name];
            let used = st.bw_used.get(name).copied().unwrap_or_default();
            (
                terminal.ingress_limit().map(|l| (l - used.0).max(0.0)),
                terminal.egress_limit().map(|l| (l - used.1).max(0.0)),
            )
        };

        let mut edges = Vec::new();
        for (i, from) in names.iter().enumerate() {
            for to in &names[i + 1..] {
                let (from_in, from_out) = avail(from);
                let (to_in, to_out) = avail(to);
                let upstream = min_opt(from_in, to_out);
                let downstream = min_opt(to_in, from_out);
                if [upstream, downstream]
                    .iter()
                    .any(|cap| cap.is_some_and(|c| c < min_bw))
                {
                    continue;
                }
                edges.push(json!({
                    "from": from,
                    "to": to,
                    "weight": 1.0,
                    "upstream": upstream,
                    "downstream": downstream,
                }));
            }
        }
        edges
    }

    /// A plain-text status dump for operators.
    pub async fn dump_status(&self) -> String {
        let (terminal_lines, services) = {
            let st = self.state.lock().await;
            let mut names: Vec<&String> = st.terminals.keys().collect();
            names.sort();
            let lines: Vec<String> = names
                .iter()
                .map(|name| {
                    let t = &st.terminals[*name];
                    format!("  {} config={}", name, t.descriptor())
                })
                .collect();
            let mut services: Vec<Service> = st.services.values().cloned().collect();
            services.sort_by_key(Service::id);
            (lines, services)
        };

        let mut out = String::new();
        let _ = writeln!(out, "network {}", self.name);
        let _ = writeln!(out, "terminals:");
        for line in terminal_lines {
            let _ = writeln!(out, "{}", line);
        }
        let _ = writeln!(out, "services:");
        for service in services {
            let snap = service.snapshot().await;
            let handle = snap
                .handle
                .map(|h| format!(" handle={}", h))
                .unwrap_or_default();
            let errors = if snap.errors.is_empty() {
                String::new()
            } else {
                format!(
                    " errors=[{}]",
                    snap.errors
                        .iter()
                        .map(|k| k.as_str())
                        .collect::<Vec<_>>()
                        .join(",")
                )
            };
            let _ = writeln!(
                out,
                "  {}: {}{} circuits={}{}",
                snap.id, snap.status, handle, snap.circuits, errors
            );
        }
        out
    }
}

fn min_opt(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// The broker: a read-mostly registry of networks, built at startup.
pub struct Broker {
    networks: HashMap<String, Arc<Network>>,
}

impl Broker {
    pub fn new(networks: Vec<Arc<Network>>) -> Broker {
        Broker {
            networks: networks
                .into_iter()
                .map(|n| (n.name().to_owned(), n))
                .collect(),
        }
    }

    pub fn network(&self, name: &str) -> Option<Arc<Network>> {
        self.networks.get(name).cloned()
    }

    pub fn network_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.networks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::testing::TestFabric;
    use crate::fault::FaultKind;
    use std::collections::HashSet as StdHashSet;
    use std::time::Duration;

    async fn network() -> (Arc<TestFabric>, Network) {
        let fabric = Arc::new(TestFabric::new());
        let net = Network::new("netA", NetworkKind::Switch, fabric.clone());
        net.add_terminal("t1", "phys.3", None, None, None).await.unwrap();
        net.add_terminal("t2", "phys.4", None, None, None).await.unwrap();
        (fabric, net)
    }

    fn endpoints(bw: f64) -> Vec<Endpoint> {
        vec![
            Endpoint {
                terminal: "t1".into(),
                label: 100,
                ingress: bw,
                egress: bw,
            },
            Endpoint {
                terminal: "t2".into(),
                label: 200,
                ingress: bw,
                egress: bw,
            },
        ]
    }

    async fn settle(net: &Network, id: u32, expect: ServiceStatus) {
        let status = net
            .service(id)
            .await
            .unwrap()
            .await_status(&StdHashSet::from([expect]), Duration::from_secs(1))
            .await;
        assert_eq!(status, expect);
    }

    #[tokio::test]
    async fn duplicate_terminals_are_rejected() {
        let (_fabric, net) = network().await;
        let err = net
            .add_terminal("t1", "phys.5", None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::TerminalExists);
    }

    #[tokio::test]
    async fn bad_terminal_config_is_rejected() {
        let (_fabric, net) = network().await;
        let err = net
            .add_terminal("t3", "eth0", None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::TerminalConfig);
    }

    #[tokio::test]
    async fn busy_terminals_cannot_be_removed() {
        let (_fabric, net) = network().await;
        let svc = net.new_service(None, None).await.unwrap();
        net.define_service(svc.id(), endpoints(10.0)).await.unwrap();
        settle(&net, svc.id(), ServiceStatus::Inactive).await;

        let err = net.remove_terminal("t1").await.unwrap_err();
        assert_eq!(err.kind(), FaultKind::TerminalBusy);

        net.release_service(svc.id()).await.unwrap();
        settle(&net, svc.id(), ServiceStatus::Released).await;
        net.remove_terminal("t1").await.unwrap();
    }

    #[tokio::test]
    async fn handles_resolve_and_stay_unique() {
        let (_fabric, net) = network().await;
        let svc = net
            .new_service(Some("alpha".into()), None)
            .await
            .unwrap();
        assert_eq!(net.find_service("alpha").await, Some(svc.id()));
        assert_eq!(net.find_service("beta").await, None);

        let err = net
            .new_service(Some("alpha".into()), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::BadArgument);
    }

    #[tokio::test]
    async fn unknown_terminal_fails_the_define() {
        let (_fabric, net) = network().await;
        let svc = net.new_service(None, None).await.unwrap();
        let mut eps = endpoints(10.0);
        eps[1].terminal = "t9".into();
        let err = net.define_service(svc.id(), eps).await.unwrap_err();
        assert_eq!(err.kind(), FaultKind::TerminalUnknown);
        assert_eq!(
            net.service(svc.id()).await.unwrap().status().await,
            ServiceStatus::Failed
        );
    }

    #[tokio::test]
    async fn labels_cannot_be_shared_between_services() {
        let (_fabric, net) = network().await;
        let first = net.new_service(None, None).await.unwrap();
        net.define_service(first.id(), endpoints(10.0))
            .await
            .unwrap();
        settle(&net, first.id(), ServiceStatus::Inactive).await;

        let second = net.new_service(None, None).await.unwrap();
        let err = net
            .define_service(second.id(), endpoints(10.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::LabelsInUse);

        // releasing the first returns the labels
        net.release_service(first.id()).await.unwrap();
        settle(&net, first.id(), ServiceStatus::Released).await;

        let third = net.new_service(None, None).await.unwrap();
        net.define_service(third.id(), endpoints(10.0)).await.unwrap();
    }

    #[tokio::test]
    async fn oversubscription_is_refused() {
        let fabric = Arc::new(TestFabric::new());
        let net = Network::new("netA", NetworkKind::Switch, fabric);
        net.add_terminal("t1", "phys.3", Some(15.0), None, None)
            .await
            .unwrap();
        net.add_terminal("t2", "phys.4", None, None, None).await.unwrap();

        let first = net.new_service(None, None).await.unwrap();
        net.define_service(first.id(), endpoints(10.0))
            .await
            .unwrap();
        settle(&net, first.id(), ServiceStatus::Inactive).await;

        let second = net.new_service(None, None).await.unwrap();
        let mut eps = endpoints(10.0);
        eps[0].label = 101;
        eps[1].label = 201;
        let err = net.define_service(second.id(), eps).await.unwrap_err();
        assert_eq!(err.kind(), FaultKind::BwUnavailable);
        assert_eq!(err.field("direction"), Some(&json!("ingress")));
    }

    #[tokio::test]
    async fn model_reports_remaining_capacity() {
        let fabric = Arc::new(TestFabric::new());
        let net = Network::new("netA", NetworkKind::Switch, fabric);
        net.add_terminal("t1", "phys.3", Some(100.0), Some(80.0), None)
            .await
            .unwrap();
        net.add_terminal("t2", "phys.4", None, None, None).await.unwrap();

        let edges = net.model(0.0).await;
        assert_eq!(edges.len(), 1);
        let edge = &edges[0];
        assert_eq!(edge["from"], json!("t1"));
        assert_eq!(edge["to"], json!("t2"));
        // t1 caps both directions; t2 is uncapped
        assert_eq!(edge["upstream"], json!(100.0));
        assert_eq!(edge["downstream"], json!(80.0));

        // a min-bw above the remaining capacity hides the edge
        assert!(net.model(90.0).await.is_empty());
    }

    #[tokio::test]
    async fn released_services_vanish_from_listings() {
        let (_fabric, net) = network().await;
        let svc = net.new_service(None, None).await.unwrap();
        assert!(net.check_service(svc.id()).await);
        assert_eq!(net.service_ids().await, vec![svc.id()]);

        net.release_service(svc.id()).await.unwrap();
        settle(&net, svc.id(), ServiceStatus::Released).await;
        assert!(!net.check_service(svc.id()).await);
        assert!(net.service_ids().await.is_empty());
        assert_eq!(
            net.release_service(svc.id()).await.unwrap_err().kind(),
            FaultKind::ExpiredService
        );
    }

    #[tokio::test]
    async fn dump_status_lists_terminals_and_services() {
        let (_fabric, net) = network().await;
        let svc = net.new_service(Some("alpha".into()), None).await.unwrap();
        net.define_service(svc.id(), endpoints(10.0)).await.unwrap();
        settle(&net, svc.id(), ServiceStatus::Inactive).await;

        let dump = net.dump_status().await;
        assert!(dump.contains("network netA"));
        assert!(dump.contains("t1 config=phys.3"));
        assert!(dump.contains("1: INACTIVE handle=alpha circuits=2"));
    }
}

