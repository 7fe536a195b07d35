//! Desired-state reconciliation of bridges against the switch.
//!
//! Callers acquire bridge *references* keyed by a canonical circuit set and
//! present the set of references they still hold via [`Fabric::retain`];
//! the manager adds and removes switch state to match. [`Fabric::start`]
//! realizes a reserved bridge on hardware, [`Fabric::stop`] tears the
//! hardware realization down while keeping the reservation (and with it the
//! exclusive claim on the circuits).
//!
//! Two realization modes exist: one VFC per bridge, and one shared VFC whose
//! bridges are port sets posted to an external controller. Both share the
//! [`Fabric`] contract.

pub mod ctrl;
pub mod rest;
#[doc(hidden)]
pub mod testing;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::fault::Fault;
use crate::iface::{CircuitKey, Interface, PortCaps};
use crate::model::{CanonicalFlows, TrafficFlow};

use self::ctrl::CtrlRest;
use self::rest::{BridgeCreate, ControllerTarget, SwitchRest, TunnelDesc};

/// Events delivered to a bridge listener.
#[derive(Clone, Debug, PartialEq)]
pub enum BridgeEvent {
    /// The requested state (reservation or start) is in place.
    Created,
    /// The hardware realization is gone (stop or retained-out).
    Destroyed,
    /// The fabric could not reach the requested state.
    Error(Fault),
}

/// A bridge listener: events are queued, never delivered under a fabric lock.
pub type BridgeListener = mpsc::UnboundedSender<BridgeEvent>;

/// The canonical identity of a bridge: its set of circuits.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BridgeKey(BTreeSet<CircuitKey>);

impl BridgeKey {
    /// The key of the bridge realizing a canonical flow map.
    pub fn from_flows(flows: &CanonicalFlows) -> BridgeKey {
        BridgeKey(flows.keys().copied().collect())
    }

    pub fn circuits(&self) -> impl Iterator<Item = &CircuitKey> {
        self.0.iter()
    }
}

impl fmt::Display for BridgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, "}}")
    }
}

/// A caller's reference to a bridge.
#[derive(Clone, Debug)]
pub struct BridgeRef {
    key: Arc<BridgeKey>,
}

impl BridgeRef {
    /// Wrap a key. Alternate [`Fabric`] implementations mint their
    /// references here.
    pub fn new(key: BridgeKey) -> BridgeRef {
        BridgeRef { key: Arc::new(key) }
    }

    pub fn key(&self) -> &BridgeKey {
        &self.key
    }
}

impl PartialEq for BridgeRef {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for BridgeRef {}

impl std::hash::Hash for BridgeRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// The fabric contract the service layer runs against.
#[async_trait]
pub trait Fabric: Send + Sync + 'static {
    /// Reserve (or share) the bridge for a canonical circuit set.
    ///
    /// On success the listener receives `Created` once the reservation is in
    /// place; circuit conflicts and exhausted capacity fail immediately.
    async fn bridge(
        &self,
        listener: BridgeListener,
        flows: &CanonicalFlows,
    ) -> Result<BridgeRef, Fault>;

    /// Tear down every bridge not in `keep`.
    async fn retain(&self, keep: &HashSet<BridgeRef>);

    /// Realize a reserved bridge on the switch. Completion or failure is
    /// reported through the bridge's listeners.
    async fn start(&self, bridge: &BridgeRef);

    /// Undo [`Fabric::start`], keeping the reservation.
    async fn stop(&self, bridge: &BridgeRef);

    /// Remaining bridge headroom.
    async fn capacity(&self) -> usize;

    /// Parse an interface descriptor against this switch's limits.
    fn interface(&self, desc: &str) -> Result<Interface, Fault>;
}

/// How bridges are realized on the switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Realization {
    /// Each bridge is its own VFC.
    PerLink,
    /// One shared VFC; each bridge is a port set posted to the controller.
    Shared,
}

/// Static fabric parameters, mostly from the agent's configuration block.
#[derive(Clone, Debug)]
pub struct FabricConfig {
    pub mode: Realization,
    /// Every bridge description starts with this.
    pub descr_prefix: String,
    /// Suffix while a bridge is being configured.
    pub partial_suffix: String,
    /// Suffix once a bridge is fully configured.
    pub complete_suffix: String,
    /// Destroy prefixed bridges whose suffix is neither of the above.
    pub destroy_unrecognized: bool,
    pub shaping: bool,
    pub metering: bool,
    /// Committed burst size used when metering.
    pub cbs_bytes: u64,
    pub dpid: u64,
    pub subtype: Option<String>,
    pub resources: Option<u32>,
    pub netns: Option<String>,
    /// OpenFlow controller attached to created VFCs.
    pub controller: Option<ControllerTarget>,
    pub max_bridges: usize,
    pub caps: PortCaps,
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig {
            mode: Realization::Shared,
            descr_prefix: "patchbay:vc:".to_owned(),
            partial_suffix: "partial".to_owned(),
            complete_suffix: "complete".to_owned(),
            destroy_unrecognized: false,
            shaping: true,
            metering: true,
            cbs_bytes: 512 * 1024,
            dpid: 1,
            subtype: None,
            resources: None,
            netns: None,
            controller: None,
            max_bridges: 63,
            caps: PortCaps::default(),
        }
    }
}

impl FabricConfig {
    fn partial_descr(&self) -> String {
        format!("{}{}", self.descr_prefix, self.partial_suffix)
    }

    fn complete_descr(&self) -> String {
        format!("{}{}", self.descr_prefix, self.complete_suffix)
    }

    fn stamp(&self, seq: u64) -> String {
        format!("{}{}", self.descr_prefix, seq)
    }

    fn parse_stamp(&self, descr: &str) -> Option<u64> {
        descr.strip_prefix(&self.descr_prefix)?.parse().ok()
    }
}

struct BridgeEntity {
    flows: CanonicalFlows,
    listeners: Vec<BridgeListener>,
    started: bool,
    attachments: BTreeMap<CircuitKey, u32>,
    /// Per-link mode: the VFC realizing this bridge.
    vfc: Option<String>,
    seq: u64,
}

#[derive(Default)]
struct FabricState {
    bridges: HashMap<Arc<BridgeKey>, BridgeEntity>,
    circuits: HashMap<CircuitKey, Arc<BridgeKey>>,
    /// Shared mode: OF ports in use on the shared VFC.
    ofports: BTreeSet<u32>,
    shared_vfc: Option<String>,
    next_seq: u64,
}

type Queued = Vec<(BridgeListener, BridgeEvent)>;

fn deliver(queued: Queued) {
    for (tx, event) in queued {
        // a gone listener is not our problem
        let _ = tx.send(event);
    }
}

fn notify(entity: &BridgeEntity, event: BridgeEvent, queued: &mut Queued) {
    for tx in &entity.listeners {
        queued.push((tx.clone(), event.clone()));
    }
}

/// The Corsa fabric manager.
///
/// REST calls are made while holding the fabric lock, so switch mutations
/// are serialized; listener events are queued under the lock and sent after
/// it is released.
pub struct CorsaFabric {
    rest: Arc<dyn SwitchRest>,
    ctrl: Option<Arc<dyn CtrlRest>>,
    cfg: FabricConfig,
    state: Mutex<FabricState>,
}

impl CorsaFabric {
    pub fn new(
        rest: Arc<dyn SwitchRest>,
        ctrl: Option<Arc<dyn CtrlRest>>,
        cfg: FabricConfig,
    ) -> CorsaFabric {
        CorsaFabric {
            rest,
            ctrl,
            cfg,
            state: Mutex::new(FabricState::default()),
        }
    }

    pub fn config(&self) -> &FabricConfig {
        &self.cfg
    }

    /// References to every bridge currently known, recovered ones included.
    pub async fn bridges(&self) -> Vec<BridgeRef> {
        let st = self.state.lock().await;
        st.bridges
            .keys()
            .map(|key| BridgeRef { key: key.clone() })
            .collect()
    }

    /// Rebuild in-memory state from the switch. Invoked once at startup.
    ///
    /// Partially configured bridges from a previous run are destroyed;
    /// complete ones are adopted as already started. In shared mode the
    /// current port sets are re-issued to the (stateless) controller.
    pub async fn recover(&self) -> Result<(), Fault> {
        let mut st = self.state.lock().await;
        match self.cfg.mode {
            Realization::PerLink => self.recover_per_link(&mut st).await,
            Realization::Shared => self.recover_shared(&mut st).await,
        }
    }

    async fn recover_per_link(&self, st: &mut FabricState) -> Result<(), Fault> {
        let names = self.rest.bridge_names().await?;
        for name in names {
            let desc = self.rest.bridge_desc(&name).await?;
            let suffix = match desc.descr.strip_prefix(&self.cfg.descr_prefix) {
                Some(suffix) => suffix,
                None => continue,
            };
            if suffix == self.cfg.complete_suffix {
                self.adopt_vfc(st, &name).await?;
            } else if suffix == self.cfg.partial_suffix {
                info!(bridge = %name, "destroying partially configured bridge");
                self.rest.destroy_bridge(&name).await?;
            } else if self.cfg.destroy_unrecognized {
                info!(bridge = %name, descr = %desc.descr, "destroying unrecognized bridge");
                self.rest.destroy_bridge(&name).await?;
            } else {
                warn!(bridge = %name, descr = %desc.descr, "leaving unrecognized bridge alone");
            }
        }
        Ok(())
    }

    async fn adopt_vfc(&self, st: &mut FabricState, name: &str) -> Result<(), Fault> {
        let tunnels = self.rest.tunnels(name).await?;
        let mut flows = CanonicalFlows::new();
        let mut attachments = BTreeMap::new();
        for (ofport, tunnel) in tunnels {
            match CircuitKey::from_tunnel(&tunnel.port, tunnel.vlan_id, tunnel.inner_vlan_id) {
                Ok(circuit) if !st.circuits.contains_key(&circuit) => {
                    flows.insert(
                        circuit,
                        TrafficFlow {
                            ingress: 0.0,
                            egress: tunnel.shaped_rate.unwrap_or(0.0),
                        },
                    );
                    attachments.insert(circuit, ofport);
                }
                _ => {
                    warn!(bridge = %name, ofport, "removing tunnel with no usable circuit");
                    self.rest.detach_tunnel(name, ofport).await?;
                }
            }
        }
        if attachments.is_empty() {
            info!(bridge = %name, "destroying adopted bridge with no tunnels");
            return self.rest.destroy_bridge(name).await;
        }
        let key = Arc::new(BridgeKey(attachments.keys().copied().collect()));
        for circuit in key.circuits() {
            st.circuits.insert(*circuit, key.clone());
        }
        let seq = st.next_seq;
        st.next_seq += 1;
        info!(bridge = %name, circuits = %key, "adopted bridge");
        st.bridges.insert(
            key,
            BridgeEntity {
                flows,
                listeners: Vec::new(),
                started: true,
                attachments,
                vfc: Some(name.to_owned()),
                seq,
            },
        );
        Ok(())
    }

    async fn recover_shared(&self, st: &mut FabricState) -> Result<(), Fault> {
        let names = self.rest.bridge_names().await?;
        let mut shared = None;
        for name in names {
            let desc = self.rest.bridge_desc(&name).await?;
            let suffix = match desc.descr.strip_prefix(&self.cfg.descr_prefix) {
                Some(suffix) => suffix,
                None => continue,
            };
            if suffix == self.cfg.complete_suffix && shared.is_none() {
                shared = Some(name);
            } else if suffix == self.cfg.partial_suffix {
                info!(bridge = %name, "destroying partially configured bridge");
                self.rest.destroy_bridge(&name).await?;
            } else if self.cfg.destroy_unrecognized {
                info!(bridge = %name, descr = %desc.descr, "destroying unrecognized bridge");
                self.rest.destroy_bridge(&name).await?;
            } else {
                warn!(bridge = %name, descr = %desc.descr, "leaving unrecognized bridge alone");
            }
        }

        let vfc = match shared {
            Some(name) => name,
            None => self.provision_shared_vfc().await?,
        };

        // re-group the surviving tunnels into bridges by their stamp
        let tunnels = self.rest.tunnels(&vfc).await?;
        let mut groups: BTreeMap<u64, (CanonicalFlows, BTreeMap<CircuitKey, u32>)> =
            BTreeMap::new();
        let mut seen = HashSet::new();
        for (ofport, tunnel) in tunnels {
            let stamp = tunnel.descr.as_deref().and_then(|d| self.cfg.parse_stamp(d));
            let circuit =
                CircuitKey::from_tunnel(&tunnel.port, tunnel.vlan_id, tunnel.inner_vlan_id);
            match (stamp, circuit) {
                (Some(seq), Ok(circuit)) if seen.insert(circuit) => {
                    let (flows, attachments) = groups.entry(seq).or_default();
                    flows.insert(
                        circuit,
                        TrafficFlow {
                            ingress: 0.0,
                            egress: tunnel.shaped_rate.unwrap_or(0.0),
                        },
                    );
                    attachments.insert(circuit, ofport);
                    st.ofports.insert(ofport);
                }
                _ => {
                    warn!(ofport, "removing tunnel with no usable stamp or circuit");
                    self.rest.detach_tunnel(&vfc, ofport).await?;
                }
            }
        }

        let mut slices = Vec::new();
        for (seq, (flows, attachments)) in groups {
            let key = Arc::new(BridgeKey(attachments.keys().copied().collect()));
            for circuit in key.circuits() {
                st.circuits.insert(*circuit, key.clone());
            }
            slices.push(attachments.values().copied().collect::<BTreeSet<u32>>());
            info!(seq, circuits = %key, "adopted bridge on shared VFC");
            st.next_seq = st.next_seq.max(seq + 1);
            st.bridges.insert(
                key,
                BridgeEntity {
                    flows,
                    listeners: Vec::new(),
                    started: true,
                    attachments,
                    vfc: None,
                    seq,
                },
            );
        }

        if let Some(ctrl) = &self.ctrl {
            if !slices.is_empty() {
                ctrl.define_port_sets(self.cfg.dpid, &slices).await?;
            }
        }

        st.shared_vfc = Some(vfc);
        Ok(())
    }

    async fn provision_shared_vfc(&self) -> Result<String, Fault> {
        let name = self
            .rest
            .create_bridge(&BridgeCreate {
                descr: self.cfg.partial_descr(),
                subtype: self.cfg.subtype.clone(),
                resources: self.cfg.resources,
                netns: self.cfg.netns.clone(),
            })
            .await?;
        let finish = async {
            if let Some(target) = &self.cfg.controller {
                self.rest.attach_controller(&name, target).await?;
            }
            self.rest
                .patch_bridge_descr(&name, &self.cfg.complete_descr())
                .await
        };
        if let Err(fault) = finish.await {
            let _ = self.rest.destroy_bridge(&name).await;
            return Err(fault);
        }
        info!(bridge = %name, "provisioned shared VFC");
        Ok(name)
    }

    fn alloc_ofport(used: &BTreeSet<u32>) -> u32 {
        (1..).find(|p| !used.contains(p)).expect("port space")
    }

    /// The creation path of one bridge. Returns the realized attachments;
    /// on failure, attachments already in place are reported back so a later
    /// `retain` can clean them up.
    async fn start_shared(
        &self,
        st: &mut FabricState,
        flows: &CanonicalFlows,
        seq: u64,
        attachments: &mut BTreeMap<CircuitKey, u32>,
    ) -> Result<(), Fault> {
        let vfc = st
            .shared_vfc
            .clone()
            .ok_or_else(|| Fault::network_mgmt("shared VFC not provisioned"))?;
        for (circuit, flow) in flows {
            let (port, vlan, inner) = circuit.tunnel();
            let ofport = Self::alloc_ofport(&st.ofports);
            let tunnel = TunnelDesc {
                ofport,
                port,
                vlan_id: vlan,
                inner_vlan_id: inner,
                shaped_rate: self.cfg.shaping.then_some(flow.egress),
                descr: Some(self.cfg.stamp(seq)),
            };
            let ofport = self.rest.attach_tunnel(&vfc, &tunnel).await?;
            st.ofports.insert(ofport);
            attachments.insert(*circuit, ofport);
            if self.cfg.metering {
                self.rest
                    .patch_tunnel_meter(
                        &vfc,
                        ofport,
                        (flow.ingress * 1000.0) as u64,
                        self.cfg.cbs_bytes,
                    )
                    .await?;
            }
        }
        if let Some(ctrl) = &self.ctrl {
            let ports: BTreeSet<u32> = attachments.values().copied().collect();
            ctrl.define_port_sets(self.cfg.dpid, &[ports]).await?;
        }
        Ok(())
    }

    /// The per-link creation path: its own VFC, torn down whole on failure.
    async fn start_per_link(
        &self,
        flows: &CanonicalFlows,
        attachments: &mut BTreeMap<CircuitKey, u32>,
    ) -> Result<String, Fault> {
        let name = self
            .rest
            .create_bridge(&BridgeCreate {
                descr: self.cfg.partial_descr(),
                subtype: self.cfg.subtype.clone(),
                resources: self.cfg.resources,
                netns: self.cfg.netns.clone(),
            })
            .await?;

        let configure = async {
            let mut next = 1;
            for (circuit, flow) in flows {
                let (port, vlan, inner) = circuit.tunnel();
                let tunnel = TunnelDesc {
                    ofport: next,
                    port,
                    vlan_id: vlan,
                    inner_vlan_id: inner,
                    shaped_rate: self.cfg.shaping.then_some(flow.egress),
                    descr: None,
                };
                let ofport = self.rest.attach_tunnel(&name, &tunnel).await?;
                attachments.insert(*circuit, ofport);
                if self.cfg.metering {
                    self.rest
                        .patch_tunnel_meter(
                            &name,
                            ofport,
                            (flow.ingress * 1000.0) as u64,
                            self.cfg.cbs_bytes,
                        )
                        .await?;
                }
                next += 1;
            }
            if let Some(target) = &self.cfg.controller {
                self.rest.attach_controller(&name, target).await?;
            }
            self.rest
                .patch_bridge_descr(&name, &self.cfg.complete_descr())
                .await
        };

        match configure.await {
            Ok(()) => Ok(name),
            Err(fault) => {
                // anything before "complete" is destroyed whole
                attachments.clear();
                let _ = self.rest.destroy_bridge(&name).await;
                Err(fault)
            }
        }
    }

    /// Tear a bridge's hardware realization down. On error the entity keeps
    /// whatever is still attached, so a later pass can finish the job.
    async fn teardown(&self, st: &mut FabricState, entity: &mut BridgeEntity) -> Result<(), Fault> {
        match self.cfg.mode {
            Realization::PerLink => {
                if let Some(vfc) = entity.vfc.clone() {
                    self.rest.destroy_bridge(&vfc).await?;
                    entity.vfc = None;
                }
                entity.attachments.clear();
                entity.started = false;
                Ok(())
            }
            Realization::Shared => {
                if entity.attachments.is_empty() {
                    entity.started = false;
                    return Ok(());
                }
                let vfc = st
                    .shared_vfc
                    .clone()
                    .ok_or_else(|| Fault::network_mgmt("shared VFC not provisioned"))?;
                if let Some(ctrl) = &self.ctrl {
                    // dissolve the set so the controller stops bridging the
                    // ports before they disappear
                    let singles: Vec<BTreeSet<u32>> = entity
                        .attachments
                        .values()
                        .map(|&p| BTreeSet::from([p]))
                        .collect();
                    ctrl.define_port_sets(self.cfg.dpid, &singles).await?;
                }
                while let Some((&circuit, &ofport)) = entity.attachments.iter().next() {
                    self.rest.detach_tunnel(&vfc, ofport).await?;
                    entity.attachments.remove(&circuit);
                    st.ofports.remove(&ofport);
                }
                entity.started = false;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Fabric for CorsaFabric {
    async fn bridge(
        &self,
        listener: BridgeListener,
        flows: &CanonicalFlows,
    ) -> Result<BridgeRef, Fault> {
        let mut queued = Queued::new();
        let result = {
            let mut st = self.state.lock().await;
            let key = Arc::new(BridgeKey::from_flows(flows));
            if let Some(entity) = st.bridges.get_mut(&key) {
                if entity.flows != *flows {
                    Err(Fault::circuit_logic(format!(
                        "bridge {} exists with different flows",
                        key
                    )))
                } else {
                    entity.listeners.push(listener.clone());
                    queued.push((listener, BridgeEvent::Created));
                    Ok(BridgeRef { key: key.clone() })
                }
            } else if st.bridges.len() >= self.cfg.max_bridges {
                Err(Fault::network_resource("no bridge capacity left"))
            } else if let Some(conflict) = flows.keys().find(|c| st.circuits.contains_key(c)) {
                Err(Fault::circuit_logic(format!(
                    "circuit {} already belongs to another bridge",
                    conflict
                )))
            } else {
                for circuit in key.circuits() {
                    st.circuits.insert(*circuit, key.clone());
                }
                let seq = st.next_seq;
                st.next_seq += 1;
                debug!(circuits = %key, seq, "bridge reserved");
                st.bridges.insert(
                    key.clone(),
                    BridgeEntity {
                        flows: flows.clone(),
                        listeners: vec![listener.clone()],
                        started: false,
                        attachments: BTreeMap::new(),
                        vfc: None,
                        seq,
                    },
                );
                queued.push((listener, BridgeEvent::Created));
                Ok(BridgeRef { key })
            }
        };
        deliver(queued);
        result
    }

    async fn retain(&self, keep: &HashSet<BridgeRef>) {
        let mut queued = Queued::new();
        {
            let mut st = self.state.lock().await;
            let kept: HashSet<BridgeKey> = keep.iter().map(|r| r.key().clone()).collect();
            let doomed: Vec<Arc<BridgeKey>> = st
                .bridges
                .keys()
                .filter(|key| !kept.contains(&***key))
                .cloned()
                .collect();
            for key in doomed {
                let mut entity = st.bridges.remove(&key).expect("doomed bridge present");
                match self.teardown(&mut st, &mut entity).await {
                    Ok(()) => {
                        for circuit in key.circuits() {
                            st.circuits.remove(circuit);
                        }
                        info!(circuits = %key, "bridge retained out");
                        notify(&entity, BridgeEvent::Destroyed, &mut queued);
                    }
                    Err(fault) => {
                        warn!(circuits = %key, fault = %fault, "teardown failed; keeping bridge");
                        notify(&entity, BridgeEvent::Error(fault), &mut queued);
                        st.bridges.insert(key, entity);
                    }
                }
            }
        }
        deliver(queued);
    }

    async fn start(&self, bridge: &BridgeRef) {
        let mut queued = Queued::new();
        {
            let mut st = self.state.lock().await;
            let Some(entity) = st.bridges.get(&bridge.key) else {
                warn!(circuits = %bridge.key, "start of unknown bridge ignored");
                return;
            };
            if entity.started {
                notify(entity, BridgeEvent::Created, &mut queued);
            } else {
                let flows = entity.flows.clone();
                let seq = entity.seq;
                let mut attachments = BTreeMap::new();
                let outcome = match self.cfg.mode {
                    Realization::Shared => self
                        .start_shared(&mut st, &flows, seq, &mut attachments)
                        .await
                        .map(|()| None),
                    Realization::PerLink => self
                        .start_per_link(&flows, &mut attachments)
                        .await
                        .map(Some),
                };
                let entity = st.bridges.get_mut(&bridge.key).expect("bridge present");
                entity.attachments = attachments;
                match outcome {
                    Ok(vfc) => {
                        entity.vfc = vfc;
                        entity.started = true;
                        info!(circuits = %bridge.key, "bridge started");
                        notify(entity, BridgeEvent::Created, &mut queued);
                    }
                    Err(fault) => {
                        warn!(circuits = %bridge.key, fault = %fault, "bridge start failed");
                        notify(entity, BridgeEvent::Error(fault), &mut queued);
                    }
                }
            }
        }
        deliver(queued);
    }

    async fn stop(&self, bridge: &BridgeRef) {
        let mut queued = Queued::new();
        {
            let mut st = self.state.lock().await;
            let Some(mut entity) = st.bridges.remove(&bridge.key) else {
                warn!(circuits = %bridge.key, "stop of unknown bridge ignored");
                return;
            };
            match self.teardown(&mut st, &mut entity).await {
                Ok(()) => {
                    info!(circuits = %bridge.key, "bridge stopped");
                    notify(&entity, BridgeEvent::Destroyed, &mut queued);
                }
                Err(fault) => {
                    warn!(circuits = %bridge.key, fault = %fault, "bridge stop failed");
                    notify(&entity, BridgeEvent::Error(fault), &mut queued);
                }
            }
            // the reservation survives a stop
            st.bridges.insert(bridge.key.clone(), entity);
        }
        deliver(queued);
    }

    async fn capacity(&self) -> usize {
        let st = self.state.lock().await;
        self.cfg.max_bridges.saturating_sub(st.bridges.len())
    }

    fn interface(&self, desc: &str) -> Result<Interface, Fault> {
        Interface::parse(desc, self.cfg.caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::PortRef;

    fn circuit(port: u32, tag: u16) -> CircuitKey {
        CircuitKey::Single {
            port: PortRef { lag: false, index: port },
            tag,
        }
    }

    #[test]
    fn bridge_key_is_order_insensitive() {
        let mut a = CanonicalFlows::new();
        a.insert(circuit(3, 100), TrafficFlow::default());
        a.insert(circuit(4, 200), TrafficFlow::default());
        let mut b = CanonicalFlows::new();
        b.insert(circuit(4, 200), TrafficFlow::default());
        b.insert(circuit(3, 100), TrafficFlow::default());
        assert_eq!(BridgeKey::from_flows(&a), BridgeKey::from_flows(&b));
    }

    #[test]
    fn ofport_allocation_reuses_the_lowest_gap() {
        let mut used = BTreeSet::from([1, 2, 4]);
        assert_eq!(CorsaFabric::alloc_ofport(&used), 3);
        used.insert(3);
        assert_eq!(CorsaFabric::alloc_ofport(&used), 5);
        used.remove(&1);
        assert_eq!(CorsaFabric::alloc_ofport(&used), 1);
    }

    #[test]
    fn stamps_round_trip() {
        let cfg = FabricConfig::default();
        assert_eq!(cfg.parse_stamp(&cfg.stamp(17)), Some(17));
        assert_eq!(cfg.parse_stamp(&cfg.complete_descr()), None);
        assert_eq!(cfg.parse_stamp("somebody-else:7"), None);
    }
}
