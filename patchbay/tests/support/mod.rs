#![allow(dead_code)]

//! Shared plumbing for the integration tests: an in-memory transport that
//! speaks the real wire protocol against `handle_connection`, and a mock
//! switch/controller pair for driving the Corsa fabric without hardware.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use patchbay::codec::{BoxRead, BoxWrite, FramedRead, FramedWrite};
use patchbay::fabric::ctrl::CtrlRest;
use patchbay::fabric::rest::{BridgeCreate, BridgeDesc, ControllerTarget, SwitchRest, TunnelDesc};
use patchbay::fabric::testing::TestFabric;
use patchbay::fault::Fault;
use patchbay::mux::{Multiplexer, Session};
use patchbay::network::{Broker, Network, NetworkKind};

// ===== wire-level client =====

/// A broker with one switch network `netA` carrying terminals `t1`/`t2`.
pub async fn broker_with_network() -> Arc<Broker> {
    let fabric = Arc::new(TestFabric::new());
    let net = Network::new("netA", NetworkKind::Switch, fabric);
    net.add_terminal("t1", "phys.3", None, None, None).await.unwrap();
    net.add_terminal("t2", "phys.4", None, None, None).await.unwrap();
    Arc::new(Broker::new(vec![Arc::new(net)]))
}

/// Open a connection, send the raw handshake, and return the framed halves
/// with the select response still unread.
pub async fn open(broker: Arc<Broker>, handshake: &str) -> (FramedRead<BoxRead>, FramedWrite<BoxWrite>) {
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    tokio::spawn(async move {
        let _ = patchbay::server::handle_connection(server_io, broker).await;
    });
    let (read, mut write) = tokio::io::split(client_io);
    write.write_all(handshake.as_bytes()).await.unwrap();
    (
        FramedRead::new(Box::new(read) as BoxRead),
        FramedWrite::new(Box::new(write) as BoxWrite),
    )
}

/// Handshake, read the select response, and wrap the rest in a client mux.
pub async fn connect(broker: Arc<Broker>, handshake: &str) -> (Value, Multiplexer) {
    let (mut read, write) = open(broker, handshake).await;
    let select = read.read().await.unwrap().expect("select response");
    (select, Multiplexer::client(read, write))
}

/// One request, one response.
pub async fn call(session: &mut Session, request: Value) -> Value {
    session.write(request).await.unwrap();
    session.read().await.expect("response")
}

// ===== mock switch =====

#[derive(Clone, Debug, Default)]
pub struct MockBridge {
    pub descr: String,
    pub tunnels: BTreeMap<u32, TunnelDesc>,
    pub controllers: Vec<ControllerTarget>,
}

#[derive(Default)]
pub struct MockState {
    pub bridges: BTreeMap<String, MockBridge>,
    next_bridge: u32,
    /// Mutating calls since the last [`MockSwitch::reset_writes`].
    pub writes: usize,
    /// When set, that many further attaches succeed; the next one fails.
    pub attaches_before_failure: Option<usize>,
}

/// An in-memory switch honoring the REST contract.
#[derive(Default)]
pub struct MockSwitch {
    pub state: Mutex<MockState>,
}

impl MockSwitch {
    pub fn new() -> Arc<MockSwitch> {
        Arc::new(MockSwitch::default())
    }

    pub fn seed_bridge(&self, name: &str, descr: &str, tunnels: Vec<TunnelDesc>) {
        let mut st = self.state.lock().unwrap();
        st.bridges.insert(
            name.to_owned(),
            MockBridge {
                descr: descr.to_owned(),
                tunnels: tunnels.into_iter().map(|t| (t.ofport, t)).collect(),
                controllers: Vec::new(),
            },
        );
    }

    pub fn fail_next_attach_after(&self, successes: usize) {
        self.state.lock().unwrap().attaches_before_failure = Some(successes);
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn reset_writes(&self) {
        self.state.lock().unwrap().writes = 0;
    }

    pub fn bridge_names(&self) -> Vec<String> {
        self.state.lock().unwrap().bridges.keys().cloned().collect()
    }

    pub fn tunnel_count(&self, bridge: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .bridges
            .get(bridge)
            .map(|b| b.tunnels.len())
            .unwrap_or(0)
    }
}

fn missing(bridge: &str) -> Fault {
    Fault::network_mgmt(format!("switch returned 404 Not Found for bridge {}", bridge))
}

#[async_trait]
impl SwitchRest for MockSwitch {
    async fn create_bridge(&self, req: &BridgeCreate) -> Result<String, Fault> {
        let mut st = self.state.lock().unwrap();
        st.writes += 1;
        st.next_bridge += 1;
        let name = format!("br{}", st.next_bridge);
        st.bridges.insert(
            name.clone(),
            MockBridge {
                descr: req.descr.clone(),
                tunnels: BTreeMap::new(),
                controllers: Vec::new(),
            },
        );
        Ok(name)
    }

    async fn destroy_bridge(&self, bridge: &str) -> Result<(), Fault> {
        let mut st = self.state.lock().unwrap();
        st.writes += 1;
        st.bridges.remove(bridge);
        Ok(())
    }

    async fn patch_bridge_descr(&self, bridge: &str, descr: &str) -> Result<(), Fault> {
        let mut st = self.state.lock().unwrap();
        st.writes += 1;
        st.bridges
            .get_mut(bridge)
            .ok_or_else(|| missing(bridge))?
            .descr = descr.to_owned();
        Ok(())
    }

    async fn attach_controller(
        &self,
        bridge: &str,
        target: &ControllerTarget,
    ) -> Result<(), Fault> {
        let mut st = self.state.lock().unwrap();
        st.writes += 1;
        st.bridges
            .get_mut(bridge)
            .ok_or_else(|| missing(bridge))?
            .controllers
            .push(target.clone());
        Ok(())
    }

    async fn attach_tunnel(&self, bridge: &str, tunnel: &TunnelDesc) -> Result<u32, Fault> {
        let mut st = self.state.lock().unwrap();
        match &mut st.attaches_before_failure {
            Some(0) => {
                return Err(Fault::network_mgmt(
                    "switch returned 500 Internal Server Error for attach tunnel",
                ))
            }
            Some(n) => *n -= 1,
            None => {}
        }
        st.writes += 1;
        let entry = st.bridges.get_mut(bridge).ok_or_else(|| missing(bridge))?;
        if entry.tunnels.contains_key(&tunnel.ofport) {
            return Err(Fault::network_mgmt(format!(
                "switch returned 409 Conflict for ofport {}",
                tunnel.ofport
            )));
        }
        entry.tunnels.insert(tunnel.ofport, tunnel.clone());
        Ok(tunnel.ofport)
    }

    async fn patch_tunnel_meter(
        &self,
        bridge: &str,
        ofport: u32,
        _cir_kbps: u64,
        _cbs_bytes: u64,
    ) -> Result<(), Fault> {
        let mut st = self.state.lock().unwrap();
        st.writes += 1;
        let entry = st.bridges.get_mut(bridge).ok_or_else(|| missing(bridge))?;
        if !entry.tunnels.contains_key(&ofport) {
            return Err(missing(bridge));
        }
        Ok(())
    }

    async fn detach_tunnel(&self, bridge: &str, ofport: u32) -> Result<(), Fault> {
        let mut st = self.state.lock().unwrap();
        st.writes += 1;
        if let Some(entry) = st.bridges.get_mut(bridge) {
            entry.tunnels.remove(&ofport);
        }
        Ok(())
    }

    async fn tunnels(&self, bridge: &str) -> Result<BTreeMap<u32, TunnelDesc>, Fault> {
        let st = self.state.lock().unwrap();
        st.bridges
            .get(bridge)
            .map(|b| b.tunnels.clone())
            .ok_or_else(|| missing(bridge))
    }

    async fn bridge_names(&self) -> Result<Vec<String>, Fault> {
        Ok(self.bridge_names())
    }

    async fn bridge_desc(&self, bridge: &str) -> Result<BridgeDesc, Fault> {
        let st = self.state.lock().unwrap();
        st.bridges
            .get(bridge)
            .map(|b| BridgeDesc {
                name: bridge.to_owned(),
                descr: b.descr.clone(),
                subtype: None,
                resources: None,
            })
            .ok_or_else(|| missing(bridge))
    }
}

/// An in-memory port-set controller.
#[derive(Default)]
pub struct MockCtrl {
    pub sets: Mutex<Vec<BTreeSet<u32>>>,
    pub writes: AtomicUsize,
}

impl MockCtrl {
    pub fn new() -> Arc<MockCtrl> {
        Arc::new(MockCtrl::default())
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Non-singleton sets, i.e. the ones actually bridging traffic.
    pub fn live_sets(&self) -> Vec<BTreeSet<u32>> {
        self.sets
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.len() > 1)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CtrlRest for MockCtrl {
    async fn define_port_sets(
        &self,
        _dpid: u64,
        slices: &[BTreeSet<u32>],
    ) -> Result<Vec<BTreeSet<u32>>, Fault> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut sets = self.sets.lock().unwrap();
        let listed: BTreeSet<u32> = slices.iter().flatten().copied().collect();
        sets.retain(|set| set.is_disjoint(&listed));
        sets.extend(slices.iter().cloned());
        Ok(sets.clone())
    }

    async fn port_sets(&self, _dpid: u64) -> Result<Vec<BTreeSet<u32>>, Fault> {
        Ok(self.sets.lock().unwrap().clone())
    }
}

/// A tunnel description shorthand for seeding the mock.
pub fn tunnel(ofport: u32, port: &str, vlan: Option<u16>, descr: Option<&str>) -> TunnelDesc {
    TunnelDesc {
        ofport,
        port: port.to_owned(),
        vlan_id: vlan,
        inner_vlan_id: None,
        shaped_rate: None,
        descr: descr.map(str::to_owned),
    }
}
