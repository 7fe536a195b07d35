//! An in-memory [`Fabric`] for tests.
//!
//! Honors the contract (circuit exclusivity, reservation sharing, queued
//! listener events) without a switch behind it. Failure injection drives
//! the error paths of the state machine.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::fabric::{BridgeEvent, BridgeKey, BridgeListener, BridgeRef, Fabric};
use crate::fault::Fault;
use crate::iface::{Interface, PortCaps};
use crate::model::CanonicalFlows;

struct TestBridge {
    listeners: Vec<BridgeListener>,
    started: bool,
}

#[derive(Default)]
struct TestState {
    bridges: HashMap<BridgeKey, TestBridge>,
    fail_start: bool,
    fail_bridge: bool,
}

/// A fabric that keeps every bridge in memory.
#[derive(Default)]
pub struct TestFabric {
    state: Mutex<TestState>,
    max_bridges: usize,
}

impl TestFabric {
    pub fn new() -> TestFabric {
        TestFabric {
            state: Mutex::new(TestState::default()),
            max_bridges: 63,
        }
    }

    /// Make subsequent `start` calls report an error.
    pub fn fail_start(&self, fail: bool) {
        self.state.lock().unwrap().fail_start = fail;
    }

    /// Make subsequent `bridge` calls refuse outright.
    pub fn fail_bridge(&self, fail: bool) {
        self.state.lock().unwrap().fail_bridge = fail;
    }

    pub fn bridge_count(&self) -> usize {
        self.state.lock().unwrap().bridges.len()
    }

    pub fn started_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .bridges
            .values()
            .filter(|b| b.started)
            .count()
    }
}

#[async_trait]
impl Fabric for TestFabric {
    async fn bridge(
        &self,
        listener: BridgeListener,
        flows: &CanonicalFlows,
    ) -> Result<BridgeRef, Fault> {
        let mut st = self.state.lock().unwrap();
        if st.fail_bridge {
            return Err(Fault::network_resource("no bridge capacity left"));
        }
        let key = BridgeKey::from_flows(flows);
        if let Some(bridge) = st.bridges.get_mut(&key) {
            bridge.listeners.push(listener.clone());
        } else {
            if st.bridges.len() >= self.max_bridges {
                return Err(Fault::network_resource("no bridge capacity left"));
            }
            if let Some(conflict) = flows.keys().find(|c| {
                st.bridges
                    .keys()
                    .any(|k| k.circuits().any(|held| held == *c))
            }) {
                return Err(Fault::circuit_logic(format!(
                    "circuit {} already belongs to another bridge",
                    conflict
                )));
            }
            st.bridges.insert(
                key.clone(),
                TestBridge {
                    listeners: vec![listener.clone()],
                    started: false,
                },
            );
        }
        let _ = listener.send(BridgeEvent::Created);
        Ok(BridgeRef::new(key))
    }

    async fn retain(&self, keep: &HashSet<BridgeRef>) {
        let mut st = self.state.lock().unwrap();
        let kept: HashSet<&BridgeKey> = keep.iter().map(BridgeRef::key).collect();
        let doomed: Vec<BridgeKey> = st
            .bridges
            .keys()
            .filter(|k| !kept.contains(k))
            .cloned()
            .collect();
        for key in doomed {
            let bridge = st.bridges.remove(&key).unwrap();
            for tx in bridge.listeners {
                let _ = tx.send(BridgeEvent::Destroyed);
            }
        }
    }

    async fn start(&self, bridge: &BridgeRef) {
        let mut st = self.state.lock().unwrap();
        let fail = st.fail_start;
        if let Some(entry) = st.bridges.get_mut(bridge.key()) {
            let event = if fail {
                BridgeEvent::Error(Fault::network_mgmt("switch returned 500 for attach tunnel"))
            } else {
                entry.started = true;
                BridgeEvent::Created
            };
            for tx in &entry.listeners {
                let _ = tx.send(event.clone());
            }
        }
    }

    async fn stop(&self, bridge: &BridgeRef) {
        let mut st = self.state.lock().unwrap();
        if let Some(entry) = st.bridges.get_mut(bridge.key()) {
            entry.started = false;
            for tx in &entry.listeners {
                let _ = tx.send(BridgeEvent::Destroyed);
            }
        }
    }

    async fn capacity(&self) -> usize {
        let st = self.state.lock().unwrap();
        self.max_bridges.saturating_sub(st.bridges.len())
    }

    fn interface(&self, desc: &str) -> Result<Interface, Fault> {
        Interface::parse(desc, PortCaps::default())
    }
}
