//! The per-service state machine.
//!
//! A service is created DORMANT, acquires a segment through `define`, and is
//! then driven between INACTIVE and ACTIVE by `activate`/`deactivate` until
//! `release` retires it. Transient states (ESTABLISHING, ACTIVATING,
//! DEACTIVATING, RELEASING) complete on events from the fabric. RELEASED is
//! terminal; FAILED is terminal except for `release`.
//!
//! All operations on one service are serialized by its lock. Listener
//! notifications are enqueued in transition order while the lock is held and
//! consumed outside it, before the new status becomes visible to
//! [`Service::await_status`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::fabric::{BridgeEvent, BridgeRef, Fabric};
use crate::fault::{Fault, FaultKind};
use crate::model::{CanonicalFlows, Segment};

/// Where a service is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceStatus {
    Dormant,
    Establishing,
    Inactive,
    Activating,
    Active,
    Deactivating,
    Releasing,
    Released,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Dormant => "DORMANT",
            ServiceStatus::Establishing => "ESTABLISHING",
            ServiceStatus::Inactive => "INACTIVE",
            ServiceStatus::Activating => "ACTIVATING",
            ServiceStatus::Active => "ACTIVE",
            ServiceStatus::Deactivating => "DEACTIVATING",
            ServiceStatus::Releasing => "RELEASING",
            ServiceStatus::Released => "RELEASED",
            ServiceStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(name: &str) -> Option<ServiceStatus> {
        Some(match name {
            "DORMANT" => ServiceStatus::Dormant,
            "ESTABLISHING" => ServiceStatus::Establishing,
            "INACTIVE" => ServiceStatus::Inactive,
            "ACTIVATING" => ServiceStatus::Activating,
            "ACTIVE" => ServiceStatus::Active,
            "DEACTIVATING" => ServiceStatus::Deactivating,
            "RELEASING" => ServiceStatus::Releasing,
            "RELEASED" => ServiceStatus::Released,
            "FAILED" => ServiceStatus::Failed,
            _ => return None,
        })
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time view of a service, for `dump-status` and listings.
#[derive(Clone, Debug)]
pub struct ServiceSnapshot {
    pub id: u32,
    pub handle: Option<String>,
    pub status: ServiceStatus,
    pub circuits: usize,
    pub errors: Vec<FaultKind>,
}

struct State {
    status: ServiceStatus,
    status_tx: watch::Sender<ServiceStatus>,
    token: Option<String>,
    segment: Option<Segment>,
    bridge: Option<BridgeRef>,
    listeners: Vec<mpsc::UnboundedSender<ServiceStatus>>,
    errors: Vec<Fault>,
    fabric_events: Option<mpsc::UnboundedSender<BridgeEvent>>,
}

struct Shared {
    id: u32,
    network: String,
    handle: Option<String>,
    fabric: Arc<dyn Fabric>,
    state: Mutex<State>,
    status_rx: watch::Receiver<ServiceStatus>,
}

/// A handle on one brokered service.
#[derive(Clone)]
pub struct Service {
    shared: Arc<Shared>,
}

impl Service {
    pub(crate) fn new(
        id: u32,
        network: &str,
        fabric: Arc<dyn Fabric>,
        handle: Option<String>,
        token: Option<String>,
    ) -> Service {
        let (status_tx, status_rx) = watch::channel(ServiceStatus::Dormant);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id,
            network: network.to_owned(),
            handle,
            fabric,
            status_rx,
            state: Mutex::new(State {
                status: ServiceStatus::Dormant,
                status_tx,
                token,
                segment: None,
                bridge: None,
                listeners: Vec::new(),
                errors: Vec::new(),
                fabric_events: Some(event_tx),
            }),
        });
        let service = Service { shared };

        // fabric events are pumped into the state machine in arrival order;
        // the pump ends when the service reaches RELEASED and the sender is
        // dropped
        let pump = service.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                pump.fabric_event(event).await;
            }
        });

        service
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn handle(&self) -> Option<&str> {
        self.shared.handle.as_deref()
    }

    pub fn network(&self) -> &str {
        &self.shared.network
    }

    /// Check the caller's token matcher against this service's auth token.
    ///
    /// A mismatch reads the same as a nonexistent service.
    pub async fn authorize(&self, matcher: Option<&Regex>) -> Result<(), Fault> {
        let state = self.shared.state.lock().await;
        match (&state.token, matcher) {
            (None, _) => Ok(()),
            (Some(token), Some(matcher)) if matcher.is_match(token) => Ok(()),
            _ => Err(Fault::expired_service(self.shared.id)),
        }
    }

    /// Give the service its segment. Valid only while DORMANT.
    ///
    /// `resolution` is the outcome of validating the requested segment
    /// against the network; a validation failure is accepted here so that it
    /// drives the DORMANT service to FAILED, as any define failure does.
    pub async fn define(
        &self,
        resolution: Result<(Segment, CanonicalFlows), Fault>,
    ) -> Result<(), Fault> {
        let mut state = self.shared.state.lock().await;
        match state.status {
            ServiceStatus::Dormant => {}
            ServiceStatus::Released => return Err(Fault::expired_service(self.shared.id)),
            status => {
                return Err(Fault::service_logic(format!(
                    "define while {}",
                    status
                )))
            }
        }

        let (segment, flows) = match resolution {
            Ok(parts) => parts,
            Err(fault) => {
                self.fail_locked(&mut state, fault.clone());
                return Err(fault);
            }
        };

        state.segment = Some(segment);
        self.transition(&mut state, ServiceStatus::Establishing);
        let listener = state
            .fabric_events
            .clone()
            .expect("live service has an event channel");
        match self.shared.fabric.bridge(listener, &flows).await {
            Ok(bridge) => {
                state.bridge = Some(bridge);
                Ok(())
            }
            Err(fault) => {
                self.fail_locked(&mut state, fault.clone());
                Err(fault)
            }
        }
    }

    /// Ask the fabric to realize the service. Valid in INACTIVE (and a
    /// no-op in ACTIVATING and ACTIVE).
    pub async fn activate(&self) -> Result<(), Fault> {
        let mut state = self.shared.state.lock().await;
        match state.status {
            ServiceStatus::Active | ServiceStatus::Activating => Ok(()),
            ServiceStatus::Inactive => {
                let bridge = state
                    .bridge
                    .clone()
                    .ok_or_else(|| Fault::service_logic("INACTIVE service has no bridge"))?;
                self.transition(&mut state, ServiceStatus::Activating);
                self.shared.fabric.start(&bridge).await;
                Ok(())
            }
            ServiceStatus::Released => Err(Fault::expired_service(self.shared.id)),
            status => Err(Fault::service_logic(format!("activate while {}", status))),
        }
    }

    /// Tear the realization down, keeping the definition. Valid in ACTIVE
    /// and ACTIVATING (and a no-op in INACTIVE and DEACTIVATING).
    pub async fn deactivate(&self) -> Result<(), Fault> {
        let mut state = self.shared.state.lock().await;
        match state.status {
            ServiceStatus::Inactive | ServiceStatus::Deactivating => Ok(()),
            ServiceStatus::Active | ServiceStatus::Activating => {
                let bridge = state
                    .bridge
                    .clone()
                    .ok_or_else(|| Fault::service_logic("ACTIVE service has no bridge"))?;
                self.transition(&mut state, ServiceStatus::Deactivating);
                self.shared.fabric.stop(&bridge).await;
                Ok(())
            }
            ServiceStatus::Released => Err(Fault::expired_service(self.shared.id)),
            status => Err(Fault::service_logic(format!("deactivate while {}", status))),
        }
    }

    /// Retire the service. Valid in any non-terminal state, and in FAILED.
    ///
    /// The dropped bridge reference is returned so the owner can recompute
    /// the fabric's retain set; the transition to RELEASED completes when
    /// the fabric reports the bridge gone (or immediately, if the service
    /// never held one).
    pub async fn release(&self) -> Result<Option<BridgeRef>, Fault> {
        let mut state = self.shared.state.lock().await;
        match state.status {
            ServiceStatus::Released => Err(Fault::expired_service(self.shared.id)),
            ServiceStatus::Releasing => Ok(None),
            ServiceStatus::Dormant | ServiceStatus::Failed => {
                let bridge = state.bridge.take();
                self.transition(&mut state, ServiceStatus::Released);
                self.retire_locked(&mut state);
                Ok(bridge)
            }
            _ => {
                let bridge = state.bridge.take();
                self.transition(&mut state, ServiceStatus::Releasing);
                Ok(bridge)
            }
        }
    }

    /// Drive the service to FAILED, recording the fault.
    pub async fn fail(&self, fault: Fault) {
        let mut state = self.shared.state.lock().await;
        self.fail_locked(&mut state, fault);
    }

    /// Finish a release whose bridge needed no fabric teardown (it is still
    /// held by another service sharing the same circuit set).
    pub(crate) async fn complete_release(&self) {
        let mut state = self.shared.state.lock().await;
        if state.status == ServiceStatus::Releasing {
            self.transition(&mut state, ServiceStatus::Released);
            self.retire_locked(&mut state);
        }
    }

    /// Block until the status is in `acceptable` or the timeout elapses;
    /// either way, the status current at return.
    pub async fn await_status(
        &self,
        acceptable: &HashSet<ServiceStatus>,
        timeout: Duration,
    ) -> ServiceStatus {
        let mut rx = self.shared.status_rx.clone();
        let reached = match tokio::time::timeout(timeout, rx.wait_for(|s| acceptable.contains(s))).await {
            Ok(Ok(status)) => Some(*status),
            _ => None,
        };
        match reached {
            Some(status) => status,
            // the sender lives as long as the service; a timeout just
            // reports where the service currently is
            None => *rx.borrow(),
        }
    }

    /// Subscribe to status transitions.
    ///
    /// If the current status is not DORMANT it is delivered first. Every
    /// later accepted transition is delivered exactly once, in order.
    /// Dropping the receiver removes the listener.
    pub async fn watch(&self) -> mpsc::UnboundedReceiver<ServiceStatus> {
        let mut state = self.shared.state.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        if state.status != ServiceStatus::Dormant {
            let _ = tx.send(state.status);
        }
        if state.status != ServiceStatus::Released {
            state.listeners.push(tx);
        }
        rx
    }

    pub async fn status(&self) -> ServiceStatus {
        self.shared.state.lock().await.status
    }

    pub async fn bridge_ref(&self) -> Option<BridgeRef> {
        self.shared.state.lock().await.bridge.clone()
    }

    pub async fn snapshot(&self) -> ServiceSnapshot {
        let state = self.shared.state.lock().await;
        ServiceSnapshot {
            id: self.shared.id,
            handle: self.shared.handle.clone(),
            status: state.status,
            circuits: state.segment.as_ref().map(Segment::len).unwrap_or(0),
            errors: state.errors.iter().map(Fault::kind).collect(),
        }
    }

    async fn fabric_event(&self, event: BridgeEvent) {
        let mut state = self.shared.state.lock().await;
        let status = state.status;
        match event {
            BridgeEvent::Created => match status {
                ServiceStatus::Establishing => {
                    self.transition(&mut state, ServiceStatus::Inactive)
                }
                ServiceStatus::Activating => self.transition(&mut state, ServiceStatus::Active),
                ServiceStatus::Releasing => {
                    self.transition(&mut state, ServiceStatus::Released);
                    self.retire_locked(&mut state);
                }
                // echoes from a shared bridge's other holders
                _ => {}
            },
            BridgeEvent::Destroyed => match status {
                ServiceStatus::Deactivating => {
                    self.transition(&mut state, ServiceStatus::Inactive)
                }
                ServiceStatus::Releasing => {
                    self.transition(&mut state, ServiceStatus::Released);
                    self.retire_locked(&mut state);
                }
                ServiceStatus::Released | ServiceStatus::Failed | ServiceStatus::Dormant => {}
                _ => {
                    // the bridge went away under a live service
                    warn!(service = self.shared.id, %status, "bridge withdrawn");
                    self.fail_locked(
                        &mut state,
                        Fault::circuit_logic("bridge withdrawn by the fabric"),
                    );
                }
            },
            BridgeEvent::Error(fault) => match status {
                ServiceStatus::Releasing => {
                    state.errors.push(fault);
                    self.transition(&mut state, ServiceStatus::Released);
                    self.retire_locked(&mut state);
                }
                ServiceStatus::Released => {}
                ServiceStatus::Failed => state.errors.push(fault),
                _ => self.fail_locked(&mut state, fault),
            },
        }
    }

    fn fail_locked(&self, state: &mut State, fault: Fault) {
        debug!(service = self.shared.id, fault = %fault, "service failed");
        state.errors.push(fault);
        if state.status != ServiceStatus::Failed {
            self.transition(state, ServiceStatus::Failed);
        }
    }

    fn transition(&self, state: &mut State, to: ServiceStatus) {
        debug!(service = self.shared.id, from = %state.status, to = %to, "transition");
        state.status = to;
        // listeners are enqueued before the watch value moves, so listener
        // order happens-before await_status visibility
        state.listeners.retain(|tx| tx.send(to).is_ok());
        state.status_tx.send_replace(to);
    }

    fn retire_locked(&self, state: &mut State) {
        state.listeners.clear();
        state.fabric_events = None;
        state.bridge = None;
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service").field("id", &self.shared.id).finish()
    }
}

#[cfg(test)]
static_assertions::assert_impl_all!(Service: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::testing::TestFabric;
    use crate::fault::Direction;
    use crate::iface::{CircuitKey, PortRef};
    use crate::model::TrafficFlow;

    fn flows() -> CanonicalFlows {
        let mut flows = CanonicalFlows::new();
        for (port, tag) in [(3, 100), (4, 200)] {
            flows.insert(
                CircuitKey::Single {
                    port: PortRef { lag: false, index: port },
                    tag,
                },
                TrafficFlow {
                    ingress: 10.0,
                    egress: 10.0,
                },
            );
        }
        flows
    }

    fn segment() -> Segment {
        Segment::from_endpoints(vec![
            crate::model::Endpoint {
                terminal: "t1".into(),
                label: 100,
                ingress: 10.0,
                egress: 10.0,
            },
            crate::model::Endpoint {
                terminal: "t2".into(),
                label: 200,
                ingress: 10.0,
                egress: 10.0,
            },
        ])
        .unwrap()
    }

    fn service_with(fabric: Arc<TestFabric>) -> Service {
        Service::new(1, "netA", fabric, None, None)
    }

    fn service() -> Service {
        service_with(Arc::new(TestFabric::new()))
    }

    async fn settle(service: &Service, expect: ServiceStatus) -> ServiceStatus {
        service
            .await_status(&HashSet::from([expect]), Duration::from_secs(1))
            .await
    }

    #[tokio::test]
    async fn define_reaches_inactive_through_establishing() {
        let svc = service();
        let mut watcher = svc.watch().await;

        svc.define(Ok((segment(), flows()))).await.unwrap();
        assert_eq!(settle(&svc, ServiceStatus::Inactive).await, ServiceStatus::Inactive);

        assert_eq!(watcher.recv().await, Some(ServiceStatus::Establishing));
        assert_eq!(watcher.recv().await, Some(ServiceStatus::Inactive));
    }

    #[tokio::test]
    async fn define_validation_failure_fails_the_service() {
        let svc = service();
        let err = svc
            .define(Err(Fault::segment_invalid("need >= 2 circuits")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::SegmentInvalid);
        assert_eq!(svc.status().await, ServiceStatus::Failed);
    }

    #[tokio::test]
    async fn define_twice_is_rejected_without_failing() {
        let svc = service();
        svc.define(Ok((segment(), flows()))).await.unwrap();
        settle(&svc, ServiceStatus::Inactive).await;

        let err = svc.define(Ok((segment(), flows()))).await.unwrap_err();
        assert_eq!(err.kind(), FaultKind::ServiceLogic);
        assert_eq!(svc.status().await, ServiceStatus::Inactive);
    }

    #[tokio::test]
    async fn activation_round_trip() {
        let svc = service();
        svc.define(Ok((segment(), flows()))).await.unwrap();
        settle(&svc, ServiceStatus::Inactive).await;

        svc.activate().await.unwrap();
        assert_eq!(settle(&svc, ServiceStatus::Active).await, ServiceStatus::Active);
        // idempotent while ACTIVE
        svc.activate().await.unwrap();
        assert_eq!(svc.status().await, ServiceStatus::Active);

        svc.deactivate().await.unwrap();
        assert_eq!(
            settle(&svc, ServiceStatus::Inactive).await,
            ServiceStatus::Inactive
        );
        // idempotent while INACTIVE
        svc.deactivate().await.unwrap();
        assert_eq!(svc.status().await, ServiceStatus::Inactive);
    }

    #[tokio::test]
    async fn activate_before_define_is_rejected() {
        let svc = service();
        let err = svc.activate().await.unwrap_err();
        assert_eq!(err.kind(), FaultKind::ServiceLogic);
        assert_eq!(svc.status().await, ServiceStatus::Dormant);
    }

    #[tokio::test]
    async fn start_failure_reaches_failed() {
        let fabric = Arc::new(TestFabric::new());
        fabric.fail_start(true);
        let svc = service_with(fabric);
        svc.define(Ok((segment(), flows()))).await.unwrap();
        settle(&svc, ServiceStatus::Inactive).await;

        svc.activate().await.unwrap();
        assert_eq!(settle(&svc, ServiceStatus::Failed).await, ServiceStatus::Failed);
        let snap = svc.snapshot().await;
        assert_eq!(snap.errors, vec![FaultKind::NetworkMgmt]);

        // FAILED is terminal except for release
        assert_eq!(
            svc.activate().await.unwrap_err().kind(),
            FaultKind::ServiceLogic
        );
        svc.release().await.unwrap();
        assert_eq!(svc.status().await, ServiceStatus::Released);
    }

    #[tokio::test]
    async fn bridge_refusal_fails_the_service() {
        let fabric = Arc::new(TestFabric::new());
        fabric.fail_bridge(true);
        let svc = service_with(fabric);
        let err = svc.define(Ok((segment(), flows()))).await.unwrap_err();
        assert_eq!(err.kind(), FaultKind::NetworkResource);
        assert_eq!(svc.status().await, ServiceStatus::Failed);
    }

    #[tokio::test]
    async fn release_completes_on_fabric_teardown() {
        let fabric = Arc::new(TestFabric::new());
        let svc = Service::new(1, "netA", fabric.clone(), None, None);
        svc.define(Ok((segment(), flows()))).await.unwrap();
        settle(&svc, ServiceStatus::Inactive).await;

        let dropped = svc.release().await.unwrap();
        assert!(dropped.is_some());
        assert_eq!(svc.status().await, ServiceStatus::Releasing);

        fabric.retain(&HashSet::new()).await;
        assert_eq!(
            settle(&svc, ServiceStatus::Released).await,
            ServiceStatus::Released
        );

        // everything after RELEASED is an expired service
        for result in [
            svc.activate().await,
            svc.deactivate().await,
            svc.define(Ok((segment(), flows()))).await,
        ] {
            assert_eq!(result.unwrap_err().kind(), FaultKind::ExpiredService);
        }
        assert_eq!(
            svc.release().await.unwrap_err().kind(),
            FaultKind::ExpiredService
        );
    }

    #[tokio::test]
    async fn release_from_dormant_is_immediate() {
        let svc = service();
        assert!(svc.release().await.unwrap().is_none());
        assert_eq!(svc.status().await, ServiceStatus::Released);
    }

    #[tokio::test]
    async fn listeners_see_every_transition_in_order() {
        let svc = service();
        let mut watcher = svc.watch().await;

        svc.define(Ok((segment(), flows()))).await.unwrap();
        settle(&svc, ServiceStatus::Inactive).await;
        svc.activate().await.unwrap();
        settle(&svc, ServiceStatus::Active).await;
        svc.deactivate().await.unwrap();
        settle(&svc, ServiceStatus::Inactive).await;
        svc.release().await.unwrap();
        svc.shared.fabric.retain(&HashSet::new()).await;
        settle(&svc, ServiceStatus::Released).await;

        let mut seen = Vec::new();
        while let Some(status) = watcher.recv().await {
            seen.push(status);
        }
        assert_eq!(
            seen,
            vec![
                ServiceStatus::Establishing,
                ServiceStatus::Inactive,
                ServiceStatus::Activating,
                ServiceStatus::Active,
                ServiceStatus::Deactivating,
                ServiceStatus::Inactive,
                ServiceStatus::Releasing,
                ServiceStatus::Released,
            ]
        );
    }

    #[tokio::test]
    async fn late_listener_gets_the_current_status_first() {
        let svc = service();
        svc.define(Ok((segment(), flows()))).await.unwrap();
        settle(&svc, ServiceStatus::Inactive).await;

        let mut watcher = svc.watch().await;
        assert_eq!(watcher.recv().await, Some(ServiceStatus::Inactive));

        svc.activate().await.unwrap();
        settle(&svc, ServiceStatus::Active).await;
        assert_eq!(watcher.recv().await, Some(ServiceStatus::Activating));
        assert_eq!(watcher.recv().await, Some(ServiceStatus::Active));
    }

    #[tokio::test]
    async fn await_status_times_out_to_the_current_status() {
        let svc = service();
        let status = svc
            .await_status(
                &HashSet::from([ServiceStatus::Active]),
                Duration::from_millis(20),
            )
            .await;
        assert_eq!(status, ServiceStatus::Dormant);
    }

    #[tokio::test]
    async fn token_gates_mutations() {
        let fabric: Arc<dyn Fabric> = Arc::new(TestFabric::new());
        let svc = Service::new(7, "netA", fabric, None, Some("sekrit-7".into()));

        let good = Regex::new("^sekrit-").unwrap();
        let bad = Regex::new("^other-").unwrap();
        assert!(svc.authorize(Some(&good)).await.is_ok());
        assert_eq!(
            svc.authorize(Some(&bad)).await.unwrap_err().kind(),
            FaultKind::ExpiredService
        );
        assert_eq!(
            svc.authorize(None).await.unwrap_err().kind(),
            FaultKind::ExpiredService
        );
    }

    #[tokio::test]
    async fn direction_tags_are_stable() {
        // the bw fault payload names the direction on the wire
        assert_eq!(Direction::Ingress.as_str(), "ingress");
        assert_eq!(Direction::Egress.as_str(), "egress");
    }
}
