//! Segments, traffic flows, and terminals.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::fault::Fault;
use crate::iface::{CircuitKey, Interface};

/// Requested bandwidth for one circuit, in Mbit/s.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficFlow {
    #[serde(rename = "ingress-bw")]
    pub ingress: f64,
    #[serde(rename = "egress-bw")]
    pub egress: f64,
}

/// A service endpoint designation: a terminal and a label within its space.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Circuit {
    #[serde(rename = "terminal-name")]
    pub terminal: String,
    pub label: u32,
}

impl fmt::Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.terminal, self.label)
    }
}

/// One endpoint of a `define-service` request, as it appears on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "terminal-name")]
    pub terminal: String,
    pub label: u32,
    #[serde(rename = "ingress-bw", default)]
    pub ingress: f64,
    #[serde(rename = "egress-bw", default)]
    pub egress: f64,
}

/// The full set of circuits of a service, each with its flow.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Segment {
    endpoints: BTreeMap<Circuit, TrafficFlow>,
}

impl Segment {
    /// Validate and collect wire endpoints.
    ///
    /// A segment needs at least two distinct circuits, and every flow must
    /// be finite and non-negative.
    pub fn from_endpoints(endpoints: Vec<Endpoint>) -> Result<Segment, Fault> {
        let mut collected = BTreeMap::new();
        for ep in endpoints {
            for (direction, bw) in [("ingress", ep.ingress), ("egress", ep.egress)] {
                if !bw.is_finite() || bw < 0.0 {
                    return Err(Fault::segment_invalid(format!(
                        "{} bandwidth {} on {}@{} is not a finite non-negative number",
                        direction, bw, ep.terminal, ep.label
                    )));
                }
            }
            let circuit = Circuit {
                terminal: ep.terminal,
                label: ep.label,
            };
            if collected
                .insert(
                    circuit.clone(),
                    TrafficFlow {
                        ingress: ep.ingress,
                        egress: ep.egress,
                    },
                )
                .is_some()
            {
                return Err(Fault::segment_invalid(format!(
                    "circuit {} appears twice",
                    circuit
                )));
            }
        }
        if collected.len() < 2 {
            return Err(Fault::segment_invalid("need >= 2 circuits"));
        }
        Ok(Segment {
            endpoints: collected,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Circuit, &TrafficFlow)> {
        self.endpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// A segment resolved to canonical circuits, ready for the fabric.
pub type CanonicalFlows = BTreeMap<CircuitKey, TrafficFlow>;

/// A named attach point of a network.
#[derive(Clone, Debug)]
pub struct Terminal {
    name: String,
    iface: Interface,
    ingress_limit: Option<f64>,
    egress_limit: Option<f64>,
    labels: Option<(u32, u32)>,
}

impl Terminal {
    pub fn new(name: &str, iface: Interface) -> Result<Terminal, Fault> {
        validate_name(name)?;
        Ok(Terminal {
            name: name.to_owned(),
            iface,
            ingress_limit: None,
            egress_limit: None,
            labels: None,
        })
    }

    /// Cap the bandwidth this terminal will commit, per direction.
    pub fn with_limits(mut self, ingress: Option<f64>, egress: Option<f64>) -> Terminal {
        self.ingress_limit = ingress;
        self.egress_limit = egress;
        self
    }

    /// Restrict the usable labels to an inclusive range.
    pub fn with_labels(mut self, lo: u32, hi: u32) -> Terminal {
        self.labels = Some((lo, hi));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        self.iface.descriptor()
    }

    pub fn ingress_limit(&self) -> Option<f64> {
        self.ingress_limit
    }

    pub fn egress_limit(&self) -> Option<f64> {
        self.egress_limit
    }

    /// Resolve a label against this terminal's restrictions and interface.
    pub fn circuit(&self, label: u32) -> Result<CircuitKey, Fault> {
        if let Some((lo, hi)) = self.labels {
            if label < lo || label > hi {
                return Err(Fault::labels_unavailable([label]));
            }
        }
        self.iface.circuit(label)
    }
}

/// Terminal names are short tokens: letters, digits, `.`, `_`, `-`.
pub fn validate_name(name: &str) -> Result<(), Fault> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(Fault::terminal_name(name, "not a usable terminal name"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultKind;
    use crate::iface::PortCaps;

    fn endpoint(terminal: &str, label: u32, bw: f64) -> Endpoint {
        Endpoint {
            terminal: terminal.to_owned(),
            label,
            ingress: bw,
            egress: bw,
        }
    }

    #[test]
    fn segment_needs_two_circuits() {
        let err = Segment::from_endpoints(vec![endpoint("t1", 100, 10.0)]).unwrap_err();
        assert_eq!(err.kind(), FaultKind::SegmentInvalid);
        assert_eq!(err.message(), "need >= 2 circuits");

        assert!(Segment::from_endpoints(vec![
            endpoint("t1", 100, 10.0),
            endpoint("t2", 200, 10.0)
        ])
        .is_ok());
    }

    #[test]
    fn duplicate_circuits_are_rejected() {
        let err = Segment::from_endpoints(vec![
            endpoint("t1", 100, 10.0),
            endpoint("t1", 100, 20.0),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), FaultKind::SegmentInvalid);
    }

    #[test]
    fn flows_must_be_finite_and_non_negative() {
        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            let err = Segment::from_endpoints(vec![
                endpoint("t1", 100, bad),
                endpoint("t2", 200, 10.0),
            ])
            .unwrap_err();
            assert_eq!(err.kind(), FaultKind::SegmentInvalid, "bw {}", bad);
        }
    }

    #[test]
    fn terminal_label_restriction() {
        let iface = Interface::parse("phys.3", PortCaps::default()).unwrap();
        let terminal = Terminal::new("t1", iface).unwrap().with_labels(100, 199);
        assert!(terminal.circuit(150).is_ok());
        let err = terminal.circuit(200).unwrap_err();
        assert_eq!(err.kind(), FaultKind::LabelsUnavailable);
    }

    #[test]
    fn terminal_names_are_tokens() {
        assert!(validate_name("t1").is_ok());
        assert!(validate_name("edge-7.a").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("newline\n").is_err());
    }

    #[test]
    fn endpoint_wire_shape() {
        let ep: Endpoint = serde_json::from_value(serde_json::json!({
            "terminal-name": "t1",
            "label": 100,
            "ingress-bw": 10.0,
            "egress-bw": 12.5,
        }))
        .unwrap();
        assert_eq!(ep.terminal, "t1");
        assert_eq!(ep.label, 100);
        assert_eq!(ep.ingress, 10.0);
        assert_eq!(ep.egress, 12.5);
    }
}
