//! The wire error taxonomy.
//!
//! Every failure a caller can observe is a [`Fault`]: a kind tag plus the
//! kind's context fields, encoded as a JSON object of the form
//! `{"error": <kind>, ...fields, "msg": <text>}`. Faults also travel
//! internally: the fabric surfaces REST failures to service listeners as
//! faults, and the state machine records them against the service.

use std::collections::BTreeSet;
use std::{error::Error, fmt};

use serde_json::{json, Map, Value};

/// The serialized `"error"` tag of a [`Fault`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FaultKind {
    /// Caller lacks a controllable grant for the network.
    Unauthorized,
    /// The named network is not registered with the broker.
    NoNetwork,
    /// Malformed request.
    BadArgument,
    /// Resource exhaustion, or management calls on a non-managed connection.
    NetworkResource,
    /// Generic management failure.
    NetworkMgmt,
    TerminalUnknown,
    TerminalExists,
    TerminalName,
    TerminalBusy,
    OwnTerminal,
    TerminalMgmt,
    /// Invalid terminal configuration string.
    TerminalConfig,
    SubterminalUnknown,
    SubterminalBusy,
    SubterminalMgmt,
    SubnetworkUnknown,
    TrunkUnknown,
    TrunkMgmt,
    TrunkExpired,
    LabelsUnavailable,
    LabelsInUse,
    LabelMgmt,
    /// Over-subscription of a terminal's capacity.
    BwUnavailable,
    /// Service released, or never existed.
    ExpiredService,
    /// `define` preconditions failed.
    SegmentInvalid,
    ServiceLogic,
    NetworkLogic,
    CircuitLogic,
    /// Bucket for unexpected failures.
    Unknown,
}

impl FaultKind {
    /// The wire tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Unauthorized => "unauthorized",
            FaultKind::NoNetwork => "no-network",
            FaultKind::BadArgument => "bad-argument",
            FaultKind::NetworkResource => "network-resource",
            FaultKind::NetworkMgmt => "network-mgmt",
            FaultKind::TerminalUnknown => "terminal-unknown",
            FaultKind::TerminalExists => "terminal-exists",
            FaultKind::TerminalName => "terminal-name",
            FaultKind::TerminalBusy => "terminal-busy",
            FaultKind::OwnTerminal => "own-terminal",
            FaultKind::TerminalMgmt => "terminal-mgmt",
            FaultKind::TerminalConfig => "terminal-config",
            FaultKind::SubterminalUnknown => "subterminal-unknown",
            FaultKind::SubterminalBusy => "subterminal-busy",
            FaultKind::SubterminalMgmt => "subterminal-mgmt",
            FaultKind::SubnetworkUnknown => "subnetwork-unknown",
            FaultKind::TrunkUnknown => "trunk-unknown",
            FaultKind::TrunkMgmt => "trunk-mgmt",
            FaultKind::TrunkExpired => "trunk-expired",
            FaultKind::LabelsUnavailable => "labels-unavailable",
            FaultKind::LabelsInUse => "labels-in-use",
            FaultKind::LabelMgmt => "label-mgmt",
            FaultKind::BwUnavailable => "bw-unavailable",
            FaultKind::ExpiredService => "expired-service",
            FaultKind::SegmentInvalid => "segment-invalid",
            FaultKind::ServiceLogic => "service-logic",
            FaultKind::NetworkLogic => "network-logic",
            FaultKind::CircuitLogic => "circuit-logic",
            FaultKind::Unknown => "unknown",
        }
    }

    /// Parse a wire tag back into a kind.
    pub fn from_tag(tag: &str) -> Option<FaultKind> {
        Some(match tag {
            "unauthorized" => FaultKind::Unauthorized,
            "no-network" => FaultKind::NoNetwork,
            "bad-argument" => FaultKind::BadArgument,
            "network-resource" => FaultKind::NetworkResource,
            "network-mgmt" => FaultKind::NetworkMgmt,
            "terminal-unknown" => FaultKind::TerminalUnknown,
            "terminal-exists" => FaultKind::TerminalExists,
            "terminal-name" => FaultKind::TerminalName,
            "terminal-busy" => FaultKind::TerminalBusy,
            "own-terminal" => FaultKind::OwnTerminal,
            "terminal-mgmt" => FaultKind::TerminalMgmt,
            "terminal-config" => FaultKind::TerminalConfig,
            "subterminal-unknown" => FaultKind::SubterminalUnknown,
            "subterminal-busy" => FaultKind::SubterminalBusy,
            "subterminal-mgmt" => FaultKind::SubterminalMgmt,
            "subnetwork-unknown" => FaultKind::SubnetworkUnknown,
            "trunk-unknown" => FaultKind::TrunkUnknown,
            "trunk-mgmt" => FaultKind::TrunkMgmt,
            "trunk-expired" => FaultKind::TrunkExpired,
            "labels-unavailable" => FaultKind::LabelsUnavailable,
            "labels-in-use" => FaultKind::LabelsInUse,
            "label-mgmt" => FaultKind::LabelMgmt,
            "bw-unavailable" => FaultKind::BwUnavailable,
            "expired-service" => FaultKind::ExpiredService,
            "segment-invalid" => FaultKind::SegmentInvalid,
            "service-logic" => FaultKind::ServiceLogic,
            "network-logic" => FaultKind::NetworkLogic,
            "circuit-logic" => FaultKind::CircuitLogic,
            "unknown" => FaultKind::Unknown,
            _ => return None,
        })
    }

    /// All kinds, in taxonomy order.
    pub fn all() -> &'static [FaultKind] {
        &[
            FaultKind::Unauthorized,
            FaultKind::NoNetwork,
            FaultKind::BadArgument,
            FaultKind::NetworkResource,
            FaultKind::NetworkMgmt,
            FaultKind::TerminalUnknown,
            FaultKind::TerminalExists,
            FaultKind::TerminalName,
            FaultKind::TerminalBusy,
            FaultKind::OwnTerminal,
            FaultKind::TerminalMgmt,
            FaultKind::TerminalConfig,
            FaultKind::SubterminalUnknown,
            FaultKind::SubterminalBusy,
            FaultKind::SubterminalMgmt,
            FaultKind::SubnetworkUnknown,
            FaultKind::TrunkUnknown,
            FaultKind::TrunkMgmt,
            FaultKind::TrunkExpired,
            FaultKind::LabelsUnavailable,
            FaultKind::LabelsInUse,
            FaultKind::LabelMgmt,
            FaultKind::BwUnavailable,
            FaultKind::ExpiredService,
            FaultKind::SegmentInvalid,
            FaultKind::ServiceLogic,
            FaultKind::NetworkLogic,
            FaultKind::CircuitLogic,
            FaultKind::Unknown,
        ]
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, wire-encodable failure.
#[derive(Clone, Debug, PartialEq)]
pub struct Fault {
    kind: FaultKind,
    message: String,
    fields: Map<String, Value>,
}

// ===== impl Fault =====

impl Fault {
    /// Create a new `Fault` with the associated kind and message.
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Fault {
        Fault {
            kind,
            message: message.into(),
            fields: Map::new(),
        }
    }

    pub fn unauthorized(network: impl Into<String>) -> Fault {
        Fault::new(FaultKind::Unauthorized, "").with_field("network", network.into())
    }

    pub fn no_network(network: impl Into<String>) -> Fault {
        Fault::new(FaultKind::NoNetwork, "").with_field("network-name", network.into())
    }

    pub fn bad_argument(message: impl Into<String>) -> Fault {
        Fault::new(FaultKind::BadArgument, message)
    }

    pub fn network_resource(message: impl Into<String>) -> Fault {
        Fault::new(FaultKind::NetworkResource, message)
    }

    pub fn network_mgmt(message: impl Into<String>) -> Fault {
        Fault::new(FaultKind::NetworkMgmt, message)
    }

    pub fn terminal_unknown(terminal: impl Into<String>) -> Fault {
        Fault::new(FaultKind::TerminalUnknown, "").with_field("terminal-name", terminal.into())
    }

    pub fn terminal_exists(terminal: impl Into<String>) -> Fault {
        Fault::new(FaultKind::TerminalExists, "").with_field("terminal-name", terminal.into())
    }

    pub fn terminal_name(terminal: impl Into<String>, message: impl Into<String>) -> Fault {
        Fault::new(FaultKind::TerminalName, message).with_field("terminal-name", terminal.into())
    }

    pub fn terminal_busy(terminal: impl Into<String>) -> Fault {
        Fault::new(FaultKind::TerminalBusy, "").with_field("terminal-name", terminal.into())
    }

    pub fn terminal_mgmt(terminal: impl Into<String>, message: impl Into<String>) -> Fault {
        Fault::new(FaultKind::TerminalMgmt, message).with_field("terminal-name", terminal.into())
    }

    pub fn terminal_config(config: impl Into<String>, message: impl Into<String>) -> Fault {
        Fault::new(FaultKind::TerminalConfig, message).with_field("config", config.into())
    }

    pub fn labels_unavailable(labels: impl IntoIterator<Item = u32>) -> Fault {
        Fault::new(FaultKind::LabelsUnavailable, "").with_labels(labels)
    }

    pub fn labels_in_use(labels: impl IntoIterator<Item = u32>) -> Fault {
        Fault::new(FaultKind::LabelsInUse, "").with_labels(labels)
    }

    pub fn bw_unavailable(direction: Direction, amount: f64) -> Fault {
        Fault::new(FaultKind::BwUnavailable, "")
            .with_field("direction", direction.as_str())
            .with_field("amount", amount)
    }

    pub fn expired_service(service_id: u32) -> Fault {
        Fault::new(FaultKind::ExpiredService, "").with_field("service-id", service_id)
    }

    pub fn segment_invalid(message: impl Into<String>) -> Fault {
        Fault::new(FaultKind::SegmentInvalid, message)
    }

    pub fn service_logic(message: impl Into<String>) -> Fault {
        Fault::new(FaultKind::ServiceLogic, message)
    }

    pub fn network_logic(message: impl Into<String>) -> Fault {
        Fault::new(FaultKind::NetworkLogic, message)
    }

    pub fn circuit_logic(message: impl Into<String>) -> Fault {
        Fault::new(FaultKind::CircuitLogic, message)
    }

    pub fn unknown(message: impl Into<String>) -> Fault {
        Fault::new(FaultKind::Unknown, message).with_field("type", "unknown")
    }

    /// Attach (or overwrite) a context field.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Fault {
        self.fields.insert(key.to_owned(), value.into());
        self
    }

    /// Attach the originating service id, if not already present.
    pub fn annotate_service(mut self, service_id: u32) -> Fault {
        self.fields
            .entry("service-id".to_owned())
            .or_insert_with(|| json!(service_id));
        self
    }

    /// Attach the originating network name, if not already present.
    pub fn annotate_network(mut self, network: &str) -> Fault {
        self.fields
            .entry("network-name".to_owned())
            .or_insert_with(|| json!(network));
        self
    }

    fn with_labels(mut self, labels: impl IntoIterator<Item = u32>) -> Fault {
        let labels: BTreeSet<u32> = labels.into_iter().collect();
        self.fields.insert(
            "labels".to_owned(),
            Value::Array(labels.into_iter().map(|l| json!(l)).collect()),
        );
        self
    }

    /// The kind of this fault.
    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    /// The human-readable message, possibly empty.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// A context field by wire name.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Encode as the wire JSON object.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("error".to_owned(), json!(self.kind.as_str()));
        for (k, v) in &self.fields {
            obj.insert(k.clone(), v.clone());
        }
        if !self.message.is_empty() {
            obj.insert("msg".to_owned(), json!(self.message));
        }
        Value::Object(obj)
    }

    /// Decode a wire JSON object back into a fault.
    ///
    /// Returns `None` if the object carries no `"error"` tag at all. An
    /// unrecognized tag decodes to [`FaultKind::Unknown`] with the original
    /// tag preserved in the `type` field.
    pub fn from_value(value: &Value) -> Option<Fault> {
        let obj = value.as_object()?;
        let tag = obj.get("error")?.as_str()?;
        let kind = FaultKind::from_tag(tag);
        let mut fields = Map::new();
        let mut message = String::new();
        for (k, v) in obj {
            match k.as_str() {
                "error" => {}
                "msg" => message = v.as_str().unwrap_or_default().to_owned(),
                _ => {
                    fields.insert(k.clone(), v.clone());
                }
            }
        }
        let kind = match kind {
            Some(kind) => kind,
            None => {
                fields.insert("type".to_owned(), json!(tag));
                FaultKind::Unknown
            }
        };
        Some(Fault {
            kind,
            message,
            fields,
        })
    }

    /// Fold an arbitrary error into a fault, preserving faults found in the
    /// source chain.
    pub fn from_error(err: crate::Error) -> Fault {
        let mut cause: Option<&(dyn Error + 'static)> = Some(err.as_ref());
        while let Some(err) = cause {
            if let Some(fault) = err.downcast_ref::<Fault>() {
                return fault.clone();
            }
            cause = err.source();
        }
        Fault::unknown(err.to_string())
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fault: {}", self.kind.as_str())?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        for (k, v) in &self.fields {
            write!(f, ", {}={}", k, v)?;
        }
        Ok(())
    }
}

impl Error for Fault {}

/// Traffic direction, for [`Fault::bw_unavailable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for kind in FaultKind::all() {
            assert_eq!(FaultKind::from_tag(kind.as_str()), Some(*kind));
        }
    }

    #[test]
    fn wire_round_trip() {
        let faults = vec![
            Fault::unauthorized("netB"),
            Fault::no_network("ghost"),
            Fault::bad_argument("no type field"),
            Fault::network_resource("management calls forbidden").with_field("network-name", "netA"),
            Fault::terminal_unknown("t9"),
            Fault::terminal_config("phys.3x2.7", "x2 cannot carry a fixed inner tag"),
            Fault::labels_unavailable([5000, 5001]),
            Fault::labels_in_use([100]),
            Fault::bw_unavailable(Direction::Ingress, 40.0),
            Fault::expired_service(17),
            Fault::segment_invalid("need >= 2 circuits").annotate_service(3),
            Fault::service_logic("activate while DORMANT"),
            Fault::circuit_logic("circuit attached twice"),
            Fault::unknown("boom"),
        ];
        for fault in faults {
            let decoded = Fault::from_value(&fault.to_value()).expect("tagged object");
            assert_eq!(decoded, fault, "round trip of {}", fault.kind());
        }
    }

    #[test]
    fn unrecognized_tag_buckets_to_unknown() {
        let value = serde_json::json!({"error": "not-a-kind", "msg": "hm"});
        let fault = Fault::from_value(&value).unwrap();
        assert_eq!(fault.kind(), FaultKind::Unknown);
        assert_eq!(fault.field("type"), Some(&serde_json::json!("not-a-kind")));
    }

    #[test]
    fn untagged_object_is_not_a_fault() {
        assert!(Fault::from_value(&serde_json::json!({"status": "ACTIVE"})).is_none());
    }

    #[test]
    fn annotation_does_not_overwrite() {
        let fault = Fault::expired_service(4).annotate_service(9);
        assert_eq!(fault.field("service-id"), Some(&serde_json::json!(4)));
    }

    #[test]
    fn fault_in_error_chain_is_preserved() {
        let fault = Fault::no_network("x");
        let boxed: crate::Error = Box::new(fault.clone());
        assert_eq!(Fault::from_error(boxed), fault);
    }
}
