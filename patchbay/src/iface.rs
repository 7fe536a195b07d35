//! Interface descriptors and canonical circuits.
//!
//! A terminal is configured with a descriptor describing its encapsulation
//! hierarchy:
//!
//! * `phys` / `lag`: the label selects an untagged physical/LAG port;
//! * `phys.N` / `lagN`: port fixed, the label is the single (ctag) VLAN;
//! * `phys.Nx2`: port fixed, the 24-bit label carries outer and inner tags
//!   in its top and bottom 12 bits;
//! * `phys.N.M`: port `N` with outer tag `M` fixed, the label is the inner
//!   tag.
//!
//! Resolution is canonical: `phys.3x2` at label `L` and `phys.3.(L>>12)` at
//! label `L & 0xfff` designate the same circuit, and both map to the same
//! tunnel attachment on the switch.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::fault::Fault;

static DESCRIPTOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<kind>lag|phys|)(?:\.?(?P<port>\d+)(?P<double>x2)?(?:\.(?P<outer>\d+))?)?$")
        .expect("descriptor grammar")
});

const TAG_MIN: u32 = 1;
const TAG_MAX: u32 = 4094;

/// Physical port limits an interface is resolved against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortCaps {
    pub ports: u32,
    pub lags: u32,
}

impl Default for PortCaps {
    fn default() -> Self {
        PortCaps { ports: 32, lags: 8 }
    }
}

impl PortCaps {
    fn limit(&self, lag: bool) -> u32 {
        if lag {
            self.lags
        } else {
            self.ports
        }
    }
}

/// A physical attachment point: a numbered port or LAG.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRef {
    pub lag: bool,
    pub index: u32,
}

impl PortRef {
    /// The port name used on the switch's REST surface.
    pub fn name(&self) -> String {
        if self.lag {
            format!("lag{}", self.index)
        } else {
            self.index.to_string()
        }
    }

    /// Parse a switch-side port name back.
    pub fn parse(name: &str) -> Option<PortRef> {
        if let Some(rest) = name.strip_prefix("lag") {
            rest.parse().ok().map(|index| PortRef { lag: true, index })
        } else {
            name.parse().ok().map(|index| PortRef { lag: false, index })
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lag {
            write!(f, "lag.{}", self.index)
        } else {
            write!(f, "phys.{}", self.index)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Encap {
    /// The label selects the port itself, untagged.
    PortSelect { lag: bool },
    /// The label is the ctag.
    Single { port: PortRef },
    /// The label carries outer and inner tags in 12-bit halves.
    DoubleFull { port: PortRef },
    /// Outer tag fixed; the label is the inner tag.
    DoubleInner { port: PortRef, outer: u16 },
}

/// A parsed interface descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interface {
    desc: String,
    encap: Encap,
    caps: PortCaps,
}

impl Interface {
    /// Parse a descriptor against the switch's port limits.
    pub fn parse(desc: &str, caps: PortCaps) -> Result<Interface, Fault> {
        let captures = DESCRIPTOR
            .captures(desc)
            .ok_or_else(|| Fault::terminal_config(desc, "descriptor does not match grammar"))?;

        let lag = captures.name("kind").map(|m| m.as_str()) == Some("lag");
        let port = captures
            .name("port")
            .map(|m| m.as_str().parse::<u32>())
            .transpose()
            .map_err(|_| Fault::terminal_config(desc, "port number out of range"))?;
        let double = captures.name("double").is_some();
        let outer = captures
            .name("outer")
            .map(|m| m.as_str().parse::<u32>())
            .transpose()
            .map_err(|_| Fault::terminal_config(desc, "outer tag out of range"))?;

        let encap = match (port, double, outer) {
            (None, _, _) => Encap::PortSelect { lag },
            (Some(index), false, None) => {
                let port = PortRef { lag, index };
                check_port(desc, port, caps)?;
                Encap::Single { port }
            }
            (Some(index), true, None) => {
                let port = PortRef { lag, index };
                check_port(desc, port, caps)?;
                Encap::DoubleFull { port }
            }
            (Some(index), false, Some(outer)) => {
                let port = PortRef { lag, index };
                check_port(desc, port, caps)?;
                if !(TAG_MIN..=TAG_MAX).contains(&outer) {
                    return Err(Fault::terminal_config(desc, "outer tag out of range"));
                }
                Encap::DoubleInner {
                    port,
                    outer: outer as u16,
                }
            }
            (Some(_), true, Some(_)) => {
                return Err(Fault::terminal_config(
                    desc,
                    "x2 cannot carry a fixed inner tag",
                ));
            }
        };

        Ok(Interface {
            desc: desc.to_owned(),
            encap,
            caps,
        })
    }

    /// The original descriptor text.
    pub fn descriptor(&self) -> &str {
        &self.desc
    }

    /// Resolve a label to its canonical circuit.
    pub fn circuit(&self, label: u32) -> Result<CircuitKey, Fault> {
        let out_of_range =
            |msg: &str| Fault::segment_invalid(format!("label {} {} for {}", label, msg, self.desc));

        match self.encap {
            Encap::PortSelect { lag } => {
                if label < 1 || label > self.caps.limit(lag) {
                    return Err(out_of_range("selects no port"));
                }
                Ok(CircuitKey::Untagged {
                    port: PortRef { lag, index: label },
                })
            }
            Encap::Single { port } => {
                if !(TAG_MIN..=TAG_MAX).contains(&label) {
                    return Err(out_of_range("is not a usable tag"));
                }
                Ok(CircuitKey::Single {
                    port,
                    tag: label as u16,
                })
            }
            Encap::DoubleFull { port } => {
                let outer = label >> 12;
                let inner = label & 0xfff;
                if label >= 1 << 24
                    || !(TAG_MIN..=TAG_MAX).contains(&outer)
                    || !(TAG_MIN..=TAG_MAX).contains(&inner)
                {
                    return Err(out_of_range("does not split into usable tags"));
                }
                Ok(CircuitKey::Double {
                    port,
                    outer: outer as u16,
                    inner: inner as u16,
                })
            }
            Encap::DoubleInner { port, outer } => {
                if !(TAG_MIN..=TAG_MAX).contains(&label) {
                    return Err(out_of_range("is not a usable inner tag"));
                }
                Ok(CircuitKey::Double {
                    port,
                    outer,
                    inner: label as u16,
                })
            }
        }
    }
}

fn check_port(desc: &str, port: PortRef, caps: PortCaps) -> Result<(), Fault> {
    if port.index < 1 || port.index > caps.limit(port.lag) {
        return Err(Fault::terminal_config(desc, "no such port"));
    }
    Ok(())
}

/// The canonical identity of a circuit on the switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CircuitKey {
    Untagged { port: PortRef },
    Single { port: PortRef, tag: u16 },
    Double { port: PortRef, outer: u16, inner: u16 },
}

impl CircuitKey {
    pub fn port(&self) -> PortRef {
        match *self {
            CircuitKey::Untagged { port } => port,
            CircuitKey::Single { port, .. } => port,
            CircuitKey::Double { port, .. } => port,
        }
    }

    /// The tunnel attachment realizing this circuit:
    /// `(switch port name, vlan-id, inner-vlan-id)`.
    pub fn tunnel(&self) -> (String, Option<u16>, Option<u16>) {
        match *self {
            CircuitKey::Untagged { port } => (port.name(), None, None),
            CircuitKey::Single { port, tag } => (port.name(), Some(tag), None),
            CircuitKey::Double { port, outer, inner } => (port.name(), Some(outer), Some(inner)),
        }
    }

    /// Map a tunnel attachment back to its canonical circuit.
    pub fn from_tunnel(
        port: &str,
        vlan: Option<u16>,
        inner: Option<u16>,
    ) -> Result<CircuitKey, Fault> {
        let port = PortRef::parse(port)
            .ok_or_else(|| Fault::circuit_logic(format!("unparseable tunnel port {:?}", port)))?;
        match (vlan, inner) {
            (None, None) => Ok(CircuitKey::Untagged { port }),
            (Some(tag), None) => Ok(CircuitKey::Single { port, tag }),
            (Some(outer), Some(inner)) => Ok(CircuitKey::Double { port, outer, inner }),
            (None, Some(_)) => Err(Fault::circuit_logic(
                "tunnel has an inner tag but no outer tag",
            )),
        }
    }
}

impl fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CircuitKey::Untagged { port } => write!(f, "{}", port),
            CircuitKey::Single { port, tag } => write!(f, "{}@{}", port, tag),
            CircuitKey::Double { port, outer, inner } => {
                write!(f, "{}.{}@{}", port, outer, inner)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> PortCaps {
        PortCaps { ports: 32, lags: 8 }
    }

    #[test]
    fn grammar_accepts_the_documented_forms() {
        for desc in ["phys", "lag", "phys.3", "lag4", "lag.4", "3", "phys.3x2", "phys.3.7", ""] {
            assert!(Interface::parse(desc, caps()).is_ok(), "{:?}", desc);
        }
    }

    #[test]
    fn grammar_rejects_junk() {
        for desc in ["eth0", "phys.", "phys.3.4.5", "phys.x2", "lag 4", "phys.-1"] {
            assert!(Interface::parse(desc, caps()).is_err(), "{:?}", desc);
        }
    }

    #[test]
    fn x2_with_fixed_inner_is_invalid() {
        let err = Interface::parse("phys.3x2.7", caps()).unwrap_err();
        assert_eq!(err.kind(), crate::FaultKind::TerminalConfig);
    }

    #[test]
    fn bare_prefix_selects_untagged_ports() {
        let iface = Interface::parse("phys", caps()).unwrap();
        assert_eq!(
            iface.circuit(3).unwrap(),
            CircuitKey::Untagged {
                port: PortRef { lag: false, index: 3 }
            }
        );
        assert!(iface.circuit(0).is_err());
        assert!(iface.circuit(33).is_err());

        let lags = Interface::parse("lag", caps()).unwrap();
        assert_eq!(
            lags.circuit(8).unwrap(),
            CircuitKey::Untagged {
                port: PortRef { lag: true, index: 8 }
            }
        );
        assert!(lags.circuit(9).is_err());
    }

    #[test]
    fn single_tag_labels_are_vlan_ids() {
        let iface = Interface::parse("phys.3", caps()).unwrap();
        assert_eq!(
            iface.circuit(100).unwrap(),
            CircuitKey::Single {
                port: PortRef { lag: false, index: 3 },
                tag: 100
            }
        );
        assert!(iface.circuit(0).is_err());
        assert!(iface.circuit(4095).is_err());
    }

    #[test]
    fn double_forms_resolve_to_the_same_circuit() {
        let x2 = Interface::parse("phys.3x2", caps()).unwrap();
        let label = (100 << 12) | 7;
        let via_x2 = x2.circuit(label).unwrap();

        let fixed = Interface::parse("phys.3.100", caps()).unwrap();
        let via_fixed = fixed.circuit(7).unwrap();

        assert_eq!(via_x2, via_fixed);
        assert_eq!(
            via_x2,
            CircuitKey::Double {
                port: PortRef { lag: false, index: 3 },
                outer: 100,
                inner: 7
            }
        );
    }

    #[test]
    fn x2_rejects_labels_with_an_unusable_half() {
        let x2 = Interface::parse("phys.3x2", caps()).unwrap();
        assert!(x2.circuit(100).is_err(), "outer half would be zero");
        assert!(x2.circuit(100 << 12).is_err(), "inner half would be zero");
        assert!(x2.circuit(1 << 24).is_err());
    }

    #[test]
    fn tunnel_mapping_round_trips() {
        let circuits = [
            CircuitKey::Untagged {
                port: PortRef { lag: false, index: 5 },
            },
            CircuitKey::Untagged {
                port: PortRef { lag: true, index: 2 },
            },
            CircuitKey::Single {
                port: PortRef { lag: false, index: 3 },
                tag: 100,
            },
            CircuitKey::Double {
                port: PortRef { lag: false, index: 3 },
                outer: 100,
                inner: 7,
            },
        ];
        for circuit in circuits {
            let (port, vlan, inner) = circuit.tunnel();
            assert_eq!(
                CircuitKey::from_tunnel(&port, vlan, inner).unwrap(),
                circuit
            );
        }
    }

    #[test]
    fn inner_without_outer_is_rejected() {
        assert!(CircuitKey::from_tunnel("3", None, Some(7)).is_err());
    }

    #[quickcheck_macros::quickcheck]
    fn canonical_identity(port: u32, label: u32) -> bool {
        let port = port % 32 + 1;
        let label = label % (1 << 24);
        let iface = Interface::parse(&format!("phys.{}x2", port), caps()).unwrap();
        match iface.circuit(label) {
            Ok(circuit) => {
                let (p, vlan, inner) = circuit.tunnel();
                CircuitKey::from_tunnel(&p, vlan, inner).unwrap() == circuit
            }
            // out-of-range labels just fail; nothing to compare
            Err(_) => true,
        }
    }
}
