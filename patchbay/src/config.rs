//! Broker and agent configuration.
//!
//! The configuration file is TOML. Agent blocks use the flat, dotted key
//! names of the deployed configuration surface (`description.prefix`,
//! `rest.location`, ...), quoted as TOML keys:
//!
//! ```toml
//! [program]
//! name = "patchbay"
//!
//! [network.config]
//! server = "0.0.0.0:4753"
//!
//! [[agents]]
//! name = "slough"
//! type = "corsa-dp2x00-sharedbr"
//! "description.prefix" = "patchbay:vc:"
//! "rest.location" = "https://10.0.0.2/api/v1/"
//! "rest.authz.file" = "/etc/patchbay/slough.authz"
//! terminals = [{ name = "t1", config = "phys.3" }]
//! ```
//!
//! Agent factories are a static registry keyed by the `type` field; the
//! `ssh-*` transports are recognized but built elsewhere, so asking this
//! registry for one is an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::fabric::ctrl::PortSliceCtrl;
use crate::fabric::rest::{ControllerTarget, CorsaRest};
use crate::fabric::{CorsaFabric, FabricConfig, Realization};
use crate::iface::PortCaps;
use crate::network::{Network, NetworkKind};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("agent {0:?}: type {1:?} is not built by this broker")]
    UnsupportedAgent(String, String),
    #[error("agent {agent:?}: missing key {key:?}")]
    MissingKey { agent: String, key: &'static str },
    #[error("agent {agent:?}: {source}")]
    Client {
        agent: String,
        source: crate::Error,
    },
    #[error("agent {agent:?}: bad terminal {terminal:?}: {fault}")]
    Terminal {
        agent: String,
        terminal: String,
        fault: crate::Fault,
    },
}

/// The whole configuration file.
#[derive(Debug, Default, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub program: ProgramSection,
    #[serde(default)]
    pub usmux: UsmuxSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProgramSection {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UsmuxSection {
    /// Configuration handed to the upstream-mux wrapper; opaque here.
    #[serde(default)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NetworkSection {
    #[serde(default)]
    pub config: NetworkConfigSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct NetworkConfigSection {
    /// Listen address of the RPC surface.
    #[serde(default)]
    pub server: Option<String>,
}

/// The `type` field of an agent block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum AgentType {
    #[serde(rename = "ssh-network")]
    SshNetwork,
    #[serde(rename = "ssh-switch")]
    SshSwitch,
    #[serde(rename = "ssh-aggregator")]
    SshAggregator,
    #[serde(rename = "corsa-dp2x00-brperlink")]
    CorsaBrPerLink,
    #[serde(rename = "corsa-dp2x00-sharedbr")]
    CorsaSharedBr,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::SshNetwork => "ssh-network",
            AgentType::SshSwitch => "ssh-switch",
            AgentType::SshAggregator => "ssh-aggregator",
            AgentType::CorsaBrPerLink => "corsa-dp2x00-brperlink",
            AgentType::CorsaSharedBr => "corsa-dp2x00-sharedbr",
        }
    }
}

/// A terminal seeded at startup instead of via `add-terminal`.
#[derive(Clone, Debug, Deserialize)]
pub struct TerminalSeed {
    pub name: String,
    pub config: String,
    #[serde(rename = "ingress-limit", default)]
    pub ingress_limit: Option<f64>,
    #[serde(rename = "egress-limit", default)]
    pub egress_limit: Option<f64>,
    #[serde(rename = "min-label", default)]
    pub min_label: Option<u32>,
    #[serde(rename = "max-label", default)]
    pub max_label: Option<u32>,
}

fn default_prefix() -> String {
    "patchbay:vc:".to_owned()
}

fn default_partial() -> String {
    "partial".to_owned()
}

fn default_complete() -> String {
    "complete".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_ports() -> u32 {
    32
}

fn default_lags() -> u32 {
    8
}

fn default_bridges() -> usize {
    63
}

fn default_dpid() -> u64 {
    1
}

/// One agent block.
#[derive(Clone, Debug, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AgentType,
    #[serde(rename = "description.prefix", default = "default_prefix")]
    pub descr_prefix: String,
    #[serde(rename = "description.partial", default = "default_partial")]
    pub descr_partial: String,
    #[serde(rename = "description.complete", default = "default_complete")]
    pub descr_complete: String,
    #[serde(rename = "description.destroy", default)]
    pub descr_destroy: bool,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub resources: Option<u32>,
    #[serde(default = "default_true")]
    pub metering: bool,
    #[serde(default = "default_true")]
    pub shaping: bool,
    #[serde(rename = "ctrl.netns", default)]
    pub ctrl_netns: Option<String>,
    #[serde(rename = "ctrl.host", default)]
    pub ctrl_host: Option<String>,
    #[serde(rename = "ctrl.port", default)]
    pub ctrl_port: Option<u16>,
    #[serde(rename = "capacity.ports", default = "default_ports")]
    pub capacity_ports: u32,
    #[serde(rename = "capacity.lags", default = "default_lags")]
    pub capacity_lags: u32,
    #[serde(rename = "capacity.bridges", default = "default_bridges")]
    pub capacity_bridges: usize,
    #[serde(rename = "rest.location", default)]
    pub rest_location: Option<String>,
    #[serde(rename = "rest.cert.file", default)]
    pub rest_cert_file: Option<PathBuf>,
    #[serde(rename = "rest.authz.file", default)]
    pub rest_authz_file: Option<PathBuf>,
    #[serde(rename = "ctrl.rest.location", default)]
    pub ctrl_rest_location: Option<String>,
    #[serde(rename = "ctrl.rest.cert.file", default)]
    pub ctrl_rest_cert_file: Option<PathBuf>,
    #[serde(rename = "ctrl.rest.authz.file", default)]
    pub ctrl_rest_authz_file: Option<PathBuf>,
    #[serde(default = "default_dpid")]
    pub dpid: u64,
    #[serde(default)]
    pub terminals: Vec<TerminalSeed>,
}

/// Load and parse a configuration file.
pub fn load(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_owned(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

/// A built agent: the network it exposes and, for recovery, its fabric.
pub struct BuiltAgent {
    pub network: Arc<Network>,
    pub fabric: Arc<CorsaFabric>,
}

impl std::fmt::Debug for BuiltAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltAgent").finish_non_exhaustive()
    }
}

/// The static agent factory registry.
pub async fn build_agent(agent: &AgentConfig) -> Result<BuiltAgent, ConfigError> {
    let mode = match agent.kind {
        AgentType::CorsaBrPerLink => Realization::PerLink,
        AgentType::CorsaSharedBr => Realization::Shared,
        other => {
            return Err(ConfigError::UnsupportedAgent(
                agent.name.clone(),
                other.as_str().to_owned(),
            ))
        }
    };

    let rest_location = agent
        .rest_location
        .as_deref()
        .ok_or(ConfigError::MissingKey {
            agent: agent.name.clone(),
            key: "rest.location",
        })?;
    let rest_cert = read_opt(agent.rest_cert_file.as_deref())?;
    let rest_authz = read_authz(&agent.name, agent.rest_authz_file.as_deref())?;
    let rest = CorsaRest::new(rest_location, rest_cert.as_deref(), &rest_authz).map_err(
        |source| ConfigError::Client {
            agent: agent.name.clone(),
            source,
        },
    )?;

    let ctrl = match (mode, agent.ctrl_rest_location.as_deref()) {
        (Realization::Shared, Some(location)) => {
            let cert = read_opt(agent.ctrl_rest_cert_file.as_deref())?;
            let authz = read_authz(&agent.name, agent.ctrl_rest_authz_file.as_deref())?;
            let client = PortSliceCtrl::new(location, cert.as_deref(), &authz).map_err(
                |source| ConfigError::Client {
                    agent: agent.name.clone(),
                    source,
                },
            )?;
            Some(Arc::new(client) as Arc<dyn crate::fabric::ctrl::CtrlRest>)
        }
        (Realization::Shared, None) => {
            return Err(ConfigError::MissingKey {
                agent: agent.name.clone(),
                key: "ctrl.rest.location",
            })
        }
        (Realization::PerLink, _) => None,
    };

    let controller = match (&agent.ctrl_host, agent.ctrl_port) {
        (Some(host), Some(port)) => Some(ControllerTarget {
            host: host.clone(),
            port,
        }),
        _ => None,
    };

    let cfg = FabricConfig {
        mode,
        descr_prefix: agent.descr_prefix.clone(),
        partial_suffix: agent.descr_partial.clone(),
        complete_suffix: agent.descr_complete.clone(),
        destroy_unrecognized: agent.descr_destroy,
        shaping: agent.shaping,
        metering: agent.metering,
        dpid: agent.dpid,
        subtype: agent.subtype.clone(),
        resources: agent.resources,
        netns: agent.ctrl_netns.clone(),
        controller,
        max_bridges: agent.capacity_bridges,
        caps: PortCaps {
            ports: agent.capacity_ports,
            lags: agent.capacity_lags,
        },
        ..FabricConfig::default()
    };

    let fabric = Arc::new(CorsaFabric::new(Arc::new(rest), ctrl, cfg));
    let network = Arc::new(Network::new(
        &agent.name,
        NetworkKind::Switch,
        fabric.clone(),
    ));
    for seed in &agent.terminals {
        let labels = match (seed.min_label, seed.max_label) {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            (Some(lo), None) => Some((lo, u32::MAX)),
            (None, Some(hi)) => Some((0, hi)),
            (None, None) => None,
        };
        network
            .add_terminal(
                &seed.name,
                &seed.config,
                seed.ingress_limit,
                seed.egress_limit,
                labels,
            )
            .await
            .map_err(|fault| ConfigError::Terminal {
                agent: agent.name.clone(),
                terminal: seed.name.clone(),
                fault,
            })?;
    }
    info!(agent = %agent.name, kind = agent.kind.as_str(), "agent built");
    Ok(BuiltAgent { network, fabric })
}

fn read_opt(path: Option<&Path>) -> Result<Option<Vec<u8>>, ConfigError> {
    path.map(|p| {
        std::fs::read(p).map_err(|source| ConfigError::Io {
            path: p.to_owned(),
            source,
        })
    })
    .transpose()
}

fn read_authz(agent: &str, path: Option<&Path>) -> Result<String, ConfigError> {
    match path {
        Some(p) => std::fs::read_to_string(p)
            .map(|s| s.trim().to_owned())
            .map_err(|source| ConfigError::Io {
                path: p.to_owned(),
                source,
            }),
        None => Err(ConfigError::MissingKey {
            agent: agent.to_owned(),
            key: "rest.authz.file",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [program]
        name = "patchbay"

        [network.config]
        server = "127.0.0.1:4753"

        [[agents]]
        name = "slough"
        type = "corsa-dp2x00-sharedbr"
        "description.prefix" = "patchbay:vc:"
        "description.destroy" = true
        "capacity.bridges" = 30
        "rest.location" = "https://10.0.0.2/api/v1/"
        "rest.authz.file" = "/etc/patchbay/slough.authz"
        "ctrl.rest.location" = "https://10.0.0.3/"
        "ctrl.host" = "10.0.0.3"
        "ctrl.port" = 6653
        dpid = 256
        terminals = [{ name = "t1", config = "phys.3" }]

        [[agents]]
        name = "fell"
        type = "ssh-switch"
    "#;

    #[test]
    fn sample_parses() {
        let cfg: BrokerConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.program.name.as_deref(), Some("patchbay"));
        assert_eq!(cfg.network.config.server.as_deref(), Some("127.0.0.1:4753"));
        assert_eq!(cfg.agents.len(), 2);

        let slough = &cfg.agents[0];
        assert_eq!(slough.kind, AgentType::CorsaSharedBr);
        assert_eq!(slough.descr_prefix, "patchbay:vc:");
        assert!(slough.descr_destroy);
        assert_eq!(slough.capacity_bridges, 30);
        assert_eq!(slough.capacity_ports, 32, "default applies");
        assert_eq!(slough.dpid, 256);
        assert_eq!(slough.terminals.len(), 1);
        assert_eq!(cfg.agents[1].kind, AgentType::SshSwitch);
    }

    #[tokio::test]
    async fn ssh_agents_are_not_built_here() {
        let cfg: BrokerConfig = toml::from_str(SAMPLE).unwrap();
        let err = build_agent(&cfg.agents[1]).await.unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedAgent(_, _)));
    }

    #[tokio::test]
    async fn corsa_agents_need_a_rest_location() {
        let mut cfg: BrokerConfig = toml::from_str(SAMPLE).unwrap();
        cfg.agents[0].rest_location = None;
        let err = build_agent(&cfg.agents[0]).await.unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingKey {
                key: "rest.location",
                ..
            }
        ));
    }
}
