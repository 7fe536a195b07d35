//! The switch's REST surface.
//!
//! [`SwitchRest`] is the seam the fabric manager drives; [`CorsaRest`] is the
//! production client. All requests carry the bearer token and, when a pinned
//! certificate is configured, verify TLS against it alone. Idempotent GETs
//! are retried a bounded number of times with linear backoff; mutations are
//! never retried.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::fault::Fault;

const GET_ATTEMPTS: u32 = 3;
const BACKOFF_STEP: Duration = Duration::from_millis(500);

/// One tunnel attachment on a bridge.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelDesc {
    pub ofport: u32,
    pub port: String,
    #[serde(rename = "vlan-id", default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
    #[serde(rename = "inner-vlan-id", default, skip_serializing_if = "Option::is_none")]
    pub inner_vlan_id: Option<u16>,
    #[serde(rename = "shaped-rate", default, skip_serializing_if = "Option::is_none")]
    pub shaped_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descr: Option<String>,
}

/// A bridge as described by the switch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeDesc {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub descr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<u32>,
}

/// Parameters for bridge creation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BridgeCreate {
    pub descr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netns: Option<String>,
}

/// An OpenFlow controller endpoint a bridge should speak to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerTarget {
    #[serde(rename = "ip")]
    pub host: String,
    pub port: u16,
}

/// Typed access to the switch.
#[async_trait]
pub trait SwitchRest: Send + Sync + 'static {
    /// `POST` a new bridge; returns its name.
    async fn create_bridge(&self, req: &BridgeCreate) -> Result<String, Fault>;
    /// `DELETE` a bridge. Succeeds if it was already gone.
    async fn destroy_bridge(&self, bridge: &str) -> Result<(), Fault>;
    /// `PATCH` a bridge's description.
    async fn patch_bridge_descr(&self, bridge: &str, descr: &str) -> Result<(), Fault>;
    /// Point a bridge at an OpenFlow controller.
    async fn attach_controller(&self, bridge: &str, target: &ControllerTarget)
        -> Result<(), Fault>;
    /// Attach a tunnel; returns the OF port actually assigned.
    async fn attach_tunnel(&self, bridge: &str, tunnel: &TunnelDesc) -> Result<u32, Fault>;
    /// Set the ingress meter of a tunnel.
    async fn patch_tunnel_meter(
        &self,
        bridge: &str,
        ofport: u32,
        cir_kbps: u64,
        cbs_bytes: u64,
    ) -> Result<(), Fault>;
    /// Detach a tunnel. Succeeds if it was already gone.
    async fn detach_tunnel(&self, bridge: &str, ofport: u32) -> Result<(), Fault>;
    /// Enumerate a bridge's tunnels by OF port.
    async fn tunnels(&self, bridge: &str) -> Result<BTreeMap<u32, TunnelDesc>, Fault>;
    /// Enumerate bridge names.
    async fn bridge_names(&self) -> Result<Vec<String>, Fault>;
    /// Describe one bridge.
    async fn bridge_desc(&self, bridge: &str) -> Result<BridgeDesc, Fault>;
}

/// The production client for a Corsa DP2X00-series switch.
pub struct CorsaRest {
    http: reqwest::Client,
    base: Url,
    authz: String,
}

impl CorsaRest {
    /// `location` is the API root, e.g. `https://10.0.0.2/api/v1/`.
    pub fn new(location: &str, cert_pem: Option<&[u8]>, authz: &str) -> Result<CorsaRest, crate::Error> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(pem) = cert_pem {
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(Certificate::from_pem(pem)?);
        }
        Ok(CorsaRest {
            http: builder.build()?,
            base: Url::parse(location)?,
            authz: authz.trim().to_owned(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, Fault> {
        self.base
            .join(path)
            .map_err(|e| Fault::network_mgmt(format!("bad switch url {:?}: {}", path, e)))
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response, Fault> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .http
                .get(url.clone())
                .bearer_auth(&self.authz)
                .send()
                .await
            {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < GET_ATTEMPTS && (e.is_timeout() || e.is_connect()) => {
                    warn!(%url, attempt, error = %e, "switch GET failed; retrying");
                    tokio::time::sleep(BACKOFF_STEP * attempt).await;
                }
                Err(e) => return Err(Fault::network_mgmt(format!("switch unreachable: {}", e))),
            }
        }
    }

    fn check(
        context: &str,
        resp: &reqwest::Response,
        not_found_ok: bool,
    ) -> Result<(), Fault> {
        let status = resp.status();
        if status.is_success() || (not_found_ok && status == StatusCode::NOT_FOUND) {
            return Ok(());
        }
        Err(Fault::network_mgmt(format!(
            "switch returned {} for {}",
            status, context
        )))
    }
}

#[derive(Deserialize)]
struct CreatedBridge {
    name: String,
}

#[derive(Deserialize)]
struct AttachedTunnel {
    ofport: u32,
}

#[async_trait]
impl SwitchRest for CorsaRest {
    async fn create_bridge(&self, req: &BridgeCreate) -> Result<String, Fault> {
        let url = self.url("bridges")?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.authz)
            .json(req)
            .send()
            .await
            .map_err(|e| Fault::network_mgmt(format!("switch unreachable: {}", e)))?;
        Self::check("create bridge", &resp, false)?;
        let created: CreatedBridge = resp
            .json()
            .await
            .map_err(|e| Fault::network_mgmt(format!("bad create-bridge response: {}", e)))?;
        debug!(bridge = %created.name, "bridge created");
        Ok(created.name)
    }

    async fn destroy_bridge(&self, bridge: &str) -> Result<(), Fault> {
        let url = self.url(&format!("bridges/{}", bridge))?;
        let resp = self
            .http
            .delete(url)
            .bearer_auth(&self.authz)
            .send()
            .await
            .map_err(|e| Fault::network_mgmt(format!("switch unreachable: {}", e)))?;
        Self::check("destroy bridge", &resp, true)?;
        debug!(bridge, "bridge destroyed");
        Ok(())
    }

    async fn patch_bridge_descr(&self, bridge: &str, descr: &str) -> Result<(), Fault> {
        let url = self.url(&format!("bridges/{}", bridge))?;
        let resp = self
            .http
            .patch(url)
            .bearer_auth(&self.authz)
            .json(&serde_json::json!({ "descr": descr }))
            .send()
            .await
            .map_err(|e| Fault::network_mgmt(format!("switch unreachable: {}", e)))?;
        Self::check("patch bridge", &resp, false)
    }

    async fn attach_controller(
        &self,
        bridge: &str,
        target: &ControllerTarget,
    ) -> Result<(), Fault> {
        let url = self.url(&format!("bridges/{}/controllers", bridge))?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.authz)
            .json(target)
            .send()
            .await
            .map_err(|e| Fault::network_mgmt(format!("switch unreachable: {}", e)))?;
        Self::check("attach controller", &resp, false)
    }

    async fn attach_tunnel(&self, bridge: &str, tunnel: &TunnelDesc) -> Result<u32, Fault> {
        let url = self.url(&format!("bridges/{}/tunnels", bridge))?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.authz)
            .json(tunnel)
            .send()
            .await
            .map_err(|e| Fault::network_mgmt(format!("switch unreachable: {}", e)))?;
        Self::check("attach tunnel", &resp, false)?;
        let attached: AttachedTunnel = resp
            .json()
            .await
            .map_err(|e| Fault::network_mgmt(format!("bad attach-tunnel response: {}", e)))?;
        debug!(bridge, ofport = attached.ofport, "tunnel attached");
        Ok(attached.ofport)
    }

    async fn patch_tunnel_meter(
        &self,
        bridge: &str,
        ofport: u32,
        cir_kbps: u64,
        cbs_bytes: u64,
    ) -> Result<(), Fault> {
        let url = self.url(&format!("bridges/{}/tunnels/{}", bridge, ofport))?;
        let resp = self
            .http
            .patch(url)
            .bearer_auth(&self.authz)
            .json(&serde_json::json!({ "cir": cir_kbps, "cbs": cbs_bytes }))
            .send()
            .await
            .map_err(|e| Fault::network_mgmt(format!("switch unreachable: {}", e)))?;
        Self::check("patch tunnel meter", &resp, false)
    }

    async fn detach_tunnel(&self, bridge: &str, ofport: u32) -> Result<(), Fault> {
        let url = self.url(&format!("bridges/{}/tunnels/{}", bridge, ofport))?;
        let resp = self
            .http
            .delete(url)
            .bearer_auth(&self.authz)
            .send()
            .await
            .map_err(|e| Fault::network_mgmt(format!("switch unreachable: {}", e)))?;
        Self::check("detach tunnel", &resp, true)?;
        debug!(bridge, ofport, "tunnel detached");
        Ok(())
    }

    async fn tunnels(&self, bridge: &str) -> Result<BTreeMap<u32, TunnelDesc>, Fault> {
        let url = self.url(&format!("bridges/{}/tunnels", bridge))?;
        let resp = self.get(url).await?;
        Self::check("list tunnels", &resp, false)?;
        let raw: BTreeMap<String, TunnelDesc> = resp
            .json()
            .await
            .map_err(|e| Fault::network_mgmt(format!("bad tunnel list: {}", e)))?;
        let mut tunnels = BTreeMap::new();
        for (ofport, desc) in raw {
            let ofport = ofport
                .parse()
                .map_err(|_| Fault::network_mgmt(format!("bad ofport key {:?}", ofport)))?;
            tunnels.insert(ofport, desc);
        }
        Ok(tunnels)
    }

    async fn bridge_names(&self) -> Result<Vec<String>, Fault> {
        let url = self.url("bridges")?;
        let resp = self.get(url).await?;
        Self::check("list bridges", &resp, false)?;
        resp.json()
            .await
            .map_err(|e| Fault::network_mgmt(format!("bad bridge list: {}", e)))
    }

    async fn bridge_desc(&self, bridge: &str) -> Result<BridgeDesc, Fault> {
        let url = self.url(&format!("bridges/{}", bridge))?;
        let resp = self.get(url).await?;
        Self::check("describe bridge", &resp, false)?;
        resp.json()
            .await
            .map_err(|e| Fault::network_mgmt(format!("bad bridge description: {}", e)))
    }
}
