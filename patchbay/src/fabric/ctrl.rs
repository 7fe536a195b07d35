//! The OpenFlow controller's REST surface, used in the shared-VFC mode.
//!
//! The controller's unit of configuration is the *port set*: the set of OF
//! ports forming one L2 broadcast domain. Posting a list of sets supersedes
//! any existing set containing a listed port.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::fault::Fault;

const GET_ATTEMPTS: u32 = 3;
const BACKOFF_STEP: Duration = Duration::from_millis(500);

/// Typed access to the port-set controller.
#[async_trait]
pub trait CtrlRest: Send + Sync + 'static {
    /// Replace the sets of any listed port; returns the accepted sets.
    async fn define_port_sets(
        &self,
        dpid: u64,
        slices: &[BTreeSet<u32>],
    ) -> Result<Vec<BTreeSet<u32>>, Fault>;
    /// Fetch the controller's current sets for a datapath.
    async fn port_sets(&self, dpid: u64) -> Result<Vec<BTreeSet<u32>>, Fault>;
}

/// The production port-set controller client.
pub struct PortSliceCtrl {
    http: reqwest::Client,
    base: Url,
    authz: String,
}

impl PortSliceCtrl {
    pub fn new(location: &str, cert_pem: Option<&[u8]>, authz: &str) -> Result<PortSliceCtrl, crate::Error> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(pem) = cert_pem {
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(Certificate::from_pem(pem)?);
        }
        Ok(PortSliceCtrl {
            http: builder.build()?,
            base: Url::parse(location)?,
            authz: authz.trim().to_owned(),
        })
    }

    fn url(&self, dpid: u64) -> Result<Url, Fault> {
        self.base
            .join(&format!("slices/{:016x}", dpid))
            .map_err(|e| Fault::network_mgmt(format!("bad controller url: {}", e)))
    }
}

#[derive(Deserialize)]
struct SliceReply {
    slices: Vec<BTreeSet<u32>>,
}

#[async_trait]
impl CtrlRest for PortSliceCtrl {
    async fn define_port_sets(
        &self,
        dpid: u64,
        slices: &[BTreeSet<u32>],
    ) -> Result<Vec<BTreeSet<u32>>, Fault> {
        let url = self.url(dpid)?;
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.authz)
            .json(&serde_json::json!({ "slices": slices }))
            .send()
            .await
            .map_err(|e| Fault::network_mgmt(format!("controller unreachable: {}", e)))?;
        if !resp.status().is_success() {
            return Err(Fault::network_mgmt(format!(
                "controller returned {} defining port sets",
                resp.status()
            )));
        }
        let reply: SliceReply = resp
            .json()
            .await
            .map_err(|e| Fault::network_mgmt(format!("bad controller reply: {}", e)))?;
        debug!(dpid, sets = reply.slices.len(), "port sets defined");
        Ok(reply.slices)
    }

    async fn port_sets(&self, dpid: u64) -> Result<Vec<BTreeSet<u32>>, Fault> {
        let url = self.url(dpid)?;
        let mut attempt = 0;
        let resp = loop {
            attempt += 1;
            match self
                .http
                .get(url.clone())
                .bearer_auth(&self.authz)
                .send()
                .await
            {
                Ok(resp) => break resp,
                Err(e) if attempt < GET_ATTEMPTS && (e.is_timeout() || e.is_connect()) => {
                    warn!(dpid, attempt, error = %e, "controller GET failed; retrying");
                    tokio::time::sleep(BACKOFF_STEP * attempt).await;
                }
                Err(e) => {
                    return Err(Fault::network_mgmt(format!("controller unreachable: {}", e)))
                }
            }
        };
        if !resp.status().is_success() {
            return Err(Fault::network_mgmt(format!(
                "controller returned {} listing port sets",
                resp.status()
            )));
        }
        let reply: SliceReply = resp
            .json()
            .await
            .map_err(|e| Fault::network_mgmt(format!("bad controller reply: {}", e)))?;
        Ok(reply.slices)
    }
}
