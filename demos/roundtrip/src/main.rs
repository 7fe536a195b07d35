//! Walk one service through its whole lifecycle against a running broker:
//!
//! ```sh
//! patchbayd -c patchbay.toml &
//! roundtrip 127.0.0.1:4753 slough t1 100 t2 200
//! ```

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;

use patchbay::client::{Access, AccessOptions};
use patchbay::model::Endpoint;
use patchbay::service::ServiceStatus;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().context("usage: roundtrip ADDR NETWORK T1 L1 T2 L2")?;
    let network = args.next().context("missing network name")?;
    let t1 = args.next().context("missing first terminal")?;
    let l1: u32 = args.next().context("missing first label")?.parse()?;
    let t2 = args.next().context("missing second terminal")?;
    let l2: u32 = args.next().context("missing second label")?.parse()?;

    let stream = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connecting {}", addr))?;
    let access = Access::connect(stream, &network, &AccessOptions::control(&network)).await?;
    println!("terminals: {:?}", access.terminals().await?);

    let service = access.new_service(None).await?;
    println!("service {}", service.id());

    let mut watch = service.watch().await?;
    service
        .define(&[
            Endpoint {
                terminal: t1,
                label: l1,
                ingress: 10.0,
                egress: 10.0,
            },
            Endpoint {
                terminal: t2,
                label: l2,
                ingress: 10.0,
                egress: 10.0,
            },
        ])
        .await?;

    let status = service
        .await_status(
            &HashSet::from([ServiceStatus::Inactive, ServiceStatus::Failed]),
            Duration::from_secs(10),
        )
        .await?;
    anyhow::ensure!(status == ServiceStatus::Inactive, "define ended in {}", status);

    service.activate().await?;
    let status = service
        .await_status(
            &HashSet::from([ServiceStatus::Active, ServiceStatus::Failed]),
            Duration::from_secs(30),
        )
        .await?;
    anyhow::ensure!(status == ServiceStatus::Active, "activate ended in {}", status);
    println!("service is up; releasing");

    service.release().await?;
    while let Some(status) = watch.next().await {
        println!("status: {}", status?);
    }
    access.close().await;
    Ok(())
}
