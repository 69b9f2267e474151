//! # Arith demo
//!
//! Runs the whole prpc stack in one process over loopback TCP:
//!
//! 1. an `Arith` server (index 1, version `v1.0`) registers itself
//! 2. a client subscribes and calls `Arith.Multiply(2, 3)`
//! 3. a second server (index 2, version `v1.1`) comes up and is discovered
//! 4. a client with every version selected spreads calls over both servers
//! 5. the second server goes away and the client falls back to the first
//!
//! ## Usage
//!
//! ```bash
//! arith-demo --calls 100 --select round-robin
//! RUST_LOG=debug arith-demo
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use argh::FromArgs;
use prpc_client::{Client, ClientConfig, SelectType, ServiceClient, ServiceOption};
use prpc_registry::{MemoryRemote, NodeOptions, Registry};
use prpc_server::{Server, ServerConfig};

const GROUP: &str = "zone1";

#[derive(FromArgs)]
/// prpc arith demo
struct Args {
    /// number of calls spread over all versions
    #[argh(option, short = 'n', default = "100")]
    calls: usize,

    /// selection algorithm: random, weighted-random, round-robin
    #[argh(option, short = 's', default = "SelectType::RoundRobin")]
    select: SelectType,

    /// print the service metrics as JSON at the end
    #[argh(switch)]
    metrics: bool,
}

async fn start_server(registry: &Arc<Registry>, index: u32, version: &str) -> Result<Server> {
    let server = Server::new(ServerConfig {
        group: GROUP.to_string(),
        index,
        node: NodeOptions::default().with_version(version),
        ..Default::default()
    })?;
    server.handle("Arith", "Multiply", |(a, b): (i64, i64)| async move { Ok(a * b) })?;
    server.handle("Arith", "Divide", |(a, b): (i64, i64)| async move {
        if b == 0 {
            return Err("divide by zero".to_string());
        }
        Ok(a / b)
    })?;
    server.handle("Arith", "Whoami", move |_: ()| async move { Ok(index) })?;

    let addr = server.serve("127.0.0.1:0", registry.clone()).await?;
    tracing::info!(index, version, addr = %addr, "arith server up");
    Ok(server)
}

async fn wait_for_endpoints(service: &ServiceClient, count: usize) -> Result<()> {
    for _ in 0..500 {
        if service.endpoints().len() == count {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!(
        "{} has {} endpoints, expected {}",
        service.service(),
        service.endpoints().len(),
        count
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let registry = Arc::new(Registry::new(Arc::new(MemoryRemote::new())));
    let first = start_server(&registry, 1, "v1.0").await?;
    let client = Client::new(registry.clone(), ClientConfig::default());

    let arith = client.service("Arith", GROUP, []).await?;
    let product: i64 = arith.call("Multiply", &(2, 3)).await?;
    println!("Arith.Multiply(2, 3) = {}", product);
    if let Err(err) = arith.call::<_, i64>("Divide", &(1, 0)).await {
        println!("Arith.Divide(1, 0) failed: {}", err);
    }

    let second = start_server(&registry, 2, "v1.1").await?;
    wait_for_endpoints(&arith, 2).await?;

    let all = client
        .service(
            "Arith",
            GROUP,
            [ServiceOption::VersionAll, ServiceOption::SelectType(args.select)],
        )
        .await?;

    let mut hits: BTreeMap<u32, usize> = BTreeMap::new();
    for _ in 0..args.calls {
        let index: u32 = all.call("Whoami", &()).await?;
        *hits.entry(index).or_default() += 1;
    }
    println!("{} calls with {} selection:", args.calls, args.select);
    for (index, count) in &hits {
        println!("  server {}: {}", index, count);
    }

    second.shutdown().await;
    wait_for_endpoints(&all, 1).await?;
    let index: u32 = all.call("Whoami", &()).await?;
    println!("after server 2 left, calls go to server {}", index);

    if args.metrics {
        for service in client.services() {
            println!("{}", serde_json::to_string_pretty(&service.metrics())?);
        }
    }

    first.shutdown().await;
    client.close().await;
    Ok(())
}
