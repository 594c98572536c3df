mod service;

use std::sync::Arc;

use clap::Parser;
use tonic::transport::Server;
use tonic_reflection::server::Builder as ReflectionBuilder;
use tracing::info;

use storage_agent_core::AgentRegistry;

pub mod pb {
    tonic::include_proto!("storageagent");

    pub(crate) const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("storageagent_descriptor");
}

#[derive(Parser, Debug)]
#[command(
    name = "storage-agent-service",
    about = "Host-management gateway for block-storage arrays"
)]
struct Cli {
    /// Listen address, e.g. "0.0.0.0:50051".
    #[arg(long = "endpoint", env = "ENDPOINT")]
    endpoint: String,

    /// Upper bound on requests served concurrently per connection.
    #[arg(long = "workers", env = "WORKERS", default_value_t = 10)]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let addr: std::net::SocketAddr = cli.endpoint.parse()?;

    let registry = Arc::new(AgentRegistry::new());
    let agent_service = service::StorageAgentService::new(Arc::clone(&registry));

    let reflection_service = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(pb::FILE_DESCRIPTOR_SET)
        .build_v1()?;

    info!(%addr, "starting server");
    Server::builder()
        .concurrency_limit_per_connection(cli.workers)
        .add_service(reflection_service)
        .add_service(pb::storage_agent_server::StorageAgentServer::new(
            agent_service,
        ))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    // Close every pooled SSH session before exiting.
    registry.clear().await;
    info!("server is stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
