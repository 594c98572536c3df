use std::sync::Arc;

use tracing::{debug, info};

use crate::clispec::{Args, CommandOutput};
use crate::codes::ErrorPreprocessor;
use crate::error::{AgentError, Result};
use crate::pool::{ClientConnector, SshConnector, SshPool};
use crate::record::Record;
use crate::transport::ConnectOptions;

const POOL_MIN_SIZE: usize = 1;
const POOL_MAX_SIZE: usize = 5;

/// Per-(endpoint, user) agent owning one SSH pool and the host-management
/// façade. Connections are created lazily on first checkout.
pub struct StorageAgent {
    endpoint: String,
    username: String,
    password: String,
    pool: SshPool,
}

impl StorageAgent {
    pub fn new(endpoint: &str, username: &str, password: &str) -> StorageAgent {
        let options = ConnectOptions {
            username: username.to_string(),
            password: Some(password.to_string()),
            ..ConnectOptions::new(endpoint)
        };
        StorageAgent::with_connector(
            endpoint,
            username,
            password,
            Box::new(SshConnector::new(options)),
        )
    }

    /// Build an agent over a custom connector (embedding, testing).
    pub fn with_connector(
        endpoint: &str,
        username: &str,
        password: &str,
        connector: Box<dyn ClientConnector>,
    ) -> StorageAgent {
        StorageAgent {
            endpoint: endpoint.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            pool: SshPool::new(connector, POOL_MIN_SIZE, POOL_MAX_SIZE),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password_matches(&self, password: &str) -> bool {
        self.password == password
    }

    pub fn pool(&self) -> &SshPool {
        &self.pool
    }

    /// Close every pooled connection.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Create a host object on the array.
    ///
    /// Fibre-channel ports win when both kinds are supplied. A real
    /// failure triggers a best-effort cleanup of the half-created host
    /// before the original error is re-raised.
    pub async fn create_host(
        &self,
        name: &str,
        iscsi_ports: &[String],
        fc_ports: &[String],
    ) -> Result<()> {
        info!(host = name, "creating host");
        let mut args = Args::new().arg("name", name);
        if !fc_ports.is_empty() {
            args.set("fcwwpn", fc_ports.join(","));
        } else if !iscsi_ports.is_empty() {
            args.set("iscsiname", iscsi_ports.join(","));
        }

        match self.run_command("svctask", "mkhost", &args).await {
            Ok(_) => {
                info!(host = name, "created host");
                Ok(())
            }
            Err(err) if matches!(err, AgentError::CliFailure { .. }) => {
                let (is_real, _code) = ErrorPreprocessor::new(false).process(&err);
                if !is_real {
                    return Ok(());
                }
                if let Err(cleanup) = self.delete_host(name).await {
                    debug!(
                        host = name,
                        error = %cleanup,
                        "cleanup after failed host creation also failed"
                    );
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Delete a host object; a host that is already gone counts as
    /// success.
    pub async fn delete_host(&self, name: &str) -> Result<()> {
        info!(host = name, "deleting host");
        let args = Args::new().arg("host_name", name);
        match self.run_command("svctask", "rmhost", &args).await {
            Ok(_) => {
                info!(host = name, "deleted host");
                Ok(())
            }
            Err(err) if matches!(err, AgentError::CliFailure { .. }) => {
                let (is_real, _code) = ErrorPreprocessor::new(true).process(&err);
                if is_real {
                    Err(err)
                } else {
                    Ok(())
                }
            }
            Err(err) => Err(err),
        }
    }

    /// List host objects, optionally filtered by name.
    ///
    /// Records are materialized before the pooled client is released.
    pub async fn get_hosts(&self, name: &str) -> Result<Vec<Record>> {
        if name.is_empty() {
            info!("listing hosts");
        } else {
            info!(host = name, "listing host");
        }
        let mut args = Args::new();
        if !name.is_empty() {
            args.set("filtervalue", format!("name={name}"));
        }
        let output = self.run_command("svcinfo", "lshost", &args).await?;
        Ok(output
            .into_response()
            .map(|resp| resp.as_list())
            .unwrap_or_default())
    }

    async fn run_command(&self, namespace: &str, name: &str, args: &Args) -> Result<CommandOutput> {
        let mut client = self.pool.get().await?;
        client.run(namespace, name, args).await
    }
}

/// Long-lived cache of agents keyed by (endpoint, username).
///
/// Constructed at service start and shared with request handlers; lookups
/// are serialized so concurrent requests for the same key cannot create
/// duplicate agents. Presenting a different password evicts the stale
/// agent and closes its pool.
#[derive(Default)]
pub struct AgentRegistry {
    agents: tokio::sync::Mutex<Vec<Arc<StorageAgent>>>,
}

impl AgentRegistry {
    pub fn new() -> AgentRegistry {
        AgentRegistry::default()
    }

    pub async fn get_agent(
        &self,
        endpoint: &str,
        username: &str,
        password: &str,
    ) -> Arc<StorageAgent> {
        let mut agents = self.agents.lock().await;
        if let Some(pos) = agents
            .iter()
            .position(|a| a.endpoint() == endpoint && a.username() == username)
        {
            if agents[pos].password_matches(password) {
                return Arc::clone(&agents[pos]);
            }
            let stale = agents.remove(pos);
            info!(endpoint, username, "password changed, evicting stale agent");
            stale.shutdown().await;
        }
        debug!(endpoint, username, "registering new agent");
        let agent = Arc::new(StorageAgent::new(endpoint, username, password));
        agents.push(Arc::clone(&agent));
        agent
    }

    pub async fn len(&self) -> usize {
        self.agents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.lock().await.is_empty()
    }

    /// Evict every agent and close its pool.
    pub async fn clear(&self) {
        let drained: Vec<Arc<StorageAgent>> = {
            let mut agents = self.agents.lock().await;
            agents.drain(..).collect()
        };
        for agent in drained {
            agent.shutdown().await;
        }
    }
}
