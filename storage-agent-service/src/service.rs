use std::collections::HashMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::debug;

use storage_agent_core::{AgentError, AgentRegistry, Record};

use crate::pb;

/// The gRPC host-management surface. Every request threads its secrets
/// through the agent registry; the driver core does the rest.
pub struct StorageAgentService {
    registry: Arc<AgentRegistry>,
}

impl StorageAgentService {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        StorageAgentService { registry }
    }
}

/// The array credentials carried in a request's `secrets` map.
#[derive(Debug)]
struct Secrets {
    endpoint: String,
    username: String,
    password: String,
}

fn read_secrets(secrets: &HashMap<String, String>) -> Result<Secrets, Status> {
    let get = |key: &str| {
        secrets
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| Status::invalid_argument(format!("secret \"{key}\" is missing")))
    };
    Ok(Secrets {
        endpoint: get("management_address")?,
        username: get("username")?,
        password: get("password")?,
    })
}

fn to_status(err: AgentError) -> Status {
    if err.is_credentials_error() {
        Status::unauthenticated(err.to_string())
    } else if err.is_connection_error() {
        Status::unavailable(err.to_string())
    } else if matches!(err, AgentError::Spec(_)) {
        Status::invalid_argument(err.to_string())
    } else {
        Status::internal(err.to_string())
    }
}

fn to_host(record: &Record, array: &str) -> pb::Host {
    pb::Host {
        identifier: record.text("id").unwrap_or_default().to_string(),
        name: record.text("name").unwrap_or_default().to_string(),
        status: record.text("status").unwrap_or_default().to_string(),
        array: array.to_string(),
        iqns: Vec::new(),
        wwpns: Vec::new(),
    }
}

#[tonic::async_trait]
impl pb::storage_agent_server::StorageAgent for StorageAgentService {
    async fn create_host(
        &self,
        request: Request<pb::CreateHostRequest>,
    ) -> Result<Response<pb::CreateHostReply>, Status> {
        let request = request.into_inner();
        let secrets = read_secrets(&request.secrets)?;
        let agent = self
            .registry
            .get_agent(&secrets.endpoint, &secrets.username, &secrets.password)
            .await;

        agent
            .create_host(&request.name, &request.iqns, &request.wwpns)
            .await
            .map_err(to_status)?;

        let hosts = agent.get_hosts(&request.name).await.map_err(to_status)?;
        let host = hosts.first().map(|record| {
            let mut host = to_host(record, &secrets.endpoint);
            host.iqns = request.iqns.clone();
            host.wwpns = request.wwpns.clone();
            host
        });
        debug!(host = %request.name, found = host.is_some(), "create host finished");
        Ok(Response::new(pb::CreateHostReply { host }))
    }

    async fn delete_host(
        &self,
        request: Request<pb::DeleteHostRequest>,
    ) -> Result<Response<pb::DeleteHostReply>, Status> {
        let request = request.into_inner();
        let secrets = read_secrets(&request.secrets)?;
        let agent = self
            .registry
            .get_agent(&secrets.endpoint, &secrets.username, &secrets.password)
            .await;

        agent.delete_host(&request.name).await.map_err(to_status)?;
        Ok(Response::new(pb::DeleteHostReply {}))
    }

    async fn list_hosts(
        &self,
        request: Request<pb::ListHostsRequest>,
    ) -> Result<Response<pb::ListHostsReply>, Status> {
        let request = request.into_inner();
        let secrets = read_secrets(&request.secrets)?;
        let agent = self
            .registry
            .get_agent(&secrets.endpoint, &secrets.username, &secrets.password)
            .await;

        let hosts = agent.get_hosts(&request.name).await.map_err(to_status)?;
        Ok(Response::new(pb::ListHostsReply {
            hosts: hosts
                .iter()
                .map(|record| to_host(record, &secrets.endpoint))
                .collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets_map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn secrets_must_be_complete() {
        let full = secrets_map(&[
            ("management_address", "array1"),
            ("username", "admin"),
            ("password", "pw"),
        ]);
        let secrets = read_secrets(&full).unwrap();
        assert_eq!(secrets.endpoint, "array1");
        assert_eq!(secrets.username, "admin");

        let partial = secrets_map(&[("management_address", "array1")]);
        let status = read_secrets(&partial).unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let empty_value = secrets_map(&[
            ("management_address", "array1"),
            ("username", ""),
            ("password", "pw"),
        ]);
        assert!(read_secrets(&empty_value).is_err());
    }

    #[test]
    fn errors_map_onto_grpc_codes() {
        let status = to_status(AgentError::IncorrectCredentials("Authentication failed".into()));
        assert_eq!(status.code(), tonic::Code::Unauthenticated);

        let status = to_status(AgentError::NoSpecification);
        assert_eq!(status.code(), tonic::Code::Unavailable);

        let status = to_status(AgentError::Spec("bad argument".into()));
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let err = AgentError::CliFailure {
            message: "CLI failure. Return code is 1. Error message is \"CMMVC5804E\"".into(),
            return_code: 1,
        };
        let status = to_status(err);
        assert_eq!(status.code(), tonic::Code::Internal);
        // The vendor code stays visible to upstream observers.
        assert!(status.message().contains("CMMVC5804E"));
    }

    #[test]
    fn records_map_onto_host_messages() {
        let mut record = Record::new();
        record.append("id", "0");
        record.append("name", "host1");
        record.append("status", "online");
        let host = to_host(&record, "array1");
        assert_eq!(host.identifier, "0");
        assert_eq!(host.name, "host1");
        assert_eq!(host.status, "online");
        assert_eq!(host.array, "array1");
    }
}
