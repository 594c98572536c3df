use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clispec::{Args, CliSpec, CommandOutput};
use crate::error::{AgentError, Result};
use crate::response::RawOutput;
use crate::specparse::{self, ParseOptions};
use crate::transport::{ConnectOptions, SshTransport, Transport};

/// Minimal specification used only to probe an array for its device type
/// and version before the real spec is selected.
const BOOTSTRAP_SPEC: &str = include_str!("../specs/bootstrap.xml");

/// Unified SSH client for one storage array.
///
/// Holds the authenticated transport and the command registry parsed
/// during the connection handshake; commands are resolved with an
/// explicit `run(namespace, name, args)` lookup.
pub struct UnifiedClient {
    transport: Box<dyn Transport>,
    spec: Option<Arc<CliSpec>>,
    flexible: bool,
}

impl std::fmt::Debug for UnifiedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedClient")
            .field("transport", &self.transport.endpoint())
            .field("spec", &self.spec.is_some())
            .field("flexible", &self.flexible)
            .finish()
    }
}

impl UnifiedClient {
    /// Assemble a client from an already-connected transport and a parsed
    /// specification, skipping the handshake.
    pub fn with_spec(transport: Box<dyn Transport>, spec: Arc<CliSpec>, flexible: bool) -> Self {
        UnifiedClient {
            transport,
            spec: Some(spec),
            flexible,
        }
    }

    /// Run the specification handshake over an already-connected
    /// transport.
    pub async fn handshake(
        transport: Box<dyn Transport>,
        options: &ConnectOptions,
    ) -> Result<UnifiedClient> {
        let mut client = UnifiedClient {
            transport,
            spec: None,
            flexible: options.flexible,
        };
        match initialize(&mut client, options).await {
            Ok(()) => Ok(client),
            Err(err) => {
                client.close().await;
                Err(err)
            }
        }
    }

    pub fn specification(&self) -> Option<&Arc<CliSpec>> {
        self.spec.as_ref()
    }

    /// Whether strict error checking is relaxed for this connection.
    pub fn is_flexible(&self) -> bool {
        self.flexible
    }

    /// The device type and the advertised (type, version) pairs.
    pub fn device_info(&self) -> Option<(&str, &[(String, String)])> {
        self.spec
            .as_ref()
            .map(|spec| (spec.array_type.as_str(), spec.array_infos.as_slice()))
    }

    pub fn is_active(&self) -> bool {
        self.transport.is_active()
    }

    /// Close the connection and drop the specification.
    pub async fn close(&mut self) {
        self.transport.disconnect().await;
        self.spec = None;
    }

    /// Send a plain command string, bypassing the command registry.
    pub async fn send_raw_command(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
        stdin: Option<&str>,
    ) -> Result<RawOutput> {
        debug!(command, "sending raw command");
        self.transport.send_command(command, timeout, stdin).await
    }

    /// Execute a registry command by namespace and name.
    pub async fn run(&mut self, namespace: &str, name: &str, args: &Args) -> Result<CommandOutput> {
        let spec = self.spec.clone().ok_or(AgentError::NoSpecification)?;
        let command = spec.command(namespace, name)?;
        command.invoke(self.transport.as_mut(), args).await
    }

    /// Execute a single-command executable (one with direct parameters).
    pub async fn run_executable(&mut self, namespace: &str, args: &Args) -> Result<CommandOutput> {
        let spec = self.spec.clone().ok_or(AgentError::NoSpecification)?;
        let command = spec.executable(namespace)?;
        command.invoke(self.transport.as_mut(), args).await
    }
}

/// Connect to a storage array through SSH and perform the specification
/// handshake.
pub async fn connect(options: ConnectOptions) -> Result<UnifiedClient> {
    let mut transport = SshTransport::new(options.clone());
    transport.connect().await?;
    UnifiedClient::handshake(Box::new(transport), &options).await
}

async fn initialize(client: &mut UnifiedClient, options: &ConnectOptions) -> Result<()> {
    set_specification(client, options).await?;
    check_device_type(client, options.device_type.as_deref())?;
    Ok(())
}

fn parse_options(options: &ConnectOptions) -> ParseOptions {
    ParseOptions {
        flexible: options.flexible,
        ..ParseOptions::default()
    }
}

async fn set_specification(client: &mut UnifiedClient, options: &ConnectOptions) -> Result<()> {
    let mut spec = if options.with_remote_spec {
        remote_cli_spec(client, options).await
    } else {
        None
    };
    if spec.is_none() {
        info!("trying local CLI specifications");
        if let Some(dir) = options.spec_dir.clone() {
            for (device, version) in detect_device_types(client).await {
                match local_cli_spec(&dir, &device, &version, options) {
                    Ok(Some(parsed)) => {
                        spec = Some(parsed);
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            device,
                            version,
                            error = %err,
                            "no usable CLI specification for this device, continuing"
                        );
                    }
                }
            }
        }
    }
    let Some(spec) = spec else {
        return Err(AgentError::NoSpecification);
    };
    client.spec = Some(Arc::new(spec));
    Ok(())
}

/// Ask the array itself for its CLI specification.
async fn remote_cli_spec(client: &mut UnifiedClient, options: &ConnectOptions) -> Option<CliSpec> {
    let raw = match client.send_raw_command("catxmlspec", None, None).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "failed to read the CLI specification from the array");
            return None;
        }
    };
    if raw.stdout.is_empty() {
        warn!(
            stderr = %raw.stderr,
            "the storage array fails to run \"catxmlspec\""
        );
        return None;
    }
    match specparse::parse_with_options(&raw.stdout, parse_options(options)) {
        Ok(spec) if spec.has_commands() => Some(spec),
        Ok(_) => None,
        Err(err) => {
            warn!(error = %err, "failed to parse the CLI specification from the array");
            None
        }
    }
}

/// Probe the array for (device, version) candidates using the bootstrap
/// specification. Probe failures are logged and skipped; an array only
/// answers the dialect it speaks.
async fn detect_device_types(client: &mut UnifiedClient) -> Vec<(String, String)> {
    let bootstrap = match specparse::parse(BOOTSTRAP_SPEC) {
        Ok(spec) => Arc::new(spec),
        Err(err) => {
            warn!(error = %err, "bootstrap specification failed to parse");
            return Vec::new();
        }
    };
    let saved = client.spec.replace(bootstrap);

    let mut found = Vec::new();
    match probe_file_modules(client).await {
        Ok(mut candidates) => found.append(&mut candidates),
        Err(err) => debug!(error = %err, "no file-module array is found, continuing"),
    }
    match probe_svc(client).await {
        Ok(mut candidates) => found.append(&mut candidates),
        Err(err) => debug!(error = %err, "no SVC or Storwize is found, continuing"),
    }

    client.spec = saved;
    found
}

async fn probe_file_modules(client: &mut UnifiedClient) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let clusters = client
        .run("cli", "lscluster", &Args::new())
        .await?
        .into_response()
        .ok_or_else(|| AgentError::InternalSystem("lscluster output was not parsed".to_string()))?;
    for cluster in clusters.as_list() {
        let device = if cluster.text("Profile") == Some("IFS") {
            "ifs"
        } else {
            "sonas"
        };
        let name = cluster.text("Name").unwrap_or_default().to_string();
        let nodes = client
            .run("cli", "lsnode", &Args::new().arg("cluster", name))
            .await?;
        if let Some(nodes) = nodes.into_response() {
            for node in nodes.as_list() {
                let version = node
                    .text("Product Version")
                    .or_else(|| node.text("Product version"))
                    .or_else(|| node.text("product version"))
                    .unwrap_or_default();
                out.push((device.to_string(), canonical_version(version)));
            }
        }
    }
    Ok(out)
}

async fn probe_svc(client: &mut UnifiedClient) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let clusters = client
        .run("svcinfo", "lscluster", &Args::new())
        .await?
        .into_response()
        .ok_or_else(|| AgentError::InternalSystem("lscluster output was not parsed".to_string()))?;
    for cluster in clusters.as_list() {
        if cluster.text("location") != Some("local") {
            continue;
        }
        let id = cluster.text("id").unwrap_or_default().to_string();
        let detail = client
            .run("svcinfo", "lscluster", &Args::new().arg("cluster", id))
            .await?;
        if let Some(detail) = detail.into_response() {
            for record in detail.as_list() {
                let code_level = record.text("code_level").unwrap_or_default();
                out.push(("svc".to_string(), canonical_version(code_level)));
            }
        }
    }
    Ok(out)
}

/// Load the fallback specification file for one (device, version) pair.
fn local_cli_spec(
    dir: &Path,
    device: &str,
    version: &str,
    options: &ConnectOptions,
) -> Result<Option<CliSpec>> {
    let (device, version) = device_type_alias(device, version);
    let path = dir.join(format!("{device}-{version}.xml"));
    if !path.is_file() {
        debug!(path = %path.display(), "no local CLI specification file");
        return Ok(None);
    }
    let spec = specparse::parse_file(&path, parse_options(options))?;
    Ok(if spec.has_commands() { Some(spec) } else { None })
}

/// Fold device aliases and version families onto the shipped spec names.
fn device_type_alias<'a>(device: &'a str, version: &'a str) -> (&'a str, &'a str) {
    let device = match device {
        "storwize" | "storwise" => "svc",
        other => other,
    };
    if device == "svc"
        && version.starts_with("6.")
        && !matches!(version, "6.1" | "6.2" | "6.3")
    {
        return (device, "6.3");
    }
    (device, version)
}

/// Reduce a reported product version to `<major>.<minor>`.
fn canonical_version(data: &str) -> String {
    data.trim()
        .split('.')
        .take(2)
        .collect::<Vec<_>>()
        .join(".")
}

fn check_device_type(client: &UnifiedClient, expected: Option<&str>) -> Result<()> {
    let Some(expected) = expected.filter(|d| !d.is_empty()) else {
        return Ok(());
    };
    match client.device_info() {
        Some((array_type, _)) if array_type == expected => Ok(()),
        _ => Err(AgentError::IncorrectDeviceType {
            expected: expected.to_string(),
        }),
    }
}
