//! End-to-end flows through the real registry, pool, command marshalling,
//! and response parsing, with only the SSH wire faked out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use storage_agent_core::clispec::ERROR_TAG;
use storage_agent_core::{
    specparse, AgentError, AgentRegistry, Args, ClientConnector, FieldValue, RawOutput,
    StorageAgent, Transport, UnifiedClient,
};

const ARRAY_SPEC: &str = r#"
<ArraySyntax version="2.0">
    <ArrayType type="svc"><ArrayVersion type="svc" version="6.3"/></ArrayType>
    <Errors><Error>CMMVC</Error></Errors>
    <Commands>
        <Executable name="svcinfo">
            <Command name="lshost">
                <Response type="svc_normal"/>
                <ValueParam name="-filtervalue"/>
                <ValueParam name="-delim"/>
                <FlagParam name="-nohdr"/>
            </Command>
            <Command name="lsvdisk">
                <Response type="svc_normal"/>
                <ValueParam name="-filtervalue"/>
                <ValueParam name="-delim"/>
                <FlagParam name="-nohdr"/>
                <FlagParam name="-bytes"/>
                <ValueParam name="vdisk_id_or_name" noName="true"/>
            </Command>
        </Executable>
        <Executable name="svctask">
            <Command name="mkhost">
                <Response type="svc_status"/>
                <ValueParam name="-name" required="true"/>
                <ValueParam name="-iscsiname"/>
                <ValueParam name="-fcwwpn"/>
            </Command>
            <Command name="rmhost">
                <Response type="svc_status"/>
                <ValueParam name="host_name" noName="true"/>
            </Command>
        </Executable>
    </Commands>
</ArraySyntax>
"#;

const LSHOST_TWO: &str = "\
id,name,port_count,iogrp_count,status
0,host1,1,4,online
1,host2,2,4,degraded
";

/// Detailed vdisk listing: two blocks, tier fields repeated in the copy
/// block.
const LSVDISK_DETAIL: &str = "\
id,0
name,vdisk0
status,online
capacity,100.00MB
se_copy_count,0

copy_id,0
status,online
sync,yes
tier,generic_ssd
tier_capacity,0.00MB
tier,generic_hdd
tier_capacity,100.00MB
compressed_copy,no
";

type Script = Vec<(&'static str, RawOutput)>;

struct WireLog {
    sent: Mutex<Vec<String>>,
}

struct FakeTransport {
    script: Arc<Script>,
    log: Arc<WireLog>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&mut self) -> storage_agent_core::Result<()> {
        Ok(())
    }

    async fn send_command(
        &mut self,
        command: &str,
        _timeout: Option<Duration>,
        _stdin: Option<&str>,
    ) -> storage_agent_core::Result<RawOutput> {
        self.log.sent.lock().unwrap().push(command.to_string());
        for (prefix, output) in self.script.iter() {
            if command.starts_with(prefix) {
                return Ok(output.clone());
            }
        }
        Ok(RawOutput::default())
    }

    async fn disconnect(&mut self) {}

    fn is_connected(&self) -> bool {
        true
    }

    fn is_active(&self) -> bool {
        true
    }

    fn endpoint(&self) -> String {
        "fake-array".to_string()
    }
}

struct FakeArray {
    script: Arc<Script>,
    log: Arc<WireLog>,
    creations: Arc<AtomicUsize>,
}

impl FakeArray {
    fn new(script: Script) -> FakeArray {
        FakeArray {
            script: Arc::new(script),
            log: Arc::new(WireLog {
                sent: Mutex::new(Vec::new()),
            }),
            creations: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn connector(&self) -> Box<dyn ClientConnector> {
        Box::new(FakeConnector {
            script: Arc::clone(&self.script),
            log: Arc::clone(&self.log),
            creations: Arc::clone(&self.creations),
        })
    }

    fn agent(&self) -> StorageAgent {
        StorageAgent::with_connector("fake-array", "admin", "pw", self.connector())
    }

    fn sent(&self) -> Vec<String> {
        self.log.sent.lock().unwrap().clone()
    }
}

struct FakeConnector {
    script: Arc<Script>,
    log: Arc<WireLog>,
    creations: Arc<AtomicUsize>,
}

#[async_trait]
impl ClientConnector for FakeConnector {
    async fn connect(&self) -> storage_agent_core::Result<UnifiedClient> {
        self.creations.fetch_add(1, Ordering::SeqCst);
        let spec = Arc::new(specparse::parse(ARRAY_SPEC).unwrap());
        Ok(UnifiedClient::with_spec(
            Box::new(FakeTransport {
                script: Arc::clone(&self.script),
                log: Arc::clone(&self.log),
            }),
            spec,
            false,
        ))
    }
}

fn failure(code_line: &str) -> RawOutput {
    RawOutput::new(format!("{ERROR_TAG} 1"), format!("{code_line}\n"))
}

#[tokio::test]
async fn sequential_list_calls_share_one_transport() {
    let array = FakeArray::new(vec![("svcinfo lshost", RawOutput::new(LSHOST_TWO, ""))]);
    let agent = array.agent();

    let first = agent.get_hosts("").await.unwrap();
    let second = agent.get_hosts("").await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);

    // One pooled connection serves both list operations.
    assert_eq!(array.creations.load(Ordering::SeqCst), 1);
    assert_eq!(
        array
            .sent()
            .iter()
            .filter(|c| c.starts_with("svcinfo lshost"))
            .count(),
        2
    );
}

#[tokio::test]
async fn list_filter_adds_filtervalue() {
    let array = FakeArray::new(vec![("svcinfo lshost", RawOutput::new(LSHOST_TWO, ""))]);
    let agent = array.agent();

    let hosts = agent.get_hosts("host1").await.unwrap();
    assert_eq!(hosts[0].text("name"), Some("host1"));
    let sent = array.sent();
    assert_eq!(
        sent[0],
        format!("svcinfo lshost -filtervalue 'name=host1' -delim , || echo {ERROR_TAG} $?")
    );
}

#[tokio::test]
async fn create_host_prefers_fc_ports() {
    let array = FakeArray::new(vec![("svctask mkhost", RawOutput::default())]);
    let agent = array.agent();

    agent
        .create_host(
            "h1",
            &["iqn.1994-05.com.redhat:example".to_string()],
            &["500507680140436C".to_string(), "5005076801306D3E".to_string()],
        )
        .await
        .unwrap();

    let sent = array.sent();
    assert!(sent[0].contains("-fcwwpn '500507680140436C,5005076801306D3E'"));
    assert!(!sent[0].contains("-iscsiname"));
}

#[tokio::test]
async fn create_host_uses_iscsi_ports_when_no_fc() {
    let array = FakeArray::new(vec![("svctask mkhost", RawOutput::default())]);
    let agent = array.agent();

    agent
        .create_host("h1", &["iqn.1994-05.com.redhat:example".to_string()], &[])
        .await
        .unwrap();

    assert!(array.sent()[0].contains("-iscsiname"));
}

#[tokio::test]
async fn create_host_cleans_up_after_a_real_failure() {
    let array = FakeArray::new(vec![
        (
            "svctask mkhost",
            failure("CMMVC5804E The action failed because an object that was specified in the command does not exist."),
        ),
        ("svctask rmhost", RawOutput::default()),
    ]);
    let agent = array.agent();

    let err = agent.create_host("h1", &[], &[]).await.unwrap_err();
    assert_eq!(err.return_code(), Some(1));
    assert!(err.to_string().contains("CMMVC5804E"));

    let sent = array.sent();
    assert!(sent[0].starts_with("svctask mkhost"));
    assert!(sent[1].starts_with("svctask rmhost h1"));
}

#[tokio::test]
async fn create_host_treats_already_exists_as_success() {
    let array = FakeArray::new(vec![(
        "svctask mkhost",
        failure("CMMVC6035E The action failed as the object already exists."),
    )]);
    let agent = array.agent();

    agent.create_host("h1", &[], &[]).await.unwrap();
    // No cleanup is attempted for a downgraded failure.
    assert_eq!(array.sent().len(), 1);
}

#[tokio::test]
async fn delete_host_skips_missing_objects() {
    let array = FakeArray::new(vec![(
        "svctask rmhost",
        failure("CMMVC5753E The specified object does not exist or is not a suitable candidate."),
    )]);
    let agent = array.agent();

    agent.delete_host("h1").await.unwrap();
}

#[tokio::test]
async fn delete_host_raises_real_failures() {
    let array = FakeArray::new(vec![(
        "svctask rmhost",
        failure("CMMVC5804E The action failed because an object that was specified in the command does not exist."),
    )]);
    let agent = array.agent();

    let err = agent.delete_host("h1").await.unwrap_err();
    assert!(matches!(err, AgentError::CliFailure { .. }));
}

#[tokio::test]
async fn detailed_vdisk_listing_merges_into_one_record() {
    let array = FakeArray::new(vec![(
        "svcinfo lsvdisk",
        RawOutput::new(LSVDISK_DETAIL, ""),
    )]);

    let connector = array.connector();
    let mut client = connector.connect().await.unwrap();
    let output = client
        .run(
            "svcinfo",
            "lsvdisk",
            &Args::new().arg("vdisk_id_or_name", "0"),
        )
        .await
        .unwrap();

    let response = output.into_response().unwrap();
    let single = response.as_single_element().unwrap();
    assert_eq!(
        single.get("tier"),
        Some(&FieldValue::List(vec![
            "generic_ssd".to_string(),
            "generic_hdd".to_string()
        ]))
    );
    assert_eq!(
        single.get("tier_capacity"),
        Some(&FieldValue::List(vec![
            "0.00MB".to_string(),
            "100.00MB".to_string()
        ]))
    );

    // Positional id rides after the forced delimiter.
    assert_eq!(
        array.sent()[0],
        format!("svcinfo lsvdisk -delim , 0 || echo {ERROR_TAG} $?")
    );
}

#[tokio::test]
async fn password_rotation_keeps_one_registered_agent() {
    let registry = AgentRegistry::new();
    let first = registry.get_agent("array1", "admin", "pw1").await;
    let second = registry.get_agent("array1", "admin", "pw2").await;
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len().await, 1);
}
