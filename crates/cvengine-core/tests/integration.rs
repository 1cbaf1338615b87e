//! Full runs through the orchestrator against in-memory collaborators.

use cvengine_cloud::mock::MockCloud;
use cvengine_core::{
    run_container_validation, CoreError, EnvironmentHandler, EnvironmentToolkit, Orchestrator,
    RunRequest, Services, Stage,
};
use cvengine_remote::{CancelToken, Fetch, ReachabilityCache, RemoteError};
use cvengine_runtime::mock::{MockClusterCli, MockConnector, RecordingRunner};
use cvengine_runtime::{
    PlatformContext, PlatformHandler, PlatformState, RemoteShellPlatform, RuntimeError, Toolkit,
    DEFAULT_SCRATCH_DIR,
};
use cvengine_schema::{parse_config_str, EnvironmentConfig, EnvironmentDescriptor, VarMap};
use std::collections::HashMap;
use std::net::TcpListener;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const METADATA_URL: &str = "https://cv.test/cvdata.yml";
const IMAGE: &str = "registry.example.com/app:1.0";

const METADATA: &str = r#"
Test:
  - host_type: atomic
    default: true
    instance_name: web
    playbooks:
      - url: https://cv.test/one.yml
      - url: https://cv.test/two.yml
      - url: https://cv.test/three.yml
  - host_type: openshift
    do_container_deploy: true
    template:
      name: app-template
      image_param: IMAGE
    playbooks:
      - url: https://cv.test/oc-check.yml
  - host_type: kubernetes
    playbooks:
      - url: https://cv.test/k8s.yml
Artifacts:
  container_artifacts:
    - /var/log/app
  test_host_artifacts:
    - /var/log/messages
"#;

const PRECONFIGURED: &str = r#"
environment:
  handler: preconfigured
  host:
    machine_name: atomic-host
    ip_address: 10.1.2.3
    credentials:
      user: root
      password: pw
"#;

/// Serves canned documents by URL.
struct MapFetcher {
    documents: HashMap<String, String>,
}

impl MapFetcher {
    fn standard() -> Self {
        let mut documents = HashMap::new();
        documents.insert(METADATA_URL.to_owned(), METADATA.to_owned());
        for name in ["one", "two", "three", "oc-check", "k8s"] {
            documents.insert(
                format!("https://cv.test/{name}.yml"),
                "- hosts: all\n".to_owned(),
            );
        }
        Self { documents }
    }

    fn with_metadata(mut self, doc: &str) -> Self {
        self.documents.insert(METADATA_URL.to_owned(), doc.to_owned());
        self
    }

    fn without(mut self, url: &str) -> Self {
        self.documents.remove(url);
        self
    }
}

impl Fetch for MapFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        self.documents
            .get(url)
            .map(|doc| doc.as_bytes().to_vec())
            .ok_or_else(|| RemoteError::NotFound(url.to_owned()))
    }
}

struct Harness {
    runner: Arc<RecordingRunner>,
    connector: MockConnector,
    cloud: MockCloud,
    cluster: Arc<MockClusterCli>,
    cancel: CancelToken,
    fetcher: Option<MapFetcher>,
}

impl Harness {
    fn new() -> Self {
        Self {
            runner: Arc::new(RecordingRunner::new()),
            connector: MockConnector::new().with_dir(DEFAULT_SCRATCH_DIR),
            cloud: MockCloud::new(),
            cluster: Arc::new(MockClusterCli::new()),
            cancel: CancelToken::new(),
            fetcher: Some(MapFetcher::standard()),
        }
    }

    fn runner(mut self, runner: RecordingRunner) -> Self {
        self.runner = Arc::new(runner);
        self
    }

    fn connector(mut self, connector: MockConnector) -> Self {
        self.connector = connector;
        self
    }

    fn cloud(mut self, cloud: MockCloud) -> Self {
        self.cloud = cloud;
        self
    }

    fn fetcher(mut self, fetcher: MapFetcher) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    fn orchestrator(&mut self) -> Orchestrator {
        Orchestrator::new(Services {
            fetcher: Arc::new(self.fetcher.take().unwrap_or_else(MapFetcher::standard)),
            runner: Arc::clone(&self.runner) as _,
            connector: Arc::new(self.connector.clone()),
            cluster: Some(Arc::clone(&self.cluster) as _),
            cloud: Arc::new(self.cloud.clone()),
            reachability: Arc::new(ReachabilityCache::with_timeout(Duration::from_millis(200))),
            cancel: self.cancel.clone(),
            poll_interval: Duration::from_millis(10),
            check_prereqs: false,
        })
    }
}

fn request(config: &str, out: &Path) -> RunRequest {
    RunRequest {
        image_url: IMAGE.to_owned(),
        metadata_url: METADATA_URL.to_owned(),
        config: parse_config_str(config).unwrap(),
        artifacts_dir: out.to_path_buf(),
        extra_vars: VarMap::new(),
    }
}

fn cloud_config(ssh_port: u16) -> String {
    format!(
        r#"
environment:
  handler: openstack
  openstack:
    auth_url: http://keystone.test:5000/v3
    project: cv
    username: ci
    password: secret
    region: RegionOne
  host:
    image_name: fedora-atomic
    flavor_name: m1.small
    network_name: private
    keypair_name: ci-key
    floating_ip_pool_name: public
    ssh_port: {ssh_port}
    boot_timeout_secs: 5
    ssh_timeout_secs: 1
"#
    )
}

type Events = Arc<Mutex<Vec<String>>>;

fn push(events: &Events, event: &str) {
    events
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(event.to_owned());
}

fn snapshot(events: &Events) -> Vec<String> {
    events.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

struct RecordingEnvironment {
    events: Events,
    fail_prepare: bool,
    host: Option<EnvironmentDescriptor>,
}

impl EnvironmentHandler for RecordingEnvironment {
    fn name(&self) -> &str {
        "recording"
    }

    fn prepare(&mut self) -> Result<EnvironmentDescriptor, CoreError> {
        push(&self.events, "env.prepare");
        if self.fail_prepare {
            return Err(CoreError::Provisioning("no capacity".to_owned()));
        }
        let host = EnvironmentDescriptor {
            host_name: "recorded-host".to_owned(),
            host_ip: "10.9.9.9".to_owned(),
            username: "root".to_owned(),
            password: Some("pw".to_owned()),
            ssh_key_path: None,
            port: 22,
        };
        Ok(self.host.insert(host).clone())
    }

    fn describe(&self) -> Option<&EnvironmentDescriptor> {
        self.host.as_ref()
    }

    fn teardown(&mut self) {
        push(&self.events, "env.teardown");
        self.host = None;
    }
}

/// Records lifecycle calls and forwards them to the real platform.
struct TracedPlatform {
    inner: Box<dyn PlatformHandler>,
    events: Events,
}

impl PlatformHandler for TracedPlatform {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn state(&self) -> PlatformState {
        self.inner.state()
    }

    fn setup(&mut self, target: &EnvironmentDescriptor) -> Result<(), RuntimeError> {
        push(&self.events, "platform.setup");
        self.inner.setup(target)
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        push(&self.events, "platform.run");
        self.inner.run()
    }

    fn teardown(&mut self, artifacts_dir: &Path) -> Result<(), RuntimeError> {
        push(&self.events, "platform.teardown");
        self.inner.teardown(artifacts_dir)
    }
}

/// Swap in a recording environment and a traced atomic platform.
fn trace(orchestrator: &mut Orchestrator, fail_prepare: bool) -> Events {
    let events: Events = Arc::new(Mutex::new(Vec::new()));

    let env_events = Arc::clone(&events);
    orchestrator.environments_mut().register(
        "recording",
        Box::new(
            move |_: &EnvironmentConfig,
                  _: &EnvironmentToolkit|
                  -> Result<Box<dyn EnvironmentHandler>, CoreError> {
                Ok(Box::new(RecordingEnvironment {
                    events: Arc::clone(&env_events),
                    fail_prepare,
                    host: None,
                }))
            },
        ),
    );

    let platform_events = Arc::clone(&events);
    orchestrator.platforms_mut().register(
        "atomic",
        Box::new(
            move |ctx: PlatformContext,
                  kit: &Toolkit|
                  -> Result<Box<dyn PlatformHandler>, RuntimeError> {
                let inner = RemoteShellPlatform::new(
                    ctx,
                    Arc::clone(&kit.runner),
                    Arc::clone(&kit.connector),
                );
                Ok(Box::new(TracedPlatform {
                    inner: Box::new(inner),
                    events: Arc::clone(&platform_events),
                }))
            },
        ),
    );
    events
}

const RECORDING: &str = "environment:\n  handler: recording\n";

const FULL_LIFECYCLE: [&str; 5] = [
    "env.prepare",
    "platform.setup",
    "platform.run",
    "platform.teardown",
    "env.teardown",
];

#[test]
fn preconfigured_run_succeeds_and_reports() {
    let mut harness = Harness::new();
    let out = tempfile::tempdir().unwrap();
    let report = harness
        .orchestrator()
        .run(&request(PRECONFIGURED, out.path()))
        .unwrap();

    assert_eq!(report.host_type, "atomic");
    assert_eq!(report.environment, "preconfigured");
    assert_eq!(report.playbooks.len(), 3);
    assert!(report.finished_at >= report.started_at);
    assert_eq!(
        harness.runner.playbook_names(),
        vec!["00-one.yml", "01-two.yml", "02-three.yml"]
    );
    assert_eq!(harness.runner.playbooks()[0].vars["image_url"], IMAGE);
    assert!(out.path().join("cvartifacts/fetched.txt").is_file());
    assert_eq!(harness.connector.state().opened, vec!["10.1.2.3".to_owned()]);
}

#[test]
fn successful_run_tears_down_in_order() {
    let mut harness = Harness::new();
    let mut orchestrator = harness.orchestrator();
    let events = trace(&mut orchestrator, false);
    let out = tempfile::tempdir().unwrap();

    orchestrator.run(&request(RECORDING, out.path())).unwrap();
    assert_eq!(snapshot(&events), FULL_LIFECYCLE);
}

#[test]
fn failing_playbook_stops_run_and_still_tears_down() {
    let mut harness = Harness::new().runner(RecordingRunner::new().fail_playbook("two", 3));
    let mut orchestrator = harness.orchestrator();
    let events = trace(&mut orchestrator, false);
    let out = tempfile::tempdir().unwrap();

    let err = orchestrator.run(&request(RECORDING, out.path())).unwrap_err();
    assert_eq!(err.stage(), Stage::PlaybookExecution);
    assert!(err.to_string().contains("two.yml"), "{err}");
    assert_eq!(
        harness.runner.playbook_names(),
        vec!["00-one.yml", "01-two.yml"]
    );
    assert_eq!(snapshot(&events), FULL_LIFECYCLE);
    // Artifacts are still collected from the failed run.
    assert!(out.path().join("cvartifacts").is_dir());
}

#[test]
fn environment_failure_skips_platform_work_but_runs_both_teardowns() {
    let mut harness = Harness::new();
    let mut orchestrator = harness.orchestrator();
    let events = trace(&mut orchestrator, true);
    let out = tempfile::tempdir().unwrap();

    let err = orchestrator.run(&request(RECORDING, out.path())).unwrap_err();
    assert_eq!(err.stage(), Stage::Provisioning);
    assert_eq!(
        snapshot(&events),
        vec!["env.prepare", "platform.teardown", "env.teardown"]
    );
    assert!(harness.runner.playbooks().is_empty());
    assert!(harness.connector.state().opened.is_empty());
}

#[test]
fn missing_required_scratch_output_fails_after_all_playbooks() {
    let mut harness = Harness::new().connector(MockConnector::new());
    let mut orchestrator = harness.orchestrator();
    let events = trace(&mut orchestrator, false);
    let out = tempfile::tempdir().unwrap();

    let err = orchestrator.run(&request(RECORDING, out.path())).unwrap_err();
    assert_eq!(err.stage(), Stage::ArtifactRetrieval);
    assert_eq!(harness.runner.playbooks().len(), 3);
    assert_eq!(snapshot(&events), FULL_LIFECYCLE);
}

#[test]
fn optional_artifact_misses_do_not_fail_the_run() {
    // No host artifacts exist and every container copy fails.
    let mut harness = Harness::new().runner(RecordingRunner::new().fail_command("docker cp", 1));
    let out = tempfile::tempdir().unwrap();
    harness
        .orchestrator()
        .run(&request(PRECONFIGURED, out.path()))
        .unwrap();
}

#[test]
fn unknown_scenario_without_default_fails_before_provisioning() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let metadata =
        "Test:\n  - host_type: fedora\n    playbooks:\n      - url: https://cv.test/one.yml\n";
    let mut harness = Harness::new().fetcher(MapFetcher::standard().with_metadata(metadata));
    let out = tempfile::tempdir().unwrap();
    let config = format!("target_host_platform: windows\n{}", cloud_config(port));

    let err = harness
        .orchestrator()
        .run(&request(&config, out.path()))
        .unwrap_err();
    assert_eq!(err.stage(), Stage::Resolution);
    assert!(matches!(err, CoreError::Metadata(_)));
    assert!(err.to_string().contains("windows"), "{err}");
    assert!(harness.cloud.calls().is_empty());
}

#[test]
fn unmatched_scenario_does_not_use_default() {
    let mut harness = Harness::new();
    let out = tempfile::tempdir().unwrap();
    let config = format!("target_host_platform: windows\n{PRECONFIGURED}");
    let err = harness
        .orchestrator()
        .run(&request(&config, out.path()))
        .unwrap_err();
    assert_eq!(err.stage(), Stage::Resolution);
    assert!(matches!(err, CoreError::Metadata(_)));
    assert!(err.to_string().contains("windows"), "{err}");
    assert!(harness.connector.state().opened.is_empty());
}

#[test]
fn unsupported_host_type_is_a_configuration_error() {
    let mut harness = Harness::new();
    let out = tempfile::tempdir().unwrap();
    let config = format!("target_host_platform: kubernetes\n{PRECONFIGURED}");

    let err = harness
        .orchestrator()
        .run(&request(&config, out.path()))
        .unwrap_err();
    assert_eq!(err.stage(), Stage::Configuration);
    assert!(err.to_string().contains("kubernetes"));
    assert!(harness.connector.state().opened.is_empty());
}

#[test]
fn unreachable_metadata_is_a_resolution_error() {
    let mut harness = Harness::new().fetcher(MapFetcher::standard().without(METADATA_URL));
    let out = tempfile::tempdir().unwrap();
    let err = harness
        .orchestrator()
        .run(&request(PRECONFIGURED, out.path()))
        .unwrap_err();
    assert_eq!(err.stage(), Stage::Resolution);
    assert!(err.to_string().contains(METADATA_URL));
}

#[test]
fn missing_playbook_is_a_resolution_error() {
    let mut harness =
        Harness::new().fetcher(MapFetcher::standard().without("https://cv.test/three.yml"));
    let out = tempfile::tempdir().unwrap();
    let err = harness
        .orchestrator()
        .run(&request(PRECONFIGURED, out.path()))
        .unwrap_err();
    assert_eq!(err.stage(), Stage::Resolution);
    assert!(harness.runner.playbooks().is_empty());
}

#[test]
fn cloud_run_creates_floating_ip_and_releases_everything() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut harness = Harness::new().cloud(MockCloud::new().with_boot_polls(1));
    let out = tempfile::tempdir().unwrap();

    let report = harness
        .orchestrator()
        .run(&request(&cloud_config(port), out.path()))
        .unwrap();
    assert_eq!(report.environment, "cloud");

    let calls = harness.cloud.calls();
    assert!(calls.contains(&"create_floating_ip".to_owned()));
    assert!(!calls.contains(&"attach_floating_ip".to_owned()));
    let state = harness.cloud.state();
    assert_eq!(state.deleted_servers.len(), 1);
    assert_eq!(state.deleted_floating_ips, state.created_floating_ips);
    assert!(state.servers.is_empty());
    assert_eq!(harness.connector.state().opened, vec!["127.0.0.1".to_owned()]);
}

#[test]
fn cloud_run_reuses_an_unattached_floating_ip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut harness =
        Harness::new().cloud(MockCloud::new().with_unattached_ip("fip-spare", "198.51.100.4"));
    let out = tempfile::tempdir().unwrap();

    harness
        .orchestrator()
        .run(&request(&cloud_config(port), out.path()))
        .unwrap();

    let calls = harness.cloud.calls();
    assert!(calls.contains(&"attach_floating_ip".to_owned()));
    assert!(!calls.contains(&"create_floating_ip".to_owned()));
    let state = harness.cloud.state();
    assert_eq!(state.deleted_floating_ips, vec!["fip-spare".to_owned()]);
    assert_eq!(state.deleted_servers.len(), 1);
}

#[test]
fn failed_server_creation_releases_nothing_it_did_not_create() {
    let mut harness = Harness::new().cloud(MockCloud::new().fail_on("create_server"));
    let out = tempfile::tempdir().unwrap();

    let err = harness
        .orchestrator()
        .run(&request(&cloud_config(22), out.path()))
        .unwrap_err();
    assert_eq!(err.stage(), Stage::Provisioning);
    let calls = harness.cloud.calls();
    assert!(!calls.contains(&"delete_server".to_owned()));
    assert!(!calls.contains(&"delete_floating_ip".to_owned()));
    assert!(harness.runner.playbooks().is_empty());
}

#[test]
fn unreachable_host_still_releases_server_and_address() {
    // Bind and drop to get a port nothing listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut harness = Harness::new();
    let out = tempfile::tempdir().unwrap();

    let err = harness
        .orchestrator()
        .run(&request(&cloud_config(port), out.path()))
        .unwrap_err();
    assert_eq!(err.stage(), Stage::Provisioning);
    let state = harness.cloud.state();
    assert_eq!(state.deleted_servers.len(), 1);
    assert_eq!(state.deleted_floating_ips.len(), 1);
    assert!(harness.connector.state().opened.is_empty());
}

#[test]
fn local_cluster_run_deploys_and_collects_locally() {
    let scratch = tempfile::tempdir().unwrap();
    let scratch_dir = scratch.path().join("cvout");
    let mut harness = Harness::new();
    let out = tempfile::tempdir().unwrap();

    let mut req = request(
        "target_host_platform: openshift\nenvironment:\n  handler: local\n",
        out.path(),
    );
    req.extra_vars.insert(
        "artifact_output_dir".to_owned(),
        scratch_dir.display().to_string().into(),
    );
    let report = harness.orchestrator().run(&req).unwrap();

    assert_eq!(report.host_type, "openshift");
    assert_eq!(report.environment, "local");
    assert!(harness
        .cluster
        .calls()
        .iter()
        .any(|c| c.starts_with("new_app app-template container_instance IMAGE=")));
    let call = &harness.runner.playbooks()[0];
    assert!(call.local);
    assert!(out.path().join("cvout").is_dir());
}

#[test]
fn cancellation_before_start_provisions_nothing() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut harness = Harness::new();
    harness.cancel.cancel();
    let out = tempfile::tempdir().unwrap();

    let err = harness
        .orchestrator()
        .run(&request(&cloud_config(port), out.path()))
        .unwrap_err();
    assert!(matches!(err, CoreError::Cancelled));
    assert_eq!(err.stage(), Stage::Cancelled);
    assert!(harness.cloud.calls().is_empty());
}

#[test]
fn production_entry_rejects_unknown_handler_before_any_io() {
    let out = tempfile::tempdir().unwrap();
    let config = parse_config_str("environment:\n  handler: nonesuch\n").unwrap();
    let err = run_container_validation(
        IMAGE,
        "http://127.0.0.1:1/cvdata.yml",
        config,
        out.path(),
        VarMap::new(),
        CancelToken::new(),
    )
    .unwrap_err();
    assert_eq!(err.stage(), Stage::Configuration);
    assert!(err.to_string().contains("nonesuch"), "{err}");
    assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
}
