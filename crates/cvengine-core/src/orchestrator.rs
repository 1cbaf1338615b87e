//! One validation run: resolve, provision, set up, run, and always tear down.

use crate::environment::{EnvironmentHandler, EnvironmentRegistry, EnvironmentToolkit};
use crate::{CoreError, Stage};
use chrono::{DateTime, Utc};
use cvengine_cloud::{CloudProvider, OpenStackProvider};
use cvengine_remote::{
    prefetch_playbooks, CancelToken, Fetch, HttpFetcher, OpenSshConnector, ReachabilityCache,
    ShellConnector,
};
use cvengine_runtime::{
    check_runner_prereqs, format_missing, prereqs_skipped, AnsibleRunner, AutomationRunner,
    ClusterCli, PlatformContext, PlatformHandler, PlatformRegistry, Toolkit,
};
use cvengine_schema::{
    parse_metadata_str, resolve_scenario, EnvironmentDescriptor, RunConfig, RunId,
    ScenarioMetadata, VarMap,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Inputs of one validation run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub image_url: String,
    pub metadata_url: String,
    pub config: RunConfig,
    pub artifacts_dir: PathBuf,
    pub extra_vars: VarMap,
}

/// Summary of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub host_type: String,
    pub environment: String,
    pub playbooks: Vec<String>,
    pub artifacts_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// External collaborators a run talks to.
pub struct Services {
    pub fetcher: Arc<dyn Fetch>,
    pub runner: Arc<dyn AutomationRunner>,
    pub connector: Arc<dyn ShellConnector>,
    /// Cluster CLI; located on demand when `None`.
    pub cluster: Option<Arc<dyn ClusterCli>>,
    pub cloud: Arc<dyn CloudProvider>,
    pub reachability: Arc<ReachabilityCache>,
    pub cancel: CancelToken,
    /// Interval between boot and reachability polls.
    pub poll_interval: Duration,
    pub check_prereqs: bool,
}

impl Services {
    /// The real collaborators: HTTP fetch, ansible, OpenSSH, OpenStack.
    pub fn production(config: &RunConfig, cancel: CancelToken) -> Result<Self, CoreError> {
        let reachability = Arc::new(ReachabilityCache::new());
        let runner = AnsibleRunner::new(&BTreeMap::new())
            .map_err(|e| CoreError::from_runtime(Stage::Configuration, e))?;
        Ok(Self {
            fetcher: Arc::new(HttpFetcher::new(config.fetch.insecure_tls)),
            runner: Arc::new(runner),
            connector: Arc::new(OpenSshConnector::new(
                Arc::clone(&reachability),
                cancel.clone(),
            )),
            cluster: None,
            cloud: Arc::new(OpenStackProvider::new()),
            reachability,
            cancel,
            poll_interval: Duration::from_secs(5),
            check_prereqs: true,
        })
    }
}

pub struct Orchestrator {
    fetcher: Arc<dyn Fetch>,
    cancel: CancelToken,
    check_prereqs: bool,
    environments: EnvironmentRegistry,
    platforms: PlatformRegistry,
}

impl Orchestrator {
    pub fn new(services: Services) -> Self {
        let environments = EnvironmentRegistry::with_defaults(EnvironmentToolkit {
            cloud: services.cloud,
            reachability: services.reachability,
            cancel: services.cancel.clone(),
            poll_interval: services.poll_interval,
        });
        let platforms = PlatformRegistry::with_defaults(Toolkit {
            runner: services.runner,
            connector: services.connector,
            cluster: services.cluster,
        });
        Self {
            fetcher: services.fetcher,
            cancel: services.cancel,
            check_prereqs: services.check_prereqs,
            environments,
            platforms,
        }
    }

    pub fn environments_mut(&mut self) -> &mut EnvironmentRegistry {
        &mut self.environments
    }

    pub fn platforms_mut(&mut self) -> &mut PlatformRegistry {
        &mut self.platforms
    }

    /// Run one validation. Succeeds when every playbook exits zero and the
    /// required artifacts were retrieved.
    pub fn run(&self, request: &RunRequest) -> Result<RunReport, CoreError> {
        let started_at = Utc::now();
        let run_id = RunId::new(uuid::Uuid::new_v4().to_string());
        info!("run {} validating {}", run_id.short(), request.image_url);

        let mut environment = self.environments.create(&request.config.environment)?;
        self.check_prerequisites()?;

        let metadata = self.fetch_metadata(&request.metadata_url)?;
        let mut scenario = resolve_scenario(
            &metadata,
            request.config.target_host_platform.as_deref(),
        )?
        .clone();
        let host_type = scenario.host_type.to_string();
        if !self.platforms.contains(&host_type) {
            return Err(CoreError::Configuration(format!(
                "'{host_type}' is not a supported host type (known: {})",
                self.platforms.keys().join(", ")
            )));
        }
        info!("scenario '{host_type}' with {} playbooks", scenario.playbooks.len());

        self.cancel.check()?;
        let playbook_dir =
            prefetch_playbooks(self.fetcher.as_ref(), &mut scenario.playbooks, &self.cancel)
                .map_err(|source| {
                    if source.is_cancelled() {
                        CoreError::Cancelled
                    } else {
                        CoreError::Fetch {
                            url: format!("playbooks of scenario '{host_type}'"),
                            source,
                        }
                    }
                })?;
        let playbooks: Vec<String> = scenario
            .playbook_urls()
            .into_iter()
            .map(str::to_owned)
            .collect();

        let mut platform = self
            .platforms
            .create(PlatformContext {
                host_type: host_type.clone(),
                scenario,
                artifacts: metadata.artifacts.clone(),
                image_url: request.image_url.clone(),
                extra_vars: request.extra_vars.clone(),
                policy: request.config.artifact_policy,
                cancel: self.cancel.clone(),
            })
            .map_err(|e| CoreError::from_runtime(Stage::Configuration, e))?;

        self.execute(
            environment.as_mut(),
            platform.as_mut(),
            &request.artifacts_dir,
        )?;
        drop(playbook_dir);

        let finished_at = Utc::now();
        info!(
            "run {} passed in {}s",
            run_id.short(),
            (finished_at - started_at).num_seconds()
        );
        Ok(RunReport {
            run_id,
            host_type,
            environment: environment.name().to_owned(),
            playbooks,
            artifacts_dir: request.artifacts_dir.clone(),
            started_at,
            finished_at,
        })
    }

    fn check_prerequisites(&self) -> Result<(), CoreError> {
        if !self.check_prereqs || prereqs_skipped() {
            return Ok(());
        }
        let missing = check_runner_prereqs();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Configuration(format_missing(&missing)))
        }
    }

    fn fetch_metadata(&self, url: &str) -> Result<ScenarioMetadata, CoreError> {
        info!("downloading scenario metadata from {url}");
        let text = self.fetcher.fetch_string(url).map_err(|source| {
            if source.is_cancelled() {
                CoreError::Cancelled
            } else {
                CoreError::Fetch {
                    url: url.to_owned(),
                    source,
                }
            }
        })?;
        let metadata = parse_metadata_str(&text)?;
        debug!("metadata lists {} scenarios", metadata.scenarios.len());
        Ok(metadata)
    }

    /// Environment scope around platform scope. Each teardown runs exactly
    /// once on every path, platform first.
    fn execute(
        &self,
        environment: &mut dyn EnvironmentHandler,
        platform: &mut dyn PlatformHandler,
        artifacts_dir: &Path,
    ) -> Result<(), CoreError> {
        info!("preparing {} environment", environment.name());
        let outcome = match environment.prepare() {
            Ok(target) => {
                let work = self.drive(platform, &target);
                if let Err(e) = &work {
                    error!("{e}");
                }
                settle(work, release_platform(platform, artifacts_dir))
            }
            Err(e) => {
                error!("{e}");
                if let Err(te) = release_platform(platform, artifacts_dir) {
                    warn!("platform teardown failed: {te}");
                }
                Err(e)
            }
        };
        info!("tearing down {} environment", environment.name());
        environment.teardown();
        outcome
    }

    fn drive(
        &self,
        platform: &mut dyn PlatformHandler,
        target: &EnvironmentDescriptor,
    ) -> Result<(), CoreError> {
        self.cancel.check()?;
        info!(
            "setting up {} platform on {} ({})",
            platform.name(),
            target.host_name,
            target.host_ip
        );
        platform
            .setup(target)
            .map_err(|e| CoreError::from_runtime(Stage::ConnectionSetup, e))?;
        self.cancel.check()?;
        platform
            .run()
            .map_err(|e| CoreError::from_runtime(Stage::PlaybookExecution, e))
    }
}

fn release_platform(
    platform: &mut dyn PlatformHandler,
    artifacts_dir: &Path,
) -> Result<(), CoreError> {
    info!(
        "tearing down {} platform into {}",
        platform.name(),
        artifacts_dir.display()
    );
    platform
        .teardown(artifacts_dir)
        .map_err(|e| CoreError::from_runtime(Stage::ArtifactRetrieval, e))
}

/// The run's own error wins; a teardown error only surfaces on its own.
fn settle(work: Result<(), CoreError>, release: Result<(), CoreError>) -> Result<(), CoreError> {
    match (work, release) {
        (Err(e), Err(te)) => {
            warn!("platform teardown also failed: {te}");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), release) => release,
    }
}

/// Run a validation with the production collaborators.
///
/// Cancelling `cancel` stops the run at the next checkpoint and still tears
/// down whatever was already set up.
pub fn run_container_validation(
    image_url: &str,
    metadata_url: &str,
    config: RunConfig,
    artifacts_dir: &Path,
    extra_vars: VarMap,
    cancel: CancelToken,
) -> Result<RunReport, CoreError> {
    let services = Services::production(&config, cancel)?;
    Orchestrator::new(services).run(&RunRequest {
        image_url: image_url.to_owned(),
        metadata_url: metadata_url.to_owned(),
        config,
        artifacts_dir: artifacts_dir.to_path_buf(),
        extra_vars,
    })
}
