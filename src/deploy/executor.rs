//! Deployment executor
//!
//! Interprets an [`ExecutionPlan`]: phases run strictly one after another,
//! members of a phase run concurrently (bounded by `max_parallel`). The
//! first failing member cancels its siblings, marks the phase failed and
//! halts the run; applied work is then rolled back when enabled.
//!
//! The executor is the only writer of the deployment state during a run.
//! Tasks hand back the records they produced, including those of steps that
//! succeeded before a failure, and the executor folds them into the document
//! and persists it after every service that produced any.

use super::backend::{Collaborators, ServiceRef};
use super::log::DeploymentLog;
use super::status::{
    transition, transition_phase, FailureKind, PhaseReport, PhaseState, ServiceAction,
    ServiceFailure, ServiceReport, ServiceState,
};
use super::DeploymentReport;
use crate::error::Result;
use crate::graph::DependencyGraph;
use crate::health::{CancelHandle, Cancellation, HealthCheckEngine};
use crate::manifest::{Manifest, ResolvedService, ValidatedManifest};
use crate::plan::ExecutionPlan;
use crate::rollback::{AppliedPhase, RollbackManager, RollbackTarget};
use crate::settings::DeploymentConfig;
use crate::state::{
    DeploymentState, ResourceRecord, ServiceRecord, StateEntry, StateStore, StateTracker,
    GRAPH_FILE, LAST_RUN_FILE,
};
use chrono::Utc;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Upper bound for a single retry delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Delay before retry number `attempt` (0-based): exponential from `base`,
/// capped at [`MAX_RETRY_DELAY`], plus up to 25% jitter
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    let delay = base.saturating_mul(factor).min(MAX_RETRY_DELAY);
    let spread = delay.as_millis() as u64 / 4;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Deployment executor
pub struct DeploymentExecutor {
    collaborators: Collaborators,
    engine: HealthCheckEngine,
    store: Option<StateStore>,
    max_parallel: usize,
    rollback: bool,
    dry_run: bool,
}

impl DeploymentExecutor {
    pub fn new(collaborators: Collaborators, engine: HealthCheckEngine) -> Self {
        Self {
            collaborators,
            engine,
            store: None,
            max_parallel: num_cpus::get().max(1),
            rollback: true,
            dry_run: false,
        }
    }

    /// Persist state, reports and the event log under this store
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Allow rollback; the manifest's `enable_rollback` must also allow it
    pub fn with_rollback(mut self, enabled: bool) -> Self {
        self.rollback = enabled;
        self
    }

    /// Log collaborator calls instead of making them; nothing is persisted
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Execute `plan` against `prior` state
    ///
    /// Service failures do not make this return `Err`: they are recorded in
    /// the report (see [`DeploymentReport::failure_error`]). `Err` means the
    /// run itself could not proceed, e.g. state could not be persisted.
    pub async fn execute(
        &self,
        validated: &ValidatedManifest,
        plan: &ExecutionPlan,
        prior: &DeploymentState,
    ) -> Result<DeploymentReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let config = validated.config().clone();
        let store = if self.dry_run { None } else { self.store.as_ref() };
        let collaborators = if self.dry_run {
            Collaborators::dry_run()
        } else {
            self.collaborators.clone()
        };

        tracing::info!(
            "Starting deployment run {} ({} phase(s){})",
            run_id,
            plan.phases.len(),
            if self.dry_run { ", dry run" } else { "" }
        );

        let log = match store {
            Some(store) if config.flags.deployment_logging => {
                DeploymentLog::open(&store.log_path(), &run_id).await?
            }
            _ => DeploymentLog::disabled(&run_id),
        };

        if let Some(store) = store {
            if config.flags.dependency_graphing {
                let graph = DependencyGraph::build(validated, Some(plan));
                store.write_report(GRAPH_FILE, &graph).await?;
            }
        }

        let diff = StateTracker::diff(validated, prior);
        for name in &diff.orphaned {
            tracing::warn!(
                "Service {} is recorded but no longer enabled; use rollback to remove it",
                name
            );
        }

        let mut report = DeploymentReport {
            run_id: run_id.clone(),
            started_at: Utc::now(),
            finished_at: None,
            dry_run: self.dry_run,
            phases: Vec::new(),
            failure: None,
            rollback: None,
        };
        let mut state = prior.clone();
        let mut healthy: BTreeSet<String> = BTreeSet::new();
        let mut applied: Vec<AppliedPhase> = Vec::new();
        let manifest = Arc::new(validated.manifest().clone());
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));

        for phase in &plan.phases {
            let mut phase_state = PhaseState::Pending;
            if report.failure.is_some() {
                report.phases.push(PhaseReport {
                    name: phase.name.clone(),
                    status: phase_state,
                    services: phase
                        .members
                        .iter()
                        .map(|name| ServiceReport {
                            name: name.clone(),
                            state: ServiceState::Pending,
                            action: ServiceAction::Skipped,
                            attempts: 0,
                            error: None,
                        })
                        .collect(),
                });
                continue;
            }

            transition_phase(&phase.name, &mut phase_state, PhaseState::Running)?;
            log.record(&phase.name, PhaseState::Pending, PhaseState::Running, None)
                .await;
            tracing::info!("Phase {} started ({} service(s))", phase.name, phase.members.len());

            let cancel = CancelHandle::new();
            let mut tasks = JoinSet::new();
            let mut spawned: HashMap<tokio::task::Id, (String, ServiceAction)> = HashMap::new();
            let mut outcomes: HashMap<String, ServiceOutcome> = HashMap::new();

            for name in &phase.members {
                let Some(service) = validated.service(name) else {
                    continue;
                };

                if !diff.to_deploy.contains(name) {
                    outcomes.insert(name.clone(), unchanged(name, &log).await);
                    healthy.insert(name.clone());
                    continue;
                }

                let dependencies_ready = service
                    .depends_on()
                    .iter()
                    .filter(|d| validated.is_enabled(d))
                    .all(|d| healthy.contains(d));
                let provision = diff.resources_to_create.contains(name);

                let action = if provision {
                    ServiceAction::Deployed
                } else {
                    ServiceAction::Updated
                };
                let task = ServiceTask {
                    service: service.clone(),
                    manifest: manifest.clone(),
                    collaborators: collaborators.clone(),
                    engine: self.engine.clone(),
                    config: config.clone(),
                    log: log.clone(),
                    provision,
                    register: diff.identity_apps_to_create.contains(name),
                    action,
                    dry_run: self.dry_run,
                    dependencies_ready,
                };
                let permits = semaphore.clone();
                let token = cancel.token();
                let handle = tasks.spawn(async move { task.run(permits, token).await });
                spawned.insert(handle.id(), (name.clone(), action));
            }

            while let Some(joined) = tasks.join_next().await {
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let (name, action) = spawned
                            .get(&e.id())
                            .cloned()
                            .unwrap_or_else(|| (phase.name.clone(), ServiceAction::Updated));
                        tracing::error!("Deployment task for {} aborted: {}", name, e);
                        ServiceOutcome::aborted(name, action, e.to_string())
                    }
                };

                // resources from steps that succeeded are recorded even when
                // a later step failed
                if !outcome.entries.is_empty() {
                    for entry in outcome.entries.iter().cloned() {
                        state = StateTracker::update(&state, &outcome.name, entry);
                    }
                    if let Some(store) = store {
                        state = store.save(&state).await?;
                    }
                }

                match outcome.failure {
                    Some(ref failure) => {
                        if report.failure.is_none() && failure.kind != FailureKind::Cancelled {
                            tracing::error!("{}", failure);
                            report.failure = Some(failure.clone());
                            cancel.cancel();
                        }
                    }
                    None => {
                        healthy.insert(outcome.name.clone());
                    }
                }
                outcomes.insert(outcome.name.clone(), outcome);
            }

            // a cancelled sibling is never the cause of the failure
            if report.failure.is_none() {
                if let Some(cancelled) = outcomes.values().find_map(|o| o.failure.clone()) {
                    report.failure = Some(cancelled);
                }
            }

            let failed = report.failure.is_some();
            let next = if failed {
                PhaseState::Failed
            } else {
                PhaseState::Complete
            };
            transition_phase(&phase.name, &mut phase_state, next)?;
            log.record(&phase.name, PhaseState::Running, next, None).await;

            // rollback scope: everything applied in completed phases, plus
            // failed-phase members that reached Deploying
            let mut targets: Vec<&ServiceOutcome> = phase
                .members
                .iter()
                .filter_map(|m| outcomes.get(m))
                .filter(|o| o.action != ServiceAction::Unchanged)
                .filter(|o| if failed { o.reached_deploying } else { o.failure.is_none() })
                .collect();
            targets.sort_by_key(|o| topo_index(validated, &o.name));
            if !targets.is_empty() {
                let resolver = validated.resolver();
                applied.push(AppliedPhase {
                    name: phase.name.clone(),
                    services: targets
                        .iter()
                        .filter_map(|o| validated.service(&o.name))
                        .map(|s| RollbackTarget {
                            service: ServiceRef::from(s),
                            dependents: resolver.dependents(&s.name),
                        })
                        .collect(),
                });
            }

            report.phases.push(PhaseReport {
                name: phase.name.clone(),
                status: phase_state,
                services: phase
                    .members
                    .iter()
                    .filter_map(|m| outcomes.remove(m))
                    .map(ServiceOutcome::into_report)
                    .collect(),
            });

            if failed {
                tracing::error!("Phase {} failed, halting", phase.name);
            } else {
                tracing::info!("Phase {} complete", phase.name);
            }
        }

        if report.failure.is_some() {
            if self.rollback && config.flags.rollback {
                let manager = RollbackManager::from_collaborators(&collaborators)
                    .with_hook_timeout(config.hook_timeout);
                let rollback = manager.rollback(&applied).await;

                for name in rollback.torn_down() {
                    state = StateTracker::forget(&state, name);
                }
                if let Some(store) = store {
                    if rollback.torn_down().next().is_some() {
                        store.save(&state).await?;
                    }
                }
                for failure in rollback.failures() {
                    tracing::warn!("Rollback step failed: {}", failure);
                }
                report.rollback = Some(rollback);
            } else {
                tracing::warn!("Rollback is disabled; applied services were left in place");
            }
        }

        report.finished_at = Some(Utc::now());
        if let Some(store) = store {
            store.write_report(LAST_RUN_FILE, &report).await?;
        }

        match report.failure {
            Some(ref failure) => tracing::error!("Deployment run {} failed: {}", run_id, failure),
            None => tracing::info!("Deployment run {} succeeded", run_id),
        }
        Ok(report)
    }
}

fn topo_index(validated: &ValidatedManifest, name: &str) -> usize {
    validated
        .topo_order()
        .iter()
        .position(|n| n == name)
        .unwrap_or(usize::MAX)
}

/// Service already matching the persisted state
async fn unchanged(name: &str, log: &DeploymentLog) -> ServiceOutcome {
    let mut run = ServiceRun::new(name, log.clone());
    run.advance(ServiceState::Healthy, Some("unchanged".to_string()))
        .await;
    ServiceOutcome {
        name: name.to_string(),
        state: run.state,
        action: ServiceAction::Unchanged,
        attempts: 0,
        reached_deploying: false,
        failure: None,
        entries: Vec::new(),
    }
}

/// What a service task hands back to the executor
struct ServiceOutcome {
    name: String,
    state: ServiceState,
    action: ServiceAction,
    attempts: u32,
    reached_deploying: bool,
    failure: Option<ServiceFailure>,
    entries: Vec<StateEntry>,
}

impl ServiceOutcome {
    /// Outcome of a task that panicked or was aborted
    fn aborted(name: String, action: ServiceAction, message: String) -> Self {
        Self {
            failure: Some(ServiceFailure {
                service: name.clone(),
                kind: FailureKind::Deployment {
                    step: "task".to_string(),
                },
                message,
            }),
            name,
            state: ServiceState::Failed,
            action,
            attempts: 0,
            reached_deploying: true,
            entries: Vec::new(),
        }
    }

    fn into_report(self) -> ServiceReport {
        ServiceReport {
            name: self.name,
            state: self.state,
            action: self.action,
            attempts: self.attempts,
            error: self.failure.map(|f| f.message),
        }
    }
}

/// State machine of one service, mirrored to the event log
struct ServiceRun {
    name: String,
    state: ServiceState,
    reached_deploying: bool,
    attempts: u32,
    log: DeploymentLog,
}

impl ServiceRun {
    fn new(name: &str, log: DeploymentLog) -> Self {
        Self {
            name: name.to_string(),
            state: ServiceState::Pending,
            reached_deploying: false,
            attempts: 0,
            log,
        }
    }

    async fn advance(&mut self, to: ServiceState, message: Option<String>) {
        let from = self.state;
        if let Err(e) = transition(&self.name, &mut self.state, to) {
            tracing::error!("{}", e);
            return;
        }
        if to.reached_deploying() {
            self.reached_deploying = true;
        }
        tracing::debug!("Service {}: {} -> {}", self.name, from, to);
        self.log.record(&self.name, from, to, message).await;
    }
}

/// Everything one spawned service deployment needs
struct ServiceTask {
    service: ResolvedService,
    manifest: Arc<Manifest>,
    collaborators: Collaborators,
    engine: HealthCheckEngine,
    config: DeploymentConfig,
    log: DeploymentLog,
    provision: bool,
    register: bool,
    action: ServiceAction,
    dry_run: bool,
    dependencies_ready: bool,
}

impl ServiceTask {
    async fn run(self, semaphore: Arc<Semaphore>, cancel: Cancellation) -> ServiceOutcome {
        let mut run = ServiceRun::new(&self.service.name, self.log.clone());
        let mut entries = Vec::new();

        let failure = match self.drive(&mut run, &mut entries, semaphore, cancel).await {
            Ok(()) => {
                run.advance(ServiceState::Healthy, None).await;
                tracing::info!("Service {} is healthy", self.service.name);
                None
            }
            Err(failure) => {
                run.advance(ServiceState::Failed, Some(failure.message.clone()))
                    .await;
                Some(failure)
            }
        };

        ServiceOutcome {
            name: self.service.name.clone(),
            state: run.state,
            action: self.action,
            attempts: run.attempts,
            reached_deploying: run.reached_deploying,
            failure,
            entries,
        }
    }

    /// Walk the service through its states, pushing a record for every
    /// completed step; the service record comes last, only once healthy
    async fn drive(
        &self,
        run: &mut ServiceRun,
        entries: &mut Vec<StateEntry>,
        semaphore: Arc<Semaphore>,
        mut cancel: Cancellation,
    ) -> std::result::Result<(), ServiceFailure> {
        let name = &self.service.name;
        run.advance(ServiceState::AwaitingDependencies, None).await;

        if !self.dependencies_ready {
            return Err(self.failure(
                "dependencies",
                format!(
                    "dependencies of {} are not healthy: {}",
                    name,
                    self.service.depends_on().join(", ")
                ),
            ));
        }

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(self.cancelled()),
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| self.cancelled())?
            }
        };

        run.advance(ServiceState::Deploying, None).await;

        if self.provision {
            let provisioned = self
                .with_retries("provision", &mut cancel, &mut run.attempts, || {
                    self.collaborators.provisioning.provision(&self.service)
                })
                .await?;
            tracing::info!("Provisioned {} as {}", name, provisioned.identity);
            entries.push(StateEntry::Container(StateTracker::container_record(
                &self.service,
                &provisioned.identity,
                Utc::now(),
            )));
        }

        let configured = self
            .with_retries("configure", &mut cancel, &mut run.attempts, || {
                self.collaborators
                    .configuration
                    .configure(&self.service, &self.manifest)
            })
            .await?;
        match configured.message {
            Some(message) => tracing::info!("Configured {}: {}", name, message),
            None => tracing::info!("Configured {}", name),
        }

        if let (true, Some(auth)) = (self.register, self.service.node.auth.as_ref()) {
            let handle = self
                .with_retries("register_app", &mut cancel, &mut run.attempts, || {
                    self.collaborators.identity.register_app(&self.service, auth)
                })
                .await?;
            tracing::info!("Registered {} application {} for {}", handle.provider, handle.slug, name);
            let mut record = ResourceRecord::new(Utc::now())
                .with_field("slug", handle.slug)
                .with_field("provider", handle.provider.to_string())
                .with_field("spec_hash", auth.spec_hash());
            if let Some(client_id) = handle.client_id {
                record = record.with_field("client_id", client_id);
            }
            entries.push(StateEntry::IdentityApp(record));
        }

        run.advance(ServiceState::HealthChecking, None).await;

        if self.dry_run {
            tracing::info!("[dry-run] would run health checks for {}", name);
        } else if !self.config.flags.health_monitoring {
            tracing::warn!("Health monitoring is disabled; assuming {} is healthy", name);
        } else if let Some(ref plan) = self.service.health {
            let result = self
                .engine
                .run_comprehensive(name, plan, self.config.health_check_timeout, &mut cancel)
                .await;
            run.attempts += result.attempts();
            if !result.is_healthy() {
                return Err(ServiceFailure::from_health(&result).unwrap_or_else(|| {
                    self.failure("health", format!("{} did not become healthy", name))
                }));
            }
        }

        entries.push(StateEntry::Service(ServiceRecord::for_service(
            &self.service,
            Utc::now(),
        )));
        Ok(())
    }

    /// Call a collaborator with exponential backoff between attempts
    ///
    /// Each call is bounded by `hook_timeout`; expiry counts as a failed attempt.
    async fn with_retries<T, F, Fut>(
        &self,
        step: &str,
        cancel: &mut Cancellation,
        attempts: &mut u32,
        mut call: F,
    ) -> std::result::Result<T, ServiceFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.config.retry_attempts.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            attempt += 1;
            *attempts += 1;

            let err = match tokio::time::timeout(self.config.hook_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => anyhow::anyhow!(
                    "{} of {} timed out after {:?}",
                    step,
                    self.service.name,
                    self.config.hook_timeout
                ),
            };

            if attempt >= max_attempts {
                return Err(self.failure(
                    step,
                    format!("{:#} (after {} attempt(s))", err, attempt),
                ));
            }

            let delay = retry_delay(self.config.retry_delay, attempt - 1);
            tracing::warn!(
                "{} of {} failed (attempt {}/{}), retrying in {:?}: {:#}",
                step,
                self.service.name,
                attempt,
                max_attempts,
                delay,
                err
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(self.cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn failure(&self, step: &str, message: String) -> ServiceFailure {
        ServiceFailure {
            service: self.service.name.clone(),
            kind: FailureKind::Deployment {
                step: step.to_string(),
            },
            message,
        }
    }

    fn cancelled(&self) -> ServiceFailure {
        ServiceFailure {
            service: self.service.name.clone(),
            kind: FailureKind::Cancelled,
            message: "cancelled".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::backend::{
        AppHandle, ConfigurationBackend, ConfigureResult, IdentityBackend, NotifyHook,
        ProvisionResult, ProvisioningBackend, TeardownHook,
    };
    use crate::error::KeelError;
    use crate::health::{CheckDescriptor, Probe};
    use crate::manifest::{validate, AuthSpec, ManifestParser};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Records every collaborator call; fails the listed (step, service)
    /// pairs, never finishes provisioning `hanging` and panics configuring
    /// `panicking`
    #[derive(Default)]
    struct MockBackend {
        calls: Mutex<Vec<String>>,
        failing: Vec<(&'static str, &'static str)>,
        hanging: Vec<&'static str>,
        panicking: Vec<&'static str>,
    }

    impl MockBackend {
        fn failing(pairs: &[(&'static str, &'static str)]) -> Self {
            Self {
                failing: pairs.to_vec(),
                ..Default::default()
            }
        }

        fn record(&self, step: &str, service: &str) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{} {}", step, service));
            if self.failing.iter().any(|(s, n)| *s == step && *n == service) {
                anyhow::bail!("{} refused {}", step, service);
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, call: &str) -> usize {
            self.calls().iter().filter(|c| c.as_str() == call).count()
        }
    }

    #[async_trait]
    impl ProvisioningBackend for MockBackend {
        async fn provision(&self, service: &ResolvedService) -> anyhow::Result<ProvisionResult> {
            self.record("provision", &service.name)?;
            if self.hanging.contains(&service.name.as_str()) {
                std::future::pending::<()>().await;
            }
            Ok(ProvisionResult {
                identity: format!("ct-{}", service.name),
            })
        }
    }

    #[async_trait]
    impl ConfigurationBackend for MockBackend {
        async fn configure(
            &self,
            service: &ResolvedService,
            _manifest: &Manifest,
        ) -> anyhow::Result<ConfigureResult> {
            self.record("configure", &service.name)?;
            if self.panicking.contains(&service.name.as_str()) {
                panic!("configure crashed on {}", service.name);
            }
            Ok(ConfigureResult::default())
        }
    }

    #[async_trait]
    impl IdentityBackend for MockBackend {
        async fn register_app(
            &self,
            service: &ResolvedService,
            auth: &AuthSpec,
        ) -> anyhow::Result<AppHandle> {
            self.record("register_app", &service.name)?;
            Ok(AppHandle {
                slug: auth.slug_or(&service.name).to_string(),
                provider: auth.provider,
                client_id: Some("client-1".to_string()),
            })
        }
    }

    #[async_trait]
    impl TeardownHook for MockBackend {
        async fn teardown(&self, service: &ServiceRef) -> anyhow::Result<()> {
            self.record("teardown", &service.name)
        }
    }

    #[async_trait]
    impl NotifyHook for MockBackend {
        async fn notify_dependents(
            &self,
            service: &ServiceRef,
            _dependents: &[String],
        ) -> anyhow::Result<()> {
            self.record("notify", &service.name)
        }
    }

    /// Healthy unless the check mentions a failing service; hangs for slow ones
    #[derive(Default)]
    struct MockProbe {
        failing: Vec<&'static str>,
        slow: Vec<&'static str>,
    }

    #[async_trait]
    impl Probe for MockProbe {
        async fn probe(&self, check: &CheckDescriptor) -> bool {
            let check = check.to_string();
            if self.slow.iter().any(|s| check.contains(s)) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            !self.failing.iter().any(|s| check.contains(s))
        }
    }

    const MANIFEST: &str = r#"
network:
  dns: 10.0.0.1
  gateway: 10.0.0.1
  cidr: 10.0.0.0/24
retry_delay: 1
services:
  resolver:
    ip: 10.0.0.5
    hostname: resolver.lan
  database:
    ip: 10.0.0.6
    hostname: database.lan
    depends_on: [resolver]
  webapp:
    ip: 10.0.0.7
    hostname: webapp.lan
    depends_on: [resolver]
    auth:
      provider: oidc
  frontend:
    ip: 10.0.0.8
    hostname: frontend.lan
    depends_on: [database, webapp]
"#;

    fn fixture() -> (ValidatedManifest, ExecutionPlan) {
        let manifest = ManifestParser::parse_str(MANIFEST).unwrap();
        let config = DeploymentConfig::resolve(&manifest, &Default::default());
        let validated = validate(manifest, config).unwrap();
        let plan = crate::plan::plan(&validated).unwrap();
        (validated, plan)
    }

    fn executor(backend: &Arc<MockBackend>, probe: MockProbe) -> DeploymentExecutor {
        DeploymentExecutor::new(
            Collaborators::uniform(backend.clone()),
            HealthCheckEngine::new(Arc::new(probe)),
        )
        .with_max_parallel(4)
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_deploy_persists_state() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        let backend = Arc::new(MockBackend::default());
        let (validated, plan) = fixture();

        let report = executor(&backend, MockProbe::default())
            .with_store(store.clone())
            .execute(&validated, &plan, &DeploymentState::new())
            .await
            .unwrap();

        assert!(report.succeeded());
        assert_eq!(report.phases.len(), 3);
        assert!(report.phases.iter().all(|p| p.status == PhaseState::Complete));
        assert_eq!(report.service("webapp").unwrap().action, ServiceAction::Deployed);

        // phase barrier: resolver is configured before anything that needs it
        let calls = backend.calls();
        let pos = |c: &str| calls.iter().position(|x| x == c).unwrap();
        assert!(pos("configure resolver") < pos("provision database"));
        assert!(pos("configure webapp") < pos("provision frontend"));
        assert_eq!(backend.count("register_app webapp"), 1);

        let state = store.load().await.unwrap();
        assert_eq!(state.services.len(), 4);
        assert_eq!(state.containers["database"].field("identity"), Some("ct-database"));
        assert_eq!(state.identity_apps["webapp"].field("client_id"), Some("client-1"));

        assert!(store.read_report::<DeploymentReport>(LAST_RUN_FILE).await.unwrap().is_some());
        assert!(temp.path().join(GRAPH_FILE).exists());
        let events = DeploymentLog::read(&store.log_path()).await.unwrap();
        assert!(events.iter().any(|e| e.subject == "frontend" && e.to == "healthy"));

        // a second run has nothing to do
        let again = executor(&backend, MockProbe::default())
            .with_store(store.clone())
            .execute(&validated, &plan, &state)
            .await
            .unwrap();
        assert!(again.succeeded());
        assert!(again
            .phases
            .iter()
            .flat_map(|p| &p.services)
            .all(|s| s.action == ServiceAction::Unchanged && s.state == ServiceState::Healthy));
        assert_eq!(backend.count("configure resolver"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collaborator_retries_then_fails() {
        let backend = Arc::new(MockBackend::failing(&[("provision", "resolver")]));
        let (validated, plan) = fixture();

        let report = executor(&backend, MockProbe::default())
            .with_rollback(false)
            .execute(&validated, &plan, &DeploymentState::new())
            .await
            .unwrap();

        // default retry_attempts is 3
        assert_eq!(backend.count("provision resolver"), 3);
        match report.failure_error() {
            Some(KeelError::DeploymentFailed { service, step, .. }) => {
                assert_eq!(service, "resolver");
                assert_eq!(step, "provision");
            }
            other => panic!("unexpected: {:?}", other),
        }

        // later phases never start
        assert_eq!(report.phases[0].status, PhaseState::Failed);
        assert_eq!(report.phases[1].status, PhaseState::Pending);
        assert_eq!(report.service("database").unwrap().action, ServiceAction::Skipped);
        assert_eq!(backend.count("configure database"), 0);
        assert!(report.rollback.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_steps_are_recorded_on_failure() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        let backend = Arc::new(MockBackend::failing(&[("configure", "resolver")]));
        let (validated, plan) = fixture();

        let report = executor(&backend, MockProbe::default())
            .with_store(store.clone())
            .with_rollback(false)
            .execute(&validated, &plan, &DeploymentState::new())
            .await
            .unwrap();
        assert!(!report.succeeded());
        assert_eq!(backend.count("provision resolver"), 1);

        // the container exists, the service was never deployed
        let state = store.load().await.unwrap();
        assert_eq!(state.containers["resolver"].field("identity"), Some("ct-resolver"));
        assert!(!state.services.contains_key("resolver"));

        let diff = StateTracker::diff(&validated, &state);
        assert!(!diff.resources_to_create.contains("resolver"));
        assert!(diff.to_deploy.contains("resolver"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_collaborator_times_out() {
        let backend = Arc::new(MockBackend {
            hanging: vec!["resolver"],
            ..Default::default()
        });
        let (validated, plan) = fixture();

        let exec = executor(&backend, MockProbe::default()).with_rollback(false);
        let state = DeploymentState::new();
        let run = exec.execute(&validated, &plan, &state);
        let report = tokio::time::timeout(Duration::from_secs(24 * 3600), run)
            .await
            .expect("a hanging hook must not block the run")
            .unwrap();

        assert_eq!(backend.count("provision resolver"), 3);
        match report.failure_error() {
            Some(KeelError::DeploymentFailed { service, step, .. }) => {
                assert_eq!(service, "resolver");
                assert_eq!(step, "provision");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(report
            .service("resolver")
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_names_its_service() {
        let backend = Arc::new(MockBackend {
            panicking: vec!["resolver"],
            ..Default::default()
        });
        let (validated, plan) = fixture();

        let report = executor(&backend, MockProbe::default())
            .execute(&validated, &plan, &DeploymentState::new())
            .await
            .unwrap();

        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.service, "resolver");
        assert_eq!(
            failure.kind,
            FailureKind::Deployment {
                step: "task".to_string()
            }
        );
        let resolver = report.service("resolver").unwrap();
        assert_eq!(resolver.state, ServiceState::Failed);
        assert_eq!(resolver.action, ServiceAction::Deployed);
        assert_eq!(backend.count("teardown resolver"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_cancels_siblings_and_rolls_back() {
        let temp = tempdir().unwrap();
        let store = StateStore::new(temp.path());
        let backend = Arc::new(MockBackend::default());
        let probe = MockProbe {
            failing: vec!["database"],
            slow: vec!["webapp"],
        };
        let (validated, plan) = fixture();

        let report = executor(&backend, probe)
            .with_store(store.clone())
            .execute(&validated, &plan, &DeploymentState::new())
            .await
            .unwrap();

        match report.failure_error() {
            Some(KeelError::HealthCheckFailed {
                service, attempts, ..
            }) => {
                assert_eq!(service, "database");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let webapp = report.service("webapp").unwrap();
        assert_eq!(webapp.state, ServiceState::Failed);
        assert_eq!(webapp.error.as_deref(), Some("cancelled"));

        // failed phase members first (reverse order), then phase-0
        let rollback = report.rollback.as_ref().unwrap();
        let order: Vec<&str> = rollback.entries.iter().map(|e| e.service.as_str()).collect();
        assert_eq!(order, vec!["webapp", "database", "resolver"]);
        assert!(rollback.is_clean());
        assert_eq!(backend.count("teardown frontend"), 0);

        // torn down services are forgotten
        let state = store.load().await.unwrap();
        assert!(state.services.is_empty());
        assert!(state.containers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_services_are_not_rolled_back() {
        let (validated, plan) = fixture();

        let mut prior = DeploymentState::new();
        let resolver = validated.service("resolver").unwrap();
        prior = StateTracker::update(
            &prior,
            "resolver",
            StateEntry::Service(ServiceRecord::for_service(resolver, Utc::now())),
        );
        prior = StateTracker::update(
            &prior,
            "resolver",
            StateEntry::Container(StateTracker::container_record(resolver, "ct", Utc::now())),
        );

        let failing = Arc::new(MockBackend::failing(&[("configure", "frontend")]));
        let report = executor(&failing, MockProbe::default())
            .execute(&validated, &plan, &prior)
            .await
            .unwrap();

        assert_eq!(report.service("resolver").unwrap().action, ServiceAction::Unchanged);
        assert_eq!(failing.count("provision resolver"), 0);
        let rolled: Vec<&str> = report
            .rollback
            .as_ref()
            .unwrap()
            .entries
            .iter()
            .map(|e| e.service.as_str())
            .collect();
        assert_eq!(rolled, vec!["frontend", "webapp", "database"]);
        assert_eq!(failing.count("teardown resolver"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_touches_nothing() {
        let temp = tempdir().unwrap();
        let backend = Arc::new(MockBackend::default());
        let (validated, plan) = fixture();

        let report = executor(&backend, MockProbe::default())
            .with_store(StateStore::new(temp.path().join("state")))
            .dry_run(true)
            .execute(&validated, &plan, &DeploymentState::new())
            .await
            .unwrap();

        assert!(report.succeeded());
        assert!(report.dry_run);
        assert!(backend.calls().is_empty());
        assert!(!temp.path().join("state").exists());
    }

    #[test]
    fn test_retry_delay_backs_off() {
        let base = Duration::from_secs(10);
        let first = retry_delay(base, 0);
        assert!(first >= base && first <= Duration::from_millis(12_500));
        let third = retry_delay(base, 2);
        assert!(third >= Duration::from_secs(40) && third <= Duration::from_secs(50));
        assert!(retry_delay(base, 20) <= MAX_RETRY_DELAY + MAX_RETRY_DELAY / 4);
        assert_eq!(retry_delay(Duration::ZERO, 3), Duration::ZERO);
    }
}
