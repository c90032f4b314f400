//! Monitoring daemons and per-trial isolation contexts.
//!
//! Only one isolation context exists at a time. Every context is destroyed
//! right after its trial, on the failure path too, and destroying a context
//! that is already gone is a no-op.

use crate::config::CollectionConfig;
use crate::error::{CollectError, Result};
use crate::mechanism::IsolationKind;
use crate::process::{CommandOutput, CommandRunner, CommandSpec, Privilege};
use crate::prometheus::MetricsBackend;
use crate::query::{Selector, Window};
use crate::timing::timed_command;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONTAINER_CLI: &str = "docker";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
}

#[derive(Clone, Debug)]
struct DaemonProcess {
    name: &'static str,
    start: CommandSpec,
    stop: CommandSpec,
}

/// The metrics collector and (optionally) the time-series store.
#[derive(Debug)]
pub struct MonitoringDaemons {
    state: DaemonState,
    collector: DaemonProcess,
    query: Option<DaemonProcess>,
    warmup: Duration,
}

impl MonitoringDaemons {
    pub fn from_config(config: &CollectionConfig) -> Result<Self> {
        let privilege = &config.privilege;
        let collector = DaemonProcess {
            name: "collector",
            start: privilege.wrap(&CommandSpec::from_line(&config.daemons.collector.start)?),
            stop: privilege.wrap(&CommandSpec::from_line(&config.daemons.collector.stop)?),
        };
        let query = match &config.daemons.query {
            Some(cmds) => Some(DaemonProcess {
                name: "query",
                start: CommandSpec::from_line(&cmds.start)?,
                stop: CommandSpec::from_line(&cmds.stop)?,
            }),
            None => None,
        };
        Ok(Self {
            state: DaemonState::Stopped,
            collector,
            query,
            warmup: config.warmup(),
        })
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == DaemonState::Running
    }

    /// Whether the time-series store lives and dies with this process.
    pub fn manages_query_daemon(&self) -> bool {
        self.query.is_some()
    }

    /// Starts both daemons if stopped, then blocks for the warm-up period.
    pub fn ensure_running(&mut self, runner: &dyn CommandRunner) -> Result<()> {
        if self.state == DaemonState::Running {
            return Ok(());
        }
        self.state = DaemonState::Starting;
        info!("starting monitoring daemons");
        for daemon in self.query.iter().chain(std::iter::once(&self.collector)) {
            if let Err(err) = runner.spawn_detached(&daemon.start) {
                self.state = DaemonState::Stopped;
                self.stop_all(runner);
                return Err(err);
            }
            debug!(daemon = daemon.name, command = %daemon.start, "daemon launched");
        }
        thread::sleep(self.warmup);
        self.state = DaemonState::Running;
        info!(warmup_ms = self.warmup.as_millis() as u64, "monitoring daemons running");
        Ok(())
    }

    /// Stops both daemons if running. Counter collection competes with
    /// wall-clock measurements, so timing trials call this first.
    pub fn ensure_stopped(&mut self, runner: &dyn CommandRunner) -> Result<()> {
        if self.state == DaemonState::Stopped {
            return Ok(());
        }
        info!("stopping monitoring daemons");
        self.state = DaemonState::Stopped;
        let mut first_error = None;
        for daemon in std::iter::once(&self.collector).chain(self.query.iter()) {
            if let Err(err) = runner.run(&daemon.stop) {
                warn!(daemon = daemon.name, error = %err, "failed to stop daemon");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stops daemons regardless of recorded state, ignoring failures.
    /// Used to clear leftovers from an interrupted run.
    pub fn force_stop(&mut self, runner: &dyn CommandRunner) {
        self.stop_all(runner);
        self.state = DaemonState::Stopped;
    }

    fn stop_all(&self, runner: &dyn CommandRunner) {
        for daemon in std::iter::once(&self.collector).chain(self.query.iter()) {
            if let Err(err) = runner.run(&daemon.stop) {
                debug!(daemon = daemon.name, error = %err, "daemon was not running");
            }
        }
    }
}

/// A synchronously executed workload and its wall-clock bounds.
#[derive(Clone, Debug)]
pub struct Execution {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub output: CommandOutput,
}

impl Execution {
    pub fn window(&self) -> Window {
        Window::between(self.start, self.end)
    }
}

fn timed(runner: &dyn CommandRunner, cmd: &CommandSpec) -> Result<Execution> {
    let start = Utc::now();
    let output = runner.run(cmd)?;
    let end = Utc::now();
    Ok(Execution { start, end, output })
}

fn is_cgroup_v2(root: &Path) -> bool {
    root.join("cgroup.controllers").is_file()
}

#[derive(Clone, Debug)]
pub struct ContainerContext {
    name: String,
    privilege: Privilege,
}

impl ContainerContext {
    pub fn new(name: impl Into<String>, privilege: Privilege) -> Self {
        Self {
            name: name.into(),
            privilege,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn selector(&self) -> Selector {
        Selector::Name(self.name.clone())
    }

    /// Runs the container to completion.
    pub fn start(&self, runner: &dyn CommandRunner, launch: &CommandSpec) -> Result<Execution> {
        let cmd = self.privilege.wrap(launch);
        info!(container = %self.name, command = %cmd, "starting container");
        timed(runner, &cmd)
    }

    /// Runs the container under `/usr/bin/time -v`, outside the privilege
    /// prefix so the report covers the client process.
    pub fn start_timed(&self, runner: &dyn CommandRunner, launch: &CommandSpec) -> Result<Execution> {
        let cmd = timed_command(&self.privilege.wrap(launch));
        info!(container = %self.name, command = %cmd, "starting timed container");
        timed(runner, &cmd)
    }

    /// Cgroup path of the (possibly exited) container.
    pub fn cgroup_id(&self, runner: &dyn CommandRunner, cgroup_root: &Path) -> Result<String> {
        let cmd = self.privilege.wrap(
            &CommandSpec::new(CONTAINER_CLI).args(["inspect", "-f", "{{.Id}}", self.name.as_str()]),
        );
        let output = runner.run(&cmd)?;
        let id = output.stdout.trim().trim_matches('\'').to_string();
        if id.is_empty() {
            return Err(CollectError::parse(
                "container inspect",
                format!("no id reported for {}", self.name),
            ));
        }
        if is_cgroup_v2(cgroup_root) {
            Ok(format!("/system.slice/docker-{}.scope", id))
        } else {
            Ok(format!("/docker/{}", id))
        }
    }

    /// Removes the container and its series. A container that never started
    /// counts as removed.
    pub fn remove(
        &self,
        runner: &dyn CommandRunner,
        backend: Option<&dyn MetricsBackend>,
    ) -> Result<()> {
        let cmd = self
            .privilege
            .wrap(&CommandSpec::new(CONTAINER_CLI).args(["rm", "-f", self.name.as_str()]));
        let removed = match runner.run(&cmd) {
            Ok(_) => {
                debug!(container = %self.name, "container removed");
                Ok(())
            }
            Err(CollectError::Command { stderr, .. })
                if stderr.to_ascii_lowercase().contains("no such container") =>
            {
                debug!(container = %self.name, "no container to remove");
                Ok(())
            }
            Err(err) => Err(err),
        };
        let purged = match backend {
            Some(backend) => backend.delete_series(&self.selector().to_string()),
            None => Ok(()),
        };
        removed.and(purged)
    }
}

#[derive(Clone, Debug)]
pub struct ControlGroup {
    name: String,
    controller: String,
    root: PathBuf,
    privilege: Privilege,
}

impl ControlGroup {
    pub fn new(
        name: impl Into<String>,
        controller: impl Into<String>,
        root: impl Into<PathBuf>,
        privilege: Privilege,
    ) -> Self {
        Self {
            name: name.into(),
            controller: controller.into(),
            root: root.into(),
            privilege,
        }
    }

    /// Path the collector labels this cgroup's series with.
    pub fn id(&self) -> String {
        format!("/{}", self.name)
    }

    pub fn selector(&self) -> Selector {
        Selector::Id(self.id())
    }

    fn spec(&self) -> String {
        format!("{}:{}", self.controller, self.name)
    }

    /// Checks both the unified and the legacy per-controller hierarchy.
    pub fn exists(&self) -> bool {
        self.root.join(&self.name).is_dir() || self.root.join(&self.controller).join(&self.name).is_dir()
    }

    pub fn create(&self, runner: &dyn CommandRunner) -> Result<()> {
        let cmd = self
            .privilege
            .wrap(&CommandSpec::new("cgcreate").args(["-g", self.spec().as_str()]));
        info!(cgroup = %self.id(), "creating cgroup");
        runner.run(&cmd)?;
        Ok(())
    }

    pub fn exec_within(&self, runner: &dyn CommandRunner, workload: &CommandSpec) -> Result<Execution> {
        let cgexec = CommandSpec::new("cgexec")
            .args(["-g", self.spec().as_str()])
            .arg(workload.program.clone())
            .args(workload.args.iter().cloned());
        let cmd = self.privilege.wrap_with_env(&cgexec);
        info!(cgroup = %self.id(), command = %workload, "running workload in cgroup");
        timed(runner, &cmd)
    }

    /// Deletes the cgroup if present, then its series.
    pub fn destroy(
        &self,
        runner: &dyn CommandRunner,
        backend: Option<&dyn MetricsBackend>,
    ) -> Result<()> {
        let deleted = if self.exists() {
            let cmd = self
                .privilege
                .wrap(&CommandSpec::new("cgdelete").args(["-g", self.spec().as_str()]));
            runner.run(&cmd).map(|_| ())
        } else {
            debug!(cgroup = %self.id(), "no cgroup to delete");
            Ok(())
        };
        let purged = match backend {
            Some(backend) => backend.delete_series(&self.selector().to_string()),
            None => Ok(()),
        };
        deleted.and(purged)
    }
}

/// Owns the daemons and isolation contexts for one collection run.
pub struct Lifecycle<'a> {
    runner: &'a dyn CommandRunner,
    backend: &'a dyn MetricsBackend,
    daemons: MonitoringDaemons,
    container: ContainerContext,
    cgroup: ControlGroup,
    cgroup_root: PathBuf,
    active: Option<IsolationKind>,
}

impl<'a> Lifecycle<'a> {
    pub fn new(
        config: &CollectionConfig,
        runner: &'a dyn CommandRunner,
        backend: &'a dyn MetricsBackend,
    ) -> Result<Self> {
        let iso = &config.isolation;
        Ok(Self {
            runner,
            backend,
            daemons: MonitoringDaemons::from_config(config)?,
            container: ContainerContext::new(iso.container_name.clone(), config.privilege.clone()),
            cgroup: ControlGroup::new(
                iso.cgroup_name.clone(),
                iso.cgroup_controller.clone(),
                iso.cgroup_root.clone(),
                config.privilege.clone(),
            ),
            cgroup_root: iso.cgroup_root.clone(),
            active: None,
        })
    }

    pub fn runner(&self) -> &'a dyn CommandRunner {
        self.runner
    }

    pub fn backend(&self) -> &'a dyn MetricsBackend {
        self.backend
    }

    pub fn daemon_state(&self) -> DaemonState {
        self.daemons.state()
    }

    pub fn active(&self) -> Option<IsolationKind> {
        self.active
    }

    pub fn container(&self) -> &ContainerContext {
        &self.container
    }

    pub fn cgroup(&self) -> &ControlGroup {
        &self.cgroup
    }

    pub fn ensure_daemons_running(&mut self) -> Result<()> {
        self.daemons.ensure_running(self.runner)
    }

    pub fn ensure_daemons_stopped(&mut self) -> Result<()> {
        self.daemons.ensure_stopped(self.runner)
    }

    pub fn start_container(&mut self, launch: &CommandSpec) -> Result<Execution> {
        self.claim(IsolationKind::Container)?;
        self.container.start(self.runner, launch)
    }

    pub fn start_container_timed(&mut self, launch: &CommandSpec) -> Result<Execution> {
        self.claim(IsolationKind::Container)?;
        self.container.start_timed(self.runner, launch)
    }

    pub fn container_cgroup_id(&self) -> Result<String> {
        self.container.cgroup_id(self.runner, &self.cgroup_root)
    }

    pub fn create_cgroup(&mut self) -> Result<()> {
        self.claim(IsolationKind::ControlGroup)?;
        self.cgroup.create(self.runner)
    }

    pub fn exec_in_cgroup(&self, workload: &CommandSpec) -> Result<Execution> {
        self.cgroup.exec_within(self.runner, workload)
    }

    /// Destroys the context of `kind`. Series are purged whenever the store
    /// is reachable.
    pub fn teardown(&mut self, kind: IsolationKind) -> Result<()> {
        let backend = self.purge_backend();
        let result = match kind {
            IsolationKind::Container => self.container.remove(self.runner, backend),
            IsolationKind::ControlGroup => self.cgroup.destroy(self.runner, backend),
        };
        if self.active == Some(kind) {
            self.active = None;
        }
        result.map_err(|err| self.cleanup_error(kind, err))
    }

    /// Clears contexts and daemons an interrupted earlier run may have left.
    /// Series are purged before the daemons are stopped, since a store left
    /// running by that run still holds them; a store that cannot be reached
    /// is logged and skipped.
    pub fn teardown_all(&mut self) -> Result<()> {
        let container = self
            .container
            .remove(self.runner, None)
            .map_err(|err| self.cleanup_error(IsolationKind::Container, err));
        let cgroup = self
            .cgroup
            .destroy(self.runner, None)
            .map_err(|err| self.cleanup_error(IsolationKind::ControlGroup, err));
        self.active = None;
        for selector in [self.container.selector(), self.cgroup.selector()] {
            if let Err(err) = self.backend.delete_series(&selector.to_string()) {
                warn!(selector = %selector, error = %err, "could not purge leftover series");
            }
        }
        self.daemons.force_stop(self.runner);
        container.and(cgroup)
    }

    /// Stops the daemons at the end of a run.
    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(kind) = self.active {
            if let Err(err) = self.teardown(kind) {
                warn!(error = %err, "failed to tear down context at shutdown");
            }
        }
        self.daemons.ensure_stopped(self.runner)
    }

    fn cleanup_error(&self, kind: IsolationKind, err: CollectError) -> CollectError {
        CollectError::Cleanup {
            context: match kind {
                IsolationKind::Container => format!("container {}", self.container.name()),
                IsolationKind::ControlGroup => format!("cgroup {}", self.cgroup.id()),
            },
            message: err.to_string(),
        }
    }

    fn purge_backend(&self) -> Option<&'a dyn MetricsBackend> {
        if self.daemons.is_running() || !self.daemons.manages_query_daemon() {
            Some(self.backend)
        } else {
            None
        }
    }

    /// Destroys whatever context is still alive before a new one is created.
    fn claim(&mut self, kind: IsolationKind) -> Result<()> {
        if let Some(previous) = self.active {
            warn!(?previous, "previous isolation context still active, tearing it down");
            self.teardown(previous)?;
        }
        self.active = Some(kind);
        Ok(())
    }
}
