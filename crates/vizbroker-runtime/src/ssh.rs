//! SSH execution backend
//!
//! Launches application components on remote hosts over passwordless SSH.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::{debug, error, info};
use uuid::Uuid;
use vizbroker_core::{BackendConfig, BrokerError, BrokerResult, GroupId, UserId};

use crate::reservation::{ReservationBook, ReservationState};
use crate::traits::{Backend, Launcher};

/// SSH backend configuration
#[derive(Debug, Clone)]
pub struct SshBackendConfig {
    /// SSH client binary
    pub ssh_command: String,
    /// Wrapper run on the remote side, ahead of the command
    pub wrapper: Option<PathBuf>,
}

impl Default for SshBackendConfig {
    fn default() -> Self {
        Self {
            ssh_command: "ssh".to_string(),
            wrapper: None,
        }
    }
}

/// Backend that reaches its hosts with SSH
pub struct SshBackend {
    nodes: Vec<String>,
    drained: Vec<String>,
    config: SshBackendConfig,
    book: Arc<ReservationBook>,
}

impl SshBackend {
    /// Create a new SSH backend
    pub fn new(nodes: Vec<String>, config: SshBackendConfig) -> Self {
        Self {
            nodes,
            drained: Vec::new(),
            config,
            book: Arc::new(ReservationBook::new()),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        let mut ssh = SshBackendConfig::default();
        if let Some(cmd) = &config.ssh_command {
            ssh.ssh_command = cmd.clone();
        }
        ssh.wrapper = config.wrapper.clone();

        let mut backend = Self::new(config.nodes.clone(), ssh);
        backend.drained = config.drained.clone();
        backend
    }

    /// Live reservations handed out by this backend
    pub async fn reservation_count(&self) -> usize {
        self.book.len().await
    }
}

#[async_trait]
impl Backend for SshBackend {
    fn node_names(&self) -> Vec<String> {
        self.nodes.clone()
    }

    async fn unusable_nodes(&self) -> Vec<String> {
        self.drained.clone()
    }

    async fn allocate(
        &self,
        user: UserId,
        group: GroupId,
        hosts: &[String],
    ) -> BrokerResult<Arc<dyn Launcher>> {
        if let Some(host) = hosts.iter().find(|h| !self.nodes.contains(h)) {
            return Err(BrokerError::Backend(format!(
                "node '{}' is not managed by the ssh backend",
                host
            )));
        }

        let state = ReservationState::owning("ssh", user, hosts.to_vec(), self.book.clone());
        self.book.insert(state.id, state.hosts.clone()).await;

        info!(
            reservation = %state.id,
            user = user,
            group = group,
            hosts = ?state.hosts,
            "SSH reservation created"
        );

        Ok(Arc::new(SshReservation {
            state,
            config: self.config.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "ssh"
    }
}

/// Launcher handle of the SSH backend
#[derive(Debug)]
pub struct SshReservation {
    state: ReservationState,
    config: SshBackendConfig,
}

impl SshReservation {
    fn build_command(&self, host: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.config.ssh_command);
        cmd.arg(host);
        if let Some(wrapper) = &self.config.wrapper {
            cmd.arg(wrapper);
        }
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Launcher for SshReservation {
    fn id(&self) -> Uuid {
        self.state.id
    }

    fn backend(&self) -> &'static str {
        self.state.backend
    }

    fn hosts(&self) -> &[String] {
        &self.state.hosts
    }

    fn is_reference(&self) -> bool {
        self.state.is_reference()
    }

    fn reference(&self) -> Arc<dyn Launcher> {
        Arc::new(SshReservation {
            state: self.state.reference(),
            config: self.config.clone(),
        })
    }

    async fn release(&self) -> BrokerResult<()> {
        self.state.release().await
    }

    async fn run(&self, host: &str, args: &[String]) -> BrokerResult<Child> {
        self.state.check_host(host)?;
        if args.is_empty() {
            return Err(BrokerError::Backend("empty command line".to_string()));
        }

        let mut cmd = self.build_command(host, args);
        match cmd.spawn() {
            Ok(child) => {
                debug!(
                    reservation = %self.state.id,
                    host = host,
                    pid = child.id().unwrap_or(0),
                    "Remote process spawned"
                );
                Ok(child)
            }
            Err(e) => {
                error!(
                    reservation = %self.state.id,
                    host = host,
                    error = %e,
                    "Failed to spawn ssh"
                );
                Err(BrokerError::Backend(format!("Failed to spawn ssh: {}", e)))
            }
        }
    }
}
