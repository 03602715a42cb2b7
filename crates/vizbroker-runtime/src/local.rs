//! Local execution backend
//!
//! Runs everything on the broker's own host. Useful for single workstation
//! setups where several applications share the local GPUs.

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

/// Backend that launches processes on the local host
pub struct LocalBackend {
    nodes: Vec<String>,
    drained: Vec<String>,
    wrapper: Option<PathBuf>,
    book: Arc<ReservationBook>,
}

impl LocalBackend {
    /// Create a new local backend
    pub fn new(nodes: Vec<String>) -> Self {
        Self {
            nodes,
            drained: Vec::new(),
            wrapper: None,
            book: Arc::new(ReservationBook::new()),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            nodes: config.nodes.clone(),
            drained: config.drained.clone(),
            wrapper: config.wrapper.clone(),
            book: Arc::new(ReservationBook::new()),
        }
    }

    /// Live reservations handed out by this backend
    pub async fn reservation_count(&self) -> usize {
        self.book.len().await
    }
}

#[async_trait]
impl Backend for LocalBackend {
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
                "node '{}' is not managed by the local backend",
                host
            )));
        }

        let state = ReservationState::owning("local", user, hosts.to_vec(), self.book.clone());
        self.book.insert(state.id, state.hosts.clone()).await;

        info!(
            reservation = %state.id,
            user = user,
            group = group,
            hosts = ?state.hosts,
            "Local reservation created"
        );

        Ok(Arc::new(LocalReservation {
            state,
            wrapper: self.wrapper.clone(),
        }))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Launcher handle of the local backend
#[derive(Debug)]
pub struct LocalReservation {
    state: ReservationState,
    wrapper: Option<PathBuf>,
}

impl LocalReservation {
    /// Build the command line for `args`
    fn build_command(&self, args: &[String]) -> BrokerResult<Command> {
        let mut argv: Vec<String> = Vec::new();
        if let Some(wrapper) = &self.wrapper {
            argv.push(wrapper.to_string_lossy().into_owned());
        }
        argv.extend(args.iter().cloned());

        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| BrokerError::Backend("empty command line".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(rest);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl Launcher for LocalReservation {
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
        Arc::new(LocalReservation {
            state: self.state.reference(),
            wrapper: self.wrapper.clone(),
        })
    }

    async fn release(&self) -> BrokerResult<()> {
        self.state.release().await
    }

    async fn run(&self, host: &str, args: &[String]) -> BrokerResult<Child> {
        // "localhost" always names the broker's own host
        let host = if host == "localhost" {
            self.state.hosts.first().map(String::as_str).unwrap_or(host)
        } else {
            host
        };
        self.state.check_host(host)?;

        let mut cmd = self.build_command(args)?;
        match cmd.spawn() {
            Ok(child) => {
                debug!(
                    reservation = %self.state.id,
                    pid = child.id().unwrap_or(0),
                    "Local process spawned"
                );
                Ok(child)
            }
            Err(e) => {
                error!(reservation = %self.state.id, error = %e, "Failed to spawn local process");
                Err(BrokerError::Backend(format!("Failed to spawn process: {}", e)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> LocalBackend {
        LocalBackend::new(vec!["viz1".to_string()])
    }

    #[tokio::test]
    async fn test_allocate_and_release() {
        let backend = backend();
        let launcher = backend.allocate(1000, 100, &["viz1".to_string()]).await.unwrap();
        assert_eq!(launcher.backend(), "local");
        assert_eq!(backend.reservation_count().await, 1);

        launcher.release().await.unwrap();
        launcher.release().await.unwrap();
        assert_eq!(backend.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn test_allocate_foreign_host() {
        let backend = backend();
        let result = backend.allocate(1000, 100, &["viz9".to_string()]).await;
        assert!(matches!(result, Err(BrokerError::Backend(_))));
    }

    #[tokio::test]
    async fn test_reference_does_not_release() {
        let backend = backend();
        let launcher = backend.allocate(1000, 100, &["viz1".to_string()]).await.unwrap();
        let copy = launcher.reference();
        assert!(copy.is_reference());
        assert_eq!(copy.id(), launcher.id());

        copy.release().await.unwrap();
        assert_eq!(backend.reservation_count().await, 1);
    }

    #[tokio::test]
    async fn test_build_command_with_wrapper() {
        let mut backend = backend();
        backend.wrapper = Some(PathBuf::from("/opt/vizstack/bin/vs-aew"));
        let launcher = backend.allocate(1000, 100, &["viz1".to_string()]).await.unwrap();

        let reservation = LocalReservation {
            state: ReservationState::owning("local", 1000, launcher.hosts().to_vec(), backend.book.clone()),
            wrapper: backend.wrapper.clone(),
        };
        let cmd = reservation
            .build_command(&["glxinfo".to_string(), "-B".to_string()])
            .unwrap();
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "/opt/vizstack/bin/vs-aew");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, vec!["glxinfo", "-B"]);
    }

    #[tokio::test]
    async fn test_run_on_foreign_host_rejected() {
        let backend = backend();
        let launcher = backend.allocate(1000, 100, &["viz1".to_string()]).await.unwrap();
        let result = launcher.run("viz2", &["true".to_string()]).await;
        assert!(matches!(result, Err(BrokerError::Backend(_))));
    }
}
