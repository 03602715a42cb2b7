//! Bookkeeping shared by the backends

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;
use vizbroker_core::{BrokerError, BrokerResult, UserId};

/// Live reservations of one backend
#[derive(Debug, Default)]
pub struct ReservationBook {
    live: RwLock<HashMap<Uuid, Vec<String>>>,
}

impl ReservationBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: Uuid, hosts: Vec<String>) {
        self.live.write().await.insert(id, hosts);
    }

    pub async fn remove(&self, id: Uuid) -> bool {
        self.live.write().await.remove(&id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.live.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.live.read().await.is_empty()
    }
}

/// State common to every reservation handle
#[derive(Debug)]
pub struct ReservationState {
    pub id: Uuid,
    pub backend: &'static str,
    pub user: UserId,
    pub hosts: Vec<String>,
    /// Set on owning handles only
    book: Option<Arc<ReservationBook>>,
    released: AtomicBool,
}

impl ReservationState {
    pub fn owning(
        backend: &'static str,
        user: UserId,
        hosts: Vec<String>,
        book: Arc<ReservationBook>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend,
            user,
            hosts,
            book: Some(book),
            released: AtomicBool::new(false),
        }
    }

    /// Non-owning copy; shares the id but can never tear anything down
    pub fn reference(&self) -> Self {
        Self {
            id: self.id,
            backend: self.backend,
            user: self.user,
            hosts: self.hosts.clone(),
            book: None,
            released: AtomicBool::new(self.is_released()),
        }
    }

    pub fn is_reference(&self) -> bool {
        self.book.is_none()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub async fn release(&self) -> BrokerResult<()> {
        let Some(book) = &self.book else {
            return Ok(());
        };
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if book.remove(self.id).await {
            debug!(reservation = %self.id, backend = self.backend, "Reservation released");
        } else {
            warn!(
                reservation = %self.id,
                backend = self.backend,
                "Reservation was not known to its backend"
            );
        }
        Ok(())
    }

    /// Fail unless `host` belongs to this reservation and it is still live
    pub fn check_host(&self, host: &str) -> BrokerResult<()> {
        if self.is_released() {
            return Err(BrokerError::Backend(format!(
                "reservation {} has been released",
                self.id
            )));
        }
        if !self.hosts.iter().any(|h| h == host) {
            return Err(BrokerError::Backend(format!(
                "host '{}' is not part of reservation {}",
                host, self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let book = Arc::new(ReservationBook::new());
        let state = ReservationState::owning("local", 1000, vec!["a".to_string()], book.clone());
        book.insert(state.id, state.hosts.clone()).await;
        assert_eq!(book.len().await, 1);

        state.release().await.unwrap();
        state.release().await.unwrap();
        assert!(book.is_empty().await);
        assert!(state.is_released());
    }

    #[tokio::test]
    async fn test_reference_release_is_noop() {
        let book = Arc::new(ReservationBook::new());
        let state = ReservationState::owning("ssh", 1000, vec!["a".to_string()], book.clone());
        book.insert(state.id, state.hosts.clone()).await;

        let copy = state.reference();
        assert!(copy.is_reference());
        copy.release().await.unwrap();
        assert_eq!(book.len().await, 1);
    }

    #[test]
    fn test_check_host() {
        let book = Arc::new(ReservationBook::new());
        let state = ReservationState::owning("ssh", 1000, vec!["a".to_string()], book);
        assert!(state.check_host("a").is_ok());
        assert!(state.check_host("b").is_err());
    }
}
