//! Port allocation over the reservation table.
//!
//! The allocator reasons only about its own reservations, never about OS
//! port availability. If the host already uses a port we hand out, the
//! container create surfaces that as a driver error and the caller rolls
//! the reservation back.

use std::sync::Arc;

use metrics::gauge;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("no free port in [{min}, {max}]")]
    Exhausted { min: u16, max: u16 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct PortAllocator {
    store: Arc<Store>,
    min: u16,
    max: u16,
    /// Serializes the read-pick-insert sequence so concurrent allocations
    /// are linearizable. Row-level conflict detection in the store would
    /// catch a race anyway, but this keeps "pick smallest free" exact.
    lock: Mutex<()>,
}

impl PortAllocator {
    pub fn new(store: Arc<Store>, min: u16, max: u16) -> Self {
        Self {
            store,
            min,
            max,
            lock: Mutex::new(()),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    /// Reserve the lowest free port in the range for `instance_id`.
    pub async fn allocate(&self, instance_id: Uuid) -> Result<u16, AllocError> {
        let _guard = self.lock.lock().await;

        let reserved: Vec<u16> = self
            .store
            .list_reservations()
            .await?
            .into_iter()
            .map(|r| r.port)
            .collect();

        let mut candidate = self.min;
        for taken in &reserved {
            // list_reservations returns ports sorted ascending
            if *taken < candidate {
                continue;
            }
            if *taken == candidate {
                candidate = match candidate.checked_add(1) {
                    Some(next) => next,
                    None => {
                        return Err(AllocError::Exhausted {
                            min: self.min,
                            max: self.max,
                        });
                    }
                };
            } else {
                break;
            }
        }

        if candidate > self.max {
            return Err(AllocError::Exhausted {
                min: self.min,
                max: self.max,
            });
        }

        self.store.reserve_port(candidate, instance_id).await?;
        gauge!("modelyard_ports_reserved").increment(1.0);
        debug!(port = candidate, instance = %instance_id, "allocated port");
        Ok(candidate)
    }

    /// Reserve a specific port (used when attaching to an existing
    /// container whose port is already fixed).
    pub async fn reserve_specific(
        &self,
        port: u16,
        instance_id: Uuid,
    ) -> Result<(), AllocError> {
        let _guard = self.lock.lock().await;
        self.store.reserve_port(port, instance_id).await?;
        gauge!("modelyard_ports_reserved").increment(1.0);
        debug!(port, instance = %instance_id, "reserved specific port");
        Ok(())
    }

    /// Drop the reservation for a port. Absent reservations are fine.
    pub async fn release(&self, port: u16) -> Result<bool, StoreError> {
        let released = self.store.release_port(port).await?;
        if released {
            gauge!("modelyard_ports_reserved").decrement(1.0);
            debug!(port, "released port");
        }
        Ok(released)
    }

    pub async fn lookup(&self, instance_id: Uuid) -> Result<Option<u16>, StoreError> {
        self.store.lookup_port(instance_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn allocator(min: u16, max: u16) -> PortAllocator {
        let store = Arc::new(Store::connect(":memory:").await.unwrap());
        PortAllocator::new(store, min, max)
    }

    #[tokio::test]
    async fn allocates_lowest_free_port() {
        let alloc = allocator(8001, 8003).await;
        assert_eq!(alloc.allocate(Uuid::new_v4()).await.unwrap(), 8001);
        assert_eq!(alloc.allocate(Uuid::new_v4()).await.unwrap(), 8002);
        assert_eq!(alloc.allocate(Uuid::new_v4()).await.unwrap(), 8003);
    }

    #[tokio::test]
    async fn released_port_is_reused_first() {
        let alloc = allocator(8001, 8003).await;
        let id = Uuid::new_v4();
        assert_eq!(alloc.allocate(id).await.unwrap(), 8001);
        assert_eq!(alloc.allocate(Uuid::new_v4()).await.unwrap(), 8002);

        alloc.release(8001).await.unwrap();
        assert_eq!(alloc.allocate(Uuid::new_v4()).await.unwrap(), 8001);
    }

    #[tokio::test]
    async fn exhausted_range_fails_without_side_effects() {
        let alloc = allocator(8001, 8002).await;
        alloc.allocate(Uuid::new_v4()).await.unwrap();
        alloc.allocate(Uuid::new_v4()).await.unwrap();

        let err = alloc.allocate(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AllocError::Exhausted { .. }));

        // No extra reservation appeared.
        let reservations = alloc.store.list_reservations().await.unwrap();
        assert_eq!(reservations.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_allocations_get_distinct_ports() {
        let alloc = Arc::new(allocator(8001, 8064).await);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let alloc = Arc::clone(&alloc);
            handles.push(tokio::spawn(async move {
                alloc.allocate(Uuid::new_v4()).await.unwrap()
            }));
        }

        let mut ports = Vec::new();
        for handle in handles {
            ports.push(handle.await.unwrap());
        }
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 32, "allocations must be unique");
    }

    #[tokio::test]
    async fn lookup_finds_owner() {
        let alloc = allocator(8001, 8003).await;
        let id = Uuid::new_v4();
        let port = alloc.allocate(id).await.unwrap();
        assert_eq!(alloc.lookup(id).await.unwrap(), Some(port));
        assert_eq!(alloc.lookup(Uuid::new_v4()).await.unwrap(), None);
    }
}
