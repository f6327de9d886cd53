//! Per-queue admission control.
//!
//! A queue with a `max_workers` limit is fetched from only while fewer than
//! that many of its jobs are active. The broker-wide active count comes from
//! a `JSCAN`, which is approximate; workers of the same process additionally
//! reserve a local slot before the scan so they cannot race each other past
//! the limit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::BrokerError;
use crate::manager::TaskManager;

/// Admission state shared by every worker of a process.
#[derive(Debug)]
pub struct QueueAdmission {
    limits: BTreeMap<String, Option<usize>>,
    slots: HashMap<String, Arc<Semaphore>>,
}

impl QueueAdmission {
    pub fn new(limits: BTreeMap<String, Option<usize>>) -> Self {
        let slots = limits
            .iter()
            .filter_map(|(queue, limit)| limit.map(|l| (queue.clone(), Arc::new(Semaphore::new(l)))))
            .collect();
        Self { limits, slots }
    }

    /// Builds admission state from a manager's registered tasks.
    pub fn for_manager(manager: &TaskManager) -> Self {
        Self::new(manager.queue_limits())
    }

    pub fn limits(&self) -> &BTreeMap<String, Option<usize>> {
        &self.limits
    }

    /// Selects the queues a worker may fetch from right now.
    ///
    /// Unlimited queues are always admitted. A limited queue is admitted when
    /// a local slot is free and the broker reports fewer active jobs than
    /// the limit; its slot stays reserved in the returned `Admitted`.
    pub async fn admit(&self, manager: &TaskManager) -> Result<Admitted, BrokerError> {
        let mut admitted = Admitted::default();
        for (queue, limit) in &self.limits {
            let Some(limit) = limit else {
                admitted.queues.push(queue.clone());
                continue;
            };
            let Some(slot) = self.slots.get(queue) else {
                continue;
            };
            let Ok(permit) = Arc::clone(slot).try_acquire_owned() else {
                debug!(queue = %queue, "All local slots busy");
                continue;
            };

            let processing = manager.num_processing(queue).await?;
            if processing < *limit {
                admitted.queues.push(queue.clone());
                admitted.permits.insert(queue.clone(), permit);
            } else {
                debug!(queue = %queue, processing = processing, limit = *limit, "Queue at capacity");
            }
        }
        Ok(admitted)
    }
}

/// Queues admitted for one fetch, with the slots reserved for limited ones.
#[derive(Debug, Default)]
pub struct Admitted {
    queues: Vec<String>,
    permits: HashMap<String, OwnedSemaphorePermit>,
}

impl Admitted {
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// True when at least one admitted queue is limited.
    pub fn has_limited(&self) -> bool {
        !self.permits.is_empty()
    }

    /// Takes the slot reserved for `queue`, if it is limited.
    ///
    /// Slots not taken are released when `Admitted` is dropped.
    pub fn take_permit(&mut self, queue: &str) -> Option<OwnedSemaphorePermit> {
        self.permits.remove(queue)
    }
}
