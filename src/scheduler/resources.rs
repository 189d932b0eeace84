//! Resource ledger for process allocation.
//!
//! The ledger tracks remaining `cpu` and `memory` units. Allocations are
//! clamped to what remains, so counters never go negative. Every grant is
//! recorded by id until released; releasing an unknown or already released
//! grant returns nothing to the pool.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A pair of resource quantities
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: f64,
    pub memory: f64,
}

/// Resources reserved for one run of a process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub id: Uuid,
    pub requested: Resources,
    pub granted: Resources,
    /// True when the ledger could not cover the full request
    pub clamped: bool,
}

/// Remaining capacity of a scheduler
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceLedger {
    capacity: Resources,
    available: Resources,
    grants: HashMap<Uuid, Resources>,
}

impl Resources {
    pub fn new(cpu: f64, memory: f64) -> Self {
        Self { cpu, memory }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_non_negative(&self) -> bool {
        self.cpu >= 0.0 && self.memory >= 0.0
    }

    /// Scale both quantities, clamping the factor to 0.0..=1.0
    pub fn scaled(&self, fraction: f64) -> Self {
        let fraction = fraction.clamp(0.0, 1.0);
        Self {
            cpu: self.cpu * fraction,
            memory: self.memory * fraction,
        }
    }

    fn min(&self, other: &Resources) -> Self {
        Self {
            cpu: self.cpu.min(other.cpu).max(0.0),
            memory: self.memory.min(other.memory).max(0.0),
        }
    }
}

impl ResourceGrant {
    /// Grant carrying nothing, for runs outside a scheduler
    pub fn none() -> Self {
        Self {
            id: Uuid::nil(),
            requested: Resources::zero(),
            granted: Resources::zero(),
            clamped: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.granted == Resources::zero()
    }
}

impl Default for ResourceGrant {
    fn default() -> Self {
        Self::none()
    }
}

impl ResourceLedger {
    pub fn new(capacity: Resources) -> Self {
        Self {
            capacity,
            available: capacity,
            grants: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> Resources {
        self.capacity
    }

    pub fn available(&self) -> Resources {
        self.available
    }

    /// Number of grants not yet released
    pub fn outstanding(&self) -> usize {
        self.grants.len()
    }

    pub fn is_outstanding(&self, grant: &ResourceGrant) -> bool {
        self.grants.contains_key(&grant.id)
    }

    /// Reserve up to `request`, never more than what remains
    pub fn allocate(&mut self, request: Resources) -> ResourceGrant {
        let granted = request.min(&self.available);
        let clamped = granted.cpu < request.cpu || granted.memory < request.memory;

        self.available.cpu -= granted.cpu;
        self.available.memory -= granted.memory;

        let id = Uuid::new_v4();
        self.grants.insert(id, granted);

        ResourceGrant {
            id,
            requested: request,
            granted,
            clamped,
        }
    }

    /// Return a grant to the pool.
    ///
    /// Returns the amount given back, or `None` when the grant is not
    /// outstanding. The recorded amount is used, not the one carried by
    /// `grant`.
    pub fn release(&mut self, grant: &ResourceGrant) -> Option<Resources> {
        let returned = self.grants.remove(&grant.id)?;
        if self.grants.is_empty() {
            self.available = self.capacity;
        } else {
            self.available.cpu = (self.available.cpu + returned.cpu).min(self.capacity.cpu);
            self.available.memory =
                (self.available.memory + returned.memory).min(self.capacity.memory);
        }
        Some(returned)
    }

    /// Fraction of cpu capacity currently reserved
    pub fn cpu_utilization(&self) -> f64 {
        if self.capacity.cpu > 0.0 {
            1.0 - self.available.cpu / self.capacity.cpu
        } else {
            0.0
        }
    }
}
