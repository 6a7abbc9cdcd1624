//! Fusion of per-endpoint states into one logical controller

use crate::domain::buttons::ButtonSet;
use crate::domain::models::{
    AxisPair, EndpointId, EndpointState, FusedState, IdentityHint, InputReport, Role, Side,
};
use crate::domain::roles::{Assignment, Resolution, RoleResolver};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Raw units a Solo stick must move off neutral before it is routed
pub const SOLO_DEVIATION_TOLERANCE: u16 = 200;

/// Combine the latest endpoint states according to the role table
pub fn fuse(
    assignments: &[(EndpointId, Assignment)],
    states: &HashMap<EndpointId, EndpointState>,
    tolerance: u16,
) -> FusedState {
    let buttons = states
        .values()
        .fold(ButtonSet::empty(), |acc, state| acc | state.buttons);

    let state_for = |role: Role| {
        assignments
            .iter()
            .find(|(_, a)| a.role == role)
            .and_then(|(id, a)| states.get(id).map(|s| (s, a.side)))
    };

    if let Some((solo, side)) = state_for(Role::Solo) {
        let left = (solo.sticks.left, Side::Left);
        let right = (solo.sticks.right, Side::Right);
        let (native, other) = match side {
            Side::Left => (left, right),
            Side::Right => (right, left),
        };
        let routed = [native, other]
            .into_iter()
            .find(|(pair, _)| pair.deviates(tolerance));
        return FusedState {
            buttons,
            left_axis: routed.map_or(AxisPair::NEUTRAL, |(pair, _)| pair),
            left_source: routed.map(|(_, side)| side),
            ..Default::default()
        };
    }

    let left = state_for(Role::Left).map(|(s, _)| s.sticks.left);
    let right = state_for(Role::Right).map(|(s, _)| s.sticks.right);
    FusedState {
        buttons,
        left_axis: left.unwrap_or(AxisPair::NEUTRAL),
        right_axis: right.unwrap_or(AxisPair::NEUTRAL),
        left_source: left.map(|_| Side::Left),
        right_source: right.map(|_| Side::Right),
    }
}

/// Result of one mutation of the fusion table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionUpdate {
    pub fused: FusedState,
    pub resolution: Resolution,
    /// The degraded flag flipped with this update
    pub degraded_changed: bool,
}

#[derive(Debug, Default)]
struct FusionTable {
    states: HashMap<EndpointId, EndpointState>,
    resolver: RoleResolver,
}

impl FusionTable {
    fn refresh(&mut self, tolerance: u16) -> FusionUpdate {
        let was_degraded = self.resolver.is_degraded();
        let resolution = self.resolver.resolve(&self.states);
        if resolution.changed {
            info!("Roles updated: {:?}", resolution.assignments);
        }
        FusionUpdate {
            fused: fuse(&resolution.assignments, &self.states, tolerance),
            degraded_changed: was_degraded != resolution.degraded,
            resolution,
        }
    }
}

/// Endpoint-state and role tables behind one lock.
///
/// Mutated by the notification path, read by any polling path.
#[derive(Debug)]
pub struct ControllerFusion {
    table: Mutex<FusionTable>,
    tolerance: u16,
}

impl Default for ControllerFusion {
    fn default() -> Self {
        Self::new(SOLO_DEVIATION_TOLERANCE)
    }
}

impl ControllerFusion {
    pub fn new(tolerance: u16) -> Self {
        Self {
            table: Mutex::new(FusionTable::default()),
            tolerance,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FusionTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a newly connected endpoint
    pub fn connect(&self, id: &EndpointId, hint: Option<IdentityHint>) -> FusionUpdate {
        let mut table = self.lock();
        table.resolver.add_endpoint(id);
        if let Some(hint) = hint {
            table.resolver.update_identity(id, hint);
        }
        table.refresh(self.tolerance)
    }

    pub fn identify(&self, id: &EndpointId, hint: IdentityHint) -> FusionUpdate {
        let mut table = self.lock();
        table.resolver.update_identity(id, hint);
        table.refresh(self.tolerance)
    }

    /// Fold a decoded report into the endpoint's state and re-fuse
    pub fn ingest(&self, id: &EndpointId, report: &InputReport) -> FusionUpdate {
        let mut table = self.lock();
        if table.resolver.add_endpoint(id) {
            debug!("First report from unannounced endpoint {}", id);
        }
        table.states.entry(id.clone()).or_default().absorb(report);
        table.refresh(self.tolerance)
    }

    /// Drop an endpoint; `None` if it was not known
    pub fn disconnect(&self, id: &EndpointId) -> Option<FusionUpdate> {
        let mut table = self.lock();
        let had_state = table.states.remove(id).is_some();
        let known = table.resolver.remove_endpoint(id);
        if !known && !had_state {
            return None;
        }
        info!("Endpoint {} removed", id);
        Some(table.refresh(self.tolerance))
    }

    /// Forget every endpoint, state and role
    pub fn force_clear(&self) {
        let mut table = self.lock();
        table.states.clear();
        table.resolver.clear();
        info!("Fusion state cleared");
    }

    pub fn snapshot(&self) -> FusedState {
        let table = self.lock();
        let assignments: Vec<_> = table
            .resolver
            .endpoints()
            .iter()
            .filter_map(|id| table.resolver.assignment(id).map(|a| (id.clone(), a)))
            .collect();
        fuse(&assignments, &table.states, self.tolerance)
    }

    pub fn endpoint_count(&self) -> usize {
        self.lock().resolver.endpoints().len()
    }

    pub fn endpoints(&self) -> Vec<EndpointId> {
        self.lock().resolver.endpoints().to_vec()
    }

    pub fn role_of(&self, id: &EndpointId) -> Option<Role> {
        self.lock().resolver.role_of(id)
    }

    pub fn state_of(&self, id: &EndpointId) -> Option<EndpointState> {
        self.lock().states.get(id).copied()
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().resolver.is_degraded()
    }
}
