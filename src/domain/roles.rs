//! Role assignment for connected controller halves
//!
//! Every time the inventory changes or a new report arrives the resolver
//! walks an evidence cascade. Each pass only fills roles that are still
//! free:
//!
//! 1. identity name hint (`"Joy-Con 2 (L)"`), pinned for the connection
//! 2. declared product code, pinned for the connection
//! 3. sticky unused-stick-slot flags
//! 4. a lone endpoint becomes [`Role::Solo`]
//! 5. anything left takes a free role in discovery order (degraded)

use crate::domain::models::{
    EndpointId, EndpointState, IdentityHint, Role, Side, PRODUCT_CODE_LEFT, PRODUCT_CODE_RIGHT,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Where a role assignment came from, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Evidence {
    IdentityName,
    ProductCode,
    UnusedSlots,
    SoloDefault,
    DiscoveryOrder,
}

impl Evidence {
    /// Definitive evidence is never revoked while the endpoint stays connected
    pub fn is_definitive(self) -> bool {
        matches!(self, Evidence::IdentityName | Evidence::ProductCode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub role: Role,
    /// Physical half, used for Solo axis routing
    pub side: Side,
    pub evidence: Evidence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Assigned endpoints in discovery order
    pub assignments: Vec<(EndpointId, Assignment)>,
    pub degraded: bool,
    pub changed: bool,
}

/// Side named by a device label, if it names exactly one
pub fn side_from_name(name: &str) -> Option<Side> {
    let lower = name.to_ascii_lowercase();
    let left = lower.contains("(l)") || lower.contains("left");
    let right = lower.contains("(r)") || lower.contains("right");
    match (left, right) {
        (true, false) => Some(Side::Left),
        (false, true) => Some(Side::Right),
        _ => None,
    }
}

pub fn side_from_product_code(code: u16) -> Option<Side> {
    match code {
        PRODUCT_CODE_LEFT => Some(Side::Left),
        PRODUCT_CODE_RIGHT => Some(Side::Right),
        _ => None,
    }
}

/// Side implied by which stick slot is permanently absent
pub fn side_from_unused_slots(state: &EndpointState) -> Option<Side> {
    match (state.left_slot_is_unused, state.right_slot_is_unused) {
        (false, true) => Some(Side::Left),
        (true, false) => Some(Side::Right),
        _ => None,
    }
}

#[derive(Default)]
struct Claims {
    left: Option<(EndpointId, Evidence)>,
    right: Option<(EndpointId, Evidence)>,
}

impl Claims {
    fn slot(&mut self, side: Side) -> &mut Option<(EndpointId, Evidence)> {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    fn try_claim(&mut self, side: Side, id: &EndpointId, evidence: Evidence) -> bool {
        let slot = self.slot(side);
        if slot.is_some() {
            return false;
        }
        *slot = Some((id.clone(), evidence));
        true
    }

    fn holds(&self, id: &EndpointId) -> bool {
        [&self.left, &self.right]
            .into_iter()
            .any(|slot| slot.as_ref().is_some_and(|(held, _)| held == id))
    }

    fn side_of(&self, id: &EndpointId) -> Option<(Side, Evidence)> {
        if let Some((held, ev)) = &self.left {
            if held == id {
                return Some((Side::Left, *ev));
            }
        }
        if let Some((held, ev)) = &self.right {
            if held == id {
                return Some((Side::Right, *ev));
            }
        }
        None
    }
}

/// Stateful role table for the current endpoint inventory
#[derive(Debug, Default)]
pub struct RoleResolver {
    inventory: Vec<EndpointId>,
    hints: HashMap<EndpointId, IdentityHint>,
    pinned: HashMap<EndpointId, (Side, Evidence)>,
    assignments: HashMap<EndpointId, Assignment>,
    degraded: bool,
}

impl RoleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint; returns false if it was already known
    pub fn add_endpoint(&mut self, id: &EndpointId) -> bool {
        if self.inventory.contains(id) {
            return false;
        }
        debug!("Endpoint {} added to role inventory", id);
        self.inventory.push(id.clone());
        true
    }

    pub fn update_identity(&mut self, id: &EndpointId, hint: IdentityHint) {
        self.add_endpoint(id);
        if let Some((pinned_side, _)) = self.pinned.get(id) {
            let claimed = side_from_name(&hint.name)
                .or_else(|| hint.product_code.and_then(side_from_product_code));
            if claimed.is_some_and(|side| side != *pinned_side) {
                warn!(
                    "Identity update for {} contradicts pinned side {:?}; keeping it",
                    id, pinned_side
                );
            }
        }
        self.hints.insert(id.clone(), hint);
    }

    /// Forget an endpoint and everything learned about it
    pub fn remove_endpoint(&mut self, id: &EndpointId) -> bool {
        let known = self.inventory.contains(id);
        self.inventory.retain(|e| e != id);
        self.hints.remove(id);
        self.pinned.remove(id);
        self.assignments.remove(id);
        known
    }

    pub fn clear(&mut self) {
        self.inventory.clear();
        self.hints.clear();
        self.pinned.clear();
        self.assignments.clear();
        self.degraded = false;
    }

    pub fn endpoints(&self) -> &[EndpointId] {
        &self.inventory
    }

    pub fn assignment(&self, id: &EndpointId) -> Option<Assignment> {
        self.assignments.get(id).copied()
    }

    pub fn role_of(&self, id: &EndpointId) -> Option<Role> {
        self.assignment(id).map(|a| a.role)
    }

    /// Endpoint currently holding `role`
    pub fn endpoint_for(&self, role: Role) -> Option<&EndpointId> {
        self.inventory
            .iter()
            .find(|id| self.role_of(id) == Some(role))
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Re-run the evidence cascade against the latest endpoint states
    pub fn resolve(&mut self, states: &HashMap<EndpointId, EndpointState>) -> Resolution {
        let mut claims = Claims::default();

        // Earlier definitive evidence stays put.
        for id in &self.inventory {
            if let Some((side, evidence)) = self.pinned.get(id) {
                claims.try_claim(*side, id, *evidence);
            }
        }

        // Pass 1: identity name
        for id in &self.inventory {
            if claims.holds(id) {
                continue;
            }
            let side = self.hints.get(id).and_then(|h| side_from_name(&h.name));
            if let Some(side) = side {
                if claims.try_claim(side, id, Evidence::IdentityName) {
                    info!("Endpoint {} identified as {:?} by name", id, side);
                    self.pinned.insert(id.clone(), (side, Evidence::IdentityName));
                }
            }
        }

        // Pass 2: product code
        for id in &self.inventory {
            if claims.holds(id) {
                continue;
            }
            let side = self
                .hints
                .get(id)
                .and_then(|h| h.product_code)
                .and_then(side_from_product_code);
            if let Some(side) = side {
                if claims.try_claim(side, id, Evidence::ProductCode) {
                    info!("Endpoint {} identified as {:?} by product code", id, side);
                    self.pinned.insert(id.clone(), (side, Evidence::ProductCode));
                }
            }
        }

        // Pass 3: sticky unused stick slots
        for id in &self.inventory {
            if claims.holds(id) {
                continue;
            }
            if let Some(side) = states.get(id).and_then(side_from_unused_slots) {
                claims.try_claim(side, id, Evidence::UnusedSlots);
            }
        }

        let mut next = HashMap::new();
        let mut degraded = false;

        if let [only] = self.inventory.as_slice() {
            // Pass 4: solo
            let (side, evidence) = claims
                .side_of(only)
                .unwrap_or((Side::Left, Evidence::SoloDefault));
            next.insert(
                only.clone(),
                Assignment {
                    role: Role::Solo,
                    side,
                    evidence,
                },
            );
        } else {
            for id in &self.inventory {
                if let Some((side, evidence)) = claims.side_of(id) {
                    next.insert(
                        id.clone(),
                        Assignment {
                            role: side.into(),
                            side,
                            evidence,
                        },
                    );
                }
            }

            // Pass 5: discovery order
            for id in &self.inventory {
                if next.contains_key(id) {
                    continue;
                }
                let free = [Side::Left, Side::Right]
                    .into_iter()
                    .find(|side| claims.slot(*side).is_none());
                degraded = true;
                match free {
                    Some(side) => {
                        claims.try_claim(side, id, Evidence::DiscoveryOrder);
                        next.insert(
                            id.clone(),
                            Assignment {
                                role: side.into(),
                                side,
                                evidence: Evidence::DiscoveryOrder,
                            },
                        );
                    }
                    None => debug!("No free role for endpoint {}", id),
                }
            }
        }

        let changed = next != self.assignments;
        if degraded && !self.degraded {
            warn!("Role assignment is ambiguous; falling back to discovery order");
        }
        self.assignments = next;
        self.degraded = degraded;

        let assignments = self
            .inventory
            .iter()
            .filter_map(|id| self.assignments.get(id).map(|a| (id.clone(), *a)))
            .collect();

        Resolution {
            assignments,
            degraded,
            changed,
        }
    }
}
