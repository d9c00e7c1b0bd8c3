//! Resource-access protocols: mutex, priority inheritance, priority ceiling.
//!
//! Protocols are a closed set dispatched through [`Protocol`]. They own the
//! per-run lock state (owners, waiter queues, inherited priorities, the PCP
//! system ceiling) and are reset on engine rebuild. All priority values are
//! raw `f64` in the active scheduler's domain (see [`PriorityDomain`]):
//! higher wins, and under EDF every value is a negated absolute deadline.
//!
//! Request/release results are returned as data; the engine turns them into
//! trace events (`SegmentBlocked`, `PriorityRaise`, `CeilingPush`, ...) so
//! no protocol touches the bus directly.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::events::BlockReason;
use crate::model::ProtocolKind;
use crate::types::{CoreId, Priority, ResourceId, SegmentKey};

const PRIO_EPS: f64 = 1e-12;

/// Which numeric domain priorities (and PCP ceilings) live in.
///
/// Mixing static-priority ceilings with EDF deadlines is the classic
/// coupling bug; the engine configures every protocol with the scheduler's
/// canonical domain and refreshes EDF ceilings on each release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityDomain {
    FixedPriority,
    AbsoluteDeadline,
}

/// Static per-resource facts a protocol needs.
#[derive(Debug, Clone)]
pub struct ResourceRuntime {
    pub bound_core_id: CoreId,
    /// PCP ceiling in the active priority domain.
    pub ceiling: f64,
}

/// One effective-priority change to apply to a segment.
#[derive(Debug, Clone)]
pub struct PriorityUpdate {
    pub segment_key: SegmentKey,
    pub from: f64,
    pub to: f64,
    /// The waiter whose priority is being inherited, for raises caused by
    /// a blocking relation. `None` for ceiling-driven raises and restores.
    pub due_to: Option<SegmentKey>,
}

/// A segment woken by a release or cancellation.
#[derive(Debug, Clone)]
pub struct Woken {
    pub segment_key: SegmentKey,
    pub resource_id: ResourceId,
}

/// Result of a resource request.
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    pub granted: bool,
    pub reason: Option<BlockReason>,
    pub owner_segment: Option<SegmentKey>,
    pub system_ceiling: Option<f64>,
    /// `(resource ceiling, new system ceiling)` when a PCP grant raised
    /// the system ceiling stack.
    pub ceiling_push: Option<(f64, f64)>,
    pub priority_updates: Vec<PriorityUpdate>,
}

impl RequestOutcome {
    fn granted() -> Self {
        RequestOutcome {
            granted: true,
            ..Default::default()
        }
    }

    fn blocked(reason: BlockReason) -> Self {
        RequestOutcome {
            granted: false,
            reason: Some(reason),
            ..Default::default()
        }
    }
}

/// Result of a release or cancellation.
#[derive(Debug, Clone, Default)]
pub struct ReleaseOutcome {
    /// False when the caller did not hold the resource (an engine-level
    /// invariant violation on every non-cancel path).
    pub released: bool,
    pub woken: Vec<Woken>,
    pub priority_updates: Vec<PriorityUpdate>,
    /// `(resource, new system ceiling)` for every PCP stack pop.
    pub ceiling_pops: Vec<(ResourceId, Option<f64>)>,
}

/// Priority-ordered waiter queue: FIFO among equal priorities.
#[derive(Debug, Default, Clone)]
struct WaiterQueue {
    entries: Vec<(u64, SegmentKey, f64)>,
}

impl WaiterQueue {
    fn push(&mut self, order: &mut u64, segment: &SegmentKey, priority: f64) {
        for entry in &mut self.entries {
            if &entry.1 == segment {
                entry.2 = entry.2.max(priority);
                return;
            }
        }
        self.entries.push((*order, segment.clone(), priority));
        *order += 1;
    }

    fn remove(&mut self, segment: &SegmentKey) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(_, key, _)| key != segment);
        self.entries.len() != before
    }

    fn pop_best(&mut self) -> Option<SegmentKey> {
        if self.entries.is_empty() {
            return None;
        }
        let mut best = 0;
        for idx in 1..self.entries.len() {
            let (order, _, priority) = &self.entries[idx];
            let (best_order, _, best_priority) = &self.entries[best];
            if priority > best_priority
                || ((priority - best_priority).abs() <= PRIO_EPS && order < best_order)
            {
                best = idx;
            }
        }
        Some(self.entries.remove(best).1)
    }

    fn iter(&self) -> impl Iterator<Item = &(u64, SegmentKey, f64)> {
        self.entries.iter()
    }
}

/// FIFO mutex with bound-core enforcement. No priority manipulation.
#[derive(Debug, Default)]
pub struct MutexLock {
    bound_cores: BTreeMap<ResourceId, CoreId>,
    owners: BTreeMap<ResourceId, Option<SegmentKey>>,
    waiters: BTreeMap<ResourceId, VecDeque<SegmentKey>>,
}

impl MutexLock {
    fn configure(&mut self, resources: &BTreeMap<ResourceId, ResourceRuntime>) {
        self.bound_cores = resources
            .iter()
            .map(|(id, spec)| (id.clone(), spec.bound_core_id.clone()))
            .collect();
        self.owners = resources.keys().map(|id| (id.clone(), None)).collect();
        self.waiters.clear();
    }

    fn request(&mut self, segment: &SegmentKey, resource: &ResourceId, core: &CoreId) -> RequestOutcome {
        if self.bound_cores.get(resource) != Some(core) {
            return RequestOutcome::blocked(BlockReason::BoundCoreViolation);
        }
        let owner = self.owners.get(resource).cloned().flatten();
        match owner {
            None => {
                *self.owners.get_mut(resource).expect("configured resource") =
                    Some(segment.clone());
                RequestOutcome::granted()
            }
            Some(owner) if &owner == segment => RequestOutcome::granted(),
            Some(owner) => {
                let queue = self.waiters.entry(resource.clone()).or_default();
                if !queue.contains(segment) {
                    queue.push_back(segment.clone());
                }
                let mut outcome = RequestOutcome::blocked(BlockReason::ResourceBusy);
                outcome.owner_segment = Some(owner);
                outcome
            }
        }
    }

    fn release(&mut self, segment: &SegmentKey, resource: &ResourceId) -> ReleaseOutcome {
        let Some(owner) = self.owners.get_mut(resource) else {
            return ReleaseOutcome::default();
        };
        if owner.as_ref() != Some(segment) {
            return ReleaseOutcome::default();
        }
        *owner = None;
        let mut outcome = ReleaseOutcome {
            released: true,
            ..Default::default()
        };
        if let Some(next) = self.waiters.get_mut(resource).and_then(VecDeque::pop_front) {
            *self.owners.get_mut(resource).expect("configured resource") = Some(next.clone());
            outcome.woken.push(Woken {
                segment_key: next,
                resource_id: resource.clone(),
            });
        }
        outcome
    }

    fn cancel_segment(&mut self, segment: &SegmentKey) -> ReleaseOutcome {
        for queue in self.waiters.values_mut() {
            queue.retain(|key| key != segment);
        }
        let owned: Vec<ResourceId> = self
            .owners
            .iter()
            .filter(|(_, owner)| owner.as_ref() == Some(segment))
            .map(|(id, _)| id.clone())
            .collect();
        let mut outcome = ReleaseOutcome::default();
        for resource in owned {
            let released = self.release(segment, &resource);
            outcome.released |= released.released;
            outcome.woken.extend(released.woken);
        }
        outcome
    }
}

/// Mutex + priority inheritance along blocking chains.
#[derive(Debug, Default)]
pub struct PriorityInheritance {
    bound_cores: BTreeMap<ResourceId, CoreId>,
    owners: BTreeMap<ResourceId, Option<SegmentKey>>,
    waiters: BTreeMap<ResourceId, WaiterQueue>,
    held_by_segment: BTreeMap<SegmentKey, BTreeSet<ResourceId>>,
    base_priority: BTreeMap<SegmentKey, f64>,
    effective_priority: BTreeMap<SegmentKey, f64>,
    waiter_order: u64,
}

impl PriorityInheritance {
    fn configure(&mut self, resources: &BTreeMap<ResourceId, ResourceRuntime>) {
        *self = PriorityInheritance::default();
        self.bound_cores = resources
            .iter()
            .map(|(id, spec)| (id.clone(), spec.bound_core_id.clone()))
            .collect();
        self.owners = resources.keys().map(|id| (id.clone(), None)).collect();
    }

    fn register_priority(&mut self, segment: &SegmentKey, priority: f64) {
        self.base_priority
            .entry(segment.clone())
            .or_insert(priority);
        self.effective_priority
            .entry(segment.clone())
            .or_insert(priority);
    }

    /// Recompute a segment's effective priority from its base and the
    /// waiters on everything it holds. Returns the change, if any.
    fn recompute(&mut self, segment: &SegmentKey) -> Option<PriorityUpdate> {
        let base = *self.base_priority.get(segment)?;
        let mut inherited = base;
        let mut due_to = None;
        if let Some(held) = self.held_by_segment.get(segment) {
            for resource in held {
                if let Some(queue) = self.waiters.get(resource) {
                    for (_, waiter, priority) in queue.iter() {
                        if *priority > inherited {
                            inherited = *priority;
                            due_to = Some(waiter.clone());
                        }
                    }
                }
            }
        }
        let prev = self
            .effective_priority
            .insert(segment.clone(), inherited)
            .unwrap_or(base);
        if (prev - inherited).abs() <= PRIO_EPS {
            return None;
        }
        Some(PriorityUpdate {
            segment_key: segment.clone(),
            from: prev,
            to: inherited,
            due_to: if inherited > prev { due_to } else { None },
        })
    }

    fn request(
        &mut self,
        segment: &SegmentKey,
        resource: &ResourceId,
        core: &CoreId,
        priority: f64,
    ) -> RequestOutcome {
        if self.bound_cores.get(resource) != Some(core) {
            return RequestOutcome::blocked(BlockReason::BoundCoreViolation);
        }
        self.register_priority(segment, priority);

        let owner = self.owners.get(resource).cloned().flatten();
        match owner {
            None => {
                *self.owners.get_mut(resource).expect("configured resource") =
                    Some(segment.clone());
                self.held_by_segment
                    .entry(segment.clone())
                    .or_default()
                    .insert(resource.clone());
                let mut outcome = RequestOutcome::granted();
                outcome.priority_updates.extend(self.recompute(segment));
                outcome
            }
            Some(owner) if &owner == segment => RequestOutcome::granted(),
            Some(owner) => {
                self.waiters
                    .entry(resource.clone())
                    .or_default()
                    .push(&mut self.waiter_order, segment, priority);
                let mut outcome = RequestOutcome::blocked(BlockReason::ResourceBusy);
                outcome.priority_updates.extend(self.recompute(&owner));
                outcome.owner_segment = Some(owner);
                outcome
            }
        }
    }

    fn release(&mut self, segment: &SegmentKey, resource: &ResourceId) -> ReleaseOutcome {
        let owner = self.owners.get(resource).cloned().flatten();
        if owner.as_ref() != Some(segment) {
            return ReleaseOutcome::default();
        }
        *self.owners.get_mut(resource).expect("configured resource") = None;
        if let Some(held) = self.held_by_segment.get_mut(segment) {
            held.remove(resource);
        }

        let mut outcome = ReleaseOutcome {
            released: true,
            ..Default::default()
        };
        if let Some(next) = self
            .waiters
            .get_mut(resource)
            .and_then(WaiterQueue::pop_best)
        {
            *self.owners.get_mut(resource).expect("configured resource") = Some(next.clone());
            self.held_by_segment
                .entry(next.clone())
                .or_default()
                .insert(resource.clone());
            outcome.priority_updates.extend(self.recompute(&next));
            outcome.woken.push(Woken {
                segment_key: next,
                resource_id: resource.clone(),
            });
        }
        // The releaser's inherited priority falls back to what its
        // remaining holdings require.
        outcome.priority_updates.extend(self.recompute(segment));
        outcome
    }

    fn cancel_segment(&mut self, segment: &SegmentKey) -> ReleaseOutcome {
        let mut outcome = ReleaseOutcome::default();
        let mut affected_owners: BTreeSet<SegmentKey> = BTreeSet::new();
        for (resource, queue) in &mut self.waiters {
            if queue.remove(segment) {
                if let Some(Some(owner)) = self.owners.get(resource) {
                    if owner != segment {
                        affected_owners.insert(owner.clone());
                    }
                }
            }
        }
        let owned: Vec<ResourceId> = self
            .owners
            .iter()
            .filter(|(_, owner)| owner.as_ref() == Some(segment))
            .map(|(id, _)| id.clone())
            .collect();
        for resource in owned {
            let released = self.release(segment, &resource);
            outcome.released |= released.released;
            outcome.woken.extend(released.woken);
            outcome.priority_updates.extend(released.priority_updates);
        }
        for owner in affected_owners {
            outcome.priority_updates.extend(self.recompute(&owner));
        }
        self.held_by_segment.remove(segment);
        self.base_priority.remove(segment);
        self.effective_priority.remove(segment);
        outcome
    }
}

/// Mutex + priority ceiling: acquisition is gated on the system ceiling
/// and holders are boosted to the ceilings of what they hold.
#[derive(Debug, Default)]
pub struct PriorityCeiling {
    bound_cores: BTreeMap<ResourceId, CoreId>,
    ceilings: BTreeMap<ResourceId, f64>,
    owners: BTreeMap<ResourceId, Option<SegmentKey>>,
    waiters: BTreeMap<ResourceId, WaiterQueue>,
    held_by_segment: BTreeMap<SegmentKey, BTreeSet<ResourceId>>,
    base_priority: BTreeMap<SegmentKey, f64>,
    effective_priority: BTreeMap<SegmentKey, f64>,
    /// Segments blocked by the system ceiling while the resource itself
    /// was free, waiting for the ceiling to drop: segment -> (resource,
    /// request priority).
    ceiling_blocked: BTreeMap<SegmentKey, (ResourceId, f64)>,
    waiter_order: u64,
}

impl PriorityCeiling {
    fn configure(&mut self, resources: &BTreeMap<ResourceId, ResourceRuntime>) {
        *self = PriorityCeiling::default();
        self.bound_cores = resources
            .iter()
            .map(|(id, spec)| (id.clone(), spec.bound_core_id.clone()))
            .collect();
        self.ceilings = resources
            .iter()
            .map(|(id, spec)| (id.clone(), spec.ceiling))
            .collect();
        self.owners = resources.keys().map(|id| (id.clone(), None)).collect();
    }

    fn update_ceilings(&mut self, ceilings: &BTreeMap<ResourceId, f64>) {
        for (resource, ceiling) in ceilings {
            if let Some(slot) = self.ceilings.get_mut(resource) {
                *slot = *ceiling;
            }
        }
    }

    /// Max ceiling over currently held resources, excluding those held by
    /// `excluding` (a holder may re-lock against its own contribution).
    fn system_ceiling(&self, excluding: Option<&SegmentKey>) -> Option<f64> {
        let mut current: Option<f64> = None;
        for (resource, owner) in &self.owners {
            let Some(owner) = owner else { continue };
            if excluding == Some(owner) {
                continue;
            }
            let Some(ceiling) = self.ceilings.get(resource) else {
                continue;
            };
            current = Some(current.map_or(*ceiling, |c: f64| c.max(*ceiling)));
        }
        current
    }

    fn register_priority(&mut self, segment: &SegmentKey, priority: f64) {
        self.base_priority
            .entry(segment.clone())
            .or_insert(priority);
        self.effective_priority
            .entry(segment.clone())
            .or_insert(priority);
    }

    /// Effective priority = max(base, ceilings of held resources).
    fn recompute(&mut self, segment: &SegmentKey) -> Option<PriorityUpdate> {
        let base = *self.base_priority.get(segment)?;
        let mut effective = base;
        if let Some(held) = self.held_by_segment.get(segment) {
            for resource in held {
                if let Some(ceiling) = self.ceilings.get(resource) {
                    effective = effective.max(*ceiling);
                }
            }
        }
        let prev = self
            .effective_priority
            .insert(segment.clone(), effective)
            .unwrap_or(base);
        if (prev - effective).abs() <= PRIO_EPS {
            return None;
        }
        Some(PriorityUpdate {
            segment_key: segment.clone(),
            from: prev,
            to: effective,
            due_to: None,
        })
    }

    fn request(
        &mut self,
        segment: &SegmentKey,
        resource: &ResourceId,
        core: &CoreId,
        priority: f64,
    ) -> RequestOutcome {
        if self.bound_cores.get(resource) != Some(core) {
            return RequestOutcome::blocked(BlockReason::BoundCoreViolation);
        }
        self.register_priority(segment, priority);
        self.ceiling_blocked.remove(segment);

        let owner = self.owners.get(resource).cloned().flatten();
        match owner {
            None => {
                let system_ceiling = self.system_ceiling(Some(segment));
                if let Some(ceiling) = system_ceiling {
                    if priority <= ceiling + PRIO_EPS {
                        self.ceiling_blocked
                            .insert(segment.clone(), (resource.clone(), priority));
                        let mut outcome = RequestOutcome::blocked(BlockReason::SystemCeilingBlock);
                        outcome.system_ceiling = Some(ceiling);
                        return outcome;
                    }
                }
                *self.owners.get_mut(resource).expect("configured resource") =
                    Some(segment.clone());
                self.held_by_segment
                    .entry(segment.clone())
                    .or_default()
                    .insert(resource.clone());
                let mut outcome = RequestOutcome::granted();
                outcome.priority_updates.extend(self.recompute(segment));
                let resource_ceiling = self.ceilings.get(resource).copied().unwrap_or(priority);
                let new_system = self
                    .system_ceiling(None)
                    .unwrap_or(resource_ceiling);
                outcome.ceiling_push = Some((resource_ceiling, new_system));
                outcome
            }
            Some(owner) if &owner == segment => RequestOutcome::granted(),
            Some(owner) => {
                self.waiters
                    .entry(resource.clone())
                    .or_default()
                    .push(&mut self.waiter_order, segment, priority);
                let mut outcome = RequestOutcome::blocked(BlockReason::ResourceBusy);
                outcome.owner_segment = Some(owner);
                outcome
            }
        }
    }

    /// Wake ceiling-blocked segments whose target resource is free and
    /// whose priority now clears the system ceiling.
    fn wake_ceiling_blocked(&mut self) -> Vec<Woken> {
        let mut woken = Vec::new();
        let blocked: Vec<SegmentKey> = self.ceiling_blocked.keys().cloned().collect();
        for segment in blocked {
            let (resource, priority) = self.ceiling_blocked[&segment].clone();
            if self.owners.get(&resource).cloned().flatten().is_some() {
                continue;
            }
            if let Some(ceiling) = self.system_ceiling(Some(&segment)) {
                if priority <= ceiling + PRIO_EPS {
                    continue;
                }
            }
            self.ceiling_blocked.remove(&segment);
            woken.push(Woken {
                segment_key: segment,
                resource_id: resource,
            });
        }
        woken
    }

    fn release(&mut self, segment: &SegmentKey, resource: &ResourceId) -> ReleaseOutcome {
        let owner = self.owners.get(resource).cloned().flatten();
        if owner.as_ref() != Some(segment) {
            return ReleaseOutcome::default();
        }
        self.ceiling_blocked.remove(segment);
        *self.owners.get_mut(resource).expect("configured resource") = None;
        if let Some(held) = self.held_by_segment.get_mut(segment) {
            held.remove(resource);
        }

        let mut outcome = ReleaseOutcome {
            released: true,
            ..Default::default()
        };
        if let Some(next) = self
            .waiters
            .get_mut(resource)
            .and_then(WaiterQueue::pop_best)
        {
            // Ownership transfers without the ceiling contribution changing.
            *self.owners.get_mut(resource).expect("configured resource") = Some(next.clone());
            self.held_by_segment
                .entry(next.clone())
                .or_default()
                .insert(resource.clone());
            outcome.priority_updates.extend(self.recompute(&next));
            outcome.woken.push(Woken {
                segment_key: next,
                resource_id: resource.clone(),
            });
        } else {
            outcome
                .ceiling_pops
                .push((resource.clone(), self.system_ceiling(None)));
        }
        outcome.woken.extend(self.wake_ceiling_blocked());
        outcome.priority_updates.extend(self.recompute(segment));
        outcome
    }

    fn cancel_segment(&mut self, segment: &SegmentKey) -> ReleaseOutcome {
        let mut outcome = ReleaseOutcome::default();
        for queue in self.waiters.values_mut() {
            queue.remove(segment);
        }
        self.ceiling_blocked.remove(segment);
        let owned: Vec<ResourceId> = self
            .owners
            .iter()
            .filter(|(_, owner)| owner.as_ref() == Some(segment))
            .map(|(id, _)| id.clone())
            .collect();
        for resource in owned {
            let released = self.release(segment, &resource);
            outcome.released |= released.released;
            outcome.woken.extend(released.woken);
            outcome.priority_updates.extend(released.priority_updates);
            outcome.ceiling_pops.extend(released.ceiling_pops);
        }
        self.held_by_segment.remove(segment);
        self.base_priority.remove(segment);
        self.effective_priority.remove(segment);
        outcome
    }
}

#[derive(Debug)]
enum ProtocolImpl {
    Mutex(MutexLock),
    Pip(PriorityInheritance),
    Pcp(PriorityCeiling),
}

/// One protocol instance: closed dispatch plus the priority domain the
/// engine configured it for.
#[derive(Debug)]
pub struct Protocol {
    domain: PriorityDomain,
    imp: ProtocolImpl,
}

impl Protocol {
    pub fn new(kind: ProtocolKind, domain: PriorityDomain) -> Protocol {
        let imp = match kind {
            ProtocolKind::Mutex => ProtocolImpl::Mutex(MutexLock::default()),
            ProtocolKind::Pip => ProtocolImpl::Pip(PriorityInheritance::default()),
            ProtocolKind::Pcp => ProtocolImpl::Pcp(PriorityCeiling::default()),
        };
        Protocol { domain, imp }
    }

    pub fn kind(&self) -> ProtocolKind {
        match &self.imp {
            ProtocolImpl::Mutex(_) => ProtocolKind::Mutex,
            ProtocolImpl::Pip(_) => ProtocolKind::Pip,
            ProtocolImpl::Pcp(_) => ProtocolKind::Pcp,
        }
    }

    pub fn configure(&mut self, resources: &BTreeMap<ResourceId, ResourceRuntime>) {
        match &mut self.imp {
            ProtocolImpl::Mutex(p) => p.configure(resources),
            ProtocolImpl::Pip(p) => p.configure(resources),
            ProtocolImpl::Pcp(p) => p.configure(resources),
        }
    }

    pub fn domain(&self) -> PriorityDomain {
        self.domain
    }

    pub fn update_resource_ceilings(&mut self, ceilings: &BTreeMap<ResourceId, f64>) {
        if let ProtocolImpl::Pcp(p) = &mut self.imp {
            p.update_ceilings(ceilings);
        }
    }

    pub fn request(
        &mut self,
        segment: &SegmentKey,
        resource: &ResourceId,
        core: &CoreId,
        priority: Priority,
    ) -> RequestOutcome {
        match &mut self.imp {
            ProtocolImpl::Mutex(p) => p.request(segment, resource, core),
            ProtocolImpl::Pip(p) => p.request(segment, resource, core, priority.0),
            ProtocolImpl::Pcp(p) => p.request(segment, resource, core, priority.0),
        }
    }

    pub fn release(&mut self, segment: &SegmentKey, resource: &ResourceId) -> ReleaseOutcome {
        match &mut self.imp {
            ProtocolImpl::Mutex(p) => p.release(segment, resource),
            ProtocolImpl::Pip(p) => p.release(segment, resource),
            ProtocolImpl::Pcp(p) => p.release(segment, resource),
        }
    }

    pub fn cancel_segment(&mut self, segment: &SegmentKey) -> ReleaseOutcome {
        match &mut self.imp {
            ProtocolImpl::Mutex(p) => p.cancel_segment(segment),
            ProtocolImpl::Pip(p) => p.cancel_segment(segment),
            ProtocolImpl::Pcp(p) => p.cancel_segment(segment),
        }
    }
}
