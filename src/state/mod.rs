//! The object state registry: the single authoritative record of what exists.
//!
//! One table per object category, keyed by the handle the object had in the
//! session that recorded it. The registry never cascades: callers release
//! children before parents.

pub mod action_log;
pub mod allocation;
pub mod descriptors;
pub mod kernel_info;
pub mod objects;

use crate::{
    error::{GcrError, GcrResult},
    gpu_ptr::{GpuPtr, Void},
    handle_map::{kind, EventHandle, Handle, HandleKind},
    log::LogLevel::LogDebug,
};
use allocation::AllocationState;
use objects::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::{Display, Formatter, Result},
    ops::Bound::{Included, Unbounded},
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum ObjectCategory {
    Driver,
    Device,
    Context,
    CommandList,
    CommandQueue,
    Image,
    Module,
    Kernel,
    PhysicalMem,
    Allocation,
    EventPool,
    Event,
    Fence,
}

impl ObjectCategory {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectCategory::Driver => "driver",
            ObjectCategory::Device => "device",
            ObjectCategory::Context => "context",
            ObjectCategory::CommandList => "command list",
            ObjectCategory::CommandQueue => "command queue",
            ObjectCategory::Image => "image",
            ObjectCategory::Module => "module",
            ObjectCategory::Kernel => "kernel",
            ObjectCategory::PhysicalMem => "physical memory",
            ObjectCategory::Allocation => "allocation",
            ObjectCategory::EventPool => "event pool",
            ObjectCategory::Event => "event",
            ObjectCategory::Fence => "fence",
        }
    }
}

impl Display for ObjectCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.name())
    }
}

/// Implemented by the state of every category that is keyed by a handle.
pub trait ObjectState: Sized {
    type Kind: HandleKind;
    const CATEGORY: ObjectCategory;

    fn restored(&self) -> bool;
    fn set_restored(&mut self, restored: bool);

    fn table(registry: &StateRegistry) -> &StateTable<Self::Kind, Self>;
    fn table_mut(registry: &mut StateRegistry) -> &mut StateTable<Self::Kind, Self>;
}

struct TableEntry<S> {
    creation_id: u64,
    state: S,
}

/// Ownership table for one category.
pub struct StateTable<K, S> {
    entries: HashMap<Handle<K>, TableEntry<S>>,
}

impl<K, S> Default for StateTable<K, S> {
    fn default() -> Self {
        StateTable {
            entries: HashMap::new(),
        }
    }
}

impl<K: HandleKind, S> StateTable<K, S> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, h: Handle<K>) -> bool {
        self.entries.contains_key(&h)
    }

    pub fn creation_id(&self, h: Handle<K>) -> Option<u64> {
        self.entries.get(&h).map(|e| e.creation_id)
    }

    /// Entries in insertion order.
    pub fn ordered(&self) -> Vec<(Handle<K>, &S)> {
        let mut v: Vec<(u64, Handle<K>, &S)> = self
            .entries
            .iter()
            .map(|(&h, e)| (e.creation_id, h, &e.state))
            .collect();
        v.sort_by_key(|&(id, _, _)| id);
        v.into_iter().map(|(_, h, s)| (h, s)).collect()
    }

    pub fn ordered_with_ids(&self) -> Vec<(u64, Handle<K>, &S)> {
        let mut v: Vec<(u64, Handle<K>, &S)> = self
            .entries
            .iter()
            .map(|(&h, e)| (e.creation_id, h, &e.state))
            .collect();
        v.sort_by_key(|&(id, _, _)| id);
        v
    }

    pub fn handles(&self) -> Vec<Handle<K>> {
        self.ordered().into_iter().map(|(h, _)| h).collect()
    }
}

macro_rules! object_states {
    ($($state:ident => $kind:ident, $category:ident, $field:ident;)+) => {
        /// Owns every tracked object and allocation of a session.
        #[derive(Default)]
        pub struct StateRegistry {
            $($field: StateTable<kind::$kind, $state>,)+
            allocations: BTreeMap<GpuPtr<Void>, AllocationState>,
            /// Bases of the virtual reservations in `allocations`.
            reservations: BTreeSet<GpuPtr<Void>>,
            /// Shared by every table. Never reused.
            next_creation_id: u64,
        }

        $(
            impl ObjectState for $state {
                type Kind = kind::$kind;
                const CATEGORY: ObjectCategory = ObjectCategory::$category;

                fn restored(&self) -> bool {
                    self.restored
                }

                fn set_restored(&mut self, restored: bool) {
                    self.restored = restored;
                }

                fn table(registry: &StateRegistry) -> &StateTable<Self::Kind, Self> {
                    &registry.$field
                }

                fn table_mut(registry: &mut StateRegistry) -> &mut StateTable<Self::Kind, Self> {
                    &mut registry.$field
                }
            }
        )+

        impl StateRegistry {
            /// Number of live entries per category, allocations included.
            pub fn category_counts(&self) -> Vec<(ObjectCategory, usize)> {
                let mut v = vec![$((ObjectCategory::$category, self.$field.len()),)+];
                v.push((ObjectCategory::Allocation, self.allocations.len()));
                v
            }

            /// Mark everything not restored. Used when the same snapshot is
            /// restored into a fresh session.
            pub fn clear_restored(&mut self) {
                $(
                    for e in self.$field.entries.values_mut() {
                        e.state.restored = false;
                    }
                )+
                for a in self.allocations.values_mut() {
                    a.restored = false;
                }
            }
        }
    };
}

object_states! {
    DriverState => Driver, Driver, drivers;
    DeviceState => Device, Device, devices;
    ContextState => Context, Context, contexts;
    CommandListState => CommandList, CommandList, command_lists;
    CommandQueueState => CommandQueue, CommandQueue, command_queues;
    ImageState => Image, Image, images;
    ModuleState => Module, Module, modules;
    KernelState => Kernel, Kernel, kernels;
    PhysicalMemState => PhysicalMem, PhysicalMem, physical_mems;
    EventPoolState => EventPool, EventPool, event_pools;
    EventState => Event, Event, events;
    FenceState => Fence, Fence, fences;
}

impl StateRegistry {
    pub fn new() -> StateRegistry {
        StateRegistry::default()
    }

    fn take_creation_id(&mut self) -> u64 {
        self.next_creation_id += 1;
        self.next_creation_id
    }

    pub fn next_creation_id(&self) -> u64 {
        self.next_creation_id + 1
    }

    /// Only for rebuilding a registry from a snapshot.
    pub(crate) fn set_next_creation_id(&mut self, next: u64) {
        self.next_creation_id = next.saturating_sub(1);
    }

    /// Call exactly once, right after the creating driver call succeeded.
    pub fn insert<S: ObjectState>(&mut self, h: Handle<S::Kind>, state: S) -> u64 {
        let creation_id = self.take_creation_id();
        self.insert_with_id(h, creation_id, state);
        creation_id
    }

    pub(crate) fn insert_with_id<S: ObjectState>(
        &mut self,
        h: Handle<S::Kind>,
        creation_id: u64,
        state: S,
    ) {
        if S::table(self).contains(h) {
            fatal!(
                "{} {} inserted twice without being released",
                S::CATEGORY,
                h
            );
        }
        log!(LogDebug, "insert {} {} (#{})", S::CATEGORY, h, creation_id);
        if creation_id > self.next_creation_id {
            self.next_creation_id = creation_id;
        }
        S::table_mut(self)
            .entries
            .insert(h, TableEntry { creation_id, state });
    }

    pub fn get<S: ObjectState>(&self, h: Handle<S::Kind>) -> GcrResult<&S> {
        S::table(self)
            .entries
            .get(&h)
            .map(|e| &e.state)
            .ok_or_else(|| GcrError::not_found(S::CATEGORY.name(), h.raw()))
    }

    pub fn get_mut<S: ObjectState>(&mut self, h: Handle<S::Kind>) -> GcrResult<&mut S> {
        S::table_mut(self)
            .entries
            .get_mut(&h)
            .map(|e| &mut e.state)
            .ok_or_else(|| GcrError::not_found(S::CATEGORY.name(), h.raw()))
    }

    pub fn exists<S: ObjectState>(&self, h: Handle<S::Kind>) -> bool {
        S::table(self).contains(h)
    }

    /// Removes the entry. Does not touch children that refer to it.
    pub fn release<S: ObjectState>(&mut self, h: Handle<S::Kind>) -> Option<S> {
        let removed = S::table_mut(self).entries.remove(&h).map(|e| e.state);
        if removed.is_some() {
            log!(LogDebug, "release {} {}", S::CATEGORY, h);
        }
        removed
    }

    pub fn table<S: ObjectState>(&self) -> &StateTable<S::Kind, S> {
        S::table(self)
    }

    /// Handles of category `S` in insertion order.
    pub fn handles<S: ObjectState>(&self) -> Vec<Handle<S::Kind>> {
        S::table(self).handles()
    }

    pub fn insert_allocation(&mut self, base: GpuPtr<Void>, mut state: AllocationState) -> u64 {
        state.id = self.take_creation_id();
        let id = state.id;
        self.insert_allocation_with_id(base, state);
        id
    }

    /// `state.id` must already be set.
    pub(crate) fn insert_allocation_with_id(&mut self, base: GpuPtr<Void>, state: AllocationState) {
        if self.allocations.contains_key(&base) {
            fatal!("allocation {} inserted twice without being released", base);
        }
        log!(
            LogDebug,
            "insert {} allocation {} size {:#x} (#{})",
            state.memory_kind,
            base,
            state.size,
            state.id
        );
        if state.id > self.next_creation_id {
            self.next_creation_id = state.id;
        }
        if state.is_virtual_reservation() {
            self.reservations.insert(base);
        }
        self.allocations.insert(base, state);
    }

    pub fn allocation(&self, base: GpuPtr<Void>) -> GcrResult<&AllocationState> {
        self.allocations
            .get(&base)
            .ok_or_else(|| GcrError::not_found(ObjectCategory::Allocation.name(), base.as_u64()))
    }

    pub fn allocation_mut(&mut self, base: GpuPtr<Void>) -> GcrResult<&mut AllocationState> {
        self.allocations
            .get_mut(&base)
            .ok_or_else(|| GcrError::not_found(ObjectCategory::Allocation.name(), base.as_u64()))
    }

    pub fn allocation_exists(&self, base: GpuPtr<Void>) -> bool {
        self.allocations.contains_key(&base)
    }

    pub fn release_allocation(&mut self, base: GpuPtr<Void>) -> Option<AllocationState> {
        let removed = self.allocations.remove(&base);
        self.reservations.remove(&base);
        if removed.is_some() {
            log!(LogDebug, "release allocation {}", base);
        }
        removed
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// Allocations in ascending insertion id order.
    pub fn allocations_ordered(&self) -> Vec<(GpuPtr<Void>, &AllocationState)> {
        let mut v: Vec<(GpuPtr<Void>, &AllocationState)> =
            self.allocations.iter().map(|(&b, a)| (b, a)).collect();
        v.sort_by_key(|(_, a)| a.id);
        v
    }

    /// The allocation whose `[base, base + size)` contains `addr`.
    pub fn allocation_containing(&self, addr: GpuPtr<Void>) -> Option<(GpuPtr<Void>, &AllocationState)> {
        if let Some(a) = self.allocations.get(&addr) {
            return Some((addr, a));
        }
        // Allocations don't overlap, so the closest base below almost always decides.
        if let Some((&base, a)) = self.allocations.range((Unbounded, Included(addr))).next_back() {
            if a.range(base).contains_ptr(addr) {
                return Some((base, a));
            }
        }
        // A virtual reservation can enclose allocations made at fixed addresses
        // inside it.
        self.reservation_containing(addr)
    }

    /// The virtual reservation whose range contains `addr`.
    pub fn reservation_containing(&self, addr: GpuPtr<Void>) -> Option<(GpuPtr<Void>, &AllocationState)> {
        self.reservations
            .range((Unbounded, Included(addr)))
            .rev()
            .filter_map(|&base| self.allocations.get(&base).map(|a| (base, a)))
            .find(|(base, a)| a.range(*base).contains_ptr(addr))
    }

    /// Last observed status of every live event.
    pub fn event_signal_snapshot(&self) -> HashMap<EventHandle, bool> {
        self.events
            .entries
            .iter()
            .map(|(&h, e)| (h, e.state.signaled))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{allocation::*, descriptors::*, *};
    use crate::handle_map::{ContextHandle, DeviceHandle, DriverHandle};

    fn context_state() -> ContextState {
        ContextState {
            driver: DriverHandle::from_raw(1),
            devices: vec![DeviceHandle::from_raw(2)],
            desc: ContextDesc::default(),
            restored: false,
        }
    }

    fn alloc(size: usize) -> AllocationState {
        AllocationState::new(
            ContextHandle::from_raw(3),
            Some(DeviceHandle::from_raw(2)),
            size,
            64,
            MemoryKind::Device,
            AllocationKind::Pointer {
                device_desc: Some(DeviceMemDesc::default()),
                host_desc: None,
            },
        )
    }

    #[test]
    fn insert_get_release() {
        let mut r = StateRegistry::new();
        let h = ContextHandle::from_raw(0x30);
        r.insert(h, context_state());
        assert!(r.exists::<ContextState>(h));
        assert!(!r.get::<ContextState>(h).unwrap().restored);
        r.get_mut::<ContextState>(h).unwrap().restored = true;
        assert!(r.get::<ContextState>(h).unwrap().restored());
        assert!(r.release::<ContextState>(h).is_some());
        assert!(!r.exists::<ContextState>(h));
        let err = r.get::<ContextState>(h).unwrap_err();
        assert!(err.is_not_found());
        assert!(r.release::<ContextState>(h).is_none());
    }

    #[test]
    fn ordered_follows_insertion_not_handle_value() {
        let mut r = StateRegistry::new();
        r.insert(ContextHandle::from_raw(0x90), context_state());
        r.insert(ContextHandle::from_raw(0x10), context_state());
        r.insert(ContextHandle::from_raw(0x50), context_state());
        let handles: Vec<u64> = r.handles::<ContextState>().iter().map(|h| h.raw()).collect();
        assert_eq!(handles, vec![0x90, 0x10, 0x50]);
    }

    #[test]
    fn allocation_ids_are_monotonic_and_never_reused() {
        let mut r = StateRegistry::new();
        let a = r.insert_allocation(0x9000u64.into(), alloc(16));
        let b = r.insert_allocation(0x1000u64.into(), alloc(16));
        assert!(a < b);
        r.release_allocation(0x9000u64.into());
        let c = r.insert_allocation(0x9000u64.into(), alloc(16));
        assert!(c > b);
        let order: Vec<u64> = r
            .allocations_ordered()
            .iter()
            .map(|(base, _)| base.as_u64())
            .collect();
        assert_eq!(order, vec![0x1000, 0x9000]);
    }

    #[test]
    fn allocation_containing_ranges() {
        let mut r = StateRegistry::new();
        r.insert_allocation(0x1000u64.into(), alloc(0x100));
        r.insert_allocation(0x2000u64.into(), alloc(0x10));
        for &addr in [0x1000u64, 0x1001, 0x10ff].iter() {
            let (base, _) = r.allocation_containing(addr.into()).unwrap();
            assert_eq!(base.as_u64(), 0x1000);
        }
        assert!(r.allocation_containing(0x1100u64.into()).is_none());
        assert!(r.allocation_containing(0xfffu64.into()).is_none());
        assert!(r.allocation_containing(0x2010u64.into()).is_none());
    }

    fn reservation(size: usize) -> AllocationState {
        AllocationState::new(
            ContextHandle::from_raw(3),
            None,
            size,
            0,
            MemoryKind::Device,
            AllocationKind::VirtualReservation {
                start_hint: GpuPtr::null(),
            },
        )
    }

    #[test]
    fn allocation_inside_reservation_falls_back_to_the_reservation() {
        let mut r = StateRegistry::new();
        r.insert_allocation(0x10000u64.into(), reservation(0x10000));
        r.insert_allocation(0x12000u64.into(), alloc(0x10));
        // 0x13000 lies past the inner allocation but inside the outer one.
        let (base, _) = r.allocation_containing(0x13000u64.into()).unwrap();
        assert_eq!(base.as_u64(), 0x10000);
        let (base, _) = r.allocation_containing(0x12008u64.into()).unwrap();
        assert_eq!(base.as_u64(), 0x12000);
        assert!(r.allocation_containing(0x20000u64.into()).is_none());

        r.release_allocation(0x10000u64.into());
        assert!(r.allocation_containing(0x13000u64.into()).is_none());
        assert!(r.reservation_containing(0x10000u64.into()).is_none());
    }

    #[test]
    fn plain_allocations_never_enclose_others() {
        let mut r = StateRegistry::new();
        // Overlapping plain allocations only resolve through the nearest base.
        r.insert_allocation(0x10000u64.into(), alloc(0x10000));
        r.insert_allocation(0x12000u64.into(), alloc(0x10));
        assert!(r.allocation_containing(0x13000u64.into()).is_none());
        assert!(r.reservation_containing(0x10000u64.into()).is_none());
    }

    #[test]
    fn counts_include_allocations() {
        let mut r = StateRegistry::new();
        r.insert(ContextHandle::from_raw(1), context_state());
        r.insert_allocation(0x1000u64.into(), alloc(1));
        let counts = r.category_counts();
        assert!(counts.contains(&(ObjectCategory::Context, 1)));
        assert!(counts.contains(&(ObjectCategory::Allocation, 1)));
        assert!(counts.contains(&(ObjectCategory::Fence, 0)));
    }
}
