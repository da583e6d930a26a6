//! JSON interchange form of a captured registry.
//!
//! Every table is an ordered entry list, so writing enumerates live objects
//! and allocations in insertion order, and reading rebuilds the registry
//! (creation ids and the id counter included) before anything queries it.

use crate::{
    error::GcrResult,
    gpu_ptr::{GpuPtr, Void},
    handle_map::Handle,
    state::{allocation::AllocationState, objects::*, ObjectState, StateRegistry},
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<S> {
    pub handle: u64,
    pub creation_id: u64,
    pub state: S,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocationEntry {
    pub base: GpuPtr<Void>,
    pub state: AllocationState,
}

fn entries<S: ObjectState + Clone>(registry: &StateRegistry) -> Vec<Entry<S>> {
    registry
        .table::<S>()
        .ordered_with_ids()
        .into_iter()
        .map(|(creation_id, h, s)| Entry {
            handle: h.raw(),
            creation_id,
            state: s.clone(),
        })
        .collect()
}

fn restore_entries<S: ObjectState>(registry: &mut StateRegistry, entries: Vec<Entry<S>>) {
    for e in entries {
        registry.insert_with_id(Handle::<S::Kind>::from_raw(e.handle), e.creation_id, e.state);
    }
}

macro_rules! captured_state {
    ($($field:ident: $state:ident,)+) => {
        #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
        pub struct CapturedState {
            pub version: u32,
            pub next_creation_id: u64,
            /// Number of the last dispatch recorded.
            pub kernel_count: u32,
            $(
                #[serde(default)]
                pub $field: Vec<Entry<$state>>,
            )+
            #[serde(default)]
            pub allocations: Vec<AllocationEntry>,
        }

        impl CapturedState {
            pub fn from_registry(registry: &StateRegistry, kernel_count: u32) -> CapturedState {
                CapturedState {
                    version: SNAPSHOT_VERSION,
                    next_creation_id: registry.next_creation_id(),
                    kernel_count,
                    $($field: entries::<$state>(registry),)+
                    allocations: registry
                        .allocations_ordered()
                        .into_iter()
                        .map(|(base, a)| AllocationEntry {
                            base,
                            state: a.clone(),
                        })
                        .collect(),
                }
            }

            /// A registry in which nothing is restored yet.
            pub fn into_registry(self) -> StateRegistry {
                let mut registry = StateRegistry::new();
                $(restore_entries(&mut registry, self.$field);)+
                for a in self.allocations {
                    registry.insert_allocation_with_id(a.base, a.state);
                }
                registry.set_next_creation_id(self.next_creation_id);
                registry.clear_restored();
                registry
            }
        }
    };
}

captured_state! {
    drivers: DriverState,
    devices: DeviceState,
    contexts: ContextState,
    command_lists: CommandListState,
    command_queues: CommandQueueState,
    images: ImageState,
    modules: ModuleState,
    kernels: KernelState,
    physical_mems: PhysicalMemState,
    event_pools: EventPoolState,
    events: EventState,
    fences: FenceState,
}

impl CapturedState {
    pub fn from_reader<R: Read>(reader: R) -> GcrResult<CapturedState> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> GcrResult<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> GcrResult<CapturedState> {
        let f = File::open(path)?;
        CapturedState::from_reader(BufReader::new(f))
    }

    pub fn save(&self, path: &Path) -> GcrResult<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.to_writer(&mut w)?;
        w.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capture::{self, tests::App},
        flags::Flags,
        state::ObjectCategory,
    };

    fn captured() -> (App, CapturedState) {
        let mut app = App::new(Flags::default());
        let a = app.alloc_device(128);
        let l = app.list();
        let k = app.kernel("fill");
        app.set_ptr_arg(k, 0, a);
        app.launch(l, k, None, &[]);
        app.write(a, &[1, 2, 3, 4]);
        capture::snapshot_all_memory(&mut app.session, &mut app.driver).unwrap();
        let state = app.session.captured_state();
        (app, state)
    }

    #[test]
    fn file_round_trip_keeps_order_and_ids() {
        let (app, state) = captured();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        state.save(&path).unwrap();
        let loaded = CapturedState::load(&path).unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.kernel_count, 1);

        let registry = loaded.into_registry();
        assert_eq!(
            registry.category_counts(),
            app.session.registry().category_counts()
        );
        assert_eq!(
            registry.next_creation_id(),
            app.session.registry().next_creation_id()
        );
        assert!(registry
            .table::<ContextState>()
            .ordered()
            .iter()
            .all(|(_, c)| !c.restored));
    }

    #[test]
    fn loaded_registry_has_snapshot_bytes() {
        let (_, state) = captured();
        let registry = state.into_registry();
        let (_, a) = registry.allocations_ordered()[0];
        let snap = a.snapshot.as_ref().unwrap();
        assert_eq!(&snap.bytes[..4], &[1, 2, 3, 4]);
        assert!(snap.verify().is_ok());
        assert!(registry
            .category_counts()
            .contains(&(ObjectCategory::Kernel, 1)));
    }

    #[test]
    fn garbage_is_a_snapshot_error() {
        let err = CapturedState::from_reader(&b"{ not json"[..]).unwrap_err();
        assert!(err.to_string().starts_with("malformed snapshot"));
    }
}
