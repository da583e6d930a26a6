//! One capture or replay session: the registry, the handle maps and the flags
//! every component is handed, instead of any process global state.

use crate::{
    flags::Flags,
    gpu_ptr::{GpuPtr, Void},
    handle_map::HandleMaps,
    log::LogLevel::LogDebug,
    snapshot::CapturedState,
    state::{allocation::IndirectOffsets, StateRegistry},
};
use std::{cell::Cell, collections::BTreeMap, rc::Rc};

pub struct Session {
    pub(crate) flags: Flags,
    pub(crate) registry: StateRegistry,
    pub(crate) maps: HandleMaps,
    /// Indirect pointer tables of the restored allocations, keyed by their
    /// replay base address.
    pub(crate) indirect_tables: BTreeMap<GpuPtr<Void>, IndirectOffsets>,
    /// Number of the last dispatch recorded.
    pub(crate) kernel_count: u32,
    intercept_depth: Rc<Cell<u32>>,
}

impl Session {
    pub fn new(flags: Flags) -> Session {
        Session::from_registry(flags, StateRegistry::new(), 0)
    }

    /// A replay session over a registry recorded earlier. The registry stays
    /// keyed by capture time handles; `maps()` fills in as objects are restored.
    pub fn from_registry(flags: Flags, registry: StateRegistry, kernel_count: u32) -> Session {
        Session {
            flags,
            registry,
            maps: HandleMaps::new(),
            indirect_tables: BTreeMap::new(),
            kernel_count,
            intercept_depth: Rc::new(Cell::new(0)),
        }
    }

    pub fn from_captured(flags: Flags, captured: CapturedState) -> Session {
        let kernel_count = captured.kernel_count;
        Session::from_registry(flags, captured.into_registry(), kernel_count)
    }

    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    pub fn registry(&self) -> &StateRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut StateRegistry {
        &mut self.registry
    }

    pub fn maps(&self) -> &HandleMaps {
        &self.maps
    }

    pub fn maps_mut(&mut self) -> &mut HandleMaps {
        &mut self.maps
    }

    pub fn indirect_table(&self, replay_base: GpuPtr<Void>) -> Option<&IndirectOffsets> {
        self.indirect_tables.get(&replay_base)
    }

    pub fn indirect_tables(&self) -> &BTreeMap<GpuPtr<Void>, IndirectOffsets> {
        &self.indirect_tables
    }

    pub fn kernel_count(&self) -> u32 {
        self.kernel_count
    }

    /// Kernel numbers start at 1 and are never reused within a session.
    pub fn next_kernel_number(&mut self) -> u32 {
        self.kernel_count += 1;
        self.kernel_count
    }

    /// Enter an intercepted call. Hold the scope for the duration of the call.
    pub fn intercept(&self) -> InterceptScope {
        let depth = self.intercept_depth.get() + 1;
        self.intercept_depth.set(depth);
        if depth > 1 {
            log!(LogDebug, "re-entered interception at depth {}", depth);
        }
        InterceptScope {
            depth: self.intercept_depth.clone(),
        }
    }

    /// True while inside a driver call the engine issued itself. Nothing
    /// observed at that point is recorded.
    pub fn is_nested(&self) -> bool {
        self.intercept_depth.get() > 1
    }

    pub fn captured_state(&self) -> CapturedState {
        CapturedState::from_registry(&self.registry, self.kernel_count)
    }
}

/// Marks one intercepted call in progress. Only the outermost scope records.
pub struct InterceptScope {
    depth: Rc<Cell<u32>>,
}

impl InterceptScope {
    pub fn is_outermost(&self) -> bool {
        self.depth.get() == 1
    }
}

impl Drop for InterceptScope {
    fn drop(&mut self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}
