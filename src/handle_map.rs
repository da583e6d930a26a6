//! Original (capture) <-> replay handle translation, one table per handle kind.
//!
//! Every handle referenced while replaying must have been produced by a creation
//! call replayed earlier, so a missing mapping is a hard `NotFound` error. Null
//! always maps to itself and is never stored.

use crate::{
    error::{GcrError, GcrResult},
    gpu_ptr::{GpuPtr, Void},
    log::LogLevel::LogDebug,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    fmt::{self, Debug, Display, Formatter},
    hash::{Hash, Hasher},
    marker::PhantomData,
    ops::Bound::{Included, Unbounded},
};

/// An opaque driver object handle of kind `K`.
/// `PhantomData<fn() -> K>` keeps the handle Send + Sync whatever K is.
pub struct Handle<K> {
    val: u64,
    phantom: PhantomData<fn() -> K>,
}

assert_eq_size!(Handle<kind::Kernel>, u64);

impl<K> Handle<K> {
    pub fn null() -> Handle<K> {
        Handle::from_raw(0)
    }

    pub fn from_raw(val: u64) -> Handle<K> {
        Handle {
            val,
            phantom: PhantomData,
        }
    }

    pub fn raw(&self) -> u64 {
        self.val
    }

    pub fn is_null(&self) -> bool {
        self.val == 0
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        Handle::from_raw(self.val)
    }
}

impl<K> Copy for Handle<K> {}

impl<K> Default for Handle<K> {
    fn default() -> Self {
        Handle::null()
    }
}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.val == other.val
    }
}

impl<K> Eq for Handle<K> {}

impl<K> PartialOrd for Handle<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Handle<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.val.cmp(&other.val)
    }
}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.val.hash(state);
    }
}

impl<K: HandleKind> Debug for Handle<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#x})", K::NAME, self.val)
    }
}

impl<K> Display for Handle<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.val)
    }
}

impl<K> Serialize for Handle<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.val)
    }
}

impl<'de, K> Deserialize<'de> for Handle<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(Handle::from_raw)
    }
}

/// Pointers returned by allocation calls are handles too: the capture time
/// value must be translated to the replay time value.
impl From<GpuPtr<Void>> for Handle<kind::Usm> {
    fn from(p: GpuPtr<Void>) -> Self {
        Handle::from_raw(p.as_u64())
    }
}

impl From<Handle<kind::Usm>> for GpuPtr<Void> {
    fn from(h: Handle<kind::Usm>) -> Self {
        GpuPtr::new_from_val(h.raw())
    }
}

/// Marker for a handle type. Each kind owns exactly one table in `HandleMaps`.
pub trait HandleKind: Sized + 'static {
    const NAME: &'static str;

    fn table(maps: &HandleMaps) -> &HandleMap<Self>;
    fn table_mut(maps: &mut HandleMaps) -> &mut HandleMap<Self>;

    /// Keep a declared companion kind in lock-step.
    fn on_add(_maps: &mut HandleMaps, _original: u64, _replay: u64) {}
    fn on_remove(_maps: &mut HandleMaps, _original: u64) {}
}

/// Forward map keyed by original value, with an auxiliary reverse map.
pub struct HandleMap<K> {
    forward: BTreeMap<u64, u64>,
    reverse: HashMap<u64, u64>,
    phantom: PhantomData<fn() -> K>,
}

impl<K> Default for HandleMap<K> {
    fn default() -> Self {
        HandleMap {
            forward: BTreeMap::new(),
            reverse: HashMap::new(),
            phantom: PhantomData,
        }
    }
}

impl<K: HandleKind> HandleMap<K> {
    pub fn new() -> HandleMap<K> {
        HandleMap::default()
    }

    fn insert_raw(&mut self, original: u64, replay: u64) {
        if let Some(old_replay) = self.forward.insert(original, replay) {
            self.reverse.remove(&old_replay);
        }
        self.reverse.insert(replay, original);
    }

    fn remove_raw(&mut self, original: u64) -> Option<u64> {
        let replay = self.forward.remove(&original)?;
        if self.reverse.get(&replay) == Some(&original) {
            self.reverse.remove(&replay);
        }
        Some(replay)
    }

    pub fn get_mapping(&self, original: Handle<K>) -> GcrResult<Handle<K>> {
        if original.is_null() {
            return Ok(Handle::null());
        }
        match self.forward.get(&original.raw()) {
            Some(&replay) => Ok(Handle::from_raw(replay)),
            None => Err(GcrError::not_found(K::NAME, original.raw())),
        }
    }

    pub fn get_original(&self, replay: Handle<K>) -> GcrResult<Handle<K>> {
        if replay.is_null() {
            return Ok(Handle::null());
        }
        match self.reverse.get(&replay.raw()) {
            Some(&original) => Ok(Handle::from_raw(original)),
            None => Err(GcrError::not_found(K::NAME, replay.raw())),
        }
    }

    pub fn contains(&self, original: Handle<K>) -> bool {
        original.is_null() || self.forward.contains_key(&original.raw())
    }

    /// Greatest mapped original value that is `<= original`, with its replay value.
    /// Used for interior pointers: callers check the offset against the allocation size.
    pub fn floor_entry(&self, original: Handle<K>) -> Option<(Handle<K>, Handle<K>)> {
        self.forward
            .range((Unbounded, Included(original.raw())))
            .next_back()
            .map(|(&o, &r)| (Handle::from_raw(o), Handle::from_raw(r)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<K>, Handle<K>)> + '_ {
        self.forward
            .iter()
            .map(|(&o, &r)| (Handle::from_raw(o), Handle::from_raw(r)))
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

pub mod kind {
    //! One uninhabited marker type per handle type.

    pub enum Driver {}
    pub enum Device {}
    /// The tools/debug API view of a device. Refers to the same driver object
    /// as `Device`, so the two tables are mutually mapped.
    pub enum ToolsDevice {}
    pub enum Context {}
    pub enum CommandList {}
    pub enum CommandQueue {}
    pub enum Image {}
    pub enum Module {}
    pub enum Kernel {}
    pub enum PhysicalMem {}
    pub enum EventPool {}
    pub enum Event {}
    pub enum Fence {}
    /// USM / virtual addresses, keyed by allocation base.
    pub enum Usm {}
}

macro_rules! handle_maps {
    ($($kind:ident => $field:ident, $name:expr $(, companion $companion:ident)?;)+) => {
        /// All handle tables of a session. Independent of the object registry.
        #[derive(Default)]
        pub struct HandleMaps {
            $($field: HandleMap<kind::$kind>,)+
        }

        $(
            impl HandleKind for kind::$kind {
                const NAME: &'static str = $name;

                fn table(maps: &HandleMaps) -> &HandleMap<Self> {
                    &maps.$field
                }

                fn table_mut(maps: &mut HandleMaps) -> &mut HandleMap<Self> {
                    &mut maps.$field
                }

                $(
                    fn on_add(maps: &mut HandleMaps, original: u64, replay: u64) {
                        <kind::$companion as HandleKind>::table_mut(maps).insert_raw(original, replay);
                    }

                    fn on_remove(maps: &mut HandleMaps, original: u64) {
                        <kind::$companion as HandleKind>::table_mut(maps).remove_raw(original);
                    }
                )?
            }
        )+

        impl HandleMaps {
            /// Number of mappings over every table.
            pub fn total_len(&self) -> usize {
                0 $(+ self.$field.len())+
            }
        }
    };
}

handle_maps! {
    Driver => drivers, "driver";
    Device => devices, "device", companion ToolsDevice;
    ToolsDevice => tools_devices, "tools device", companion Device;
    Context => contexts, "context";
    CommandList => command_lists, "command list";
    CommandQueue => command_queues, "command queue";
    Image => images, "image";
    Module => modules, "module";
    Kernel => kernels, "kernel";
    PhysicalMem => physical_mems, "physical memory";
    EventPool => event_pools, "event pool";
    Event => events, "event";
    Fence => fences, "fence";
    Usm => usm_ptrs, "pointer";
}

impl HandleMaps {
    pub fn new() -> HandleMaps {
        HandleMaps::default()
    }

    pub fn table<K: HandleKind>(&self) -> &HandleMap<K> {
        K::table(self)
    }

    /// Record the pair. A null original is ignored: null always maps to itself.
    pub fn add_mapping<K: HandleKind>(&mut self, original: Handle<K>, replay: Handle<K>) {
        if original.is_null() {
            return;
        }
        log!(LogDebug, "map {} {} -> {}", K::NAME, original, replay);
        K::table_mut(self).insert_raw(original.raw(), replay.raw());
        K::on_add(self, original.raw(), replay.raw());
    }

    /// Idempotent. The companion hook runs even if there was nothing to remove.
    pub fn remove_mapping<K: HandleKind>(&mut self, original: Handle<K>) {
        if K::table_mut(self).remove_raw(original.raw()).is_some() {
            log!(LogDebug, "unmap {} {}", K::NAME, original);
        }
        K::on_remove(self, original.raw());
    }

    pub fn get_mapping<K: HandleKind>(&self, original: Handle<K>) -> GcrResult<Handle<K>> {
        K::table(self).get_mapping(original)
    }

    pub fn get_original<K: HandleKind>(&self, replay: Handle<K>) -> GcrResult<Handle<K>> {
        K::table(self).get_original(replay)
    }

    /// Mapping for optional references such as a signal event.
    pub fn get_mapping_opt<K: HandleKind>(
        &self,
        original: Option<Handle<K>>,
    ) -> GcrResult<Option<Handle<K>>> {
        original.map(|h| self.get_mapping(h)).transpose()
    }

    pub fn get_mappings<K: HandleKind>(&self, originals: &[Handle<K>]) -> GcrResult<Vec<Handle<K>>> {
        originals.iter().map(|&h| self.get_mapping(h)).collect()
    }

    pub fn add_ptr_mapping(&mut self, original: GpuPtr<Void>, replay: GpuPtr<Void>) {
        self.add_mapping::<kind::Usm>(original.into(), replay.into());
    }

    pub fn remove_ptr_mapping(&mut self, original: GpuPtr<Void>) {
        self.remove_mapping::<kind::Usm>(original.into());
    }

    pub fn get_ptr_mapping(&self, original: GpuPtr<Void>) -> GcrResult<GpuPtr<Void>> {
        self.get_mapping::<kind::Usm>(original.into()).map(Into::into)
    }
}

pub type DriverHandle = Handle<kind::Driver>;
pub type DeviceHandle = Handle<kind::Device>;
pub type ToolsDeviceHandle = Handle<kind::ToolsDevice>;
pub type ContextHandle = Handle<kind::Context>;
pub type CommandListHandle = Handle<kind::CommandList>;
pub type CommandQueueHandle = Handle<kind::CommandQueue>;
pub type ImageHandle = Handle<kind::Image>;
pub type ModuleHandle = Handle<kind::Module>;
pub type KernelHandle = Handle<kind::Kernel>;
pub type PhysicalMemHandle = Handle<kind::PhysicalMem>;
pub type EventPoolHandle = Handle<kind::EventPool>;
pub type EventHandle = Handle<kind::Event>;
pub type FenceHandle = Handle<kind::Fence>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_get_and_reverse() {
        let mut maps = HandleMaps::new();
        let pairs = [(0x10u64, 0x9000u64), (0x20, 0x9100), (0x30, 0x8f00)];
        for &(o, r) in pairs.iter() {
            maps.add_mapping(KernelHandle::from_raw(o), KernelHandle::from_raw(r));
        }
        for &(o, r) in pairs.iter() {
            assert_eq!(
                maps.get_mapping(KernelHandle::from_raw(o)).unwrap().raw(),
                r
            );
            assert_eq!(
                maps.get_original(KernelHandle::from_raw(r)).unwrap().raw(),
                o
            );
        }
        assert_eq!(maps.table::<kind::Kernel>().len(), 3);
    }

    #[test]
    fn null_maps_to_itself() {
        let mut maps = HandleMaps::new();
        maps.add_mapping(EventHandle::null(), EventHandle::from_raw(0x44));
        assert!(maps.table::<kind::Event>().is_empty());
        assert!(maps.get_mapping(EventHandle::null()).unwrap().is_null());
        assert!(maps.get_original(EventHandle::null()).unwrap().is_null());
    }

    #[test]
    fn missing_mapping_is_not_found() {
        let maps = HandleMaps::new();
        let err = maps.get_mapping(ModuleHandle::from_raw(0x77)).unwrap_err();
        assert!(err.is_not_found());
        assert!(maps.get_original(ModuleHandle::from_raw(0x77)).is_err());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut maps = HandleMaps::new();
        let o = ContextHandle::from_raw(1);
        maps.add_mapping(o, ContextHandle::from_raw(2));
        maps.remove_mapping(o);
        maps.remove_mapping(o);
        assert!(maps.get_mapping(o).is_err());
        assert!(maps.get_original(ContextHandle::from_raw(2)).is_err());
    }

    #[test]
    fn remapping_an_original_drops_stale_reverse_entry() {
        let mut maps = HandleMaps::new();
        let o = FenceHandle::from_raw(5);
        maps.add_mapping(o, FenceHandle::from_raw(50));
        maps.add_mapping(o, FenceHandle::from_raw(51));
        assert_eq!(maps.get_mapping(o).unwrap().raw(), 51);
        assert!(maps.get_original(FenceHandle::from_raw(50)).is_err());
    }

    #[test]
    fn device_and_tools_device_are_mutually_mapped() {
        let mut maps = HandleMaps::new();
        maps.add_mapping(DeviceHandle::from_raw(0xa), DeviceHandle::from_raw(0xb));
        assert_eq!(
            maps.get_mapping(ToolsDeviceHandle::from_raw(0xa)).unwrap().raw(),
            0xb
        );

        maps.add_mapping(ToolsDeviceHandle::from_raw(0xc), ToolsDeviceHandle::from_raw(0xd));
        assert_eq!(maps.get_mapping(DeviceHandle::from_raw(0xc)).unwrap().raw(), 0xd);

        maps.remove_mapping(ToolsDeviceHandle::from_raw(0xa));
        assert!(maps.get_mapping(DeviceHandle::from_raw(0xa)).is_err());
        assert_eq!(maps.total_len(), 2);
    }

    #[test]
    fn floor_entry_finds_containing_base() {
        let mut maps = HandleMaps::new();
        maps.add_ptr_mapping(0x1000u64.into(), 0x7000u64.into());
        maps.add_ptr_mapping(0x3000u64.into(), 0x5000u64.into());
        let (o, r) = maps
            .table::<kind::Usm>()
            .floor_entry(Handle::from_raw(0x2fff))
            .unwrap();
        assert_eq!((o.raw(), r.raw()), (0x1000, 0x7000));
        assert!(maps
            .table::<kind::Usm>()
            .floor_entry(Handle::from_raw(0xfff))
            .is_none());
        assert_eq!(
            maps.get_ptr_mapping(0x3000u64.into()).unwrap(),
            0x5000u64.into()
        );
    }
}
