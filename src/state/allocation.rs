use crate::{
    gpu_ptr::{GpuPtr, Void},
    handle_map::{ContextHandle, DeviceHandle, ModuleHandle, PhysicalMemHandle},
    memory_range::MemoryRange,
    state::descriptors::{DeviceMemDesc, HostMemDesc, MemoryAccess},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result},
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum MemoryKind {
    Host,
    Device,
    Shared,
}

impl Display for MemoryKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let s = match self {
            MemoryKind::Host => "host",
            MemoryKind::Device => "device",
            MemoryKind::Shared => "shared",
        };
        write!(f, "{}", s)
    }
}

/// How the allocation came into existence, and therefore how to recreate it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AllocationKind {
    /// A plain device/host/shared allocation call.
    Pointer {
        device_desc: Option<DeviceMemDesc>,
        host_desc: Option<HostMemDesc>,
    },
    /// A module global variable looked up by name.
    GlobalSymbol { module: ModuleHandle, name: String },
    /// A function pointer looked up by name. Carries no data.
    FunctionPointer { module: ModuleHandle, name: String },
    /// A reserved virtual address range. Backed by `virtual_mappings`.
    VirtualReservation { start_hint: GpuPtr<Void> },
}

/// GPU residency requested for the whole or a part of the allocation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Residency {
    pub context: ContextHandle,
    pub device: DeviceHandle,
    pub offset: usize,
    pub size: usize,
}

/// One segment of a virtual reservation backed by physical memory.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VirtualMapping {
    /// Offset from the start of the reservation.
    pub offset: usize,
    pub size: usize,
    pub physical_mem: PhysicalMemHandle,
    pub physical_offset: usize,
    pub access: MemoryAccess,
}

/// Last known contents of an allocation, with the CRC32 taken at capture.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub bytes: Vec<u8>,
    pub crc32: u32,
}

impl MemorySnapshot {
    pub fn new(bytes: Vec<u8>) -> MemorySnapshot {
        let crc32 = crc32fast::hash(&bytes);
        MemorySnapshot { bytes, crc32 }
    }

    pub fn verify(&self) -> std::result::Result<(), u32> {
        let actual = crc32fast::hash(&self.bytes);
        if actual == self.crc32 {
            Ok(())
        } else {
            Err(actual)
        }
    }
}

/// Byte offset -> "has this pointer been translated already".
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct IndirectOffsets(BTreeMap<usize, bool>);

impl IndirectOffsets {
    pub fn new() -> IndirectOffsets {
        IndirectOffsets(BTreeMap::new())
    }

    /// Mark `offset` as holding a pointer. An offset already known keeps its flag.
    pub fn add(&mut self, offset: usize) {
        self.0.entry(offset).or_insert(false);
    }

    pub fn contains(&self, offset: usize) -> bool {
        self.0.contains_key(&offset)
    }

    pub fn is_translated(&self, offset: usize) -> bool {
        self.0.get(&offset).copied().unwrap_or(false)
    }

    pub fn mark_translated(&mut self, offset: usize) {
        if let Some(flag) = self.0.get_mut(&offset) {
            *flag = true;
        }
    }

    /// Forget which offsets have been translated. The offsets stay.
    pub fn reset_translated(&mut self) {
        for flag in self.0.values_mut() {
            *flag = false;
        }
    }

    pub fn offsets(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.keys().copied()
    }

    pub fn pending(&self) -> Vec<usize> {
        self.0
            .iter()
            .filter(|(_, &translated)| !translated)
            .map(|(&o, _)| o)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<usize>> for IndirectOffsets {
    fn from(offsets: Vec<usize>) -> Self {
        let mut t = IndirectOffsets::new();
        for o in offsets {
            t.add(o);
        }
        t
    }
}

/// A tracked memory allocation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AllocationState {
    pub context: ContextHandle,
    /// None for host allocations.
    pub device: Option<DeviceHandle>,
    pub size: usize,
    pub alignment: usize,
    pub memory_kind: MemoryKind,
    pub kind: AllocationKind,
    pub indirect_offsets: IndirectOffsets,
    pub residency: Option<Residency>,
    pub virtual_mappings: Vec<VirtualMapping>,
    pub snapshot: Option<MemorySnapshot>,
    /// Insertion order. Assigned by the registry and never reused.
    pub id: u64,
    pub restored: bool,
}

impl AllocationState {
    pub fn new(
        context: ContextHandle,
        device: Option<DeviceHandle>,
        size: usize,
        alignment: usize,
        memory_kind: MemoryKind,
        kind: AllocationKind,
    ) -> AllocationState {
        AllocationState {
            context,
            device,
            size,
            alignment,
            memory_kind,
            kind,
            indirect_offsets: IndirectOffsets::new(),
            residency: None,
            virtual_mappings: Vec::new(),
            snapshot: None,
            id: 0,
            restored: false,
        }
    }

    pub fn range(&self, base: GpuPtr<Void>) -> MemoryRange {
        MemoryRange::new_range(base, self.size)
    }

    /// Everything but the snapshot bytes.
    pub fn without_snapshot(&self) -> AllocationState {
        AllocationState {
            context: self.context,
            device: self.device,
            size: self.size,
            alignment: self.alignment,
            memory_kind: self.memory_kind,
            kind: self.kind.clone(),
            indirect_offsets: self.indirect_offsets.clone(),
            residency: self.residency.clone(),
            virtual_mappings: self.virtual_mappings.clone(),
            snapshot: None,
            id: self.id,
            restored: self.restored,
        }
    }

    pub fn is_virtual_reservation(&self) -> bool {
        matches!(self.kind, AllocationKind::VirtualReservation { .. })
    }
}
