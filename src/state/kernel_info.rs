use crate::{
    gpu_ptr::{GpuPtr, Void},
    handle_map::{CommandListHandle, EventHandle, ImageHandle, KernelHandle, ModuleHandle},
    state::descriptors::IndirectAccessFlags,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a kernel argument was classified when it was set.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ArgClass {
    /// Plain bytes. Copied verbatim at replay.
    Value,
    /// A pointer into a tracked allocation.
    Buffer {
        allocation: GpuPtr<Void>,
        offset: usize,
        allocation_size: usize,
    },
    Image(ImageHandle),
    /// Shared local memory of the given size. No value.
    LocalMemory(usize),
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KernelArg {
    pub class: ArgClass,
    /// Original argument bytes, as passed by the application.
    pub bytes: Vec<u8>,
}

/// State set on a kernel object between launches.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct KernelSettings {
    pub group_size: Option<[u32; 3]>,
    pub global_offset: Option<[u32; 3]>,
    pub indirect_access: Option<IndirectAccessFlags>,
    pub scheduling_hint: Option<u32>,
    pub args: BTreeMap<u32, KernelArg>,
}

/// One snapshot per dispatch. Never mutated after the next dispatch of the
/// same kernel object.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KernelExecutionInfo {
    pub kernel: KernelHandle,
    pub module: ModuleHandle,
    pub kernel_name: String,
    pub command_list: CommandListHandle,
    /// Session wide dispatch sequence number.
    pub kernel_number: u32,
    pub group_count: [u32; 3],
    pub settings: KernelSettings,
    pub signal_event: Option<EventHandle>,
    pub wait_events: Vec<EventHandle>,
}
