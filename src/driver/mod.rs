//! The raw driver dispatch table the core calls through.
//!
//! Everything the reconstructor or the capture layer does to the device goes
//! through `Driver`, never through the application visible intercepted path.
//! Handles and addresses passed in and returned are always replay-side values.

pub mod recording_driver;

use crate::{
    gpu_ptr::{GpuPtr, Void},
    handle_map::*,
    state::descriptors::*,
};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result};

/// A result code other than success.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DriverStatus(pub u32);

impl DriverStatus {
    pub const ERROR_DEVICE_LOST: DriverStatus = DriverStatus(0x7000_0001);
    pub const ERROR_OUT_OF_HOST_MEMORY: DriverStatus = DriverStatus(0x7000_0002);
    pub const ERROR_OUT_OF_DEVICE_MEMORY: DriverStatus = DriverStatus(0x7000_0003);
    pub const ERROR_MODULE_BUILD_FAILURE: DriverStatus = DriverStatus(0x7000_0004);
    pub const ERROR_UNSUPPORTED_FEATURE: DriverStatus = DriverStatus(0x7800_0003);
    pub const ERROR_INVALID_ARGUMENT: DriverStatus = DriverStatus(0x7800_0004);
    pub const ERROR_INVALID_NULL_HANDLE: DriverStatus = DriverStatus(0x7800_0005);
    pub const ERROR_UNKNOWN: DriverStatus = DriverStatus(0x7fff_fffe);

    pub fn name(&self) -> Option<&'static str> {
        let n = match *self {
            DriverStatus::ERROR_DEVICE_LOST => "ERROR_DEVICE_LOST",
            DriverStatus::ERROR_OUT_OF_HOST_MEMORY => "ERROR_OUT_OF_HOST_MEMORY",
            DriverStatus::ERROR_OUT_OF_DEVICE_MEMORY => "ERROR_OUT_OF_DEVICE_MEMORY",
            DriverStatus::ERROR_MODULE_BUILD_FAILURE => "ERROR_MODULE_BUILD_FAILURE",
            DriverStatus::ERROR_UNSUPPORTED_FEATURE => "ERROR_UNSUPPORTED_FEATURE",
            DriverStatus::ERROR_INVALID_ARGUMENT => "ERROR_INVALID_ARGUMENT",
            DriverStatus::ERROR_INVALID_NULL_HANDLE => "ERROR_INVALID_NULL_HANDLE",
            DriverStatus::ERROR_UNKNOWN => "ERROR_UNKNOWN",
            _ => return None,
        };
        Some(n)
    }
}

impl Display for DriverStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self.name() {
            Some(n) => write!(f, "{}", n),
            None => write!(f, "status {:#x}", self.0),
        }
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverStatus>;

pub trait Driver {
    fn driver_get(&mut self) -> DriverResult<Vec<DriverHandle>>;
    fn device_get(&mut self, driver: DriverHandle) -> DriverResult<Vec<DeviceHandle>>;
    fn device_get_sub_devices(&mut self, device: DeviceHandle) -> DriverResult<Vec<DeviceHandle>>;

    fn context_create(
        &mut self,
        driver: DriverHandle,
        devices: &[DeviceHandle],
        desc: &ContextDesc,
    ) -> DriverResult<ContextHandle>;
    fn context_destroy(&mut self, context: ContextHandle) -> DriverResult<()>;

    fn command_list_create(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &CommandListDesc,
    ) -> DriverResult<CommandListHandle>;
    fn command_list_create_immediate(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &CommandQueueDesc,
    ) -> DriverResult<CommandListHandle>;
    fn command_list_close(&mut self, list: CommandListHandle) -> DriverResult<()>;
    fn command_list_host_synchronize(&mut self, list: CommandListHandle) -> DriverResult<()>;
    fn command_list_destroy(&mut self, list: CommandListHandle) -> DriverResult<()>;

    fn command_queue_create(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &CommandQueueDesc,
    ) -> DriverResult<CommandQueueHandle>;
    fn command_queue_execute(
        &mut self,
        queue: CommandQueueHandle,
        lists: &[CommandListHandle],
        fence: Option<FenceHandle>,
    ) -> DriverResult<()>;
    fn command_queue_synchronize(&mut self, queue: CommandQueueHandle) -> DriverResult<()>;
    fn command_queue_destroy(&mut self, queue: CommandQueueHandle) -> DriverResult<()>;

    fn image_create(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &ImageDesc,
    ) -> DriverResult<ImageHandle>;
    fn image_view_create(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &ImageDesc,
        image: ImageHandle,
    ) -> DriverResult<ImageHandle>;
    fn image_destroy(&mut self, image: ImageHandle) -> DriverResult<()>;

    fn module_create(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &ModuleDesc,
    ) -> DriverResult<ModuleHandle>;
    fn module_dynamic_link(&mut self, modules: &[ModuleHandle]) -> DriverResult<()>;
    /// Address and size of a module global variable.
    fn module_get_global_pointer(
        &mut self,
        module: ModuleHandle,
        name: &str,
    ) -> DriverResult<(GpuPtr<Void>, usize)>;
    fn module_get_function_pointer(
        &mut self,
        module: ModuleHandle,
        name: &str,
    ) -> DriverResult<GpuPtr<Void>>;
    fn module_destroy(&mut self, module: ModuleHandle) -> DriverResult<()>;

    fn kernel_create(&mut self, module: ModuleHandle, desc: &KernelDesc) -> DriverResult<KernelHandle>;
    fn kernel_set_group_size(&mut self, kernel: KernelHandle, size: [u32; 3]) -> DriverResult<()>;
    fn kernel_set_global_offset(&mut self, kernel: KernelHandle, offset: [u32; 3]) -> DriverResult<()>;
    fn kernel_set_indirect_access(
        &mut self,
        kernel: KernelHandle,
        flags: IndirectAccessFlags,
    ) -> DriverResult<()>;
    fn kernel_set_scheduling_hint(&mut self, kernel: KernelHandle, hint: u32) -> DriverResult<()>;
    /// `value` is None for local memory arguments, which only have a size.
    fn kernel_set_argument_value(
        &mut self,
        kernel: KernelHandle,
        index: u32,
        size: usize,
        value: Option<&[u8]>,
    ) -> DriverResult<()>;
    fn kernel_destroy(&mut self, kernel: KernelHandle) -> DriverResult<()>;

    fn physical_mem_create(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        size: usize,
    ) -> DriverResult<PhysicalMemHandle>;
    fn physical_mem_destroy(
        &mut self,
        context: ContextHandle,
        mem: PhysicalMemHandle,
    ) -> DriverResult<()>;

    fn virtual_mem_reserve(
        &mut self,
        context: ContextHandle,
        start_hint: GpuPtr<Void>,
        size: usize,
    ) -> DriverResult<GpuPtr<Void>>;
    fn virtual_mem_map(
        &mut self,
        context: ContextHandle,
        ptr: GpuPtr<Void>,
        size: usize,
        mem: PhysicalMemHandle,
        offset: usize,
        access: MemoryAccess,
    ) -> DriverResult<()>;
    fn virtual_mem_unmap(&mut self, context: ContextHandle, ptr: GpuPtr<Void>, size: usize)
        -> DriverResult<()>;
    fn virtual_mem_free(&mut self, context: ContextHandle, ptr: GpuPtr<Void>, size: usize)
        -> DriverResult<()>;

    fn mem_alloc_device(
        &mut self,
        context: ContextHandle,
        desc: &DeviceMemDesc,
        size: usize,
        alignment: usize,
        device: DeviceHandle,
    ) -> DriverResult<GpuPtr<Void>>;
    fn mem_alloc_host(
        &mut self,
        context: ContextHandle,
        desc: &HostMemDesc,
        size: usize,
        alignment: usize,
    ) -> DriverResult<GpuPtr<Void>>;
    fn mem_alloc_shared(
        &mut self,
        context: ContextHandle,
        device_desc: &DeviceMemDesc,
        host_desc: &HostMemDesc,
        size: usize,
        alignment: usize,
        device: Option<DeviceHandle>,
    ) -> DriverResult<GpuPtr<Void>>;
    fn mem_free(&mut self, context: ContextHandle, ptr: GpuPtr<Void>) -> DriverResult<()>;
    fn make_memory_resident(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        ptr: GpuPtr<Void>,
        size: usize,
    ) -> DriverResult<()>;

    /// Direct write into host visible memory.
    fn write_host_memory(&mut self, ptr: GpuPtr<Void>, bytes: &[u8]) -> DriverResult<()>;
    /// Copy `size` bytes back to the host. May block on device completion.
    fn read_memory(&mut self, ptr: GpuPtr<Void>, size: usize) -> DriverResult<Vec<u8>>;
    /// Host to device copy recorded into `list`.
    fn append_memory_copy(
        &mut self,
        list: CommandListHandle,
        dst: GpuPtr<Void>,
        src: &[u8],
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()>;
    fn append_launch_kernel(
        &mut self,
        list: CommandListHandle,
        kernel: KernelHandle,
        group_count: [u32; 3],
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()>;

    fn event_pool_create(
        &mut self,
        context: ContextHandle,
        devices: &[DeviceHandle],
        desc: &EventPoolDesc,
    ) -> DriverResult<EventPoolHandle>;
    fn event_pool_destroy(&mut self, pool: EventPoolHandle) -> DriverResult<()>;
    fn event_create(&mut self, pool: EventPoolHandle, desc: &EventDesc) -> DriverResult<EventHandle>;
    fn event_host_signal(&mut self, event: EventHandle) -> DriverResult<()>;
    fn event_host_reset(&mut self, event: EventHandle) -> DriverResult<()>;
    fn event_destroy(&mut self, event: EventHandle) -> DriverResult<()>;

    fn fence_create(&mut self, queue: CommandQueueHandle, desc: &FenceDesc) -> DriverResult<FenceHandle>;
    fn fence_destroy(&mut self, fence: FenceHandle) -> DriverResult<()>;
}
