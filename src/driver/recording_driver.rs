//! A `Driver` that needs no device. It hands out fresh handles and addresses,
//! keeps a byte model of every allocation and remembers each call it was
//! given. Used for dry runs of a restore and as the driver double in tests.

use super::{Driver, DriverResult, DriverStatus};
use crate::{
    gpu_ptr::{GpuPtr, Void},
    handle_map::*,
    log::LogLevel::LogDebug,
    memory_range::MemoryRange,
    state::descriptors::*,
};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::{Display, Formatter, Result},
    ops::Bound::{Included, Unbounded},
};

/// Handles are handed out from here so they never collide with small
/// capture time values used in tests.
const FIRST_HANDLE: u64 = 0x7f00_0000;
const FIRST_ADDRESS: u64 = 0xff00_0000_0000;
const MIN_ALIGNMENT: u64 = 64;
/// Size reported for module globals the driver knows nothing else about.
pub const DEFAULT_GLOBAL_SIZE: usize = 0x100;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DriverCall {
    pub api: &'static str,
    pub args: String,
    /// Returned value, or the failing status.
    pub result: String,
}

impl Display for DriverCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}({}) = {}", self.api, self.args, self.result)
    }
}

trait Describe {
    fn describe(&self) -> String;
}

impl Describe for () {
    fn describe(&self) -> String {
        "ok".into()
    }
}

impl<K> Describe for Handle<K> {
    fn describe(&self) -> String {
        self.to_string()
    }
}

impl Describe for GpuPtr<Void> {
    fn describe(&self) -> String {
        self.to_string()
    }
}

impl<K> Describe for Vec<Handle<K>> {
    fn describe(&self) -> String {
        let v: Vec<String> = self.iter().map(|h| h.to_string()).collect();
        format!("[{}]", v.join(", "))
    }
}

impl Describe for Vec<u8> {
    fn describe(&self) -> String {
        format!("<{} bytes>", self.len())
    }
}

impl Describe for (GpuPtr<Void>, usize) {
    fn describe(&self) -> String {
        format!("{} size {:#x}", self.0, self.1)
    }
}

fn handles<K>(hs: &[Handle<K>]) -> String {
    Vec::<Handle<K>>::from(hs).describe()
}

fn opt<K>(h: Option<Handle<K>>) -> String {
    h.map_or_else(|| "null".to_owned(), |h| h.to_string())
}

pub struct RecordingDriver {
    next_handle: u64,
    next_address: u64,
    drivers: Vec<DriverHandle>,
    devices: HashMap<DriverHandle, Vec<DeviceHandle>>,
    sub_devices: HashMap<DeviceHandle, Vec<DeviceHandle>>,
    /// Contents of every live allocation or reservation, by base address.
    memory: BTreeMap<GpuPtr<Void>, Vec<u8>>,
    globals: HashMap<(ModuleHandle, String), (GpuPtr<Void>, usize)>,
    signaled: HashMap<EventHandle, bool>,
    failures: HashMap<&'static str, DriverStatus>,
    calls: Vec<DriverCall>,
}

impl Default for RecordingDriver {
    fn default() -> Self {
        RecordingDriver::with_topology(1, 1, 0)
    }
}

impl RecordingDriver {
    pub fn new() -> RecordingDriver {
        RecordingDriver::default()
    }

    /// `drivers` drivers with `devices` root devices each, each root device
    /// partitioned into `sub_devices` sub-devices.
    pub fn with_topology(drivers: usize, devices: usize, sub_devices: usize) -> RecordingDriver {
        RecordingDriver::with_topology_at(drivers, devices, sub_devices, FIRST_HANDLE, FIRST_ADDRESS)
    }

    /// Like `with_topology`, handing out handles from `first_handle` and
    /// addresses from `first_address`.
    pub fn with_topology_at(
        drivers: usize,
        devices: usize,
        sub_devices: usize,
        first_handle: u64,
        first_address: u64,
    ) -> RecordingDriver {
        let mut d = RecordingDriver {
            next_handle: first_handle,
            next_address: first_address,
            drivers: Vec::new(),
            devices: HashMap::new(),
            sub_devices: HashMap::new(),
            memory: BTreeMap::new(),
            globals: HashMap::new(),
            signaled: HashMap::new(),
            failures: HashMap::new(),
            calls: Vec::new(),
        };
        for _ in 0..drivers {
            let drv = d.new_handle();
            let mut devs = Vec::new();
            for _ in 0..devices {
                let dev = d.new_handle();
                let subs = (0..sub_devices).map(|_| d.new_handle()).collect();
                d.sub_devices.insert(dev, subs);
                devs.push(dev);
            }
            d.drivers.push(drv);
            d.devices.insert(drv, devs);
        }
        d
    }

    /// Make every later call to `api` fail with `status`.
    pub fn fail_api(&mut self, api: &'static str, status: DriverStatus) {
        self.failures.insert(api, status);
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
    }

    pub fn calls(&self) -> &[DriverCall] {
        &self.calls
    }

    pub fn calls_to(&self, api: &str) -> Vec<&DriverCall> {
        self.calls.iter().filter(|c| c.api == api).collect()
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Current bytes at `[ptr, ptr + len)`, if they lie in one live allocation.
    pub fn memory_at(&self, ptr: GpuPtr<Void>, len: usize) -> Option<&[u8]> {
        let (base, bytes) = self.region(ptr, len)?;
        let off = ptr.byte_offset_from(base)?;
        Some(&bytes[off..off + len])
    }

    pub fn is_signaled(&self, event: EventHandle) -> bool {
        self.signaled.get(&event).copied().unwrap_or(false)
    }

    fn new_handle<K>(&mut self) -> Handle<K> {
        let h = Handle::from_raw(self.next_handle);
        self.next_handle += 1;
        h
    }

    fn new_region(&mut self, size: usize, alignment: usize) -> GpuPtr<Void> {
        let align = (alignment as u64).max(MIN_ALIGNMENT).next_power_of_two();
        let base = (self.next_address + align - 1) & !(align - 1);
        // Leave a gap so a pointer one past the end never lands in the next region.
        self.next_address = base + size as u64 + MIN_ALIGNMENT;
        let ptr = GpuPtr::new_from_val(base);
        self.memory.insert(ptr, vec![0; size]);
        ptr
    }

    fn region(&self, ptr: GpuPtr<Void>, len: usize) -> Option<(GpuPtr<Void>, &Vec<u8>)> {
        let (&base, bytes) = self.memory.range((Unbounded, Included(ptr))).next_back()?;
        let range = MemoryRange::new_range(base, bytes.len());
        if range.contains(&MemoryRange::new_range(ptr, len)) {
            Some((base, bytes))
        } else {
            None
        }
    }

    fn write(&mut self, ptr: GpuPtr<Void>, src: &[u8]) -> DriverResult<()> {
        let base = match self.region(ptr, src.len()) {
            Some((base, _)) => base,
            None => return Err(DriverStatus::ERROR_INVALID_ARGUMENT),
        };
        let off = ptr
            .byte_offset_from(base)
            .ok_or(DriverStatus::ERROR_INVALID_ARGUMENT)?;
        let bytes = self
            .memory
            .get_mut(&base)
            .ok_or(DriverStatus::ERROR_INVALID_ARGUMENT)?;
        bytes[off..off + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn call<T: Describe>(
        &mut self,
        api: &'static str,
        args: String,
        f: impl FnOnce(&mut Self) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let injected = self.failures.get(api).copied();
        let r = match injected {
            Some(status) => Err(status),
            None => f(self),
        };
        let result = match &r {
            Ok(v) => v.describe(),
            Err(status) => status.to_string(),
        };
        let call = DriverCall { api, args, result };
        log!(LogDebug, "{}", call);
        self.calls.push(call);
        r
    }
}

impl Driver for RecordingDriver {
    fn driver_get(&mut self) -> DriverResult<Vec<DriverHandle>> {
        self.call("driver_get", String::new(), |d| Ok(d.drivers.clone()))
    }

    fn device_get(&mut self, driver: DriverHandle) -> DriverResult<Vec<DeviceHandle>> {
        self.call("device_get", driver.to_string(), |d| {
            d.devices
                .get(&driver)
                .cloned()
                .ok_or(DriverStatus::ERROR_INVALID_NULL_HANDLE)
        })
    }

    fn device_get_sub_devices(&mut self, device: DeviceHandle) -> DriverResult<Vec<DeviceHandle>> {
        self.call("device_get_sub_devices", device.to_string(), |d| {
            Ok(d.sub_devices.get(&device).cloned().unwrap_or_default())
        })
    }

    fn context_create(
        &mut self,
        driver: DriverHandle,
        devices: &[DeviceHandle],
        desc: &ContextDesc,
    ) -> DriverResult<ContextHandle> {
        let args = format!("{}, {}, flags {:#x}", driver, handles(devices), desc.flags);
        self.call("context_create", args, |d| Ok(d.new_handle()))
    }

    fn context_destroy(&mut self, context: ContextHandle) -> DriverResult<()> {
        self.call("context_destroy", context.to_string(), |_| Ok(()))
    }

    fn command_list_create(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &CommandListDesc,
    ) -> DriverResult<CommandListHandle> {
        let args = format!(
            "{}, {}, ordinal {}",
            context, device, desc.command_queue_group_ordinal
        );
        self.call("command_list_create", args, |d| Ok(d.new_handle()))
    }

    fn command_list_create_immediate(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &CommandQueueDesc,
    ) -> DriverResult<CommandListHandle> {
        let args = format!(
            "{}, {}, ordinal {} index {} {:?}",
            context, device, desc.ordinal, desc.index, desc.mode
        );
        self.call("command_list_create_immediate", args, |d| Ok(d.new_handle()))
    }

    fn command_list_close(&mut self, list: CommandListHandle) -> DriverResult<()> {
        self.call("command_list_close", list.to_string(), |_| Ok(()))
    }

    fn command_list_host_synchronize(&mut self, list: CommandListHandle) -> DriverResult<()> {
        self.call("command_list_host_synchronize", list.to_string(), |_| Ok(()))
    }

    fn command_list_destroy(&mut self, list: CommandListHandle) -> DriverResult<()> {
        self.call("command_list_destroy", list.to_string(), |_| Ok(()))
    }

    fn command_queue_create(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &CommandQueueDesc,
    ) -> DriverResult<CommandQueueHandle> {
        let args = format!(
            "{}, {}, ordinal {} index {} {:?}",
            context, device, desc.ordinal, desc.index, desc.mode
        );
        self.call("command_queue_create", args, |d| Ok(d.new_handle()))
    }

    fn command_queue_execute(
        &mut self,
        queue: CommandQueueHandle,
        lists: &[CommandListHandle],
        fence: Option<FenceHandle>,
    ) -> DriverResult<()> {
        let args = format!("{}, {}, {}", queue, handles(lists), opt(fence));
        self.call("command_queue_execute", args, |_| Ok(()))
    }

    fn command_queue_synchronize(&mut self, queue: CommandQueueHandle) -> DriverResult<()> {
        self.call("command_queue_synchronize", queue.to_string(), |_| Ok(()))
    }

    fn command_queue_destroy(&mut self, queue: CommandQueueHandle) -> DriverResult<()> {
        self.call("command_queue_destroy", queue.to_string(), |_| Ok(()))
    }

    fn image_create(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &ImageDesc,
    ) -> DriverResult<ImageHandle> {
        let args = format!(
            "{}, {}, {:?} {}x{}x{}",
            context, device, desc.image_type, desc.width, desc.height, desc.depth
        );
        self.call("image_create", args, |d| Ok(d.new_handle()))
    }

    fn image_view_create(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &ImageDesc,
        image: ImageHandle,
    ) -> DriverResult<ImageHandle> {
        let args = format!("{}, {}, {:?}, {}", context, device, desc.image_type, image);
        self.call("image_view_create", args, |d| Ok(d.new_handle()))
    }

    fn image_destroy(&mut self, image: ImageHandle) -> DriverResult<()> {
        self.call("image_destroy", image.to_string(), |_| Ok(()))
    }

    fn module_create(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &ModuleDesc,
    ) -> DriverResult<ModuleHandle> {
        let args = format!(
            "{}, {}, {:?} <{} bytes> \"{}\"",
            context,
            device,
            desc.format,
            desc.input.len(),
            desc.build_flags
        );
        self.call("module_create", args, |d| Ok(d.new_handle()))
    }

    fn module_dynamic_link(&mut self, modules: &[ModuleHandle]) -> DriverResult<()> {
        self.call("module_dynamic_link", handles(modules), |_| Ok(()))
    }

    fn module_get_global_pointer(
        &mut self,
        module: ModuleHandle,
        name: &str,
    ) -> DriverResult<(GpuPtr<Void>, usize)> {
        let args = format!("{}, \"{}\"", module, name);
        let key = (module, name.to_owned());
        self.call("module_get_global_pointer", args, |d| {
            if let Some(&g) = d.globals.get(&key) {
                return Ok(g);
            }
            let g = (d.new_region(DEFAULT_GLOBAL_SIZE, 8), DEFAULT_GLOBAL_SIZE);
            d.globals.insert(key, g);
            Ok(g)
        })
    }

    fn module_get_function_pointer(
        &mut self,
        module: ModuleHandle,
        name: &str,
    ) -> DriverResult<GpuPtr<Void>> {
        let args = format!("{}, \"{}\"", module, name);
        self.call("module_get_function_pointer", args, |d| {
            let p = d.new_region(0, 16);
            Ok(p)
        })
    }

    fn module_destroy(&mut self, module: ModuleHandle) -> DriverResult<()> {
        self.call("module_destroy", module.to_string(), |_| Ok(()))
    }

    fn kernel_create(&mut self, module: ModuleHandle, desc: &KernelDesc) -> DriverResult<KernelHandle> {
        let args = format!("{}, \"{}\"", module, desc.name);
        self.call("kernel_create", args, |d| Ok(d.new_handle()))
    }

    fn kernel_set_group_size(&mut self, kernel: KernelHandle, size: [u32; 3]) -> DriverResult<()> {
        let args = format!("{}, {:?}", kernel, size);
        self.call("kernel_set_group_size", args, |_| Ok(()))
    }

    fn kernel_set_global_offset(&mut self, kernel: KernelHandle, offset: [u32; 3]) -> DriverResult<()> {
        let args = format!("{}, {:?}", kernel, offset);
        self.call("kernel_set_global_offset", args, |_| Ok(()))
    }

    fn kernel_set_indirect_access(
        &mut self,
        kernel: KernelHandle,
        flags: IndirectAccessFlags,
    ) -> DriverResult<()> {
        let args = format!("{}, {:?}", kernel, flags);
        self.call("kernel_set_indirect_access", args, |_| Ok(()))
    }

    fn kernel_set_scheduling_hint(&mut self, kernel: KernelHandle, hint: u32) -> DriverResult<()> {
        let args = format!("{}, {:#x}", kernel, hint);
        self.call("kernel_set_scheduling_hint", args, |_| Ok(()))
    }

    fn kernel_set_argument_value(
        &mut self,
        kernel: KernelHandle,
        index: u32,
        size: usize,
        value: Option<&[u8]>,
    ) -> DriverResult<()> {
        let value = match value {
            Some(v) if v.len() == 8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(v);
                format!("{:#x}", u64::from_le_bytes(b))
            }
            Some(v) => format!("{:02x?}", v),
            None => "null".to_owned(),
        };
        let args = format!("{}, {}, {}, {}", kernel, index, size, value);
        self.call("kernel_set_argument_value", args, |_| Ok(()))
    }

    fn kernel_destroy(&mut self, kernel: KernelHandle) -> DriverResult<()> {
        self.call("kernel_destroy", kernel.to_string(), |_| Ok(()))
    }

    fn physical_mem_create(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        size: usize,
    ) -> DriverResult<PhysicalMemHandle> {
        let args = format!("{}, {}, {:#x}", context, device, size);
        self.call("physical_mem_create", args, |d| Ok(d.new_handle()))
    }

    fn physical_mem_destroy(&mut self, context: ContextHandle, mem: PhysicalMemHandle) -> DriverResult<()> {
        let args = format!("{}, {}", context, mem);
        self.call("physical_mem_destroy", args, |_| Ok(()))
    }

    fn virtual_mem_reserve(
        &mut self,
        context: ContextHandle,
        start_hint: GpuPtr<Void>,
        size: usize,
    ) -> DriverResult<GpuPtr<Void>> {
        let args = format!("{}, {}, {:#x}", context, start_hint, size);
        self.call("virtual_mem_reserve", args, |d| Ok(d.new_region(size, 0x1000)))
    }

    fn virtual_mem_map(
        &mut self,
        context: ContextHandle,
        ptr: GpuPtr<Void>,
        size: usize,
        mem: PhysicalMemHandle,
        offset: usize,
        access: MemoryAccess,
    ) -> DriverResult<()> {
        let args = format!(
            "{}, {}, {:#x}, {}, {:#x}, {:?}",
            context, ptr, size, mem, offset, access
        );
        self.call("virtual_mem_map", args, |d| match d.region(ptr, size) {
            Some(_) => Ok(()),
            None => Err(DriverStatus::ERROR_INVALID_ARGUMENT),
        })
    }

    fn virtual_mem_unmap(&mut self, context: ContextHandle, ptr: GpuPtr<Void>, size: usize) -> DriverResult<()> {
        let args = format!("{}, {}, {:#x}", context, ptr, size);
        self.call("virtual_mem_unmap", args, |_| Ok(()))
    }

    fn virtual_mem_free(&mut self, context: ContextHandle, ptr: GpuPtr<Void>, size: usize) -> DriverResult<()> {
        let args = format!("{}, {}, {:#x}", context, ptr, size);
        self.call("virtual_mem_free", args, |d| match d.memory.remove(&ptr) {
            Some(_) => Ok(()),
            None => Err(DriverStatus::ERROR_INVALID_ARGUMENT),
        })
    }

    fn mem_alloc_device(
        &mut self,
        context: ContextHandle,
        desc: &DeviceMemDesc,
        size: usize,
        alignment: usize,
        device: DeviceHandle,
    ) -> DriverResult<GpuPtr<Void>> {
        let args = format!(
            "{}, ordinal {}, {:#x}, {:#x}, {}",
            context, desc.ordinal, size, alignment, device
        );
        self.call("mem_alloc_device", args, |d| Ok(d.new_region(size, alignment)))
    }

    fn mem_alloc_host(
        &mut self,
        context: ContextHandle,
        desc: &HostMemDesc,
        size: usize,
        alignment: usize,
    ) -> DriverResult<GpuPtr<Void>> {
        let args = format!(
            "{}, flags {:#x}, {:#x}, {:#x}",
            context, desc.flags, size, alignment
        );
        self.call("mem_alloc_host", args, |d| Ok(d.new_region(size, alignment)))
    }

    fn mem_alloc_shared(
        &mut self,
        context: ContextHandle,
        device_desc: &DeviceMemDesc,
        host_desc: &HostMemDesc,
        size: usize,
        alignment: usize,
        device: Option<DeviceHandle>,
    ) -> DriverResult<GpuPtr<Void>> {
        let args = format!(
            "{}, ordinal {}, flags {:#x}, {:#x}, {:#x}, {}",
            context,
            device_desc.ordinal,
            host_desc.flags,
            size,
            alignment,
            opt(device)
        );
        self.call("mem_alloc_shared", args, |d| Ok(d.new_region(size, alignment)))
    }

    fn mem_free(&mut self, context: ContextHandle, ptr: GpuPtr<Void>) -> DriverResult<()> {
        let args = format!("{}, {}", context, ptr);
        self.call("mem_free", args, |d| match d.memory.remove(&ptr) {
            Some(_) => Ok(()),
            None => Err(DriverStatus::ERROR_INVALID_ARGUMENT),
        })
    }

    fn make_memory_resident(
        &mut self,
        context: ContextHandle,
        device: DeviceHandle,
        ptr: GpuPtr<Void>,
        size: usize,
    ) -> DriverResult<()> {
        let args = format!("{}, {}, {}, {:#x}", context, device, ptr, size);
        self.call("make_memory_resident", args, |_| Ok(()))
    }

    fn write_host_memory(&mut self, ptr: GpuPtr<Void>, bytes: &[u8]) -> DriverResult<()> {
        let args = format!("{}, <{} bytes>", ptr, bytes.len());
        self.call("write_host_memory", args, |d| d.write(ptr, bytes))
    }

    fn read_memory(&mut self, ptr: GpuPtr<Void>, size: usize) -> DriverResult<Vec<u8>> {
        let args = format!("{}, {:#x}", ptr, size);
        self.call("read_memory", args, |d| {
            d.memory_at(ptr, size)
                .map(|b| b.to_vec())
                .ok_or(DriverStatus::ERROR_INVALID_ARGUMENT)
        })
    }

    fn append_memory_copy(
        &mut self,
        list: CommandListHandle,
        dst: GpuPtr<Void>,
        src: &[u8],
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()> {
        let args = format!(
            "{}, {}, <{} bytes>, {}, {}",
            list,
            dst,
            src.len(),
            opt(signal),
            handles(waits)
        );
        // Copies land immediately. Nothing here models queue timing.
        self.call("append_memory_copy", args, |d| {
            d.write(dst, src)?;
            if let Some(e) = signal {
                d.signaled.insert(e, true);
            }
            Ok(())
        })
    }

    fn append_launch_kernel(
        &mut self,
        list: CommandListHandle,
        kernel: KernelHandle,
        group_count: [u32; 3],
        signal: Option<EventHandle>,
        waits: &[EventHandle],
    ) -> DriverResult<()> {
        let args = format!(
            "{}, {}, {:?}, {}, {}",
            list,
            kernel,
            group_count,
            opt(signal),
            handles(waits)
        );
        self.call("append_launch_kernel", args, |d| {
            if let Some(e) = signal {
                d.signaled.insert(e, true);
            }
            Ok(())
        })
    }

    fn event_pool_create(
        &mut self,
        context: ContextHandle,
        devices: &[DeviceHandle],
        desc: &EventPoolDesc,
    ) -> DriverResult<EventPoolHandle> {
        let args = format!(
            "{}, {}, flags {:#x} count {}",
            context,
            handles(devices),
            desc.flags,
            desc.count
        );
        self.call("event_pool_create", args, |d| Ok(d.new_handle()))
    }

    fn event_pool_destroy(&mut self, pool: EventPoolHandle) -> DriverResult<()> {
        self.call("event_pool_destroy", pool.to_string(), |_| Ok(()))
    }

    fn event_create(&mut self, pool: EventPoolHandle, desc: &EventDesc) -> DriverResult<EventHandle> {
        let args = format!("{}, index {}", pool, desc.index);
        self.call("event_create", args, |d| {
            let e = d.new_handle();
            d.signaled.insert(e, false);
            Ok(e)
        })
    }

    fn event_host_signal(&mut self, event: EventHandle) -> DriverResult<()> {
        self.call("event_host_signal", event.to_string(), |d| {
            d.signaled.insert(event, true);
            Ok(())
        })
    }

    fn event_host_reset(&mut self, event: EventHandle) -> DriverResult<()> {
        self.call("event_host_reset", event.to_string(), |d| {
            d.signaled.insert(event, false);
            Ok(())
        })
    }

    fn event_destroy(&mut self, event: EventHandle) -> DriverResult<()> {
        self.call("event_destroy", event.to_string(), |d| {
            d.signaled.remove(&event);
            Ok(())
        })
    }

    fn fence_create(&mut self, queue: CommandQueueHandle, desc: &FenceDesc) -> DriverResult<FenceHandle> {
        let args = format!("{}, flags {:#x}", queue, desc.flags);
        self.call("fence_create", args, |d| Ok(d.new_handle()))
    }

    fn fence_destroy(&mut self, fence: FenceHandle) -> DriverResult<()> {
        self.call("fence_destroy", fence.to_string(), |_| Ok(()))
    }
}
