//! Registry updates for intercepted calls.
//!
//! Each hook runs after the intercepted driver call returned success, with the
//! values the application passed and got back. Capture time handles are both
//! the registry keys and the live handles, so everything is marked restored
//! as soon as it is inserted. Hooks do nothing while the session is nested
//! inside a driver call the engine issued itself.

use crate::{
    driver::Driver,
    error::{GcrError, GcrResult},
    event_simulator::{self, DrainDecision},
    gpu_ptr::{read_embedded_ptr, GpuPtr, Void, EMBEDDED_PTR_SIZE},
    handle_map::*,
    log::LogLevel::{LogDebug, LogWarn},
    session::Session,
    state::{
        action_log::Action,
        allocation::{
            AllocationKind, AllocationState, MemoryKind, MemorySnapshot, Residency, VirtualMapping,
        },
        descriptors::*,
        kernel_info::{ArgClass, KernelArg, KernelExecutionInfo},
        objects::*,
        ObjectCategory, StateRegistry,
    },
    translator::{find_allocation, scan_for_indirect_pointers},
};

macro_rules! skip_if_nested {
    ($session:expr) => {
        if $session.is_nested() {
            return Ok(Default::default());
        }
    };
}

pub fn on_driver_get(s: &mut Session, drivers: &[DriverHandle]) -> GcrResult<()> {
    skip_if_nested!(s);
    for (ordinal, &d) in drivers.iter().enumerate() {
        if !s.registry.exists::<DriverState>(d) {
            s.registry.insert(
                d,
                DriverState {
                    ordinal: ordinal as u32,
                    restored: true,
                },
            );
        }
    }
    Ok(())
}

pub fn on_device_get(s: &mut Session, driver: DriverHandle, devices: &[DeviceHandle]) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.get::<DriverState>(driver)?;
    for (ordinal, &d) in devices.iter().enumerate() {
        if !s.registry.exists::<DeviceState>(d) {
            s.registry.insert(
                d,
                DeviceState {
                    driver,
                    parent: None,
                    ordinal: ordinal as u32,
                    restored: true,
                },
            );
        }
    }
    Ok(())
}

pub fn on_sub_devices_get(s: &mut Session, device: DeviceHandle, sub_devices: &[DeviceHandle]) -> GcrResult<()> {
    skip_if_nested!(s);
    let driver = s.registry.get::<DeviceState>(device)?.driver;
    for (ordinal, &d) in sub_devices.iter().enumerate() {
        if !s.registry.exists::<DeviceState>(d) {
            s.registry.insert(
                d,
                DeviceState {
                    driver,
                    parent: Some(device),
                    ordinal: ordinal as u32,
                    restored: true,
                },
            );
        }
    }
    Ok(())
}

pub fn on_context_create(
    s: &mut Session,
    driver: DriverHandle,
    devices: &[DeviceHandle],
    desc: &ContextDesc,
    context: ContextHandle,
) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.insert(
        context,
        ContextState {
            driver,
            devices: devices.to_vec(),
            desc: desc.clone(),
            restored: true,
        },
    );
    Ok(())
}

pub fn on_context_destroy(s: &mut Session, context: ContextHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.release::<ContextState>(context);
    Ok(())
}

pub fn on_command_list_create(
    s: &mut Session,
    context: ContextHandle,
    device: DeviceHandle,
    desc: &CommandListDesc,
    list: CommandListHandle,
) -> GcrResult<()> {
    skip_if_nested!(s);
    let mut state = CommandListState::new(context, device, CommandListMode::Deferred(desc.clone()));
    state.restored = true;
    s.registry.insert(list, state);
    Ok(())
}

pub fn on_command_list_create_immediate(
    s: &mut Session,
    context: ContextHandle,
    device: DeviceHandle,
    desc: &CommandQueueDesc,
    list: CommandListHandle,
) -> GcrResult<()> {
    skip_if_nested!(s);
    let mut state = CommandListState::new(context, device, CommandListMode::Immediate(desc.clone()));
    state.restored = true;
    s.registry.insert(list, state);
    Ok(())
}

pub fn on_command_list_close(s: &mut Session, list: CommandListHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.get_mut::<CommandListState>(list)?.closed = true;
    Ok(())
}

/// Clears the action log and the dispatch history.
pub fn on_command_list_reset(s: &mut Session, list: CommandListHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    let l = s.registry.get_mut::<CommandListState>(list)?;
    l.actions.clear();
    l.kernel_history.clear();
    l.closed = false;
    l.pending_on = None;
    Ok(())
}

pub fn on_command_list_destroy(s: &mut Session, list: CommandListHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.release::<CommandListState>(list);
    Ok(())
}

pub fn on_command_queue_create(
    s: &mut Session,
    context: ContextHandle,
    device: DeviceHandle,
    desc: &CommandQueueDesc,
    queue: CommandQueueHandle,
) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.insert(
        queue,
        CommandQueueState {
            context,
            device,
            desc: desc.clone(),
            restored: true,
        },
    );
    Ok(())
}

pub fn on_command_queue_destroy(s: &mut Session, queue: CommandQueueHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.release::<CommandQueueState>(queue);
    Ok(())
}

pub fn on_image_create(
    s: &mut Session,
    context: ContextHandle,
    device: DeviceHandle,
    desc: &ImageDesc,
    image: ImageHandle,
) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.insert(
        image,
        ImageState {
            context,
            device,
            desc: desc.clone(),
            view_of: None,
            restored: true,
        },
    );
    Ok(())
}

pub fn on_image_view_create(
    s: &mut Session,
    context: ContextHandle,
    device: DeviceHandle,
    desc: &ImageDesc,
    image: ImageHandle,
    view: ImageHandle,
) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.get::<ImageState>(image)?;
    s.registry.insert(
        view,
        ImageState {
            context,
            device,
            desc: desc.clone(),
            view_of: Some(image),
            restored: true,
        },
    );
    Ok(())
}

pub fn on_image_destroy(s: &mut Session, image: ImageHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.release::<ImageState>(image);
    Ok(())
}

pub fn on_module_create(
    s: &mut Session,
    context: ContextHandle,
    device: DeviceHandle,
    desc: &ModuleDesc,
    module: ModuleHandle,
) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.insert(
        module,
        ModuleState {
            context,
            device,
            desc: desc.clone(),
            link_group: Vec::new(),
            restored: true,
        },
    );
    Ok(())
}

/// Every module of the call remembers the whole group, itself included.
pub fn on_module_dynamic_link(s: &mut Session, modules: &[ModuleHandle]) -> GcrResult<()> {
    skip_if_nested!(s);
    for &m in modules {
        let state = s.registry.get_mut::<ModuleState>(m)?;
        for &member in modules {
            if !state.link_group.contains(&member) {
                state.link_group.push(member);
            }
        }
    }
    Ok(())
}

/// Symbol lookups made through the module go away with it.
pub fn on_module_destroy(s: &mut Session, module: ModuleHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    let symbols: Vec<GpuPtr<Void>> = s
        .registry
        .allocations_ordered()
        .into_iter()
        .filter(|(_, a)| match &a.kind {
            AllocationKind::GlobalSymbol { module: m, .. }
            | AllocationKind::FunctionPointer { module: m, .. } => *m == module,
            _ => false,
        })
        .map(|(base, _)| base)
        .collect();
    for base in symbols {
        s.registry.release_allocation(base);
    }
    for other in s.registry.handles::<ModuleState>() {
        s.registry.get_mut::<ModuleState>(other)?.link_group.retain(|&m| m != module);
    }
    s.registry.release::<ModuleState>(module);
    Ok(())
}

fn insert_live_allocation(s: &mut Session, ptr: GpuPtr<Void>, mut state: AllocationState) -> u64 {
    state.restored = true;
    s.registry.insert_allocation(ptr, state)
}

pub fn on_module_get_global_pointer(
    s: &mut Session,
    module: ModuleHandle,
    name: &str,
    ptr: GpuPtr<Void>,
    size: usize,
) -> GcrResult<()> {
    skip_if_nested!(s);
    // Repeated lookups of the same symbol return the same address.
    if s.registry.allocation_exists(ptr) {
        return Ok(());
    }
    let m = s.registry.get::<ModuleState>(module)?;
    let state = AllocationState::new(
        m.context,
        Some(m.device),
        size,
        0,
        MemoryKind::Device,
        AllocationKind::GlobalSymbol {
            module,
            name: name.to_owned(),
        },
    );
    insert_live_allocation(s, ptr, state);
    Ok(())
}

/// Function pointers have no data; the allocation is tracked with size 0 so
/// only the exact address resolves.
pub fn on_module_get_function_pointer(
    s: &mut Session,
    module: ModuleHandle,
    name: &str,
    ptr: GpuPtr<Void>,
) -> GcrResult<()> {
    skip_if_nested!(s);
    if s.registry.allocation_exists(ptr) {
        return Ok(());
    }
    let m = s.registry.get::<ModuleState>(module)?;
    let state = AllocationState::new(
        m.context,
        Some(m.device),
        0,
        0,
        MemoryKind::Device,
        AllocationKind::FunctionPointer {
            module,
            name: name.to_owned(),
        },
    );
    insert_live_allocation(s, ptr, state);
    Ok(())
}

pub fn on_mem_alloc_device(
    s: &mut Session,
    context: ContextHandle,
    desc: &DeviceMemDesc,
    size: usize,
    alignment: usize,
    device: DeviceHandle,
    ptr: GpuPtr<Void>,
) -> GcrResult<u64> {
    skip_if_nested!(s);
    let state = AllocationState::new(
        context,
        Some(device),
        size,
        alignment,
        MemoryKind::Device,
        AllocationKind::Pointer {
            device_desc: Some(desc.clone()),
            host_desc: None,
        },
    );
    Ok(insert_live_allocation(s, ptr, state))
}

pub fn on_mem_alloc_host(
    s: &mut Session,
    context: ContextHandle,
    desc: &HostMemDesc,
    size: usize,
    alignment: usize,
    ptr: GpuPtr<Void>,
) -> GcrResult<u64> {
    skip_if_nested!(s);
    let state = AllocationState::new(
        context,
        None,
        size,
        alignment,
        MemoryKind::Host,
        AllocationKind::Pointer {
            device_desc: None,
            host_desc: Some(desc.clone()),
        },
    );
    Ok(insert_live_allocation(s, ptr, state))
}

pub fn on_mem_alloc_shared(
    s: &mut Session,
    context: ContextHandle,
    device_desc: &DeviceMemDesc,
    host_desc: &HostMemDesc,
    size: usize,
    alignment: usize,
    device: Option<DeviceHandle>,
    ptr: GpuPtr<Void>,
) -> GcrResult<u64> {
    skip_if_nested!(s);
    let state = AllocationState::new(
        context,
        device,
        size,
        alignment,
        MemoryKind::Shared,
        AllocationKind::Pointer {
            device_desc: Some(device_desc.clone()),
            host_desc: Some(host_desc.clone()),
        },
    );
    Ok(insert_live_allocation(s, ptr, state))
}

pub fn on_mem_free(s: &mut Session, ptr: GpuPtr<Void>) -> GcrResult<()> {
    skip_if_nested!(s);
    match s.registry.release_allocation(ptr) {
        Some(_) => Ok(()),
        None => Err(GcrError::not_found(ObjectCategory::Allocation.name(), ptr.as_u64())),
    }
}

pub fn on_physical_mem_create(
    s: &mut Session,
    context: ContextHandle,
    device: DeviceHandle,
    size: usize,
    mem: PhysicalMemHandle,
) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.insert(
        mem,
        PhysicalMemState {
            context,
            device,
            size,
            restored: true,
        },
    );
    Ok(())
}

pub fn on_physical_mem_destroy(s: &mut Session, mem: PhysicalMemHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.release::<PhysicalMemState>(mem);
    Ok(())
}

pub fn on_virtual_mem_reserve(
    s: &mut Session,
    context: ContextHandle,
    start_hint: GpuPtr<Void>,
    size: usize,
    ptr: GpuPtr<Void>,
) -> GcrResult<u64> {
    skip_if_nested!(s);
    let state = AllocationState::new(
        context,
        None,
        size,
        0,
        MemoryKind::Device,
        AllocationKind::VirtualReservation { start_hint },
    );
    Ok(insert_live_allocation(s, ptr, state))
}

fn reservation_containing(registry: &StateRegistry, ptr: GpuPtr<Void>) -> GcrResult<(GpuPtr<Void>, usize)> {
    registry
        .reservation_containing(ptr)
        .and_then(|(base, _)| ptr.byte_offset_from(base).map(|off| (base, off)))
        .ok_or_else(|| GcrError::not_found("virtual reservation", ptr.as_u64()))
}

pub fn on_virtual_mem_map(
    s: &mut Session,
    ptr: GpuPtr<Void>,
    size: usize,
    mem: PhysicalMemHandle,
    physical_offset: usize,
    access: MemoryAccess,
) -> GcrResult<()> {
    skip_if_nested!(s);
    let (base, offset) = reservation_containing(&s.registry, ptr)?;
    let device = s.registry.get::<PhysicalMemState>(mem)?.device;
    let a = s.registry.allocation_mut(base)?;
    if offset + size > a.size {
        log!(
            LogWarn,
            "mapping {:#x} bytes at {} runs past the end of reservation {}",
            size,
            ptr,
            base
        );
        return Err(GcrError::not_found("virtual reservation", ptr.as_u64()));
    }
    if a.device.is_none() {
        a.device = Some(device);
    }
    a.virtual_mappings.push(VirtualMapping {
        offset,
        size,
        physical_mem: mem,
        physical_offset,
        access,
    });
    Ok(())
}

pub fn on_virtual_mem_unmap(s: &mut Session, ptr: GpuPtr<Void>, size: usize) -> GcrResult<()> {
    skip_if_nested!(s);
    let (base, offset) = reservation_containing(&s.registry, ptr)?;
    let a = s.registry.allocation_mut(base)?;
    a.virtual_mappings
        .retain(|m| m.offset + m.size <= offset || offset + size <= m.offset);
    Ok(())
}

pub fn on_virtual_mem_free(s: &mut Session, ptr: GpuPtr<Void>) -> GcrResult<()> {
    on_mem_free(s, ptr)
}

pub fn on_make_memory_resident(
    s: &mut Session,
    context: ContextHandle,
    device: DeviceHandle,
    ptr: GpuPtr<Void>,
    size: usize,
) -> GcrResult<()> {
    skip_if_nested!(s);
    let (base, offset) = find_allocation(&s.registry, ptr)
        .ok_or_else(|| GcrError::not_found(ObjectCategory::Allocation.name(), ptr.as_u64()))?;
    s.registry.allocation_mut(base)?.residency = Some(Residency {
        context,
        device,
        offset,
        size,
    });
    Ok(())
}

pub fn on_kernel_create(
    s: &mut Session,
    module: ModuleHandle,
    desc: &KernelDesc,
    kernel: KernelHandle,
) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.get::<ModuleState>(module)?;
    s.registry.insert(
        kernel,
        KernelState {
            module,
            desc: desc.clone(),
            settings: Default::default(),
            last_execution: None,
            restored: true,
        },
    );
    Ok(())
}

pub fn on_kernel_destroy(s: &mut Session, kernel: KernelHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.release::<KernelState>(kernel);
    Ok(())
}

pub fn on_kernel_set_group_size(s: &mut Session, kernel: KernelHandle, size: [u32; 3]) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.get_mut::<KernelState>(kernel)?.settings.group_size = Some(size);
    Ok(())
}

pub fn on_kernel_set_global_offset(s: &mut Session, kernel: KernelHandle, offset: [u32; 3]) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.get_mut::<KernelState>(kernel)?.settings.global_offset = Some(offset);
    Ok(())
}

pub fn on_kernel_set_indirect_access(
    s: &mut Session,
    kernel: KernelHandle,
    flags: IndirectAccessFlags,
) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.get_mut::<KernelState>(kernel)?.settings.indirect_access = Some(flags);
    Ok(())
}

pub fn on_kernel_set_scheduling_hint(s: &mut Session, kernel: KernelHandle, hint: u32) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.get_mut::<KernelState>(kernel)?.settings.scheduling_hint = Some(hint);
    Ok(())
}

/// Pointer sized values are resolved against the tracked allocations, then
/// the live images. Anything else is an opaque value.
pub fn classify_argument(registry: &StateRegistry, size: usize, value: Option<&[u8]>) -> ArgClass {
    let bytes = match value {
        Some(b) => b,
        None => return ArgClass::LocalMemory(size),
    };
    if bytes.len() != EMBEDDED_PTR_SIZE {
        return ArgClass::Value;
    }
    let raw = match read_embedded_ptr(bytes, 0) {
        Some(p) if !p.is_null() => p,
        _ => return ArgClass::Value,
    };
    if let Some((allocation, offset)) = find_allocation(registry, raw) {
        if let Ok(a) = registry.allocation(allocation) {
            return ArgClass::Buffer {
                allocation,
                offset,
                allocation_size: a.size,
            };
        }
    }
    let image = ImageHandle::from_raw(raw.as_u64());
    if registry.exists::<ImageState>(image) {
        return ArgClass::Image(image);
    }
    ArgClass::Value
}

pub fn on_kernel_set_argument_value(
    s: &mut Session,
    kernel: KernelHandle,
    index: u32,
    size: usize,
    value: Option<&[u8]>,
) -> GcrResult<()> {
    skip_if_nested!(s);
    let class = classify_argument(&s.registry, size, value);
    log!(LogDebug, "kernel {} arg {}: {:?}", kernel, index, class);
    let arg = KernelArg {
        class,
        bytes: value.map(|v| v.to_vec()).unwrap_or_default(),
    };
    s.registry
        .get_mut::<KernelState>(kernel)?
        .settings
        .args
        .insert(index, arg);
    Ok(())
}

/// Returns the kernel number assigned to the dispatch.
pub fn on_append_launch_kernel(
    s: &mut Session,
    list: CommandListHandle,
    kernel: KernelHandle,
    group_count: [u32; 3],
    signal: Option<EventHandle>,
    waits: &[EventHandle],
) -> GcrResult<u32> {
    skip_if_nested!(s);
    s.registry.get::<CommandListState>(list)?;
    let k = s.registry.get::<KernelState>(kernel)?;
    let (module, kernel_name, settings) = (k.module, k.desc.name.clone(), k.settings.clone());
    let kernel_number = s.next_kernel_number();
    let action = Action::normal(signal, waits);
    let (signal_event, wait_events) = match &action {
        Action::Normal { signal, waits } => (*signal, waits.clone()),
        _ => (None, Vec::new()),
    };
    let info = KernelExecutionInfo {
        kernel,
        module,
        kernel_name,
        command_list: list,
        kernel_number,
        group_count,
        settings,
        signal_event,
        wait_events,
    };
    s.registry.get_mut::<KernelState>(kernel)?.last_execution = Some(info.clone());
    let l = s.registry.get_mut::<CommandListState>(list)?;
    l.kernel_history.push(info);
    l.actions.push(action);
    log!(LogDebug, "kernel #{} appended to {}", kernel_number, list);
    Ok(kernel_number)
}

fn push_action(s: &mut Session, list: CommandListHandle, action: Action) -> GcrResult<()> {
    s.registry.get_mut::<CommandListState>(list)?.actions.push(action);
    Ok(())
}

pub fn on_append_memory_copy(
    s: &mut Session,
    list: CommandListHandle,
    signal: Option<EventHandle>,
    waits: &[EventHandle],
) -> GcrResult<()> {
    skip_if_nested!(s);
    push_action(s, list, Action::normal(signal, waits))
}

pub fn on_append_barrier(
    s: &mut Session,
    list: CommandListHandle,
    signal: Option<EventHandle>,
    waits: &[EventHandle],
) -> GcrResult<()> {
    skip_if_nested!(s);
    push_action(s, list, Action::normal(signal, waits))
}

pub fn on_append_wait_on_events(s: &mut Session, list: CommandListHandle, waits: &[EventHandle]) -> GcrResult<()> {
    skip_if_nested!(s);
    push_action(s, list, Action::normal(None, waits))
}

pub fn on_append_signal_event(s: &mut Session, list: CommandListHandle, event: EventHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    push_action(s, list, Action::Signal(event))
}

pub fn on_append_reset_event(s: &mut Session, list: CommandListHandle, event: EventHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    push_action(s, list, Action::Reset(event))
}

pub fn on_event_pool_create(
    s: &mut Session,
    context: ContextHandle,
    devices: &[DeviceHandle],
    desc: &EventPoolDesc,
    pool: EventPoolHandle,
) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.insert(
        pool,
        EventPoolState {
            context,
            devices: devices.to_vec(),
            desc: desc.clone(),
            restored: true,
        },
    );
    Ok(())
}

pub fn on_event_pool_destroy(s: &mut Session, pool: EventPoolHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.release::<EventPoolState>(pool);
    Ok(())
}

pub fn on_event_create(s: &mut Session, pool: EventPoolHandle, desc: &EventDesc, event: EventHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.get::<EventPoolState>(pool)?;
    s.registry.insert(
        event,
        EventState {
            pool,
            desc: desc.clone(),
            signaled: false,
            restored: true,
        },
    );
    Ok(())
}

pub fn on_event_destroy(s: &mut Session, event: EventHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.release::<EventState>(event);
    Ok(())
}

/// Host signal, host reset, or a status query that observed `signaled`.
pub fn on_event_status(s: &mut Session, event: EventHandle, signaled: bool) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.get_mut::<EventState>(event)?.signaled = signaled;
    Ok(())
}

pub fn on_fence_create(
    s: &mut Session,
    queue: CommandQueueHandle,
    desc: &FenceDesc,
    fence: FenceHandle,
) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.insert(
        fence,
        FenceState {
            queue,
            desc: desc.clone(),
            signaled: false,
            restored: true,
        },
    );
    Ok(())
}

pub fn on_fence_reset(s: &mut Session, fence: FenceHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.get_mut::<FenceState>(fence)?.signaled = false;
    Ok(())
}

pub fn on_fence_destroy(s: &mut Session, fence: FenceHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    s.registry.release::<FenceState>(fence);
    Ok(())
}

pub fn on_command_queue_execute(
    s: &mut Session,
    queue: CommandQueueHandle,
    lists: &[CommandListHandle],
    fence: Option<FenceHandle>,
) -> GcrResult<()> {
    skip_if_nested!(s);
    for &l in lists {
        s.registry.get_mut::<CommandListState>(l)?.pending_on = Some(queue);
    }
    if let Some(f) = fence {
        s.registry.get_mut::<FenceState>(f)?.signaled = false;
    }
    Ok(())
}

/// The work recorded in `list` is known to have completed: apply its event
/// effects to the registry.
fn retire(registry: &mut StateRegistry, list: CommandListHandle) -> GcrResult<()> {
    let l = registry.get_mut::<CommandListState>(list)?;
    l.pending_on = None;
    let actions = l.actions.clone();
    for a in actions.iter() {
        let (event, signaled) = match a {
            Action::Normal {
                signal: Some(e), ..
            } => (*e, true),
            Action::Normal { signal: None, .. } => continue,
            Action::Signal(e) => (*e, true),
            Action::Reset(e) => (*e, false),
        };
        match registry.get_mut::<EventState>(event) {
            Ok(e) => e.signaled = signaled,
            Err(_) => log!(LogWarn, "{} retired an action on destroyed event {}", list, event),
        }
    }
    Ok(())
}

pub fn on_command_queue_synchronize(s: &mut Session, queue: CommandQueueHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    let lists: Vec<CommandListHandle> = s
        .registry
        .table::<CommandListState>()
        .ordered()
        .into_iter()
        .filter(|(_, l)| l.pending_on == Some(queue))
        .map(|(h, _)| h)
        .collect();
    for l in lists {
        retire(&mut s.registry, l)?;
    }
    let fences: Vec<FenceHandle> = s
        .registry
        .table::<FenceState>()
        .ordered()
        .into_iter()
        .filter(|(_, f)| f.queue == queue)
        .map(|(h, _)| h)
        .collect();
    for f in fences {
        s.registry.get_mut::<FenceState>(f)?.signaled = true;
    }
    Ok(())
}

/// Immediate lists have nothing left to run afterwards, so their log is
/// dropped once applied.
pub fn on_command_list_host_synchronize(s: &mut Session, list: CommandListHandle) -> GcrResult<()> {
    skip_if_nested!(s);
    retire(&mut s.registry, list)?;
    let l = s.registry.get_mut::<CommandListState>(list)?;
    if l.is_immediate() {
        l.actions.clear();
    }
    Ok(())
}

/// Record capture-time knowledge that `offsets` of the allocation at `base`
/// hold pointers.
pub fn add_indirect_pointer_offsets(s: &mut Session, base: GpuPtr<Void>, offsets: &[usize]) -> GcrResult<()> {
    let a = s.registry.allocation_mut(base)?;
    for &o in offsets {
        a.indirect_offsets.add(o);
    }
    Ok(())
}

/// Copy the current contents of the allocation at `base` back through
/// `driver` and keep them as its snapshot.
pub fn snapshot_memory<D: Driver>(s: &mut Session, driver: &mut D, base: GpuPtr<Void>) -> GcrResult<()> {
    // Our own driver calls must not be recorded as application calls.
    let _scope = s.intercept();
    let a = s.registry.allocation(base)?;
    let size = a.size;
    let bytes = match &a.kind {
        AllocationKind::FunctionPointer { .. } => return Ok(()),
        AllocationKind::VirtualReservation { .. } => {
            if a.virtual_mappings.is_empty() {
                return Ok(());
            }
            let segments: Vec<(usize, usize)> =
                a.virtual_mappings.iter().map(|m| (m.offset, m.size)).collect();
            let mut bytes = vec![0u8; size];
            for (offset, len) in segments {
                let seg = driver
                    .read_memory(base + offset, len)
                    .map_err(|status| GcrError::driver_call("read_memory", status))?;
                bytes[offset..offset + seg.len()].copy_from_slice(&seg);
            }
            bytes
        }
        _ => driver
            .read_memory(base, size)
            .map_err(|status| GcrError::driver_call("read_memory", status))?,
    };
    let found = if s.flags.scan_indirect_pointers {
        scan_for_indirect_pointers(&s.registry, &bytes)
    } else {
        Vec::new()
    };
    let a = s.registry.allocation_mut(base)?;
    for o in found {
        a.indirect_offsets.add(o);
    }
    a.snapshot = Some(MemorySnapshot::new(bytes));
    Ok(())
}

pub fn snapshot_all_memory<D: Driver>(s: &mut Session, driver: &mut D) -> GcrResult<()> {
    let bases: Vec<GpuPtr<Void>> = s
        .registry
        .allocations_ordered()
        .into_iter()
        .map(|(b, _)| b)
        .collect();
    for base in bases {
        snapshot_memory(s, driver, base)?;
    }
    Ok(())
}

/// Can `targets` be synchronized now for a diagnostic dump?
pub fn check_drain(s: &Session, targets: &[CommandListHandle]) -> GcrResult<DrainDecision> {
    let decision = event_simulator::check_drain(&s.registry, targets)?;
    let destroyed = &decision.report().destroyed_waits;
    if s.flags.fatal_errors_and_warnings && !destroyed.is_empty() {
        fatal!("application waits on destroyed event(s) {:?}", destroyed);
    }
    Ok(decision)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{driver::recording_driver::RecordingDriver, flags::Flags, gpu_ptr::write_embedded_ptr};

    /// A live application: calls go to `driver`, successes are reported to
    /// the session.
    pub(crate) struct App {
        pub session: Session,
        pub driver: RecordingDriver,
        pub context: ContextHandle,
        pub device: DeviceHandle,
    }

    impl App {
        pub fn new(flags: Flags) -> App {
            let mut session = Session::new(flags);
            let mut driver = RecordingDriver::new();
            let drivers = driver.driver_get().unwrap();
            on_driver_get(&mut session, &drivers).unwrap();
            let devices = driver.device_get(drivers[0]).unwrap();
            on_device_get(&mut session, drivers[0], &devices).unwrap();
            let desc = ContextDesc::default();
            let context = driver.context_create(drivers[0], &devices, &desc).unwrap();
            on_context_create(&mut session, drivers[0], &devices, &desc, context).unwrap();
            App {
                session,
                driver,
                context,
                device: devices[0],
            }
        }

        pub fn alloc_device(&mut self, size: usize) -> GpuPtr<Void> {
            let desc = DeviceMemDesc::default();
            let p = self
                .driver
                .mem_alloc_device(self.context, &desc, size, 64, self.device)
                .unwrap();
            on_mem_alloc_device(&mut self.session, self.context, &desc, size, 64, self.device, p).unwrap();
            p
        }

        pub fn alloc_host(&mut self, size: usize) -> GpuPtr<Void> {
            let desc = HostMemDesc::default();
            let p = self.driver.mem_alloc_host(self.context, &desc, size, 64).unwrap();
            on_mem_alloc_host(&mut self.session, self.context, &desc, size, 64, p).unwrap();
            p
        }

        pub fn list(&mut self) -> CommandListHandle {
            let desc = CommandListDesc::default();
            let l = self
                .driver
                .command_list_create(self.context, self.device, &desc)
                .unwrap();
            on_command_list_create(&mut self.session, self.context, self.device, &desc, l).unwrap();
            l
        }

        pub fn events(&mut self, count: u32) -> Vec<EventHandle> {
            let desc = EventPoolDesc { flags: 0, count };
            let pool = self
                .driver
                .event_pool_create(self.context, &[self.device], &desc)
                .unwrap();
            on_event_pool_create(&mut self.session, self.context, &[self.device], &desc, pool).unwrap();
            (0..count)
                .map(|index| {
                    let d = EventDesc {
                        index,
                        ..Default::default()
                    };
                    let e = self.driver.event_create(pool, &d).unwrap();
                    on_event_create(&mut self.session, pool, &d, e).unwrap();
                    e
                })
                .collect()
        }

        pub fn kernel(&mut self, name: &str) -> KernelHandle {
            let mdesc = ModuleDesc {
                format: ModuleFormat::IntermediateLanguage,
                input: vec![0x07, 0x23, 0x02, 0x03],
                build_flags: String::new(),
                spec_constants: Vec::new(),
            };
            let module = self
                .driver
                .module_create(self.context, self.device, &mdesc)
                .unwrap();
            on_module_create(&mut self.session, self.context, self.device, &mdesc, module).unwrap();
            let kdesc = KernelDesc {
                flags: 0,
                name: name.to_owned(),
            };
            let k = self.driver.kernel_create(module, &kdesc).unwrap();
            on_kernel_create(&mut self.session, module, &kdesc, k).unwrap();
            k
        }

        pub fn set_ptr_arg(&mut self, kernel: KernelHandle, index: u32, p: GpuPtr<Void>) {
            let bytes = p.as_u64().to_le_bytes();
            self.driver
                .kernel_set_argument_value(kernel, index, 8, Some(&bytes))
                .unwrap();
            on_kernel_set_argument_value(&mut self.session, kernel, index, 8, Some(&bytes)).unwrap();
        }

        pub fn launch(
            &mut self,
            list: CommandListHandle,
            kernel: KernelHandle,
            signal: Option<EventHandle>,
            waits: &[EventHandle],
        ) -> u32 {
            self.driver
                .append_launch_kernel(list, kernel, [4, 1, 1], signal, waits)
                .unwrap();
            on_append_launch_kernel(&mut self.session, list, kernel, [4, 1, 1], signal, waits).unwrap()
        }

        pub fn write(&mut self, p: GpuPtr<Void>, bytes: &[u8]) {
            self.driver.write_host_memory(p, bytes).unwrap();
        }
    }

    #[test]
    fn creation_marks_live_objects_restored() {
        let app = App::new(Flags::default());
        let c = app.session.registry().get::<ContextState>(app.context).unwrap();
        assert!(c.restored);
        assert_eq!(c.devices, vec![app.device]);
    }

    #[test]
    fn nested_calls_are_not_recorded() {
        let mut app = App::new(Flags::default());
        let p = GpuPtr::new_from_val(0x5000);
        {
            let _outer = app.session.intercept();
            let _inner = app.session.intercept();
            on_mem_alloc_host(&mut app.session, app.context, &HostMemDesc::default(), 16, 0, p).unwrap();
        }
        assert!(!app.session.registry().allocation_exists(p));
        {
            let _outer = app.session.intercept();
            on_mem_alloc_host(&mut app.session, app.context, &HostMemDesc::default(), 16, 0, p).unwrap();
        }
        assert!(app.session.registry().allocation_exists(p));
    }

    #[test]
    fn argument_classification() {
        let mut app = App::new(Flags::default());
        let buf = app.alloc_device(256);
        let k = app.kernel("k");
        app.set_ptr_arg(k, 0, buf + 16usize);
        app.set_ptr_arg(k, 1, GpuPtr::new_from_val(0x1234));
        on_kernel_set_argument_value(&mut app.session, k, 2, 4, Some(&[1, 0, 0, 0])).unwrap();
        on_kernel_set_argument_value(&mut app.session, k, 3, 512, None).unwrap();

        let args = &app.session.registry().get::<KernelState>(k).unwrap().settings.args;
        assert_eq!(
            args[&0].class,
            ArgClass::Buffer {
                allocation: buf,
                offset: 16,
                allocation_size: 256
            }
        );
        assert_eq!(args[&1].class, ArgClass::Value);
        assert_eq!(args[&2].class, ArgClass::Value);
        assert_eq!(args[&3].class, ArgClass::LocalMemory(512));
        assert!(args[&3].bytes.is_empty());
    }

    #[test]
    fn launches_are_numbered_and_logged() {
        let mut app = App::new(Flags::default());
        let l = app.list();
        let k = app.kernel("k");
        let ev = app.events(2);
        assert_eq!(app.launch(l, k, Some(ev[0]), &[]), 1);
        assert_eq!(app.launch(l, k, None, &[ev[0], ev[1]]), 2);

        let list = app.session.registry().get::<CommandListState>(l).unwrap();
        assert_eq!(list.kernel_history.len(), 2);
        assert_eq!(list.actions.len(), 2);
        assert_eq!(list.kernel_history[1].wait_events, ev);
        let kernel = app.session.registry().get::<KernelState>(k).unwrap();
        assert_eq!(kernel.last_execution.as_ref().unwrap().kernel_number, 2);

        on_command_list_reset(&mut app.session, l).unwrap();
        let list = app.session.registry().get::<CommandListState>(l).unwrap();
        assert!(list.actions.is_empty());
        assert!(list.kernel_history.is_empty());
    }

    #[test]
    fn queue_synchronize_applies_event_effects() {
        let mut app = App::new(Flags::default());
        let l = app.list();
        let ev = app.events(2);
        let k = app.kernel("k");
        on_event_status(&mut app.session, ev[1], true).unwrap();
        app.launch(l, k, Some(ev[0]), &[]);
        on_append_reset_event(&mut app.session, l, ev[1]).unwrap();
        let q = CommandQueueHandle::from_raw(0x99);
        on_command_queue_create(&mut app.session, app.context, app.device, &Default::default(), q).unwrap();
        on_command_queue_execute(&mut app.session, q, &[l], None).unwrap();
        assert!(app.session.registry().get::<CommandListState>(l).unwrap().is_pending());

        on_command_queue_synchronize(&mut app.session, q).unwrap();
        let r = app.session.registry();
        assert!(!r.get::<CommandListState>(l).unwrap().is_pending());
        assert!(r.get::<EventState>(ev[0]).unwrap().signaled);
        assert!(!r.get::<EventState>(ev[1]).unwrap().signaled);
    }

    #[test]
    fn drain_check_over_pending_lists() {
        let mut app = App::new(Flags::default());
        let l1 = app.list();
        let l2 = app.list();
        let ev = app.events(1);
        on_append_wait_on_events(&mut app.session, l1, &ev).unwrap();
        let q = CommandQueueHandle::from_raw(0x99);
        on_command_queue_execute(&mut app.session, q, &[l1], None).unwrap();

        // l2 signals but was never submitted, so it cannot help.
        on_append_signal_event(&mut app.session, l2, ev[0]).unwrap();
        assert!(!check_drain(&app.session, &[l1]).unwrap().is_drainable());

        on_command_queue_execute(&mut app.session, q, &[l2], None).unwrap();
        let d = check_drain(&app.session, &[l1]).unwrap();
        assert!(d.is_drainable());
        assert!(d.report().is_signaled(ev[0]));

        assert!(check_drain(&app.session, &[CommandListHandle::from_raw(0x4242)])
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn snapshot_with_scan() {
        let mut flags = Flags::default();
        flags.scan_indirect_pointers = true;
        let mut app = App::new(flags);
        let table = app.alloc_host(32);
        let target = app.alloc_device(64);
        let mut bytes = vec![0u8; 32];
        write_embedded_ptr(&mut bytes, 8, target + 4usize);
        app.write(table, &bytes);

        snapshot_all_memory(&mut app.session, &mut app.driver).unwrap();
        let a = app.session.registry().allocation(table).unwrap();
        assert_eq!(a.snapshot.as_ref().unwrap().bytes, bytes);
        assert_eq!(a.indirect_offsets.offsets().collect::<Vec<_>>(), vec![8]);
        assert!(!app.session.is_nested());
    }

    #[test]
    fn virtual_reservation_mappings() {
        let mut app = App::new(Flags::default());
        let base = app
            .driver
            .virtual_mem_reserve(app.context, GpuPtr::null(), 0x4000)
            .unwrap();
        on_virtual_mem_reserve(&mut app.session, app.context, GpuPtr::null(), 0x4000, base).unwrap();
        let pm = PhysicalMemHandle::from_raw(0x77);
        on_physical_mem_create(&mut app.session, app.context, app.device, 0x2000, pm).unwrap();
        on_virtual_mem_map(&mut app.session, base + 0x1000usize, 0x1000, pm, 0, MemoryAccess::READ_WRITE).unwrap();
        on_virtual_mem_map(&mut app.session, base + 0x2000usize, 0x1000, pm, 0x1000, MemoryAccess::READ).unwrap();
        on_virtual_mem_unmap(&mut app.session, base + 0x1000usize, 0x1000).unwrap();

        let a = app.session.registry().allocation(base).unwrap();
        assert_eq!(a.device, Some(app.device));
        assert_eq!(a.virtual_mappings.len(), 1);
        assert_eq!(a.virtual_mappings[0].offset, 0x2000);

        assert!(on_virtual_mem_map(&mut app.session, GpuPtr::new_from_val(0x10), 1, pm, 0, MemoryAccess::READ)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn mapping_past_reservation_end_is_rejected() {
        let mut app = App::new(Flags::default());
        let base = app
            .driver
            .virtual_mem_reserve(app.context, GpuPtr::null(), 0x4000)
            .unwrap();
        on_virtual_mem_reserve(&mut app.session, app.context, GpuPtr::null(), 0x4000, base).unwrap();
        let pm = PhysicalMemHandle::from_raw(0x77);
        on_physical_mem_create(&mut app.session, app.context, app.device, 0x4000, pm).unwrap();

        let err = on_virtual_mem_map(&mut app.session, base + 0x3000usize, 0x2000, pm, 0, MemoryAccess::READ_WRITE)
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(app.session.registry().allocation(base).unwrap().virtual_mappings.is_empty());

        // A mapping that ends exactly at the end of the reservation is fine.
        on_virtual_mem_map(&mut app.session, base + 0x3000usize, 0x1000, pm, 0, MemoryAccess::READ_WRITE).unwrap();
        assert_eq!(app.session.registry().allocation(base).unwrap().virtual_mappings.len(), 1);
    }

    #[test]
    fn module_destroy_drops_symbols() {
        let mut app = App::new(Flags::default());
        let k = app.kernel("k");
        let module = app.session.registry().get::<KernelState>(k).unwrap().module;
        let (g, size) = app.driver.module_get_global_pointer(module, "g").unwrap();
        on_module_get_global_pointer(&mut app.session, module, "g", g, size).unwrap();
        on_module_get_global_pointer(&mut app.session, module, "g", g, size).unwrap();
        assert_eq!(app.session.registry().allocation_count(), 1);
        on_kernel_destroy(&mut app.session, k).unwrap();
        on_module_destroy(&mut app.session, module).unwrap();
        assert_eq!(app.session.registry().allocation_count(), 0);
    }
}
