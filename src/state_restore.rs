//! Rebuilds a recorded registry on a replay driver.
//!
//! Objects are recreated dependency first (drivers and devices, contexts,
//! lists, images, modules, physical memory, allocations, memory contents,
//! kernels, events, queues, fences, dispatches). Within a category they come
//! back in insertion order. Everything already marked restored is skipped, so
//! a second pass over the same session issues no creation calls.
//!
//! The registry stays keyed by capture time handles. Every object recreated
//! here gets a handle map entry and its restored flag set.

use crate::{
    driver::{Driver, DriverResult},
    error::{GcrError, GcrResult, RestoreFailReason},
    flags::RestoreMode,
    gpu_ptr::{GpuPtr, Void},
    handle_map::*,
    log::LogLevel::{LogDebug, LogError, LogInfo, LogWarn},
    memory_range::MemoryRange,
    session::Session,
    state::{
        allocation::{AllocationKind, IndirectOffsets, MemoryKind},
        descriptors::{CommandQueueDesc, DeviceMemDesc, HostMemDesc, QueueMode},
        kernel_info::{ArgClass, KernelExecutionInfo, KernelSettings},
        objects::*,
        ObjectCategory, ObjectState,
    },
    translator::translate_indirect_pointers,
};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap},
    iter::once,
};

/// Objects touched per category.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CategoryCounts(Vec<(ObjectCategory, usize)>);

impl CategoryCounts {
    fn add(&mut self, category: ObjectCategory) {
        match self.0.iter_mut().find(|(c, _)| *c == category) {
            Some((_, n)) => *n += 1,
            None => self.0.push((category, 1)),
        }
    }

    pub fn get(&self, category: ObjectCategory) -> usize {
        self.0
            .iter()
            .find(|(c, _)| *c == category)
            .map_or(0, |&(_, n)| n)
    }

    pub fn total(&self) -> usize {
        self.0.iter().map(|&(_, n)| n).sum()
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RestoreSummary {
    pub restored: CategoryCounts,
    pub bytes_uploaded: usize,
    pub upload_calls: usize,
    pub indirect_pointers_translated: usize,
    pub dispatches_reissued: usize,
}

/// Turns a failed driver call into a reconstruction failure naming the
/// object being rebuilt.
trait OrRestoreFailure<T> {
    fn or_restore_failure(self, category: ObjectCategory, id: u64, api: &'static str) -> GcrResult<T>;
}

impl<T> OrRestoreFailure<T> for DriverResult<T> {
    fn or_restore_failure(self, category: ObjectCategory, id: u64, api: &'static str) -> GcrResult<T> {
        self.map_err(|status| failure(category, id, api, RestoreFailReason::Status(status)))
    }
}

fn failure(category: ObjectCategory, id: u64, api: &'static str, reason: RestoreFailReason) -> GcrError {
    log!(
        LogError,
        "restore of {} {:#x} failed in {}: {}",
        category,
        id,
        api,
        reason
    );
    GcrError::ReconstructionFailure {
        category,
        id,
        api,
        reason,
    }
}

/// Recreate everything in `session` that is not restored yet.
pub fn restore_state<D: Driver>(session: &mut Session, driver: &mut D) -> GcrResult<RestoreSummary> {
    let mut r = StateRestorer::new(session, driver);
    r.restore_drivers_and_devices()?;
    r.restore_contexts()?;
    r.restore_command_lists()?;
    r.restore_images()?;
    r.restore_modules()?;
    r.restore_physical_memory()?;
    r.restore_allocations()?;
    r.upload_memory()?;
    r.restore_kernels()?;
    r.restore_events()?;
    r.restore_queues_and_fences()?;
    r.restore_dispatches()?;
    let summary = r.summary;
    log!(
        LogInfo,
        "restored {} objects, uploaded {:#x} bytes in {} calls, re-issued {} dispatches",
        summary.restored.total(),
        summary.bytes_uploaded,
        summary.upload_calls,
        summary.dispatches_reissued
    );
    Ok(summary)
}

struct StateRestorer<'a, D: Driver> {
    session: &'a mut Session,
    driver: &'a mut D,
    summary: RestoreSummary,
    /// Replay enumerations, fetched at most once per pass.
    replay_drivers: Option<Vec<DriverHandle>>,
    replay_devices: HashMap<DriverHandle, Vec<DeviceHandle>>,
    replay_sub_devices: HashMap<DeviceHandle, Vec<DeviceHandle>>,
    /// What this pass recreated, by capture time key, in creation order.
    new_lists: Vec<CommandListHandle>,
    new_kernels: Vec<KernelHandle>,
    new_allocations: Vec<GpuPtr<Void>>,
}

impl<'a, D: Driver> StateRestorer<'a, D> {
    fn new(session: &'a mut Session, driver: &'a mut D) -> Self {
        StateRestorer {
            session,
            driver,
            summary: RestoreSummary::default(),
            replay_drivers: None,
            replay_devices: HashMap::new(),
            replay_sub_devices: HashMap::new(),
            new_lists: Vec::new(),
            new_kernels: Vec::new(),
            new_allocations: Vec::new(),
        }
    }

    /// Unrestored objects of one category, oldest first.
    fn pending<S: ObjectState + Clone>(&self) -> Vec<(Handle<S::Kind>, S)> {
        self.session
            .registry
            .table::<S>()
            .ordered()
            .into_iter()
            .filter(|(_, s)| !s.restored())
            .map(|(h, s)| (h, s.clone()))
            .collect()
    }

    fn map<K: HandleKind>(&self, original: Handle<K>) -> GcrResult<Handle<K>> {
        self.session.maps.get_mapping(original)
    }

    fn mark<S: ObjectState>(&mut self, original: Handle<S::Kind>, replay: Handle<S::Kind>) -> GcrResult<()> {
        log!(LogDebug, "restored {} {} as {}", S::CATEGORY, original, replay);
        self.session.maps.add_mapping(original, replay);
        self.session.registry.get_mut::<S>(original)?.set_restored(true);
        self.summary.restored.add(S::CATEGORY);
        Ok(())
    }

    fn enumerate_drivers(&mut self, id: u64) -> GcrResult<Vec<DriverHandle>> {
        if let Some(v) = &self.replay_drivers {
            return Ok(v.clone());
        }
        let v = self
            .driver
            .driver_get()
            .or_restore_failure(ObjectCategory::Driver, id, "driver_get")?;
        self.replay_drivers = Some(v.clone());
        Ok(v)
    }

    fn enumerate_devices(&mut self, driver: DriverHandle, id: u64) -> GcrResult<Vec<DeviceHandle>> {
        if let Some(v) = self.replay_devices.get(&driver) {
            return Ok(v.clone());
        }
        let v = self
            .driver
            .device_get(driver)
            .or_restore_failure(ObjectCategory::Device, id, "device_get")?;
        self.replay_devices.insert(driver, v.clone());
        Ok(v)
    }

    fn enumerate_sub_devices(&mut self, device: DeviceHandle, id: u64) -> GcrResult<Vec<DeviceHandle>> {
        if let Some(v) = self.replay_sub_devices.get(&device) {
            return Ok(v.clone());
        }
        let v = self
            .driver
            .device_get_sub_devices(device)
            .or_restore_failure(ObjectCategory::Device, id, "device_get_sub_devices")?;
        self.replay_sub_devices.insert(device, v.clone());
        Ok(v)
    }

    /// Drivers and devices are found again by their enumeration ordinal.
    fn restore_drivers_and_devices(&mut self) -> GcrResult<()> {
        for (h, d) in self.pending::<DriverState>() {
            let drivers = self.enumerate_drivers(h.raw())?;
            let replay = pick(&drivers, d.ordinal, ObjectCategory::Driver, h.raw(), "driver_get")?;
            self.mark::<DriverState>(h, replay)?;
        }
        // Parents come first in insertion order, so they are mapped by the
        // time their sub-devices are looked up.
        for (h, d) in self.pending::<DeviceState>() {
            let (api, candidates) = match d.parent {
                None => {
                    let driver = self.map(d.driver)?;
                    ("device_get", self.enumerate_devices(driver, h.raw())?)
                }
                Some(parent) => {
                    let parent = self.map(parent)?;
                    (
                        "device_get_sub_devices",
                        self.enumerate_sub_devices(parent, h.raw())?,
                    )
                }
            };
            let replay = pick(&candidates, d.ordinal, ObjectCategory::Device, h.raw(), api)?;
            self.mark::<DeviceState>(h, replay)?;
        }
        Ok(())
    }

    fn restore_contexts(&mut self) -> GcrResult<()> {
        for (h, c) in self.pending::<ContextState>() {
            let driver = self.map(c.driver)?;
            let devices = self.session.maps.get_mappings(&c.devices)?;
            let replay = self
                .driver
                .context_create(driver, &devices, &c.desc)
                .or_restore_failure(ObjectCategory::Context, h.raw(), "context_create")?;
            self.mark::<ContextState>(h, replay)?;
        }
        Ok(())
    }

    fn restore_command_lists(&mut self) -> GcrResult<()> {
        for (h, l) in self.pending::<CommandListState>() {
            let context = self.map(l.context)?;
            let device = self.map(l.device)?;
            let replay = match &l.mode {
                CommandListMode::Deferred(desc) => self
                    .driver
                    .command_list_create(context, device, desc)
                    .or_restore_failure(ObjectCategory::CommandList, h.raw(), "command_list_create")?,
                CommandListMode::Immediate(desc) => self
                    .driver
                    .command_list_create_immediate(context, device, desc)
                    .or_restore_failure(
                        ObjectCategory::CommandList,
                        h.raw(),
                        "command_list_create_immediate",
                    )?,
            };
            self.mark::<CommandListState>(h, replay)?;
            self.new_lists.push(h);
        }
        Ok(())
    }

    /// Plain images first, then views once their source exists. A view can
    /// itself be the source of another view.
    fn restore_images(&mut self) -> GcrResult<()> {
        let mut remaining = self.pending::<ImageState>();
        while !remaining.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|(_, i)| match i.view_of {
                None => true,
                Some(source) => self.session.maps.get_mapping(source).is_ok(),
            });
            if ready.is_empty() {
                // Every remaining view hangs off a source that was never tracked.
                let source = blocked.iter().find_map(|(_, i)| i.view_of);
                return Err(GcrError::not_found(
                    ObjectCategory::Image.name(),
                    source.map_or(0, |s| s.raw()),
                ));
            }
            for (h, i) in ready {
                self.restore_image(h, &i)?;
            }
            remaining = blocked;
        }
        Ok(())
    }

    fn restore_image(&mut self, h: ImageHandle, i: &ImageState) -> GcrResult<()> {
        let context = self.map(i.context)?;
        let device = self.map(i.device)?;
        let replay = match i.view_of {
            None => self
                .driver
                .image_create(context, device, &i.desc)
                .or_restore_failure(ObjectCategory::Image, h.raw(), "image_create")?,
            Some(source) => {
                let source = self.map(source)?;
                self.driver
                    .image_view_create(context, device, &i.desc, source)
                    .or_restore_failure(ObjectCategory::Image, h.raw(), "image_view_create")?
            }
        };
        self.mark::<ImageState>(h, replay)
    }

    fn restore_modules(&mut self) -> GcrResult<()> {
        let pending = self.pending::<ModuleState>();
        for (h, m) in &pending {
            let context = self.map(m.context)?;
            let device = self.map(m.device)?;
            let replay = self
                .driver
                .module_create(context, device, &m.desc)
                .or_restore_failure(ObjectCategory::Module, h.raw(), "module_create")?;
            self.mark::<ModuleState>(*h, replay)?;
        }
        // Each link group is linked once, after all its members exist.
        let mut linked: BTreeSet<Vec<u64>> = BTreeSet::new();
        for (h, m) in &pending {
            if m.link_group.is_empty() {
                continue;
            }
            let mut members: Vec<ModuleHandle> = once(*h).chain(m.link_group.iter().copied()).collect();
            members.sort_unstable_by_key(|g| g.raw());
            members.dedup();
            if members.len() < 2 {
                continue;
            }
            if !linked.insert(members.iter().map(|g| g.raw()).collect()) {
                continue;
            }
            let group = self.session.maps.get_mappings(&members)?;
            self.driver
                .module_dynamic_link(&group)
                .or_restore_failure(ObjectCategory::Module, h.raw(), "module_dynamic_link")?;
        }
        Ok(())
    }

    fn restore_physical_memory(&mut self) -> GcrResult<()> {
        for (h, p) in self.pending::<PhysicalMemState>() {
            let context = self.map(p.context)?;
            let device = self.map(p.device)?;
            let replay = self
                .driver
                .physical_mem_create(context, device, p.size)
                .or_restore_failure(ObjectCategory::PhysicalMem, h.raw(), "physical_mem_create")?;
            self.mark::<PhysicalMemState>(h, replay)?;
        }
        Ok(())
    }

    /// Address space only. Contents follow in `upload_memory`, once every
    /// allocation has a replay address to translate pointers against.
    fn restore_allocations(&mut self) -> GcrResult<()> {
        let cat = ObjectCategory::Allocation;
        let pending: Vec<GpuPtr<Void>> = self
            .session
            .registry
            .allocations_ordered()
            .into_iter()
            .filter(|(_, a)| !a.restored)
            .map(|(base, _)| base)
            .collect();
        for base in pending {
            let a = self.session.registry.allocation(base)?.without_snapshot();
            let id = base.as_u64();
            let context = self.map(a.context)?;
            let device = a.device.map(|d| self.map(d)).transpose()?;
            let replay = match &a.kind {
                AllocationKind::Pointer {
                    device_desc,
                    host_desc,
                } => {
                    let ddesc = device_desc.clone().unwrap_or_else(DeviceMemDesc::default);
                    let hdesc = host_desc.clone().unwrap_or_else(HostMemDesc::default);
                    match a.memory_kind {
                        MemoryKind::Device => {
                            let device = device.ok_or_else(|| {
                                GcrError::not_found(ObjectCategory::Device.name(), id)
                            })?;
                            self.driver
                                .mem_alloc_device(context, &ddesc, a.size, a.alignment, device)
                                .or_restore_failure(cat, id, "mem_alloc_device")?
                        }
                        MemoryKind::Host => self
                            .driver
                            .mem_alloc_host(context, &hdesc, a.size, a.alignment)
                            .or_restore_failure(cat, id, "mem_alloc_host")?,
                        MemoryKind::Shared => self
                            .driver
                            .mem_alloc_shared(context, &ddesc, &hdesc, a.size, a.alignment, device)
                            .or_restore_failure(cat, id, "mem_alloc_shared")?,
                    }
                }
                AllocationKind::GlobalSymbol { module, name } => {
                    let module = self.map(*module)?;
                    let (ptr, size) = self
                        .driver
                        .module_get_global_pointer(module, name)
                        .or_restore_failure(cat, id, "module_get_global_pointer")?;
                    if size < a.size {
                        log!(
                            LogWarn,
                            "global {} shrank from {:#x} to {:#x} bytes",
                            name,
                            a.size,
                            size
                        );
                    }
                    ptr
                }
                AllocationKind::FunctionPointer { module, name } => {
                    let module = self.map(*module)?;
                    self.driver
                        .module_get_function_pointer(module, name)
                        .or_restore_failure(cat, id, "module_get_function_pointer")?
                }
                AllocationKind::VirtualReservation { start_hint } => {
                    let ptr = self
                        .driver
                        .virtual_mem_reserve(context, *start_hint, a.size)
                        .or_restore_failure(cat, id, "virtual_mem_reserve")?;
                    for m in &a.virtual_mappings {
                        let mem = self.map(m.physical_mem)?;
                        self.driver
                            .virtual_mem_map(context, ptr + m.offset, m.size, mem, m.physical_offset, m.access)
                            .or_restore_failure(cat, id, "virtual_mem_map")?;
                    }
                    ptr
                }
            };
            log!(LogDebug, "restored {} allocation {} as {}", a.memory_kind, base, replay);
            self.session.maps.add_ptr_mapping(base, replay);
            if let Some(r) = &a.residency {
                let context = self.map(r.context)?;
                let device = self.map(r.device)?;
                self.driver
                    .make_memory_resident(context, device, replay + r.offset, r.size)
                    .or_restore_failure(cat, id, "make_memory_resident")?;
            }
            self.session.registry.allocation_mut(base)?.restored = true;
            self.summary.restored.add(cat);
            self.new_allocations.push(base);
        }
        Ok(())
    }

    /// Write the snapshotted contents of every allocation recreated in this
    /// pass, with embedded pointers translated to replay addresses. Device
    /// memory goes through one immediate list per (context, device).
    fn upload_memory(&mut self) -> GcrResult<()> {
        let cat = ObjectCategory::Allocation;
        let max_chunk = self.session.flags.max_upload_chunk.max(1);
        let mut upload_lists: HashMap<(ContextHandle, DeviceHandle), CommandListHandle> = HashMap::new();
        let new_allocations = self.new_allocations.clone();
        for base in new_allocations {
            let id = base.as_u64();
            let a = self.session.registry.allocation(base)?;
            let mut offsets: IndirectOffsets = a.indirect_offsets.clone();
            offsets.reset_translated();
            let replay = self.session.maps.get_ptr_mapping(base)?;
            let snapshot = match &a.snapshot {
                Some(s) if !s.bytes.is_empty() => s,
                _ => {
                    if !offsets.is_empty() {
                        self.session.indirect_tables.insert(replay, offsets);
                    }
                    continue;
                }
            };
            if self.session.flags.checksum {
                if let Err(actual) = snapshot.verify() {
                    return Err(failure(
                        cat,
                        id,
                        "upload",
                        RestoreFailReason::ChecksumMismatch {
                            expected: snapshot.crc32,
                            actual,
                        },
                    ));
                }
            }
            let mut bytes = snapshot.bytes.clone();
            let memory_kind = a.memory_kind;
            let context = a.context;
            let device = a.device;
            // Reservations only have contents where physical memory is mapped.
            let segments: Vec<(usize, usize)> = if a.is_virtual_reservation() {
                a.virtual_mappings.iter().map(|m| (m.offset, m.size)).collect()
            } else {
                vec![(0, bytes.len())]
            };

            let translated = translate_indirect_pointers(
                &self.session.registry,
                &self.session.maps,
                &mut bytes,
                &mut offsets,
            );
            self.summary.indirect_pointers_translated += translated;

            for (offset, len) in segments {
                let len = len.min(bytes.len().saturating_sub(offset));
                if len == 0 {
                    continue;
                }
                match memory_kind {
                    MemoryKind::Host | MemoryKind::Shared => {
                        self.driver
                            .write_host_memory(replay + offset, &bytes[offset..offset + len])
                            .or_restore_failure(cat, id, "write_host_memory")?;
                        self.summary.upload_calls += 1;
                    }
                    MemoryKind::Device => {
                        let device = device
                            .ok_or_else(|| GcrError::not_found(ObjectCategory::Device.name(), id))?;
                        let key = (self.map(context)?, self.map(device)?);
                        let list = match upload_lists.get(&key) {
                            Some(&l) => l,
                            None => {
                                let desc = CommandQueueDesc {
                                    mode: QueueMode::Synchronous,
                                    ..Default::default()
                                };
                                let l = self
                                    .driver
                                    .command_list_create_immediate(key.0, key.1, &desc)
                                    .or_restore_failure(cat, id, "command_list_create_immediate")?;
                                upload_lists.insert(key, l);
                                l
                            }
                        };
                        let segment = MemoryRange::new_range(replay + offset, len);
                        for chunk in segment.chunks(max_chunk) {
                            let start = (chunk.start().as_u64() - replay.as_u64()) as usize;
                            self.driver
                                .append_memory_copy(list, chunk.start(), &bytes[start..start + chunk.size()], None, &[])
                                .or_restore_failure(cat, id, "append_memory_copy")?;
                            self.driver
                                .command_list_host_synchronize(list)
                                .or_restore_failure(cat, id, "command_list_host_synchronize")?;
                            self.summary.upload_calls += 1;
                        }
                    }
                }
                self.summary.bytes_uploaded += len;
            }
            if !offsets.is_empty() {
                self.session.indirect_tables.insert(replay, offsets);
            }
        }
        for (_, list) in upload_lists {
            self.driver
                .command_list_destroy(list)
                .or_restore_failure(ObjectCategory::CommandList, list.raw(), "command_list_destroy")?;
        }
        Ok(())
    }

    fn restore_kernels(&mut self) -> GcrResult<()> {
        for (h, k) in self.pending::<KernelState>() {
            let module = self.map(k.module)?;
            let replay = self
                .driver
                .kernel_create(module, &k.desc)
                .or_restore_failure(ObjectCategory::Kernel, h.raw(), "kernel_create")?;
            self.mark::<KernelState>(h, replay)?;
            self.new_kernels.push(h);
        }
        Ok(())
    }

    fn restore_events(&mut self) -> GcrResult<()> {
        for (h, p) in self.pending::<EventPoolState>() {
            let context = self.map(p.context)?;
            let devices = self.session.maps.get_mappings(&p.devices)?;
            let replay = self
                .driver
                .event_pool_create(context, &devices, &p.desc)
                .or_restore_failure(ObjectCategory::EventPool, h.raw(), "event_pool_create")?;
            self.mark::<EventPoolState>(h, replay)?;
        }
        let resignal = self.session.flags.restore_mode == RestoreMode::Full;
        for (h, e) in self.pending::<EventState>() {
            let pool = self.map(e.pool)?;
            let replay = self
                .driver
                .event_create(pool, &e.desc)
                .or_restore_failure(ObjectCategory::Event, h.raw(), "event_create")?;
            if e.signaled && resignal {
                self.driver
                    .event_host_signal(replay)
                    .or_restore_failure(ObjectCategory::Event, h.raw(), "event_host_signal")?;
            }
            self.mark::<EventState>(h, replay)?;
        }
        Ok(())
    }

    fn restore_queues_and_fences(&mut self) -> GcrResult<()> {
        for (h, q) in self.pending::<CommandQueueState>() {
            let context = self.map(q.context)?;
            let device = self.map(q.device)?;
            let replay = self
                .driver
                .command_queue_create(context, device, &q.desc)
                .or_restore_failure(ObjectCategory::CommandQueue, h.raw(), "command_queue_create")?;
            self.mark::<CommandQueueState>(h, replay)?;
        }
        for (h, f) in self.pending::<FenceState>() {
            let queue = self.map(f.queue)?;
            let replay = self
                .driver
                .fence_create(queue, &f.desc)
                .or_restore_failure(ObjectCategory::Fence, h.raw(), "fence_create")?;
            self.mark::<FenceState>(h, replay)?;
        }
        Ok(())
    }

    /// Re-issue the recorded dispatches inside the resumption window, close
    /// what was closed, then leave every new kernel with its last settings.
    fn restore_dispatches(&mut self) -> GcrResult<()> {
        let new_lists = self.new_lists.clone();
        if let Some(range) = self.session.flags.kernel_range {
            for &list in &new_lists {
                let history: Vec<KernelExecutionInfo> = self
                    .session
                    .registry
                    .get::<CommandListState>(list)?
                    .kernel_history
                    .iter()
                    .filter(|k| range.contains(k.kernel_number))
                    .cloned()
                    .collect();
                let replay_list = self.map(list)?;
                for info in history {
                    let kernel = self.map(info.kernel)?;
                    self.apply_settings(info.kernel, kernel, &info.settings)?;
                    let signal = self.session.maps.get_mapping_opt(info.signal_event)?;
                    let waits = self.session.maps.get_mappings(&info.wait_events)?;
                    log!(
                        LogDebug,
                        "re-issuing kernel #{} ({}) on {}",
                        info.kernel_number,
                        info.kernel_name,
                        replay_list
                    );
                    self.driver
                        .append_launch_kernel(replay_list, kernel, info.group_count, signal, &waits)
                        .or_restore_failure(ObjectCategory::CommandList, list.raw(), "append_launch_kernel")?;
                    self.summary.dispatches_reissued += 1;
                }
            }
        }
        for &list in &new_lists {
            let l = self.session.registry.get::<CommandListState>(list)?;
            if l.closed && !l.is_immediate() {
                let replay = self.map(list)?;
                self.driver
                    .command_list_close(replay)
                    .or_restore_failure(ObjectCategory::CommandList, list.raw(), "command_list_close")?;
            }
        }
        for k in self.new_kernels.clone() {
            let settings = self.session.registry.get::<KernelState>(k)?.settings.clone();
            let replay = self.map(k)?;
            self.apply_settings(k, replay, &settings)?;
        }
        Ok(())
    }

    fn apply_settings(
        &mut self,
        original: KernelHandle,
        kernel: KernelHandle,
        settings: &KernelSettings,
    ) -> GcrResult<()> {
        let cat = ObjectCategory::Kernel;
        let id = original.raw();
        if let Some(size) = settings.group_size {
            self.driver
                .kernel_set_group_size(kernel, size)
                .or_restore_failure(cat, id, "kernel_set_group_size")?;
        }
        if let Some(offset) = settings.global_offset {
            self.driver
                .kernel_set_global_offset(kernel, offset)
                .or_restore_failure(cat, id, "kernel_set_global_offset")?;
        }
        if let Some(flags) = settings.indirect_access {
            self.driver
                .kernel_set_indirect_access(kernel, flags)
                .or_restore_failure(cat, id, "kernel_set_indirect_access")?;
        }
        if let Some(hint) = settings.scheduling_hint {
            self.driver
                .kernel_set_scheduling_hint(kernel, hint)
                .or_restore_failure(cat, id, "kernel_set_scheduling_hint")?;
        }
        for (&index, arg) in &settings.args {
            let r = match &arg.class {
                ArgClass::Value => {
                    self.driver
                        .kernel_set_argument_value(kernel, index, arg.bytes.len(), Some(&arg.bytes))
                }
                ArgClass::Buffer {
                    allocation, offset, ..
                } => match self.session.maps.get_ptr_mapping(*allocation) {
                    Ok(base) => {
                        let value = (base + *offset).as_u64().to_le_bytes();
                        self.driver
                            .kernel_set_argument_value(kernel, index, value.len(), Some(&value))
                    }
                    Err(_) => {
                        // Freed after the kernel last used it.
                        log!(
                            LogWarn,
                            "argument {} of kernel {} points into released allocation {}",
                            index,
                            original,
                            allocation
                        );
                        self.driver
                            .kernel_set_argument_value(kernel, index, arg.bytes.len(), Some(&arg.bytes))
                    }
                },
                ArgClass::Image(image) => match self.session.maps.get_mapping(*image) {
                    Ok(replay) => {
                        let value = replay.raw().to_le_bytes();
                        self.driver
                            .kernel_set_argument_value(kernel, index, value.len(), Some(&value))
                    }
                    Err(_) => {
                        log!(
                            LogWarn,
                            "argument {} of kernel {} names released image {}",
                            index,
                            original,
                            image
                        );
                        self.driver
                            .kernel_set_argument_value(kernel, index, arg.bytes.len(), Some(&arg.bytes))
                    }
                },
                ArgClass::LocalMemory(size) => self.driver.kernel_set_argument_value(kernel, index, *size, None),
            };
            r.or_restore_failure(cat, id, "kernel_set_argument_value")?;
        }
        Ok(())
    }
}

fn pick<K>(
    candidates: &[Handle<K>],
    ordinal: u32,
    category: ObjectCategory,
    id: u64,
    api: &'static str,
) -> GcrResult<Handle<K>> {
    candidates.get(ordinal as usize).copied().ok_or_else(|| {
        failure(
            category,
            id,
            api,
            RestoreFailReason::MissingDevice {
                ordinal,
                available: candidates.len(),
            },
        )
    })
}

/// Destroy restored objects of one category, newest first.
fn destroy_restored<S, D, F>(
    session: &mut Session,
    driver: &mut D,
    counts: &mut CategoryCounts,
    api: &'static str,
    destroy: F,
) -> GcrResult<()>
where
    S: ObjectState,
    D: Driver,
    F: Fn(&mut D, Handle<S::Kind>) -> DriverResult<()>,
{
    let restored: Vec<Handle<S::Kind>> = session
        .registry
        .table::<S>()
        .ordered()
        .into_iter()
        .rev()
        .filter(|(_, s)| s.restored())
        .map(|(h, _)| h)
        .collect();
    for h in restored {
        let replay = session.maps.get_mapping(h)?;
        destroy(driver, replay).or_restore_failure(S::CATEGORY, h.raw(), api)?;
        session.maps.remove_mapping(h);
        session.registry.get_mut::<S>(h)?.set_restored(false);
        counts.add(S::CATEGORY);
    }
    Ok(())
}

/// Destroy everything `restore_state` created, children before parents, and
/// mark it unrestored. Drivers and devices are enumerated, not created, so
/// they keep their mappings.
pub fn teardown<D: Driver>(session: &mut Session, driver: &mut D) -> GcrResult<CategoryCounts> {
    let mut counts = CategoryCounts::default();
    destroy_restored::<EventState, D, _>(session, driver, &mut counts, "event_destroy", |d, h| {
        d.event_destroy(h)
    })?;
    destroy_restored::<EventPoolState, D, _>(session, driver, &mut counts, "event_pool_destroy", |d, h| {
        d.event_pool_destroy(h)
    })?;
    destroy_restored::<FenceState, D, _>(session, driver, &mut counts, "fence_destroy", |d, h| {
        d.fence_destroy(h)
    })?;
    destroy_restored::<CommandQueueState, D, _>(session, driver, &mut counts, "command_queue_destroy", |d, h| {
        d.command_queue_destroy(h)
    })?;
    destroy_restored::<CommandListState, D, _>(session, driver, &mut counts, "command_list_destroy", |d, h| {
        d.command_list_destroy(h)
    })?;
    destroy_restored::<KernelState, D, _>(session, driver, &mut counts, "kernel_destroy", |d, h| {
        d.kernel_destroy(h)
    })?;
    free_allocations(session, driver, &mut counts)?;

    let mems: Vec<(PhysicalMemHandle, ContextHandle)> = session
        .registry
        .table::<PhysicalMemState>()
        .ordered()
        .into_iter()
        .rev()
        .filter(|(_, p)| p.restored)
        .map(|(h, p)| (h, p.context))
        .collect();
    for (h, context) in mems {
        let replay = session.maps.get_mapping(h)?;
        let context = session.maps.get_mapping(context)?;
        driver
            .physical_mem_destroy(context, replay)
            .or_restore_failure(ObjectCategory::PhysicalMem, h.raw(), "physical_mem_destroy")?;
        session.maps.remove_mapping(h);
        session.registry.get_mut::<PhysicalMemState>(h)?.restored = false;
        counts.add(ObjectCategory::PhysicalMem);
    }

    destroy_restored::<ImageState, D, _>(session, driver, &mut counts, "image_destroy", |d, h| {
        d.image_destroy(h)
    })?;
    destroy_restored::<ModuleState, D, _>(session, driver, &mut counts, "module_destroy", |d, h| {
        d.module_destroy(h)
    })?;
    destroy_restored::<ContextState, D, _>(session, driver, &mut counts, "context_destroy", |d, h| {
        d.context_destroy(h)
    })?;
    session.indirect_tables.clear();
    log!(LogInfo, "tore down {} objects", counts.total());
    Ok(counts)
}

fn free_allocations<D: Driver>(session: &mut Session, driver: &mut D, counts: &mut CategoryCounts) -> GcrResult<()> {
    let cat = ObjectCategory::Allocation;
    let mut restored: Vec<(u64, GpuPtr<Void>)> = session
        .registry
        .allocations_ordered()
        .into_iter()
        .filter(|(_, a)| a.restored)
        .map(|(base, a)| (a.id, base))
        .collect();
    restored.sort_unstable_by(|a, b| b.cmp(a));
    for (_, base) in restored {
        let a = session.registry.allocation(base)?.without_snapshot();
        let id = base.as_u64();
        let replay = session.maps.get_ptr_mapping(base)?;
        let context = session.maps.get_mapping(a.context)?;
        match &a.kind {
            AllocationKind::Pointer { .. } => {
                driver.mem_free(context, replay).or_restore_failure(cat, id, "mem_free")?;
            }
            AllocationKind::VirtualReservation { .. } => {
                for m in a.virtual_mappings.iter().rev() {
                    driver
                        .virtual_mem_unmap(context, replay + m.offset, m.size)
                        .or_restore_failure(cat, id, "virtual_mem_unmap")?;
                }
                driver
                    .virtual_mem_free(context, replay, a.size)
                    .or_restore_failure(cat, id, "virtual_mem_free")?;
            }
            // Owned by their module.
            AllocationKind::GlobalSymbol { .. } | AllocationKind::FunctionPointer { .. } => (),
        }
        session.maps.remove_ptr_mapping(base);
        session.registry.allocation_mut(base)?.restored = false;
        counts.add(cat);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capture::{self, tests::App},
        driver::{recording_driver::RecordingDriver, DriverStatus},
        flags::{Flags, KernelRange},
        snapshot::CapturedState,
        state::descriptors::{EventDesc, EventPoolDesc, ImageDesc, ImageType, MemoryAccess, ModuleDesc, ModuleFormat},
    };

    const REPLAY_HANDLES: u64 = 0x5500_0000;
    const REPLAY_ADDRESSES: u64 = 0xaa00_0000_0000;

    fn replay_driver() -> RecordingDriver {
        RecordingDriver::with_topology_at(1, 1, 0, REPLAY_HANDLES, REPLAY_ADDRESSES)
    }

    /// Serialize and reload, as a separate replay process would.
    fn reload(app: &App) -> CapturedState {
        let mut buf = Vec::new();
        app.session.captured_state().to_writer(&mut buf).unwrap();
        CapturedState::from_reader(&buf[..]).unwrap()
    }

    fn position(driver: &RecordingDriver, api: &str) -> usize {
        driver.calls().iter().position(|c| c.api == api).unwrap()
    }

    fn last_position(driver: &RecordingDriver, api: &str) -> usize {
        driver.calls().iter().rposition(|c| c.api == api).unwrap()
    }

    fn module(app: &mut App) -> ModuleHandle {
        let desc = ModuleDesc {
            format: ModuleFormat::IntermediateLanguage,
            input: vec![0x07, 0x23, 0x02, 0x03],
            build_flags: String::new(),
            spec_constants: Vec::new(),
        };
        let m = app.driver.module_create(app.context, app.device, &desc).unwrap();
        capture::on_module_create(&mut app.session, app.context, app.device, &desc, m).unwrap();
        m
    }

    fn image_state(app: &App, view_of: Option<ImageHandle>) -> ImageState {
        ImageState {
            context: app.context,
            device: app.device,
            desc: ImageDesc {
                image_type: ImageType::Image2D,
                width: 64,
                height: 64,
                depth: 1,
                ..Default::default()
            },
            view_of,
            restored: true,
        }
    }

    #[test]
    fn restores_dispatch_with_translated_pointers() {
        let mut app = App::new(Flags::default());
        let buf = app.alloc_device(4096);
        let table = app.alloc_host(256);
        app.write(buf, &table.as_u64().to_le_bytes());
        capture::add_indirect_pointer_offsets(&mut app.session, buf, &[0]).unwrap();
        let list = app.list();
        let k = app.kernel("consume");
        app.set_ptr_arg(k, 0, buf + 64);
        assert_eq!(app.launch(list, k, None, &[]), 1);
        capture::snapshot_all_memory(&mut app.session, &mut app.driver).unwrap();

        let flags = Flags {
            kernel_range: Some(KernelRange { first: 1, last: 1 }),
            ..Flags::default()
        };
        let mut session = Session::from_captured(flags, reload(&app));
        let mut driver = replay_driver();
        let summary = restore_state(&mut session, &mut driver).unwrap();

        let replay_buf = session.maps().get_ptr_mapping(buf).unwrap();
        let replay_table = session.maps().get_ptr_mapping(table).unwrap();
        assert_ne!(replay_buf, buf);
        assert!(position(&driver, "mem_alloc_device") < position(&driver, "mem_alloc_host"));
        assert_eq!(
            driver.memory_at(replay_buf, 8).unwrap(),
            &replay_table.as_u64().to_le_bytes()[..]
        );
        assert_eq!(summary.indirect_pointers_translated, 1);
        assert!(session.indirect_table(replay_buf).unwrap().is_translated(0));

        let replay_k = session.maps().get_mapping(k).unwrap();
        let expected = format!("{}, 0, 8, {:#x}", replay_k, (replay_buf + 64).as_u64());
        assert!(driver
            .calls_to("kernel_set_argument_value")
            .iter()
            .any(|c| c.args == expected));
        assert!(last_position(&driver, "append_memory_copy") < position(&driver, "append_launch_kernel"));
        assert_eq!(summary.dispatches_reissued, 1);
        assert_eq!(summary.restored.get(ObjectCategory::Allocation), 2);
    }

    #[test]
    fn second_pass_creates_nothing() {
        let mut app = App::new(Flags::default());
        app.alloc_device(64);
        app.events(2);
        app.kernel("k");
        let mut session = Session::from_captured(Flags::default(), reload(&app));
        let mut driver = replay_driver();
        restore_state(&mut session, &mut driver).unwrap();
        driver.clear_calls();

        let summary = restore_state(&mut session, &mut driver).unwrap();
        assert_eq!(summary.restored.total(), 0);
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn allocations_come_back_in_insertion_order() {
        let mut app = App::new(Flags::default());
        let ctx = app.context;
        let desc = HostMemDesc::default();
        // Inserted high address first.
        capture::on_mem_alloc_host(&mut app.session, ctx, &desc, 0x20, 8, GpuPtr::new_from_val(0x9000_0000)).unwrap();
        capture::on_mem_alloc_host(&mut app.session, ctx, &desc, 0x10, 8, GpuPtr::new_from_val(0x1000_0000)).unwrap();
        let mut session = Session::from_captured(Flags::default(), reload(&app));
        let mut driver = replay_driver();
        restore_state(&mut session, &mut driver).unwrap();

        let sizes: Vec<&str> = driver
            .calls_to("mem_alloc_host")
            .iter()
            .map(|c| c.args.as_str())
            .collect();
        assert_eq!(sizes.len(), 2);
        assert!(sizes[0].contains("0x20"));
        assert!(sizes[1].contains("0x10"));
    }

    #[test]
    fn missing_device_ordinal() {
        let mut app = App::new(Flags::default());
        let drivers = app.driver.driver_get().unwrap();
        let extra = Handle::from_raw(0x1234);
        let devices = vec![app.device, extra];
        capture::on_device_get(&mut app.session, drivers[0], &devices).unwrap();
        let mut session = Session::from_captured(Flags::default(), reload(&app));
        let mut driver = replay_driver();

        match restore_state(&mut session, &mut driver) {
            Err(GcrError::ReconstructionFailure {
                category: ObjectCategory::Device,
                id,
                reason: RestoreFailReason::MissingDevice { ordinal: 1, available: 1 },
                ..
            }) => assert_eq!(id, 0x1234),
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn driver_failure_names_the_object() {
        let mut app = App::new(Flags::default());
        app.events(1);
        let mut session = Session::from_captured(Flags::default(), reload(&app));
        let mut driver = replay_driver();
        driver.fail_api("event_pool_create", DriverStatus::ERROR_OUT_OF_HOST_MEMORY);

        let err = restore_state(&mut session, &mut driver).unwrap_err();
        match err {
            GcrError::ReconstructionFailure {
                category: ObjectCategory::EventPool,
                api: "event_pool_create",
                reason: RestoreFailReason::Status(s),
                ..
            } => assert_eq!(s, DriverStatus::ERROR_OUT_OF_HOST_MEMORY),
            e => panic!("unexpected {}", e),
        }
        // Whatever got recreated before the failure stays restored.
        assert!(session.registry().table::<ContextState>().ordered()[0].1.restored);
    }

    #[test]
    fn corrupt_snapshot_fails_checksum() {
        let mut app = App::new(Flags::default());
        let p = app.alloc_host(32);
        app.write(p, &[7; 32]);
        capture::snapshot_all_memory(&mut app.session, &mut app.driver).unwrap();
        let mut captured = reload(&app);
        captured.allocations[0].state.snapshot.as_mut().unwrap().bytes[3] = 0;

        let mut lenient = Session::from_captured(Flags::default(), captured.clone());
        assert!(restore_state(&mut lenient, &mut replay_driver()).is_ok());

        let flags = Flags {
            checksum: true,
            ..Flags::default()
        };
        let mut strict = Session::from_captured(flags, captured);
        let err = restore_state(&mut strict, &mut replay_driver()).unwrap_err();
        assert!(err.is_reconstruction_failure());
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn device_upload_is_chunked() {
        let mut app = App::new(Flags::default());
        let p = app.alloc_device(4096);
        app.write(p, &[0x5a; 4096]);
        capture::snapshot_all_memory(&mut app.session, &mut app.driver).unwrap();
        let flags = Flags {
            max_upload_chunk: 1024,
            ..Flags::default()
        };
        let mut session = Session::from_captured(flags, reload(&app));
        let mut driver = replay_driver();
        let summary = restore_state(&mut session, &mut driver).unwrap();

        assert_eq!(driver.calls_to("append_memory_copy").len(), 4);
        assert_eq!(summary.upload_calls, 4);
        assert_eq!(summary.bytes_uploaded, 4096);
        let replay = session.maps().get_ptr_mapping(p).unwrap();
        assert_eq!(driver.memory_at(replay, 4096).unwrap(), &[0x5a; 4096][..]);
        // The upload list is gone again.
        assert_eq!(driver.calls_to("command_list_destroy").len(), 1);
    }

    #[test]
    fn per_kernel_mode_leaves_events_unsignaled() {
        let mut app = App::new(Flags::default());
        let e = app.events(1)[0];
        capture::on_event_status(&mut app.session, e, true).unwrap();
        let captured = reload(&app);

        let mut full = Session::from_captured(Flags::default(), captured.clone());
        let mut driver = replay_driver();
        restore_state(&mut full, &mut driver).unwrap();
        assert!(driver.is_signaled(full.maps().get_mapping(e).unwrap()));

        let flags = Flags {
            restore_mode: RestoreMode::PerKernel,
            ..Flags::default()
        };
        let mut per_kernel = Session::from_captured(flags, captured);
        let mut driver = replay_driver();
        restore_state(&mut per_kernel, &mut driver).unwrap();
        assert!(driver.calls_to("event_host_signal").is_empty());
    }

    #[test]
    fn dispatches_outside_window_are_not_reissued() {
        let mut app = App::new(Flags::default());
        let list = app.list();
        let k = app.kernel("k");
        let evs = app.events(2);
        app.launch(list, k, Some(evs[0]), &[]);
        app.launch(list, k, Some(evs[1]), &[evs[0]]);
        capture::on_command_list_close(&mut app.session, list).unwrap();

        let flags = Flags {
            kernel_range: Some(KernelRange { first: 2, last: 5 }),
            ..Flags::default()
        };
        let mut session = Session::from_captured(flags, reload(&app));
        let mut driver = replay_driver();
        restore_state(&mut session, &mut driver).unwrap();

        let launches = driver.calls_to("append_launch_kernel");
        assert_eq!(launches.len(), 1);
        let wait = session.maps().get_mapping(evs[0]).unwrap();
        assert!(launches[0].args.contains(&format!("[{}]", wait)));
        assert!(position(&driver, "append_launch_kernel") < position(&driver, "command_list_close"));
    }

    #[test]
    fn reservation_is_reserved_then_mapped() {
        let mut app = App::new(Flags::default());
        let (ctx, dev) = (app.context, app.device);
        let mem = app.driver.physical_mem_create(ctx, dev, 0x10000).unwrap();
        capture::on_physical_mem_create(&mut app.session, ctx, dev, 0x10000, mem).unwrap();
        let va = app.driver.virtual_mem_reserve(ctx, GpuPtr::null(), 0x20000).unwrap();
        capture::on_virtual_mem_reserve(&mut app.session, ctx, GpuPtr::null(), 0x20000, va).unwrap();
        app.driver
            .virtual_mem_map(ctx, va + 0x10000, 0x10000, mem, 0, MemoryAccess::READ_WRITE)
            .unwrap();
        capture::on_virtual_mem_map(&mut app.session, va + 0x10000, 0x10000, mem, 0, MemoryAccess::READ_WRITE)
            .unwrap();

        let mut session = Session::from_captured(Flags::default(), reload(&app));
        let mut driver = replay_driver();
        restore_state(&mut session, &mut driver).unwrap();

        let create = position(&driver, "physical_mem_create");
        let reserve = position(&driver, "virtual_mem_reserve");
        let map = position(&driver, "virtual_mem_map");
        assert!(create < reserve && reserve < map);
        let replay_va = session.maps().get_ptr_mapping(va).unwrap();
        assert!(driver.calls()[map]
            .args
            .contains(&(replay_va + 0x10000).to_string()));
    }

    #[test]
    fn teardown_destroys_children_first() {
        let mut app = App::new(Flags::default());
        app.alloc_device(64);
        app.list();
        app.kernel("k");
        let desc = EventPoolDesc { flags: 0, count: 1 };
        let pool = app.driver.event_pool_create(app.context, &[app.device], &desc).unwrap();
        capture::on_event_pool_create(&mut app.session, app.context, &[app.device], &desc, pool).unwrap();
        let e = app.driver.event_create(pool, &EventDesc::default()).unwrap();
        capture::on_event_create(&mut app.session, pool, &EventDesc::default(), e).unwrap();

        let mut session = Session::from_captured(Flags::default(), reload(&app));
        let mut driver = replay_driver();
        restore_state(&mut session, &mut driver).unwrap();
        driver.clear_calls();

        let counts = teardown(&mut session, &mut driver).unwrap();
        let order = [
            "event_destroy",
            "event_pool_destroy",
            "command_list_destroy",
            "kernel_destroy",
            "mem_free",
            "module_destroy",
            "context_destroy",
        ];
        for pair in order.windows(2) {
            assert!(position(&driver, pair[0]) < position(&driver, pair[1]), "{:?}", pair);
        }
        assert_eq!(counts.get(ObjectCategory::Allocation), 1);
        assert!(session.maps().table::<kind::Context>().is_empty());
        assert!(session.maps().table::<kind::Usm>().is_empty());

        // Everything can be rebuilt after a teardown.
        let summary = restore_state(&mut session, &mut driver).unwrap();
        assert_eq!(summary.restored.get(ObjectCategory::Context), 1);
        assert_eq!(summary.restored.get(ObjectCategory::Driver), 0);
    }

    #[test]
    fn link_group_is_linked_once_with_every_member() {
        let mut app = App::new(Flags::default());
        let ma = module(&mut app);
        let mb = module(&mut app);
        app.driver.module_dynamic_link(&[ma, mb]).unwrap();
        capture::on_module_dynamic_link(&mut app.session, &[ma, mb]).unwrap();

        let mut session = Session::from_captured(Flags::default(), reload(&app));
        let mut driver = replay_driver();
        restore_state(&mut session, &mut driver).unwrap();

        let links = driver.calls_to("module_dynamic_link");
        assert_eq!(links.len(), 1);
        let ra = session.maps().get_mapping(ma).unwrap();
        let rb = session.maps().get_mapping(mb).unwrap();
        assert_eq!(links[0].args, format!("[{}, {}]", ra, rb));
        assert!(last_position(&driver, "module_create") < position(&driver, "module_dynamic_link"));
    }

    #[test]
    fn destroyed_module_leaves_its_link_group() {
        let mut app = App::new(Flags::default());
        let ma = module(&mut app);
        let mb = module(&mut app);
        let mc = module(&mut app);
        capture::on_module_dynamic_link(&mut app.session, &[ma, mb, mc]).unwrap();
        capture::on_module_destroy(&mut app.session, mc).unwrap();

        let mut session = Session::from_captured(Flags::default(), reload(&app));
        let mut driver = replay_driver();
        restore_state(&mut session, &mut driver).unwrap();

        let links = driver.calls_to("module_dynamic_link");
        assert_eq!(links.len(), 1);
        let ra = session.maps().get_mapping(ma).unwrap();
        let rb = session.maps().get_mapping(mb).unwrap();
        assert_eq!(links[0].args, format!("[{}, {}]", ra, rb));
    }

    #[test]
    fn residency_is_requested_after_creation() {
        let mut app = App::new(Flags::default());
        let (ctx, dev) = (app.context, app.device);
        let p = app.alloc_device(0x1000);
        app.driver.make_memory_resident(ctx, dev, p + 0x100, 0x200).unwrap();
        capture::on_make_memory_resident(&mut app.session, ctx, dev, p + 0x100, 0x200).unwrap();

        let mut session = Session::from_captured(Flags::default(), reload(&app));
        let mut driver = replay_driver();
        restore_state(&mut session, &mut driver).unwrap();

        let alloc = position(&driver, "mem_alloc_device");
        let resident = position(&driver, "make_memory_resident");
        assert!(alloc < resident);
        let expected = format!(
            "{}, {}, {}, {:#x}",
            session.maps().get_mapping(ctx).unwrap(),
            session.maps().get_mapping(dev).unwrap(),
            session.maps().get_ptr_mapping(p).unwrap() + 0x100,
            0x200
        );
        assert_eq!(driver.calls()[resident].args, expected);
    }

    #[test]
    fn views_follow_their_sources() {
        let mut app = App::new(Flags::default());
        let image = ImageHandle::from_raw(0x700);
        let view = ImageHandle::from_raw(0x701);
        let view_of_view = ImageHandle::from_raw(0x702);
        // The view of the view has the lowest insertion id.
        let state = image_state(&app, Some(view));
        app.session.registry.insert(view_of_view, state);
        let state = image_state(&app, None);
        app.session.registry.insert(image, state);
        let state = image_state(&app, Some(image));
        app.session.registry.insert(view, state);

        let mut session = Session::from_captured(Flags::default(), reload(&app));
        let mut driver = replay_driver();
        restore_state(&mut session, &mut driver).unwrap();

        assert_eq!(driver.calls_to("image_create").len(), 1);
        let views = driver.calls_to("image_view_create");
        assert_eq!(views.len(), 2);
        let ri = session.maps().get_mapping(image).unwrap();
        let rv = session.maps().get_mapping(view).unwrap();
        assert!(views[0].args.ends_with(&ri.to_string()));
        assert!(views[1].args.ends_with(&rv.to_string()));
        assert!(position(&driver, "image_create") < position(&driver, "image_view_create"));
        assert!(session.maps().get_mapping(view_of_view).is_ok());
    }

    #[test]
    fn view_of_untracked_image_is_not_found() {
        let mut app = App::new(Flags::default());
        let state = image_state(&app, Some(ImageHandle::from_raw(0x7ff)));
        app.session.registry.insert(ImageHandle::from_raw(0x700), state);

        let mut session = Session::from_captured(Flags::default(), reload(&app));
        let err = restore_state(&mut session, &mut replay_driver()).unwrap_err();
        match err {
            GcrError::NotFound { id, .. } => assert_eq!(id, 0x7ff),
            e => panic!("unexpected {}", e),
        }
    }

    #[test]
    fn global_symbol_is_looked_up_then_filled() {
        let mut app = App::new(Flags::default());
        let m = module(&mut app);
        let (g, size) = app.driver.module_get_global_pointer(m, "table").unwrap();
        capture::on_module_get_global_pointer(&mut app.session, m, "table", g, size).unwrap();
        app.write(g, &[0x3c; 16]);
        capture::snapshot_all_memory(&mut app.session, &mut app.driver).unwrap();

        let mut session = Session::from_captured(Flags::default(), reload(&app));
        let mut driver = replay_driver();
        let summary = restore_state(&mut session, &mut driver).unwrap();

        let lookup = position(&driver, "module_get_global_pointer");
        let rm = session.maps().get_mapping(m).unwrap();
        assert_eq!(driver.calls()[lookup].args, format!("{}, \"table\"", rm));
        assert!(lookup < position(&driver, "append_memory_copy"));
        assert!(driver.calls_to("mem_alloc_device").is_empty());
        let rg = session.maps().get_ptr_mapping(g).unwrap();
        assert_ne!(rg, g);
        assert_eq!(driver.memory_at(rg, 16).unwrap(), &[0x3c; 16][..]);
        assert_eq!(summary.bytes_uploaded, size);
    }

    #[test]
    fn function_pointer_is_looked_up_without_data() {
        let mut app = App::new(Flags::default());
        let m = module(&mut app);
        let f = app.driver.module_get_function_pointer(m, "callback").unwrap();
        capture::on_module_get_function_pointer(&mut app.session, m, "callback", f).unwrap();
        capture::snapshot_all_memory(&mut app.session, &mut app.driver).unwrap();

        let mut session = Session::from_captured(Flags::default(), reload(&app));
        let mut driver = replay_driver();
        let summary = restore_state(&mut session, &mut driver).unwrap();

        let rm = session.maps().get_mapping(m).unwrap();
        let lookups = driver.calls_to("module_get_function_pointer");
        assert_eq!(lookups.len(), 1);
        assert_eq!(lookups[0].args, format!("{}, \"callback\"", rm));
        assert!(session.maps().get_ptr_mapping(f).is_ok());
        assert_eq!(summary.restored.get(ObjectCategory::Allocation), 1);
        assert_eq!(summary.bytes_uploaded, 0);
        assert!(driver.calls_to("append_memory_copy").is_empty());
        assert!(driver.calls_to("write_host_memory").is_empty());
    }

    #[test]
    fn sub_devices_are_found_by_parent_and_ordinal() {
        let mut app = App::new(Flags::default());
        let subs = vec![Handle::from_raw(0x900), Handle::from_raw(0x901)];
        capture::on_sub_devices_get(&mut app.session, app.device, &subs).unwrap();

        let mut session = Session::from_captured(Flags::default(), reload(&app));
        let mut driver = RecordingDriver::with_topology_at(1, 1, 2, REPLAY_HANDLES, REPLAY_ADDRESSES);
        restore_state(&mut session, &mut driver).unwrap();

        let parent = session.maps().get_mapping(app.device).unwrap();
        let queries = driver.calls_to("device_get_sub_devices");
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].args, parent.to_string());
        let replay_subs = driver.device_get_sub_devices(parent).unwrap();
        assert_eq!(session.maps().get_mapping(subs[0]).unwrap(), replay_subs[0]);
        assert_eq!(session.maps().get_mapping(subs[1]).unwrap(), replay_subs[1]);
    }
}
