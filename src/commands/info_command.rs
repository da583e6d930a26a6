use crate::{
    commands::{
        gcr_options::{GcrOptions, GcrSubCommand},
        GcrCommand,
    },
    snapshot::CapturedState,
    state::{
        allocation::{AllocationKind, AllocationState, MemoryKind},
        objects::CommandListState,
        ObjectCategory,
    },
};
use serde::Serialize;
use std::{io, path::PathBuf};

pub struct InfoCommand {
    snapshot: PathBuf,
}

impl InfoCommand {
    pub fn new(options: &GcrOptions) -> InfoCommand {
        match options.cmd.clone() {
            GcrSubCommand::Info { snapshot } => InfoCommand { snapshot },
            _ => panic!("Unexpected GcrSubCommand variant. Not an `Info` variant!"),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AllocationInfo {
    id: u64,
    base: String,
    size: usize,
    memory_kind: MemoryKind,
    kind: &'static str,
    snapshot_bytes: usize,
    crc32: Option<u32>,
    indirect_pointers: usize,
}

impl AllocationInfo {
    fn new(base: u64, a: &AllocationState) -> AllocationInfo {
        AllocationInfo {
            id: a.id,
            base: format!("{:#x}", base),
            size: a.size,
            memory_kind: a.memory_kind,
            kind: match a.kind {
                AllocationKind::Pointer { .. } => "pointer",
                AllocationKind::GlobalSymbol { .. } => "global",
                AllocationKind::FunctionPointer { .. } => "function",
                AllocationKind::VirtualReservation { .. } => "reservation",
            },
            snapshot_bytes: a.snapshot.as_ref().map_or(0, |s| s.bytes.len()),
            crc32: a.snapshot.as_ref().map(|s| s.crc32),
            indirect_pointers: a.indirect_offsets.len(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotInfo {
    version: u32,
    kernel_count: u32,
    next_creation_id: u64,
    objects: Vec<(ObjectCategory, usize)>,
    pending_lists: Vec<String>,
    allocations: Vec<AllocationInfo>,
}

impl GcrCommand for InfoCommand {
    fn run(&mut self) -> io::Result<()> {
        let captured = CapturedState::load(&self.snapshot)?;
        let allocations = captured
            .allocations
            .iter()
            .map(|e| AllocationInfo::new(e.base.as_u64(), &e.state))
            .collect();
        let (version, kernel_count, next_creation_id) =
            (captured.version, captured.kernel_count, captured.next_creation_id);
        let registry = captured.into_registry();
        let pending_lists = registry
            .table::<CommandListState>()
            .ordered()
            .into_iter()
            .filter(|(_, l)| l.is_pending())
            .map(|(h, _)| h.to_string())
            .collect();
        let info = SnapshotInfo {
            version,
            kernel_count,
            next_creation_id,
            objects: registry.category_counts(),
            pending_lists,
            allocations,
        };

        let serialized = serde_json::to_string(&info)?;
        println!("{}", serialized);
        Ok(())
    }
}
