use crate::{
    handle_map::{
        CommandQueueHandle,
        ContextHandle,
        DeviceHandle,
        DriverHandle,
        EventPoolHandle,
        ImageHandle,
        ModuleHandle,
    },
    state::{
        action_log::ActionLog,
        descriptors::*,
        kernel_info::{KernelExecutionInfo, KernelSettings},
    },
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DriverState {
    /// Position in the driver enumeration at capture time.
    pub ordinal: u32,
    pub restored: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub driver: DriverHandle,
    /// Set for sub-devices: the device that enumerated this one.
    pub parent: Option<DeviceHandle>,
    /// Position in the enumeration of `driver` (or of `parent` for a sub-device).
    pub ordinal: u32,
    pub restored: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContextState {
    pub driver: DriverHandle,
    /// Empty means every device of the driver.
    pub devices: Vec<DeviceHandle>,
    pub desc: ContextDesc,
    pub restored: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CommandListMode {
    Deferred(CommandListDesc),
    /// Executes as appended, on an implicit queue described by the desc.
    Immediate(CommandQueueDesc),
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommandListState {
    pub context: ContextHandle,
    pub device: DeviceHandle,
    pub mode: CommandListMode,
    pub actions: ActionLog,
    /// Every dispatch recorded into the list since its last reset.
    pub kernel_history: Vec<KernelExecutionInfo>,
    /// Submitted and not yet known to have completed.
    pub pending_on: Option<CommandQueueHandle>,
    pub closed: bool,
    pub restored: bool,
}

impl CommandListState {
    pub fn new(context: ContextHandle, device: DeviceHandle, mode: CommandListMode) -> Self {
        CommandListState {
            context,
            device,
            mode,
            actions: ActionLog::new(),
            kernel_history: Vec::new(),
            pending_on: None,
            closed: false,
            restored: false,
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self.mode, CommandListMode::Immediate(_))
    }

    /// Immediate lists have work in flight as soon as something is appended.
    pub fn is_pending(&self) -> bool {
        self.pending_on.is_some() || (self.is_immediate() && !self.actions.is_empty())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommandQueueState {
    pub context: ContextHandle,
    pub device: DeviceHandle,
    pub desc: CommandQueueDesc,
    pub restored: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageState {
    pub context: ContextHandle,
    pub device: DeviceHandle,
    pub desc: ImageDesc,
    /// Set for image views.
    pub view_of: Option<ImageHandle>,
    pub restored: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModuleState {
    pub context: ContextHandle,
    pub device: DeviceHandle,
    pub desc: ModuleDesc,
    /// Every module dynamically linked together with this one, itself included.
    pub link_group: Vec<ModuleHandle>,
    pub restored: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KernelState {
    pub module: ModuleHandle,
    pub desc: KernelDesc,
    pub settings: KernelSettings,
    /// The most recent dispatch of this kernel object.
    pub last_execution: Option<KernelExecutionInfo>,
    pub restored: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PhysicalMemState {
    pub context: ContextHandle,
    pub device: DeviceHandle,
    pub size: usize,
    pub restored: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventPoolState {
    pub context: ContextHandle,
    pub devices: Vec<DeviceHandle>,
    pub desc: EventPoolDesc,
    pub restored: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventState {
    pub pool: EventPoolHandle,
    pub desc: EventDesc,
    /// Last observed status.
    pub signaled: bool,
    pub restored: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FenceState {
    pub queue: CommandQueueHandle,
    pub desc: FenceDesc,
    pub signaled: bool,
    pub restored: bool,
}
