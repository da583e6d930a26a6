//! Creation parameters, captured once and owned by the state that needs them
//! to recreate its object.

use serde::{Deserialize, Serialize};

bitflags! {
    /// Which USM memory kinds a kernel may reach through pointers it was not
    /// given as arguments.
    #[derive(Serialize, Deserialize, Default)]
    pub struct IndirectAccessFlags: u32 {
        const DEVICE = 0x1;
        const HOST = 0x2;
        const SHARED = 0x4;
    }
}

bitflags! {
    #[derive(Serialize, Deserialize, Default)]
    pub struct MemoryAccess: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const READ_WRITE = Self::READ.bits | Self::WRITE.bits;
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ContextDesc {
    pub flags: u32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommandListDesc {
    pub command_queue_group_ordinal: u32,
    pub flags: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum QueueMode {
    Default,
    Synchronous,
    Asynchronous,
}

impl Default for QueueMode {
    fn default() -> Self {
        QueueMode::Default
    }
}

/// Also describes the implicit queue of an immediate command list.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct CommandQueueDesc {
    pub ordinal: u32,
    pub index: u32,
    pub mode: QueueMode,
    pub priority: u32,
    pub flags: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ImageType {
    Image1D,
    Image1DArray,
    Image2D,
    Image2DArray,
    Image3D,
    Buffer,
}

impl Default for ImageType {
    fn default() -> Self {
        ImageType::Image2D
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageDesc {
    pub image_type: ImageType,
    /// Packed format layout/type/swizzle word. Conversion is not our business.
    pub format: u64,
    pub width: u64,
    pub height: u32,
    pub depth: u32,
    pub array_levels: u32,
    pub mip_levels: u32,
    pub flags: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ModuleFormat {
    /// Portable intermediate representation, compiled by the driver.
    IntermediateLanguage,
    /// Device specific binary.
    Native,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SpecConstant {
    pub id: u32,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModuleDesc {
    pub format: ModuleFormat,
    pub input: Vec<u8>,
    pub build_flags: String,
    pub spec_constants: Vec<SpecConstant>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct KernelDesc {
    pub flags: u32,
    pub name: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventPoolDesc {
    pub flags: u32,
    pub count: u32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventDesc {
    pub index: u32,
    pub signal_scope: u32,
    pub wait_scope: u32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FenceDesc {
    pub flags: u32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceMemDesc {
    pub flags: u32,
    pub ordinal: u32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct HostMemDesc {
    pub flags: u32,
}
