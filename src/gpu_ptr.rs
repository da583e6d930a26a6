use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    cmp::Ordering,
    convert::TryInto,
    fmt::{Display, Formatter, Result},
    hash::{Hash, Hasher},
    marker::PhantomData,
    mem::size_of,
    ops::{Add, Sub},
};

/// Useful alias.
pub type Void = u8;

/// Size in bytes of a pointer embedded in device or host memory.
/// Captured workloads are always 64 bit.
pub const EMBEDDED_PTR_SIZE: usize = size_of::<u64>();

/// An address in the address space of the application (device, host or
/// shared USM). It is never dereferenced locally: contents are only ever
/// accessed through the driver.
///
/// Manually derive Copy, Clone etc. due to quirks with PhantomData
pub struct GpuPtr<T> {
    ptr: u64,
    phantom: PhantomData<*const T>,
}

assert_eq_size!(GpuPtr<Void>, u64);

impl<T> Clone for GpuPtr<T> {
    fn clone(&self) -> Self {
        GpuPtr {
            ptr: self.ptr,
            phantom: PhantomData,
        }
    }
}

impl<T> Copy for GpuPtr<T> {}

impl<T> Default for GpuPtr<T> {
    fn default() -> Self {
        GpuPtr::null()
    }
}

impl<T> std::fmt::Debug for GpuPtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "GpuPtr({:#x})", self.ptr)
    }
}

impl<T> GpuPtr<T> {
    pub fn null() -> GpuPtr<T> {
        GpuPtr {
            ptr: 0,
            phantom: PhantomData,
        }
    }

    pub fn new_from_val(val: u64) -> GpuPtr<T> {
        GpuPtr {
            ptr: val,
            phantom: PhantomData,
        }
    }

    pub fn as_u64(&self) -> u64 {
        self.ptr
    }

    pub fn is_null(&self) -> bool {
        self.ptr == 0
    }

    /// Byte distance from `base` to self. None if self lies below `base`.
    pub fn byte_offset_from(self, base: GpuPtr<T>) -> Option<usize> {
        self.ptr
            .checked_sub(base.ptr)
            .and_then(|d| d.try_into().ok())
    }
}

impl<T> Display for GpuPtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

/// Pointer arithmetic is always in bytes. Unlike a host pointer we never know
/// the referent layout on the device.
impl<T> Add<usize> for GpuPtr<T> {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        // Will automatically deal with overflow in debug mode.
        Self::new_from_val(self.ptr + delta as u64)
    }
}

impl<T> Sub<usize> for GpuPtr<T> {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        Self::new_from_val(self.ptr - delta as u64)
    }
}

impl<T> PartialOrd for GpuPtr<T> {
    fn partial_cmp(&self, other: &GpuPtr<T>) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for GpuPtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ptr.cmp(&other.ptr)
    }
}

impl<T> PartialEq for GpuPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for GpuPtr<T> {}

impl<T> Hash for GpuPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

impl<T> From<u64> for GpuPtr<T> {
    fn from(addr: u64) -> Self {
        GpuPtr::<T>::new_from_val(addr)
    }
}

impl<T> From<GpuPtr<T>> for u64 {
    fn from(p: GpuPtr<T>) -> u64 {
        p.ptr
    }
}

impl<T> Serialize for GpuPtr<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.ptr)
    }
}

impl<'de, T> Deserialize<'de> for GpuPtr<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        u64::deserialize(deserializer).map(GpuPtr::new_from_val)
    }
}

/// Read a little endian embedded pointer at `offset`. None if it doesn't fit.
pub fn read_embedded_ptr(buf: &[u8], offset: usize) -> Option<GpuPtr<Void>> {
    let end = offset.checked_add(EMBEDDED_PTR_SIZE)?;
    let bytes: [u8; EMBEDDED_PTR_SIZE] = buf.get(offset..end)?.try_into().ok()?;
    Some(GpuPtr::new_from_val(u64::from_le_bytes(bytes)))
}

/// Overwrite the embedded pointer at `offset`. Returns false if it doesn't fit.
pub fn write_embedded_ptr(buf: &mut [u8], offset: usize, val: GpuPtr<Void>) -> bool {
    let end = match offset.checked_add(EMBEDDED_PTR_SIZE) {
        Some(end) if end <= buf.len() => end,
        _ => return false,
    };
    buf[offset..end].copy_from_slice(&val.as_u64().to_le_bytes());
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_test() {
        let a = GpuPtr::<u64>::null();
        assert_eq!(0, a.as_u64());
        assert!(a.is_null());
    }

    #[test]
    fn add_is_bytewise() {
        let a = GpuPtr::<u64>::new_from_val(0x1000);
        let b = a + 1usize;
        assert_eq!(0x1001, b.as_u64());
        assert_eq!(a, b - 1usize);
    }

    #[test]
    fn byte_offset_test() {
        let base = GpuPtr::<Void>::new_from_val(0x1000);
        assert_eq!(Some(0x40), (base + 0x40usize).byte_offset_from(base));
        assert_eq!(None, (base - 1usize).byte_offset_from(base));
    }

    #[test]
    fn embedded_ptr_test() {
        let mut buf = vec![0u8; 12];
        assert!(write_embedded_ptr(&mut buf, 4, 0xdead_beef_0000u64.into()));
        assert_eq!(Some(0xdead_beef_0000u64.into()), read_embedded_ptr(&buf, 4));
        assert!(!write_embedded_ptr(&mut buf, 5, 1u64.into()));
        assert_eq!(None, read_embedded_ptr(&buf, 5));
    }

    #[test]
    fn comparison_test() {
        let c = GpuPtr::<Void>::new_from_val(0);
        let d = GpuPtr::<Void>::new_from_val(16);
        assert!(c < d);
        assert!(c != d);
        assert_eq!(d, d.clone());
    }
}
