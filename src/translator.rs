//! Address queries over the registry's allocation records and rewriting of
//! pointers embedded in allocation contents.
//!
//! Nothing here owns state. A translation miss is an ordinary `None`.

use crate::{
    gpu_ptr::{read_embedded_ptr, write_embedded_ptr, GpuPtr, Void, EMBEDDED_PTR_SIZE},
    handle_map::{kind, HandleMaps},
    log::LogLevel::{LogDebug, LogWarn},
    state::{allocation::IndirectOffsets, StateRegistry},
};

/// Owning allocation base and the byte offset of `addr` inside it.
pub fn find_allocation(
    registry: &StateRegistry,
    addr: GpuPtr<Void>,
) -> Option<(GpuPtr<Void>, usize)> {
    if addr.is_null() {
        return None;
    }
    let (base, _) = registry.allocation_containing(addr)?;
    addr.byte_offset_from(base).map(|offset| (base, offset))
}

/// Like `find_allocation`, but `original` is a capture time address and the
/// result is the current (replay) base of the owning allocation.
///
/// `registry` is keyed by capture time bases, `maps` knows where each of them
/// lives now.
pub fn find_allocation_by_original_address(
    registry: &StateRegistry,
    maps: &HandleMaps,
    original: GpuPtr<Void>,
) -> Option<(GpuPtr<Void>, usize)> {
    if original.is_null() {
        return None;
    }
    if let Some((orig_base, cur_base)) = maps.table::<kind::Usm>().floor_entry(original.into()) {
        let orig_base: GpuPtr<Void> = orig_base.into();
        if let Ok(a) = registry.allocation(orig_base) {
            if a.range(orig_base).contains_ptr(original) {
                let offset = original.byte_offset_from(orig_base)?;
                return Some((cur_base.into(), offset));
            }
        }
    }
    // The closest mapped base can be an allocation placed inside a larger
    // reservation that actually owns `original`.
    let (orig_base, offset) = find_allocation(registry, original)?;
    match maps.get_ptr_mapping(orig_base) {
        Ok(cur_base) => Some((cur_base, offset)),
        Err(_) => None,
    }
}

/// Rewrite every not yet translated pointer listed in `offsets` with its
/// replay time value. Returns how many were rewritten.
///
/// Translated offsets are flagged and skipped on later calls. Pointers that
/// resolve to no tracked allocation are left as they are.
pub fn translate_indirect_pointers(
    registry: &StateRegistry,
    maps: &HandleMaps,
    buffer: &mut [u8],
    offsets: &mut IndirectOffsets,
) -> usize {
    let mut count = 0;
    for offset in offsets.pending() {
        let original = match read_embedded_ptr(buffer, offset) {
            Some(p) => p,
            None => {
                log!(
                    LogWarn,
                    "indirect pointer offset {:#x} outside buffer of {:#x} bytes",
                    offset,
                    buffer.len()
                );
                continue;
            }
        };
        match find_allocation_by_original_address(registry, maps, original) {
            Some((cur_base, cur_offset)) => {
                let translated = cur_base + cur_offset;
                write_embedded_ptr(buffer, offset, translated);
                offsets.mark_translated(offset);
                log!(
                    LogDebug,
                    "indirect pointer at {:#x}: {} -> {}",
                    offset,
                    original,
                    translated
                );
                count += 1;
            }
            None => {
                log!(
                    LogWarn,
                    "indirect pointer at {:#x} ({}) is not in any tracked allocation",
                    offset,
                    original
                );
            }
        }
    }
    count
}

/// Best effort search of `buffer` for values that look like pointers into
/// tracked allocations. Returns their byte offsets.
///
/// After a match the scan resumes right past the matched value, so
/// overlapping candidates are never reported.
pub fn scan_for_indirect_pointers(registry: &StateRegistry, buffer: &[u8]) -> Vec<usize> {
    let mut found = Vec::new();
    if buffer.len() < EMBEDDED_PTR_SIZE {
        return found;
    }
    let mut i = 0;
    while i + EMBEDDED_PTR_SIZE <= buffer.len() {
        match read_embedded_ptr(buffer, i) {
            Some(p) if find_allocation(registry, p).is_some() => {
                found.push(i);
                i += EMBEDDED_PTR_SIZE;
            }
            _ => i += 1,
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handle_map::{ContextHandle, DeviceHandle},
        state::allocation::{AllocationKind, AllocationState, MemoryKind},
    };

    fn alloc(size: usize) -> AllocationState {
        AllocationState::new(
            ContextHandle::from_raw(1),
            Some(DeviceHandle::from_raw(2)),
            size,
            8,
            MemoryKind::Device,
            AllocationKind::Pointer {
                device_desc: None,
                host_desc: None,
            },
        )
    }

    fn registry() -> StateRegistry {
        let mut r = StateRegistry::new();
        r.insert_allocation(0x1000u64.into(), alloc(0x100));
        r.insert_allocation(0x4000u64.into(), alloc(0x40));
        r
    }

    fn maps() -> HandleMaps {
        let mut m = HandleMaps::new();
        m.add_ptr_mapping(0x1000u64.into(), 0xa000u64.into());
        m.add_ptr_mapping(0x4000u64.into(), 0xb000u64.into());
        m
    }

    fn buffer_with(ptrs: &[(usize, u64)], len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        for &(off, val) in ptrs {
            assert!(write_embedded_ptr(&mut buf, off, val.into()));
        }
        buf
    }

    #[test]
    fn every_address_in_range_finds_its_allocation() {
        let r = registry();
        for addr in 0x1000u64..0x1100 {
            assert_eq!(
                find_allocation(&r, addr.into()),
                Some((0x1000u64.into(), (addr - 0x1000) as usize))
            );
        }
        for &addr in [0u64, 0xfff, 0x1100, 0x3fff, 0x4040, 0xffff_ffff].iter() {
            assert_eq!(find_allocation(&r, addr.into()), None);
        }
    }

    #[test]
    fn original_address_resolves_to_current_base() {
        let r = registry();
        let m = maps();
        assert_eq!(
            find_allocation_by_original_address(&r, &m, 0x1010u64.into()),
            Some((0xa000u64.into(), 0x10))
        );
        assert_eq!(
            find_allocation_by_original_address(&r, &m, 0x403fu64.into()),
            Some((0xb000u64.into(), 0x3f))
        );
        // Past the end of 0x1000 but below the next base.
        assert_eq!(
            find_allocation_by_original_address(&r, &m, 0x2000u64.into()),
            None
        );
    }

    #[test]
    fn unmapped_allocation_is_a_miss() {
        let r = registry();
        let mut m = HandleMaps::new();
        m.add_ptr_mapping(0x1000u64.into(), 0xa000u64.into());
        assert_eq!(
            find_allocation_by_original_address(&r, &m, 0x4008u64.into()),
            None
        );
    }

    #[test]
    fn translate_rewrites_and_counts() {
        let r = registry();
        let m = maps();
        let mut buf = buffer_with(&[(0, 0x4008), (16, 0x1020), (24, 0x9999)], 32);
        let mut offsets: IndirectOffsets = vec![0usize, 16, 24].into();
        assert_eq!(translate_indirect_pointers(&r, &m, &mut buf, &mut offsets), 2);
        assert_eq!(read_embedded_ptr(&buf, 0), Some(0xb008u64.into()));
        assert_eq!(read_embedded_ptr(&buf, 16), Some(0xa020u64.into()));
        // The miss is left untouched and stays pending.
        assert_eq!(read_embedded_ptr(&buf, 24), Some(0x9999u64.into()));
        assert_eq!(offsets.pending(), vec![24]);
    }

    #[test]
    fn translate_is_order_independent() {
        let r = registry();
        let m = maps();
        let original = buffer_with(&[(0, 0x4000), (8, 0x10ff)], 16);

        let mut forward = original.clone();
        let mut t1: IndirectOffsets = vec![0usize, 8].into();
        let c1 = translate_indirect_pointers(&r, &m, &mut forward, &mut t1);

        let mut backward = original;
        let mut t2: IndirectOffsets = vec![8usize, 0].into();
        let c2 = translate_indirect_pointers(&r, &m, &mut backward, &mut t2);

        assert_eq!(c1, c2);
        assert_eq!(forward, backward);
    }

    #[test]
    fn translate_twice_changes_nothing() {
        let r = registry();
        let m = maps();
        let mut buf = buffer_with(&[(8, 0x1000)], 16);
        let mut offsets: IndirectOffsets = vec![8usize].into();
        assert_eq!(translate_indirect_pointers(&r, &m, &mut buf, &mut offsets), 1);
        let after_first = buf.clone();
        assert_eq!(translate_indirect_pointers(&r, &m, &mut buf, &mut offsets), 0);
        assert_eq!(buf, after_first);
    }

    #[test]
    fn offset_past_end_is_skipped() {
        let r = registry();
        let m = maps();
        let mut buf = vec![0u8; 8];
        let mut offsets: IndirectOffsets = vec![4usize].into();
        assert_eq!(translate_indirect_pointers(&r, &m, &mut buf, &mut offsets), 0);
        assert_eq!(buf, vec![0u8; 8]);
    }

    #[test]
    fn scan_finds_pointers_and_skips_past_matches() {
        let r = registry();
        let buf = buffer_with(&[(3, 0x1004), (16, 0x4000), (24, 0x7777)], 40);
        assert_eq!(scan_for_indirect_pointers(&r, &buf), vec![3, 16]);
        assert!(scan_for_indirect_pointers(&r, &[0u8; 4]).is_empty());
    }
}
