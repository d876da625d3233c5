//! Executable memory regions.
//!
//! A region is created read-write, filled with the artifact bytes, then
//! flipped to read-execute before the entry point is ever formed. The
//! mapping belongs to exactly one loaded module and is scrubbed before
//! it goes back to the OS so stale code cannot linger in a recycled
//! page.

use std::io;

use memmap2::{Mmap, MmapMut};

use airlift_abi::EntryFn;

/// A page-backed region holding one module's code.
pub struct ExecRegion {
    map: Option<Mmap>,
    len: usize,
}

impl ExecRegion {
    /// Map `bytes` into fresh anonymous memory and make it executable.
    ///
    /// The instruction barrier between the copy and the permission flip
    /// makes the new code visible to the fetch path on targets with
    /// split I/D caches.
    pub fn new(bytes: &[u8]) -> io::Result<Self> {
        let mut map = MmapMut::map_anon(bytes.len())?;
        map.copy_from_slice(bytes);
        instruction_barrier();
        let map = map.make_exec()?;
        Ok(Self {
            map: Some(map),
            len: bytes.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.map
            .as_ref()
            .map(|m| m.as_ptr())
            .unwrap_or(std::ptr::null())
    }

    /// Whether `[ptr, ptr + size)` lies entirely inside the region.
    ///
    /// Used to validate that a module's interface table really is
    /// static data within its own code region.
    pub fn contains(&self, ptr: *const u8, size: usize) -> bool {
        let base = self.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && size <= self.len && addr - base <= self.len - size
    }

    /// The artifact bytes as currently mapped.
    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    /// Form the entry-point function from offset 0.
    ///
    /// # Safety
    ///
    /// The caller must guarantee the region was filled with a valid
    /// artifact: position-independent code whose first byte starts a
    /// function with the [`EntryFn`] signature and calling convention.
    pub unsafe fn entry(&self) -> EntryFn {
        // SAFETY: the region is mapped executable and non-empty; the
        // artifact contract puts an EntryFn prologue at offset 0.
        unsafe { std::mem::transmute::<*const u8, EntryFn>(self.as_ptr()) }
    }
}

impl Drop for ExecRegion {
    fn drop(&mut self) {
        // Scrub before unmapping. If the permission flip back to
        // writable fails there is nothing better to do than release the
        // mapping as-is.
        if let Some(map) = self.map.take() {
            if let Ok(mut map) = map.make_mut() {
                map.fill(0);
            }
        }
    }
}

/// Ensure copied code is visible to instruction fetch before the first
/// call into the region.
fn instruction_barrier() {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    #[cfg(target_arch = "aarch64")]
    // SAFETY: dsb/isb have no operands and no side effects beyond the
    // required cache synchronization.
    unsafe {
        std::arch::asm!("dsb ish", "isb");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_preserves_the_artifact_bytes() {
        let bytes: Vec<u8> = (0..=255).collect();
        let region = ExecRegion::new(&bytes).expect("map region");
        assert_eq!(region.len(), 256);
        assert_eq!(region.bytes(), &bytes[..]);
    }

    #[test]
    fn contains_accepts_interior_ranges_only() {
        let region = ExecRegion::new(&[0u8; 128]).expect("map region");
        let base = region.as_ptr();

        assert!(region.contains(base, 1));
        assert!(region.contains(base, 128));
        // SAFETY: pointer arithmetic only; never dereferenced.
        let interior = unsafe { base.add(100) };
        assert!(region.contains(interior, 28));
        assert!(!region.contains(interior, 29));
        let outside = unsafe { base.add(128) };
        assert!(!region.contains(outside, 1));
        assert!(!region.contains(std::ptr::null(), 1));
    }

    #[test]
    fn regions_do_not_alias() {
        let a = ExecRegion::new(&[1u8; 64]).expect("map region");
        let b = ExecRegion::new(&[2u8; 64]).expect("map region");
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert!(!a.contains(b.as_ptr(), 1));
    }
}
