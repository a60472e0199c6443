//! POSIX memory primitives used by the patching layer
//!
//! Two RAII types: `ProtectionGuard` temporarily changes page protection
//! around a write to live code or a vtable, and `ExecutableMemory` owns an
//! anonymous RWX mapping used for trampolines.

use crate::error::{HookError, Result};

/// memory protection flags, a thin mirror of PROT_*
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protection(pub i32);

impl Protection {
    pub const READ: Protection = Protection(libc::PROT_READ);
    pub const READ_WRITE: Protection = Protection(libc::PROT_READ | libc::PROT_WRITE);
    pub const READ_EXEC: Protection = Protection(libc::PROT_READ | libc::PROT_EXEC);
    pub const READ_WRITE_EXEC: Protection =
        Protection(libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC);
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// align a region down to page boundaries, returning (base, length)
fn page_span(address: usize, size: usize) -> (usize, usize) {
    let page = page_size();
    let base = address & !(page - 1);
    let end = (address + size + page - 1) & !(page - 1);
    (base, end - base)
}

fn protect_memory(address: usize, size: usize, protection: Protection) -> Result<()> {
    let (base, len) = page_span(address, size);

    // SAFETY: base/len are page aligned; the caller vouches the region is mapped
    let rc = unsafe { libc::mprotect(base as *mut libc::c_void, len, protection.0) };
    if rc != 0 {
        return Err(HookError::ProtectionChangeFailed { address, size });
    }
    Ok(())
}

/// current protection of the page containing `address`, from /proc/self/maps
///
/// returns None when the mapping cannot be found or parsed.
#[cfg(target_os = "linux")]
pub fn query_protection(address: usize) -> Option<Protection> {
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
    for line in maps.lines() {
        let mut parts = line.split_whitespace();
        let range = parts.next()?;
        let perms = parts.next()?;
        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if address >= start && address < end {
            let perms = perms.as_bytes();
            let mut prot = 0;
            if perms.first() == Some(&b'r') {
                prot |= libc::PROT_READ;
            }
            if perms.get(1) == Some(&b'w') {
                prot |= libc::PROT_WRITE;
            }
            if perms.get(2) == Some(&b'x') {
                prot |= libc::PROT_EXEC;
            }
            return Some(Protection(prot));
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub fn query_protection(_address: usize) -> Option<Protection> {
    None
}

/// RAII guard that changes protection and restores the previous one on drop
///
/// the previous protection is queried from the kernel where possible;
/// `fallback` is used when the query fails (e.g. non-Linux unix).
pub struct ProtectionGuard {
    address: usize,
    size: usize,
    restore: Protection,
}

impl ProtectionGuard {
    /// change protection, returning a guard that restores on drop
    pub fn new(
        address: usize,
        size: usize,
        new_protection: Protection,
        fallback: Protection,
    ) -> Result<Self> {
        let restore = query_protection(address).unwrap_or(fallback);
        protect_memory(address, size, new_protection)?;
        Ok(Self {
            address,
            size,
            restore,
        })
    }
}

impl Drop for ProtectionGuard {
    fn drop(&mut self) {
        let _ = protect_memory(self.address, self.size, self.restore);
    }
}

/// executable memory region for trampolines
///
/// automatically unmapped when dropped
pub struct ExecutableMemory {
    base: *mut u8,
    size: usize,
    used: usize,
}

impl ExecutableMemory {
    /// allocate an anonymous RWX mapping of at least `size` bytes
    pub fn allocate(size: usize) -> Result<Self> {
        let page = page_size();
        let size = (size + page - 1) & !(page - 1);

        // SAFETY: standard anonymous mapping request
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(HookError::AllocationFailed { size });
        }

        Ok(Self {
            base: base as *mut u8,
            size,
            used: 0,
        })
    }

    /// get base address
    pub fn base(&self) -> usize {
        self.base as usize
    }

    /// get total allocated size
    pub fn size(&self) -> usize {
        self.size
    }

    /// get available bytes
    pub fn available(&self) -> usize {
        self.size - self.used
    }

    /// write code to the region, returning the address it was written at
    pub fn write(&mut self, code: &[u8]) -> Result<usize> {
        if code.len() > self.available() {
            return Err(HookError::AllocationFailed { size: code.len() });
        }

        let write_addr = self.base as usize + self.used;

        // SAFETY: bounds checked, we own the mapping
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), write_addr as *mut u8, code.len());
        }

        self.used += code.len();
        flush_icache(write_addr, code.len());

        Ok(write_addr)
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        // SAFETY: self.base was obtained from mmap with self.size
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

// SAFETY: we own the mapping, safe to move between threads
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

/// flush the instruction cache after writing code
///
/// x86_64 keeps I-cache coherent with data writes, so this is a no-op there;
/// the call sites stay explicit for ports to other architectures.
pub fn flush_icache(_address: usize, _size: usize) {
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
