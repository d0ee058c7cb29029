use std::ptr::NonNull;

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_PRIVATE: i32 = 0x02;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub const MAP_ANON: i32 = 0x1000;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub const SC_PAGESIZE: i32 = 30;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub const SC_PAGESIZE: i32 = 29;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap, munmap and mprotect
    /// # Safety
    /// see valid mmap and munmap usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;

        pub fn sysconf(name: i32) -> isize;
    }

    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// # Safety
    /// must be allocated by mmap
    #[inline]
    pub unsafe fn anonymous_munmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }

    /// # Safety
    /// range must be page aligned and mapped
    #[inline]
    pub unsafe fn no_access(ptr: *mut u8, len: usize) -> bool {
        // SAFETY: safe if contract holds
        unsafe { mprotect(ptr.cast(), len, PROT_NONE) == 0 }
    }

    pub fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions
        let size = unsafe { sysconf(SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    }
}

#[cfg(windows)]
#[allow(unused)]
mod windows {
    use core::ffi::c_void;

    pub const MEM_COMMIT: u32 = 0x1000;
    pub const MEM_RESERVE: u32 = 0x2000;
    pub const MEM_RELEASE: u32 = 0x8000;
    pub const PAGE_NOACCESS: u32 = 0x01;
    pub const PAGE_READWRITE: u32 = 0x04;

    unsafe extern "system" {
        pub fn VirtualAlloc(addr: *mut c_void, size: usize, kind: u32, protect: u32) -> *mut c_void;
        pub fn VirtualFree(addr: *mut c_void, size: usize, kind: u32) -> i32;
        pub fn VirtualProtect(
            addr: *mut c_void,
            size: usize,
            protect: u32,
            old: *mut u32,
        ) -> i32;
    }

    /// # Safety
    /// null must be checked
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        unsafe {
            VirtualAlloc(
                core::ptr::null_mut(),
                len,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_READWRITE,
            )
            .cast()
        }
    }

    /// # Safety
    /// must be allocated by VirtualAlloc
    pub unsafe fn anonymous_munmap(ptr: *mut u8, _len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { VirtualFree(ptr.cast(), 0, MEM_RELEASE) };
    }

    /// # Safety
    /// range must be page aligned and committed
    pub unsafe fn no_access(ptr: *mut u8, len: usize) -> bool {
        let mut old = 0u32;
        // SAFETY: safe if contract holds
        unsafe { VirtualProtect(ptr.cast(), len, PAGE_NOACCESS, &mut old) != 0 }
    }

    pub fn page_size() -> usize {
        4096
    }
}

#[cfg(unix)]
use unix as os;
#[cfg(windows)]
use windows as os;

#[must_use]
pub fn page_size() -> usize {
    os::page_size()
}

/// Zeroed read/write pages.
#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: the result is null checked
    let ptr = unsafe { os::anonymous_mmap(size) };
    NonNull::new(ptr)
}

pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from a map_memory allocation
    unsafe { os::anonymous_munmap(ptr.as_ptr(), size) };
}

/// Turns the leading pages of a mapping into a guard. Returns false when
/// the protection could not be applied.
pub fn protect_guard(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: ptr is page aligned inside a live mapping
    unsafe { os::no_access(ptr.as_ptr(), size) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_memory_is_zeroed_and_writable() {
        let size = page_size() * 2;
        let ptr = map_memory(size).expect("map");
        // SAFETY: the mapping is `size` bytes
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), size) };
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[size - 1] = 7;
        assert!(protect_guard(ptr, page_size()));
        unmap_memory(ptr, size);
    }
}
