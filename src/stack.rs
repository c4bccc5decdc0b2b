use std::io;
use std::num::NonZeroUsize;
use std::ptr;

use corosensei::stack::StackPointer;

#[cfg(not(unix))]
compile_error!("fiber stacks are only implemented for unix targets");

lazy_static! {
    pub static ref PAGE_SIZE: usize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
}

/// An mmap'd fiber stack.
///
/// The lowest page is a guard page: overflowing the stack faults instead of
/// scribbling over neighbouring memory.
pub struct Stack {
    mem: *mut u8,
    len: usize,
}

impl Stack {
    pub fn new(stack_size: usize) -> io::Result<Stack> {
        let page = *PAGE_SIZE;
        // Allocate one more page as the guard page
        let len = stack_size
            .max(1)
            .checked_next_multiple_of(page)
            .and_then(|usable| usable.checked_add(page))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("stack size {} is too large", stack_size),
                )
            })?;

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        if unsafe { libc::mprotect(mem, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::munmap(mem, len);
            }
            return Err(err);
        }

        Ok(Stack {
            mem: mem as *mut u8,
            len,
        })
    }

    /// Usable size in bytes, guard page excluded.
    pub fn size(&self) -> usize {
        self.len - *PAGE_SIZE
    }

    pub fn initial_rsp(&self) -> usize {
        self.mem as usize + self.len
    }
}

unsafe impl corosensei::stack::Stack for Stack {
    fn base(&self) -> StackPointer {
        // mmap never hands out the zero page.
        NonZeroUsize::new(self.initial_rsp()).unwrap()
    }

    fn limit(&self) -> StackPointer {
        NonZeroUsize::new(self.mem as usize + *PAGE_SIZE).unwrap()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mem as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_should_round_up_to_pages() {
        let page = *PAGE_SIZE;
        let s = Stack::new(page + 1).unwrap();
        assert_eq!(s.size(), page * 2);
        assert_eq!(s.initial_rsp() % 16, 0);
    }

    #[test]
    fn oversized_stack_should_be_rejected() {
        for size in [usize::MAX, usize::MAX - *PAGE_SIZE + 1] {
            match Stack::new(size) {
                Err(e) => assert_eq!(e.kind(), io::ErrorKind::InvalidInput),
                Ok(_) => panic!("allocated a stack of {} bytes", size),
            }
        }
    }

    #[test]
    fn usable_region_should_be_writable() {
        let s = Stack::new(16384).unwrap();
        let lowest = (s.initial_rsp() - s.size()) as *mut u8;
        let highest = (s.initial_rsp() - 1) as *mut u8;
        unsafe {
            lowest.write(0xaa);
            highest.write(0x55);
            assert_eq!(lowest.read(), 0xaa);
            assert_eq!(highest.read(), 0x55);
        }
    }
}
