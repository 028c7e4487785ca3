//! Guest memory that the event channel engine maps and shares with the guest.

use core::ptr::NonNull;
use core::sync::atomic::AtomicU32;

use axaddrspace::GuestPhysAddr;
use axerrno::AxResult;
use memory_addr::{PAGE_SIZE_4K, is_aligned_4k};

use crate::abi::ControlBlock;
use crate::word::EventWord;

const WORDS_PER_PAGE: usize = PAGE_SIZE_4K / core::mem::size_of::<AtomicU32>();

/// A guest frame number, as passed in `control_gfn` and `array_gfn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GuestFrame(pub u64);

impl GuestFrame {
    /// Guest physical address of the first byte of the frame.
    pub fn gpa(self) -> GuestPhysAddr {
        GuestPhysAddr::from((self.0 as usize) << 12)
    }

    /// The frame containing `gpa`, if `gpa` is page aligned.
    pub fn from_gpa(gpa: GuestPhysAddr) -> Option<Self> {
        let addr = gpa.as_usize();
        is_aligned_4k(addr).then(|| Self((addr / PAGE_SIZE_4K) as u64))
    }
}

/// A page of host memory laid out the way guest pages are shared.
///
/// Mappers backed by identity-mapped memory, and tests, hand these out as
/// guest pages.
#[repr(C, align(4096))]
pub struct HostPage([AtomicU32; WORDS_PER_PAGE]);

impl HostPage {
    pub const fn new() -> Self {
        Self([const { AtomicU32::new(0) }; WORDS_PER_PAGE])
    }

    /// The page as the guest sees it.
    pub fn as_atomics(&self) -> &[AtomicU32; WORDS_PER_PAGE] {
        &self.0
    }
}

impl Default for HostPage {
    fn default() -> Self {
        Self::new()
    }
}

/// A mapped 4 KiB guest page.
///
/// The page is only ever viewed through atomics since the guest may access it
/// at any time.
pub struct GuestPage {
    gfn: GuestFrame,
    base: NonNull<AtomicU32>,
}

// SAFETY: the page is only accessed through atomic operations.
unsafe impl Send for GuestPage {}
unsafe impl Sync for GuestPage {}

impl GuestPage {
    /// Wraps an existing host mapping of `gfn`.
    ///
    /// # Safety
    ///
    /// `base` must be 4 KiB aligned and stay mapped, readable and writable for
    /// as long as the returned value (and anything borrowed from it) lives.
    pub unsafe fn from_raw(gfn: GuestFrame, base: NonNull<u8>) -> Self {
        debug_assert!(is_aligned_4k(base.as_ptr() as usize));
        Self {
            gfn,
            base: base.cast(),
        }
    }

    /// Shares a leaked host page with the guest as frame `gfn`.
    pub fn from_host(gfn: GuestFrame, page: &'static HostPage) -> Self {
        Self {
            gfn,
            base: NonNull::from(&page.0).cast(),
        }
    }

    pub fn gfn(&self) -> GuestFrame {
        self.gfn
    }

    /// The page viewed as an array of event words.
    pub fn words(&self) -> &[EventWord] {
        // SAFETY: EventWord is a transparent AtomicU32 and the page holds
        // exactly WORDS_PER_PAGE of them.
        unsafe {
            core::slice::from_raw_parts(self.base.as_ptr().cast::<EventWord>(), WORDS_PER_PAGE)
        }
    }

    /// The control block at byte `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the block would not be 8-byte aligned or would cross the end
    /// of the page.
    pub fn control_block(&self, offset: usize) -> &ControlBlock {
        assert!(
            offset % 8 == 0 && offset + core::mem::size_of::<ControlBlock>() <= PAGE_SIZE_4K,
            "control block offset {:#x} out of page",
            offset
        );
        // SAFETY: bounds and alignment checked above; ControlBlock is all atomics.
        unsafe { &*self.base.as_ptr().cast::<u8>().add(offset).cast::<ControlBlock>() }
    }
}

impl core::fmt::Debug for GuestPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GuestPage")
            .field("gfn", &self.gfn)
            .field("base", &self.base)
            .finish()
    }
}

/// Maps guest frames into the hypervisor.
pub trait GuestMemory: Send + Sync {
    /// Maps `gfn` for shared access. Mapping the same frame twice must yield
    /// views of the same memory.
    fn map_guest_frame(&self, gfn: GuestFrame) -> AxResult<GuestPage>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use core::sync::atomic::Ordering;

    #[test]
    fn test_frame_address() {
        let gfn = GuestFrame(0x1234);
        assert_eq!(gfn.gpa().as_usize(), 0x1234000);
        assert_eq!(GuestFrame::from_gpa(gfn.gpa()), Some(gfn));
        assert_eq!(GuestFrame::from_gpa(GuestPhysAddr::from(0x1234008)), None);
    }

    #[test]
    fn test_views_share_memory() {
        let host: &'static HostPage = Box::leak(Box::new(HostPage::new()));
        let page = GuestPage::from_host(GuestFrame(1), host);

        page.words()[2].set_pending();
        let block = page.control_block(0);
        assert_ne!(block.head[0].load(Ordering::Acquire), 0);
        assert_eq!(page.words().len(), 1024);
    }

    #[test]
    #[should_panic]
    fn test_control_block_past_page_end() {
        let host: &'static HostPage = Box::leak(Box::new(HostPage::new()));
        let page = GuestPage::from_host(GuestFrame(1), host);
        page.control_block(PAGE_SIZE_4K - 64);
    }
}
