//! Page-granular tables indexed by port.
//!
//! Both tables are arenas of fixed-size pages addressed through
//! [`PortLayout`]. Channel pages are allocated by the hypervisor on first use;
//! word pages are donated by the guest through `EVTCHNOP_expand_array`. Pages
//! are never released while the owning domain lives, so references handed out
//! by the lookups stay valid.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

use axerrno::{AxResult, ax_err};
use memory_addr::PAGE_SIZE_4K;
use spin::Once;

use crate::abi::Port;
use crate::chan::Channel;
use crate::mem::{GuestFrame, GuestPage};
use crate::word::EventWord;

/// Channel records per page.
pub const CHANS_PER_PAGE: usize = PAGE_SIZE_4K / core::mem::size_of::<Channel>();
/// Event words per page.
pub const WORDS_PER_PAGE: usize = PAGE_SIZE_4K / core::mem::size_of::<EventWord>();

/// Port to (page, offset) arithmetic for a fixed port space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLayout {
    nr_ports: u32,
}

impl PortLayout {
    /// # Panics
    ///
    /// Panics if `nr_ports` is not a power of two.
    pub const fn new(nr_ports: u32) -> Self {
        assert!(nr_ports.is_power_of_two());
        Self { nr_ports }
    }

    #[inline]
    pub const fn nr_ports(&self) -> u32 {
        self.nr_ports
    }

    #[inline]
    pub const fn contains(&self, port: Port) -> bool {
        port < self.nr_ports
    }

    #[inline]
    const fn index(&self, port: Port) -> usize {
        (port & (self.nr_ports - 1)) as usize
    }

    pub const fn chan_pages(&self) -> usize {
        (self.nr_ports as usize).div_ceil(CHANS_PER_PAGE)
    }

    pub const fn word_pages(&self) -> usize {
        (self.nr_ports as usize).div_ceil(WORDS_PER_PAGE)
    }

    #[inline]
    pub const fn chan_page(&self, port: Port) -> usize {
        self.index(port) / CHANS_PER_PAGE
    }

    #[inline]
    pub const fn chan_offset(&self, port: Port) -> usize {
        self.index(port) % CHANS_PER_PAGE
    }

    #[inline]
    pub const fn word_page(&self, port: Port) -> usize {
        self.index(port) / WORDS_PER_PAGE
    }

    #[inline]
    pub const fn word_offset(&self, port: Port) -> usize {
        self.index(port) % WORDS_PER_PAGE
    }
}

/// Channel records, one page at a time.
pub struct ChannelTable {
    layout: PortLayout,
    pages: Vec<Once<Box<[Channel]>>>,
}

impl ChannelTable {
    pub fn new(layout: PortLayout) -> Self {
        Self {
            layout,
            pages: (0..layout.chan_pages()).map(|_| Once::new()).collect(),
        }
    }

    /// The record for `port`, or `None` if its page was never touched.
    pub fn get(&self, port: Port) -> Option<&Channel> {
        let page = self.pages.get(self.layout.chan_page(port))?.get()?;
        Some(&page[self.layout.chan_offset(port)])
    }

    /// The record for `port`, allocating its page on first touch.
    pub fn get_or_alloc(&self, port: Port) -> &Channel {
        let index = self.layout.chan_page(port);
        let page = self.pages[index].call_once(|| {
            trace!("evtchn: allocating channel page {}", index);
            let base = index * CHANS_PER_PAGE;
            (base..base + CHANS_PER_PAGE)
                .map(|port| Channel::new(port as Port))
                .collect()
        });
        &page[self.layout.chan_offset(port)]
    }

    /// Allocated records in port order.
    pub fn iter(&self) -> impl Iterator<Item = (Port, &Channel)> + '_ {
        let nr_ports = self.layout.nr_ports();
        self.pages
            .iter()
            .enumerate()
            .filter_map(|(index, page)| Some((index * CHANS_PER_PAGE, page.get()?)))
            .flat_map(|(base, page)| {
                page.iter()
                    .enumerate()
                    .map(move |(offset, chan)| ((base + offset) as Port, chan))
            })
            .filter(move |(port, _)| *port < nr_ports)
    }
}

/// Event words, in the order the guest donated their pages.
pub struct WordTable {
    layout: PortLayout,
    pages: Vec<Once<GuestPage>>,
    mapped: AtomicUsize,
}

impl WordTable {
    pub fn new(layout: PortLayout) -> Self {
        Self {
            layout,
            pages: (0..layout.word_pages()).map(|_| Once::new()).collect(),
            mapped: AtomicUsize::new(0),
        }
    }

    /// The word of `port`, or `None` if no page covers it yet.
    pub fn get(&self, port: Port) -> Option<&EventWord> {
        let page = self.pages.get(self.layout.word_page(port))?.get()?;
        page.words().get(self.layout.word_offset(port))
    }

    pub fn is_full(&self) -> bool {
        self.mapped.load(Ordering::Acquire) >= self.pages.len()
    }

    pub fn contains_frame(&self, gfn: GuestFrame) -> bool {
        self.pages
            .iter()
            .filter_map(Once::get)
            .any(|page| page.gfn() == gfn)
    }

    /// Ports covered by mapped pages.
    pub fn mapped_ports(&self) -> Port {
        let ports = self.mapped.load(Ordering::Acquire) * WORDS_PER_PAGE;
        ports.min(self.layout.nr_ports() as usize) as Port
    }

    /// Appends a page for the next range of ports and returns that range.
    ///
    /// Callers serialize through the domain event lock.
    pub fn push(&self, page: GuestPage) -> AxResult<Range<Port>> {
        let index = self.mapped.load(Ordering::Acquire);
        if index >= self.pages.len() {
            return ax_err!(NoMemory, "all event word pages are mapped");
        }
        if self.contains_frame(page.gfn()) {
            return ax_err!(AlreadyExists, "frame is already an event word page");
        }

        let start = self.mapped_ports();
        self.pages[index].call_once(|| page);
        self.mapped.store(index + 1, Ordering::Release);
        Ok(start..self.mapped_ports())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::HostPage;

    fn host_page(gfn: u64) -> GuestPage {
        GuestPage::from_host(GuestFrame(gfn), Box::leak(Box::new(HostPage::new())))
    }

    #[test]
    fn test_layout_arithmetic() {
        let layout = PortLayout::new(1024);
        assert_eq!(CHANS_PER_PAGE, 64);
        assert_eq!(WORDS_PER_PAGE, 1024);
        assert_eq!(layout.chan_pages(), 16);
        assert_eq!(layout.word_pages(), 1);

        assert_eq!(layout.chan_page(63), 0);
        assert_eq!(layout.chan_page(64), 1);
        assert_eq!(layout.chan_offset(65), 1);
        assert_eq!(layout.word_page(1023), 0);
        assert_eq!(layout.word_offset(1023), 1023);
        // Masked by the port space.
        assert_eq!(layout.chan_page(1024 + 64), 1);
    }

    #[test]
    fn test_small_port_space() {
        let layout = PortLayout::new(16);
        assert_eq!(layout.chan_pages(), 1);
        assert_eq!(layout.word_pages(), 1);
        assert!(layout.contains(15));
        assert!(!layout.contains(16));
    }

    #[test]
    fn test_channel_pages_are_lazy_and_stable() {
        let table = ChannelTable::new(PortLayout::new(256));
        assert!(table.get(70).is_none());

        let chan = table.get_or_alloc(70) as *const Channel;
        assert_eq!(table.get(70).map(|c| c as *const Channel), Some(chan));
        assert_eq!(table.get(70).map(|c| c.lock().port), Some(70));
        assert!(table.get(10).is_none());
        assert_eq!(table.iter().count(), CHANS_PER_PAGE);
    }

    #[test]
    fn test_word_pages() {
        let table = WordTable::new(PortLayout::new(2048));
        assert!(table.get(1).is_none());

        assert_eq!(table.push(host_page(5)).unwrap(), 0..1024);
        assert!(table.get(1).is_some());
        assert!(table.get(1024).is_none());

        assert_eq!(table.push(host_page(5)).unwrap_err(), axerrno::AxError::AlreadyExists);
        assert_eq!(table.push(host_page(6)).unwrap(), 1024..2048);
        assert!(table.is_full());
        assert_eq!(table.push(host_page(7)).unwrap_err(), axerrno::AxError::NoMemory);
    }
}
