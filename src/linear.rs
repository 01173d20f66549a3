//! Thread-local linear allocator with per-page reference counting.
//!
//! Each size class bumps out of one thread-local *active* page at a time.
//! A page's refcount starts at `u64::MAX`; suballocations are tracked by the
//! owning thread until `finalize` subtracts `u64::MAX − suballocation_count`,
//! after which the refcount equals the number of outstanding suballocations
//! and any thread may free them. A page whose refcount reaches zero returns
//! to a global per-size-class cache, or to the OS for oversized one-shot
//! pages. Page bases are naturally aligned to the page size so the header is
//! recovered from any suballocation by masking the address.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::Cell;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

/// Refcount sentinel for a page still accepting suballocations.
const REFCOUNT_MAX: u64 = u64::MAX;

/// Lives at the base of every page.
#[repr(C)]
pub(crate) struct PageHeader {
    refcount: AtomicU64,
    page_size: usize,
    /// Freelist link; only touched under the owning [`PageCache`] mutex.
    cache_link: *mut PageHeader,
    /// Bump state, padded onto its own cache line. Mutated only by the
    /// owning thread until the page is finalized.
    owner: CachePadded<OwnerState>,
}

struct OwnerState {
    suballocation_count: Cell<usize>,
    suballocation_offset: Cell<usize>,
}

/// Global freelist of finalized, fully-freed pages of one size class.
pub(crate) struct PageCache {
    head: Mutex<*mut PageHeader>,
}

unsafe impl Send for PageCache {}
unsafe impl Sync for PageCache {}

impl PageCache {
    pub const fn new() -> Self {
        PageCache {
            head: Mutex::new(ptr::null_mut()),
        }
    }

    fn get(&self) -> Option<NonNull<PageHeader>> {
        let mut head = self.head.lock();
        let page = NonNull::new(*head)?;
        *head = unsafe { page.as_ref().cache_link };
        Some(page)
    }

    fn put(&self, page: NonNull<PageHeader>) {
        let mut head = self.head.lock();
        unsafe { (*page.as_ptr()).cache_link = *head };
        *head = page.as_ptr();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let head = self.head.lock();
        let mut count = 0;
        let mut node = *head;
        while let Some(page) = NonNull::new(node) {
            count += 1;
            node = unsafe { page.as_ref().cache_link };
        }
        count
    }
}

#[inline]
fn align_up(value: usize, alignment: usize) -> usize {
    assert!(
        alignment.is_power_of_two(),
        "alignment {alignment} is not a power of two"
    );
    (value + alignment - 1) & !(alignment - 1)
}

fn alloc_raw(layout: Layout) -> NonNull<u8> {
    let ptr = unsafe { alloc(layout) };
    match NonNull::new(ptr) {
        Some(ptr) => ptr,
        None => handle_alloc_error(layout),
    }
}

/// Writes a fresh header into `page`, making it the start of an empty page.
unsafe fn init_header(page: NonNull<PageHeader>, page_size: usize) {
    unsafe {
        ptr::write(
            page.as_ptr(),
            PageHeader {
                refcount: AtomicU64::new(REFCOUNT_MAX),
                page_size,
                cache_link: ptr::null_mut(),
                owner: CachePadded::new(OwnerState {
                    suballocation_count: Cell::new(0),
                    suballocation_offset: Cell::new(mem::size_of::<PageHeader>()),
                }),
            },
        );
    }
}

/// Recovers the page header from any suballocation it produced.
#[inline]
fn header_from_allocation(allocation: NonNull<u8>, page_size: usize) -> NonNull<PageHeader> {
    let base = allocation.as_ptr() as usize & !(page_size - 1);
    // Page bases are aligned to `page_size`, so the mask cannot miss.
    unsafe { NonNull::new_unchecked(base as *mut PageHeader) }
}

unsafe fn release_page(page: NonNull<PageHeader>, total_size: usize, alignment: usize) {
    let layout = Layout::from_size_align(total_size, alignment)
        .expect("page layout was valid at allocation");
    unsafe { dealloc(page.as_ptr().cast(), layout) };
}

/// One thread's active page for a single size class.
pub(crate) struct ActivePage {
    header: NonNull<PageHeader>,
    page_size: usize,
    cache: &'static PageCache,
}

impl ActivePage {
    pub fn new(page_size: usize, cache: &'static PageCache) -> Self {
        let layout = Layout::from_size_align(page_size, page_size)
            .expect("page size must be a valid power-of-two layout");
        let page = alloc_raw(layout).cast::<PageHeader>();
        debug_assert_eq!(page.as_ptr() as usize % page_size, 0);
        unsafe { init_header(page, page_size) };
        ActivePage {
            header: page,
            page_size,
            cache,
        }
    }

    /// Bump-allocates `size` bytes at `alignment` from the active page,
    /// finalizing and replacing it when exhausted. Requests that cannot fit
    /// an empty page get a dedicated one-shot page with `refcount = 1`.
    pub fn alloc(&mut self, size: usize, alignment: usize) -> NonNull<u8> {
        loop {
            let header = unsafe { self.header.as_ref() };
            let aligned_offset = align_up(header.owner.suballocation_offset.get(), alignment);
            let total_needed = aligned_offset + size;
            if total_needed <= self.page_size {
                header
                    .owner
                    .suballocation_count
                    .set(header.owner.suballocation_count.get() + 1);
                header.owner.suballocation_offset.set(total_needed);
                let base = self.header.as_ptr().cast::<u8>();
                return unsafe { NonNull::new_unchecked(base.add(aligned_offset)) };
            }

            let single_offset = align_up(mem::size_of::<PageHeader>(), alignment);
            let single_size = single_offset + size;
            if single_size > self.page_size {
                return self.alloc_oversized(single_offset, single_size);
            }

            self.finalize();
        }
    }

    fn alloc_oversized(&self, payload_offset: usize, total_size: usize) -> NonNull<u8> {
        let layout = Layout::from_size_align(total_size, self.page_size)
            .expect("oversized allocation exceeds layout limits");
        let page = alloc_raw(layout).cast::<PageHeader>();
        unsafe {
            init_header(page, total_size);
            page.as_ref().refcount.store(1, Ordering::Relaxed);
            NonNull::new_unchecked(page.as_ptr().cast::<u8>().add(payload_offset))
        }
    }

    /// Seals the active page and installs a fresh one. If every
    /// suballocation was already freed the page is reinitialized in place;
    /// otherwise a replacement comes from the cache or the OS and the sealed
    /// page is released by whichever free drops its refcount to zero.
    fn finalize(&mut self) {
        let header = unsafe { self.header.as_ref() };
        let adjustment = REFCOUNT_MAX - header.owner.suballocation_count.get() as u64;
        if header.refcount.fetch_sub(adjustment, Ordering::AcqRel) == adjustment {
            unsafe { init_header(self.header, self.page_size) };
        } else {
            let page = self
                .cache
                .get()
                .unwrap_or_else(|| {
                    let layout = Layout::from_size_align(self.page_size, self.page_size)
                        .expect("page size must be a valid power-of-two layout");
                    alloc_raw(layout).cast::<PageHeader>()
                });
            debug_assert_eq!(page.as_ptr() as usize % self.page_size, 0);
            unsafe { init_header(page, self.page_size) };
            self.header = page;
        }
    }
}

impl Drop for ActivePage {
    fn drop(&mut self) {
        let header = unsafe { self.header.as_ref() };
        let adjustment = REFCOUNT_MAX - header.owner.suballocation_count.get() as u64;
        let previous = header.refcount.fetch_sub(adjustment, Ordering::AcqRel);
        if previous == adjustment {
            unsafe { release_page(self.header, self.page_size, self.page_size) };
        } else {
            // The page must outlive its remaining suballocations; leak it and
            // report the teardown leak.
            panic!(
                "linear allocator torn down with {} live suballocations",
                previous - adjustment
            );
        }
    }
}

/// Frees a suballocation belonging to the given size class.
///
/// # Safety
///
/// `allocation` must have been returned by the same size class's `alloc` and
/// not freed before.
pub(crate) unsafe fn free_in_class(allocation: NonNull<u8>, page_size: usize, cache: &PageCache) {
    let page = header_from_allocation(allocation, page_size);
    let header = unsafe { page.as_ref() };
    if header.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
        let total_size = header.page_size;
        if total_size == page_size {
            cache.put(page);
        } else {
            unsafe { release_page(page, total_size, page_size) };
        }
    }
}

/// Declares a linear-allocator size class: a unit struct with `alloc`/`free`
/// over its own thread-local active page and global page cache.
macro_rules! define_linear_allocator {
    ($(#[$meta:meta])* $vis:vis struct $name:ident, page_size = $page_size:expr) => {
        $(#[$meta])*
        $vis struct $name;

        impl $name {
            pub const PAGE_SIZE: usize = $page_size;

            fn cache() -> &'static $crate::linear::PageCache {
                static CACHE: $crate::linear::PageCache = $crate::linear::PageCache::new();
                &CACHE
            }

            fn with_active<R>(f: impl FnOnce(&mut $crate::linear::ActivePage) -> R) -> R {
                const _: () = {
                    assert!($name::PAGE_SIZE.is_power_of_two());
                    assert!($name::PAGE_SIZE > std::mem::size_of::<$crate::linear::PageHeader>());
                };
                thread_local! {
                    static ACTIVE: std::cell::RefCell<Option<$crate::linear::ActivePage>> =
                        const { std::cell::RefCell::new(None) };
                }
                ACTIVE.with(|cell| {
                    let mut slot = cell.borrow_mut();
                    let page = slot.get_or_insert_with(|| {
                        $crate::linear::ActivePage::new($name::PAGE_SIZE, $name::cache())
                    });
                    f(page)
                })
            }

            /// Allocates `size` bytes at `alignment` from the calling
            /// thread's active page.
            pub fn alloc(size: usize, alignment: usize) -> std::ptr::NonNull<u8> {
                Self::with_active(|page| page.alloc(size, alignment))
            }

            /// Frees a suballocation previously returned by [`Self::alloc`].
            ///
            /// May be called from any thread.
            ///
            /// # Safety
            ///
            /// `allocation` must come from this size class and must not be
            /// freed twice.
            pub unsafe fn free(allocation: std::ptr::NonNull<u8>) {
                unsafe {
                    $crate::linear::free_in_class(allocation, Self::PAGE_SIZE, Self::cache())
                }
            }
        }
    };
}

pub(crate) use define_linear_allocator;

define_linear_allocator!(
    /// General-purpose thread-local linear allocator (64 KiB pages).
    pub struct LinearAllocator, page_size = 64 * 1024
);

define_linear_allocator!(
    /// Backing store for short-lived task frames (2 MiB pages).
    pub(crate) struct TaskFrameAllocator, page_size = 2 * 1024 * 1024
);
