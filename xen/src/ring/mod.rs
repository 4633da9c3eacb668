//! Shared producer/consumer rings
//!
//! A shared ring is a single page holding a 64 byte header followed by a power-of-two number of
//! slots. Each slot holds either a request or a response, the front end produces requests and
//! consumes responses, the back end does the opposite. All index arithmetic wraps at 32 bits.
//!
//! ```text
//! ┌────────┬────────┬────────┬────────┬─────────┬────────┬────────┬─────┐
//! │req_prod│req_evt │rsp_prod│rsp_evt │ padding │ slot 0 │ slot 1 │ ... │
//! └────────┴────────┴────────┴────────┴─────────┴────────┴────────┴─────┘
//! ```

use {
    crate::{memory::alloc_pages, platform::consts::PAGE_SIZE},
    alloc::alloc::{handle_alloc_error, Layout},
    core::{
        marker::PhantomData,
        mem::{align_of, size_of},
        ptr::{self, NonNull},
        sync::atomic::{fence, AtomicU32, Ordering},
    },
    displaydoc::Display,
    log::trace,
    xen_sys::{
        blkif_request, blkif_response, netif_rx_request, netif_rx_response, netif_tx_request,
        netif_tx_response, RING_IDX,
    },
};

mod stream;

pub use stream::{ConsoleInterface, Duplex, Stream, XenStoreInterface};

/// Write memory barrier, orders slot writes before the index publishing them
pub fn wmb() {
    fence(Ordering::Release)
}

/// Read memory barrier, orders an index read before the slot reads it covers
pub fn rmb() {
    fence(Ordering::Acquire)
}

/// Full memory barrier
pub fn mb() {
    fence(Ordering::SeqCst)
}

/// Producer has no free slot
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

/// Block device ring
pub type BlkifRing = SharedRing<blkif_request, blkif_response>;

/// Network transmit ring
pub type NetifTxRing = SharedRing<netif_tx_request, netif_tx_response>;

/// Network receive ring
pub type NetifRxRing = SharedRing<netif_rx_request, netif_rx_response>;

const HEADER_SIZE: usize = 64;

#[repr(C)]
struct Header {
    req_prod: AtomicU32,
    req_event: AtomicU32,
    rsp_prod: AtomicU32,
    rsp_event: AtomicU32,
    _pad: [u8; 48],
}

const _: () = assert!(size_of::<Header>() == HEADER_SIZE);

const fn round_down_pow2(x: usize) -> usize {
    if x == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - x.leading_zeros())
    }
}

const fn max(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

/// Shared page of a ring carrying `Req` requests and `Rsp` responses
pub struct SharedRing<Req, Rsp> {
    page: NonNull<Header>,
    owned: bool,
    _slots: PhantomData<(Req, Rsp)>,
}

// The page is only accessed through atomics and index-protected slots
unsafe impl<Req: Send, Rsp: Send> Send for SharedRing<Req, Rsp> {}
unsafe impl<Req: Send, Rsp: Send> Sync for SharedRing<Req, Rsp> {}

impl<Req: Copy, Rsp: Copy> SharedRing<Req, Rsp> {
    const ALIGN: usize = max(align_of::<Req>(), align_of::<Rsp>());

    /// Bytes per slot, large enough for either a request or a response
    pub const SLOT_SIZE: usize =
        (max(size_of::<Req>(), size_of::<Rsp>()) + Self::ALIGN - 1) / Self::ALIGN * Self::ALIGN;

    /// Number of slots that fit in the page, rounded down to a power of two
    pub const NR_ENTS: u32 = round_down_pow2((PAGE_SIZE - HEADER_SIZE) / Self::SLOT_SIZE) as u32;

    /// Allocates and initialises a ring page
    pub fn new() -> Self {
        let page = match alloc_pages(0) {
            Some(page) => page.cast::<Header>(),
            None => handle_alloc_error(Layout::new::<Header>()),
        };

        let ring = Self {
            page,
            owned: true,
            _slots: PhantomData,
        };
        ring.header().req_event.store(1, Ordering::SeqCst);
        ring.header().rsp_event.store(1, Ordering::SeqCst);

        trace!(
            "shared ring at {:p}, {} slots of {} bytes",
            page,
            Self::NR_ENTS,
            Self::SLOT_SIZE
        );

        ring
    }

    /// Uses a page that has already been initialised by the other end
    ///
    /// # Safety
    ///
    /// `page` must be a mapped, page-aligned ring page that outlives the returned value
    pub unsafe fn attach(page: NonNull<u8>) -> Self {
        Self {
            page: page.cast(),
            owned: false,
            _slots: PhantomData,
        }
    }

    /// Start of the page, for granting it to the other end
    pub fn page(&self) -> NonNull<u8> {
        self.page.cast()
    }

    fn header(&self) -> &Header {
        unsafe { self.page.as_ref() }
    }

    fn slot(&self, index: RING_IDX) -> *mut u8 {
        let offset = HEADER_SIZE + (index & (Self::NR_ENTS - 1)) as usize * Self::SLOT_SIZE;
        unsafe { (self.page.as_ptr() as *mut u8).add(offset) }
    }

    fn write_slot<T: Copy>(&self, index: RING_IDX, value: T) {
        unsafe { ptr::write_volatile(self.slot(index) as *mut T, value) }
    }

    fn read_slot<T: Copy>(&self, index: RING_IDX) -> T {
        unsafe { ptr::read_volatile(self.slot(index) as *const T) }
    }

    /// Published request producer index
    pub fn req_prod(&self) -> RING_IDX {
        self.header().req_prod.load(Ordering::Relaxed)
    }

    /// Published response producer index
    pub fn rsp_prod(&self) -> RING_IDX {
        self.header().rsp_prod.load(Ordering::Relaxed)
    }

    /// Request index at which the back end wants to be notified
    pub fn req_event(&self) -> RING_IDX {
        self.header().req_event.load(Ordering::Relaxed)
    }

    /// Response index at which the front end wants to be notified
    pub fn rsp_event(&self) -> RING_IDX {
        self.header().rsp_event.load(Ordering::Relaxed)
    }

    /// Publishes requests up to `req_prod`
    pub fn push_requests(&self, req_prod: RING_IDX) {
        wmb();
        self.header().req_prod.store(req_prod, Ordering::Relaxed);
    }

    /// Publishes responses up to `rsp_prod`
    pub fn push_responses(&self, rsp_prod: RING_IDX) {
        wmb();
        self.header().rsp_prod.store(rsp_prod, Ordering::Relaxed);
    }

    /// Asks to be notified once the request producer passes `req_event - 1`
    pub fn set_req_event(&self, req_event: RING_IDX) {
        self.header().req_event.store(req_event, Ordering::Relaxed);
        mb();
    }

    /// Asks to be notified once the response producer passes `rsp_event - 1`
    pub fn set_rsp_event(&self, rsp_event: RING_IDX) {
        self.header().rsp_event.store(rsp_event, Ordering::Relaxed);
        mb();
    }

    /// Front end of the ring
    pub fn front(&self) -> FrontRing<'_, Req, Rsp> {
        FrontRing {
            sring: self,
            req_prod_pvt: 0,
            rsp_cons: 0,
        }
    }

    /// Back end of the ring
    pub fn back(&self) -> BackRing<'_, Req, Rsp> {
        BackRing {
            sring: self,
            rsp_prod_pvt: 0,
            req_cons: 0,
        }
    }
}

impl<Req, Rsp> Drop for SharedRing<Req, Rsp> {
    fn drop(&mut self) {
        if self.owned {
            unsafe { crate::memory::free_pages(self.page.cast(), 0) }
        }
    }
}

/// Whether the other end asked to be notified about the index moving from `old` to `new`
fn need_notify(old: RING_IDX, new: RING_IDX, event: RING_IDX) -> bool {
    new.wrapping_sub(event) < new.wrapping_sub(old)
}

/// Request producer and response consumer
pub struct FrontRing<'a, Req: Copy, Rsp: Copy> {
    sring: &'a SharedRing<Req, Rsp>,
    req_prod_pvt: RING_IDX,
    rsp_cons: RING_IDX,
}

impl<'a, Req: Copy, Rsp: Copy> FrontRing<'a, Req, Rsp> {
    /// Number of slots
    pub fn size(&self) -> u32 {
        SharedRing::<Req, Rsp>::NR_ENTS
    }

    /// Slots that can be filled without overwriting an unconsumed response
    pub fn free_requests(&self) -> u32 {
        self.size() - self.req_prod_pvt.wrapping_sub(self.rsp_cons)
    }

    /// Whether every slot holds an outstanding request or unconsumed response
    pub fn is_full(&self) -> bool {
        self.free_requests() == 0
    }

    /// Writes a request into the next slot, it becomes visible after `push_requests`
    pub fn produce_request(&mut self, request: Req) -> Result<(), RingFull> {
        if self.is_full() {
            return Err(RingFull);
        }

        self.sring.write_slot(self.req_prod_pvt, request);
        self.req_prod_pvt = self.req_prod_pvt.wrapping_add(1);

        Ok(())
    }

    /// Publishes produced requests, returns whether the back end must be notified
    pub fn push_requests(&mut self) -> bool {
        let old = self.sring.req_prod();
        let new = self.req_prod_pvt;

        self.sring.push_requests(new);
        mb();

        need_notify(old, new, self.sring.req_event())
    }

    /// Number of responses published but not consumed
    pub fn has_unconsumed_responses(&self) -> u32 {
        let available = self.sring.rsp_prod().wrapping_sub(self.rsp_cons);

        assert!(
            available <= self.req_prod_pvt.wrapping_sub(self.rsp_cons),
            "back end published {} responses for {} requests",
            available,
            self.req_prod_pvt.wrapping_sub(self.rsp_cons)
        );

        available
    }

    /// Takes the next published response
    pub fn consume_response(&mut self) -> Option<Rsp> {
        if self.has_unconsumed_responses() == 0 {
            return None;
        }
        rmb();

        let response = self.sring.read_slot(self.rsp_cons);
        self.rsp_cons = self.rsp_cons.wrapping_add(1);

        Some(response)
    }

    /// Re-arms the response event and checks for responses that raced with it
    pub fn final_check_for_responses(&mut self) -> bool {
        if self.has_unconsumed_responses() > 0 {
            return true;
        }

        self.sring.set_rsp_event(self.rsp_cons.wrapping_add(1));

        self.has_unconsumed_responses() > 0
    }
}

/// Request consumer and response producer
pub struct BackRing<'a, Req: Copy, Rsp: Copy> {
    sring: &'a SharedRing<Req, Rsp>,
    rsp_prod_pvt: RING_IDX,
    req_cons: RING_IDX,
}

impl<'a, Req: Copy, Rsp: Copy> BackRing<'a, Req, Rsp> {
    /// Number of slots
    pub fn size(&self) -> u32 {
        SharedRing::<Req, Rsp>::NR_ENTS
    }

    /// Number of requests published but not consumed
    pub fn has_unconsumed_requests(&self) -> u32 {
        let requests = self.sring.req_prod().wrapping_sub(self.req_cons);
        let responses = self.size() - self.req_cons.wrapping_sub(self.rsp_prod_pvt);

        assert!(
            requests <= self.size(),
            "front end published {} requests into {} slots",
            requests,
            self.size()
        );

        requests.min(responses)
    }

    /// Whether consuming at `cons` would overwrite a slot not yet answered
    fn request_cons_overflow(&self, cons: RING_IDX) -> bool {
        cons.wrapping_sub(self.rsp_prod_pvt) >= self.size()
    }

    /// Takes the next published request
    pub fn consume_request(&mut self) -> Option<Req> {
        if self.has_unconsumed_requests() == 0 || self.request_cons_overflow(self.req_cons) {
            return None;
        }
        rmb();

        let request = self.sring.read_slot(self.req_cons);
        self.req_cons = self.req_cons.wrapping_add(1);

        Some(request)
    }

    /// Writes a response into the next slot, it becomes visible after `push_responses`
    ///
    /// Fails if every consumed request already has a response.
    pub fn produce_response(&mut self, response: Rsp) -> Result<(), RingFull> {
        if self.rsp_prod_pvt == self.req_cons {
            return Err(RingFull);
        }

        self.sring.write_slot(self.rsp_prod_pvt, response);
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);

        Ok(())
    }

    /// Publishes produced responses, returns whether the front end must be notified
    pub fn push_responses(&mut self) -> bool {
        let old = self.sring.rsp_prod();
        let new = self.rsp_prod_pvt;

        self.sring.push_responses(new);
        mb();

        need_notify(old, new, self.sring.rsp_event())
    }

    /// Re-arms the request event and checks for requests that raced with it
    pub fn final_check_for_requests(&mut self) -> bool {
        if self.has_unconsumed_requests() > 0 {
            return true;
        }

        self.sring.set_req_event(self.req_cons.wrapping_add(1));

        self.has_unconsumed_requests() > 0
    }
}
