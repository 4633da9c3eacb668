//! Byte stream rings of the console and XenStore pages

use {
    super::{mb, rmb, wmb},
    alloc::{
        alloc::{alloc_zeroed, handle_alloc_error, Layout},
        boxed::Box,
    },
    core::{
        cell::UnsafeCell,
        marker::PhantomData,
        mem::size_of,
        ptr,
        sync::atomic::{AtomicU32, Ordering},
    },
    xen_sys::{xencons_interface, xenstore_domain_interface, XENSTORE_RING_SIZE},
};

/// One direction of a byte ring: a power-of-two sized buffer and its `cons`/`prod` pair
pub struct Stream<'a> {
    data: *mut u8,
    size: u32,
    cons: &'a AtomicU32,
    prod: &'a AtomicU32,
    _buffer: PhantomData<&'a UnsafeCell<[u8]>>,
}

impl<'a> Stream<'a> {
    fn new<const N: usize>(
        data: &'a UnsafeCell<[u8; N]>,
        cons: &'a AtomicU32,
        prod: &'a AtomicU32,
    ) -> Self {
        assert!(N.is_power_of_two());

        Self {
            data: data.get() as *mut u8,
            size: N as u32,
            cons,
            prod,
            _buffer: PhantomData,
        }
    }

    fn mask(&self, index: u32) -> usize {
        (index & (self.size - 1)) as usize
    }

    /// Indices with the capacity invariant checked
    fn indices(&self) -> (u32, u32) {
        let cons = self.cons.load(Ordering::Relaxed);
        let prod = self.prod.load(Ordering::Relaxed);

        assert!(
            prod.wrapping_sub(cons) <= self.size,
            "stream indices out of range: cons {} prod {}",
            cons,
            prod
        );

        (cons, prod)
    }

    /// Size of the buffer
    pub fn capacity(&self) -> u32 {
        self.size
    }

    /// Bytes produced but not yet consumed
    pub fn unconsumed(&self) -> u32 {
        let (cons, prod) = self.indices();
        prod.wrapping_sub(cons)
    }

    /// Bytes that can be produced without overwriting unconsumed data
    pub fn space(&self) -> u32 {
        self.size - self.unconsumed()
    }

    /// Copies as much of `bytes` as fits and publishes it, returns the number of bytes written
    pub fn write(&self, bytes: &[u8]) -> usize {
        let (cons, prod) = self.indices();
        mb();

        let len = bytes.len().min((self.size - prod.wrapping_sub(cons)) as usize);

        for (i, byte) in bytes[..len].iter().enumerate() {
            let index = self.mask(prod.wrapping_add(i as u32));
            unsafe { ptr::write_volatile(self.data.add(index), *byte) };
        }

        wmb();
        self.prod
            .store(prod.wrapping_add(len as u32), Ordering::Relaxed);

        len
    }

    /// Copies `buf.len()` bytes starting `offset` bytes past the consumer index without consuming them
    ///
    /// Returns `false` if not enough bytes are available.
    pub fn peek(&self, offset: u32, buf: &mut [u8]) -> bool {
        let (cons, prod) = self.indices();

        if (prod.wrapping_sub(cons) as usize) < offset as usize + buf.len() {
            return false;
        }
        rmb();

        let start = cons.wrapping_add(offset);
        for (i, byte) in buf.iter_mut().enumerate() {
            let index = self.mask(start.wrapping_add(i as u32));
            *byte = unsafe { ptr::read_volatile(self.data.add(index)) };
        }

        true
    }

    /// Marks `len` bytes as consumed
    pub fn consume(&self, len: u32) {
        let (cons, prod) = self.indices();
        assert!(
            len <= prod.wrapping_sub(cons),
            "consuming {} of {} bytes",
            len,
            prod.wrapping_sub(cons)
        );

        mb();
        self.cons.store(cons.wrapping_add(len), Ordering::Relaxed);
    }

    /// Copies available bytes into `buf` and consumes them, returns the number of bytes read
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.unconsumed() as usize);

        if len == 0 || !self.peek(0, &mut buf[..len]) {
            return 0;
        }
        self.consume(len as u32);

        len
    }
}

/// Page holding an outbound and an inbound byte stream
pub trait Duplex: Sync {
    /// Stream written by this domain
    fn outbound(&self) -> Stream<'_>;

    /// Stream written by the other end
    fn inbound(&self) -> Stream<'_>;
}

/// Console page
#[repr(C)]
pub struct ConsoleInterface {
    input: UnsafeCell<[u8; 1024]>,
    output: UnsafeCell<[u8; 2048]>,
    in_cons: AtomicU32,
    in_prod: AtomicU32,
    out_cons: AtomicU32,
    out_prod: AtomicU32,
}

/// XenStore page
#[repr(C)]
pub struct XenStoreInterface {
    req: UnsafeCell<[u8; XENSTORE_RING_SIZE as usize]>,
    rsp: UnsafeCell<[u8; XENSTORE_RING_SIZE as usize]>,
    req_cons: AtomicU32,
    req_prod: AtomicU32,
    rsp_cons: AtomicU32,
    rsp_prod: AtomicU32,
}

const _: () = assert!(size_of::<ConsoleInterface>() == size_of::<xencons_interface>());
const _: () = assert!(size_of::<XenStoreInterface>() == size_of::<xenstore_domain_interface>());

// Buffers are only accessed through `Stream`, which orders them with the indices
unsafe impl Sync for ConsoleInterface {}
unsafe impl Sync for XenStoreInterface {}

macro_rules! page_view {
    ($view:ty, $raw:ty) => {
        impl $view {
            /// Creates a view of a mapped page
            ///
            /// # Safety
            ///
            /// `ptr` must point to the mapped page, which stays mapped for the rest of the program
            pub unsafe fn from_ptr(ptr: *mut $raw) -> &'static Self {
                &*(ptr as *const Self)
            }

            /// Allocates a zeroed page, used when both ends live in this domain
            pub fn new_zeroed() -> Box<Self> {
                let layout = Layout::new::<Self>();

                // SAFETY: all-zero bytes are a valid value for buffers and indices
                unsafe {
                    let ptr = alloc_zeroed(layout) as *mut Self;
                    if ptr.is_null() {
                        handle_alloc_error(layout);
                    }
                    Box::from_raw(ptr)
                }
            }
        }
    };
}

page_view!(ConsoleInterface, xencons_interface);
page_view!(XenStoreInterface, xenstore_domain_interface);

impl Duplex for ConsoleInterface {
    fn outbound(&self) -> Stream<'_> {
        Stream::new(&self.output, &self.out_cons, &self.out_prod)
    }

    fn inbound(&self) -> Stream<'_> {
        Stream::new(&self.input, &self.in_cons, &self.in_prod)
    }
}

impl Duplex for XenStoreInterface {
    fn outbound(&self) -> Stream<'_> {
        Stream::new(&self.req, &self.req_cons, &self.req_prod)
    }

    fn inbound(&self) -> Stream<'_> {
        Stream::new(&self.rsp, &self.rsp_cons, &self.rsp_prod)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, alloc::vec::Vec, memoffset::offset_of};

    #[test]
    fn layouts_match_xen() {
        assert_eq!(
            offset_of!(ConsoleInterface, out_prod),
            offset_of!(xencons_interface, out_prod)
        );
        assert_eq!(
            offset_of!(ConsoleInterface, in_cons),
            offset_of!(xencons_interface, in_cons)
        );
        assert_eq!(
            offset_of!(XenStoreInterface, rsp_prod),
            offset_of!(xenstore_domain_interface, rsp_prod)
        );
    }

    #[test]
    fn capacities() {
        let console = ConsoleInterface::new_zeroed();
        let store = XenStoreInterface::new_zeroed();

        assert_eq!(console.outbound().capacity(), 2048);
        assert_eq!(console.inbound().capacity(), 1024);
        assert_eq!(store.outbound().capacity(), 1024);
        assert_eq!(store.inbound().capacity(), 1024);
    }

    #[test]
    fn write_stops_at_capacity() {
        let store = XenStoreInterface::new_zeroed();
        let stream = store.outbound();

        assert_eq!(stream.write(&[7; 1000]), 1000);
        assert_eq!(stream.space(), 24);
        assert_eq!(stream.write(&[8; 100]), 24);
        assert_eq!(stream.space(), 0);
        assert_eq!(stream.write(b"x"), 0);

        let mut buf = [0; 1024];
        assert_eq!(stream.read(&mut buf), 1024);
        assert!(buf[..1000].iter().all(|b| *b == 7));
        assert!(buf[1000..].iter().all(|b| *b == 8));
    }

    #[test]
    fn data_wraps_around_buffer_end() {
        let store = XenStoreInterface::new_zeroed();
        let stream = store.inbound();
        let mut buf = [0; 1024];

        stream.write(&[0; 1000]);
        stream.read(&mut buf[..1000]);

        let message = (0..100).collect::<Vec<u8>>();
        assert_eq!(stream.write(&message), 100);

        let mut out = [0; 100];
        assert_eq!(stream.read(&mut out), 100);
        assert_eq!(&out[..], &message[..]);
        assert_eq!(stream.unconsumed(), 0);
    }

    #[test]
    fn peek_leaves_data_in_place() {
        let console = ConsoleInterface::new_zeroed();
        let stream = console.inbound();

        stream.write(b"header:body");

        let mut body = [0; 4];
        assert!(stream.peek(7, &mut body));
        assert_eq!(&body, b"body");
        assert!(!stream.peek(8, &mut body));
        assert_eq!(stream.unconsumed(), 11);

        stream.consume(7);

        let mut rest = [0; 8];
        assert_eq!(stream.read(&mut rest), 4);
        assert_eq!(&rest[..4], b"body");
    }

    #[test]
    fn indices_wrap_at_32_bits() {
        let console = ConsoleInterface::new_zeroed();
        console.out_cons.store(u32::MAX - 2, Ordering::SeqCst);
        console.out_prod.store(u32::MAX - 2, Ordering::SeqCst);
        let stream = console.outbound();

        assert_eq!(stream.write(b"wrapped"), 7);
        assert_eq!(console.out_prod.load(Ordering::SeqCst), 4);
        assert_eq!(stream.unconsumed(), 7);

        let mut buf = [0; 7];
        assert_eq!(stream.read(&mut buf), 7);
        assert_eq!(&buf, b"wrapped");
    }

    #[test]
    #[should_panic]
    fn corrupt_indices_are_fatal() {
        let console = ConsoleInterface::new_zeroed();
        console.in_prod.store(1025, Ordering::SeqCst);

        console.inbound().unconsumed();
    }
}
