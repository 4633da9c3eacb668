//! Interface to Xen event channels
//!
//! Ports are bound through hypercalls and delivered through the pending and
//! mask bitmaps of the shared info page. A port is dispatched only while it
//! is pending and not masked; binding leaves a port masked until its owner
//! has registered a handler and calls [`EventChannels::unmask`].

use {
    crate::{
        hypercall::{self, Hypervisor},
        shared_info::{split_port, SharedInfo, BITS_PER_WORD, EVENT_WORDS},
        DOMID_SELF,
    },
    alloc::{sync::Arc, vec, vec::Vec},
    core::sync::atomic::{AtomicUsize, Ordering},
    displaydoc::Display,
    log::{trace, warn},
    spin::Mutex,
    xen_sys::{
        domid_t, evtchn_alloc_unbound_t, evtchn_bind_interdomain_t, evtchn_bind_virq_t,
        evtchn_close_t, evtchn_port_t, evtchn_send_t, EVTCHNOP_alloc_unbound,
        EVTCHNOP_bind_interdomain, EVTCHNOP_bind_virq, EVTCHNOP_close, EVTCHNOP_send,
    },
};

/// Event channel port
pub type Port = evtchn_port_t;

/// Number of event channel ports
pub const NUM_EVENT_PORTS: usize = 1024;

/// Function invoked when an event arrives on a port
///
/// Handlers run to completion from the event callback: they may set flags,
/// queue data or wake threads, but must not block.
pub type Handler = Arc<dyn Fn(Port) + Send + Sync>;

/// Event channel error
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Event channel hypercall failed: {0}
    Hypercall(hypercall::Error),
    /// Port {0} is outside the supported range
    PortOutOfRange(Port),
}

impl From<hypercall::Error> for Error {
    fn from(e: hypercall::Error) -> Self {
        Self::Hypercall(e)
    }
}

/// Action associated with a port
#[derive(Clone, Default)]
struct EventAction {
    handler: Option<Handler>,
    count: u32,
}

/// Event channels of one domain
pub struct EventChannels {
    hypervisor: Arc<dyn Hypervisor>,
    shared: &'static SharedInfo,
    actions: Mutex<Vec<EventAction>>,
    bound: Mutex<Vec<bool>>,
    callback_depth: AtomicUsize,
}

impl EventChannels {
    /// Creates the event channel state over the shared info page
    pub fn new(hypervisor: Arc<dyn Hypervisor>, shared: &'static SharedInfo) -> Self {
        Self {
            hypervisor,
            shared,
            actions: Mutex::new(vec![EventAction::default(); NUM_EVENT_PORTS]),
            bound: Mutex::new(vec![false; NUM_EVENT_PORTS]),
            callback_depth: AtomicUsize::new(0),
        }
    }

    /// Masks every port
    pub fn init(&self) {
        for word in &self.shared.evtchn_mask {
            word.store(u64::MAX, Ordering::SeqCst);
        }
        trace!("masked all {} event ports", EVENT_WORDS * BITS_PER_WORD);
    }

    /// Shared info page the ports are delivered through
    pub fn shared_info(&self) -> &'static SharedInfo {
        self.shared
    }

    /// Binds a virtual IRQ of vCPU 0 to a fresh port
    pub fn bind_virq(&self, virq: u32) -> Result<Port, Error> {
        let mut op = evtchn_bind_virq_t {
            virq,
            vcpu: 0,
            port: 0,
        };
        unsafe { self.event_channel_op(EVTCHNOP_bind_virq, &mut op as *mut _ as u64) }?;

        trace!("bound virq {} to port {}", virq, op.port);
        Ok(op.port)
    }

    /// Connects a fresh local port to `remote_port` of `remote_domain`
    pub fn bind_interdomain(&self, remote_domain: domid_t, remote_port: Port) -> Result<Port, Error> {
        let mut op = evtchn_bind_interdomain_t {
            remote_dom: remote_domain,
            remote_port,
            local_port: 0,
        };
        unsafe { self.event_channel_op(EVTCHNOP_bind_interdomain, &mut op as *mut _ as u64) }?;

        Ok(op.local_port)
    }

    /// Allocates a port that `remote_domain` can later bind to
    pub fn alloc_unbound(&self, remote_domain: domid_t) -> Result<Port, Error> {
        let mut op = evtchn_alloc_unbound_t {
            dom: DOMID_SELF,
            remote_dom: remote_domain,
            port: 0,
        };
        unsafe { self.event_channel_op(EVTCHNOP_alloc_unbound, &mut op as *mut _ as u64) }?;

        Ok(op.port)
    }

    /// Registers the handler of `port`, replacing any previous one
    ///
    /// The port is left masked.
    pub fn bind_handler(&self, port: Port, handler: Handler) -> Result<(), Error> {
        let index = check_port(port)?;

        let mut actions = self.actions.lock();
        if actions[index].handler.is_some() {
            warn!("handler for port {} already registered, replacing", port);
        }
        actions[index] = EventAction {
            handler: Some(handler),
            count: 0,
        };
        drop(actions);

        self.bound.lock()[index] = true;
        Ok(())
    }

    /// Tears down `port`: mask, clear, unregister, then close it
    ///
    /// The port is abandoned even when the close hypercall fails, the failure
    /// is logged and returned.
    pub fn unbind(&self, port: Port) -> Result<(), Error> {
        let index = check_port(port)?;

        if self.actions.lock()[index].handler.is_none() {
            warn!("port {} unbound without a handler", port);
        }

        self.mask(port);
        self.clear(port);

        self.actions.lock()[index] = EventAction::default();
        self.bound.lock()[index] = false;

        let mut op = evtchn_close_t { port };
        unsafe { self.event_channel_op(EVTCHNOP_close, &mut op as *mut _ as u64) }.map_err(|e| {
            warn!("close of port {} failed: {}", port, e);
            e
        })?;

        Ok(())
    }

    /// Closes every bound port except `keep`, then clears pending upcalls
    ///
    /// Used on shutdown, `keep` usually holds the console and XenStore ports.
    pub fn unbind_all(&self, keep: &[Port]) {
        for port in self.bound_ports() {
            if keep.contains(&port) {
                continue;
            }

            // failures are already logged, keep tearing down
            let _ = self.unbind(port);
        }

        let vcpu = self.shared.vcpu();
        vcpu.evtchn_pending_sel.store(0, Ordering::SeqCst);
        vcpu.evtchn_upcall_pending.store(0, Ordering::SeqCst);
    }

    /// Ports that currently have a handler registered
    pub fn bound_ports(&self) -> Vec<Port> {
        self.bound
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, bound)| **bound)
            .map(|(port, _)| port as Port)
            .collect()
    }

    /// Number of events delivered to `port` since its handler was registered
    pub fn count(&self, port: Port) -> u32 {
        check_port(port)
            .map(|index| self.actions.lock()[index].count)
            .unwrap_or(0)
    }

    /// Stops delivery of `port`
    pub fn mask(&self, port: Port) {
        let (word, bit) = match port_bit(port) {
            Some(bit) => bit,
            None => return,
        };
        self.shared.evtchn_mask[word].fetch_or(bit, Ordering::SeqCst);
    }

    /// Allows delivery of `port`
    ///
    /// An event that arrived while the port was masked is raised again so
    /// that it is not lost; if upcalls are enabled it is delivered before
    /// this returns.
    pub fn unmask(&self, port: Port) {
        let (word, bit) = match port_bit(port) {
            Some(bit) => bit,
            None => return,
        };
        let vcpu = self.shared.vcpu();

        self.shared.evtchn_mask[word].fetch_and(!bit, Ordering::SeqCst);

        if self.shared.evtchn_pending[word].load(Ordering::SeqCst) & bit == 0 {
            return;
        }

        let sel = 1 << word;
        if vcpu.evtchn_pending_sel.fetch_or(sel, Ordering::SeqCst) & sel == 0 {
            vcpu.evtchn_upcall_pending.store(1, Ordering::SeqCst);
            if vcpu.evtchn_upcall_mask.load(Ordering::SeqCst) == 0 {
                self.force_callback();
            }
        }
    }

    /// Clears the pending bit of `port`
    pub fn clear(&self, port: Port) {
        let (word, bit) = match port_bit(port) {
            Some(bit) => bit,
            None => return,
        };
        self.shared.evtchn_pending[word].fetch_and(!bit, Ordering::SeqCst);
    }

    /// Whether `port` has an undelivered event
    pub fn is_pending(&self, port: Port) -> bool {
        port_bit(port).map_or(false, |(word, bit)| {
            self.shared.evtchn_pending[word].load(Ordering::SeqCst) & bit != 0
        })
    }

    /// Whether `port` is masked
    pub fn is_masked(&self, port: Port) -> bool {
        port_bit(port).map_or(true, |(word, bit)| {
            self.shared.evtchn_mask[word].load(Ordering::SeqCst) & bit != 0
        })
    }

    /// Signals the remote end of `port`
    pub fn notify(&self, port: Port) -> Result<(), Error> {
        let mut op = evtchn_send_t { port };
        unsafe { self.event_channel_op(EVTCHNOP_send, &mut op as *mut _ as u64) }?;
        Ok(())
    }

    /// Whether an event handler is running
    pub fn in_callback(&self) -> bool {
        self.callback_depth.load(Ordering::SeqCst) != 0
    }

    /// Delivers every pending, unmasked port to its handler
    ///
    /// This is the body of the hypervisor upcall. Handlers may re-enter it,
    /// each word is re-read after every handler so nothing is delivered twice.
    pub fn dispatch(&self) {
        let vcpu = self.shared.vcpu();

        self.callback_depth.fetch_add(1, Ordering::SeqCst);
        vcpu.evtchn_upcall_pending.store(0, Ordering::SeqCst);

        let mut selector = vcpu.evtchn_pending_sel.swap(0, Ordering::SeqCst);
        while selector != 0 {
            let word = selector.trailing_zeros() as usize;
            selector &= !(1 << word);

            loop {
                let active = self.shared.evtchn_pending[word].load(Ordering::SeqCst)
                    & !self.shared.evtchn_mask[word].load(Ordering::SeqCst);
                if active == 0 {
                    break;
                }

                let bit = active.trailing_zeros() as usize;
                let port = (word * BITS_PER_WORD + bit) as Port;
                self.do_event(port);
            }
        }

        self.callback_depth.fetch_sub(1, Ordering::SeqCst);
    }

    /// Runs the callback while the hypervisor reports a pending upcall
    pub fn force_callback(&self) {
        let vcpu = self.shared.vcpu();

        while vcpu.evtchn_upcall_pending.load(Ordering::SeqCst) != 0 {
            let save = vcpu.evtchn_upcall_mask.swap(1, Ordering::SeqCst);
            self.dispatch();
            vcpu.evtchn_upcall_mask.store(save, Ordering::SeqCst);
        }
    }

    fn do_event(&self, port: Port) {
        // taken from the bitmap, so in bounds even when beyond the supported ports
        let (word, bit) = split_port(port);
        self.shared.evtchn_pending[word].fetch_and(!bit, Ordering::SeqCst);

        let index = match check_port(port) {
            Ok(index) => index,
            Err(_) => {
                warn!("event on port {} dropped, out of range", port);
                return;
            }
        };

        let handler = {
            let mut actions = self.actions.lock();
            actions[index].count += 1;
            actions[index].handler.clone()
        };

        match handler {
            Some(handler) => handler(port),
            None => trace!("received event on port {}", port),
        }
    }

    unsafe fn event_channel_op(&self, cmd: u32, arg: u64) -> Result<u64, hypercall::Error> {
        self.hypervisor.event_channel_op(cmd, arg)
    }
}

/// Bitmap position of `port`, out of range ports are logged and ignored
fn port_bit(port: Port) -> Option<(usize, u64)> {
    match check_port(port) {
        Ok(_) => Some(split_port(port)),
        Err(e) => {
            warn!("ignoring {}", e);
            None
        }
    }
}

fn check_port(port: Port) -> Result<usize, Error> {
    let index = port as usize;
    if index < NUM_EVENT_PORTS {
        Ok(index)
    } else {
        Err(Error::PortOutOfRange(port))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::fake::FakeHypervisor,
        core::sync::atomic::{AtomicU32, Ordering},
        xen_sys::VIRQ_TIMER,
    };

    fn setup() -> (Arc<FakeHypervisor>, Arc<EventChannels>) {
        let hv = FakeHypervisor::new();
        let events = Arc::new(EventChannels::new(hv.clone(), hv.shared));
        events.init();
        (hv, events)
    }

    fn counter() -> (Arc<AtomicU32>, Handler) {
        let calls = Arc::new(AtomicU32::new(0));
        let inner = calls.clone();
        (
            calls,
            Arc::new(move |_: Port| {
                inner.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn init_masks_every_port() {
        let (_, events) = setup();

        assert!(events.is_masked(0));
        assert!(events.is_masked(NUM_EVENT_PORTS as Port - 1));
    }

    #[test]
    fn bound_virq_runs_handler_once_and_clears_pending() {
        let (hv, events) = setup();
        let (calls, handler) = counter();

        let port = events.bind_virq(VIRQ_TIMER).unwrap();
        assert_eq!(*hv.bound_virqs.lock(), vec![VIRQ_TIMER]);
        assert!(events.is_masked(port));

        events.bind_handler(port, handler).unwrap();
        events.unmask(port);

        hv.shared.raise(port);
        events.dispatch();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.count(port), 1);
        assert!(!events.is_pending(port));

        events.dispatch();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unmask_delivers_event_raised_while_masked() {
        let (hv, events) = setup();
        let (calls, handler) = counter();

        let port = events.alloc_unbound(0).unwrap();
        events.bind_handler(port, handler).unwrap();

        hv.shared.raise(port);
        assert_eq!(hv.shared.vcpu().evtchn_upcall_pending.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        events.unmask(port);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!events.is_pending(port));
    }

    #[test]
    fn unmask_with_upcalls_masked_defers_to_forced_callback() {
        let (hv, events) = setup();
        let (calls, handler) = counter();

        let port = events.alloc_unbound(0).unwrap();
        events.bind_handler(port, handler).unwrap();
        hv.shared.raise(port);

        hv.shared.vcpu().evtchn_upcall_mask.store(1, Ordering::SeqCst);
        events.unmask(port);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(hv.shared.vcpu().evtchn_upcall_pending.load(Ordering::SeqCst), 1);

        events.force_callback();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hv.shared.vcpu().evtchn_upcall_mask.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mask_and_unmask_leave_pending_untouched() {
        let (hv, events) = setup();
        let port = events.alloc_unbound(0).unwrap();

        hv.shared.evtchn_pending[0].fetch_or(1 << port, Ordering::SeqCst);
        hv.shared.vcpu().evtchn_upcall_mask.store(1, Ordering::SeqCst);

        events.mask(port);
        events.mask(port);
        assert!(events.is_masked(port));
        assert!(events.is_pending(port));

        events.unmask(port);
        events.unmask(port);
        assert!(!events.is_masked(port));
        assert!(events.is_pending(port));
    }

    #[test]
    fn masked_ports_are_not_dispatched() {
        let (hv, events) = setup();
        let (calls, handler) = counter();

        let port = events.bind_virq(VIRQ_TIMER).unwrap();
        events.bind_handler(port, handler).unwrap();

        hv.shared.evtchn_pending[0].fetch_or(1 << port, Ordering::SeqCst);
        hv.shared.vcpu().evtchn_pending_sel.store(1, Ordering::SeqCst);
        events.dispatch();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(events.is_pending(port));
    }

    #[test]
    fn handlers_may_unmask_other_ports_reentrantly() {
        let (hv, events) = setup();
        let (inner_calls, inner) = counter();

        let outer_port = events.alloc_unbound(0).unwrap();
        let inner_port = events.alloc_unbound(0).unwrap();
        events.bind_handler(inner_port, inner).unwrap();

        let outer_calls = Arc::new(AtomicU32::new(0));
        let (evs, calls) = (events.clone(), outer_calls.clone());
        events
            .bind_handler(
                outer_port,
                Arc::new(move |_: Port| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    evs.unmask(inner_port);
                }),
            )
            .unwrap();

        hv.shared.raise(inner_port);
        events.unmask(outer_port);
        hv.shared.raise(outer_port);
        events.dispatch();

        assert_eq!(outer_calls.load(Ordering::SeqCst), 1);
        assert_eq!(inner_calls.load(Ordering::SeqCst), 1);
        assert!(!events.is_pending(inner_port));
    }

    #[test]
    fn rebinding_replaces_handler() {
        let (hv, events) = setup();
        let (first, first_handler) = counter();
        let (second, second_handler) = counter();

        let port = events.alloc_unbound(0).unwrap();
        events.bind_handler(port, first_handler).unwrap();
        events.bind_handler(port, second_handler).unwrap();
        events.unmask(port);

        hv.shared.raise(port);
        events.dispatch();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unbind_tears_down_even_when_close_fails() {
        let (hv, events) = setup();
        let (calls, handler) = counter();

        let port = events.bind_interdomain(0, 7).unwrap();
        events.bind_handler(port, handler).unwrap();
        events.unmask(port);
        hv.shared.evtchn_pending[0].fetch_or(1 << port, Ordering::SeqCst);

        hv.fail_close.store(true, Ordering::SeqCst);
        assert_eq!(
            events.unbind(port),
            Err(Error::Hypercall(hypercall::Error::InvalidArgument))
        );

        assert!(events.is_masked(port));
        assert!(!events.is_pending(port));
        assert!(events.bound_ports().is_empty());

        hv.shared.raise(port);
        events.dispatch();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unbind_all_keeps_requested_ports() {
        let (hv, events) = setup();

        let ports = (0..3)
            .map(|_| {
                let port = events.alloc_unbound(0).unwrap();
                events.bind_handler(port, Arc::new(|_: Port| {})).unwrap();
                port
            })
            .collect::<Vec<_>>();

        events.unbind_all(&[ports[1]]);

        assert_eq!(events.bound_ports(), vec![ports[1]]);
        assert_eq!(*hv.closed.lock(), vec![ports[0], ports[2]]);
    }

    #[test]
    fn out_of_range_ports_are_rejected() {
        let (_, events) = setup();

        assert_eq!(
            events.bind_handler(NUM_EVENT_PORTS as Port, Arc::new(|_: Port| {})),
            Err(Error::PortOutOfRange(NUM_EVENT_PORTS as Port))
        );
    }

    #[test]
    fn events_beyond_supported_ports_are_dropped() {
        let (hv, events) = setup();
        let port = NUM_EVENT_PORTS as Port + 5;
        let (word, bit) = split_port(port);

        // bypass the range check of `unmask`
        hv.shared.evtchn_mask[word].fetch_and(!bit, Ordering::SeqCst);
        hv.shared.raise(port);
        events.dispatch();

        assert_eq!(hv.shared.evtchn_pending[word].load(Ordering::SeqCst) & bit, 0);
        assert_eq!(events.count(port), 0);
    }

    #[test]
    fn bitmap_operations_ignore_out_of_range_ports() {
        let (hv, events) = setup();

        for port in [NUM_EVENT_PORTS as Port, 4096, 5000, Port::MAX] {
            events.mask(port);
            events.unmask(port);
            events.clear(port);
            assert!(!events.is_pending(port));
            assert!(events.is_masked(port));
        }

        assert_eq!(hv.shared.vcpu().evtchn_upcall_pending.load(Ordering::SeqCst), 0);
        assert!(events.is_masked(NUM_EVENT_PORTS as Port - 1));
    }

    #[test]
    fn notify_sends_on_port() {
        let (hv, events) = setup();

        events.notify(9).unwrap();

        assert_eq!(*hv.sent.lock(), vec![9]);
    }
}
