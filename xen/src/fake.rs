//! Software hypervisor and idle source used by the unit tests

use {
    crate::{
        hypercall::{Error, Hypervisor},
        scheduler::Idle,
        shared_info::SharedInfo,
    },
    alloc::{boxed::Box, sync::Arc, vec::Vec},
    core::{
        slice,
        sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    spin::Mutex,
    xen_sys::{
        evtchn_alloc_unbound_t, evtchn_bind_interdomain_t, evtchn_bind_virq_t, evtchn_close_t,
        evtchn_port_t, evtchn_send_t, gnttab_dump_table_t, gnttab_map_grant_ref_t,
        gnttab_query_size_t, gnttab_setup_table_t, gnttab_unmap_grant_ref_t, sched_poll_t,
        CONSOLEIO_write, EVTCHNOP_alloc_unbound, EVTCHNOP_bind_interdomain, EVTCHNOP_bind_virq,
        EVTCHNOP_close, EVTCHNOP_send, GNTST_okay, GNTTABOP_dump_table, GNTTABOP_map_grant_ref,
        GNTTABOP_query_size, GNTTABOP_setup_table, GNTTABOP_unmap_grant_ref, SCHEDOP_poll,
    },
};

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Records hypercalls and plays the hypervisor's part of the shared info page
pub(crate) struct FakeHypervisor {
    pub shared: &'static SharedInfo,
    next_port: AtomicU32,
    pub fail_close: AtomicBool,
    pub closed: Mutex<Vec<evtchn_port_t>>,
    pub sent: Mutex<Vec<evtchn_port_t>>,
    pub bound_virqs: Mutex<Vec<u32>>,
    pub setup_frames: Mutex<Vec<u32>>,
    pub sched_ops: Mutex<Vec<u32>>,
    pub polled: Mutex<Vec<Vec<evtchn_port_t>>>,
    pub console: Mutex<Vec<u8>>,
    send_hooks: Mutex<Vec<(evtchn_port_t, Hook)>>,
}

impl FakeHypervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Box::leak(SharedInfo::new_zeroed()),
            next_port: AtomicU32::new(1),
            fail_close: AtomicBool::new(false),
            closed: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            bound_virqs: Mutex::new(Vec::new()),
            setup_frames: Mutex::new(Vec::new()),
            sched_ops: Mutex::new(Vec::new()),
            polled: Mutex::new(Vec::new()),
            console: Mutex::new(Vec::new()),
            send_hooks: Mutex::new(Vec::new()),
        })
    }

    /// Runs `hook` every time the guest notifies `port`
    pub fn on_send<F: Fn() + Send + Sync + 'static>(&self, port: evtchn_port_t, hook: F) {
        self.send_hooks.lock().push((port, Arc::new(hook)));
    }

    fn allocate_port(&self) -> evtchn_port_t {
        self.next_port.fetch_add(1, Ordering::SeqCst)
    }
}

impl Hypervisor for FakeHypervisor {
    unsafe fn event_channel_op(&self, cmd: u32, arg: u64) -> Result<u64, Error> {
        match cmd {
            EVTCHNOP_bind_virq => {
                let op = &mut *(arg as *mut evtchn_bind_virq_t);
                self.bound_virqs.lock().push(op.virq);
                op.port = self.allocate_port();
            }
            EVTCHNOP_bind_interdomain => {
                let op = &mut *(arg as *mut evtchn_bind_interdomain_t);
                op.local_port = self.allocate_port();
            }
            EVTCHNOP_alloc_unbound => {
                let op = &mut *(arg as *mut evtchn_alloc_unbound_t);
                op.port = self.allocate_port();
            }
            EVTCHNOP_close => {
                let op = &*(arg as *const evtchn_close_t);
                if self.fail_close.load(Ordering::SeqCst) {
                    return Err(Error::InvalidArgument);
                }
                self.closed.lock().push(op.port);
            }
            EVTCHNOP_send => {
                let port = (*(arg as *const evtchn_send_t)).port;
                self.sent.lock().push(port);

                let hooks = self
                    .send_hooks
                    .lock()
                    .iter()
                    .filter(|(p, _)| *p == port)
                    .map(|(_, hook)| hook.clone())
                    .collect::<Vec<_>>();
                for hook in hooks {
                    hook();
                }
            }
            _ => return Err(Error::NotImplemented),
        }

        Ok(0)
    }

    unsafe fn grant_table_op(&self, cmd: u32, arg: u64, count: u32) -> Result<u64, Error> {
        assert_eq!(count, 1);

        match cmd {
            GNTTABOP_setup_table => {
                let op = &mut *(arg as *mut gnttab_setup_table_t);
                self.setup_frames.lock().push(op.nr_frames);
                let frames = slice::from_raw_parts_mut(op.frame_list, op.nr_frames as usize);
                for (i, frame) in frames.iter_mut().enumerate() {
                    *frame = 0x1000 + i as u64;
                }
                op.status = GNTST_okay;
            }
            GNTTABOP_query_size => {
                let op = &mut *(arg as *mut gnttab_query_size_t);
                op.nr_frames = 4;
                op.max_nr_frames = 32;
                op.status = GNTST_okay;
            }
            GNTTABOP_dump_table => {
                (*(arg as *mut gnttab_dump_table_t)).status = GNTST_okay;
            }
            GNTTABOP_map_grant_ref => {
                let op = &mut *(arg as *mut gnttab_map_grant_ref_t);
                op.handle = op.ref_;
                op.status = GNTST_okay;
            }
            GNTTABOP_unmap_grant_ref => {
                (*(arg as *mut gnttab_unmap_grant_ref_t)).status = GNTST_okay;
            }
            _ => return Err(Error::NotImplemented),
        }

        Ok(0)
    }

    unsafe fn sched_op(&self, cmd: u32, arg: u64) -> Result<u64, Error> {
        self.sched_ops.lock().push(cmd);

        if cmd == SCHEDOP_poll {
            let op = &*(arg as *const sched_poll_t);
            let ports = slice::from_raw_parts(op.ports, op.nr_ports as usize);
            self.polled.lock().push(ports.to_vec());
        }

        Ok(0)
    }

    unsafe fn console_io(&self, cmd: u32, len: u32, buf: *mut u8) -> Result<u64, Error> {
        if cmd != CONSOLEIO_write {
            return Err(Error::NotImplemented);
        }

        self.console
            .lock()
            .extend_from_slice(slice::from_raw_parts(buf, len as usize));

        Ok(0)
    }
}

/// Idle source with a manually advanced clock
#[derive(Default)]
pub(crate) struct FakeIdle {
    pub now: AtomicU64,
    pub blocks: AtomicUsize,
    on_block: Mutex<Option<Hook>>,
}

impl FakeIdle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs `hook` whenever the scheduler idles the domain
    pub fn on_block<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        *self.on_block.lock() = Some(Arc::new(hook));
    }
}

impl Idle for FakeIdle {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn block_until(&self, deadline: u64) {
        self.blocks.fetch_add(1, Ordering::SeqCst);
        self.now.fetch_max(deadline, Ordering::SeqCst);

        let hook = self.on_block.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}
