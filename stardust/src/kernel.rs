//! The core subsystems of the running domain, wired together at boot

use {
    alloc::{boxed::Box, sync::Arc},
    core::hint::spin_loop,
    displaydoc::Display,
    lazy_static::lazy_static,
    log::{debug, error, info, warn},
    xen::{
        console,
        events::EventChannels,
        grant_table::{self, GrantTable},
        hypercall::{self, Hypervisor, Xen},
        memory::{MachineFrameNumber, VirtualAddress},
        platform::time::system_time,
        ring::XenStoreInterface,
        scheduler::{
            operation::{schedule_operation, Command, ShutdownReason},
            Idle, Scheduler,
        },
        shared_info::SharedInfo,
        xen_sys::{start_info, xenstore_domain_interface},
        xenstore::{self, XenStore},
        START_INFO,
    },
};

lazy_static! {
    /// The running kernel
    pub static ref KERNEL: Kernel = {
        // SAFETY: `launch` records the start info page before the first access
        match unsafe { Kernel::boot(START_INFO) } {
            Ok(kernel) => kernel,
            Err(e) => panic!("kernel initialisation failed: {}", e),
        }
    };
}

/// Brings up the kernel subsystems
pub fn init() {
    lazy_static::initialize(&KERNEL);
}

/// Boot failure
#[derive(Debug, Display)]
pub enum Error {
    /// Mapping the shared info page failed: {0}
    SharedInfo(hypercall::Error),
    /// Grant table setup failed: {0}
    GrantTable(grant_table::Error),
    /// XenStore connection failed: {0}
    XenStore(xenstore::Error),
}

impl From<grant_table::Error> for Error {
    fn from(e: grant_table::Error) -> Self {
        Self::GrantTable(e)
    }
}

impl From<xenstore::Error> for Error {
    fn from(e: xenstore::Error) -> Self {
        Self::XenStore(e)
    }
}

/// Handles to every subsystem of this domain
pub struct Kernel {
    /// Hypercall interface
    pub hypervisor: Arc<dyn Hypervisor>,
    /// Shared info page
    pub shared: &'static SharedInfo,
    /// Event channels
    pub events: Arc<EventChannels>,
    /// Grant table
    pub grant_table: GrantTable,
    /// Thread scheduler
    pub scheduler: Arc<Scheduler>,
    /// XenStore client
    pub xenstore: Arc<XenStore>,
}

impl Kernel {
    /// Maps the shared info page and sets up each subsystem in dependency order
    ///
    /// # Safety
    ///
    /// `start_info` must point to the start info page and this must run once
    unsafe fn boot(start_info: *mut start_info) -> Result<Self, Error> {
        let hypervisor: Arc<dyn Hypervisor> = Arc::new(Xen);

        let shared = xen::init_info(start_info).map_err(Error::SharedInfo)?;
        debug!("shared info mapped at {:p}", shared);

        let events = Arc::new(EventChannels::new(hypervisor.clone(), shared));
        events.init();

        let grant_table = grant_table::init(&*hypervisor)?;
        info!(
            "grant table ready, {} of {} entries free",
            grant_table.free_count(),
            grant_table.capacity()
        );

        let scheduler = Scheduler::new(Box::new(DomainIdle {
            hypervisor: hypervisor.clone(),
            events: events.clone(),
        }));

        let store_page = VirtualAddress::from(MachineFrameNumber((*start_info).store_mfn as usize));
        let ring = XenStoreInterface::from_ptr(store_page.0 as *mut xenstore_domain_interface);
        let xenstore = XenStore::new(
            ring,
            (*start_info).store_evtchn,
            events.clone(),
            scheduler.clone(),
        )?;

        Ok(Self {
            hypervisor,
            shared,
            events,
            grant_table,
            scheduler,
            xenstore,
        })
    }

    /// Nanoseconds since the domain booted
    pub fn now(&self) -> u64 {
        system_time(self.shared)
    }

    /// Closes every event channel but XenStore's and shuts the domain down
    pub fn shutdown(&self, reason: ShutdownReason) -> ! {
        info!("shutting down: {:?}", reason);

        self.events.unbind_all(&[self.xenstore.port()]);
        console::flush();

        if let Err(e) = schedule_operation(&*self.hypervisor, Command::Shutdown(reason)) {
            error!("shutdown failed: {}", e);
        }

        loop {
            spin_loop();
        }
    }
}

/// Idles the domain by polling the bound ports
///
/// Upcalls stay masked, pending events are dispatched once the poll returns.
struct DomainIdle {
    hypervisor: Arc<dyn Hypervisor>,
    events: Arc<EventChannels>,
}

impl Idle for DomainIdle {
    fn now(&self) -> u64 {
        system_time(self.events.shared_info())
    }

    fn block_until(&self, deadline: u64) {
        let ports = self.events.bound_ports();

        if let Err(e) = schedule_operation(
            &*self.hypervisor,
            Command::Poll {
                ports: &ports,
                timeout: deadline,
            },
        ) {
            warn!("poll of {} ports failed: {}", ports.len(), e);
        }

        self.events.force_callback();
    }
}
