//! Virtual machine scheduler interface

use {
    crate::hypercall::{Error, Hypervisor},
    xen_sys::{
        domid_t, evtchn_port_t, sched_pin_override_t, sched_poll_t, sched_remote_shutdown_t,
        sched_shutdown_t, sched_watchdog_t, SCHEDOP_block, SCHEDOP_pin_override, SCHEDOP_poll,
        SCHEDOP_remote_shutdown, SCHEDOP_shutdown, SCHEDOP_shutdown_code, SCHEDOP_watchdog,
        SCHEDOP_yield, SHUTDOWN_crash, SHUTDOWN_poweroff, SHUTDOWN_reboot, SHUTDOWN_suspend,
        SHUTDOWN_watchdog,
    },
};

/// Most ports Xen accepts in one poll
pub const MAX_POLL_PORTS: usize = 128;

/// Scheduling command
#[derive(Debug)]
pub enum Command<'a> {
    /// Yield remaining of domain's quantum
    Yield,

    /// Deschedule domain until event is received
    Block,

    /// "Halt execution of this domain (all VCPUs) and notify the system controller."
    Shutdown(ShutdownReason),

    /// "Poll a set of event-channel ports. Return when one or more are pending"
    Poll {
        /// Event-channel ports, only the first [`MAX_POLL_PORTS`] are polled
        ports: &'a [evtchn_port_t],
        /// System time in nanoseconds at which the poll gives up, 0 waits forever
        timeout: u64,
    },

    /// "Declare a shutdown for another domain."
    RemoteShutdown {
        /// Remote domain ID
        domain_id: domid_t,
        /// Reason for shutdown
        reason: ShutdownReason,
    },

    /// "Latch a shutdown code, so that when the domain later shuts down it
    /// reports this code to the control tools"
    ShutdownCode(ShutdownReason),

    /// "Setup, poke and destroy a domain watchdog timer."
    ///
    /// With `id == 0` a new timer is set up and its id returned, a zero `timeout` destroys timer
    /// `id`, anything else pokes it.
    Watchdog {
        /// ID of watchdog timer
        id: u32,
        /// Timeout in seconds
        timeout: u32,
    },

    /// "Override the current vcpu affinity by pinning it to one physical cpu or
    /// undo this override restoring the previous affinity."
    PinOverride {
        /// Physical CPU ID to pin to, negative to undo
        pcpu: i32,
    },
}

/// Reasons for `Command::Shutdown`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// "Domain exited normally. Clean up and kill."
    Poweroff = SHUTDOWN_poweroff as isize,
    /// "Clean up, kill, and then restart."
    Reboot = SHUTDOWN_reboot as isize,
    /// "Clean up, save suspend info, kill."
    Suspend = SHUTDOWN_suspend as isize,
    /// "Tell controller we've crashed."
    Crash = SHUTDOWN_crash as isize,
    /// "Restart because watchdog time expired."
    Watchdog = SHUTDOWN_watchdog as isize,
}

/// Issues `cmd` through `hypervisor`
pub fn schedule_operation(hypervisor: &dyn Hypervisor, cmd: Command) -> Result<u64, Error> {
    unsafe {
        match cmd {
            Command::Yield => hypervisor.sched_op(SCHEDOP_yield, 0),
            Command::Block => hypervisor.sched_op(SCHEDOP_block, 0),
            Command::Shutdown(reason) => {
                let arg = sched_shutdown_t {
                    reason: reason as u32,
                };

                hypervisor.sched_op(SCHEDOP_shutdown, &arg as *const sched_shutdown_t as u64)
            }
            Command::Poll { ports, timeout } => {
                // Xen rejects longer lists; any event wakes a poll of several ports anyway
                let ports = &ports[..ports.len().min(MAX_POLL_PORTS)];
                let arg = sched_poll_t {
                    ports: ports.as_ptr() as *mut evtchn_port_t,
                    nr_ports: ports.len() as u32,
                    timeout,
                };

                hypervisor.sched_op(SCHEDOP_poll, &arg as *const sched_poll_t as u64)
            }
            Command::RemoteShutdown { domain_id, reason } => {
                let arg = sched_remote_shutdown_t {
                    domain_id,
                    reason: reason as u32,
                };

                hypervisor.sched_op(
                    SCHEDOP_remote_shutdown,
                    &arg as *const sched_remote_shutdown_t as u64,
                )
            }
            Command::ShutdownCode(reason) => {
                let arg = sched_shutdown_t {
                    reason: reason as u32,
                };

                hypervisor.sched_op(
                    SCHEDOP_shutdown_code,
                    &arg as *const sched_shutdown_t as u64,
                )
            }
            Command::Watchdog { id, timeout } => {
                let arg = sched_watchdog_t { id, timeout };

                hypervisor.sched_op(SCHEDOP_watchdog, &arg as *const sched_watchdog_t as u64)
            }
            Command::PinOverride { pcpu } => {
                let arg = sched_pin_override_t { pcpu };

                hypervisor.sched_op(
                    SCHEDOP_pin_override,
                    &arg as *const sched_pin_override_t as u64,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::fake::FakeHypervisor, alloc::vec::Vec};

    #[test]
    fn poll_passes_ports() {
        let hv = FakeHypervisor::new();

        schedule_operation(
            &*hv,
            Command::Poll {
                ports: &[3, 5],
                timeout: 10,
            },
        )
        .unwrap();
        schedule_operation(&*hv, Command::Yield).unwrap();

        assert_eq!(*hv.sched_ops.lock(), vec![SCHEDOP_poll, SCHEDOP_yield]);
        assert_eq!(*hv.polled.lock(), vec![vec![3, 5]]);
    }

    #[test]
    fn poll_is_limited_to_what_xen_accepts() {
        let hv = FakeHypervisor::new();
        let ports = (0..300).collect::<Vec<evtchn_port_t>>();

        schedule_operation(
            &*hv,
            Command::Poll {
                ports: &ports,
                timeout: 0,
            },
        )
        .unwrap();

        let polled = hv.polled.lock();
        assert_eq!(polled[0].len(), MAX_POLL_PORTS);
        assert_eq!(polled[0][..], ports[..MAX_POLL_PORTS]);
    }

    #[test]
    fn reasons_match_xen() {
        assert_eq!(ShutdownReason::Poweroff as u32, 0);
        assert_eq!(ShutdownReason::Crash as u32, 3);
    }
}
