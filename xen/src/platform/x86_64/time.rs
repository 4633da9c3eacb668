//! x86_64 Xen time

use {
    crate::shared_info::SharedInfo,
    core::{
        arch::x86_64::_rdtsc,
        hint::spin_loop,
        sync::atomic::{fence, Ordering},
    },
};

/// Gets the number of nanoseconds since the domain booted
pub fn system_time(shared: &SharedInfo) -> u64 {
    let time = &shared.vcpu().time;

    loop {
        // odd versions mean the hypervisor is halfway through an update
        let version = time.version.load(Ordering::Acquire);
        if version & 1 == 1 {
            spin_loop();
            continue;
        }

        let system_time = time.system_time.load(Ordering::Relaxed);
        let old_tsc = time.tsc_timestamp.load(Ordering::Relaxed);
        let mul = time.tsc_to_system_mul.load(Ordering::Relaxed);
        let shift = time.tsc_shift.load(Ordering::Relaxed);

        fence(Ordering::Acquire);
        if version != time.version.load(Ordering::Relaxed) {
            continue;
        }

        let mut delta = unsafe { _rdtsc() }.wrapping_sub(old_tsc);
        if shift < 0 {
            delta >>= -shift;
        } else {
            delta <<= shift;
        }

        return system_time + ((u128::from(delta) * u128::from(mul)) >> 32) as u64;
    }
}

/// Gets the current time as the number of nanoseconds since 1970-01-01 00:00:00 UTC
///
/// Using 64 bit nanosecond timestamps will break on July 21st 2554.
pub fn wall_clock(shared: &SharedInfo) -> u64 {
    loop {
        let version = shared.wc_version.load(Ordering::Acquire);
        if version & 1 == 1 {
            spin_loop();
            continue;
        }

        let seconds = shared.wc_sec.load(Ordering::Relaxed);
        let nanoseconds = shared.wc_nsec.load(Ordering::Relaxed);

        fence(Ordering::Acquire);
        if version != shared.wc_version.load(Ordering::Relaxed) {
            continue;
        }

        return u64::from(seconds) * 1_000_000_000 + u64::from(nanoseconds) + system_time(shared);
    }
}
