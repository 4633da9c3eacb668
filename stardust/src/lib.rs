//! Stardust Oxide

#![no_std]
#![deny(missing_docs)]

extern crate alloc;

use {
    alloc::sync::Arc,
    core::{fmt::Write, hint::spin_loop, slice, str},
    log::{info, warn},
    xen::{
        console::{self, Console, EmergencyWriter},
        hypercall::Xen,
        memory::{MachineFrameNumber, VirtualAddress},
        platform::time::wall_clock,
        println,
        ring::ConsoleInterface,
        scheduler::operation::{schedule_operation, Command, ShutdownReason},
        sections,
        xen_sys::{start_info_t, xencons_interface},
        xenstore::XBT_NIL,
    },
};

pub mod kernel;
pub mod logger;
pub mod mm;
#[cfg(feature = "test")]
mod test;

use kernel::KERNEL;

/// Launches the kernel with the supplied pointer to the start_info structure.
pub fn launch(start_info: *mut start_info_t) -> ! {
    mm::init();

    // SAFETY: Xen hands over a valid start info page that stays mapped
    let start = unsafe {
        xen::START_INFO = start_info;
        &*start_info
    };

    console::init(unsafe { boot_console(start) });
    logger::init(logger::level_from_cmdline(command_line(start)));

    println!();
    println!("   _____ _____ _____ _____ _____ __ __ _____ _____ ");
    println!("  |   __|_   _|  _  |  _  |     |  |  |   __|_   _|");
    println!("  |__   | | | |     |    _| |   |     |__   | | |  ");
    println!("  |_____| |_| |__|__|__|__|_____|_____|_____| |_|  ");
    println!("                             █▀█ ▀▄▀ █ █▀▄ █▀▀     ");
    println!("                             █▄█ █ █ █ █▄▀ ██▄     ");
    println!();
    print_start_info(start);

    kernel::init();

    KERNEL.scheduler.create_thread("main", app_main);

    KERNEL.scheduler.run_idle_thread()
}

/// Console described by the start info page
///
/// # Safety
///
/// The console page must be mapped, which holds for the boot-time mappings Xen sets up.
unsafe fn boot_console(start: &start_info_t) -> Console {
    let console = start.console.domU;
    let page = VirtualAddress::from(MachineFrameNumber(console.mfn as usize));

    Console::new(
        ConsoleInterface::from_ptr(page.0 as *mut xencons_interface),
        console.evtchn,
        Arc::new(Xen),
    )
}

fn command_line(start: &start_info_t) -> &str {
    let bytes = unsafe {
        slice::from_raw_parts(start.cmd_line.as_ptr() as *const u8, start.cmd_line.len())
    };
    let len = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());

    str::from_utf8(&bytes[..len]).unwrap_or("")
}

fn print_start_info(start_info: &start_info_t) {
    let magic = unsafe { slice::from_raw_parts(start_info.magic.as_ptr() as *const u8, 32) };
    let magic_len = magic.iter().position(|b| *b == 0).unwrap_or(magic.len());

    println!(
        "    platform: {}",
        str::from_utf8(&magic[..magic_len]).unwrap_or("<invalid>")
    );
    println!("    image: {:#X}-{:#X}", sections::text_start(), sections::end());
    println!("    nr_pages: {}", start_info.nr_pages);
    println!("    shared_info: {:#X}", start_info.shared_info);
    println!("    pt_base: {:#X}", start_info.pt_base);
    println!("    mfn_list: {:#X}", start_info.mfn_list);
    println!("    store_mfn: {:#X}", start_info.store_mfn);
    println!("    cmd_line: {}", command_line(start_info));
    println!("    heap: {} KiB", mm::HEAP_SIZE / 1024);
}

/// Application thread
fn app_main() {
    let kernel = &*KERNEL;

    #[cfg(feature = "test")]
    test::tests(kernel);

    match kernel.xenstore.domain_id() {
        Ok(id) => info!("running as domain {}", id),
        Err(e) => warn!("could not read domain id: {}", e),
    }

    match kernel.xenstore.read(XBT_NIL, "name") {
        Ok(name) => info!("domain name: {}", name),
        Err(e) => warn!("could not read domain name: {}", e),
    }

    info!(
        "uptime {}ms, wall clock {}s",
        kernel.now() / 1_000_000,
        wall_clock(kernel.shared) / 1_000_000_000
    );
    kernel.scheduler.print_runqueue();

    kernel.shutdown(ShutdownReason::Poweroff)
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    // the console ring may be held or corrupt, Xen's own console always works
    let _ = writeln!(EmergencyWriter(&Xen), "stardust: {}", info);
    console::try_print(format_args!("{}\n", info));

    let _ = schedule_operation(&Xen, Command::Shutdown(ShutdownReason::Crash));

    loop {
        spin_loop();
    }
}
