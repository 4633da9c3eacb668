//! Console utilities

use {
    crate::{
        events::Port,
        hypercall::{self, Hypervisor},
        ring::{ConsoleInterface, Duplex},
        scheduler::operation::{schedule_operation, Command},
    },
    alloc::sync::Arc,
    core::fmt,
    spin::Mutex,
    xen_sys::{evtchn_send_t, CONSOLEIO_write, EVTCHNOP_send},
};

/// Global Xen console writer
static WRITER: Mutex<Option<Console>> = Mutex::new(None);

/// Xen console ring
pub struct Console {
    interface: &'static ConsoleInterface,
    port: Port,
    hypervisor: Arc<dyn Hypervisor>,
}

impl Console {
    /// Creates a console over the mapped console page signalled on `port`
    pub fn new(
        interface: &'static ConsoleInterface,
        port: Port,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Self {
        Self {
            interface,
            port,
            hypervisor,
        }
    }

    fn notify(&self) {
        let mut op = evtchn_send_t { port: self.port };

        // nowhere left to report a failure to
        let _ = unsafe {
            self.hypervisor
                .event_channel_op(EVTCHNOP_send, &mut op as *mut _ as u64)
        };
    }

    fn yield_domain(&self) {
        let _ = schedule_operation(&*self.hypervisor, Command::Yield);
    }

    /// Writes as much of `bytes` as fits in the ring, returns the number of bytes written
    pub fn write(&self, bytes: &[u8]) -> usize {
        let written = self.interface.outbound().write(bytes);
        if written > 0 {
            self.notify();
        }

        written
    }

    /// Writes all of `bytes`, translating `\n` to `\r\n`
    ///
    /// Yields the domain while the ring is full.
    pub fn write_all(&self, bytes: &[u8]) {
        for line in bytes.split_inclusive(|b| *b == b'\n') {
            match line.split_last() {
                Some((b'\n', text)) => {
                    self.write_fully(text);
                    self.write_fully(b"\r\n");
                }
                _ => self.write_fully(line),
            }
        }
    }

    fn write_fully(&self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let written = self.write(bytes);
            bytes = &bytes[written..];

            if written == 0 {
                self.yield_domain();
            }
        }
    }

    /// Waits until the backend has consumed everything written
    pub fn flush(&self) {
        while self.interface.outbound().unconsumed() != 0 {
            self.yield_domain();
        }
    }

    /// Number of received bytes waiting to be read
    pub fn available(&self) -> usize {
        self.interface.inbound().unconsumed() as usize
    }

    /// Reads received bytes into `buf`, returns the number of bytes read
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let read = self.interface.inbound().read(buf);
        if read > 0 {
            self.notify();
        }

        read
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_all(s.as_bytes());
        Ok(())
    }
}

/// Writes straight to the hypervisor's console, usable before the console ring is set up
pub fn emergency_write(hypervisor: &dyn Hypervisor, bytes: &[u8]) -> Result<(), hypercall::Error> {
    unsafe {
        hypervisor.console_io(
            CONSOLEIO_write,
            bytes.len() as u32,
            bytes.as_ptr() as *mut u8,
        )
    }
    .map(drop)
}

/// Formats straight to the hypervisor's console
pub struct EmergencyWriter<'a>(pub &'a dyn Hypervisor);

impl fmt::Write for EmergencyWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        emergency_write(self.0, s.as_bytes()).map_err(|_| fmt::Error)
    }
}

/// Installs `console` as the target of `print!` and the logger
pub fn init(console: Console) {
    if WRITER.lock().replace(console).is_some() {
        panic!("WRITER already initialized");
    }
}

/// Flushes the global console, if there is one
pub fn flush() {
    if let Some(console) = WRITER.lock().as_ref() {
        console.flush();
    }
}

/// Prints and returns the value of a given expression for quick and dirty debugging
#[macro_export]
macro_rules! dbg {
    () => {
        $crate::println!("[{}:{}]", core::file!(), core::line!());
    };
    ($val:expr $(,)?) => {
        match $val {
            tmp => {
                $crate::println!("[{}:{}] {} = {:#?}",
                core::file!(), core::line!(), core::stringify!($val), &tmp);
                tmp
            }
        }
    };
    ($($val:expr),+ $(,)?) => {
        ($($crate::dbg!($val)),+,)
    };
}

/// Prints to the Xen console with newline and carriage return
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Prints to the Xen console
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

/// Prints to the global console unless it is in use, returns whether the output was written
///
/// Used on the panic path, where the panicking code may be holding the console.
pub fn try_print(args: fmt::Arguments) -> bool {
    print_unless_locked(&WRITER, args)
}

fn print_unless_locked(writer: &Mutex<Option<Console>>, args: fmt::Arguments) -> bool {
    use core::fmt::Write;

    match writer.try_lock() {
        Some(mut guard) => match guard.as_mut() {
            Some(console) => console.write_fmt(args).is_ok(),
            None => false,
        },
        None => false,
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    // output before `init` is dropped
    if let Some(console) = WRITER.lock().as_mut() {
        let _ = console.write_fmt(args);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::fake::FakeHypervisor,
        alloc::{boxed::Box, vec::Vec},
        core::fmt::Write,
    };

    const PORT: Port = 2;

    fn setup() -> (Arc<FakeHypervisor>, &'static ConsoleInterface, Console) {
        let hv = FakeHypervisor::new();
        let interface: &'static ConsoleInterface = Box::leak(ConsoleInterface::new_zeroed());
        let console = Console::new(interface, PORT, hv.clone());

        (hv, interface, console)
    }

    fn drain(interface: &ConsoleInterface) -> Vec<u8> {
        let mut buf = vec![0; 4096];
        let len = interface.outbound().read(&mut buf);
        buf.truncate(len);
        buf
    }

    #[test]
    fn newlines_become_crlf() {
        let (hv, interface, mut console) = setup();

        console.write_all(b"one\ntwo\n\nthree");
        write!(console, "x={}\n", 5).unwrap();

        assert_eq!(drain(interface), b"one\r\ntwo\r\n\r\nthreex=5\r\n".to_vec());
        assert!(hv.sent.lock().iter().all(|port| *port == PORT));
    }

    #[test]
    fn write_stops_when_ring_is_full() {
        let (hv, interface, console) = setup();

        assert_eq!(console.write(&[b'a'; 3000]), 2048);
        assert_eq!(console.write(b"b"), 0);
        assert_eq!(hv.sent.lock().len(), 1);

        assert_eq!(drain(interface).len(), 2048);
    }

    #[test]
    fn write_all_waits_for_backend() {
        let (hv, interface, console) = setup();
        let received = Arc::new(Mutex::new(Vec::new()));

        let backend = received.clone();
        hv.on_send(PORT, move || backend.lock().extend(drain(interface)));

        let message = (0..5000).map(|i| b'a' + (i % 26) as u8).collect::<Vec<_>>();
        console.write_all(&message);
        console.flush();

        assert_eq!(*received.lock(), message);
        assert!(hv.sent.lock().len() >= 3);
    }

    #[test]
    fn read_consumes_input() {
        let (hv, interface, console) = setup();

        interface.inbound().write(b"ls\r");
        assert_eq!(console.available(), 3);

        let mut buf = [0; 8];
        assert_eq!(console.read(&mut buf), 3);
        assert_eq!(&buf[..3], b"ls\r");
        assert_eq!(console.available(), 0);
        assert_eq!(*hv.sent.lock(), vec![PORT]);

        assert_eq!(console.read(&mut buf), 0);
        assert_eq!(hv.sent.lock().len(), 1);
    }

    #[test]
    fn emergency_write_goes_to_hypervisor() {
        let hv = FakeHypervisor::new();

        emergency_write(&*hv, b"panic!").unwrap();

        assert_eq!(*hv.console.lock(), b"panic!".to_vec());
    }

    #[test]
    fn emergency_writer_formats() {
        let hv = FakeHypervisor::new();

        write!(EmergencyWriter(&*hv), "panicked at {}:{}", "ring.rs", 42).unwrap();

        assert_eq!(*hv.console.lock(), b"panicked at ring.rs:42".to_vec());
    }

    #[test]
    fn print_skips_console_in_use() {
        let (_, interface, console) = setup();
        let writer = Mutex::new(Some(console));

        {
            let _held = writer.lock();
            assert!(!print_unless_locked(&writer, format_args!("lost")));
        }
        assert!(drain(interface).is_empty());

        assert!(print_unless_locked(&writer, format_args!("code {}\n", 7)));
        assert_eq!(drain(interface), b"code 7\r\n".to_vec());

        let empty = Mutex::new(None);
        assert!(!print_unless_locked(&empty, format_args!("dropped")));
    }
}
