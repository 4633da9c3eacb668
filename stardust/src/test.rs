use {
    crate::{kernel::Kernel, mm::ALLOCATOR},
    alloc::{format, string::String, sync::Arc, vec::Vec},
    core::sync::atomic::{AtomicUsize, Ordering},
    log::{debug, error, info},
    xen::{
        events::Port,
        grant_table::GrantFlags,
        memory::{MachineFrameNumber, VirtualAddress},
        platform::consts::PAGE_SIZE,
        scheduler::WaitQueue,
        xenstore::XBT_NIL,
    },
};

const TESTS: [(&str, &dyn Fn(&Kernel)); 5] = [
    ("allocator", &allocator),
    ("xenstore", &xenstore),
    ("grant table", &grant_table),
    ("event channels", &event_channels),
    ("threads", &threads),
];

pub fn tests(kernel: &Kernel) {
    error!("RUNNING {} TESTS", TESTS.len());
    for (name, test) in TESTS.iter() {
        info!("test {}", name);
        test(kernel);
    }
    info!("all tests passed");
}

fn allocator(_: &Kernel) {
    {
        let size = 1_000_000;
        let mut a = Vec::with_capacity(size);
        for i in 0..size {
            a.push((i % 256) as u8);
        }
        for i in (0..size).rev() {
            assert_eq!(a.pop(), Some((i % 256) as u8));
        }
        assert_eq!(a.len(), 0);
        debug!("{:?}", *ALLOCATOR.lock());
    }

    {
        let size = 50_000;
        let mut a = Vec::with_capacity(size);
        for i in 0..size {
            a.push(format!("string number {}", i));
        }
        assert_eq!(a.last().map(String::len), Some(19));
        debug!("{:?}", *ALLOCATOR.lock());
    }
}

fn xenstore(kernel: &Kernel) {
    let store = &kernel.xenstore;

    let domid = store.domain_id().expect("domain id");
    let path = format!("/local/domain/{}/data/selftest", domid);

    store
        .write(XBT_NIL, &path, &format!("hello from domain {}!", domid))
        .expect("write");
    assert_eq!(
        store.read(XBT_NIL, &path).expect("read"),
        format!("hello from domain {}!", domid)
    );

    let entries = store
        .ls(XBT_NIL, &format!("/local/domain/{}/data", domid))
        .expect("ls");
    debug!("data contents: {:?}", entries);
    assert!(entries.iter().any(|entry| entry == "selftest"));

    // a fresh watch fires once for the watched path
    store.watch(&path, "selftest").expect("watch");
    assert_eq!(store.wait_for_watch("selftest").expect("watch event"), path);
    store.unwatch(&path, "selftest").expect("unwatch");

    store.rm(XBT_NIL, &path).expect("rm");
    assert!(store.read(XBT_NIL, &path).unwrap_err().is_remote("ENOENT"));
}

fn grant_table(kernel: &Kernel) {
    let table = &kernel.grant_table;
    let free = table.free_count();

    let page = Vec::<u8>::with_capacity(2 * PAGE_SIZE);
    let aligned = (page.as_ptr() as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let frame = MachineFrameNumber::from(VirtualAddress(aligned));

    let reference = table.grant_access(0, frame, true).expect("grant");
    let entry = table.entry(reference);
    assert_eq!(
        entry.flags(),
        GrantFlags::PERMIT_ACCESS | GrantFlags::READONLY
    );
    assert_eq!(entry.frame() as usize, frame.0);
    assert_eq!(table.free_count(), free - 1);

    // nobody mapped it, so revoking succeeds straight away
    assert!(table.end_access(reference));
    assert_eq!(table.free_count(), free);
}

fn event_channels(kernel: &Kernel) {
    let events = &kernel.events;
    let domid = kernel.xenstore.domain_id().expect("domain id");

    let local = events.alloc_unbound(domid).expect("alloc unbound");
    let remote = events.bind_interdomain(domid, local).expect("loopback");

    let received = Arc::new(WaitQueue::new());
    let waiters = received.clone();
    let scheduler = kernel.scheduler.clone();
    events
        .bind_handler(
            local,
            Arc::new(move |_: Port| waiters.wake_up(&scheduler)),
        )
        .expect("bind handler");
    events.unmask(local);

    events.notify(remote).expect("notify");
    received.wait_until(&kernel.scheduler, || events.count(local) > 0);
    assert_eq!(events.count(local), 1);

    events.unbind(local).expect("unbind local");
    events.unbind(remote).expect("unbind remote");
}

fn threads(kernel: &Kernel) {
    const WORKERS: usize = 3;
    const ROUNDS: usize = 4;

    let done = Arc::new(WaitQueue::new());
    let finished = Arc::new(AtomicUsize::new(0));
    let turns = Arc::new(AtomicUsize::new(0));

    for worker in 0..WORKERS {
        let scheduler = kernel.scheduler.clone();
        let done = done.clone();
        let finished = finished.clone();
        let turns = turns.clone();

        kernel
            .scheduler
            .create_thread(&format!("worker{}", worker), move || {
                for _ in 0..ROUNDS {
                    turns.fetch_add(1, Ordering::SeqCst);
                    scheduler.msleep(1);
                }
                finished.fetch_add(1, Ordering::SeqCst);
                done.wake_up(&scheduler);
            });
    }

    done.wait_until(&kernel.scheduler, || {
        finished.load(Ordering::SeqCst) == WORKERS
    });
    assert_eq!(turns.load(Ordering::SeqCst), WORKERS * ROUNDS);
}
