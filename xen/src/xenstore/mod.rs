//! XenStore client
//!
//! Requests are written to the request ring of the XenStore page, replies and
//! watch events are read from the response ring. Each request owns one of
//! [`XENSTORE_NR_REQS`] request IDs until its reply has been taken, so several
//! threads can have requests outstanding at once. Whichever thread is waiting
//! drains the response ring and hands replies to their owners.

use {
    crate::{
        events::{EventChannels, Port},
        ring::{Duplex, XenStoreInterface},
        scheduler::{Scheduler, WaitQueue},
    },
    alloc::{
        collections::VecDeque,
        format,
        string::{String, ToString},
        sync::{Arc, Weak},
        vec,
        vec::Vec,
    },
    core::convert::TryFrom,
    hashbrown::HashMap,
    log::{debug, info, trace, warn},
    spin::Mutex,
    xen_sys::domid_t,
};

mod error;
mod wire;

pub use {
    error::Error,
    wire::{Kind, MessageHeader, Permission, State, TransactionId, HEADER_SIZE, XBT_NIL},
};

/// Number of requests that can be outstanding at once
pub const XENSTORE_NR_REQS: usize = 32;

/// Result of ending a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Changes were applied
    Committed,
    /// Another transaction interfered, the whole transaction must be run again
    Retry,
}

enum Slot {
    Free,
    Waiting,
    Replied(MessageHeader, Vec<u8>),
}

struct Requests {
    slots: Vec<Slot>,
    next: usize,
    live: usize,
}

impl Requests {
    fn new() -> Self {
        Self {
            slots: (0..XENSTORE_NR_REQS).map(|_| Slot::Free).collect(),
            next: 0,
            live: 0,
        }
    }

    fn allocate(&mut self) -> Option<u32> {
        if self.live == XENSTORE_NR_REQS {
            return None;
        }

        let mut id = self.next;
        while !matches!(self.slots[id], Slot::Free) {
            id = (id + 1) % XENSTORE_NR_REQS;
        }

        self.slots[id] = Slot::Waiting;
        self.live += 1;
        self.next = (id + 1) % XENSTORE_NR_REQS;

        Some(id as u32)
    }

    fn deliver(&mut self, header: MessageHeader, body: Vec<u8>) {
        match self.slots.get_mut(header.request_id as usize) {
            Some(slot) if matches!(slot, Slot::Waiting) => *slot = Slot::Replied(header, body),
            _ => warn!(
                "dropping xenstore reply to request {} nobody waits for",
                header.request_id
            ),
        }
    }

    fn is_replied(&self, id: u32) -> bool {
        matches!(self.slots[id as usize], Slot::Replied(..))
    }

    /// Takes the reply of `id` and frees the ID
    fn take(&mut self, id: u32) -> Option<(MessageHeader, Vec<u8>)> {
        let slot = &mut self.slots[id as usize];
        if !matches!(slot, Slot::Replied(..)) {
            return None;
        }

        self.live -= 1;
        match core::mem::replace(slot, Slot::Free) {
            Slot::Replied(header, body) => Some((header, body)),
            _ => None,
        }
    }
}

/// Connection to XenStore
pub struct XenStore {
    ring: &'static XenStoreInterface,
    port: Port,
    events: Arc<EventChannels>,
    scheduler: Arc<Scheduler>,
    /// Threads waiting for ring space or for a reply
    ring_wait: WaitQueue,
    /// Threads waiting for a free request ID
    request_wait: WaitQueue,
    /// Threads waiting for watch events
    watch_wait: WaitQueue,
    requests: Mutex<Requests>,
    watches: Mutex<HashMap<String, VecDeque<String>>>,
}

impl XenStore {
    /// Connects to XenStore through `ring`, signalled on `port`
    ///
    /// Binds a handler to `port` that wakes waiting threads, then unmasks it.
    pub fn new(
        ring: &'static XenStoreInterface,
        port: Port,
        events: Arc<EventChannels>,
        scheduler: Arc<Scheduler>,
    ) -> Result<Arc<Self>, Error> {
        let store = Arc::new(Self {
            ring,
            port,
            events: events.clone(),
            scheduler,
            ring_wait: WaitQueue::new(),
            request_wait: WaitQueue::new(),
            watch_wait: WaitQueue::new(),
            requests: Mutex::new(Requests::new()),
            watches: Mutex::new(HashMap::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&store);
        events.bind_handler(
            port,
            Arc::new(move |_: Port| {
                if let Some(store) = weak.upgrade() {
                    store.ring_wait.wake_up(&store.scheduler);
                    store.watch_wait.wake_up(&store.scheduler);
                }
            }),
        )?;
        events.unmask(port);

        info!("xenstore connected on port {}", port);
        Ok(store)
    }

    /// Event channel port of the connection
    pub fn port(&self) -> Port {
        self.port
    }

    fn allocate_request(&self) -> u32 {
        loop {
            let id = self.requests.lock().allocate();
            if let Some(id) = id {
                return id;
            }

            trace!("all xenstore request ids in use, waiting");
            self.request_wait
                .wait_until(&self.scheduler, || self.requests.lock().live < XENSTORE_NR_REQS);
        }
    }

    /// Moves every complete message off the response ring, returns whether any was
    fn drain(&self) -> bool {
        let inbound = self.ring.inbound();
        let mut delivered = false;

        loop {
            let mut raw = [0; HEADER_SIZE];
            if !inbound.peek(0, &mut raw) {
                break;
            }

            let header = MessageHeader::from_bytes(&raw);
            let total = HEADER_SIZE + header.len as usize;
            assert!(
                total <= inbound.capacity() as usize,
                "xenstore message of {} bytes does not fit the ring",
                header.len
            );

            let mut body = vec![0; header.len as usize];
            if !inbound.peek(HEADER_SIZE as u32, &mut body) {
                break;
            }
            inbound.consume(total as u32);

            trace!("xenstore {:?} for request {}", header.kind, header.request_id);
            match header.kind {
                Kind::WatchEvent => self.queue_watch_event(&body),
                _ => self.requests.lock().deliver(header, body),
            }
            delivered = true;
        }

        if delivered {
            self.ring_wait.wake_up(&self.scheduler);
            self.watch_wait.wake_up(&self.scheduler);
        }

        delivered
    }

    fn queue_watch_event(&self, body: &[u8]) {
        let mut parts = body.split(|b| *b == 0);
        let (path, token) = match (parts.next(), parts.next()) {
            (Some(path), Some(token)) => (path, token),
            _ => {
                warn!("dropping malformed watch event");
                return;
            }
        };

        let (path, token) = match (core::str::from_utf8(path), core::str::from_utf8(token)) {
            (Ok(path), Ok(token)) => (path, token),
            _ => {
                warn!("dropping watch event that is not UTF-8");
                return;
            }
        };

        match self.watches.lock().get_mut(token) {
            Some(queue) => queue.push_back(path.to_string()),
            None => warn!("dropping watch event on {} for unknown token {}", path, token),
        }
    }

    /// Sends one request and waits for its reply
    fn send(&self, kind: Kind, tx: TransactionId, args: &[&[u8]]) -> Result<Vec<u8>, Error> {
        let len = args.iter().map(|arg| arg.len()).sum::<usize>();
        let outbound = self.ring.outbound();
        if HEADER_SIZE + len > outbound.capacity() as usize {
            return Err(Error::TooLarge(len));
        }

        let id = self.allocate_request();
        let header = MessageHeader {
            kind,
            request_id: id,
            transaction_id: tx,
            len: len as u32,
        };

        let mut message = Vec::with_capacity(HEADER_SIZE + len);
        message.extend_from_slice(&header.to_bytes());
        for arg in args {
            message.extend_from_slice(arg);
        }

        self.ring_wait.wait_until(&self.scheduler, || {
            outbound.space() as usize >= message.len()
        });
        outbound.write(&message);
        trace!("xenstore {:?} request {} tx {}", kind, id, tx);

        if let Err(e) = self.events.notify(self.port) {
            warn!("failed to notify xenstore: {}", e);
        }

        let (reply, body) = self.wait_for_reply(id);
        match reply.kind {
            Kind::Error => Err(Error::Remote(into_string(wire::trim_nul(&body).to_vec())?)),
            k if k == kind => Ok(body),
            k => {
                warn!("xenstore answered {:?} with {:?}", kind, k);
                Err(Error::Malformed)
            }
        }
    }

    fn wait_for_reply(&self, id: u32) -> (MessageHeader, Vec<u8>) {
        loop {
            self.drain();

            let reply = self.requests.lock().take(id);
            if let Some(reply) = reply {
                self.request_wait.wake_up(&self.scheduler);
                return reply;
            }

            self.ring_wait.wait_until(&self.scheduler, || {
                self.drain();
                self.requests.lock().is_replied(id)
            });
        }
    }

    /// Reads the value of `path`
    pub fn read(&self, tx: TransactionId, path: &str) -> Result<String, Error> {
        let reply = self.send(Kind::Read, tx, &[&nul_terminated(path)])?;
        into_string(wire::trim_nul(&reply).to_vec())
    }

    /// Writes `value` to `path`, creating the node if needed
    pub fn write(&self, tx: TransactionId, path: &str, value: &str) -> Result<(), Error> {
        self.send(Kind::Write, tx, &[&nul_terminated(path), value.as_bytes()])
            .map(drop)
    }

    /// Removes `path` and everything below it
    pub fn rm(&self, tx: TransactionId, path: &str) -> Result<(), Error> {
        self.send(Kind::Remove, tx, &[&nul_terminated(path)]).map(drop)
    }

    /// Creates an empty node at `path`
    pub fn mkdir(&self, tx: TransactionId, path: &str) -> Result<(), Error> {
        self.send(Kind::MakeDirectory, tx, &[&nul_terminated(path)])
            .map(drop)
    }

    /// Names of the children of `path`
    pub fn ls(&self, tx: TransactionId, path: &str) -> Result<Vec<String>, Error> {
        let reply = self.send(Kind::Directory, tx, &[&nul_terminated(path)])?;
        into_strings(&reply)
    }

    /// Permissions of `path`, one entry per domain such as `"b0"` or `"r3"`
    pub fn get_perms(&self, tx: TransactionId, path: &str) -> Result<Vec<String>, Error> {
        let reply = self.send(Kind::GetPerms, tx, &[&nul_terminated(path)])?;
        into_strings(&reply)
    }

    /// Sets the permission of `domain` on `path`
    pub fn set_perms(
        &self,
        tx: TransactionId,
        path: &str,
        domain: domid_t,
        permission: Permission,
    ) -> Result<(), Error> {
        let value = format!("{}{}\0", permission.as_char(), domain);
        self.send(Kind::SetPerms, tx, &[&nul_terminated(path), value.as_bytes()])
            .map(drop)
    }

    /// Watches `path` and everything below it, events are queued under `token`
    ///
    /// XenStore fires one event right after the watch is registered.
    pub fn watch(&self, path: &str, token: &str) -> Result<(), Error> {
        self.watches
            .lock()
            .entry(token.to_string())
            .or_insert_with(VecDeque::new);

        let registered = self.send(
            Kind::Watch,
            XBT_NIL,
            &[&nul_terminated(path), &nul_terminated(token)],
        );
        if let Err(e) = registered {
            self.watches.lock().remove(token);
            return Err(e);
        }

        debug!("watching {} as {}", path, token);
        Ok(())
    }

    /// Removes the watch on `path`, pending events of `token` are discarded
    pub fn unwatch(&self, path: &str, token: &str) -> Result<(), Error> {
        self.send(
            Kind::Unwatch,
            XBT_NIL,
            &[&nul_terminated(path), &nul_terminated(token)],
        )?;

        self.watches.lock().remove(token);
        Ok(())
    }

    /// Opens a transaction
    pub fn transaction_start(&self) -> Result<TransactionId, Error> {
        let reply = self.send(Kind::TransactionStart, XBT_NIL, &[b"\0"])?;
        let id = into_string(wire::trim_nul(&reply).to_vec())?;

        id.parse().map_err(|_| Error::InvalidInteger(id))
    }

    /// Commits `tx`, or discards it if `abort` is set
    pub fn transaction_end(
        &self,
        tx: TransactionId,
        abort: bool,
    ) -> Result<TransactionOutcome, Error> {
        let arg: &[u8] = if abort { b"F\0" } else { b"T\0" };

        match self.send(Kind::TransactionEnd, tx, &[arg]) {
            Ok(_) => Ok(TransactionOutcome::Committed),
            Err(e) if e.is_remote("EAGAIN") => Ok(TransactionOutcome::Retry),
            Err(e) => Err(e),
        }
    }

    /// Prints `message` in the XenStore daemon's log
    pub fn debug(&self, message: &str) -> Result<(), Error> {
        self.send(
            Kind::Control,
            XBT_NIL,
            &[b"print\0", message.as_bytes(), b"\0"],
        )
        .map(drop)
    }

    /// Reads `path` as a decimal integer
    pub fn read_integer(&self, path: &str) -> Result<i64, Error> {
        let value = self.read(XBT_NIL, path)?;
        value.trim().parse().map_err(|_| Error::InvalidInteger(value))
    }

    /// ID of this domain
    pub fn domain_id(&self) -> Result<domid_t, Error> {
        let value = self.read(XBT_NIL, "domid")?;
        value.trim().parse().map_err(|_| Error::InvalidInteger(value))
    }

    /// Reads the XenBus state stored at `path`
    pub fn read_state(&self, tx: TransactionId, path: &str) -> Result<State, Error> {
        let value = self.read(tx, path)?;
        let number = value
            .trim()
            .parse::<u32>()
            .map_err(|_| Error::InvalidInteger(value))?;

        State::try_from(number).map_err(Error::InvalidState)
    }

    /// Sets the XenBus state at `path`, in a transaction retried until it commits
    ///
    /// Nothing is written if the node already holds `state`.
    pub fn switch_state(&self, path: &str, state: State) -> Result<(), Error> {
        loop {
            let tx = self.transaction_start()?;

            let changed = self.read_state(tx, path).and_then(|current| {
                if current == state {
                    Ok(())
                } else {
                    self.write(tx, path, &(state as u32).to_string())
                }
            });

            if let Err(e) = changed {
                if let Err(abort) = self.transaction_end(tx, true) {
                    warn!("failed to abort transaction {}: {}", tx, abort);
                }
                return Err(e);
            }

            match self.transaction_end(tx, false)? {
                TransactionOutcome::Committed => {
                    debug!("{} switched to {:?}", path, state);
                    return Ok(());
                }
                TransactionOutcome::Retry => trace!("switching {} raced, retrying", path),
            }
        }
    }

    /// Path of the oldest queued event of `token`, if any
    pub fn try_read_watch(&self, token: &str) -> Option<String> {
        self.drain();
        self.watches
            .lock()
            .get_mut(token)
            .and_then(|queue| queue.pop_front())
    }

    /// Waits for the next event of `token` and returns the path that changed
    pub fn wait_for_watch(&self, token: &str) -> Result<String, Error> {
        loop {
            if !self.watches.lock().contains_key(token) {
                return Err(Error::UnknownWatch(token.to_string()));
            }

            if let Some(path) = self.try_read_watch(token) {
                return Ok(path);
            }

            self.watch_wait.wait_until(&self.scheduler, || {
                self.drain();
                self.watches
                    .lock()
                    .get(token)
                    .map_or(true, |queue| !queue.is_empty())
            });
        }
    }

    /// Waits until `path` holds `value`
    ///
    /// `token` must be watching `path`.
    pub fn wait_for_value(&self, path: &str, value: &str, token: &str) -> Result<(), Error> {
        loop {
            if self.read(XBT_NIL, path)? == value {
                return Ok(());
            }

            self.wait_for_watch(token)?;
        }
    }

    /// Waits until the XenBus state at `path` differs from `state`, then stores the new state in it
    ///
    /// `token` must be watching `path`.
    pub fn wait_for_state_change(
        &self,
        path: &str,
        state: &mut State,
        token: &str,
    ) -> Result<(), Error> {
        loop {
            let current = self.read_state(XBT_NIL, path)?;
            if current != *state {
                *state = current;
                return Ok(());
            }

            self.wait_for_watch(token)?;
        }
    }
}

fn nul_terminated(s: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    bytes
}

fn into_string(bytes: Vec<u8>) -> Result<String, Error> {
    String::from_utf8(bytes).map_err(|_| Error::Utf8)
}

fn into_strings(payload: &[u8]) -> Result<Vec<String>, Error> {
    wire::split_strings(payload)
        .map(|part| into_string(part.to_vec()))
        .collect()
}
