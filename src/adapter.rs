//! C3: Adapter / Event Loop.
//!
//! A single background thread owns a `mio::Poll` and drives every
//! registered [`Channel`], the way the source's `TcpAdapter::Poll` loop
//! dispatches into the reactor (`transport/tcp/tcp_adapter.cc`). Shutdown
//! uses a real `mio::Waker` rather than the source's self-pipe. Readiness
//! callbacks are handed off to a small worker pool over a
//! `crossbeam_channel` so the poll thread never blocks on a socket's
//! `on_read`/`on_write`, mirroring the source's `ThreadPool::Get()->AddTask`
//! dispatch.

use crate::channel::{Channel, ChannelKind};
use crate::error::Result;
use crossbeam_channel::{bounded, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

const WAKE_TOKEN: Token = Token(usize::MAX);
const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

type Job = Box<dyn FnOnce() + Send>;

struct Slot {
    channel: Mutex<Channel>,
}

struct Shared {
    registry: Registry,
    channels: Mutex<HashMap<Token, Arc<Slot>>>,
    next_token: AtomicUsize,
    listener: Mutex<Option<TcpListener>>,
    pending_accepts: Mutex<VecDeque<(TcpStream, SocketAddr)>>,
    jobs: Mutex<Option<Sender<Job>>>,
    shutdown: AtomicBool,
}

impl Shared {
    fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = self.jobs.lock().unwrap().as_ref() {
            let _ = tx.send(Box::new(job));
        }
    }
}

/// Owns the event-loop thread and the worker pool that runs its callbacks.
pub struct Adapter {
    shared: Arc<Shared>,
    waker: Arc<Waker>,
    poll_thread: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Adapter {
    pub fn new(num_workers: usize) -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (tx, rx) = bounded::<Job>(4096);

        let shared = Arc::new(Shared {
            registry: poll.registry().try_clone()?,
            channels: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
            listener: Mutex::new(None),
            pending_accepts: Mutex::new(VecDeque::new()),
            jobs: Mutex::new(Some(tx)),
            shutdown: AtomicBool::new(false),
        });

        let num_workers = num_workers.max(1);
        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let rx = rx.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("rdc-worker-{i}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            job();
                        }
                    })
                    .expect("spawn rdc worker thread"),
            );
        }

        let poll_shared = Arc::clone(&shared);
        let poll_thread = thread::Builder::new()
            .name("rdc-adapter".to_string())
            .spawn(move || run_loop(poll, poll_shared))
            .expect("spawn rdc adapter thread");

        Ok(Adapter {
            shared,
            waker,
            poll_thread: Some(poll_thread),
            workers,
        })
    }

    /// Binds and registers a listening socket; returns the bound address
    /// (useful when `addr`'s port is 0).
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let mut listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        self.shared
            .registry
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        *self.shared.listener.lock().unwrap() = Some(listener);
        Ok(local)
    }

    /// Pops one connection accepted on the listening socket, if any.
    pub fn try_accept(&self) -> Option<(TcpStream, SocketAddr)> {
        self.shared.pending_accepts.lock().unwrap().pop_front()
    }

    /// Registers a new channel with the event loop and returns its token.
    pub fn register(&self, mut channel: Channel, interest: Interest) -> Result<Token> {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        self.shared
            .registry
            .register(channel.stream_mut(), token, interest)?;
        self.shared
            .channels
            .lock()
            .unwrap()
            .insert(token, Arc::new(Slot { channel: Mutex::new(channel) }));
        Ok(token)
    }

    pub fn with_channel<R>(&self, token: Token, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        let slot = self.shared.channels.lock().unwrap().get(&token).cloned();
        slot.map(|slot| f(&mut slot.channel.lock().unwrap()))
    }

    pub fn deregister(&self, token: Token) {
        if let Some(slot) = self.shared.channels.lock().unwrap().remove(&token) {
            let mut ch = slot.channel.lock().unwrap();
            let _ = self.shared.registry.deregister(ch.stream_mut());
            ch.close();
        }
    }

    /// Posts a send on the channel registered under `token`, then
    /// re-registers it with the event loop if doing so changed the
    /// channel's readiness interest. Returns `false` if `token` is unknown.
    pub fn isend(&self, token: Token, id: u64) -> bool {
        self.dispatch_io(token, |ch| ch.isend(id))
    }

    pub fn irecv(&self, token: Token, id: u64) -> bool {
        self.dispatch_io(token, |ch| ch.irecv(id))
    }

    fn dispatch_io(&self, token: Token, f: impl FnOnce(&mut Channel) -> Option<ChannelKind>) -> bool {
        let slot = self.shared.channels.lock().unwrap().get(&token).cloned();
        let Some(slot) = slot else { return false };
        let mut ch = slot.channel.lock().unwrap();
        if let Some(kind) = f(&mut ch) {
            reregister(&self.shared, token, &mut ch, kind);
        }
        true
    }

    pub fn shutdown(&mut self) {
        if self.poll_thread.is_none() {
            return;
        }
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }
        self.shared.jobs.lock().unwrap().take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(mut poll: Poll, shared: Arc<Shared>) {
    let mut events = Events::with_capacity(256);
    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("adapter event loop poll failed: {e}");
            break;
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        for event in events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            if token == LISTENER_TOKEN {
                accept_all(&shared);
                continue;
            }
            let slot = shared.channels.lock().unwrap().get(&token).cloned();
            let Some(slot) = slot else { continue };
            let readable = event.is_readable();
            let writable = event.is_writable();
            let shared2 = Arc::clone(&shared);
            shared.dispatch(move || {
                let mut ch = slot.channel.lock().unwrap();
                let mut new_kind = None;
                if readable {
                    new_kind = ch.on_read().or(new_kind);
                }
                if writable {
                    new_kind = ch.on_write().or(new_kind);
                }
                if let Some(kind) = new_kind {
                    reregister(&shared2, token, &mut ch, kind);
                }
            });
        }
    }
}

fn accept_all(shared: &Shared) {
    let mut guard = shared.listener.lock().unwrap();
    let Some(listener) = guard.as_mut() else { return };
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                log::debug!("accepted connection from {addr}");
                shared.pending_accepts.lock().unwrap().push_back((stream, addr));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                log::warn!("accept failed: {e}");
                break;
            }
        }
    }
}

fn reregister(shared: &Shared, token: Token, channel: &mut Channel, kind: ChannelKind) {
    match kind.interest() {
        Some(interest) => {
            let _ = shared.registry.reregister(channel.stream_mut(), token, interest);
        }
        None => {
            let _ = shared.registry.deregister(channel.stream_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::request::{Direction, ExtraData, Status, WorkRequestRegistry};
    use mio::net::TcpStream as MioTcpStream;
    use std::net::TcpStream as StdTcpStream;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn accept_and_echo_roundtrip() {
        let adapter = Adapter::new(2).unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let local = adapter.listen(addr).unwrap();

        let client = StdTcpStream::connect(local).unwrap();
        client.set_nonblocking(true).unwrap();
        let mut client = MioTcpStream::from_std(client);

        let (server_stream, _peer) = loop {
            if let Some(pair) = adapter.try_accept() {
                break pair;
            }
            thread::sleep(Duration::from_millis(5));
        };

        let registry = Arc::new(WorkRequestRegistry::new());
        let server_channel = Channel::new(server_stream, None, Arc::clone(&registry));
        let token = adapter.register(server_channel, Interest::READABLE).unwrap();

        let mut payload = vec![9u8; 8];
        client.write_all_nonblocking(&payload);

        let mut inbuf = vec![0u8; 8];
        let recv_id = registry.new_request(
            Direction::Recv,
            Buffer::from_slice_mut(&mut inbuf),
            ExtraData::default(),
        );

        let mut done = false;
        for _ in 0..200 {
            adapter.with_channel(token, |ch| {
                ch.irecv(recv_id);
            });
            if registry.status(recv_id) == Status::Finished {
                done = true;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(done, "recv via adapter never completed");
        assert_eq!(inbuf, payload);
        payload.clear();
    }

    trait WriteAllNonblocking {
        fn write_all_nonblocking(&mut self, data: &[u8]);
    }

    impl WriteAllNonblocking for MioTcpStream {
        fn write_all_nonblocking(&mut self, data: &[u8]) {
            use std::io::Write;
            let mut written = 0;
            while written < data.len() {
                match self.write(&data[written..]) {
                    Ok(n) => written += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(e) => panic!("write failed: {e}"),
                }
            }
        }
    }
}
