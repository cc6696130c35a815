//! C2: Transport Channel.
//!
//! Wraps one `mio::net::TcpStream` plus the per-direction FIFOs that make it
//! a channel instead of a bare socket, mirroring the source's `IChannel` /
//! `TCPChannel` split (`transport/channel.cc`, `transport/tcp/tcp_channel.cc`).
//! A channel never blocks: `on_read`/`on_write` are driven by the adapter's
//! event loop and pump bytes into or out of whatever work request is at the
//! head of the matching queue. The adapter holds each `Channel` behind its
//! own `Mutex`, so every method here takes `&mut self`.

use crate::request::{Status, WorkRequestRegistry};
use crate::Rank;
use mio::net::TcpStream;
use mio::Interest;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

/// Which directions of I/O a channel currently wants to be polled for,
/// mirroring the source's `AddEventOfInterest`/`DeleteEventOfInterest` states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    None,
    Read,
    Write,
    ReadWrite,
}

impl ChannelKind {
    fn with_read(self, want: bool) -> ChannelKind {
        let write = matches!(self, ChannelKind::Write | ChannelKind::ReadWrite);
        ChannelKind::from_flags(want, write)
    }

    fn with_write(self, want: bool) -> ChannelKind {
        let read = matches!(self, ChannelKind::Read | ChannelKind::ReadWrite);
        ChannelKind::from_flags(read, want)
    }

    fn from_flags(read: bool, write: bool) -> ChannelKind {
        match (read, write) {
            (false, false) => ChannelKind::None,
            (true, false) => ChannelKind::Read,
            (false, true) => ChannelKind::Write,
            (true, true) => ChannelKind::ReadWrite,
        }
    }

    pub fn interest(self) -> Option<Interest> {
        match self {
            ChannelKind::None => None,
            ChannelKind::Read => Some(Interest::READABLE),
            ChannelKind::Write => Some(Interest::WRITABLE),
            ChannelKind::ReadWrite => Some(Interest::READABLE | Interest::WRITABLE),
        }
    }
}

/// One end of a worker-to-worker link. Holds the socket and the FIFOs of
/// work-request ids currently being pumped across it; actual bytes live in
/// the [`crate::buffer::Buffer`] each request was created with.
pub struct Channel {
    stream: TcpStream,
    peer_rank: Option<Rank>,
    registry: Arc<WorkRequestRegistry>,
    send_queue: VecDeque<u64>,
    recv_queue: VecDeque<u64>,
    kind: ChannelKind,
}

impl Channel {
    pub fn new(stream: TcpStream, peer_rank: Option<Rank>, registry: Arc<WorkRequestRegistry>) -> Self {
        Channel {
            stream,
            peer_rank,
            registry,
            send_queue: VecDeque::new(),
            recv_queue: VecDeque::new(),
            kind: ChannelKind::None,
        }
    }

    pub fn peer_rank(&self) -> Option<Rank> {
        self.peer_rank
    }

    pub fn set_peer_rank(&mut self, rank: Rank) {
        self.peer_rank = Some(rank);
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_idle(&self) -> bool {
        self.send_queue.is_empty() && self.recv_queue.is_empty()
    }

    /// Enqueues a send request and tries to make immediate progress. Returns
    /// the channel's new interest if registering for it changed, so the
    /// caller can update the event loop.
    pub fn isend(&mut self, id: u64) -> Option<ChannelKind> {
        self.send_queue.push_back(id);
        self.registry.set_status(id, Status::Running);
        self.pump_send()
    }

    pub fn irecv(&mut self, id: u64) -> Option<ChannelKind> {
        self.recv_queue.push_back(id);
        self.registry.set_status(id, Status::Running);
        self.pump_recv()
    }

    /// Called by the adapter when the socket becomes writable.
    pub fn on_write(&mut self) -> Option<ChannelKind> {
        self.pump_send()
    }

    /// Called by the adapter when the socket becomes readable.
    pub fn on_read(&mut self) -> Option<ChannelKind> {
        self.pump_recv()
    }

    fn pump_send(&mut self) -> Option<ChannelKind> {
        loop {
            let Some(&id) = self.send_queue.front() else {
                return self.update_kind(|k| k.with_write(false));
            };
            // SAFETY: this channel is the sole owner of `id` until it reaches
            // a terminal status; no other channel shares it.
            let outcome = unsafe {
                self.registry
                    .with_buffer_slice(id, |slice| self.stream.write(slice))
            };
            match outcome {
                Ok(0) => self.fail(id),
                Ok(n) => {
                    if self.registry.add_bytes(id, n) {
                        self.registry.notify(id);
                        self.send_queue.pop_front();
                    }
                    // Partial write: loop back and try again on the same id
                    // rather than waiting for another readiness callback.
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return self.update_kind(|k| k.with_write(true));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => self.fail(id),
            }
        }
    }

    fn pump_recv(&mut self) -> Option<ChannelKind> {
        loop {
            let Some(&id) = self.recv_queue.front() else {
                return self.update_kind(|k| k.with_read(false));
            };
            // SAFETY: same reasoning as `pump_send`.
            let outcome = unsafe {
                self.registry
                    .with_buffer_slice(id, |slice| self.stream.read(slice))
            };
            match outcome {
                Ok(0) => self.fail(id),
                Ok(n) => {
                    if self.registry.add_bytes(id, n) {
                        self.registry.notify(id);
                        self.recv_queue.pop_front();
                    }
                    // Partial read: loop back and try again on the same id
                    // rather than waiting for another readiness callback.
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return self.update_kind(|k| k.with_read(true));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => self.fail(id),
            }
        }
    }

    fn fail(&mut self, id: u64) {
        self.registry.set_status(id, Status::Error);
        self.registry.notify(id);
        if self.send_queue.front() == Some(&id) {
            self.send_queue.pop_front();
        } else {
            self.recv_queue.pop_front();
        }
    }

    fn update_kind(&mut self, f: impl FnOnce(ChannelKind) -> ChannelKind) -> Option<ChannelKind> {
        let new_kind = f(self.kind);
        if new_kind != self.kind {
            self.kind = new_kind;
            Some(new_kind)
        } else {
            None
        }
    }

    /// Drains both queues, marking every outstanding request `Closed`, the
    /// way a channel torn down mid-collective cancels its pending I/O.
    pub fn close(&mut self) {
        for id in self.send_queue.drain(..).chain(self.recv_queue.drain(..)) {
            self.registry.set_status(id, Status::Closed);
            self.registry.notify(id);
        }
        self.kind = ChannelKind::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::request::{Direction, ExtraData};
    use mio::net::{TcpListener, TcpStream as MioTcpStream};
    use std::net::TcpStream as StdTcpStream;
    use std::thread;
    use std::time::Duration;

    fn loopback_pair() -> (MioTcpStream, MioTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        thread::sleep(Duration::from_millis(20));
        let (server, _) = listener.accept().unwrap();
        (MioTcpStream::from_std(client), server)
    }

    #[test]
    fn send_recv_completes_over_loopback() {
        let (client, server) = loopback_pair();
        let registry = Arc::new(WorkRequestRegistry::new());

        let mut sender = Channel::new(client, None, Arc::clone(&registry));
        let mut receiver = Channel::new(server, None, Arc::clone(&registry));

        let mut out = vec![1u8, 2, 3, 4];
        let send_id = registry.new_request(Direction::Send, Buffer::from_slice_mut(&mut out), ExtraData::default());
        sender.isend(send_id);

        let mut inbuf = vec![0u8; 4];
        let recv_id = registry.new_request(Direction::Recv, Buffer::from_slice_mut(&mut inbuf), ExtraData::default());

        let mut received = false;
        for _ in 0..50 {
            receiver.irecv(recv_id);
            if registry.status(recv_id) == Status::Finished {
                received = true;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(received, "recv never completed");
        assert_eq!(inbuf, out);
    }

    #[test]
    fn close_marks_outstanding_requests_closed() {
        let (client, _server) = loopback_pair();
        let registry = Arc::new(WorkRequestRegistry::new());
        let mut sender = Channel::new(client, None, Arc::clone(&registry));
        let mut data = vec![0u8; 4096 * 16];
        let id = registry.new_request(Direction::Send, Buffer::from_slice_mut(&mut data), ExtraData::default());
        sender.send_queue.push_back(id);
        sender.close();
        assert_eq!(registry.status(id), Status::Closed);
    }
}
