//! C7: Communicator.
//!
//! Owns the rank, world size, and peer links for one collective-
//! communication group, and implements the algorithms the source spreads
//! across `comm/communicator_base.cc` (link setup) and
//! `comm/communicator_collective.cc` (Broadcast/Reduce/Allreduce/Allgather)
//! over this crate's channel/adapter plumbing instead of raw epoll.

use crate::adapter::Adapter;
use crate::backend::PeerAddr;
use crate::buffer::{split_ranges, Buffer};
use crate::channel::Channel;
use crate::completion::{ChainCompletion, WorkCompletion};
use crate::error::{Error, Result};
use crate::ops::{self, DataType, ReduceOp};
use crate::request::{Direction, ExtraData, Status, WorkRequestRegistry};
use crate::topology;
use crate::tracker::TrackerClient;
use crate::Rank;
use mio::{Interest, Token};
use std::collections::HashMap;
use std::net::TcpStream as StdTcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One collective-communication group: this worker's rank, the group's
/// size, and the links it has to every other rank it talks to directly.
pub struct Communicator {
    name: String,
    rank: Rank,
    world_size: u32,
    adapter: Arc<Adapter>,
    registry: Arc<WorkRequestRegistry>,
    tracker: Arc<TrackerClient>,
    links: Mutex<HashMap<Rank, Token>>,
    ring_mincount: u64,
}

impl Communicator {
    /// Performs `ReConnectLinks`: registers with the tracker under `name`,
    /// takes its mutual-exclusion lock for the duration of link setup, then
    /// dials ranks below `rank` directly (recv-then-send handshake) and
    /// takes ranks above `rank` off the adapter's accept queue
    /// (send-then-recv handshake) — the same split `communicator_base.cc`
    /// uses so every link is set up exactly once regardless of which end
    /// initiates.
    pub fn connect_links(
        name: String,
        rank: Rank,
        world_size: u32,
        adapter: Arc<Adapter>,
        registry: Arc<WorkRequestRegistry>,
        tracker: Arc<TrackerClient>,
        peers: &[PeerAddr],
        connect_retry: u32,
        ring_mincount: u64,
    ) -> Result<Self> {
        tracker.register(&name)?;
        tracker.exclude(&name)?;

        let mut links = HashMap::new();
        for (idx, addr) in peers.iter().enumerate() {
            let peer_rank = idx as Rank;
            if peer_rank == rank {
                continue;
            }
            let token = if peer_rank < rank {
                let token = connect_to_peer(&adapter, &registry, addr, connect_retry)?;
                handshake_as_connector(&adapter, &registry, token, rank)?;
                token
            } else {
                let (stream, _peer_addr) = accept_with_retry(&adapter)?;
                let channel = Channel::new(stream, None, Arc::clone(&registry));
                let token = adapter.register(channel, Interest::READABLE)?;
                handshake_as_acceptor(&adapter, &registry, token, rank)?;
                token
            };
            links.insert(peer_rank, token);
        }

        tracker.unexclude(&name)?;

        Ok(Communicator {
            name,
            rank,
            world_size,
            adapter,
            registry,
            tracker,
            links: Mutex::new(links),
            ring_mincount,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    fn token_for(&self, peer: Rank) -> Result<Token> {
        self.links
            .lock()
            .unwrap()
            .get(&peer)
            .copied()
            .ok_or_else(|| Error::NoSuchPeer(peer, format!("rank {}", self.rank)))
    }

    /// Blocking send to `peer`.
    pub fn send(&self, peer: Rank, buffer: Buffer) -> Result<()> {
        wait_ok(&self.isend(peer, buffer)?, peer)
    }

    /// Blocking receive from `peer`.
    pub fn recv(&self, peer: Rank, buffer: Buffer) -> Result<()> {
        wait_ok(&self.irecv(peer, buffer)?, peer)
    }

    pub fn isend(&self, peer: Rank, buffer: Buffer) -> Result<WorkCompletion> {
        let token = self.token_for(peer)?;
        let id = self
            .registry
            .new_request(Direction::Send, buffer, ExtraData { peer_rank: Some(peer) });
        self.adapter.isend(token, id);
        Ok(WorkCompletion::new(id, Arc::clone(&self.registry)))
    }

    pub fn irecv(&self, peer: Rank, buffer: Buffer) -> Result<WorkCompletion> {
        let token = self.token_for(peer)?;
        let id = self
            .registry
            .new_request(Direction::Recv, buffer, ExtraData { peer_rank: Some(peer) });
        self.adapter.irecv(token, id);
        Ok(WorkCompletion::new(id, Arc::clone(&self.registry)))
    }

    /// Blocks until every rank has called `barrier`, per `Communicator::Barrier`.
    pub fn barrier(&self) -> Result<()> {
        self.tracker.exclude(&self.name)?;
        self.tracker.barrier(&self.name)?;
        self.tracker.unexclude(&self.name)
    }

    /// Tree reduce of `buffer` into `root`, per `TryReduceTree`.
    pub fn reduce(&self, buffer: &Buffer, dtype: DataType, op: ReduceOp, root: Rank) -> Result<()> {
        if self.world_size <= 1 {
            return Ok(());
        }
        self.reduce_tree(buffer, dtype, op, root)
    }

    /// Tree broadcast of `buffer` from `root`, per `TryBroadcast`.
    pub fn broadcast(&self, buffer: &Buffer, root: Rank) -> Result<()> {
        if self.world_size <= 1 {
            return Ok(());
        }
        self.broadcast_tree(buffer, root)
    }

    /// Reduces `buffer` across every rank and leaves the result on every
    /// rank, dispatching to the ring or tree algorithm by payload size the
    /// way `TryAllreduce` does.
    pub fn allreduce(&self, buffer: &mut Buffer, dtype: DataType, op: ReduceOp) -> Result<()> {
        if self.world_size <= 1 {
            return Ok(());
        }
        let use_ring = buffer.len() as u64 >= self.ring_mincount && self.world_size > 2;
        if use_ring {
            self.allreduce_ring(buffer, dtype, op)
        } else {
            self.reduce_tree(buffer, dtype, op, 0)?;
            self.broadcast_tree(buffer, 0)
        }
    }

    /// Ring allgather: `bufs` has one entry per rank; this rank's own entry
    /// must already hold its contribution. Slices are circulated around the
    /// ring until every rank holds every entry; entries may be of different
    /// sizes (`TryAllgatherRing`).
    pub fn allgather(&self, bufs: &mut [Buffer]) -> Result<()> {
        let n = self.world_size as usize;
        if bufs.len() != n {
            return Err(Error::InvalidTopology(self.world_size, "allgather needs one buffer per rank"));
        }
        if self.world_size <= 1 {
            return Ok(());
        }
        let (prev, next) = topology::ring_neighbors(self.rank, self.world_size);

        for step in 0..(n - 1) {
            let send_slot = (self.rank as usize + n - step) % n;
            let recv_slot = (self.rank as usize + n - step - 1) % n;
            let send_buf = bufs[send_slot];
            let recv_buf = bufs[recv_slot];

            let send_c = self.isend(next, send_buf)?;
            self.recv(prev, recv_buf)?;
            wait_ok(&send_c, next)?;
        }
        Ok(())
    }

    pub fn checkpoint(&self, global: &[u8], local: &[u8]) -> Result<u32> {
        self.tracker.checkpoint(global, local)
    }

    pub fn load_checkpoint(&self) -> Result<Option<crate::tracker::LoadedCheckpoint>> {
        self.tracker.load_checkpoint()
    }

    /// Receives from every tree neighbor closer to `root` than this rank
    /// (its children relative to `root`), folds each into `buffer` with
    /// `op`, then forwards the result to the neighbor one step closer to
    /// `root` (its parent relative to `root`). Neighbors are classified by
    /// BFS distance from `root` rather than by a fixed rank-0 rooted tree,
    /// so this works for any `root` without reshuffling the physical tree
    /// (`TryReduceTree`, generalized via `ShortestDist(root)`).
    fn reduce_tree(&self, buffer: &Buffer, dtype: DataType, op: ReduceOp, root: Rank) -> Result<()> {
        let esize = dtype.size();
        let count = buffer.len() / esize;
        let dist = topology::tree_distances(root, self.world_size);
        let my_dist = dist[self.rank as usize];
        let neighbors = topology::tree_neighbors(self.rank, self.world_size);

        for &neighbor in &neighbors {
            if dist[neighbor as usize] == my_dist + 1 {
                let mut scratch = vec![0u8; buffer.len()];
                self.recv(neighbor, Buffer::from_slice_mut(&mut scratch))?;
                unsafe {
                    ops::apply(op, dtype, buffer.addr(), scratch.as_ptr(), count);
                }
            }
        }
        if my_dist > 0 {
            if let Some(&parent) = neighbors.iter().find(|&&n| dist[n as usize] == my_dist - 1) {
                self.send(parent, *buffer)?;
            }
        }
        Ok(())
    }

    /// Mirror of [`Communicator::reduce_tree`]'s neighbor classification:
    /// receives from the parent relative to `root`, then forwards to every
    /// child relative to `root` (`TryBroadcast`, generalized the same way).
    fn broadcast_tree(&self, buffer: &Buffer, root: Rank) -> Result<()> {
        let dist = topology::tree_distances(root, self.world_size);
        let my_dist = dist[self.rank as usize];
        let neighbors = topology::tree_neighbors(self.rank, self.world_size);

        if my_dist > 0 {
            if let Some(&parent) = neighbors.iter().find(|&&n| dist[n as usize] == my_dist - 1) {
                self.recv(parent, *buffer)?;
            }
        }

        let mut chain = ChainCompletion::new();
        for &neighbor in &neighbors {
            if dist[neighbor as usize] == my_dist + 1 {
                chain.push(self.isend(neighbor, *buffer)?);
            }
        }
        if !chain.is_empty() && chain.wait() != Status::Finished {
            return Err(Error::ChannelError { rank: self.rank });
        }
        Ok(())
    }

    fn allreduce_ring(&self, buffer: &mut Buffer, dtype: DataType, op: ReduceOp) -> Result<()> {
        let n = self.world_size as usize;
        let esize = dtype.size();
        let ranges = split_ranges(buffer.len() / esize, n);
        let (prev, next) = topology::ring_neighbors(self.rank, self.world_size);

        // Reduce-scatter: after n-1 steps, chunk `(rank + 1) % n` on this
        // rank holds the full reduction for that chunk (`TryReduceScatterRing`).
        for step in 0..(n - 1) {
            let send_chunk = (self.rank as usize + n - step) % n;
            let recv_chunk = (self.rank as usize + n - step - 1) % n;
            let (ss, se) = ranges[send_chunk];
            let (rs, re) = ranges[recv_chunk];
            let send_buf = buffer.slice(ss * esize, se * esize);
            let mut scratch = vec![0u8; (re - rs) * esize];

            let send_c = self.isend(next, send_buf)?;
            self.recv(prev, Buffer::from_slice_mut(&mut scratch))?;
            wait_ok(&send_c, next)?;

            unsafe {
                ops::apply(op, dtype, buffer.addr().add(rs * esize), scratch.as_ptr(), re - rs);
            }
        }

        // Allgather: circulate the now-fully-reduced chunks the rest of the
        // way around the ring (`TryAllgatherRing`), reusing the general,
        // unequal-size-capable allgather over per-chunk slices.
        let mut bufs: Vec<Buffer> = ranges.iter().map(|&(s, e)| buffer.slice(s * esize, e * esize)).collect();
        self.allgather(&mut bufs)
    }
}

fn wait_ok(completion: &WorkCompletion, peer: Rank) -> Result<()> {
    match completion.wait() {
        Status::Finished => Ok(()),
        Status::Canceled => Err(Error::Canceled { id: completion.id() }),
        Status::Closed => Err(Error::Closed { id: completion.id() }),
        _ => Err(Error::ChannelError { rank: peer }),
    }
}

fn connect_to_peer(
    adapter: &Adapter,
    registry: &Arc<WorkRequestRegistry>,
    addr: &PeerAddr,
    connect_retry: u32,
) -> Result<Token> {
    let target = (addr.host.as_str(), addr.port);
    let mut attempt = 0u32;
    let stream = loop {
        match StdTcpStream::connect(target) {
            Ok(s) => break s,
            Err(e) => {
                attempt += 1;
                if attempt > connect_retry {
                    return Err(Error::ChannelError { rank: 0 });
                }
                log::warn!("connect to {addr} failed: {e}; retrying in 1s");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    };
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    let mio_stream = mio::net::TcpStream::from_std(stream);
    let channel = Channel::new(mio_stream, None, Arc::clone(registry));
    adapter.register(channel, Interest::READABLE)
}

fn accept_with_retry(adapter: &Adapter) -> Result<(mio::net::TcpStream, std::net::SocketAddr)> {
    for _ in 0..4000 {
        if let Some(pair) = adapter.try_accept() {
            return Ok(pair);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    Err(Error::ChannelError { rank: 0 })
}

fn handshake_as_connector(
    adapter: &Adapter,
    registry: &Arc<WorkRequestRegistry>,
    token: Token,
    rank: Rank,
) -> Result<()> {
    let mut peer_buf = [0u8; 4];
    let recv_id = registry.new_request(Direction::Recv, Buffer::from_slice_mut(&mut peer_buf), ExtraData::default());
    adapter.irecv(token, recv_id);
    registry.wait(recv_id);
    registry.reap(recv_id);

    let mut my_buf = rank.to_le_bytes();
    let send_id = registry.new_request(Direction::Send, Buffer::from_slice_mut(&mut my_buf), ExtraData::default());
    adapter.isend(token, send_id);
    registry.wait(send_id);
    registry.reap(send_id);
    Ok(())
}

fn handshake_as_acceptor(
    adapter: &Adapter,
    registry: &Arc<WorkRequestRegistry>,
    token: Token,
    rank: Rank,
) -> Result<()> {
    let mut my_buf = rank.to_le_bytes();
    let send_id = registry.new_request(Direction::Send, Buffer::from_slice_mut(&mut my_buf), ExtraData::default());
    adapter.isend(token, send_id);
    registry.wait(send_id);
    registry.reap(send_id);

    let mut peer_buf = [0u8; 4];
    let recv_id = registry.new_request(Direction::Recv, Buffer::from_slice_mut(&mut peer_buf), ExtraData::default());
    adapter.irecv(token, recv_id);
    registry.wait(recv_id);
    registry.reap(recv_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_tree_and_broadcast_tree_are_identity_for_single_rank() {
        // With world_size == 1 the public ops short-circuit before touching
        // the network; this just guards that invariant stays cheap to hold.
        assert!(topology::children(0, 1).is_empty());
    }
}
