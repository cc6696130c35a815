//! End-to-end tests over real loopback TCP: a small in-process mock tracker
//! plays the registration/barrier/shutdown protocol for a fixed number of
//! workers, each a real thread running its own [`Adapter`] and
//! [`Communicator`], the way the scenarios in the source's own test suite
//! spin up several ranks against one tracker.

use rdc::adapter::Adapter;
use rdc::buffer::Buffer;
use rdc::communicator::Communicator;
use rdc::framing::{read_i32, read_str, read_u32, write_str, write_u32};
use rdc::ops::{DataType, ReduceOp};
use rdc::request::WorkRequestRegistry;
use rdc::tracker::TrackerClient;
use std::io::{BufReader, BufWriter, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

const ACK_OK: u32 = 0;

/// Runs a scripted tracker for exactly `n` workers: `start` (collecting
/// every worker's advertised listen address before replying to any of
/// them), the `register`/`exclude`/`unexclude` sequence `connect_links`
/// issues around link setup, one explicit `barrier` (itself wrapped in
/// `exclude`/`unexclude`), then `shutdown`.
fn spawn_mock_tracker(n: u32) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let mut conns = Vec::new();
        for _ in 0..n {
            let (stream, _) = listener.accept().unwrap();
            let reader = BufReader::new(stream.try_clone().unwrap());
            let writer = BufWriter::new(stream);
            conns.push((reader, writer));
        }

        let mut addrs = Vec::with_capacity(n as usize);
        for (reader, _) in conns.iter_mut() {
            let cmd = read_str(reader).unwrap();
            assert_eq!(cmd, "start");
            let _rank_hint = read_i32(reader).unwrap();
            let _world_size_hint = read_u32(reader).unwrap();
            let host = read_str(reader).unwrap();
            let port = read_u32(reader).unwrap() as u16;
            addrs.push(format!("tcp:{host}:{port}"));
        }

        for (rank, (_, writer)) in conns.iter_mut().enumerate() {
            write_u32(writer, rank as u32).unwrap();
            write_u32(writer, n).unwrap();
            write_u32(writer, addrs.len() as u32).unwrap();
            for addr in &addrs {
                write_str(writer, addr).unwrap();
            }
            writer.flush().unwrap();
        }

        // `connect_links`: register, then take+release the exclude lock
        // around the peer handshakes (which never touch the tracker).
        for (reader, writer) in conns.iter_mut() {
            let cmd = read_str(reader).unwrap();
            assert_eq!(cmd, "register");
            let _name = read_str(reader).unwrap();
            write_u32(writer, ACK_OK).unwrap();
            writer.flush().unwrap();
        }
        for (reader, writer) in conns.iter_mut() {
            let cmd = read_str(reader).unwrap();
            assert_eq!(cmd, "exclude");
            let _name = read_str(reader).unwrap();
            write_str(writer, "exclude_done").unwrap();
            writer.flush().unwrap();
        }
        for (reader, writer) in conns.iter_mut() {
            let cmd = read_str(reader).unwrap();
            assert_eq!(cmd, "unexclude");
            let _name = read_str(reader).unwrap();
            write_str(writer, "unexclude_done").unwrap();
            writer.flush().unwrap();
        }

        // Explicit `Communicator::barrier`: exclude, barrier, unexclude.
        for (reader, writer) in conns.iter_mut() {
            let cmd = read_str(reader).unwrap();
            assert_eq!(cmd, "exclude");
            let _name = read_str(reader).unwrap();
            write_str(writer, "exclude_done").unwrap();
            writer.flush().unwrap();
        }
        for (reader, _) in conns.iter_mut() {
            let cmd = read_str(reader).unwrap();
            assert_eq!(cmd, "barrier");
            let _name = read_str(reader).unwrap();
        }
        for (_, writer) in conns.iter_mut() {
            write_str(writer, "barrier_done").unwrap();
            writer.flush().unwrap();
        }
        for (reader, writer) in conns.iter_mut() {
            let cmd = read_str(reader).unwrap();
            assert_eq!(cmd, "unexclude");
            let _name = read_str(reader).unwrap();
            write_str(writer, "unexclude_done").unwrap();
            writer.flush().unwrap();
        }

        for (reader, writer) in conns.iter_mut() {
            let cmd = read_str(reader).unwrap();
            assert_eq!(cmd, "shutdown");
            write_u32(writer, ACK_OK).unwrap();
            writer.flush().unwrap();
        }
    });
    port
}

/// Connects to the tracker, builds the communicator, and runs `body` with
/// it, tearing down with `shutdown` once `body` returns.
fn run_worker<R: Send + 'static>(
    tracker_port: u16,
    world_size_hint: u32,
    body: impl FnOnce(&Communicator) -> R + Send + 'static,
) -> thread::JoinHandle<R> {
    thread::spawn(move || {
        let tracker = Arc::new(TrackerClient::connect("127.0.0.1", tracker_port, 3).unwrap());
        let adapter = Arc::new(Adapter::new(2).unwrap());
        let bound = adapter.listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let reply = tracker
            .start(None, world_size_hint, false, "127.0.0.1", bound.port())
            .unwrap();

        let registry = Arc::new(WorkRequestRegistry::new());
        let comm = Communicator::connect_links(
            "main".to_string(),
            reply.rank,
            reply.world_size,
            Arc::clone(&adapter),
            registry,
            Arc::clone(&tracker),
            &reply.peers,
            3,
            1 << 20,
        )
        .unwrap();
        comm.barrier().unwrap();

        let result = body(&comm);

        tracker.shutdown().unwrap();
        result
    })
}

#[test]
fn broadcast_delivers_roots_buffer_to_every_rank() {
    const N: u32 = 3;
    let port = spawn_mock_tracker(N);

    let handles: Vec<_> = (0..N)
        .map(|_| {
            run_worker(port, N, |comm| {
                let mut payload = if comm.rank() == 0 {
                    *b"hello-rdc"
                } else {
                    [0u8; 9]
                };
                comm.broadcast(&Buffer::from_slice_mut(&mut payload), 0).unwrap();
                payload
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(&handle.join().unwrap(), b"hello-rdc");
    }
}

#[test]
fn allreduce_sum_combines_every_ranks_contribution() {
    const N: u32 = 3;
    let port = spawn_mock_tracker(N);

    let handles: Vec<_> = (0..N)
        .map(|_| {
            run_worker(port, N, |comm| {
                let mut data = [(comm.rank() + 1) as i32, (comm.rank() + 1) as i32 * 10];
                let mut buffer = Buffer::from_typed_mut(&mut data);
                comm.allreduce(&mut buffer, DataType::I32, ReduceOp::Sum).unwrap();
                data
            })
        })
        .collect();

    // ranks are 0, 1, 2 -> contributions (1,10) + (2,20) + (3,30) = (6, 60)
    for handle in handles {
        assert_eq!(handle.join().unwrap(), [6, 60]);
    }
}

#[test]
fn broadcast_from_non_root_rank_reaches_every_rank() {
    // Regression test: tree re-rooting must work for any root, not just
    // rank 0 — a fixed-size tree whose shape does not happen to be
    // symmetric under `rank ^ root` for every rank.
    const N: u32 = 5;
    let port = spawn_mock_tracker(N);

    let handles: Vec<_> = (0..N)
        .map(|_| {
            run_worker(port, N, |comm| {
                let mut payload = if comm.rank() == 2 {
                    *b"root-is-two"
                } else {
                    [0u8; 11]
                };
                comm.broadcast(&Buffer::from_slice_mut(&mut payload), 2).unwrap();
                payload
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(&handle.join().unwrap(), b"root-is-two");
    }
}

#[test]
fn allgather_combines_unequal_sized_per_rank_buffers() {
    const N: u32 = 4;
    let port = spawn_mock_tracker(N);

    let handles: Vec<_> = (0..N)
        .map(|_| {
            run_worker(port, N, |comm| {
                let n = comm.world_size() as usize;
                let mut storage: Vec<Vec<u8>> = (0..n).map(|i| vec![0u8; i + n]).collect();
                let me = comm.rank() as usize;
                for b in storage[me].iter_mut() {
                    *b = (comm.rank() + 1) as u8;
                }
                let mut bufs: Vec<Buffer> = storage.iter_mut().map(|s| Buffer::from_slice_mut(s)).collect();
                comm.allgather(&mut bufs).unwrap();
                storage
            })
        })
        .collect();

    for handle in handles {
        let storage = handle.join().unwrap();
        for (rank, slot) in storage.iter().enumerate() {
            assert_eq!(slot.len(), rank + N as usize);
            assert!(slot.iter().all(|&b| b == (rank as u8 + 1)));
        }
    }
}

#[test]
fn send_recv_roundtrip_between_two_ranks() {
    const N: u32 = 2;
    let port = spawn_mock_tracker(N);

    let handles: Vec<_> = (0..N)
        .map(|_| {
            run_worker(port, N, |comm| {
                if comm.rank() == 0 {
                    let mut out = [42u8; 4];
                    comm.send(1, Buffer::from_slice_mut(&mut out)).unwrap();
                    None
                } else {
                    let mut inbuf = [0u8; 4];
                    comm.recv(0, Buffer::from_slice_mut(&mut inbuf)).unwrap();
                    Some(inbuf)
                }
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
    assert_eq!(results.iter().find_map(|r| *r), Some([42u8; 4]));
}
