//! C4: Tracker Client.
//!
//! One blocking TCP connection to the tracker process, serialized behind a
//! mutex. Tracker traffic is low-volume control chatter (registration,
//! barriers, checkpoints, heartbeats) so, unlike worker-to-worker transfers,
//! it has no reason to go through the non-blocking adapter; the source
//! makes the same choice in `comm/tracker.cc`.

use crate::backend::PeerAddr;
use crate::error::{Error, Result};
use crate::framing::{read_bytes, read_str, read_u32, write_bytes, write_i32, write_str, write_u32};
use crate::Rank;
use std::io::{BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

const RETRY_BACKOFF: Duration = Duration::from_secs(1);
const EXCLUDE_RETRY_BACKOFF: Duration = Duration::from_micros(10);
const ACK_OK: u32 = 0;

pub struct TrackerClient {
    conn: Mutex<Conn>,
}

struct Conn {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

/// What the tracker assigned this worker on `start`/`restart`.
#[derive(Debug, Clone)]
pub struct StartReply {
    pub rank: Rank,
    pub world_size: u32,
    pub peers: Vec<PeerAddr>,
}

/// A loaded checkpoint: the tracker-owned version counter plus the two
/// opaque blobs registered via [`crate::checkpoint`].
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub version: u32,
    pub global: Vec<u8>,
    pub local: Vec<u8>,
}

impl TrackerClient {
    /// Connects to the tracker, retrying with a 1s backoff up to
    /// `connect_retry` times, mirroring the source's connect loop.
    pub fn connect(uri: &str, port: u16, connect_retry: u32) -> Result<Self> {
        let mut attempt = 0u32;
        let stream = loop {
            match TcpStream::connect((uri, port)) {
                Ok(s) => break s,
                Err(e) => {
                    attempt += 1;
                    if attempt > connect_retry {
                        return Err(Error::TrackerUnreachable {
                            uri: uri.to_string(),
                            port,
                            attempts: attempt,
                        });
                    }
                    log::warn!("tracker connect attempt {attempt} failed: {e}; retrying in 1s");
                    thread::sleep(RETRY_BACKOFF);
                }
            }
        };
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);
        Ok(TrackerClient {
            conn: Mutex::new(Conn { reader, writer }),
        })
    }

    /// Registers with the tracker as a fresh or restarting worker,
    /// advertising the address this worker's own listener is already bound
    /// to, and receives back an assigned rank, the world size, and the peer
    /// table (which the tracker can only build once every worker has
    /// registered its own `host`/`port`).
    pub fn start(
        &self,
        rank_hint: Option<Rank>,
        world_size_hint: u32,
        restart: bool,
        host: &str,
        port: u16,
    ) -> Result<StartReply> {
        let mut conn = self.conn.lock().unwrap();
        write_str(&mut conn.writer, if restart { "restart" } else { "start" })?;
        write_i32(&mut conn.writer, rank_hint.map(|r| r as i32).unwrap_or(-1))?;
        write_u32(&mut conn.writer, world_size_hint)?;
        write_str(&mut conn.writer, host)?;
        write_u32(&mut conn.writer, port as u32)?;
        conn.writer.flush()?;

        let rank = read_u32(&mut conn.reader)?;
        let world_size = read_u32(&mut conn.reader)?;
        let n_peers = read_u32(&mut conn.reader)?;
        let mut peers = Vec::with_capacity(n_peers as usize);
        for _ in 0..n_peers {
            let addr = read_str(&mut conn.reader)?;
            peers.push(addr.parse().map_err(|_| Error::TrackerProtocol {
                expected: "backend:host:port".to_string(),
                got: addr.clone(),
            })?);
        }
        Ok(StartReply {
            rank,
            world_size,
            peers,
        })
    }

    /// Tells the tracker this worker has finished `ReConnectLinks` for
    /// communicator `name` and is ready to take part in its collectives.
    pub fn register(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        write_str(&mut conn.writer, "register")?;
        write_str(&mut conn.writer, name)?;
        conn.writer.flush()?;
        ack(&mut conn.reader)
    }

    /// Blocks until every live rank in communicator `name` has called
    /// `barrier`.
    pub fn barrier(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        write_str(&mut conn.writer, "barrier")?;
        write_str(&mut conn.writer, name)?;
        conn.writer.flush()?;
        expect_token(&mut conn.reader, "barrier_done")
    }

    /// Acquires the tracker's mutual-exclusion lock for communicator `name`,
    /// retrying with a short backoff until granted.
    pub fn exclude(&self, name: &str) -> Result<()> {
        loop {
            let mut conn = self.conn.lock().unwrap();
            write_str(&mut conn.writer, "exclude")?;
            write_str(&mut conn.writer, name)?;
            conn.writer.flush()?;
            let token = read_str(&mut conn.reader)?;
            drop(conn);
            if token == "exclude_done" {
                return Ok(());
            }
            thread::sleep(EXCLUDE_RETRY_BACKOFF);
        }
    }

    /// Releases the tracker's mutual-exclusion lock for communicator `name`.
    pub fn unexclude(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        write_str(&mut conn.writer, "unexclude")?;
        write_str(&mut conn.writer, name)?;
        conn.writer.flush()?;
        expect_token(&mut conn.reader, "unexclude_done")
    }

    /// Uploads a new checkpoint; returns the tracker-assigned version.
    pub fn checkpoint(&self, global: &[u8], local: &[u8]) -> Result<u32> {
        let mut conn = self.conn.lock().unwrap();
        write_str(&mut conn.writer, "checkpoint")?;
        write_bytes(&mut conn.writer, global)?;
        write_bytes(&mut conn.writer, local)?;
        conn.writer.flush()?;
        ack(&mut conn.reader)?;
        read_u32(&mut conn.reader)
    }

    /// Fetches the last checkpoint, or `None` if nothing was ever saved.
    pub fn load_checkpoint(&self) -> Result<Option<LoadedCheckpoint>> {
        let mut conn = self.conn.lock().unwrap();
        write_str(&mut conn.writer, "load_checkpoint")?;
        conn.writer.flush()?;
        let version = read_u32(&mut conn.reader)?;
        if version == 0 {
            return Ok(None);
        }
        let global = read_bytes(&mut conn.reader)?;
        let local = read_bytes(&mut conn.reader)?;
        Ok(Some(LoadedCheckpoint {
            version,
            global,
            local,
        }))
    }

    /// Pings the tracker and returns the ranks it has newly marked dead.
    pub fn heartbeat(&self) -> Result<Vec<Rank>> {
        let mut conn = self.conn.lock().unwrap();
        write_str(&mut conn.writer, "heartbeat")?;
        conn.writer.flush()?;
        let n_dead = read_u32(&mut conn.reader)?;
        let mut dead = Vec::with_capacity(n_dead as usize);
        for _ in 0..n_dead {
            dead.push(read_u32(&mut conn.reader)?);
        }
        Ok(dead)
    }

    /// Sends a message for the tracker to print on its console, matching
    /// `TrackerPrint` in the source.
    pub fn print(&self, message: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        write_str(&mut conn.writer, "print")?;
        write_str(&mut conn.writer, message)?;
        conn.writer.flush()?;
        ack(&mut conn.reader)
    }

    /// Tells the tracker this worker is shutting down cleanly.
    pub fn shutdown(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        write_str(&mut conn.writer, "shutdown")?;
        conn.writer.flush()?;
        ack(&mut conn.reader)
    }
}

fn ack(reader: &mut BufReader<TcpStream>) -> Result<()> {
    let code = read_u32(reader)?;
    if code == ACK_OK {
        Ok(())
    } else {
        Err(Error::TrackerProtocol {
            expected: ACK_OK.to_string(),
            got: code.to_string(),
        })
    }
}

fn expect_token(reader: &mut BufReader<TcpStream>, expected: &str) -> Result<()> {
    let token = read_str(reader)?;
    if token == expected {
        Ok(())
    } else {
        Err(Error::TrackerProtocol {
            expected: expected.to_string(),
            got: token,
        })
    }
}
