//! C5: Heartbeat Daemon.
//!
//! A background thread that pings the tracker on `heartbeat_interval` and
//! folds any newly-dead ranks it reports into a shared set the communicator
//! consults before posting sends, mirroring `Deamon::Heartbeat` in the
//! source (`comm/demaon.cc`).

use crate::tracker::TrackerClient;
use crate::Rank;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Default)]
struct DeadSet {
    ranks: Mutex<HashSet<Rank>>,
}

impl DeadSet {
    fn extend(&self, newly_dead: impl IntoIterator<Item = Rank>) {
        self.ranks.lock().unwrap().extend(newly_dead);
    }

    fn contains(&self, rank: Rank) -> bool {
        self.ranks.lock().unwrap().contains(&rank)
    }

    fn snapshot(&self) -> Vec<Rank> {
        self.ranks.lock().unwrap().iter().copied().collect()
    }
}

/// Owns the background heartbeat thread for one tracker connection.
pub struct Heartbeat {
    dead: Arc<DeadSet>,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Spawns the daemon thread. It runs until [`Heartbeat::stop`] is called,
    /// dropped, or the tracker connection is lost.
    pub fn spawn(tracker: Arc<TrackerClient>, interval: Duration) -> Self {
        let dead = Arc::new(DeadSet::default());
        let stop = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(true));

        let dead2 = Arc::clone(&dead);
        let stop2 = Arc::clone(&stop);
        let connected2 = Arc::clone(&connected);
        let handle = thread::Builder::new()
            .name("rdc-heartbeat".to_string())
            .spawn(move || run(tracker, interval, dead2, stop2, connected2))
            .expect("spawn rdc heartbeat thread");

        Heartbeat {
            dead,
            stop,
            connected,
            handle: Some(handle),
        }
    }

    pub fn is_dead(&self, rank: Rank) -> bool {
        self.dead.contains(rank)
    }

    pub fn dead_ranks(&self) -> Vec<Rank> {
        self.dead.snapshot()
    }

    pub fn is_tracker_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    tracker: Arc<TrackerClient>,
    interval: Duration,
    dead: Arc<DeadSet>,
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(interval);
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match tracker.heartbeat() {
            Ok(newly_dead) => {
                if !newly_dead.is_empty() {
                    log::warn!("tracker reports newly dead ranks: {newly_dead:?}");
                }
                dead.extend(newly_dead);
            }
            Err(e) => {
                log::warn!("heartbeat read failed, tracker connection lost: {e}");
                connected.store(false, Ordering::SeqCst);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_set_tracks_ranks() {
        let dead = DeadSet::default();
        assert!(!dead.contains(3));
        dead.extend([1, 3, 5]);
        assert!(dead.contains(3));
        assert!(!dead.contains(2));
        let mut snap = dead.snapshot();
        snap.sort();
        assert_eq!(snap, vec![1, 3, 5]);
    }
}
