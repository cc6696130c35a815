//! C8: Manager.
//!
//! The source keeps one process-wide `Communicator` behind a
//! double-checked-locking static (`comm/communicator_base.cc`'s
//! `GetCommunicator`/`Init`/`Finalize`). The spec's redesign note asks for
//! that to become an explicit, owned context instead of hidden global
//! state; this module is that context, with `once_cell::sync::OnceCell`
//! standing in only for the one thing that genuinely has to be process-wide
//! — letting [`init`]/[`global`] mirror the source's call sites without
//! reintroducing mutable global state everywhere else.

use crate::adapter::Adapter;
use crate::backend::{Backend, PeerAddr};
use crate::checkpoint::CheckpointStore;
use crate::communicator::Communicator;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::heartbeat::Heartbeat;
use crate::request::WorkRequestRegistry;
use crate::tracker::TrackerClient;
use crate::Rank;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

static GLOBAL: OnceCell<Manager> = OnceCell::new();

/// Name reserved for the communicator set up during `Init`, matching the
/// source's `kMainCommName`.
pub const MAIN_COMM_NAME: &str = "main";

/// Owns everything one worker process needs to take part in collectives:
/// the tracker connection, the event loop, the heartbeat daemon, and every
/// communicator built on top of them, keyed by name
/// (`CommunicatorManager` in the source).
pub struct Manager {
    config: Config,
    rank: Rank,
    world_size: u32,
    peers: Vec<PeerAddr>,
    adapter: Arc<Adapter>,
    registry: Arc<WorkRequestRegistry>,
    tracker: Arc<TrackerClient>,
    communicators: Mutex<HashMap<String, Arc<Communicator>>>,
    heartbeat: Mutex<Heartbeat>,
    checkpoints: Mutex<CheckpointStore>,
}

impl Manager {
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The communicator set up during `Init`, reachable under
    /// [`MAIN_COMM_NAME`].
    pub fn communicator(&self) -> Arc<Communicator> {
        self.get_communicator(MAIN_COMM_NAME)
            .expect("main communicator always exists after init")
    }

    /// Builds and registers a new, independently lockable communicator,
    /// matching `CommunicatorManager::NewCommunicator`.
    pub fn new_communicator(&self, name: &str) -> Result<Arc<Communicator>> {
        if self.communicators.lock().unwrap().contains_key(name) {
            return Err(Error::CommunicatorExists(name.to_string()));
        }
        let comm = Arc::new(Communicator::connect_links(
            name.to_string(),
            self.rank,
            self.world_size,
            Arc::clone(&self.adapter),
            Arc::clone(&self.registry),
            Arc::clone(&self.tracker),
            &self.peers,
            self.config.connect_retry,
            self.config.reduce_ring_mincount,
        )?);
        self.communicators
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&comm));
        Ok(comm)
    }

    /// Looks up a communicator previously built by [`Manager::new_communicator`].
    pub fn get_communicator(&self, name: &str) -> Result<Arc<Communicator>> {
        self.communicators
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NoSuchCommunicator(name.to_string()))
    }

    /// Tears down and rebuilds the links of every known communicator,
    /// matching `CommunicatorManager::ResetAllCommunicators` (used after a
    /// dead rank is replaced).
    pub fn reset_all_communicators(&self) -> Result<()> {
        let names: Vec<String> = self.communicators.lock().unwrap().keys().cloned().collect();
        for name in names {
            let comm = Communicator::connect_links(
                name.clone(),
                self.rank,
                self.world_size,
                Arc::clone(&self.adapter),
                Arc::clone(&self.registry),
                Arc::clone(&self.tracker),
                &self.peers,
                self.config.connect_retry,
                self.config.reduce_ring_mincount,
            )?;
            self.communicators.lock().unwrap().insert(name, Arc::new(comm));
        }
        Ok(())
    }

    pub fn tracker(&self) -> &TrackerClient {
        &self.tracker
    }

    pub fn is_rank_dead(&self, rank: Rank) -> bool {
        self.heartbeat.lock().unwrap().is_dead(rank)
    }

    pub fn dead_ranks(&self) -> Vec<Rank> {
        self.heartbeat.lock().unwrap().dead_ranks()
    }

    pub fn is_tracker_connected(&self) -> bool {
        self.heartbeat.lock().unwrap().is_tracker_connected()
    }

    /// Registers state for the next checkpoint.
    pub fn add_global_state(&self, name: &str, data: Vec<u8>) {
        self.checkpoints.lock().unwrap().add_global_state(name, data);
    }

    pub fn add_local_state(&self, name: &str, data: Vec<u8>) {
        self.checkpoints.lock().unwrap().add_local_state(name, data);
    }

    /// Ships the accumulated state to the tracker.
    pub fn checkpoint(&self) -> Result<u32> {
        self.checkpoints.lock().unwrap().checkpoint(&self.communicator())
    }

    /// Loads the tracker's last checkpoint into the local store; returns
    /// `false` if nothing was ever saved.
    pub fn load_checkpoint(&self) -> Result<bool> {
        self.checkpoints.lock().unwrap().load(&self.communicator())
    }

    pub fn local_checkpoint_state(&self, name: &str) -> Option<Vec<u8>> {
        self.checkpoints.lock().unwrap().local_state(name).map(<[u8]>::to_vec)
    }

    pub fn global_checkpoint_state(&self, name: &str) -> Option<Vec<u8>> {
        self.checkpoints.lock().unwrap().global_state(name).map(<[u8]>::to_vec)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.heartbeat.lock().unwrap().stop();
        self.tracker.shutdown()
    }
}

/// Connects to the tracker, builds the topology links, and installs the
/// result as the process-wide [`Manager`], matching `Allreduce::Init` /
/// `communicator_base.cc`'s `Init`. May only be called once per process;
/// a restarting worker should pass `config.restart = true` instead of
/// calling this twice.
pub fn init(mut config: Config) -> Result<()> {
    if GLOBAL.get().is_some() {
        return Err(Error::AlreadyInitialized);
    }
    config.backend.require_available()?;

    let tracker = Arc::new(TrackerClient::connect(
        &config.tracker_uri,
        config.tracker_port,
        config.connect_retry,
    )?);

    let adapter = Arc::new(crate::adapter::Adapter::new(config.num_workers)?);
    let listen_addr = "0.0.0.0:0".parse().unwrap();
    let bound = adapter.listen(listen_addr)?;

    let hostname = local_hostname();
    let reply = tracker.start(
        config.rank_hint.map(|r| r as Rank),
        config.pending_nodes,
        config.restart,
        &hostname,
        bound.port(),
    )?;

    let registry = Arc::new(WorkRequestRegistry::new());
    let heartbeat = Heartbeat::spawn(Arc::clone(&tracker), config.heartbeat_interval);

    let manager = Manager {
        rank: reply.rank,
        world_size: reply.world_size,
        peers: reply.peers,
        adapter,
        registry,
        tracker,
        communicators: Mutex::new(HashMap::new()),
        config,
        heartbeat: Mutex::new(heartbeat),
        checkpoints: Mutex::new(CheckpointStore::new()),
    };
    manager.new_communicator(MAIN_COMM_NAME)?;

    GLOBAL
        .set(manager)
        .map_err(|_| Error::AlreadyInitialized)?;
    Ok(())
}

/// Returns the process-wide [`Manager`] installed by [`init`].
pub fn global() -> Result<&'static Manager> {
    GLOBAL.get().ok_or(Error::NotInitialized("manager"))
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}

/// Only used by tests that need to assert on [`Backend`] gating before any
/// real tracker is involved.
#[cfg(test)]
pub(crate) fn backend_requires_tcp(backend: Backend) -> Result<()> {
    backend.require_available()
}
