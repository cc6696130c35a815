//! Crate-wide error type.
//!
//! Transient I/O is never surfaced directly — the channel retries inside the
//! event loop — everything else becomes a variant here and is either
//! attached to a work request's terminal [`crate::request::Status`] or
//! returned directly from a blocking call such as
//! [`crate::tracker::TrackerClient::connect`].

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("tracker protocol violation: expected {expected:?}, got {got:?}")]
    TrackerProtocol { expected: String, got: String },

    #[error("tracker unreachable at {uri}:{port} after {attempts} attempts")]
    TrackerUnreachable {
        uri: String,
        port: u16,
        attempts: u32,
    },

    #[error("channel to rank {rank} reported an error")]
    ChannelError { rank: crate::Rank },

    #[error("work request {id} was canceled")]
    Canceled { id: u64 },

    #[error("work request {id}'s channel was closed")]
    Closed { id: u64 },

    #[error("unknown work request id {0}")]
    UnknownRequest(u64),

    #[error("topology is invalid for world size {0}: {1}")]
    InvalidTopology(u32, &'static str),

    #[error("invalid peer address {0:?}")]
    InvalidAddress(String),

    #[error("backend {0:?} is not available in this build")]
    BackendUnavailable(crate::backend::Backend),

    #[error("{0} requested but manager is not initialized")]
    NotInitialized(&'static str),

    #[error("manager is already initialized")]
    AlreadyInitialized,

    #[error("no link to rank {0} in communicator {1:?}")]
    NoSuchPeer(crate::Rank, String),

    #[error("invalid environment value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("communicator {0:?} already exists")]
    CommunicatorExists(String),

    #[error("no such communicator {0:?}")]
    NoSuchCommunicator(String),
}
