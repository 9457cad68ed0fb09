use thiserror::Error;

use crate::control::ChannelError;
use crate::message::DecodeError;
use crate::node::NodeState;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors surfaced by the bridge.
///
/// Driver-originated failures keep the [`ChannelError`] that caused them so callers can see the
/// raw driver status. A timed-out request is always reported as [`BridgeError::Timeout`],
/// independent of which operation issued it.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to open control channel: {0}")]
    OpenFailed(#[source] ChannelError),

    #[error("failed to close control channel: {0}")]
    CloseFailed(#[source] ChannelError),

    #[error("failed to attach to processor: {0}")]
    AttachFailed(#[source] ChannelError),

    #[error("failed to detach from processor: {0}")]
    DetachFailed(#[source] ChannelError),

    #[error("object registration failed: {0}")]
    RegisterFailed(#[source] ChannelError),

    #[error("object unregistration failed: {0}")]
    UnregisterFailed(#[source] ChannelError),

    #[error("node enumeration failed: {0}")]
    EnumerateFailed(#[source] ChannelError),

    #[error("processor notification request failed: {0}")]
    NotifyFailed(#[source] ChannelError),

    #[error("node allocation failed: {0}")]
    AllocateFailed(#[source] ChannelError),

    #[error("node creation failed: {0}")]
    CreateFailed(#[source] ChannelError),

    #[error("node run failed: {0}")]
    RunFailed(#[source] ChannelError),

    #[error("node pause failed: {0}")]
    PauseFailed(#[source] ChannelError),

    #[error("node termination failed: {0}")]
    TerminateFailed(#[source] ChannelError),

    #[error("node deletion failed: {0}")]
    DeleteFailed(#[source] ChannelError),

    #[error("sending message to node failed: {0}")]
    PutMessageFailed(#[source] ChannelError),

    #[error("receiving message from node failed: {0}")]
    GetMessageFailed(#[source] ChannelError),

    #[error("address-space reservation failed: {0}")]
    ReservationFailed(#[source] ChannelError),

    #[error("releasing address-space reservation failed: {0}")]
    UnreserveFailed(#[source] ChannelError),

    #[error("mapping buffer into accelerator address space failed: {0}")]
    MapFailed(#[source] ChannelError),

    #[error("unmapping buffer failed: {0}")]
    UnmapFailed(#[source] ChannelError),

    #[error("cache flush failed: {0}")]
    FlushFailed(#[source] ChannelError),

    #[error("cache invalidate failed: {0}")]
    InvalidateFailed(#[source] ChannelError),

    #[error("{op} timed out")]
    Timeout { op: &'static str },

    #[error("out of memory allocating {len} bytes")]
    OutOfMemory { len: usize },

    #[error("{op} is not valid for a node in state {state:?}")]
    InvalidState { op: &'static str, state: NodeState },

    #[error("buffer has no storage")]
    NoStorage,

    #[error("buffer is not mapped")]
    NotMapped,

    #[error("length {len} exceeds buffer length {capacity}")]
    LengthOutOfRange { len: usize, capacity: usize },

    #[error("command 0x{0:08x} is reserved and cannot carry a payload")]
    ReservedCommand(u32),

    #[error("message protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("output verification failed after {iteration} completed cycles")]
    OutputMismatch { iteration: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("driver sent an unexpected reply to {op}")]
    UnexpectedReply { op: &'static str },

    #[error("malformed message: {0}")]
    Decode(#[from] DecodeError),
}

impl BridgeError {
    /// Maps a channel failure for `op` onto `wrap`, keeping timeouts distinct.
    pub(crate) fn from_channel(
        op: &'static str,
        err: ChannelError,
        wrap: fn(ChannelError) -> BridgeError,
    ) -> Self {
        match err {
            ChannelError::Timeout => BridgeError::Timeout { op },
            other => wrap(other),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }
}
