//! Synchronous request/reply seam to the bridge driver.
//!
//! Every host-side operation is expressed as one [`Request`] handed to a [`ControlChannel`],
//! which blocks until the privileged arbitration layer answers with a [`Reply`] (or fails). The
//! request set is closed: driver-generation differences (opcode numbers, argument layout) live
//! entirely inside a channel implementation.

use core::fmt;
use core::marker::PhantomData;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::error::{BridgeError, Result};
use crate::message::Message;
use crate::node::{NodeAttrs, NodeProps, NodeType};
use crate::session::ProcessorEvents;
use crate::uuid::{DspUuid, ObjectKind};

/// Raw status word returned by the driver. Negative values are failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverStatus(pub i32);

impl DriverStatus {
    pub const OK: DriverStatus = DriverStatus(0);

    pub const fn is_success(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0 as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("driver returned status {0}")]
    Failed(DriverStatus),

    #[error("request timed out")]
    Timeout,

    #[error("control channel disconnected")]
    Disconnected,
}

pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a driver-issued identifier. Only channel implementations should call this.
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

opaque_handle!(
    /// An open control-channel instance.
    ChannelHandle
);
opaque_handle!(
    /// An attachment to one accelerator instance.
    ProcessorHandle
);
opaque_handle!(
    /// A computation unit instantiated on the accelerator.
    NodeHandle
);
opaque_handle!(
    /// A range of accelerator address space set aside for one mapping.
    ReservationToken
);
opaque_handle!(
    /// A live binding of host memory into a reserved range.
    MappingToken
);

/// An address in the accelerator's address space.
///
/// This is the only form in which a mapped location leaves the bridge: as the `arg1`/`arg2`
/// payload of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAddress(pub u32);

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Host memory handed to the driver for mapping or cache maintenance.
///
/// A region exclusively borrows the storage it describes for `'a`, and only the bridge can
/// create one. A [`Request`] carrying a region therefore cannot outlive that storage, and a
/// channel cannot keep it past the call it was handed to.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct HostRegion<'a> {
    addr: usize,
    len: usize,
    _storage: PhantomData<&'a mut [u8]>,
}

impl<'a> HostRegion<'a> {
    pub(crate) fn from_mut_slice(data: &'a mut [u8]) -> Self {
        Self {
            addr: data.as_mut_ptr() as usize,
            len: data.len(),
            _storage: PhantomData,
        }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of the borrowed storage.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region was built from a `&'a mut [u8]` that is still borrowed, so the
        // bytes are live and nothing else references them.
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }

    /// Mutable access to the borrowed storage.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as for `as_slice`; the returned borrow is tied to `&mut self`.
        unsafe { std::slice::from_raw_parts_mut(self.addr as *mut u8, self.len) }
    }
}

/// How long a blocking message request may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    Finite(Duration),
}

impl Timeout {
    /// Wire encoding of [`Timeout::Infinite`].
    pub const INFINITE_WIRE: u32 = u32::MAX;

    pub fn from_millis(ms: u64) -> Self {
        Timeout::Finite(Duration::from_millis(ms))
    }

    /// Milliseconds as the driver expects them; finite values saturate just below the sentinel.
    pub fn to_wire(self) -> u32 {
        match self {
            Timeout::Infinite => Self::INFINITE_WIRE,
            Timeout::Finite(d) => u32::try_from(d.as_millis())
                .unwrap_or(Self::INFINITE_WIRE - 1)
                .min(Self::INFINITE_WIRE - 1),
        }
    }
}

/// Size of the shared-memory pool segment the driver can hand to message nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub size: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Request<'a> {
    Open,
    Close {
        channel: ChannelHandle,
    },
    Attach {
        processor: u32,
    },
    Detach {
        processor: ProcessorHandle,
    },
    Register {
        uuid: DspUuid,
        kind: ObjectKind,
        path: PathBuf,
    },
    Unregister {
        uuid: DspUuid,
        kind: ObjectKind,
    },
    EnumerateNode {
        index: u32,
    },
    RegisterNotify {
        processor: ProcessorHandle,
        events: ProcessorEvents,
    },
    WaitForEvents {
        processor: ProcessorHandle,
        timeout: Timeout,
    },
    NodeAllocate {
        processor: ProcessorHandle,
        uuid: DspUuid,
        attrs: NodeAttrs,
        heap: Option<HostRegion<'a>>,
    },
    NodeGetAttr {
        node: NodeHandle,
    },
    NodeAllocMessageBuffer {
        node: NodeHandle,
        region: HostRegion<'a>,
    },
    NodeCreate {
        node: NodeHandle,
    },
    NodeRun {
        node: NodeHandle,
    },
    NodePause {
        node: NodeHandle,
    },
    NodeTerminate {
        node: NodeHandle,
    },
    NodeDelete {
        node: NodeHandle,
    },
    NodePutMessage {
        node: NodeHandle,
        message: Message,
        timeout: Timeout,
    },
    NodeGetMessage {
        node: NodeHandle,
        timeout: Timeout,
    },
    SharedMemoryInfo {
        processor: ProcessorHandle,
    },
    Reserve {
        processor: ProcessorHandle,
        size: u64,
    },
    Unreserve {
        processor: ProcessorHandle,
        reservation: ReservationToken,
    },
    Map {
        processor: ProcessorHandle,
        host: HostRegion<'a>,
        reservation: ReservationToken,
    },
    Unmap {
        processor: ProcessorHandle,
        mapping: MappingToken,
    },
    Flush {
        processor: ProcessorHandle,
        host: HostRegion<'a>,
    },
    Invalidate {
        processor: ProcessorHandle,
        host: HostRegion<'a>,
    },
}

/// Field-less discriminant of [`Request`], used for logging and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Open,
    Close,
    Attach,
    Detach,
    Register,
    Unregister,
    EnumerateNode,
    RegisterNotify,
    WaitForEvents,
    NodeAllocate,
    NodeGetAttr,
    NodeAllocMessageBuffer,
    NodeCreate,
    NodeRun,
    NodePause,
    NodeTerminate,
    NodeDelete,
    NodePutMessage,
    NodeGetMessage,
    SharedMemoryInfo,
    Reserve,
    Unreserve,
    Map,
    Unmap,
    Flush,
    Invalidate,
}

impl RequestKind {
    pub fn name(self) -> &'static str {
        match self {
            RequestKind::Open => "open",
            RequestKind::Close => "close",
            RequestKind::Attach => "attach",
            RequestKind::Detach => "detach",
            RequestKind::Register => "register",
            RequestKind::Unregister => "unregister",
            RequestKind::EnumerateNode => "enumerate node",
            RequestKind::RegisterNotify => "register notify",
            RequestKind::WaitForEvents => "wait for events",
            RequestKind::NodeAllocate => "node allocate",
            RequestKind::NodeGetAttr => "node get attr",
            RequestKind::NodeAllocMessageBuffer => "node alloc message buffer",
            RequestKind::NodeCreate => "node create",
            RequestKind::NodeRun => "node run",
            RequestKind::NodePause => "node pause",
            RequestKind::NodeTerminate => "node terminate",
            RequestKind::NodeDelete => "node delete",
            RequestKind::NodePutMessage => "put message",
            RequestKind::NodeGetMessage => "get message",
            RequestKind::SharedMemoryInfo => "shared memory info",
            RequestKind::Reserve => "reserve",
            RequestKind::Unreserve => "unreserve",
            RequestKind::Map => "map",
            RequestKind::Unmap => "unmap",
            RequestKind::Flush => "flush",
            RequestKind::Invalidate => "invalidate",
        }
    }
}

impl Request<'_> {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Open => RequestKind::Open,
            Request::Close { .. } => RequestKind::Close,
            Request::Attach { .. } => RequestKind::Attach,
            Request::Detach { .. } => RequestKind::Detach,
            Request::Register { .. } => RequestKind::Register,
            Request::Unregister { .. } => RequestKind::Unregister,
            Request::EnumerateNode { .. } => RequestKind::EnumerateNode,
            Request::RegisterNotify { .. } => RequestKind::RegisterNotify,
            Request::WaitForEvents { .. } => RequestKind::WaitForEvents,
            Request::NodeAllocate { .. } => RequestKind::NodeAllocate,
            Request::NodeGetAttr { .. } => RequestKind::NodeGetAttr,
            Request::NodeAllocMessageBuffer { .. } => RequestKind::NodeAllocMessageBuffer,
            Request::NodeCreate { .. } => RequestKind::NodeCreate,
            Request::NodeRun { .. } => RequestKind::NodeRun,
            Request::NodePause { .. } => RequestKind::NodePause,
            Request::NodeTerminate { .. } => RequestKind::NodeTerminate,
            Request::NodeDelete { .. } => RequestKind::NodeDelete,
            Request::NodePutMessage { .. } => RequestKind::NodePutMessage,
            Request::NodeGetMessage { .. } => RequestKind::NodeGetMessage,
            Request::SharedMemoryInfo { .. } => RequestKind::SharedMemoryInfo,
            Request::Reserve { .. } => RequestKind::Reserve,
            Request::Unreserve { .. } => RequestKind::Unreserve,
            Request::Map { .. } => RequestKind::Map,
            Request::Unmap { .. } => RequestKind::Unmap,
            Request::Flush { .. } => RequestKind::Flush,
            Request::Invalidate { .. } => RequestKind::Invalidate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The request succeeded and carries no result.
    Done,
    Opened(ChannelHandle),
    Attached(ProcessorHandle),
    /// `None` once the enumeration index runs past the last entry.
    NodeEntry(Option<NodeProps>),
    Events(ProcessorEvents),
    NodeAllocated(NodeHandle),
    NodeAttr(NodeType),
    Terminated {
        exit_status: u32,
    },
    Message(Message),
    SharedMemory(Option<SegmentInfo>),
    Reserved(ReservationToken),
    Mapped {
        mapping: MappingToken,
        device_address: DeviceAddress,
    },
}

/// Opaque synchronous transport to the arbitration layer.
///
/// Implementations block the caller until the request completes. They are not required to be
/// thread-safe; a session owns its channel and serializes all requests.
///
/// Host regions inside a request are only valid for the duration of the call:
///
/// ```compile_fail
/// use std::cell::RefCell;
/// use dspbridge::{ChannelResult, ControlChannel, Reply, Request};
///
/// struct Recorder {
///     seen: RefCell<Vec<Request<'static>>>,
/// }
///
/// impl ControlChannel for Recorder {
///     fn transact(&self, request: Request<'_>) -> ChannelResult<Reply> {
///         self.seen.borrow_mut().push(request);
///         Ok(Reply::Done)
///     }
/// }
/// ```
pub trait ControlChannel {
    fn transact(&self, request: Request<'_>) -> ChannelResult<Reply>;
}

/// Issues `request`, logging it and lifting a channel failure through `wrap`.
pub(crate) fn issue<C: ControlChannel + ?Sized>(
    channel: &C,
    request: Request<'_>,
    wrap: fn(ChannelError) -> BridgeError,
) -> Result<Reply> {
    let op = request.kind().name();
    tracing::trace!(op, "driver request");
    channel.transact(request).map_err(|err| {
        tracing::debug!(op, %err, "driver request failed");
        BridgeError::from_channel(op, err, wrap)
    })
}

impl<C: ControlChannel + ?Sized> ControlChannel for &C {
    fn transact(&self, request: Request<'_>) -> ChannelResult<Reply> {
        (**self).transact(request)
    }
}

impl<C: ControlChannel + ?Sized> ControlChannel for Box<C> {
    fn transact(&self, request: Request<'_>) -> ChannelResult<Reply> {
        (**self).transact(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_wire_encoding() {
        assert_eq!(Timeout::Infinite.to_wire(), u32::MAX);
        assert_eq!(Timeout::from_millis(0).to_wire(), 0);
        assert_eq!(Timeout::from_millis(250).to_wire(), 250);
        // Finite timeouts never collide with the infinite sentinel.
        assert_eq!(
            Timeout::Finite(Duration::from_secs(u64::MAX / 2)).to_wire(),
            u32::MAX - 1
        );
    }

    #[test]
    fn driver_status_sign_decides_success() {
        assert!(DriverStatus::OK.is_success());
        assert!(DriverStatus(0x8000).is_success());
        assert!(!DriverStatus(0x8000_8008u32 as i32).is_success());
        assert_eq!(DriverStatus(0x8000_8008u32 as i32).to_string(), "0x80008008");
    }

    #[test]
    fn host_region_reaches_only_its_storage() {
        let mut data = [0u8; 64];
        let mut region = HostRegion::from_mut_slice(&mut data[8..24]);
        assert_eq!(region.len(), 16);
        region.as_mut_slice().fill(0xaa);
        assert!(region.as_slice().iter().all(|&b| b == 0xaa));

        assert_eq!(data[7], 0);
        assert_eq!(data[8], 0xaa);
        assert_eq!(data[23], 0xaa);
        assert_eq!(data[24], 0);
    }

    #[test]
    fn request_kind_names_are_distinct() {
        let kinds = [
            RequestKind::Reserve,
            RequestKind::Unreserve,
            RequestKind::Map,
            RequestKind::Unmap,
            RequestKind::Flush,
            RequestKind::Invalidate,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a.name(), b.name());
            }
        }
        assert_eq!(
            Request::Open.kind(),
            RequestKind::Open,
            "open request must map to its own kind"
        );
    }
}
