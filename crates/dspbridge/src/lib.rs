//! Host-side bridge to a DSP coprocessor that shares memory with the host but not its caches.
//!
//! A [`ProcessorSession`] opens the control channel and attaches to one accelerator. Through it
//! the host maps [`Buffer`]s into the accelerator's address space, instantiates [`Node`]s and
//! drives them through their lifecycle, and exchanges fixed-size [`Message`]s with them. The
//! transport itself sits behind the [`ControlChannel`] trait; [`sim::SimulatedBridge`] provides
//! an in-process implementation.

mod buffer;
mod config;
mod control;
mod error;
mod exchange;
mod message;
mod node;
mod session;
mod storage;
mod uuid;

pub mod sim;

pub use crate::buffer::{Buffer, Direction, Origin};
pub use crate::config::{
    round_up_to_page, BufferConfig, GuardPages, DEFAULT_ALIGNMENT, PAGE_SIZE,
};
pub use crate::control::{
    ChannelError, ChannelHandle, ChannelResult, ControlChannel, DeviceAddress, DriverStatus,
    HostRegion, MappingToken, NodeHandle, ProcessorHandle, Reply, Request, RequestKind,
    ReservationToken, SegmentInfo, Timeout,
};
pub use crate::error::{BridgeError, Result};
pub use crate::exchange::{LoopbackPattern, MessageChannel, WorkCycle};
pub use crate::message::{command, Command, DecodeError, Message, MESSAGE_WIRE_BYTES};
pub use crate::node::{Node, NodeAttrs, NodeProps, NodeState, NodeType};
pub use crate::session::{ProcessorEvents, ProcessorSession};
pub use crate::uuid::{DspUuid, ObjectKind, ParseUuidError};

/// Cooperative stop request observed by [`MessageChannel::run_loop`] between cycles.
pub use tokio_util::sync::CancellationToken;
