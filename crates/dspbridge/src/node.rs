//! Computation units running on the accelerator.

use core::mem;

use tracing::{debug, error, warn};

use crate::config::{round_up_to_page, DEFAULT_ALIGNMENT};
use crate::control::{ControlChannel, NodeHandle, Reply, Request, Timeout};
use crate::error::{BridgeError, Result};
use crate::message::{command, Message};
use crate::session::ProcessorSession;
use crate::storage::AlignedStorage;
use crate::uuid::DspUuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Allocated,
    Created,
    Running,
    Paused,
    Terminated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Device,
    Task,
    DaisSocket,
    Message,
}

/// Instantiation parameters for a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeAttrs {
    pub priority: i32,
    pub timeout_ms: u32,
    pub profile_id: u32,
    /// Private heap size in bytes; 0 for none. Rounded up to whole pages.
    pub heap_size: u32,
}

impl NodeAttrs {
    /// Largest private heap the bridge backs with host memory.
    pub const MAX_HEAP_SIZE: u32 = 256 << 20;
}

/// An entry of the driver's node database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeProps {
    pub uuid: DspUuid,
    pub name: String,
    pub node_type: NodeType,
}

/// A handle to a node plus the host resources bound to it.
///
/// The private heap and the message-buffer segment are released only after the accelerator
/// has deleted the node. A node that cannot be deleted keeps them forever.
pub struct Node<'a, C: ControlChannel> {
    session: &'a ProcessorSession<C>,
    handle: NodeHandle,
    uuid: DspUuid,
    state: NodeState,
    heap: Option<AlignedStorage>,
    message_segment: Option<AlignedStorage>,
    exit_status: Option<u32>,
}

impl<'a, C: ControlChannel> Node<'a, C> {
    /// Instantiates node `uuid` on the session's processor.
    ///
    /// A requested private heap is allocated host-side before anything is asked of the driver.
    /// Message-capable nodes also get the shared-memory pool segment; if that fails the node is
    /// deleted again. Driver failures in that step report [`BridgeError::AllocateFailed`], while
    /// running out of host memory for the segment reports [`BridgeError::OutOfMemory`].
    pub fn allocate(
        session: &'a ProcessorSession<C>,
        uuid: DspUuid,
        attrs: Option<NodeAttrs>,
    ) -> Result<Self> {
        let attrs = attrs.unwrap_or_default();
        let mut heap = match attrs.heap_size {
            0 => None,
            size if size > NodeAttrs::MAX_HEAP_SIZE => {
                warn!(%uuid, size, "refusing oversized node heap");
                return Err(BridgeError::OutOfMemory {
                    len: size as usize,
                });
            }
            size => {
                let len = usize::try_from(round_up_to_page(u64::from(size))).map_err(|_| {
                    BridgeError::OutOfMemory {
                        len: size as usize,
                    }
                })?;
                Some(AlignedStorage::allocate(len, DEFAULT_ALIGNMENT)?)
            }
        };

        let handle = match session.request(
            Request::NodeAllocate {
                processor: session.processor(),
                uuid,
                attrs,
                heap: heap.as_mut().map(AlignedStorage::region),
            },
            BridgeError::AllocateFailed,
        )? {
            Reply::NodeAllocated(handle) => handle,
            _ => return Err(BridgeError::UnexpectedReply { op: "node allocate" }),
        };

        let mut node = Self {
            session,
            handle,
            uuid,
            state: NodeState::Allocated,
            heap,
            message_segment: None,
            exit_status: None,
        };

        if let Err(err) = node.attach_message_segment() {
            error!(%uuid, %err, "message segment setup failed; deleting node");
            // Drop performs the delete and decides whether host resources may be released.
            drop(node);
            return Err(err);
        }

        debug!(%uuid, heap = node.heap_len(), "node allocated");
        Ok(node)
    }

    fn attach_message_segment(&mut self) -> Result<()> {
        let segment = match self.session.request(
            Request::SharedMemoryInfo {
                processor: self.session.processor(),
            },
            BridgeError::AllocateFailed,
        )? {
            Reply::SharedMemory(segment) => segment,
            _ => {
                return Err(BridgeError::UnexpectedReply {
                    op: "shared memory info",
                })
            }
        };
        let Some(segment) = segment.filter(|s| s.size > 0) else {
            return Ok(());
        };

        let node_type = match self.session.request(
            Request::NodeGetAttr { node: self.handle },
            BridgeError::AllocateFailed,
        )? {
            Reply::NodeAttr(node_type) => node_type,
            _ => return Err(BridgeError::UnexpectedReply { op: "node get attr" }),
        };
        if node_type == NodeType::Device {
            return Ok(());
        }

        let mut storage = AlignedStorage::allocate(segment.size, 0)?;
        self.session.request(
            Request::NodeAllocMessageBuffer {
                node: self.handle,
                region: storage.region(),
            },
            BridgeError::AllocateFailed,
        )?;
        self.message_segment = Some(storage);
        Ok(())
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    pub fn uuid(&self) -> DspUuid {
        self.uuid
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Exit status reported by the last successful [`Node::terminate`].
    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }

    /// Bytes of private heap still held for this node.
    pub fn heap_len(&self) -> usize {
        self.heap.as_ref().map_or(0, AlignedStorage::len)
    }

    /// Bytes of message-buffer segment still held for this node.
    pub fn message_segment_len(&self) -> usize {
        self.message_segment.as_ref().map_or(0, AlignedStorage::len)
    }

    fn expect_state(&self, op: &'static str, allowed: &[NodeState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(BridgeError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    /// Allocated → Created. On failure the node stays allocated and can still be freed.
    pub fn create(&mut self) -> Result<()> {
        self.expect_state("create", &[NodeState::Allocated])?;
        self.session.request(
            Request::NodeCreate { node: self.handle },
            BridgeError::CreateFailed,
        )?;
        self.transition(NodeState::Created);
        Ok(())
    }

    /// Created → Running, or resumes a paused node.
    pub fn run(&mut self) -> Result<()> {
        self.expect_state("run", &[NodeState::Created, NodeState::Paused])?;
        self.session
            .request(Request::NodeRun { node: self.handle }, BridgeError::RunFailed)?;
        self.transition(NodeState::Running);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.expect_state("pause", &[NodeState::Running])?;
        self.session.request(
            Request::NodePause { node: self.handle },
            BridgeError::PauseFailed,
        )?;
        self.transition(NodeState::Paused);
        Ok(())
    }

    /// Sends one message. A timeout leaves the node state untouched.
    pub fn put_message(&mut self, message: &Message, timeout: Timeout) -> Result<()> {
        self.expect_state("put message", &[NodeState::Running])?;
        if message.command == command::DRIVER_RESERVED {
            return Err(BridgeError::ReservedCommand(message.command));
        }
        self.session.request(
            Request::NodePutMessage {
                node: self.handle,
                message: *message,
                timeout,
            },
            BridgeError::PutMessageFailed,
        )?;
        Ok(())
    }

    /// Receives one message. A timeout leaves the node state untouched.
    pub fn get_message(&mut self, timeout: Timeout) -> Result<Message> {
        self.expect_state("get message", &[NodeState::Running])?;
        match self.session.request(
            Request::NodeGetMessage {
                node: self.handle,
                timeout,
            },
            BridgeError::GetMessageFailed,
        )? {
            Reply::Message(message) => Ok(message),
            _ => Err(BridgeError::UnexpectedReply { op: "get message" }),
        }
    }

    /// Stops the node and returns its exit status.
    pub fn terminate(&mut self) -> Result<u32> {
        self.expect_state("terminate", &[NodeState::Running, NodeState::Paused])?;
        let exit_status = match self.session.request(
            Request::NodeTerminate { node: self.handle },
            BridgeError::TerminateFailed,
        )? {
            Reply::Terminated { exit_status } => exit_status,
            _ => return Err(BridgeError::UnexpectedReply { op: "node terminate" }),
        };
        self.exit_status = Some(exit_status);
        self.transition(NodeState::Terminated);
        Ok(exit_status)
    }

    /// Deletes the node on the accelerator, then releases its host resources.
    ///
    /// Works from every state and is a no-op once the node is deleted. If the delete fails the
    /// heap and message segment are kept, since the accelerator may still be using them.
    pub fn free(&mut self) -> Result<()> {
        if self.state == NodeState::Deleted {
            return Ok(());
        }
        if let Err(err) = self.session.request(
            Request::NodeDelete { node: self.handle },
            BridgeError::DeleteFailed,
        ) {
            error!(
                uuid = %self.uuid,
                state = ?self.state,
                %err,
                "node delete failed; keeping host resources"
            );
            return Err(err);
        }
        self.transition(NodeState::Deleted);
        self.heap = None;
        self.message_segment = None;
        Ok(())
    }

    /// [`Node::free`] for an optional node; freeing nothing succeeds.
    pub fn free_if_present(node: Option<&mut Self>) -> Result<()> {
        match node {
            Some(node) => node.free(),
            None => Ok(()),
        }
    }

    fn transition(&mut self, next: NodeState) {
        debug!(uuid = %self.uuid, from = ?self.state, to = ?next, "node state");
        self.state = next;
    }
}

impl<C: ControlChannel> Drop for Node<'_, C> {
    fn drop(&mut self) {
        if self.state == NodeState::Deleted {
            return;
        }
        warn!(uuid = %self.uuid, state = ?self.state, "node dropped without free");
        if self.free().is_err() {
            warn!(uuid = %self.uuid, "leaking node heap and message segment");
            mem::forget(self.heap.take());
            mem::forget(self.message_segment.take());
        }
    }
}
