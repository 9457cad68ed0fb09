use std::path::Path;

use bitflags::bitflags;
use tracing::{debug, error, warn};

use crate::buffer::{Buffer, Direction};
use crate::config::BufferConfig;
use crate::control::{
    issue, ChannelHandle, ControlChannel, ProcessorHandle, Reply, Request, Timeout,
};
use crate::error::{BridgeError, Result};
use crate::node::{Node, NodeAttrs, NodeProps};
use crate::uuid::{DspUuid, ObjectKind};

bitflags! {
    /// Asynchronous processor conditions a session can wait for.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ProcessorEvents: u32 {
        const MMU_FAULT = 0x0000_0010;
        const SYS_ERROR = 0x0000_0020;
    }
}

/// An open control channel attached to one accelerator instance.
///
/// Every buffer and node borrows the session, so the borrow checker enforces the teardown
/// order: buffers and nodes go first, then the session detaches and closes the channel.
pub struct ProcessorSession<C: ControlChannel> {
    channel: C,
    channel_handle: ChannelHandle,
    processor: ProcessorHandle,
    index: u32,
    config: BufferConfig,
    released: bool,
}

impl<C: ControlChannel> ProcessorSession<C> {
    pub fn open(channel: C, processor_index: u32) -> Result<Self> {
        Self::open_with_config(channel, processor_index, BufferConfig::default())
    }

    /// Opens the channel and attaches to processor `processor_index`.
    ///
    /// If attaching fails the channel is closed again before the error is returned.
    pub fn open_with_config(
        channel: C,
        processor_index: u32,
        config: BufferConfig,
    ) -> Result<Self> {
        let Reply::Opened(channel_handle) =
            issue(&channel, Request::Open, BridgeError::OpenFailed)?
        else {
            return Err(BridgeError::UnexpectedReply { op: "open" });
        };

        let attached = issue(
            &channel,
            Request::Attach {
                processor: processor_index,
            },
            BridgeError::AttachFailed,
        )
        .and_then(|reply| match reply {
            Reply::Attached(processor) => Ok(processor),
            _ => Err(BridgeError::UnexpectedReply { op: "attach" }),
        });

        let processor = match attached {
            Ok(processor) => processor,
            Err(err) => {
                if let Err(close_err) = issue(
                    &channel,
                    Request::Close {
                        channel: channel_handle,
                    },
                    BridgeError::CloseFailed,
                ) {
                    warn!(%close_err, "closing channel after failed attach");
                }
                return Err(err);
            }
        };

        debug!(processor = processor_index, "attached to processor");
        Ok(Self {
            channel,
            channel_handle,
            processor,
            index: processor_index,
            config,
            released: false,
        })
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn processor_index(&self) -> u32 {
        self.index
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub(crate) fn processor(&self) -> ProcessorHandle {
        self.processor
    }

    pub(crate) fn request(
        &self,
        request: Request<'_>,
        wrap: fn(crate::control::ChannelError) -> BridgeError,
    ) -> Result<Reply> {
        issue(&self.channel, request, wrap)
    }

    /// Creates an empty buffer descriptor bound to this session.
    pub fn create_buffer(&self, direction: Direction) -> Buffer<'_, C> {
        Buffer::new(self, direction)
    }

    pub fn allocate_node(&self, uuid: DspUuid, attrs: Option<NodeAttrs>) -> Result<Node<'_, C>> {
        Node::allocate(self, uuid, attrs)
    }

    /// Associates an object image on the accelerator's filesystem with `uuid`.
    pub fn register(&self, uuid: DspUuid, kind: ObjectKind, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        debug!(%uuid, ?kind, path = %path.display(), "registering object");
        self.request(
            Request::Register { uuid, kind, path },
            BridgeError::RegisterFailed,
        )?;
        Ok(())
    }

    pub fn unregister(&self, uuid: DspUuid, kind: ObjectKind) -> Result<()> {
        debug!(%uuid, ?kind, "unregistering object");
        self.request(
            Request::Unregister { uuid, kind },
            BridgeError::UnregisterFailed,
        )?;
        Ok(())
    }

    /// Lists every node type the driver's object database knows about.
    pub fn enumerate_nodes(&self) -> Result<Vec<NodeProps>> {
        let mut nodes = Vec::new();
        for index in 0u32.. {
            match self.request(
                Request::EnumerateNode { index },
                BridgeError::EnumerateFailed,
            )? {
                Reply::NodeEntry(Some(props)) => nodes.push(props),
                Reply::NodeEntry(None) => break,
                _ => return Err(BridgeError::UnexpectedReply { op: "enumerate node" }),
            }
        }
        Ok(nodes)
    }

    pub fn register_notify(&self, events: ProcessorEvents) -> Result<()> {
        self.request(
            Request::RegisterNotify {
                processor: self.processor,
                events,
            },
            BridgeError::NotifyFailed,
        )?;
        Ok(())
    }

    /// Blocks until one of the registered events fires or `timeout` elapses.
    pub fn wait_for_event(&self, timeout: Timeout) -> Result<ProcessorEvents> {
        match self.request(
            Request::WaitForEvents {
                processor: self.processor,
                timeout,
            },
            BridgeError::NotifyFailed,
        )? {
            Reply::Events(events) => Ok(events),
            _ => Err(BridgeError::UnexpectedReply {
                op: "wait for events",
            }),
        }
    }

    /// Detaches from the processor, then closes the channel.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        self.released = true;

        let detached = self
            .request(
                Request::Detach {
                    processor: self.processor,
                },
                BridgeError::DetachFailed,
            )
            .map(drop);
        if let Err(err) = &detached {
            error!(%err, processor = self.index, "detach failed");
        }

        let closed = self
            .request(
                Request::Close {
                    channel: self.channel_handle,
                },
                BridgeError::CloseFailed,
            )
            .map(drop);
        if let Err(err) = &closed {
            error!(%err, "closing control channel failed");
        }

        debug!(processor = self.index, "session closed");
        detached.and(closed)
    }
}

impl<C: ControlChannel> Drop for ProcessorSession<C> {
    fn drop(&mut self) {
        if !self.released {
            warn!(processor = self.index, "session dropped without close");
            let _ = self.release();
        }
    }
}
