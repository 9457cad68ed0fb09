//! Configure/work request-reply protocol on top of a running node.
//!
//! The exchange is strictly synchronous: one `WORK` message produces exactly one reply, and a
//! new `WORK` is never sent while a reply is outstanding. Buffers referenced by a `WORK` message
//! are therefore never cache-maintained or refilled while the accelerator may be using them.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::control::{ControlChannel, Timeout};
use crate::error::{BridgeError, Result};
use crate::message::{command, Command, Message};
use crate::node::Node;

/// Per-cycle hooks for [`MessageChannel::run_loop`].
pub trait WorkCycle {
    /// Called with the input storage before it is flushed for cycle `iteration`.
    fn fill(&mut self, _iteration: u64, _input: &mut [u8]) {}

    /// Called with the output storage after it is invalidated. Returning `false` stops the loop
    /// with [`BridgeError::OutputMismatch`].
    fn check(&mut self, _iteration: u64, _output: &[u8]) -> bool {
        true
    }
}

impl WorkCycle for () {}

/// Fills the input with a per-cycle byte and expects the node to echo it to the output.
#[derive(Debug, Default)]
pub struct LoopbackPattern;

impl WorkCycle for LoopbackPattern {
    fn fill(&mut self, iteration: u64, input: &mut [u8]) {
        input.fill(iteration as u8);
    }

    fn check(&mut self, iteration: u64, output: &[u8]) -> bool {
        output.iter().all(|&b| b == iteration as u8)
    }
}

pub struct MessageChannel<'n, 'a, C: ControlChannel> {
    node: &'n mut Node<'a, C>,
    configured: bool,
    reply_timeout: Timeout,
}

impl<'n, 'a, C: ControlChannel> MessageChannel<'n, 'a, C> {
    pub fn new(node: &'n mut Node<'a, C>) -> Self {
        Self {
            node,
            configured: false,
            reply_timeout: Timeout::Infinite,
        }
    }

    /// How long [`MessageChannel::submit_work`] waits for its reply. Infinite by default.
    pub fn with_reply_timeout(mut self, timeout: Timeout) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn node(&self) -> &Node<'a, C> {
        self.node
    }

    /// Tells the node where its input and output buffers are mapped. Sent exactly once.
    pub fn configure(&mut self, input: &Buffer<'_, C>, output: &Buffer<'_, C>) -> Result<()> {
        if self.configured {
            return Err(BridgeError::ProtocolViolation("node is already configured"));
        }
        let input = input.device_address().ok_or(BridgeError::NotMapped)?;
        let output = output.device_address().ok_or(BridgeError::NotMapped)?;

        debug!(%input, %output, "configuring node");
        let message = Command::Configure { input, output }.to_message();
        self.node.put_message(&message, Timeout::Infinite)?;
        self.configured = true;
        Ok(())
    }

    /// Asks the node to process `length` bytes and blocks for its single reply.
    ///
    /// A reply that is not a `WORK` echo is rejected with [`BridgeError::UnexpectedReply`].
    pub fn submit_work(&mut self, length: u32) -> Result<Message> {
        if !self.configured {
            return Err(BridgeError::ProtocolViolation(
                "work submitted before configure",
            ));
        }
        let message = Command::Work { length }.to_message();
        self.node.put_message(&message, Timeout::Infinite)?;
        let reply = self.node.get_message(self.reply_timeout)?;
        if reply.command != command::WORK {
            warn!(command = reply.command, "reply does not answer WORK");
            return Err(BridgeError::UnexpectedReply { op: "work" });
        }
        Ok(reply)
    }

    /// Sends the terminal command; the node leaves its dispatch loop and sends no reply.
    pub fn shutdown(&mut self) -> Result<()> {
        self.node
            .put_message(&Command::Shutdown.to_message(), Timeout::Infinite)
    }

    /// Runs flush → work → reply → invalidate cycles until `iterations` complete (0 means
    /// unbounded) or `cancel` fires.
    ///
    /// Cancellation is checked only between complete cycles, so a cycle that has started always
    /// receives its reply. Returns the number of completed cycles.
    pub fn run_loop(
        &mut self,
        input: &mut Buffer<'_, C>,
        output: &mut Buffer<'_, C>,
        iterations: u64,
        cancel: &CancellationToken,
        cycle: &mut impl WorkCycle,
    ) -> Result<u64> {
        let length = input.len();
        let wire_length = u32::try_from(length).map_err(|_| BridgeError::LengthOutOfRange {
            len: length,
            capacity: u32::MAX as usize,
        })?;
        if output.len() < length {
            return Err(BridgeError::LengthOutOfRange {
                len: length,
                capacity: output.len(),
            });
        }

        info!(iterations, length, "starting work loop");
        let mut completed = 0u64;
        while !cancel.is_cancelled() {
            cycle.fill(completed, input.as_mut_slice());
            input.begin(length)?;
            self.submit_work(wire_length)?;
            output.end(length)?;
            if !cycle.check(completed, &output.as_slice()[..length]) {
                return Err(BridgeError::OutputMismatch {
                    iteration: completed,
                });
            }

            completed += 1;
            if completed == iterations {
                break;
            }
        }
        info!(completed, cancelled = cancel.is_cancelled(), "work loop finished");
        Ok(completed)
    }
}
