//! Accelerator-side behaviour of simulated nodes.

use core::fmt;

use crate::control::DeviceAddress;
use crate::message::{Command, Message};

/// Exit status a node reports after a clean shutdown.
pub const EXIT_OK: u32 = 0x8000;

/// Exit status recorded for a node that touched unmapped accelerator memory.
pub const EXIT_FAULT: u32 = 0xdead;

/// An access outside every live mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFault {
    pub address: DeviceAddress,
    pub len: usize,
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unmapped access of {} bytes at {}", self.len, self.address)
    }
}

impl std::error::Error for DeviceFault {}

/// One contiguous window of accelerator memory backed by a mapping.
#[derive(Debug)]
pub(crate) struct Window<'m> {
    pub(crate) base: u32,
    pub(crate) bytes: &'m mut Vec<u8>,
}

/// The accelerator's view of every live mapping.
///
/// Accesses see the device-side copy of each mapping, which only changes when the host
/// flushes into it or a node writes to it.
pub struct DeviceMemory<'m> {
    windows: Vec<Window<'m>>,
}

impl<'m> DeviceMemory<'m> {
    pub(crate) fn new(windows: Vec<Window<'m>>) -> Self {
        Self { windows }
    }

    fn locate(&self, address: DeviceAddress, len: usize) -> Result<(usize, usize), DeviceFault> {
        let fault = DeviceFault { address, len };
        let start = u64::from(address.0);
        let end = start + len as u64;
        self.windows
            .iter()
            .position(|w| {
                let base = u64::from(w.base);
                start >= base && end <= base + w.bytes.len() as u64
            })
            .map(|i| (i, (start - u64::from(self.windows[i].base)) as usize))
            .ok_or(fault)
    }

    pub fn read(&mut self, address: DeviceAddress, dst: &mut [u8]) -> Result<(), DeviceFault> {
        let (window, offset) = self.locate(address, dst.len())?;
        dst.copy_from_slice(&self.windows[window].bytes[offset..offset + dst.len()]);
        Ok(())
    }

    pub fn write(&mut self, address: DeviceAddress, src: &[u8]) -> Result<(), DeviceFault> {
        let (window, offset) = self.locate(address, src.len())?;
        self.windows[window].bytes[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

/// What a node does in response to one delivered command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Keep waiting for the next message.
    Idle,
    /// Queue this message for the host.
    Reply(Message),
    /// Leave the dispatch loop with this status.
    Exit(u32),
    /// The command touched memory the node cannot reach.
    Fault(DeviceFault),
}

/// Firmware of a simulated node: a command dispatcher over accelerator memory.
pub trait Capability {
    fn dispatch(&mut self, command: Command, memory: &mut DeviceMemory<'_>) -> Dispatch;
}

impl<F> Capability for F
where
    F: FnMut(Command, &mut DeviceMemory<'_>) -> Dispatch,
{
    fn dispatch(&mut self, command: Command, memory: &mut DeviceMemory<'_>) -> Dispatch {
        self(command, memory)
    }
}

/// Copies `length` bytes from the configured input to the configured output for every `WORK`,
/// then echoes the `WORK` message back.
#[derive(Debug, Default)]
pub struct LoopbackCapability {
    input: Option<DeviceAddress>,
    output: Option<DeviceAddress>,
    scratch: Vec<u8>,
}

impl LoopbackCapability {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Capability for LoopbackCapability {
    fn dispatch(&mut self, command: Command, memory: &mut DeviceMemory<'_>) -> Dispatch {
        match command {
            Command::Configure { input, output } => {
                self.input = Some(input);
                self.output = Some(output);
                Dispatch::Idle
            }
            Command::Work { length } => {
                let (Some(input), Some(output)) = (self.input, self.output) else {
                    return Dispatch::Fault(DeviceFault {
                        address: DeviceAddress(0),
                        len: length as usize,
                    });
                };
                self.scratch.resize(length as usize, 0);
                if let Err(fault) = memory.read(input, &mut self.scratch) {
                    return Dispatch::Fault(fault);
                }
                if let Err(fault) = memory.write(output, &self.scratch) {
                    return Dispatch::Fault(fault);
                }
                Dispatch::Reply(command.to_message())
            }
            Command::Shutdown => Dispatch::Exit(EXIT_OK),
        }
    }
}
