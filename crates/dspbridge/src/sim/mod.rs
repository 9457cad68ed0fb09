//! In-process stand-in for the bridge driver and the accelerator behind it.
//!
//! [`SimulatedBridge`] answers every [`Request`] the way the arbitration layer would, keeping
//! its own accelerator address space, node table and mailboxes. Mapped memory is modelled as a
//! device-side copy that only changes on flush (host to device) and on node writes; the host
//! only sees node output after an invalidate. Code that skips cache maintenance therefore reads
//! stale data here just as it would on hardware.
//!
//! The simulator is single-threaded: a blocking request that cannot make progress returns
//! [`ChannelError::Timeout`] instead of waiting, whatever timeout it carries.

mod accelerator;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;

use tracing::{debug, trace, warn};

use crate::config::{round_up_to_page, PAGE_SIZE};
use crate::control::{
    ChannelError, ChannelHandle, ChannelResult, ControlChannel, DeviceAddress, DriverStatus,
    HostRegion, MappingToken, NodeHandle, ProcessorHandle, Reply, Request, RequestKind,
    ReservationToken, SegmentInfo,
};
use crate::message::{command, Command, Message, MESSAGE_WIRE_BYTES};
use crate::node::{NodeAttrs, NodeProps, NodeState, NodeType};
use crate::session::ProcessorEvents;
use crate::uuid::{DspUuid, ObjectKind};

pub use self::accelerator::{
    Capability, DeviceFault, DeviceMemory, Dispatch, LoopbackCapability, EXIT_FAULT, EXIT_OK,
};
use self::accelerator::Window;

/// Status words the simulator reports for failed requests.
pub mod status {
    use crate::control::DriverStatus;

    pub const EFAIL: DriverStatus = DriverStatus(0x8000_8008u32 as i32);
    pub const EMEMORY: DriverStatus = DriverStatus(0x8000_8003u32 as i32);
    pub const EHANDLE: DriverStatus = DriverStatus(0x8000_8004u32 as i32);
    pub const EINVALIDARG: DriverStatus = DriverStatus(0x8000_8005u32 as i32);
    pub const ENOTFOUND: DriverStatus = DriverStatus(0x8000_8031u32 as i32);
    pub const EWRONGSTATE: DriverStatus = DriverStatus(0x8000_8042u32 as i32);
}

/// First accelerator address handed out for reservations.
pub const DEVICE_VA_BASE: u32 = 0x1100_0000;
/// End (exclusive) of the accelerator address window available for reservations.
pub const DEVICE_VA_LIMIT: u32 = 0x2000_0000;

fn failed(status: DriverStatus) -> ChannelError {
    ChannelError::Failed(status)
}

fn device_memory(mappings: &mut BTreeMap<MappingToken, SimMapping>) -> DeviceMemory<'_> {
    DeviceMemory::new(
        mappings
            .values_mut()
            .map(|m| Window {
                base: m.device_address.0,
                bytes: &mut m.memory,
            })
            .collect(),
    )
}

type CapabilityFactory = Box<dyn Fn() -> Box<dyn Capability>>;
type PutHook = Box<dyn FnMut(&Message)>;

struct NodeImage {
    name: String,
    node_type: NodeType,
    factory: CapabilityFactory,
}

struct SimNode {
    processor: ProcessorHandle,
    uuid: DspUuid,
    node_type: NodeType,
    state: NodeState,
    attrs: NodeAttrs,
    capability: Box<dyn Capability>,
    /// Wire frames queued for the host.
    outbox: VecDeque<[u8; MESSAGE_WIRE_BYTES]>,
    exit_status: Option<u32>,
    /// Length of the private heap handed over at allocation.
    heap: Option<usize>,
    message_buffer: Option<usize>,
}

#[derive(Debug)]
struct SimProcessor {
    notify: ProcessorEvents,
    pending: ProcessorEvents,
}

impl Default for SimProcessor {
    fn default() -> Self {
        Self {
            notify: ProcessorEvents::empty(),
            pending: ProcessorEvents::empty(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SimReservation {
    base: u32,
    size: u64,
}

/// Host address range a mapping was created from. Only ever compared, never dereferenced.
#[derive(Debug, Clone, Copy)]
struct HostSpan {
    addr: usize,
    len: usize,
}

impl HostSpan {
    fn of(region: &HostRegion<'_>) -> Self {
        Self {
            addr: region.addr(),
            len: region.len(),
        }
    }

    /// Offset of `region` within this span, if it lies entirely inside.
    fn offset_of(&self, region: &HostRegion<'_>) -> Option<usize> {
        let offset = region.addr().checked_sub(self.addr)?;
        let end = offset.checked_add(region.len())?;
        (end <= self.len).then_some(offset)
    }
}

struct SimMapping {
    reservation: ReservationToken,
    host: HostSpan,
    device_address: DeviceAddress,
    /// Device-side contents of the mapped bytes.
    memory: Vec<u8>,
}

struct InjectedFault {
    kind: RequestKind,
    skip: u32,
    error: ChannelError,
    persistent: bool,
}

struct SimState {
    processor_count: u32,
    next_id: u64,
    next_device_va: u64,
    shared_segment: Option<SegmentInfo>,
    images: BTreeMap<DspUuid, NodeImage>,
    registry: BTreeMap<(DspUuid, ObjectKind), PathBuf>,
    channels: BTreeSet<ChannelHandle>,
    processors: BTreeMap<ProcessorHandle, SimProcessor>,
    nodes: BTreeMap<NodeHandle, SimNode>,
    reservations: BTreeMap<ReservationToken, SimReservation>,
    reservation_history: Vec<u64>,
    mappings: BTreeMap<MappingToken, SimMapping>,
    faults: Vec<InjectedFault>,
    log: Vec<RequestKind>,
}

/// A simulated bridge driver with one or more accelerators behind it.
pub struct SimulatedBridge {
    state: RefCell<SimState>,
    put_hook: RefCell<Option<PutHook>>,
}

impl Default for SimulatedBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBridge {
    /// A driver exposing one processor, no node images and no shared-memory segment.
    pub fn new() -> Self {
        Self {
            state: RefCell::new(SimState {
                processor_count: 1,
                next_id: 1,
                next_device_va: u64::from(DEVICE_VA_BASE),
                shared_segment: None,
                images: BTreeMap::new(),
                registry: BTreeMap::new(),
                channels: BTreeSet::new(),
                processors: BTreeMap::new(),
                nodes: BTreeMap::new(),
                reservations: BTreeMap::new(),
                reservation_history: Vec::new(),
                mappings: BTreeMap::new(),
                faults: Vec::new(),
                log: Vec::new(),
            }),
            put_hook: RefCell::new(None),
        }
    }

    pub fn with_processors(self, count: u32) -> Self {
        self.state.borrow_mut().processor_count = count;
        self
    }

    /// Makes a shared-memory pool segment of `size` bytes available to message nodes.
    pub fn with_shared_segment(self, size: usize) -> Self {
        self.state.borrow_mut().shared_segment = Some(SegmentInfo { size });
        self
    }

    /// Installs a node image: allocating `uuid` instantiates `factory()` as its firmware.
    pub fn with_node<F, K>(
        self,
        uuid: DspUuid,
        name: &str,
        node_type: NodeType,
        factory: F,
    ) -> Self
    where
        F: Fn() -> K + 'static,
        K: Capability + 'static,
    {
        self.state.borrow_mut().images.insert(
            uuid,
            NodeImage {
                name: name.to_owned(),
                node_type,
                factory: Box::new(move || -> Box<dyn Capability> { Box::new(factory()) }),
            },
        );
        self
    }

    /// Installs a message node running [`LoopbackCapability`].
    pub fn with_loopback_node(self, uuid: DspUuid) -> Self {
        self.with_node(uuid, "loopback", NodeType::Message, LoopbackCapability::new)
    }

    /// Fails the next request of `kind` with `error`.
    pub fn fail_next(&self, kind: RequestKind, error: ChannelError) {
        self.fail_after(kind, 0, error);
    }

    /// Lets `skip` requests of `kind` through, then fails the one after with `error`.
    pub fn fail_after(&self, kind: RequestKind, skip: u32, error: ChannelError) {
        self.state.borrow_mut().faults.push(InjectedFault {
            kind,
            skip,
            error,
            persistent: false,
        });
    }

    /// Fails every request of `kind` with `error` until [`SimulatedBridge::clear_faults`].
    pub fn fail_always(&self, kind: RequestKind, error: ChannelError) {
        self.state.borrow_mut().faults.push(InjectedFault {
            kind,
            skip: 0,
            error,
            persistent: true,
        });
    }

    pub fn clear_faults(&self) {
        self.state.borrow_mut().faults.clear();
    }

    /// Runs `hook` on every message before the driver handles the put request.
    pub fn on_put_message(&self, hook: impl FnMut(&Message) + 'static) {
        *self.put_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Raises `events` on every attached processor.
    pub fn raise_event(&self, events: ProcessorEvents) {
        let mut state = self.state.borrow_mut();
        for processor in state.processors.values_mut() {
            processor.pending |= events;
        }
    }

    /// Every request received so far, including failed ones.
    pub fn requests(&self) -> Vec<RequestKind> {
        self.state.borrow().log.clone()
    }

    pub fn count(&self, kind: RequestKind) -> usize {
        self.state.borrow().log.iter().filter(|&&k| k == kind).count()
    }

    pub fn clear_log(&self) {
        self.state.borrow_mut().log.clear();
    }

    pub fn open_channels(&self) -> usize {
        self.state.borrow().channels.len()
    }

    pub fn attached_processors(&self) -> usize {
        self.state.borrow().processors.len()
    }

    pub fn live_reservations(&self) -> usize {
        self.state.borrow().reservations.len()
    }

    pub fn live_mappings(&self) -> usize {
        self.state.borrow().mappings.len()
    }

    /// Sizes of every successful reservation, in order.
    pub fn reservation_sizes(&self) -> Vec<u64> {
        self.state.borrow().reservation_history.clone()
    }

    pub fn live_nodes(&self) -> usize {
        self.state.borrow().nodes.len()
    }

    pub fn node_state(&self, node: NodeHandle) -> Option<NodeState> {
        self.state.borrow().nodes.get(&node).map(|n| n.state)
    }

    pub fn node_attrs(&self, node: NodeHandle) -> Option<NodeAttrs> {
        self.state.borrow().nodes.get(&node).map(|n| n.attrs)
    }

    /// Length of the private heap handed over at allocation, if any.
    pub fn node_heap_len(&self, node: NodeHandle) -> Option<usize> {
        self.state
            .borrow()
            .nodes
            .get(&node)
            .and_then(|n| n.heap)
    }

    pub fn node_message_buffer_len(&self, node: NodeHandle) -> Option<usize> {
        self.state
            .borrow()
            .nodes
            .get(&node)
            .and_then(|n| n.message_buffer)
    }

    pub fn registered_path(&self, uuid: DspUuid, kind: ObjectKind) -> Option<PathBuf> {
        self.state.borrow().registry.get(&(uuid, kind)).cloned()
    }

    /// Reads `len` bytes of accelerator memory as a node would see them.
    pub fn device_read(&self, address: DeviceAddress, len: usize) -> Option<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        let mut out = vec![0u8; len];
        device_memory(&mut state.mappings).read(address, &mut out).ok()?;
        Some(out)
    }

    /// Writes accelerator memory directly, as a node would.
    pub fn device_write(&self, address: DeviceAddress, data: &[u8]) -> bool {
        let mut state = self.state.borrow_mut();
        device_memory(&mut state.mappings).write(address, data).is_ok()
    }

    fn run_put_hook(&self, message: &Message) {
        let hook = self.put_hook.borrow_mut().take();
        if let Some(mut hook) = hook {
            hook(message);
            let mut slot = self.put_hook.borrow_mut();
            if slot.is_none() {
                *slot = Some(hook);
            }
        }
    }
}

impl ControlChannel for SimulatedBridge {
    fn transact(&self, request: Request<'_>) -> ChannelResult<Reply> {
        let kind = request.kind();
        {
            let mut state = self.state.borrow_mut();
            state.log.push(kind);
            if let Some(error) = state.take_fault(kind) {
                debug!(op = kind.name(), %error, "injected driver failure");
                return Err(error);
            }
        }
        if let Request::NodePutMessage { message, .. } = &request {
            self.run_put_hook(message);
        }
        let reply = self.state.borrow_mut().handle(request);
        if let Err(error) = &reply {
            trace!(op = kind.name(), %error, "simulated request failed");
        }
        reply
    }
}

impl SimState {
    fn take_fault(&mut self, kind: RequestKind) -> Option<ChannelError> {
        let index = self.faults.iter().position(|f| f.kind == kind)?;
        let fault = &mut self.faults[index];
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        if fault.persistent {
            Some(fault.error)
        } else {
            Some(self.faults.remove(index).error)
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn processor(&mut self, handle: ProcessorHandle) -> ChannelResult<&mut SimProcessor> {
        self.processors
            .get_mut(&handle)
            .ok_or(failed(status::EHANDLE))
    }

    fn node(&mut self, handle: NodeHandle) -> ChannelResult<&mut SimNode> {
        self.nodes.get_mut(&handle).ok_or(failed(status::EHANDLE))
    }

    fn transition(
        &mut self,
        handle: NodeHandle,
        allowed: &[NodeState],
        next: NodeState,
    ) -> ChannelResult<Reply> {
        let node = self.node(handle)?;
        if !allowed.contains(&node.state) {
            return Err(failed(status::EWRONGSTATE));
        }
        node.state = next;
        Ok(Reply::Done)
    }

    fn handle(&mut self, request: Request<'_>) -> ChannelResult<Reply> {
        match request {
            Request::Open => {
                let handle = ChannelHandle::from_raw(self.next_id());
                self.channels.insert(handle);
                Ok(Reply::Opened(handle))
            }
            Request::Close { channel } => {
                if !self.channels.remove(&channel) {
                    return Err(failed(status::EHANDLE));
                }
                Ok(Reply::Done)
            }
            Request::Attach { processor } => {
                if self.channels.is_empty() {
                    return Err(failed(status::EHANDLE));
                }
                if processor >= self.processor_count {
                    return Err(failed(status::EINVALIDARG));
                }
                let handle = ProcessorHandle::from_raw(self.next_id());
                self.processors.insert(handle, SimProcessor::default());
                Ok(Reply::Attached(handle))
            }
            Request::Detach { processor } => {
                self.processors
                    .remove(&processor)
                    .ok_or(failed(status::EHANDLE))?;
                Ok(Reply::Done)
            }
            Request::Register { uuid, kind, path } => {
                if path.as_os_str().is_empty() {
                    return Err(failed(status::EINVALIDARG));
                }
                self.registry.insert((uuid, kind), path);
                Ok(Reply::Done)
            }
            Request::Unregister { uuid, kind } => {
                self.registry
                    .remove(&(uuid, kind))
                    .ok_or(failed(status::ENOTFOUND))?;
                Ok(Reply::Done)
            }
            Request::EnumerateNode { index } => Ok(Reply::NodeEntry(
                self.images
                    .iter()
                    .nth(index as usize)
                    .map(|(uuid, image)| NodeProps {
                        uuid: *uuid,
                        name: image.name.clone(),
                        node_type: image.node_type,
                    }),
            )),
            Request::RegisterNotify { processor, events } => {
                self.processor(processor)?.notify = events;
                Ok(Reply::Done)
            }
            Request::WaitForEvents { processor, .. } => {
                let processor = self.processor(processor)?;
                let fired = processor.pending & processor.notify;
                if fired.is_empty() {
                    return Err(ChannelError::Timeout);
                }
                processor.pending.remove(fired);
                Ok(Reply::Events(fired))
            }
            Request::NodeAllocate {
                processor,
                uuid,
                attrs,
                heap,
            } => {
                self.processor(processor)?;
                let image = self.images.get(&uuid).ok_or(failed(status::ENOTFOUND))?;
                let node = SimNode {
                    processor,
                    uuid,
                    node_type: image.node_type,
                    state: NodeState::Allocated,
                    attrs,
                    capability: (image.factory)(),
                    outbox: VecDeque::new(),
                    exit_status: None,
                    heap: heap.map(|h| h.len()),
                    message_buffer: None,
                };
                let handle = NodeHandle::from_raw(self.next_id());
                debug!(%uuid, node = handle.raw(), "simulated node allocated");
                self.nodes.insert(handle, node);
                Ok(Reply::NodeAllocated(handle))
            }
            Request::NodeGetAttr { node } => Ok(Reply::NodeAttr(self.node(node)?.node_type)),
            Request::NodeAllocMessageBuffer { node, region } => {
                let segment = self.shared_segment.ok_or(failed(status::EMEMORY))?;
                if region.len() < segment.size {
                    return Err(failed(status::EINVALIDARG));
                }
                let node = self.node(node)?;
                if node.node_type == NodeType::Device {
                    return Err(failed(status::EWRONGSTATE));
                }
                node.message_buffer = Some(region.len());
                Ok(Reply::Done)
            }
            Request::NodeCreate { node } => {
                self.transition(node, &[NodeState::Allocated], NodeState::Created)
            }
            Request::NodeRun { node } => self.transition(
                node,
                &[NodeState::Created, NodeState::Paused],
                NodeState::Running,
            ),
            Request::NodePause { node } => {
                self.transition(node, &[NodeState::Running], NodeState::Paused)
            }
            Request::NodeTerminate { node } => self.terminate(node),
            Request::NodeDelete { node } => {
                let removed = self.nodes.remove(&node).ok_or(failed(status::EHANDLE))?;
                debug!(uuid = %removed.uuid, node = node.raw(), "simulated node deleted");
                Ok(Reply::Done)
            }
            Request::NodePutMessage { node, message, .. } => self.put_message(node, message),
            Request::NodeGetMessage { node, .. } => {
                let node = self.node(node)?;
                if node.state != NodeState::Running {
                    return Err(failed(status::EWRONGSTATE));
                }
                let frame = node.outbox.pop_front().ok_or(ChannelError::Timeout)?;
                let message = Message::decode(&frame).map_err(|_| failed(status::EFAIL))?;
                Ok(Reply::Message(message))
            }
            Request::SharedMemoryInfo { processor } => {
                self.processor(processor)?;
                Ok(Reply::SharedMemory(self.shared_segment))
            }
            Request::Reserve { processor, size } => {
                self.processor(processor)?;
                self.reserve(size)
            }
            Request::Unreserve {
                processor,
                reservation,
            } => {
                self.processor(processor)?;
                if self.mappings.values().any(|m| m.reservation == reservation) {
                    return Err(failed(status::EWRONGSTATE));
                }
                self.reservations
                    .remove(&reservation)
                    .ok_or(failed(status::EHANDLE))?;
                Ok(Reply::Done)
            }
            Request::Map {
                processor,
                host,
                reservation,
            } => {
                self.processor(processor)?;
                self.map(host, reservation)
            }
            Request::Unmap {
                processor,
                mapping,
            } => {
                self.processor(processor)?;
                self.mappings
                    .remove(&mapping)
                    .ok_or(failed(status::EHANDLE))?;
                Ok(Reply::Done)
            }
            Request::Flush { processor, host } => {
                self.processor(processor)?;
                let (mapping, offset) = self.mapping_containing(&host)?;
                mapping.memory[offset..offset + host.len()].copy_from_slice(host.as_slice());
                trace!(len = host.len(), "flushed host range");
                Ok(Reply::Done)
            }
            Request::Invalidate {
                processor,
                mut host,
            } => {
                self.processor(processor)?;
                let (mapping, offset) = self.mapping_containing(&host)?;
                let len = host.len();
                host.as_mut_slice()
                    .copy_from_slice(&mapping.memory[offset..offset + len]);
                trace!(len = host.len(), "invalidated host range");
                Ok(Reply::Done)
            }
        }
    }

    fn reserve(&mut self, size: u64) -> ChannelResult<Reply> {
        if size == 0 || size % PAGE_SIZE as u64 != 0 {
            return Err(failed(status::EINVALIDARG));
        }
        let base = self.next_device_va;
        let end = base.checked_add(size).ok_or(failed(status::EMEMORY))?;
        if end > u64::from(DEVICE_VA_LIMIT) {
            return Err(failed(status::EMEMORY));
        }
        self.next_device_va = end;

        let token = ReservationToken::from_raw(self.next_id());
        self.reservations.insert(
            token,
            SimReservation {
                base: base as u32,
                size,
            },
        );
        self.reservation_history.push(size);
        Ok(Reply::Reserved(token))
    }

    fn map(
        &mut self,
        host: HostRegion<'_>,
        reservation: ReservationToken,
    ) -> ChannelResult<Reply> {
        let reserved = *self
            .reservations
            .get(&reservation)
            .ok_or(failed(status::EHANDLE))?;
        if self.mappings.values().any(|m| m.reservation == reservation) {
            return Err(failed(status::EWRONGSTATE));
        }
        let page_offset = host.addr() % PAGE_SIZE;
        let needed = round_up_to_page((page_offset + host.len()) as u64);
        if needed > reserved.size {
            warn!(needed, reserved = reserved.size, "mapping does not fit its reservation");
            return Err(failed(status::EINVALIDARG));
        }

        let snapshot = host.as_slice().to_vec();
        let device_address = DeviceAddress(reserved.base + page_offset as u32);
        let token = MappingToken::from_raw(self.next_id());
        self.mappings.insert(
            token,
            SimMapping {
                reservation,
                host: HostSpan::of(&host),
                device_address,
                memory: snapshot,
            },
        );
        Ok(Reply::Mapped {
            mapping: token,
            device_address,
        })
    }

    fn mapping_containing(
        &mut self,
        host: &HostRegion<'_>,
    ) -> ChannelResult<(&mut SimMapping, usize)> {
        self.mappings
            .values_mut()
            .find_map(|m| m.host.offset_of(host).map(|offset| (m, offset)))
            .ok_or(failed(status::EINVALIDARG))
    }

    fn put_message(&mut self, handle: NodeHandle, message: Message) -> ChannelResult<Reply> {
        if message.command == command::DRIVER_RESERVED {
            return Err(failed(status::EINVALIDARG));
        }
        let mut memory = device_memory(&mut self.mappings);
        let node = self.nodes.get_mut(&handle).ok_or(failed(status::EHANDLE))?;
        if node.state != NodeState::Running {
            return Err(failed(status::EWRONGSTATE));
        }
        if node.exit_status.is_some() {
            trace!(command = message.command, "node has exited; message dropped");
            return Ok(Reply::Done);
        }

        // Messages cross the channel in wire form.
        let frame = message.encode();
        let delivered = Message::decode(&frame).map_err(|_| failed(status::EFAIL))?;
        let command = match Command::try_from(delivered) {
            Ok(command) => command,
            Err(err) => {
                trace!(%err, "node ignored message");
                return Ok(Reply::Done);
            }
        };

        match node.capability.dispatch(command, &mut memory) {
            Dispatch::Idle => {}
            Dispatch::Reply(reply) => node.outbox.push_back(reply.encode()),
            Dispatch::Exit(status) => {
                debug!(uuid = %node.uuid, status, "simulated node exited");
                node.exit_status = Some(status);
            }
            Dispatch::Fault(fault) => {
                warn!(uuid = %node.uuid, %fault, "simulated node faulted");
                node.exit_status = Some(EXIT_FAULT);
                let processor = node.processor;
                drop(memory);
                if let Some(processor) = self.processors.get_mut(&processor) {
                    processor.pending |= ProcessorEvents::MMU_FAULT;
                }
            }
        }
        Ok(Reply::Done)
    }

    fn terminate(&mut self, handle: NodeHandle) -> ChannelResult<Reply> {
        let mut memory = device_memory(&mut self.mappings);
        let node = self.nodes.get_mut(&handle).ok_or(failed(status::EHANDLE))?;
        if !matches!(node.state, NodeState::Running | NodeState::Paused) {
            return Err(failed(status::EWRONGSTATE));
        }
        let exit_status = match node.exit_status {
            Some(status) => status,
            None => match node.capability.dispatch(Command::Shutdown, &mut memory) {
                Dispatch::Exit(status) => status,
                Dispatch::Fault(_) => EXIT_FAULT,
                Dispatch::Idle | Dispatch::Reply(_) => 0,
            },
        };
        node.exit_status = Some(exit_status);
        node.state = NodeState::Terminated;
        Ok(Reply::Terminated { exit_status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: DspUuid = DspUuid::from_fields(1, 2, 3, [4; 8]);

    fn attached(bridge: &SimulatedBridge) -> ProcessorHandle {
        bridge.transact(Request::Open).unwrap();
        match bridge.transact(Request::Attach { processor: 0 }).unwrap() {
            Reply::Attached(p) => p,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn reservations_must_be_whole_pages() {
        let bridge = SimulatedBridge::new();
        let processor = attached(&bridge);
        assert_eq!(
            bridge.transact(Request::Reserve { processor, size: 100 }),
            Err(ChannelError::Failed(status::EINVALIDARG))
        );
        assert!(bridge
            .transact(Request::Reserve {
                processor,
                size: 2 * PAGE_SIZE as u64
            })
            .is_ok());
        assert_eq!(bridge.reservation_sizes(), vec![2 * PAGE_SIZE as u64]);
    }

    #[test]
    fn attach_checks_processor_index() {
        let bridge = SimulatedBridge::new().with_processors(2);
        bridge.transact(Request::Open).unwrap();
        assert!(bridge.transact(Request::Attach { processor: 1 }).is_ok());
        assert_eq!(
            bridge.transact(Request::Attach { processor: 2 }),
            Err(ChannelError::Failed(status::EINVALIDARG))
        );
    }

    #[test]
    fn injected_faults_respect_skip_count() {
        let bridge = SimulatedBridge::new();
        bridge.fail_after(RequestKind::Open, 1, ChannelError::Disconnected);
        assert!(bridge.transact(Request::Open).is_ok());
        assert_eq!(
            bridge.transact(Request::Open),
            Err(ChannelError::Disconnected)
        );
        assert!(bridge.transact(Request::Open).is_ok());
        assert_eq!(bridge.count(RequestKind::Open), 3);
    }

    #[test]
    fn nodes_follow_the_driver_state_machine() {
        let bridge = SimulatedBridge::new().with_loopback_node(UUID);
        let processor = attached(&bridge);
        let node = match bridge
            .transact(Request::NodeAllocate {
                processor,
                uuid: UUID,
                attrs: NodeAttrs::default(),
                heap: None,
            })
            .unwrap()
        {
            Reply::NodeAllocated(node) => node,
            other => panic!("unexpected reply {other:?}"),
        };
        assert_eq!(
            bridge.transact(Request::NodeRun { node }),
            Err(ChannelError::Failed(status::EWRONGSTATE))
        );
        bridge.transact(Request::NodeCreate { node }).unwrap();
        bridge.transact(Request::NodeRun { node }).unwrap();
        assert_eq!(bridge.node_state(node), Some(NodeState::Running));
        assert_eq!(
            bridge.transact(Request::NodeTerminate { node }),
            Ok(Reply::Terminated {
                exit_status: EXIT_OK
            })
        );
        bridge.transact(Request::NodeDelete { node }).unwrap();
        assert_eq!(bridge.live_nodes(), 0);
    }

    #[test]
    fn unknown_node_uuid_is_not_found() {
        let bridge = SimulatedBridge::new();
        let processor = attached(&bridge);
        assert_eq!(
            bridge.transact(Request::NodeAllocate {
                processor,
                uuid: UUID,
                attrs: NodeAttrs::default(),
                heap: None,
            }),
            Err(ChannelError::Failed(status::ENOTFOUND))
        );
    }

    #[test]
    fn events_fire_only_when_registered() {
        let bridge = SimulatedBridge::new();
        let processor = attached(&bridge);
        bridge.raise_event(ProcessorEvents::SYS_ERROR);
        let wait = || Request::WaitForEvents {
            processor,
            timeout: crate::control::Timeout::from_millis(10),
        };
        assert_eq!(bridge.transact(wait()), Err(ChannelError::Timeout));

        bridge
            .transact(Request::RegisterNotify {
                processor,
                events: ProcessorEvents::all(),
            })
            .unwrap();
        assert_eq!(
            bridge.transact(wait()),
            Ok(Reply::Events(ProcessorEvents::SYS_ERROR))
        );
        assert_eq!(bridge.transact(wait()), Err(ChannelError::Timeout));
    }

    #[test]
    fn cache_maintenance_copies_only_through_live_mappings() {
        let bridge = SimulatedBridge::new();
        let processor = attached(&bridge);
        let mut host = vec![1u8; 64];
        let reservation = match bridge
            .transact(Request::Reserve {
                processor,
                size: 2 * PAGE_SIZE as u64,
            })
            .unwrap()
        {
            Reply::Reserved(reservation) => reservation,
            other => panic!("unexpected reply {other:?}"),
        };
        let (mapping, device_address) = match bridge
            .transact(Request::Map {
                processor,
                host: HostRegion::from_mut_slice(&mut host),
                reservation,
            })
            .unwrap()
        {
            Reply::Mapped {
                mapping,
                device_address,
            } => (mapping, device_address),
            other => panic!("unexpected reply {other:?}"),
        };

        assert!(bridge.device_write(device_address, &[9; 16]));
        bridge
            .transact(Request::Invalidate {
                processor,
                host: HostRegion::from_mut_slice(&mut host[..16]),
            })
            .unwrap();
        assert!(host[..16].iter().all(|&b| b == 9));
        assert_eq!(host[16], 1);

        let mut unrelated = vec![0u8; 16];
        assert_eq!(
            bridge.transact(Request::Invalidate {
                processor,
                host: HostRegion::from_mut_slice(&mut unrelated),
            }),
            Err(ChannelError::Failed(status::EINVALIDARG))
        );
        assert!(unrelated.iter().all(|&b| b == 0));

        bridge.transact(Request::Unmap { processor, mapping }).unwrap();
        assert_eq!(
            bridge.transact(Request::Flush {
                processor,
                host: HostRegion::from_mut_slice(&mut host),
            }),
            Err(ChannelError::Failed(status::EINVALIDARG))
        );
    }
}
