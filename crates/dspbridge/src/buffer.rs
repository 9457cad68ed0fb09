//! Shared-memory buffers and their cache-coherency contract.
//!
//! A [`Buffer`] is host memory that the accelerator can address once it is mapped. The two
//! processors do not snoop each other's caches, so every hand-off needs explicit maintenance:
//! [`Buffer::begin`] before the accelerator reads, [`Buffer::end`] before the host reads what the
//! accelerator wrote. Which of the two actually touches the cache is decided by the buffer's
//! [`Direction`], not by the caller.

use core::mem;

use tracing::{debug, warn};

use crate::config::BufferConfig;
use crate::control::{
    ControlChannel, DeviceAddress, HostRegion, MappingToken, Reply, Request, ReservationToken,
};
use crate::error::{BridgeError, Result};
use crate::session::ProcessorSession;
use crate::storage::AlignedStorage;

/// Which way data flows through a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host writes, accelerator reads.
    ToDevice,
    /// Accelerator writes, host reads.
    FromDevice,
    Bidirectional,
}

impl Direction {
    /// Host-written lines must be pushed out before the accelerator looks.
    pub fn flushes_on_begin(self) -> bool {
        matches!(self, Direction::ToDevice | Direction::Bidirectional)
    }

    /// Host lines must be dropped before the host reads accelerator output.
    pub fn invalidates_on_end(self) -> bool {
        matches!(self, Direction::FromDevice | Direction::Bidirectional)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Storage allocated and released by the buffer.
    Owned,
    /// Caller-supplied storage, never released by the buffer.
    Borrowed,
}

enum Storage<'a> {
    Empty,
    Owned(AlignedStorage),
    Borrowed(&'a mut [u8]),
}

impl Storage<'_> {
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Empty => &[],
            Storage::Owned(s) => s.as_slice(),
            Storage::Borrowed(s) => s,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Storage::Empty => &mut [],
            Storage::Owned(s) => s.as_mut_slice(),
            Storage::Borrowed(s) => s,
        }
    }

    fn origin(&self) -> Option<Origin> {
        match self {
            Storage::Empty => None,
            Storage::Owned(_) => Some(Origin::Owned),
            Storage::Borrowed(_) => Some(Origin::Borrowed),
        }
    }
}

/// Reservation and mapping always live and die together.
#[derive(Debug, Clone, Copy)]
struct Mapping {
    reservation: ReservationToken,
    token: MappingToken,
    device_address: DeviceAddress,
}

/// A region of memory visible to both processors.
///
/// Storage is kept alive and in place for as long as it is mapped: replacing storage, freeing,
/// and dropping all unmap first. If unmapping fails, owned storage is leaked rather than handed
/// back to the allocator while the accelerator may still reach it.
pub struct Buffer<'a, C: ControlChannel> {
    session: &'a ProcessorSession<C>,
    config: BufferConfig,
    direction: Direction,
    storage: Storage<'a>,
    mapping: Option<Mapping>,
}

impl<'a, C: ControlChannel> Buffer<'a, C> {
    /// Creates a descriptor with no storage and no mapping.
    pub fn new(session: &'a ProcessorSession<C>, direction: Direction) -> Self {
        Self {
            session,
            config: *session.config(),
            direction,
            storage: Storage::Empty,
            mapping: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn origin(&self) -> Option<Origin> {
        self.storage.origin()
    }

    pub fn len(&self) -> usize {
        self.storage.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn reservation_token(&self) -> Option<ReservationToken> {
        self.mapping.map(|m| m.reservation)
    }

    pub fn mapping_token(&self) -> Option<MappingToken> {
        self.mapping.map(|m| m.token)
    }

    /// Where the accelerator sees this buffer, once mapped.
    pub fn device_address(&self) -> Option<DeviceAddress> {
        self.mapping.map(|m| m.device_address)
    }

    /// Accelerator address space `map` reserves for the current storage.
    pub fn reservation_size(&self) -> u64 {
        self.config.reservation_size(self.len())
    }

    pub fn as_slice(&self) -> &[u8] {
        self.storage.as_slice()
    }

    /// Host access to the storage. Writes are not visible to the accelerator until
    /// [`Buffer::begin`].
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.storage.as_mut_slice()
    }

    /// Replaces the storage with a fresh owned allocation of `size` bytes.
    ///
    /// Any existing mapping is torn down and previous owned storage released first. On failure
    /// the buffer is left without storage.
    pub fn allocate(&mut self, size: usize) -> Result<()> {
        self.unmap()?;
        self.storage = Storage::Empty;
        let storage = AlignedStorage::allocate(size, self.config.alignment())?;
        debug!(size, alignment = self.config.alignment(), "allocated buffer storage");
        self.storage = Storage::Owned(storage);
        Ok(())
    }

    /// Binds caller-owned storage. The borrow keeps `data` alive for the buffer's lifetime.
    pub fn use_storage(&mut self, data: &'a mut [u8]) -> Result<()> {
        self.unmap()?;
        debug!(size = data.len(), "using borrowed buffer storage");
        self.storage = Storage::Borrowed(data);
        Ok(())
    }

    /// Reserves accelerator address space and maps the storage into it.
    ///
    /// Remapping first tears down the existing mapping. If the map request fails, the
    /// reservation taken by this call is released before the error is returned.
    pub fn map(&mut self) -> Result<()> {
        if self.storage.origin().is_none() {
            return Err(BridgeError::NoStorage);
        }
        self.unmap()?;

        let session = self.session;
        let processor = session.processor();
        let size = self.reservation_size();
        let reservation = match session
            .request(Request::Reserve { processor, size }, BridgeError::ReservationFailed)?
        {
            Reply::Reserved(token) => token,
            _ => return Err(BridgeError::UnexpectedReply { op: "reserve" }),
        };

        let mapped = session
            .request(
                Request::Map {
                    processor,
                    host: HostRegion::from_mut_slice(self.storage.as_mut_slice()),
                    reservation,
                },
                BridgeError::MapFailed,
            )
            .and_then(|reply| match reply {
                Reply::Mapped {
                    mapping,
                    device_address,
                } => Ok((mapping, device_address)),
                _ => Err(BridgeError::UnexpectedReply { op: "map" }),
            });

        match mapped {
            Ok((token, device_address)) => {
                debug!(
                    len = self.len(),
                    reserved = size,
                    %device_address,
                    "mapped buffer"
                );
                self.mapping = Some(Mapping {
                    reservation,
                    token,
                    device_address,
                });
                Ok(())
            }
            Err(err) => {
                if let Err(unreserve_err) = self.session.request(
                    Request::Unreserve {
                        processor,
                        reservation,
                    },
                    BridgeError::UnreserveFailed,
                ) {
                    warn!(%unreserve_err, "releasing reservation after failed map");
                }
                Err(err)
            }
        }
    }

    /// Unmaps, then releases the reservation. Does nothing if the buffer is not mapped.
    ///
    /// A failed unmap leaves the buffer mapped. Once the unmap succeeds both tokens are cleared,
    /// even if releasing the reservation fails.
    pub fn unmap(&mut self) -> Result<()> {
        let Some(mapping) = self.mapping else {
            return Ok(());
        };
        let processor = self.session.processor();

        self.session.request(
            Request::Unmap {
                processor,
                mapping: mapping.token,
            },
            BridgeError::UnmapFailed,
        )?;
        self.mapping = None;

        self.session.request(
            Request::Unreserve {
                processor,
                reservation: mapping.reservation,
            },
            BridgeError::UnreserveFailed,
        )?;
        debug!(device_address = %mapping.device_address, "unmapped buffer");
        Ok(())
    }

    /// The first `len` bytes of storage, for cache maintenance on a mapped buffer.
    fn maintenance_range(&mut self, len: usize) -> Result<HostRegion<'_>> {
        if self.mapping.is_none() {
            return Err(BridgeError::NotMapped);
        }
        let capacity = self.len();
        let bytes = self
            .storage
            .as_mut_slice()
            .get_mut(..len)
            .ok_or(BridgeError::LengthOutOfRange { len, capacity })?;
        Ok(HostRegion::from_mut_slice(bytes))
    }

    /// Marks the start of an accelerator transfer over the first `len` bytes.
    ///
    /// Flushes for [`Direction::ToDevice`] and [`Direction::Bidirectional`].
    pub fn begin(&mut self, len: usize) -> Result<()> {
        let session = self.session;
        let flush = self.direction.flushes_on_begin();
        let host = self.maintenance_range(len)?;
        if flush {
            session.request(
                Request::Flush {
                    processor: session.processor(),
                    host,
                },
                BridgeError::FlushFailed,
            )?;
        }
        Ok(())
    }

    /// Marks the end of an accelerator transfer over the first `len` bytes.
    ///
    /// Invalidates for [`Direction::FromDevice`] and [`Direction::Bidirectional`].
    pub fn end(&mut self, len: usize) -> Result<()> {
        let session = self.session;
        let invalidate = self.direction.invalidates_on_end();
        let host = self.maintenance_range(len)?;
        if invalidate {
            session.request(
                Request::Invalidate {
                    processor: session.processor(),
                    host,
                },
                BridgeError::InvalidateFailed,
            )?;
        }
        Ok(())
    }

    /// Releases owned storage and the descriptor.
    ///
    /// Freeing a mapped buffer unmaps it first. Borrowed storage is returned to the caller
    /// untouched.
    pub fn free(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.mapping.is_some() {
            warn!(len = self.len(), "freeing a mapped buffer; unmapping first");
            if let Err(err) = self.unmap() {
                if self.mapping.is_some() {
                    warn!(%err, len = self.len(), "buffer still mapped; leaking its storage");
                    if let Storage::Owned(storage) = mem::replace(&mut self.storage, Storage::Empty)
                    {
                        mem::forget(storage);
                    }
                    self.mapping = None;
                }
                self.storage = Storage::Empty;
                return Err(err);
            }
        }
        self.storage = Storage::Empty;
        Ok(())
    }
}

impl<C: ControlChannel> Drop for Buffer<'_, C> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
