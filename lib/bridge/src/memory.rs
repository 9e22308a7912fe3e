//! Linear memory shared between the host and a module.

use std::collections::BTreeMap;

use wasmer::{Memory, MemoryError, MemoryType, MemoryView, Pages, Store};

use crate::{error::BoundaryViolation, loader::EngineTag};

/// A host-created linear memory that can be handed to
/// [`Loader::load()`][crate::Loader::load] for modules that import their
/// memory.
///
/// The memory lives inside its own [`Store`], which becomes the handle's store
/// once the module is instantiated against it.
#[derive(Debug)]
pub struct LinearMemory {
    pub(crate) store: Store,
    pub(crate) memory: Memory,
    pub(crate) engine: EngineTag,
}

impl LinearMemory {
    pub(crate) fn new(
        mut store: Store,
        ty: MemoryType,
        engine: EngineTag,
    ) -> Result<Self, MemoryError> {
        let memory = Memory::new(&mut store, ty)?;
        Ok(LinearMemory {
            store,
            memory,
            engine,
        })
    }

    pub fn ty(&self) -> MemoryType {
        self.memory.ty(&self.store)
    }

    /// The current size, which may be larger than the declared minimum.
    pub fn size(&self) -> Pages {
        self.memory.view(&self.store).size()
    }

    pub fn view(&self) -> MemoryView<'_> {
        self.memory.view(&self.store)
    }
}

/// A region of linear memory the host knows the extent of.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct GuestBuffer {
    pub offset: u32,
    pub len: u32,
}

impl GuestBuffer {
    pub const fn new(offset: u32, len: u32) -> Self {
        GuestBuffer { offset, len }
    }
}

/// The sizes of the allocations the host made through the module's
/// allocator, so a free with the wrong size can be caught before the module
/// sees it.
///
/// Offsets the ledger has never seen (buffers the module allocated for the
/// host) pass through unchecked.
#[derive(Debug, Default)]
pub(crate) struct AllocationLedger {
    live: BTreeMap<u32, u32>,
}

impl AllocationLedger {
    pub(crate) fn record(&mut self, offset: u32, size: u32) {
        if let Some(previous) = self.live.insert(offset, size) {
            // The allocator handed out an offset we still consider live. Most
            // likely the module freed it behind our back.
            tracing::debug!(
                offset,
                previous_size = previous,
                size,
                "Allocator reused an offset the host still tracked",
            );
        }
    }

    pub(crate) fn check(&self, offset: u32, size: u32) -> Result<(), BoundaryViolation> {
        match self.live.get(&offset) {
            Some(&expected) if expected != size => Err(BoundaryViolation::MismatchedFree {
                offset,
                size,
                expected,
            }),
            _ => Ok(()),
        }
    }

    pub(crate) fn forget(&mut self, offset: u32) {
        self.live.remove(&offset);
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }
}

fn check_bounds(view: &MemoryView<'_>, offset: u64, len: u64) -> Result<(), BoundaryViolation> {
    let memory_size = view.data_size();

    match offset.checked_add(len) {
        Some(end) if end <= memory_size => Ok(()),
        _ => Err(BoundaryViolation::OutOfBounds {
            offset,
            len,
            memory_size,
        }),
    }
}

pub(crate) fn read(view: &MemoryView<'_>, offset: u32, len: u32) -> Result<Vec<u8>, BoundaryViolation> {
    let (offset, len) = (u64::from(offset), u64::from(len));
    check_bounds(view, offset, len)?;

    let mut buffer = vec![0; len as usize];
    view.read(offset, &mut buffer)
        .map_err(|_| BoundaryViolation::OutOfBounds {
            offset,
            len,
            memory_size: view.data_size(),
        })?;

    Ok(buffer)
}

pub(crate) fn write(view: &MemoryView<'_>, offset: u32, data: &[u8]) -> Result<(), BoundaryViolation> {
    let (offset, len) = (u64::from(offset), data.len() as u64);
    check_bounds(view, offset, len)?;

    view.write(offset, data)
        .map_err(|_| BoundaryViolation::OutOfBounds {
            offset,
            len,
            memory_size: view.data_size(),
        })
}
