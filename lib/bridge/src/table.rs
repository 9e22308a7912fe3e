//! Host callbacks made reachable from module code through its `funcref` table.

use std::{collections::HashMap, fmt};

use wasmer::{AsStoreMut, Function, RuntimeError, Table, Value};

use crate::error::BoundaryViolation;

/// A stable handle to a dispatch table entry.
///
/// This is the only thing that crosses the boundary for a callback. Raw
/// function addresses never do.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableIndex(u32);

impl TableIndex {
    pub const fn from_raw(index: u32) -> Self {
        TableIndex(index)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The calling shape of a registered callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CallbackShape {
    /// `(a, b, out_first, out_second) -> status`, dispatched by
    /// `invoke_binary`. The two result words are written to the output
    /// locations in linear memory.
    Binary,
    /// `(i32) -> ()`, dispatched by `invoke_nullary`.
    Nullary,
}

impl CallbackShape {
    pub fn name(self) -> &'static str {
        match self {
            CallbackShape::Binary => "binary",
            CallbackShape::Nullary => "nullary",
        }
    }
}

/// Bookkeeping for which table slots the host owns.
#[derive(Debug, Default)]
pub(crate) struct SlotRegistry {
    live: HashMap<u32, CallbackShape>,
    released: Vec<u32>,
}

impl SlotRegistry {
    /// A previously released slot that can be overwritten, if any.
    fn reusable(&mut self) -> Option<u32> {
        self.released.pop()
    }

    fn insert(&mut self, index: u32, shape: CallbackShape) {
        self.live.insert(index, shape);
    }

    fn remove(&mut self, index: TableIndex) -> Result<CallbackShape, BoundaryViolation> {
        let shape = self
            .live
            .remove(&index.raw())
            .ok_or(BoundaryViolation::UnregisteredIndex(index))?;
        self.released.push(index.raw());
        Ok(shape)
    }

    fn check(&self, index: TableIndex, expected: CallbackShape) -> Result<(), BoundaryViolation> {
        match self.live.get(&index.raw()) {
            Some(shape) if *shape == expected => Ok(()),
            Some(shape) => Err(BoundaryViolation::WrongShape {
                index,
                expected: expected.name(),
                actual: shape.name(),
            }),
            None => Err(BoundaryViolation::UnregisteredIndex(index)),
        }
    }

    fn len(&self) -> usize {
        self.live.len()
    }
}

/// The module's exported `funcref` table plus the host's record of which
/// entries it registered.
///
/// Entries the module populated itself (element segments) aren't tracked and
/// can't be invoked through the host-side `invoke_*` calls.
#[derive(Debug)]
pub struct DispatchTable {
    table: Table,
    slots: SlotRegistry,
}

impl DispatchTable {
    pub(crate) fn new(table: Table) -> Self {
        DispatchTable {
            table,
            slots: SlotRegistry::default(),
        }
    }

    /// Place `function` in the table, reusing a released slot when possible
    /// and growing the table otherwise.
    pub(crate) fn register(
        &mut self,
        store: &mut impl AsStoreMut,
        function: Function,
        shape: CallbackShape,
    ) -> Result<TableIndex, RuntimeError> {
        let index = match self.slots.reusable() {
            Some(index) => {
                if let Err(e) = self.table.set(store, index, Value::FuncRef(Some(function))) {
                    self.slots.released.push(index);
                    return Err(e);
                }
                index
            }
            None => self
                .table
                .grow(store, 1, Value::FuncRef(Some(function)))?,
        };

        self.slots.insert(index, shape);
        tracing::trace!(index, shape = shape.name(), "Registered a host callback");

        Ok(TableIndex(index))
    }

    /// Null out a registered entry so the slot can be reused.
    pub(crate) fn release(
        &mut self,
        store: &mut impl AsStoreMut,
        index: TableIndex,
    ) -> Result<(), BoundaryViolation> {
        let shape = self.slots.remove(index)?;

        if let Err(e) = self.table.set(store, index.raw(), Value::FuncRef(None)) {
            // The slot was ours, so the index is in bounds. Keep the
            // bookkeeping consistent either way.
            tracing::warn!(%index, error = %e, "Unable to clear a table slot");
        }

        tracing::trace!(%index, shape = shape.name(), "Released a host callback");
        Ok(())
    }

    pub(crate) fn check(
        &self,
        index: TableIndex,
        shape: CallbackShape,
    ) -> Result<(), BoundaryViolation> {
        self.slots.check(index, shape)
    }

    /// The number of host callbacks currently registered.
    pub fn live_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn table(&self) -> &Table {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_slots_are_reused_last_in_first_out() {
        let mut slots = SlotRegistry::default();
        slots.insert(1, CallbackShape::Binary);
        slots.insert(2, CallbackShape::Nullary);
        slots.insert(3, CallbackShape::Binary);

        slots.remove(TableIndex(1)).unwrap();
        slots.remove(TableIndex(3)).unwrap();

        assert_eq!(slots.reusable(), Some(3));
        assert_eq!(slots.reusable(), Some(1));
        assert_eq!(slots.reusable(), None);
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn releasing_twice_is_a_violation() {
        let mut slots = SlotRegistry::default();
        slots.insert(5, CallbackShape::Nullary);

        assert_eq!(slots.remove(TableIndex(5)), Ok(CallbackShape::Nullary));
        assert_eq!(
            slots.remove(TableIndex(5)),
            Err(BoundaryViolation::UnregisteredIndex(TableIndex(5)))
        );
    }

    #[test]
    fn checks_shape_and_liveness() {
        let mut slots = SlotRegistry::default();
        slots.insert(1, CallbackShape::Binary);

        assert_eq!(slots.check(TableIndex(1), CallbackShape::Binary), Ok(()));
        assert_eq!(
            slots.check(TableIndex(1), CallbackShape::Nullary),
            Err(BoundaryViolation::WrongShape {
                index: TableIndex(1),
                expected: "nullary",
                actual: "binary",
            })
        );
        assert_eq!(
            slots.check(TableIndex(7), CallbackShape::Binary),
            Err(BoundaryViolation::UnregisteredIndex(TableIndex(7)))
        );
    }
}
