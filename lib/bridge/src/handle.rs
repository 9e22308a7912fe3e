//! The live side of the boundary: an instantiated module and the calls the
//! host can make into it.

use std::fmt;

use anyhow::Context;
use wasmer::{
    Function, FunctionEnv, FunctionEnvMut, Instance, Memory, MemoryView, Pages, RuntimeError,
    Store, TypedFunction,
};

use crate::{
    config::LoaderConfig,
    env::BridgeEnv,
    error::{BoundaryViolation, BridgeError, LoadError},
    exception::{Exception, ModuleException},
    hash::ModuleHash,
    memory::{self, AllocationLedger, GuestBuffer},
    table::{CallbackShape, DispatchTable, TableIndex},
};

/// The status word returned by the `invoke_*` shapes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CallStatus {
    /// The callee returned normally.
    Returned,
    /// The callee failed. The exception store holds the reason.
    Raised,
}

impl CallStatus {
    pub const fn code(self) -> i32 {
        match self {
            CallStatus::Returned => 0,
            CallStatus::Raised => 1,
        }
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(CallStatus::Returned),
            1 => Some(CallStatus::Raised),
            _ => None,
        }
    }
}

/// The low-level exports every bridged module provides.
pub(crate) struct BridgeExports {
    pub(crate) malloc: TypedFunction<u32, u32>,
    pub(crate) realloc: TypedFunction<(u32, u32, u32), u32>,
    pub(crate) free: TypedFunction<(u32, u32), ()>,
    pub(crate) invoke_binary: TypedFunction<(u32, i32, i32, u32, u32), i32>,
    pub(crate) invoke_nullary: TypedFunction<(u32, i32), ()>,
}

impl BridgeExports {
    pub(crate) fn resolve(
        instance: &Instance,
        store: &Store,
        config: &LoaderConfig,
    ) -> Result<Self, LoadError> {
        let names = &config.exports;
        let exports = &instance.exports;
        let malformed =
            |name: &str, e: wasmer::ExportError| LoadError::malformed(format!("\"{name}\": {e}"));

        Ok(BridgeExports {
            malloc: exports
                .get_typed_function(store, &names.malloc)
                .map_err(|e| malformed(&names.malloc, e))?,
            realloc: exports
                .get_typed_function(store, &names.realloc)
                .map_err(|e| malformed(&names.realloc, e))?,
            free: exports
                .get_typed_function(store, &names.free)
                .map_err(|e| malformed(&names.free, e))?,
            invoke_binary: exports
                .get_typed_function(store, &names.invoke_binary)
                .map_err(|e| malformed(&names.invoke_binary, e))?,
            invoke_nullary: exports
                .get_typed_function(store, &names.invoke_nullary)
                .map_err(|e| malformed(&names.invoke_nullary, e))?,
        })
    }
}

/// A successfully loaded module.
///
/// Every call takes `&mut self`: one call at a time, strictly in order. The
/// only thing that runs while a call is in flight is the host callbacks the
/// module dispatches to through the table.
///
/// Memory views borrow the handle, so a view can never survive a call that
/// might have grown (and moved) the module's memory.
pub struct InstantiatedHandle {
    store: Store,
    instance: Instance,
    env: FunctionEnv<BridgeEnv>,
    memory: Memory,
    exports: BridgeExports,
    table: DispatchTable,
    ledger: Option<AllocationLedger>,
    config: LoaderConfig,
    hash: Option<ModuleHash>,
}

impl InstantiatedHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        mut store: Store,
        instance: Instance,
        env: FunctionEnv<BridgeEnv>,
        memory: Memory,
        exports: BridgeExports,
        table: DispatchTable,
        config: LoaderConfig,
        hash: Option<ModuleHash>,
    ) -> Self {
        let ledger = config.track_allocations.then(AllocationLedger::default);
        env.as_mut(&mut store).memory = Some(memory.clone());

        InstantiatedHandle {
            store,
            instance,
            env,
            memory,
            exports,
            table,
            ledger,
            config,
            hash,
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// The store everything in this handle lives in, for calling exports the
    /// bridge doesn't know about.
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// A fresh view of linear memory.
    pub fn memory_view(&self) -> MemoryView<'_> {
        self.memory.view(&self.store)
    }

    pub fn memory_size(&self) -> Pages {
        self.memory_view().size()
    }

    pub fn dispatch_table(&self) -> &DispatchTable {
        &self.table
    }

    /// The hash of the module's bytes, unless it was handed over precompiled.
    pub fn module_hash(&self) -> Option<ModuleHash> {
        self.hash
    }

    /// How many host-made allocations are still live, when tracking is
    /// enabled.
    pub fn tracked_allocations(&self) -> Option<usize> {
        self.ledger.as_ref().map(AllocationLedger::len)
    }

    /// Reserve `size` bytes in linear memory. The module may grow its memory
    /// to satisfy the request.
    pub fn allocate(&mut self, size: usize) -> Result<u32, BridgeError> {
        let len = u32::try_from(size)
            .map_err(|_| BridgeError::AllocationFailed { size, source: None })?;

        self.discard_stale_exception("allocate");
        let offset = self
            .exports
            .malloc
            .call(&mut self.store, len)
            .map_err(|e| BridgeError::AllocationFailed {
                size,
                source: Some(e),
            })?;

        if let Some(ledger) = &mut self.ledger {
            ledger.record(offset, len);
        }

        Ok(offset)
    }

    /// Resize an allocation. The first `min(old_size, new_size)` bytes are
    /// preserved and `offset` must not be used afterwards.
    pub fn reallocate(
        &mut self,
        offset: u32,
        old_size: u32,
        new_size: u32,
    ) -> Result<u32, BridgeError> {
        if let Some(ledger) = &self.ledger {
            ledger.check(offset, old_size)?;
        }

        self.discard_stale_exception("reallocate");
        let new_offset = self
            .exports
            .realloc
            .call(&mut self.store, offset, old_size, new_size)
            .map_err(|e| BridgeError::AllocationFailed {
                size: new_size as usize,
                source: Some(e),
            })?;

        if let Some(ledger) = &mut self.ledger {
            ledger.forget(offset);
            ledger.record(new_offset, new_size);
        }

        Ok(new_offset)
    }

    /// Give an allocation back to the module's allocator.
    ///
    /// `(offset, size)` must match a live allocation exactly. With
    /// [`LoaderConfig::track_allocations`] the handle catches mismatched
    /// sizes for allocations it made itself; anything else is undefined.
    pub fn free(&mut self, offset: u32, size: u32) -> Result<(), BridgeError> {
        if let Some(ledger) = &self.ledger {
            ledger.check(offset, size)?;
        }

        self.discard_stale_exception("free");
        self.exports.free.call(&mut self.store, offset, size)?;

        if let Some(ledger) = &mut self.ledger {
            ledger.forget(offset);
        }

        Ok(())
    }

    /// Copy `data` into a new allocation. The caller owns the result and must
    /// [`free()`][Self::free] it.
    pub fn pass_bytes(&mut self, data: &[u8]) -> Result<GuestBuffer, BridgeError> {
        let offset = self.allocate(data.len())?;
        // allocate() already proved the length fits in a u32
        let buffer = GuestBuffer::new(offset, data.len() as u32);
        self.write_bytes(offset, data)?;
        Ok(buffer)
    }

    pub fn pass_str(&mut self, s: &str) -> Result<GuestBuffer, BridgeError> {
        self.pass_bytes(s.as_bytes())
    }

    pub fn write_bytes(&self, offset: u32, data: &[u8]) -> Result<(), BridgeError> {
        memory::write(&self.memory_view(), offset, data)?;
        Ok(())
    }

    /// Copy bytes out of linear memory without changing who owns them.
    pub fn read_bytes(&self, offset: u32, len: u32) -> Result<Vec<u8>, BridgeError> {
        Ok(memory::read(&self.memory_view(), offset, len)?)
    }

    pub fn read_string(&self, offset: u32, len: u32) -> Result<String, BridgeError> {
        let bytes = self.read_bytes(offset, len)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Copy a buffer the module allocated for the host, then free it.
    pub fn take_bytes(&mut self, buffer: GuestBuffer) -> Result<Vec<u8>, BridgeError> {
        let bytes = self.read_bytes(buffer.offset, buffer.len)?;
        self.free(buffer.offset, buffer.len)?;
        Ok(bytes)
    }

    pub fn take_string(&mut self, buffer: GuestBuffer) -> Result<String, BridgeError> {
        let bytes = self.take_bytes(buffer)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Make a two-argument callback callable through
    /// [`invoke_binary()`][Self::invoke_binary].
    ///
    /// The module calls the adapter as `(a, b, out_first, out_second) -> status`
    /// and the adapter writes the callback's two results to the output
    /// locations as little-endian words. An `Err` from the callback, or output
    /// locations outside linear memory, is stored in the exception store and
    /// reported to the module as [`CallStatus::Raised`].
    pub fn register_binary<F>(&mut self, callback: F) -> Result<TableIndex, BridgeError>
    where
        F: Fn(i32, i32) -> Result<(i32, i32), anyhow::Error> + Send + Sync + 'static,
    {
        let function = Function::new_typed_with_env(
            &mut self.store,
            &self.env,
            move |mut env: FunctionEnvMut<BridgeEnv>,
                  a: i32,
                  b: i32,
                  out_first: u32,
                  out_second: u32|
                  -> i32 {
                let outcome = callback(a, b).and_then(|(first, second)| {
                    let (data, store) = env.data_and_store_mut();
                    let linear_memory = data
                        .memory
                        .as_ref()
                        .context("linear memory is not attached yet")?;
                    let view = linear_memory.view(&store);
                    memory::write(&view, out_first, &first.to_le_bytes())?;
                    memory::write(&view, out_second, &second.to_le_bytes())?;
                    Ok(())
                });

                match outcome {
                    Ok(()) => CallStatus::Returned.code(),
                    Err(e) => {
                        tracing::debug!(error = %e, "Binary host callback failed");
                        env.data_mut().exceptions.store(Exception::Host(e));
                        CallStatus::Raised.code()
                    }
                }
            },
        );

        Ok(self
            .table
            .register(&mut self.store, function, CallbackShape::Binary)?)
    }

    /// Make a context-only callback callable through
    /// [`invoke_nullary()`][Self::invoke_nullary].
    pub fn register_nullary<F>(&mut self, callback: F) -> Result<TableIndex, BridgeError>
    where
        F: Fn(i32) -> Result<(), anyhow::Error> + Send + Sync + 'static,
    {
        let function = Function::new_typed_with_env(
            &mut self.store,
            &self.env,
            move |mut env: FunctionEnvMut<BridgeEnv>, context: i32| {
                if let Err(e) = callback(context) {
                    tracing::debug!(error = %e, "Nullary host callback failed");
                    env.data_mut().exceptions.store(Exception::Host(e));
                }
            },
        );

        Ok(self
            .table
            .register(&mut self.store, function, CallbackShape::Nullary)?)
    }

    /// Release a callback's table slot. The index is dead afterwards.
    pub fn release(&mut self, index: TableIndex) -> Result<(), BridgeError> {
        self.table.release(&mut self.store, index)?;
        Ok(())
    }

    /// Call the binary callback at `index` through the module. The two result
    /// words land at `out_first` and `out_second`.
    pub fn invoke_binary(
        &mut self,
        index: TableIndex,
        a: i32,
        b: i32,
        out_first: u32,
        out_second: u32,
    ) -> Result<(), BridgeError> {
        self.table.check(index, CallbackShape::Binary)?;
        self.discard_stale_exception("invoke_binary");

        let status = match self.exports.invoke_binary.call(
            &mut self.store,
            index.raw(),
            a,
            b,
            out_first,
            out_second,
        ) {
            Ok(status) => status,
            Err(e) => return Err(self.classify_trap(Some(index), e)),
        };

        match CallStatus::from_code(status) {
            Some(CallStatus::Returned) => Ok(()),
            Some(CallStatus::Raised) => Err(self.raised()),
            None => Err(BoundaryViolation::UnknownStatus(status).into()),
        }
    }

    /// [`invoke_binary()`][Self::invoke_binary] with scratch space for the
    /// results, which are read back and returned.
    pub fn call_binary(
        &mut self,
        index: TableIndex,
        a: i32,
        b: i32,
    ) -> Result<(i32, i32), BridgeError> {
        let scratch = self.allocate(8)?;
        let outcome = match scratch.checked_add(4) {
            Some(second) => self
                .invoke_binary(index, a, b, scratch, second)
                .and_then(|()| self.read_bytes(scratch, 8)),
            None => Err(BoundaryViolation::OutOfBounds {
                offset: scratch.into(),
                len: 8,
                memory_size: self.memory_view().data_size(),
            }
            .into()),
        };

        // The call's own failure wins over a failure to free the scratch space.
        let freed = self.free(scratch, 8);
        let words = match (outcome, freed) {
            (Ok(words), Ok(())) => words,
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(free_error)) => {
                tracing::warn!(
                    error = %free_error,
                    scratch,
                    "Unable to free the scratch space after a failed call",
                );
                return Err(e);
            }
        };
        let first = i32::from_le_bytes([words[0], words[1], words[2], words[3]]);
        let second = i32::from_le_bytes([words[4], words[5], words[6], words[7]]);
        Ok((first, second))
    }

    /// Call the nullary callback at `index` through the module.
    pub fn invoke_nullary(&mut self, index: TableIndex, context: i32) -> Result<(), BridgeError> {
        self.table.check(index, CallbackShape::Nullary)?;
        self.discard_stale_exception("invoke_nullary");

        if let Err(e) = self
            .exports
            .invoke_nullary
            .call(&mut self.store, index.raw(), context)
        {
            return Err(self.classify_trap(Some(index), e));
        }

        // No status word for this shape; a pending exception is the signal.
        if self.has_pending_exception() {
            return Err(self.raised());
        }

        Ok(())
    }

    /// Record an exception on the module's behalf.
    pub fn store_exception(&mut self, exception: Exception) {
        self.env.as_mut(&mut self.store).exceptions.store(exception);
    }

    /// Read and clear the exception store.
    pub fn take_exception(&mut self) -> Option<Exception> {
        self.env.as_mut(&mut self.store).exceptions.take()
    }

    pub fn pending_exception(&self) -> Option<&Exception> {
        self.env.as_ref(&self.store).exceptions.peek()
    }

    pub fn has_pending_exception(&self) -> bool {
        self.env.as_ref(&self.store).exceptions.is_pending()
    }

    /// Turn a raw exception into something the host can report, copying any
    /// payload out of linear memory.
    pub fn decode_exception(&self, exception: Exception) -> Result<ModuleException, BridgeError> {
        match exception {
            Exception::Guest { offset, len } => {
                let payload = self.read_bytes(offset, len)?;
                Ok(ModuleException::from_guest(payload))
            }
            Exception::Host(e) => Ok(ModuleException::from_host(e)),
        }
    }

    /// Run the module's application entry point (`start_app` by default).
    pub fn start_app(&mut self) -> Result<(), BridgeError> {
        let entry_point = self.config.exports.entry_point.clone();
        self.call_entry(&entry_point)
    }

    /// Call a zero-argument, no-return export.
    ///
    /// Failure is signaled either by a trap or by an exception left in the
    /// store when the call returns. An exception still pending from an
    /// earlier call is discarded before the call starts.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn call_entry(&mut self, name: &str) -> Result<(), BridgeError> {
        let entry: TypedFunction<(), ()> = self
            .instance
            .exports
            .get_typed_function(&self.store, name)
            .map_err(|source| BridgeError::MissingExport {
                name: name.to_string(),
                source,
            })?;

        self.discard_stale_exception(name);

        if let Err(e) = entry.call(&mut self.store) {
            return Err(self.classify_trap(None, e));
        }

        if self.has_pending_exception() {
            return Err(self.raised());
        }

        Ok(())
    }

    /// Run the start-up hook, if the module has one.
    pub(crate) fn run_start_hook(&mut self) -> Result<(), LoadError> {
        let name = &self.config.exports.start_hook;
        let hook: TypedFunction<(), ()> = match self
            .instance
            .exports
            .get_typed_function(&self.store, name)
        {
            Ok(hook) => hook,
            Err(wasmer::ExportError::Missing(_)) => return Ok(()),
            Err(e) => {
                return Err(LoadError::malformed(format!("\"{name}\": {e}")));
            }
        };

        tracing::debug!(hook = %name, "Running the start-up hook");

        match self.call_start_hook(hook) {
            Ok(()) => Ok(()),
            Err(e) => Err(LoadError::InstantiationFailed(Box::new(e))),
        }
    }

    fn call_start_hook(&mut self, hook: TypedFunction<(), ()>) -> Result<(), BridgeError> {
        self.discard_stale_exception("start hook");

        if let Err(e) = hook.call(&mut self.store) {
            return Err(self.classify_trap(None, e));
        }

        if self.has_pending_exception() {
            return Err(self.raised());
        }

        Ok(())
    }

    /// Consume the pending exception after a call signaled failure.
    fn raised(&mut self) -> BridgeError {
        match self.take_exception() {
            Some(exception) => match self.decode_exception(exception) {
                Ok(exception) => BridgeError::ModuleRaised(exception),
                Err(e) => e,
            },
            None => BoundaryViolation::MissingException.into(),
        }
    }

    fn classify_trap(&mut self, index: Option<TableIndex>, error: RuntimeError) -> BridgeError {
        // Module code stores first and then traps to unwind.
        if self.has_pending_exception() {
            return self.raised();
        }

        // Host adapters never trap, so a trap inside an invoke shim means the
        // indirect call itself failed (null entry, bad index or signature).
        if let Some(index) = index {
            return BoundaryViolation::IndirectCall {
                index,
                message: error.message(),
            }
            .into();
        }

        BridgeError::Trap(error)
    }

    /// Every call into the module starts with an empty exception store, so a
    /// pending exception afterwards can only have come from that call.
    fn discard_stale_exception(&mut self, call: &str) {
        if let Some(exception) = self.take_exception() {
            tracing::warn!(
                call,
                exception.origin = %exception.origin(),
                ?exception,
                "Discarding an exception nobody read before the next call",
            );
        }
    }
}

impl fmt::Debug for InstantiatedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstantiatedHandle")
            .field("hash", &self.hash)
            .field("memory_size", &self.memory_size())
            .field("table", &self.table)
            .field("pending_exception", &self.pending_exception())
            .finish_non_exhaustive()
    }
}
