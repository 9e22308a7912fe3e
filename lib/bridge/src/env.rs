use wasmer::{Function, FunctionEnv, FunctionEnvMut, Imports, Memory, Store};

use crate::{
    config::ExportNames,
    exception::{Exception, ExceptionStore},
};

/// State shared between the handle and the host functions it gives the
/// module.
#[derive(Debug, Default)]
pub struct BridgeEnv {
    pub(crate) exceptions: ExceptionStore,
    /// Attached once the module is instantiated. Binary callbacks write their
    /// results through it.
    pub(crate) memory: Option<Memory>,
}

impl BridgeEnv {
    pub fn exceptions(&self) -> &ExceptionStore {
        &self.exceptions
    }

    pub fn exceptions_mut(&mut self) -> &mut ExceptionStore {
        &mut self.exceptions
    }

    pub fn memory(&self) -> Option<&Memory> {
        self.memory.as_ref()
    }
}

/// Module-side exception setter: `(offset: i32, len: i32) -> ()`.
fn exn_store(mut env: FunctionEnvMut<BridgeEnv>, offset: u32, len: u32) {
    tracing::debug!(offset, len, "Module stored an exception");
    env.data_mut()
        .exceptions
        .store(Exception::Guest { offset, len });
}

/// Where a module expects its memory to come from.
#[derive(Debug, Clone)]
pub(crate) struct MemoryImport {
    pub(crate) module: String,
    pub(crate) name: String,
    pub(crate) ty: wasmer::MemoryType,
}

/// The imports every bridged module gets.
pub(crate) fn bridge_imports(
    store: &mut Store,
    env: &FunctionEnv<BridgeEnv>,
    names: &ExportNames,
    memory: Option<(&MemoryImport, &Memory)>,
) -> Imports {
    let mut imports = Imports::new();

    imports.define(
        &names.import_namespace,
        &names.exception_store,
        Function::new_typed_with_env(store, env, exn_store),
    );

    if let Some((import, memory)) = memory {
        imports.define(&import.module, &import.name, memory.clone());
    }

    imports
}
