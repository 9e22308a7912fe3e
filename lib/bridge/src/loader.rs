use std::{fmt, sync::Arc};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, header};
use url::Url;
use wasmer::{
    Engine, ExternType, FunctionEnv, Imports, Instance, Memory, MemoryType, Module, Pages, Store,
    Type,
};

use crate::{
    config::{ExportNames, LoaderConfig},
    env::{BridgeEnv, MemoryImport, bridge_imports},
    error::LoadError,
    handle::{BridgeExports, InstantiatedHandle},
    hash::ModuleHash,
    http::{DynHttpClient, HttpRequest, HttpResponse, USER_AGENT, WASM_CONTENT_TYPE},
    memory::LinearMemory,
    source::{ModuleSource, PrecompiledModule},
    table::DispatchTable,
};

/// Lets the host contribute its own imports (for example the module's
/// `__wbg_*` functions) before instantiation.
pub type ImportsHook =
    Box<dyn FnOnce(&mut Store, &FunctionEnv<BridgeEnv>, &mut Imports) + Send + 'static>;

/// Everything besides the source that affects a single load.
#[derive(Default)]
pub struct LoadOptions {
    memory: Option<LinearMemory>,
    imports: Option<ImportsHook>,
}

impl LoadOptions {
    /// Instantiate against this memory instead of allocating a fresh one.
    pub fn with_memory(self, memory: LinearMemory) -> Self {
        LoadOptions {
            memory: Some(memory),
            ..self
        }
    }

    pub fn with_imports<F>(self, hook: F) -> Self
    where
        F: FnOnce(&mut Store, &FunctionEnv<BridgeEnv>, &mut Imports) + Send + 'static,
    {
        LoadOptions {
            imports: Some(Box::new(hook)),
            ..self
        }
    }
}

impl fmt::Debug for LoadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOptions")
            .field("memory", &self.memory)
            .field("imports", &self.imports.is_some())
            .finish()
    }
}

/// A source that has been boiled down to something we can instantiate.
enum Resolved {
    Bytes(Bytes),
    Module(PrecompiledModule),
}

/// Identifies the engine of one [`Loader`] and its clones.
///
/// Modules and stores only work with the engine that created them, and
/// `wasmer` has no way to ask a [`Module`] which engine that was.
#[derive(Debug, Clone)]
pub(crate) struct EngineTag(Arc<()>);

impl EngineTag {
    fn new() -> Self {
        EngineTag(Arc::new(()))
    }

    pub(crate) fn same_engine(&self, other: &EngineTag) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Turns [`ModuleSource`]s into [`InstantiatedHandle`]s.
///
/// Every load gets its own [`Store`], so handles never share memory, tables
/// or exception state, even when they come from the same bytes.
#[derive(Clone)]
pub struct Loader {
    engine: Engine,
    tag: EngineTag,
    config: LoaderConfig,
    client: Option<DynHttpClient>,
}

impl Loader {
    pub fn new(config: LoaderConfig) -> Self {
        Loader {
            engine: Engine::default(),
            tag: EngineTag::new(),
            config,
            client: crate::http::default_http_client(),
        }
    }

    /// Switch engines. Modules and memories made by this loader before the
    /// switch are rejected afterwards.
    pub fn with_engine(self, engine: Engine) -> Self {
        Loader {
            engine,
            tag: EngineTag::new(),
            ..self
        }
    }

    pub fn with_http_client(self, client: DynHttpClient) -> Self {
        Loader {
            client: Some(client),
            ..self
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Compile a module with this loader's engine, for use as
    /// [`ModuleSource::Module`]. Only this loader and its clones accept it.
    pub fn compile(&self, wasm: &[u8]) -> Result<PrecompiledModule, LoadError> {
        Ok(PrecompiledModule::new(self.compile_module(wasm)?, self.tag.clone()))
    }

    fn compile_module(&self, wasm: &[u8]) -> Result<Module, LoadError> {
        Module::validate(&self.engine, wasm)?;
        let module = Module::from_binary(&self.engine, wasm)?;
        Ok(module)
    }

    /// Create a memory the host owns until it's handed to [`Loader::load()`].
    ///
    /// Sizes are in 64 KiB pages.
    pub fn new_memory(
        &self,
        minimum: u32,
        maximum: Option<u32>,
    ) -> Result<LinearMemory, wasmer::MemoryError> {
        let ty = MemoryType::new(Pages(minimum), maximum.map(Pages), false);
        LinearMemory::new(Store::new(self.engine.clone()), ty, self.tag.clone())
    }

    /// Resolve `source` and instantiate it.
    ///
    /// When `memory` is `None` and the module imports its memory, a memory
    /// matching the import's declared limits is created for it.
    pub async fn load(
        &self,
        source: impl Into<ModuleSource>,
        memory: Option<LinearMemory>,
    ) -> Result<InstantiatedHandle, LoadError> {
        let options = match memory {
            Some(memory) => LoadOptions::default().with_memory(memory),
            None => LoadOptions::default(),
        };
        self.load_with(source, options).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(source.kind = tracing::field::Empty))]
    pub async fn load_with(
        &self,
        source: impl Into<ModuleSource>,
        options: LoadOptions,
    ) -> Result<InstantiatedHandle, LoadError> {
        let source = source.into();
        tracing::Span::current().record("source.kind", source.kind());

        let resolved = self.resolve(source).await?;
        self.instantiate(resolved, options)
    }

    /// Instantiate without suspending. Only sources that don't need to be
    /// fetched or awaited are accepted.
    pub fn load_sync(
        &self,
        source: impl Into<ModuleSource>,
        options: LoadOptions,
    ) -> Result<InstantiatedHandle, LoadError> {
        let resolved = match source.into() {
            ModuleSource::Bytes(bytes) => Resolved::Bytes(bytes),
            ModuleSource::Module(module) => Resolved::Module(module),
            ModuleSource::Response(response) => Resolved::Bytes(self.response_body(None, response)?),
            other => {
                return Err(LoadError::unavailable(format!(
                    "a {} source can only be loaded asynchronously",
                    other.kind()
                )));
            }
        };

        self.instantiate(resolved, options)
    }

    async fn resolve(&self, mut source: ModuleSource) -> Result<Resolved, LoadError> {
        loop {
            source = match source {
                ModuleSource::Deferred(deferred) => {
                    tracing::debug!("Waiting for a deferred module source");
                    deferred.await.map_err(LoadError::unavailable)?
                }
                ModuleSource::Url(url) => return self.fetch(&url).await.map(Resolved::Bytes),
                ModuleSource::Response(response) => {
                    return self.response_body(None, response).map(Resolved::Bytes);
                }
                ModuleSource::Bytes(bytes) => return Ok(Resolved::Bytes(bytes)),
                ModuleSource::Module(module) => return Ok(Resolved::Module(module)),
            };
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(%url))]
    async fn fetch(&self, url: &Url) -> Result<Bytes, LoadError> {
        if url.scheme() == "file" {
            let path = url
                .to_file_path()
                .map_err(|_| LoadError::unavailable(format!("\"{url}\" isn't a valid file path")))?;
            let bytes = tokio::fs::read(&path).await.map_err(LoadError::unavailable)?;
            return Ok(bytes.into());
        }

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| LoadError::unavailable("no HTTP client is configured"))?;

        let request = HttpRequest {
            url: url.clone(),
            method: Method::GET,
            headers: self.request_headers(),
            body: None,
        };

        let response = client.request(request).await.map_err(LoadError::unavailable)?;
        if response.redirected {
            tracing::debug!("The module request was redirected");
        }

        self.response_body(Some(url), response)
    }

    fn request_headers(&self) -> HeaderMap {
        let user_agent = self.config.user_agent.as_deref().unwrap_or(USER_AGENT);

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static(WASM_CONTENT_TYPE));
        match HeaderValue::from_str(user_agent) {
            Ok(value) => {
                headers.insert(header::USER_AGENT, value);
            }
            Err(_) => {
                tracing::warn!(user_agent, "Ignoring a User-Agent that isn't a valid header");
                headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
            }
        }

        headers
    }

    fn response_body(&self, url: Option<&Url>, response: HttpResponse) -> Result<Bytes, LoadError> {
        let url = url.map(Url::as_str).unwrap_or("<response>");

        if !response.is_ok() {
            return Err(LoadError::unavailable(format!(
                "\"{url}\" responded with {}",
                response.status
            )));
        }

        if self.config.warn_on_content_type && response.content_type() != Some(WASM_CONTENT_TYPE) {
            tracing::warn!(
                %url,
                content_type = ?response.content_type(),
                "The module isn't served as {WASM_CONTENT_TYPE}, compiling it anyway",
            );
        }

        response
            .body
            .ok_or_else(|| LoadError::unavailable(format!("\"{url}\" returned an empty body")))
    }

    fn instantiate(
        &self,
        resolved: Resolved,
        options: LoadOptions,
    ) -> Result<InstantiatedHandle, LoadError> {
        let (module, hash) = match resolved {
            Resolved::Bytes(bytes) => {
                let hash = ModuleHash::generate(&bytes);
                tracing::debug!(%hash, len = bytes.len(), "Compiling module");
                (self.compile_module(&bytes)?, Some(hash))
            }
            Resolved::Module(precompiled) => {
                if !precompiled.engine.same_engine(&self.tag) {
                    return Err(LoadError::ForeignEngine { what: "module" });
                }
                (precompiled.module, None)
            }
        };

        let names = &self.config.exports;
        let memory_import = memory_import(&module);
        check_bridge_surface(&module, names, memory_import.is_none())?;

        let LoadOptions { memory, imports: hook } = options;
        let (mut store, memory) =
            provision_memory(&self.engine, &self.tag, memory_import.as_ref(), memory)?;

        let env = FunctionEnv::new(&mut store, BridgeEnv::default());
        let mut imports = bridge_imports(
            &mut store,
            &env,
            names,
            memory_import.as_ref().zip(memory.as_ref()),
        );
        if let Some(hook) = hook {
            hook(&mut store, &env, &mut imports);
        }

        let instance = Instance::new(&mut store, &module, &imports)?;

        let memory = match memory {
            Some(memory) => memory,
            None => instance
                .exports
                .get_memory(&names.memory)
                .map_err(|e| LoadError::malformed(format!("\"{}\": {e}", names.memory)))?
                .clone(),
        };
        let exports = BridgeExports::resolve(&instance, &store, &self.config)?;
        let table = instance
            .exports
            .get_table(&names.table)
            .map_err(|e| LoadError::malformed(format!("\"{}\": {e}", names.table)))?
            .clone();

        let mut handle = InstantiatedHandle::new(
            store,
            instance,
            env,
            memory,
            exports,
            DispatchTable::new(table),
            self.config.clone(),
            hash,
        );
        handle.run_start_hook()?;

        tracing::debug!(
            memory.pages = handle.memory_size().0,
            "Module instantiated",
        );

        Ok(handle)
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("config", &self.config)
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

fn memory_import(module: &Module) -> Option<MemoryImport> {
    module.imports().find_map(|import| match import.ty() {
        ExternType::Memory(ty) => Some(MemoryImport {
            module: import.module().to_string(),
            name: import.name().to_string(),
            ty: *ty,
        }),
        _ => None,
    })
}

/// Make sure the module has every export the bridge relies on, with the
/// right signature, before running any of its code.
fn check_bridge_surface(
    module: &Module,
    names: &ExportNames,
    needs_exported_memory: bool,
) -> Result<(), LoadError> {
    use Type::I32;

    expect_function(module, &names.malloc, &[I32], &[I32])?;
    expect_function(module, &names.realloc, &[I32, I32, I32], &[I32])?;
    expect_function(module, &names.free, &[I32, I32], &[])?;
    expect_function(module, &names.invoke_binary, &[I32, I32, I32, I32, I32], &[I32])?;
    expect_function(module, &names.invoke_nullary, &[I32, I32], &[])?;

    match module.exports().find(|export| export.name() == names.table) {
        Some(export) => match export.ty() {
            ExternType::Table(ty) if ty.ty == Type::FuncRef => {}
            other => {
                return Err(LoadError::malformed(format!(
                    "\"{}\" should be a funcref table, found {other:?}",
                    names.table
                )));
            }
        },
        None => {
            return Err(LoadError::malformed(format!(
                "missing the \"{}\" export",
                names.table
            )));
        }
    }

    if needs_exported_memory {
        let exported = module
            .exports()
            .any(|export| export.name() == names.memory && matches!(export.ty(), ExternType::Memory(_)));
        if !exported {
            return Err(LoadError::malformed(format!(
                "the module neither imports nor exports \"{}\"",
                names.memory
            )));
        }
    }

    Ok(())
}

fn expect_function(
    module: &Module,
    name: &str,
    params: &[Type],
    results: &[Type],
) -> Result<(), LoadError> {
    let export = module
        .exports()
        .find(|export| export.name() == name)
        .ok_or_else(|| LoadError::malformed(format!("missing the \"{name}\" export")))?;

    match export.ty() {
        ExternType::Function(ty) if ty.params() == params && ty.results() == results => Ok(()),
        other => Err(LoadError::malformed(format!(
            "\"{name}\" should be a function taking {params:?} and returning {results:?}, found {other:?}",
        ))),
    }
}

/// Pick the store and memory a module will be instantiated with.
fn provision_memory(
    engine: &Engine,
    tag: &EngineTag,
    import: Option<&MemoryImport>,
    provided: Option<LinearMemory>,
) -> Result<(Store, Option<Memory>), LoadError> {
    match (import, provided) {
        (Some(_), Some(provided)) if !provided.engine.same_engine(tag) => {
            Err(LoadError::ForeignEngine { what: "memory" })
        }
        (Some(import), Some(provided)) => {
            check_compatible(&import.ty, &provided)?;
            tracing::debug!(pages = provided.size().0, "Using the host's memory");
            let LinearMemory { store, memory, .. } = provided;
            Ok((store, Some(memory)))
        }
        (Some(import), None) => {
            let mut store = Store::new(engine.clone());
            let memory = Memory::new(&mut store, import.ty)
                .map_err(|e| LoadError::incompatible_memory(e.to_string()))?;
            tracing::debug!(pages = import.ty.minimum.0, "Allocated a fresh memory");
            Ok((store, Some(memory)))
        }
        (None, Some(_)) => Err(LoadError::incompatible_memory(
            "the module defines its own memory and can't use one provided by the host",
        )),
        (None, None) => Ok((Store::new(engine.clone()), None)),
    }
}

fn check_compatible(required: &MemoryType, provided: &LinearMemory) -> Result<(), LoadError> {
    let ty = provided.ty();
    let size = provided.size();

    if size < required.minimum {
        return Err(LoadError::incompatible_memory(format!(
            "the module needs at least {} pages, but the memory only has {}",
            required.minimum.0, size.0
        )));
    }

    match (required.maximum, ty.maximum) {
        (Some(required_max), Some(max)) if max > required_max => {
            return Err(LoadError::incompatible_memory(format!(
                "the memory may grow to {} pages, but the module allows at most {}",
                max.0, required_max.0
            )));
        }
        (Some(required_max), None) => {
            return Err(LoadError::incompatible_memory(format!(
                "the module allows at most {} pages, but the memory is unbounded",
                required_max.0
            )));
        }
        _ => {}
    }

    if required.shared != ty.shared {
        return Err(LoadError::incompatible_memory(format!(
            "the module expects a {} memory",
            if required.shared { "shared" } else { "non-shared" }
        )));
    }

    Ok(())
}
