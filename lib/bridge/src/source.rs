use std::fmt;

use bytes::Bytes;
use futures::future::BoxFuture;
use url::Url;
use wasmer::Module;

use crate::{http::HttpResponse, loader::EngineTag};

/// Somewhere a module can be loaded from.
///
/// Exactly one variant is used per load.
pub enum ModuleSource {
    /// Fetched by the loader. `file://` URLs are read from disk.
    Url(Url),
    /// A response the host already has in hand.
    Response(HttpResponse),
    /// The module's raw bytes.
    Bytes(Bytes),
    /// A module compiled ahead of time with [`Loader::compile()`][crate::Loader::compile].
    Module(PrecompiledModule),
    /// Any of the above, once it resolves. A rejection makes the load fail
    /// with [`LoadError::SourceUnavailable`][crate::LoadError::SourceUnavailable].
    Deferred(BoxFuture<'static, Result<ModuleSource, anyhow::Error>>),
}

impl ModuleSource {
    /// Wrap a future that eventually yields the real source.
    pub fn deferred<F, S>(future: F) -> Self
    where
        F: std::future::Future<Output = Result<S, anyhow::Error>> + Send + 'static,
        S: Into<ModuleSource>,
    {
        ModuleSource::Deferred(Box::pin(async move { future.await.map(Into::into) }))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ModuleSource::Url(_) => "url",
            ModuleSource::Response(_) => "response",
            ModuleSource::Bytes(_) => "bytes",
            ModuleSource::Module(_) => "module",
            ModuleSource::Deferred(_) => "deferred",
        }
    }
}

impl fmt::Debug for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleSource::Url(url) => f.debug_tuple("Url").field(&url.as_str()).finish(),
            ModuleSource::Response(response) => f.debug_tuple("Response").field(response).finish(),
            ModuleSource::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            ModuleSource::Module(module) => f.debug_tuple("Module").field(module).finish(),
            ModuleSource::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl From<Url> for ModuleSource {
    fn from(url: Url) -> Self {
        ModuleSource::Url(url)
    }
}

impl From<HttpResponse> for ModuleSource {
    fn from(response: HttpResponse) -> Self {
        ModuleSource::Response(response)
    }
}

impl From<Bytes> for ModuleSource {
    fn from(bytes: Bytes) -> Self {
        ModuleSource::Bytes(bytes)
    }
}

impl From<Vec<u8>> for ModuleSource {
    fn from(bytes: Vec<u8>) -> Self {
        ModuleSource::Bytes(bytes.into())
    }
}

impl From<&'static [u8]> for ModuleSource {
    fn from(bytes: &'static [u8]) -> Self {
        ModuleSource::Bytes(Bytes::from_static(bytes))
    }
}

impl From<PrecompiledModule> for ModuleSource {
    fn from(module: PrecompiledModule) -> Self {
        ModuleSource::Module(module)
    }
}

/// A compiled module, tied to the [`Loader`][crate::Loader] whose engine
/// compiled it.
///
/// Cloning is cheap and every clone can be instantiated any number of times.
#[derive(Clone)]
pub struct PrecompiledModule {
    pub(crate) module: Module,
    pub(crate) engine: EngineTag,
}

impl PrecompiledModule {
    pub(crate) fn new(module: Module, engine: EngineTag) -> Self {
        PrecompiledModule { module, engine }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }
}

impl fmt::Debug for PrecompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrecompiledModule")
            .field("name", &self.module.name())
            .finish_non_exhaustive()
    }
}
