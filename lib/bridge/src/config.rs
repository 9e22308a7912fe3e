use std::path::{Path, PathBuf};

/// Settings for a [`Loader`][crate::Loader].
///
/// Every field has a default, so an empty TOML document is a valid
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// The names the bridge looks for in the module.
    pub exports: ExportNames,
    /// Keep a ledger of host-made allocations and reject frees with the
    /// wrong size before they reach the module's allocator.
    pub track_allocations: bool,
    /// Log a warning when a fetched module isn't served as
    /// `application/wasm`.
    pub warn_on_content_type: bool,
    /// Overrides the `User-Agent` sent when fetching modules.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            exports: ExportNames::default(),
            track_allocations: true,
            warn_on_content_type: true,
            user_agent: None,
        }
    }
}

impl LoaderConfig {
    pub fn from_toml(src: &str) -> Result<Self, ConfigError> {
        toml::from_str(src).map_err(ConfigError::Parse)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_path_buf(),
            error,
        })?;
        LoaderConfig::from_toml(&src)
    }
}

/// The names of the bridge's exports and imports.
///
/// Generated closure shims usually carry mangled names, which is why the
/// `invoke_*` entries are configurable.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ExportNames {
    /// The exported memory, used when the module doesn't import one.
    pub memory: String,
    pub malloc: String,
    pub realloc: String,
    pub free: String,
    /// The `funcref` table host callbacks are placed in.
    pub table: String,
    pub invoke_binary: String,
    pub invoke_nullary: String,
    /// Called once, right after instantiation, if the module exports it.
    pub start_hook: String,
    /// The module's application entry point.
    pub entry_point: String,
    /// The namespace the bridge's own imports are provided under.
    pub import_namespace: String,
    /// The import module code calls to store an exception.
    pub exception_store: String,
}

impl Default for ExportNames {
    fn default() -> Self {
        ExportNames {
            memory: "memory".to_string(),
            malloc: "__wbindgen_malloc".to_string(),
            realloc: "__wbindgen_realloc".to_string(),
            free: "__wbindgen_free".to_string(),
            table: "__wbindgen_export_2".to_string(),
            invoke_binary: "invoke_binary".to_string(),
            invoke_nullary: "invoke_nullary".to_string(),
            start_hook: "__wbindgen_start".to_string(),
            entry_point: "start_app".to_string(),
            import_namespace: "wbg".to_string(),
            exception_store: "__wbindgen_exn_store".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read \"{}\"", path.display())]
    Read {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
    #[error("invalid loader configuration")]
    Parse(#[source] toml::de::Error),
}
