use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Setup-time failures. Anything returned here is fatal: the bridge never started, or a CPU
/// module could not be attached. Per-transaction failures are reported as
/// [`cosim_mem::Response::AddressError`] instead and never surface as a `BridgeError`.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read config file {}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("CPU module {} is not accessible", path.display())]
    ModuleNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create a private copy of CPU module {}", path.display())]
    ModuleCopy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load CPU module {}", path.display())]
    LibraryLoad {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("CPU module {} does not export `{symbol}`", path.display())]
    MissingSymbol {
        path: PathBuf,
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },

    #[error("CPU module {} returned a null model from elaboration", path.display())]
    Elaboration { path: PathBuf },

    #[error("failed to spawn the {name} thread")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("bridge has already halted")]
    Halted,
}
