//! Configuration for the engine and the `blockflow` binary.
//!
//! [`EngineConfig`] holds the library tunables. The binary's command line is
//! parsed with clap; every tunable can also be set through an environment
//! variable with the `BLOCKFLOW_` prefix:
//!
//! - `BLOCKFLOW_THREADS` - Worker threads of the runtime (default: number of CPUs)
//! - `BLOCKFLOW_MAX_IN_FLIGHT` - Block requests in flight during an export (default: 8)
//! - `BLOCKFLOW_CACHE_MB` - Memory budget of a blocked cache in MB (default: 256)
//! - `BLOCKFLOW_EXPORT_MB` - Memory budget for sizing export blocks in MB (default: 512)
//!
//! # Example
//!
//! ```ignore
//! blockflow export --shape 1,1,100,100,100 --dtype u16 --cache --output volume.raw
//! blockflow inspect volume.raw --verify-ramp
//! ```

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::array::DType;
use crate::cache::DEFAULT_CACHE_MEMORY;
use crate::streaming::{DEFAULT_EXPORT_MEMORY, DEFAULT_MAX_IN_FLIGHT};

// =============================================================================
// Engine Configuration
// =============================================================================

const MB: usize = 1024 * 1024;

/// Tunables shared by the caches, the writer and the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Worker threads of the request runtime.
    pub worker_threads: usize,

    /// Byte budget of each blocked cache.
    pub cache_memory_bytes: usize,

    /// Upper bound on concurrently running block requests of an export.
    pub max_in_flight: usize,

    /// Bytes the in-flight export blocks may use together.
    pub export_memory_budget: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            cache_memory_bytes: DEFAULT_CACHE_MEMORY,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            export_memory_budget: DEFAULT_EXPORT_MEMORY,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_threads == 0 {
            return Err("worker_threads must be greater than 0".to_string());
        }
        if self.max_in_flight == 0 {
            return Err("max_in_flight must be greater than 0".to_string());
        }
        if self.cache_memory_bytes == 0 {
            return Err("cache memory must be greater than 0".to_string());
        }
        if self.export_memory_budget < MB {
            return Err("export memory budget must be at least 1MB".to_string());
        }
        Ok(())
    }
}

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// =============================================================================
// CLI Arguments
// =============================================================================

/// blockflow - lazy blockwise processing of N-dimensional arrays.
#[derive(Parser, Debug, Clone)]
#[command(name = "blockflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Stream a synthetic ramp array through the graph into a raw store.
    Export(ExportConfig),

    /// Print the header of a raw store and optionally verify its contents.
    Inspect(InspectConfig),
}

/// Runtime options shared by the subcommands.
#[derive(Args, Debug, Clone)]
pub struct RuntimeArgs {
    /// Worker threads of the request runtime.
    #[arg(long, env = "BLOCKFLOW_THREADS")]
    pub threads: Option<usize>,

    /// Block requests in flight at once.
    #[arg(long, default_value_t = DEFAULT_MAX_IN_FLIGHT, env = "BLOCKFLOW_MAX_IN_FLIGHT")]
    pub max_in_flight: usize,

    /// Blocked cache budget in MB.
    #[arg(long, default_value_t = DEFAULT_CACHE_MEMORY / MB, env = "BLOCKFLOW_CACHE_MB")]
    pub cache_mb: usize,

    /// Memory budget for sizing blocks in MB.
    #[arg(long, default_value_t = DEFAULT_EXPORT_MEMORY / MB, env = "BLOCKFLOW_EXPORT_MB")]
    pub export_mb: usize,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl RuntimeArgs {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            worker_threads: self.threads.unwrap_or_else(default_worker_threads),
            cache_memory_bytes: self.cache_mb.saturating_mul(MB),
            max_in_flight: self.max_in_flight,
            export_memory_budget: self.export_mb.saturating_mul(MB),
        }
    }
}

/// Options of `blockflow export`.
#[derive(Args, Debug, Clone)]
pub struct ExportConfig {
    /// Array shape, comma-separated (e.g. 1,1,100,100,100).
    #[arg(long, value_delimiter = ',', required = true)]
    pub shape: Vec<usize>,

    /// Element type.
    #[arg(long, default_value = "u8")]
    pub dtype: DType,

    /// Axis keys, one per dimension (default: trailing keys of "tczyx").
    #[arg(long)]
    pub axis_order: Option<String>,

    /// Route the data through a blocked cache.
    #[arg(long, default_value_t = false)]
    pub cache: bool,

    /// Export block shape, comma-separated.
    #[arg(long, value_delimiter = ',')]
    pub block_shape: Option<Vec<usize>>,

    /// Multiply every element by this factor before writing.
    #[arg(long)]
    pub scale: Option<f64>,

    /// Path of the raw data file; the header goes next to it as `<output>.json`.
    #[arg(short, long)]
    pub output: PathBuf,

    #[command(flatten)]
    pub runtime: RuntimeArgs,
}

impl ExportConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.runtime.engine_config().validate()?;

        if self.shape.iter().any(|&s| s == 0) {
            return Err("shape must not contain zero-length axes".to_string());
        }
        if let Some(order) = &self.axis_order {
            if order.chars().count() != self.shape.len() {
                return Err(format!(
                    "axis order '{}' does not match {} dimensions",
                    order,
                    self.shape.len()
                ));
            }
        }
        if let Some(block_shape) = &self.block_shape {
            if block_shape.len() != self.shape.len() {
                return Err(format!(
                    "block shape has {} axes, shape has {}",
                    block_shape.len(),
                    self.shape.len()
                ));
            }
            if block_shape.iter().any(|&b| b == 0) {
                return Err("block shape must not contain zeros".to_string());
            }
        }
        if let Some(scale) = self.scale {
            if !scale.is_finite() {
                return Err("scale must be a finite number".to_string());
            }
        }
        Ok(())
    }

    /// Temporary location written during the export.
    pub fn partial_path(&self) -> PathBuf {
        let mut name = self.output.as_os_str().to_os_string();
        name.push(".partial");
        PathBuf::from(name)
    }
}

/// Options of `blockflow inspect`.
#[derive(Args, Debug, Clone)]
pub struct InspectConfig {
    /// Path of the raw data file.
    pub path: PathBuf,

    /// Compare the contents against the ramp generator block by block.
    #[arg(long, default_value_t = false)]
    pub verify_ramp: bool,

    #[command(flatten)]
    pub runtime: RuntimeArgs,
}

// =============================================================================
// Tests
// =============================================================================
