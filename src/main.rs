//! blockflow - lazy blockwise processing of N-dimensional arrays.
//!
//! This binary builds small processing graphs from the command line and
//! streams their output into raw block stores.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blockflow::{
    config::{Cli, Command, EngineConfig, ExportConfig, InspectConfig},
    streaming::{read_header, RawFileBackend},
    FlowError, Graph, Metadata, MetadataError, OpBlockedArrayCache, OpBlockwiseWriter, OpElementwise,
    OpRampSource, OpStoreReader, OutputSlot, RawFileStore, RequestPool,
};

/// Exit code of an export interrupted with Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Export(config) => run_export(config),
        Command::Inspect(config) => run_inspect(config),
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose { "blockflow=debug" } else { "blockflow=info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_runtime(engine: &EngineConfig) -> Option<Runtime> {
    match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(engine.worker_threads)
        .thread_name("blockflow-worker")
        .enable_all()
        .build()
    {
        Ok(runtime) => Some(runtime),
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            None
        }
    }
}

// =============================================================================
// Export Command
// =============================================================================

fn run_export(config: ExportConfig) -> ExitCode {
    init_logging(config.runtime.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }
    let engine = config.runtime.engine_config();
    let Some(runtime) = build_runtime(&engine) else {
        return ExitCode::FAILURE;
    };

    info!("Configuration:");
    info!("  Shape: {:?} ({})", config.shape, config.dtype);
    info!("  Workers: {}", engine.worker_threads);
    info!("  In flight: {} blocks", engine.max_in_flight);
    if config.cache {
        info!("  Cache: {}MB", engine.cache_memory_bytes / (1024 * 1024));
    }
    if let Some(factor) = config.scale {
        info!("  Scale: x{}", factor);
    }

    runtime.block_on(export(config, engine))
}

/// Wire `ramp -> [cache] -> [scale] -> writer`.
fn build_pipeline(
    graph: &mut Graph,
    config: &ExportConfig,
    engine: &EngineConfig,
) -> Result<Arc<OpBlockwiseWriter>, MetadataError> {
    let mut meta = Metadata::new(config.shape.clone(), config.dtype);
    if let Some(order) = &config.axis_order {
        meta = meta.with_axis_order(order.clone());
    }
    let source = graph.add(OpRampSource::with_metadata(meta)?);
    let mut upstream: OutputSlot = source.output().clone();

    if config.cache {
        let cache = graph.add(OpBlockedArrayCache::new(engine.cache_memory_bytes));
        cache.input().connect(&upstream)?;
        if let Some(block_shape) = &config.block_shape {
            cache.block_shape().set_value(block_shape.clone())?;
        }
        upstream = cache.output().clone();
    }

    if let Some(factor) = config.scale {
        let scale = graph.add(OpElementwise::scale(factor));
        scale.input().connect(&upstream)?;
        upstream = scale.output().clone();
    }

    let writer = graph.add(OpBlockwiseWriter::new(
        engine.max_in_flight,
        engine.export_memory_budget,
    ));
    writer.input().connect(&upstream)?;
    if let Some(block_shape) = &config.block_shape {
        writer.block_shape().set_value(block_shape.clone())?;
    }
    Ok(writer)
}

async fn export(config: ExportConfig, engine: EngineConfig) -> ExitCode {
    let mut graph = Graph::new();
    let writer = match build_pipeline(&mut graph, &config, &engine) {
        Ok(writer) => writer,
        Err(e) => {
            error!("Failed to build pipeline: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let meta = match writer.store_metadata() {
        Ok(meta) => meta,
        Err(e) => {
            error!("Failed to configure export: {}", e);
            return ExitCode::FAILURE;
        }
    };

    writer.progress().subscribe(|percent| {
        if percent % 10 == 0 {
            info!("  Progress: {}%", percent);
        } else {
            debug!("  Progress: {}%", percent);
        }
    });

    let interrupt = {
        let writer = writer.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling export");
                writer.cancel();
            }
        })
    };

    let backend = RawFileBackend::new();
    let partial = config.partial_path();
    let store = match RawFileStore::create(&partial, &meta).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to create {}: {}", partial.display(), e);
            interrupt.abort();
            return ExitCode::FAILURE;
        }
    };

    let result = writer.run_export(store).await;
    interrupt.abort();

    match result {
        Ok(summary) => {
            if let Err(e) = backend.commit(&partial, &config.output).await {
                error!("Failed to move export into place: {}", e);
                return ExitCode::FAILURE;
            }
            info!("");
            info!("  Wrote {}", config.output.display());
            info!("  Blocks: {} of shape {:?}", summary.total_blocks, summary.block_shape);
            info!("  Bytes: {}", summary.bytes_written);
            ExitCode::SUCCESS
        }
        Err(FlowError::Cancelled) => {
            discard_partial(&backend, &partial).await;
            warn!("Export cancelled; nothing was written to {}", config.output.display());
            ExitCode::from(EXIT_CANCELLED)
        }
        Err(e) => {
            discard_partial(&backend, &partial).await;
            error!("Export failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn discard_partial(backend: &RawFileBackend, partial: &Path) {
    if let Err(e) = backend.remove(partial).await {
        warn!("Failed to remove {}: {}", partial.display(), e);
    }
}

// =============================================================================
// Inspect Command
// =============================================================================

fn run_inspect(config: InspectConfig) -> ExitCode {
    if config.runtime.verbose {
        init_logging(true);
    }
    let engine = config.runtime.engine_config();
    if let Err(e) = engine.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }
    let Some(runtime) = build_runtime(&engine) else {
        return ExitCode::FAILURE;
    };
    runtime.block_on(inspect(config, engine))
}

async fn inspect(config: InspectConfig, engine: EngineConfig) -> ExitCode {
    let header = match read_header(&config.path).await {
        Ok(header) => header,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    match serde_json::to_string_pretty(&header) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if !config.verify_ramp {
        return ExitCode::SUCCESS;
    }

    println!();
    match verify_ramp(&config.path, engine.max_in_flight).await {
        Ok(blocks) => {
            println!("✓ {} block(s) match the ramp", blocks);
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("✗ {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Compare a store against the ramp generator, `batch` blocks at a time.
async fn verify_ramp(path: &Path, batch: usize) -> Result<usize, FlowError> {
    let store = Arc::new(RawFileStore::open(path).await?);
    let reader = OpStoreReader::new(store, None)?;
    let meta = store_meta(&reader)?;
    let blocks = meta
        .roi()
        .block_rois(&meta.shape, reader.block_shape(), false);

    for chunk in blocks.chunks(batch.max(1)) {
        let mut pool = RequestPool::new();
        for roi in chunk {
            pool.add(reader.output().get(roi.clone()));
        }
        let actual = pool.wait_all().await?;
        for (roi, data) in chunk.iter().zip(&actual) {
            let expected = OpRampSource::generate(&meta.shape, meta.dtype, roi)?;
            if *data != expected {
                return Err(FlowError::Internal(format!("block {} differs from the ramp", roi)));
            }
        }
    }
    Ok(blocks.len())
}

fn store_meta(reader: &OpStoreReader) -> Result<Metadata, FlowError> {
    reader.output().meta().ok_or_else(|| FlowError::NotReady {
        slot: reader.output().name().to_string(),
    })
}
