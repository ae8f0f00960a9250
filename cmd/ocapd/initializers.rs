use std::fs;
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ocapd_kernel::{Kernel, KernelHandle, KernelOptions};
use ocapd_storage::{EngineType, Store, StoreError};
use ocapd_worker::WorkerService;
use tracing::{Level, info};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter::Directive, fmt, layer::SubscriberExt, reload,
};

use crate::cli::{LogColor, Options};

// Compile-time check that a persistent database engine is available.
#[cfg(not(feature = "sql"))]
const _: () = {
    compile_error!("Database feature must be enabled (Available: `sql`).");
};

pub fn init_tracing(opts: &Options) -> reload::Handle<EnvFilter, Registry> {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let (filter, filter_handle) = reload::Layer::new(log_filter);

    let stdout_is_tty = std::io::stdout().is_terminal();
    let use_color = match opts.log_color {
        LogColor::Always => true,
        LogColor::Never => false,
        LogColor::Auto => stdout_is_tty,
    };

    let include_target = matches!(opts.log_level, Level::DEBUG | Level::TRACE);

    let fmt_layer = fmt::layer()
        .with_target(include_target)
        .with_ansi(use_color);

    let subscriber = Registry::default().with(fmt_layer.with_filter(filter));
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    filter_handle
}

pub fn is_memory_datadir(datadir: &Path) -> bool {
    datadir == Path::new("memory")
}

/// Opens a pre-existing store or creates a new one.
pub fn open_store(datadir: &Path) -> Result<Store, StoreError> {
    if is_memory_datadir(datadir) {
        Store::new(datadir, EngineType::InMemory)
    } else {
        fs::create_dir_all(datadir)
            .map_err(|e| StoreError::Custom(format!("cannot create datadir: {e}")))?;
        #[cfg(feature = "sql")]
        let engine_type = EngineType::Sql;
        Store::new(&datadir.join("kernel.db"), engine_type)
    }
}

pub fn init_worker_service(opts: &Options) -> WorkerService {
    WorkerService::with_process_workers(
        opts.worker_cmd.clone(),
        Duration::from_millis(opts.handshake_timeout_ms),
    )
}

pub async fn init_kernel(
    store: Store,
    workers: WorkerService,
    opts: &Options,
) -> Result<(Kernel, KernelHandle), ocapd_kernel::KernelError> {
    info!("Initiating kernel");
    Kernel::new(
        store,
        workers,
        KernelOptions {
            bring_out_your_dead_interval: opts.gc_interval,
        },
    )
    .await
}

pub fn parse_http_addr(opts: &Options) -> eyre::Result<SocketAddr> {
    format!("{}:{}", opts.http_addr, opts.http_port)
        .parse()
        .map_err(|e| eyre::eyre!("invalid http address: {e}"))
}
