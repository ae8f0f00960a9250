mod cli;
mod initializers;

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use clap::Parser;
use ocapd_rpc::RpcApiContext;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::{CLI, Subcommand};
use crate::initializers::{
    init_kernel, init_tracing, init_worker_service, is_memory_datadir, open_store, parse_http_addr,
};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let CLI { opts, command } = CLI::parse();

    if let Some(Subcommand::RemoveDB { force }) = command {
        return remove_db(&opts.datadir, force);
    }

    let log_filter_handler = init_tracing(&opts);
    info!("Starting ocapd");

    let store = open_store(&opts.datadir)?;
    let workers = init_worker_service(&opts);
    let (mut kernel, handle) = init_kernel(store, workers, &opts).await?;

    let cancel = CancellationToken::new();
    let kernel_cancel = cancel.clone();
    let kernel_task = tokio::spawn(async move { kernel.run(kernel_cancel).await });

    let context = RpcApiContext {
        kernel: handle,
        bundle_root: opts.bundles_dir.clone(),
        log_filter_handler: Some(log_filter_handler),
    };
    let http_addr = parse_http_addr(&opts)?;
    let api_cancel = cancel.clone();
    let api_task = tokio::spawn(ocapd_rpc::start_api(http_addr, context, api_cancel));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    cancel.cancel();
    kernel_task.await??;
    api_task.await??;
    Ok(())
}

fn remove_db(datadir: &Path, force: bool) -> eyre::Result<()> {
    if is_memory_datadir(datadir) {
        println!("In-memory datadir, nothing to remove.");
        return Ok(());
    }
    if !datadir.exists() {
        println!("Data directory {} does not exist.", datadir.display());
        return Ok(());
    }
    if !force {
        print!(
            "Remove all kernel state under {}? [y/N] ",
            datadir.display()
        );
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }
    fs::remove_dir_all(datadir)?;
    println!("Removed {}.", datadir.display());
    Ok(())
}
