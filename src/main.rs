use std::panic;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::Args;
use crate::core::domain::Language;
use crate::core::pipeline::executing::ExecutionService;
use crate::http::handlers::{AppState, build_router};
use crate::http::models::LanguageInfo;
use crate::native::cgroup::CgroupParent;
use crate::native::sandbox::NativeSandbox;

mod config;
mod constants;
mod core;
mod http;
mod native;
#[cfg(test)]
mod stubs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let args = Args::parse();
    tracing::debug!("Configuration: {:?}", args);

    let toolchain = args.toolchain();
    toolchain.log_versions().await;
    let languages = Language::ALL
        .iter()
        .map(|language| LanguageInfo {
            id: language.id().to_string(),
            version: toolchain.launch(*language).version.clone(),
        })
        .collect();

    if args.isolate && !nix::unistd::geteuid().is_root() {
        return Err("Confinement needs root; run as root or pass --isolate false".into());
    }
    if !args.isolate {
        tracing::warn!(
            "Confinement is disabled, sandboxed programs share the host filesystem, network and process table"
        );
    }
    let cgroup = if args.cgroup {
        match CgroupParent::setup(&args.cgroup_root) {
            Ok(cgroup) => Some(cgroup),
            Err(e) => {
                tracing::warn!(
                    root = %args.cgroup_root.display(),
                    "cgroup unavailable, falling back to the resident-set watchdog: {}",
                    e
                );
                None
            }
        }
    } else {
        None
    };

    let sandbox_config = args.sandbox_config(cgroup);
    tokio::fs::create_dir_all(&sandbox_config.scratch_root).await?;

    let service = ExecutionService::new(
        Arc::new(NativeSandbox::new(toolchain, sandbox_config)),
        args.service_config(),
    );
    let router = build_router(AppState {
        service: service.clone(),
        languages: Arc::new(languages),
        max_body_bytes: args.max_body_bytes(),
    });

    let listener = TcpListener::bind(args.listen).await?;
    tracing::info!("HTTP server listening on {}", args.listen);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(service))
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM after cancelling every running sandbox.
async fn shutdown_signal(service: ExecutionService) {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
                service.cancel_all();
                return;
            }
        };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate.recv() => {},
    }

    tracing::info!(
        active = service.active_count(),
        "Shutting down, cancelling running executions"
    );
    service.cancel_all();
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
