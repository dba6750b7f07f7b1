// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Main entry point for the lilith-mcp stdio server
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use lilith_mcp::config::Config;
use lilith_mcp::mcp::bridge::{NotificationBridge, NotificationSink};
use lilith_mcp::mcp::catalog;
use lilith_mcp::mcp::dispatcher::Dispatcher;
use lilith_mcp::mcp::executor::SecureExecutor;
use lilith_mcp::mcp::server::StdioServer;

#[derive(Parser, Debug)]
#[command(version, about = "Model Context Protocol server over stdio", long_about = None)]
struct Cli {
    /// Directory of prompt templates to serve and watch
    #[arg(long)]
    prompts_dir: Option<PathBuf>,

    /// Directory of files to serve as resources and watch
    #[arg(long)]
    resources_dir: Option<PathBuf>,

    /// Directory whose changes trigger tools/list_changed
    #[arg(long)]
    tools_dir: Option<PathBuf>,

    /// Notification debounce window in milliseconds (50-5000)
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Do not register the built-in run_command tool
    #[arg(long)]
    no_exec: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Install panic hook
    install_panic_hook();

    // Environment first, then CLI flags on top
    let mut config = Config::from_env().context("Invalid configuration")?;
    if cli.prompts_dir.is_some() {
        config.watch.prompts_dir = cli.prompts_dir;
    }
    if cli.resources_dir.is_some() {
        config.watch.resources_dir = cli.resources_dir;
    }
    if cli.tools_dir.is_some() {
        config.watch.tools_dir = cli.tools_dir;
    }
    if let Some(ms) = cli.debounce_ms {
        config.watch.debounce_ms = ms;
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config);
    info!(
        name = %config.server_name,
        protocol = %config.protocol_version,
        "Starting lilith-mcp"
    );

    let mut dispatcher = Dispatcher::new(&config);
    if !cli.no_exec {
        let executor = SecureExecutor::new(config.executor.clone())
            .context("Invalid executor configuration")?;
        dispatcher = dispatcher.with_executor(Arc::new(executor));
    }
    let dispatcher = Arc::new(dispatcher);
    if !cli.no_exec {
        let (definition, handler) = catalog::run_command_tool();
        dispatcher.register_tool(definition, handler);
    }
    catalog::load_directories(
        &dispatcher,
        config.watch.prompts_dir.as_deref(),
        config.watch.resources_dir.as_deref(),
    )
    .context("Failed to load registries")?;

    let bridge = if config.watch.has_roots() {
        let sink: Arc<dyn NotificationSink> = Arc::new(catalog::RescanningSink::new(
            dispatcher.clone(),
            config.watch.prompts_dir.clone(),
            config.watch.resources_dir.clone(),
        ));
        let bridge = NotificationBridge::from_config(&config.watch, sink);
        bridge.start().context("Failed to start file watcher")?;
        Some(bridge)
    } else {
        None
    };

    let server = StdioServer::new(dispatcher.clone());
    server.run().await.context("Server loop failed")?;

    if let Some(bridge) = bridge {
        bridge.stop();
    }
    let stats = dispatcher.stats();
    info!(
        requests = stats.request_count,
        uptime_s = (chrono::Utc::now() - stats.started_at).num_seconds(),
        "lilith-mcp stopped"
    );
    Ok(())
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("PANIC: {} at {}", message, location);
    }));
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("lilith_mcp=debug,info"));

    // stdout carries the protocol; logs go to stderr.
    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    if config.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
