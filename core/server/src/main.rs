/* Licensed to the Apache Software Foundation (ASF) under one
 * or more contributor license agreements.  See the NOTICE file
 * distributed with this work for additional information
 * regarding copyright ownership.  The ASF licenses this file
 * to you under the Apache License, Version 2.0 (the
 * "License"); you may not use this file except in compliance
 * with the License.  You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing,
 * software distributed under the License is distributed on an
 * "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
 * KIND, either express or implied.  See the License for the
 * specific language governing permissions and limitations
 * under the License.
 */

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use strix_server::broker::Broker;
use strix_server::configs::ServerConfig;
use strix_server::delivery::FilterRegistry;
use strix_server::metadata::MemoryMetadataStore;
use strix_server::persistence::MemoryLog;
use strix_server::tcp::{start_tcp_listener, start_tls_listener};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "strix-server", about = "Topic-partitioned pub/sub broker")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "configs/server.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = if args.config.exists() {
        ServerConfig::load(&args.config)
            .with_context(|| format!("cannot load config: {}", args.config.display()))?
    } else {
        warn!(
            "Config file: {} not found, starting with defaults",
            args.config.display()
        );
        ServerConfig::default()
    };

    let metadata = Arc::new(MemoryMetadataStore::new());
    let log = Arc::new(MemoryLog::new());
    let broker = Broker::start(config.clone(), metadata, log, FilterRegistry::default())
        .await
        .context("cannot start broker")?;
    info!("Broker node: {}", broker.advertised_address());

    let tcp_listener = start_tcp_listener(&config.tcp.address, broker.clone())
        .await
        .context("cannot start TCP listener")?;
    let tls_listener = match &config.tcp.tls {
        Some(tls) => Some(
            start_tls_listener(tls, broker.clone())
                .await
                .context("cannot start TLS listener")?,
        ),
        None => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for the shutdown signal")?;
    info!("Received a shutdown signal");
    tcp_listener.stop();
    if let Some(listener) = tls_listener {
        listener.stop();
    }
    broker.shutdown().await;
    info!("Broker has shut down");
    Ok(())
}
