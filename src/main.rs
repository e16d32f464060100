use std::collections::HashMap;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use mcp_aggregate_gateway::cache::ResponseCache;
use mcp_aggregate_gateway::config::GatewayConfig;
use mcp_aggregate_gateway::dispatcher::Dispatcher;
use mcp_aggregate_gateway::metrics::MetricsRecorder;
use mcp_aggregate_gateway::registry::UpstreamName;
use mcp_aggregate_gateway::retry::RetryPolicy;
use mcp_aggregate_gateway::server::run_stdio_server;
use mcp_aggregate_gateway::upstream::{UpstreamClient, UpstreamDescriptor};

/// Launch command used when no `<UPSTREAM>_COMMAND` override is set.
/// Process launch scripts are out of scope for the gateway's core design;
/// these are the upstreams' own published entry points.
fn default_command(name: UpstreamName) -> &'static str {
    match name {
        UpstreamName::Serena => "uvx --from git+https://github.com/oraios/serena serena-mcp-server",
        UpstreamName::Context7 => "npx -y @upstash/context7-mcp",
        UpstreamName::Playwright => "npx -y @playwright/mcp",
        UpstreamName::Tavily => "npx -y tavily-mcp",
        UpstreamName::MagicUi => "npx -y @magicuidesign/mcp",
    }
}

#[tokio::main]
async fn main() {
    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let filter = EnvFilter::try_from_env("RUST_LOG")
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        upstreams = config.upstreams.len(),
        cache_enabled = config.cache.enabled,
        "starting gateway"
    );

    let mut clients: HashMap<UpstreamName, Arc<UpstreamClient>> = HashMap::new();
    for upstream in &config.upstreams {
        if !upstream.enabled {
            tracing::info!(upstream = upstream.name.as_str(), "upstream disabled, skipping");
            continue;
        }

        let command = upstream
            .command
            .clone()
            .unwrap_or_else(|| default_command(upstream.name).to_string());
        let descriptor = UpstreamDescriptor::from_command_string(upstream.name.as_str(), &command);

        match UpstreamClient::start(descriptor).await {
            Ok(client) => {
                tracing::info!(upstream = upstream.name.as_str(), "upstream ready");
                clients.insert(upstream.name, Arc::new(client));
            }
            Err(err) => {
                tracing::warn!(upstream = upstream.name.as_str(), error = %err, "failed to start upstream");
            }
        }
    }

    let cache = Arc::new(ResponseCache::new(
        config.cache.ttl,
        config.cache.max_size,
        config.cache.enabled,
    ));
    tokio::spawn(cache.clone().run_sweep_loop());

    let metrics = Arc::new(MetricsRecorder::new(config.metrics_enabled));
    let retry_policy = RetryPolicy::new(
        config.retry.max_attempts,
        config.retry.initial_delay,
        config.retry.max_delay,
    );

    let dispatcher = Arc::new(Dispatcher::new(
        clients.clone(),
        cache,
        metrics,
        retry_policy,
        config.max_concurrent_operations,
    ));

    run_stdio_server(tokio::io::stdin(), tokio::io::stdout(), dispatcher).await;

    tracing::info!("stdin closed, shutting down");
    for client in clients.values() {
        client.disconnect().await;
    }
}
