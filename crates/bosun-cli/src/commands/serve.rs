use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use eyre::{eyre, WrapErr};
use tracing::info;

use bosun_core::agent::{Agent, AgentConfig};
use bosun_core::api::ResponsesClient;
use bosun_core::config::Config;
use bosun_server::auth::AllowAll;
use bosun_server::generate::BlocksServiceImpl;
use bosun_server::runner::GrpcRunner;
use bosun_server::stream::MultiplexerRegistry;

pub async fn run(config: Config) -> eyre::Result<()> {
    let api_key = bosun_core::config::api_key()?;
    let client = ResponsesClient::with_base_url(api_key, config.openai_base_url.clone());

    let defaults = AgentConfig::default();
    let agent_config = AgentConfig {
        model: config.model(),
        system_prompt: config.system_prompt.clone(),
        vector_stores: config.vector_stores.clone(),
        max_file_search_results: config
            .max_file_search_results
            .unwrap_or(defaults.max_file_search_results),
        cache_size: NonZeroUsize::new(config.cache_size.unwrap_or(64))
            .ok_or_else(|| eyre!("cache_size must be greater than zero"))?,
    };
    let mut agent = Agent::new(agent_config, client);
    if let Some(base) = config.file_link_base.clone() {
        let base = base.trim_end_matches('/').to_string();
        agent = agent.with_filename_to_link(Arc::new(move |name: &str| format!("{base}/{name}")));
    }
    let agent = Arc::new(agent);

    let runner_endpoint = config
        .runner_endpoint
        .clone()
        .ok_or_else(|| eyre!("runner_endpoint is not configured"))?;
    let runner = Arc::new(GrpcRunner::new(runner_endpoint));
    let registry = MultiplexerRegistry::new(Arc::new(AllowAll), runner);

    let ws_addr: SocketAddr = config
        .ws_addr()
        .parse()
        .wrap_err("invalid websocket listen address")?;
    let grpc_addr: SocketAddr = config
        .grpc_addr()
        .parse()
        .wrap_err("invalid gRPC listen address")?;

    let ws_app = bosun_server::ws::router(registry.clone());
    let ws_listener = tokio::net::TcpListener::bind(ws_addr).await?;
    info!(target: "bosun::serve", addr = %ws_addr, "Websocket server listening");
    let ws_server = tokio::spawn(async move { axum::serve(ws_listener, ws_app).await });

    let service = BlocksServiceImpl::new(agent).into_server();
    info!(target: "bosun::serve", addr = %grpc_addr, "Generate gRPC server listening");
    let grpc_server = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(service)
            .serve(grpc_addr)
            .await
    });

    tokio::select! {
        res = ws_server => res?.wrap_err("websocket server failed")?,
        res = grpc_server => res?.wrap_err("gRPC server failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!(target: "bosun::serve", "Received interrupt, shutting down");
            registry.shutdown();
        }
    }

    Ok(())
}
