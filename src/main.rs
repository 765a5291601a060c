use rpcmux::{ClientInfo, RpcResult, RpcServer, ServerConfig, Value};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = ServerConfig::load()?;

    let server = RpcServer::new(cfg)?;
    server.register_method("system.echo", |_: &ClientInfo, params: Vec<Value>| -> RpcResult {
        Ok(Value::Array(params))
    })?;
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    server.stop().await;
    server.registry().dispose();

    Ok(())
}
