#[tokio::main]
async fn main() -> anyhow::Result<()> {
    health_api_gateway_lib::run().await?;
    Ok(())
}
