#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vitalsync_lib::run().await
}
