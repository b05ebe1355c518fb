#[tokio::main]
async fn main() -> anyhow::Result<()> {
    printshop_sync_lib::run().await
}
