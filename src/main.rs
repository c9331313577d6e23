#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mediadeck_lib::run().await
}
