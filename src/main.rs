use clap::Parser;
use plonk::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.server {
        let layout = plonk::paths::Layout::new(cli.dir.clone());
        layout.bootstrap()?;
        plonk::logging::install(&layout.log_json())?;

        let lifecycle = plonk::server::start(cli).await?;
        lifecycle.wait().await
    } else {
        plonk::client::run(&cli).await
    }
}
