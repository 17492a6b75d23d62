use apitune::cli::{self, Cli, Command};
use apitune::ApiTune;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Cli::parse();
  let app = ApiTune::new(args.proxy.proxy_config()).await?;

  match args.command.unwrap_or(Command::Serve) {
    Command::Ca(command) => cli::run_ca(&app, &command).await?,
    Command::Serve => {
      let addr = app.start(args.proxy.port).await?;
      if let Some(ip) = app.local_ip() {
        tracing::info!("[proxy] point clients at http://{}:{}", ip, addr.port());
      }
      tokio::signal::ctrl_c().await?;
      tracing::info!("[proxy] shutdown signal received");
      app.shutdown().await;
    }
  }
  Ok(())
}
