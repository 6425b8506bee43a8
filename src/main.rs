use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(error) = tick_pipeline_lib::run().await {
        tracing::error!(%error, "tick pipeline exited with error");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if tick_pipeline_lib::config::log_json_enabled() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
