use anyhow::Result;
use clap::Parser;
use status_exporter::app::Application;
use status_exporter::config::Cli;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    utils::logging::init()?;

    tracing::info!("Starting status exporter {}", &**version::VERSION);
    tracing::info!(
        topology_file = %cli.topology_file.display(),
        export_root = %cli.export_root.display(),
        "Exporting utilization to filesystem"
    );

    Application::new(cli).run().await
}
