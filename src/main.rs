use maps_mcp_server::{config::Config, logging, Server};
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    logging::init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };

    let server = match Server::from_config(&config) {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, "failed to initialise server");
            std::process::exit(1);
        }
    };

    let code = match server.start().await {
        Ok(()) => {
            info!("server stopped");
            0
        }
        Err(err) => {
            error!(error = %err, "transport failed");
            1
        }
    };

    // Blocking stdin reads would otherwise keep the runtime alive.
    std::process::exit(code);
}
