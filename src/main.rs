use anyhow::Result;
use std::sync::Arc;
use talos::driver::GridDriver;
use tokio::sync::Mutex;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let driver = GridDriver::new()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create driver: {}", e))?;

    info!("Talos grid connection controller starting up");

    let (web_host, web_port) = {
        let web = &driver.config().web;
        (web.host.clone(), web.port)
    };

    // Share driver with web server
    let driver_arc = Arc::new(Mutex::new(driver));

    // Spawn web server
    let web_driver = driver_arc.clone();
    let web_task = tokio::spawn(async move {
        if let Err(e) = talos::web::serve(web_driver, &web_host, web_port).await {
            error!("Web server error: {}", e);
        }
    });

    // Run the driver in the current task; the web handlers share the
    // driver mutex, so the loop takes it per cycle instead of across run
    match GridDriver::run_shared(Arc::clone(&driver_arc)).await {
        Ok(_) => {
            info!("Driver shutdown complete");
            // The web task runs until the process stops
            web_task.abort();
            Ok(())
        }
        Err(e) => {
            error!("Driver failed with error: {}", e);
            web_task.abort();
            Err(anyhow::anyhow!("Driver error: {}", e))
        }
    }
}
