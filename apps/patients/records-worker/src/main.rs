//! Records Worker - Entry Point
//!
//! Publishes patient record events and reconciles drift reported by the
//! reconciliation service.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    core_config::tracing::install_color_eyre();
    records_worker::run().await
}
