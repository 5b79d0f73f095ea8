use anyhow::Result;
use facelens_core::Config;
use tracing_subscriber::EnvFilter;

mod dbus_interface;
mod engine;

const BUS_NAME: &str = "org.facelens.Demo1";
const OBJECT_PATH: &str = "/org/facelens/Demo1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facelensd starting");

    let config = Config::load()?;
    let engine = engine::spawn_engine(&config)?;

    let _connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, dbus_interface::DemoService::new(engine))?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facelensd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facelensd shutting down");

    Ok(())
}
