use senseme::{callback, discover, discover_all, CallbackError, DeviceEvent};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SEARCH_TIME: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // With an argument, follow one device; otherwise list everything found
    let Some(target) = std::env::args().nth(1) else {
        let devices = discover_all(SEARCH_TIME).await;
        if devices.is_empty() {
            println!("No devices found");
        }
        for device in devices {
            println!("{}", device.to_json()?);
        }
        return Ok(());
    };

    let Some(device) = discover(&target, SEARCH_TIME).await else {
        println!("{target} not found");
        return Ok(());
    };
    println!("{}", device.to_json()?);

    device.add_callback(callback(|event: DeviceEvent| async move {
        match event {
            DeviceEvent::Changed { key, value } => println!("{key} = {value}"),
            other => println!("{other:?}"),
        }
        Ok::<(), CallbackError>(())
    }));

    println!("Watching {} for changes, press Ctrl-C to quit", device.name());
    tokio::signal::ctrl_c().await?;
    device.stop();
    Ok(())
}
