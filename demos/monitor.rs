use std::sync::Arc;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use usk_link::{EngineConfig, Registry, RegistryEvent, SerialConnector};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("usk_link=info")))
        .with(fmt::layer())
        .init();

    // Usage: monitor [PORT] [ADDRESS]
    let mut args = std::env::args().skip(1);
    let port = args.next().unwrap_or_else(|| "/dev/ttyUSB0".to_string());
    let address: u16 = match args.next().map(|a| a.parse()) {
        Some(Ok(address)) => address,
        Some(Err(e)) => {
            eprintln!("Invalid device address: {}", e);
            return;
        }
        None => 1,
    };

    let config = EngineConfig::default();
    println!("Monitoring USK device:");
    println!("- Port: {} ({} baud)", port, config.serial.baud_rate);
    println!("- Address: {}", address);
    println!("- Attempts per command: {}", config.attempts);

    let (registry, mut events) = match Registry::spawn(Arc::new(SerialConnector::new()), config) {
        Ok(spawned) => spawned,
        Err(e) => {
            eprintln!("Failed to start registry: {}", e);
            return;
        }
    };

    if let Err(e) = registry.add("usk", port.as_str(), address).await {
        eprintln!("Failed to add device: {}", e);
        return;
    }
    match registry.open("usk").await {
        Ok(true) => println!("\nPort open, press Ctrl-C to stop"),
        Ok(false) => {
            eprintln!("Could not open {}", port);
            return;
        }
        Err(e) => {
            eprintln!("Registry error: {}", e);
            return;
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RegistryEvent::Device { device, event }) => println!("[{}] {:?}", device, event),
                Some(other) => println!("{:?}", other),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(e) = registry.remove_all().await {
        eprintln!("Shutdown error: {}", e);
    }
    println!("\nDone");
}
