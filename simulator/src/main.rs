mod telemetry;

use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::time::Duration;
use telemetry::Device;
use tracing::{error, info, warn};

/// Publishes random-walk telemetry for a fleet of simulated devices.
#[derive(Debug, Parser)]
#[command(name = "simulator", version)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "MQTT_TOPIC", default_value = "telemetry/data")]
    topic: String,

    /// Reports per second across all devices.
    #[arg(long, env = "RATE", default_value_t = 50)]
    rate: u64,

    #[arg(long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    /// Identifiers are `<prefix>-<n>`; they must exist in the devices table.
    #[arg(long, env = "DEVICE_PREFIX", default_value = "dev")]
    prefix: String,

    /// Fraction of reports sent without coordinates.
    #[arg(long, env = "MISSING_POSITION", default_value_t = 0.02)]
    missing_position: f64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    if args.rate == 0 || args.devices == 0 {
        error!("--rate and --devices must be at least 1");
        std::process::exit(2);
    }

    info!("Starting telemetry simulator");
    info!(
        "Broker: {}:{}, Topic: {}, Rate: {} msg/s, Devices: {}",
        args.broker, args.port, args.topic, args.rate, args.devices
    );

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("Connected to MQTT broker, starting to publish telemetry");

    let mut rng = rand::thread_rng();
    let mut fleet: Vec<Device> = (0..args.devices)
        .map(|n| Device::new(format!("{}-{}", args.prefix, n), &mut rng))
        .collect();

    let mut ticker = tokio::time::interval(Duration::from_micros((1_000_000 / args.rate).max(1)));
    let mut counter = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping after {} messages", counter);
                break;
            }
        }

        let index = rng.gen_range(0..fleet.len());
        let report = fleet[index].next_report(&mut rng, args.missing_position);

        let payload = match serde_json::to_string(&report) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize report: {}", e);
                continue;
            }
        };

        match client.publish(&args.topic, QoS::AtLeastOnce, false, payload).await {
            Ok(_) => {
                counter += 1;
                if counter % 1000 == 0 {
                    info!("Published {} messages", counter);
                }
            }
            Err(e) => warn!("Failed to publish: {}", e),
        }
    }
}
