use crate::admission::{Admission, AdmissionController};
use crate::audit::AuditLog;
use crate::config::MqttConfig;
use crate::errors::{Error, Result};
use crate::metrics::{INVALID_REPORTS_TOTAL, RATE_LIMITED_TOTAL, REPORTS_TOTAL};
use crate::model::TelemetryReport;
use crate::pipeline::{IngestError, Ingested, Pipeline};
use crate::rest::{log_invalid, malformed_json};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Client label written to the invalid-request log for broker traffic.
const MQTT_CLIENT: &str = "MQTT";

/// Shared handles each inbound publish is processed with.
#[derive(Clone)]
pub struct MqttIngress {
    pub pipeline: Arc<Pipeline>,
    pub admission: Arc<AdmissionController>,
    pub audit: Arc<AuditLog>,
}

#[derive(Debug)]
pub enum MessageOutcome {
    RateLimited,
    Malformed,
    Rejected(IngestError),
    Stored(Ingested),
}

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

pub async fn run_mqtt(config: MqttConfig, ingress: MqttIngress) -> Result<()> {
    info!(
        "Connecting to MQTT broker at {}:{} as {}",
        config.broker, config.port, config.client_id
    );

    let mut mqtt_options = MqttOptions::new(&config.client_id, &config.broker, config.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(config.clean_session);
    if let Some(username) = &config.username {
        mqtt_options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 100);
    let qos = qos(config.qos);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // A clean session drops subscriptions on every reconnect.
                client
                    .try_subscribe(&config.topic, qos)
                    .map_err(Error::Mqtt)?;
                info!("Subscribed to {} with {:?}", config.topic, qos);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );
                let ingress = ingress.clone();
                tokio::spawn(async move {
                    let outcome = handle_message(&ingress, &publish.topic, &publish.payload).await;
                    log_outcome(&publish.topic, &outcome);
                });
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Admits, decodes and ingests one publish. Broker traffic is admitted
/// under its topic name.
pub async fn handle_message(ingress: &MqttIngress, topic: &str, payload: &[u8]) -> MessageOutcome {
    REPORTS_TOTAL.with_label_values(&["mqtt"]).inc();

    if let Admission::Denied { retry_after } = ingress.admission.admit(topic).await {
        RATE_LIMITED_TOTAL.inc();
        warn!("Rate limit exceeded for topic {}, retry in {:?}", topic, retry_after);
        return MessageOutcome::RateLimited;
    }

    let report: TelemetryReport = match serde_json::from_slice(payload) {
        Ok(report) => report,
        Err(e) => {
            INVALID_REPORTS_TOTAL.inc();
            warn!("Malformed MQTT payload on {}: {}", topic, e);
            log_invalid(&ingress.audit, MQTT_CLIENT, None, &[malformed_json()]);
            return MessageOutcome::Malformed;
        }
    };

    match ingress.pipeline.ingest(&report).await {
        Ok(ingested) => MessageOutcome::Stored(ingested),
        Err(e) => {
            if let IngestError::Validation(violations) = &e {
                log_invalid(&ingress.audit, MQTT_CLIENT, Some(&report), violations);
            }
            MessageOutcome::Rejected(e)
        }
    }
}

/// Publishes get no reply, so the outcome only reaches the log.
fn log_outcome(topic: &str, outcome: &MessageOutcome) {
    match outcome {
        MessageOutcome::Stored(ingested) => debug!(
            "MQTT report on {} stored as measurement {} for device {} (distance {:?} m, {} violations)",
            topic, ingested.measurement_id, ingested.device_id, ingested.distance, ingested.violations
        ),
        MessageOutcome::Rejected(e) => warn!("MQTT report on {} rejected: {}", topic, e),
        MessageOutcome::RateLimited | MessageOutcome::Malformed => {}
    }
}
