use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Fallback uplink interface: best-effort delivery of one small binary
/// payload over the secondary channel. No acknowledgment is implied.
pub trait Uplink: Send {
    fn name(&self) -> &'static str;

    /// Largest payload the channel carries, in bytes.
    fn payload_ceiling(&self) -> usize;

    fn send(&mut self, payload: &[u8]) -> Result<()>;
}

/// Publishes payloads at QoS 0 to the radio gateway's MQTT topic.
pub struct MqttUplink {
    client: Client,
    topic: String,
    payload_ceiling: usize,
    stop: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttUplink {
    pub fn connect(
        broker_addr: &str,
        client_id: &str,
        topic: &str,
        payload_ceiling: usize,
    ) -> Result<Self> {
        let (host, port) = parse_broker_addr(broker_addr)?;
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);

        let (client, connection) = Client::new(options, 10);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = spawn_connection(connection, stop.clone())?;
        log::info!(
            "fallback: mqtt uplink to {} topic={} ceiling={}B",
            broker_addr,
            topic,
            payload_ceiling
        );
        Ok(Self {
            client,
            topic: topic.to_string(),
            payload_ceiling,
            stop,
            connection_handle: Some(handle),
        })
    }
}

fn spawn_connection(mut connection: Connection, stop: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mqtt-uplink".to_string())
        .spawn(move || {
            for event in connection.iter() {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        log::warn!("fallback: mqtt connection error: {}", e);
                        std::thread::sleep(Duration::from_secs(5));
                    }
                }
            }
        })
        .context("spawn mqtt connection thread")
}

impl Uplink for MqttUplink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn payload_ceiling(&self) -> usize {
        self.payload_ceiling
    }

    fn send(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.payload_ceiling {
            return Err(anyhow!(
                "payload of {} bytes exceeds ceiling {}",
                payload.len(),
                self.payload_ceiling
            ));
        }
        self.client
            .try_publish(self.topic.clone(), QoS::AtMostOnce, false, payload.to_vec())
            .context("queue fallback payload")?;
        Ok(())
    }
}

impl Drop for MqttUplink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Err(e) = self.client.disconnect() {
            log::debug!("fallback: mqtt disconnect: {}", e);
        }
        if let Some(handle) = self.connection_handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

fn parse_broker_addr(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("broker address {:?} must be host:port", addr))?;
    if host.is_empty() {
        return Err(anyhow!("broker address {:?} has no host", addr));
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("broker port in {:?}", addr))?;
    Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_addr_parsing() {
        assert_eq!(
            parse_broker_addr("127.0.0.1:1883").unwrap(),
            ("127.0.0.1".to_string(), 1883)
        );
        assert_eq!(parse_broker_addr("[::1]:8883").unwrap(), ("::1".to_string(), 8883));
        assert!(parse_broker_addr("gateway").is_err());
        assert!(parse_broker_addr(":1883").is_err());
        assert!(parse_broker_addr("gw:radio").is_err());
    }
}
