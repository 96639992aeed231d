use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, MqttOptions, Outgoing,
    Packet, QoS, TlsConfiguration, Transport,
};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{oneshot, Mutex};
use tokio::time;
use tracing::{debug, error, info, trace};

/// In-flight request limit for the client channel.
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long to back off before polling the transport again after an error.
const TRANSPORT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to read identity material: {0}")]
    Credentials(#[from] io::Error),

    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("broker refused the connection: {0:?}")]
    Refused(ConnectReturnCode),

    #[error("request failed: {0}")]
    Client(#[from] ClientError),

    #[error("no reply on {topic} within {timeout:?}")]
    ResponseTimeout { topic: String, timeout: Duration },

    #[error("session closed")]
    Closed,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Broker hostname.
    pub endpoint: String,
    pub port: u16,
    pub client_id: String,

    /// Root CA trust bundle.
    pub ca_path: PathBuf,

    /// Client certificate/key pair for mutual TLS.
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,

    /// Whether to request a clean start instead of resuming server-side
    /// session state.
    pub clean_session: bool,
    pub keep_alive: Duration,
}

type WaiterMap = HashMap<String, oneshot::Sender<Vec<u8>>>;
type Waiters = Arc<Mutex<WaiterMap>>;

/// Deliver `payload` to the waiter registered for `topic`, consuming the
/// registration. Messages on topics nobody is waiting on are not queued.
fn route_message(waiters: &mut WaiterMap, topic: &str, payload: Vec<u8>) -> bool {
    match waiters.remove(topic) {
        Some(tx) => tx.send(payload).is_ok(),
        None => false,
    }
}

/// A mutually-authenticated session with the IoT broker.
///
/// Incoming messages are routed to single-use response channels registered
/// per `request` call, so a reply can only ever complete the wait that asked
/// for it.
pub struct Session {
    client: AsyncClient,
    waiters: Waiters,
}

impl Session {
    /// Open the session, driving the transport until the broker
    /// acknowledges the connection. Any failure before that point is fatal.
    pub async fn connect(config: &SessionConfig) -> Result<Self, SessionError> {
        let ca = fs::read(&config.ca_path).await?;
        let certificate = fs::read(&config.certificate_path).await?;
        let private_key = fs::read(&config.private_key_path).await?;

        let mut options =
            MqttOptions::new(config.client_id.clone(), config.endpoint.clone(), config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(config.clean_session);
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: Some((certificate, private_key)),
        }));

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        debug!("connecting to {}:{}", config.endpoint, config.port);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(SessionError::Refused(ack.code));
                    }
                    break;
                }
                Ok(_) => {}
                Err(err) => return Err(err.into()),
            }
        }
        info!("connected to {} as {}", config.endpoint, config.client_id);

        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));

        // Keep driving the transport in the background, routing incoming
        // messages to their waiters. The transport reconnects on its own as
        // long as it keeps being polled.
        let router = Arc::clone(&waiters);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let mut waiters = router.lock().await;
                        if !route_message(&mut waiters, &publish.topic, publish.payload.to_vec()) {
                            trace!("dropping message on {}", publish.topic);
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        error!("transport error: {err}");
                        time::sleep(TRANSPORT_RETRY_DELAY).await;
                    }
                }
            }
        });

        Ok(Session { client, waiters })
    }

    /// Subscribe to `topic` with at-least-once delivery.
    pub async fn subscribe(&self, topic: &str) -> Result<(), SessionError> {
        debug!("subscribing to {topic}");
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        Ok(())
    }

    /// Publish `payload` to `topic` and wait for the first message delivered
    /// on `response_topic`.
    ///
    /// Exactly one message is consumed per call. The registration is scoped
    /// to this call and dropped on timeout, a reply to an earlier request
    /// can never satisfy a later one.
    pub async fn request(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        response_topic: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, SessionError> {
        let rx = {
            let mut waiters = self.waiters.lock().await;
            let (tx, rx) = oneshot::channel();
            // last registration wins, a replaced waiter completes with Closed
            waiters.insert(response_topic.to_owned(), tx);
            rx
        };

        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.into())
            .await?;

        match time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => {
                self.waiters.lock().await.remove(response_topic);
                Err(SessionError::ResponseTimeout {
                    topic: response_topic.to_owned(),
                    timeout,
                })
            }
        }
    }

    /// Publish `payload` to `topic` at least once, without waiting for a
    /// reply.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
    ) -> Result<(), SessionError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.into())
            .await?;
        Ok(())
    }

    /// Gracefully close the session.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        debug!("disconnecting");
        self.client.disconnect().await?;
        Ok(())
    }
}
