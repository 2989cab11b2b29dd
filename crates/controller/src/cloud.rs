//! Authenticated MQTT session to the cloud bridge: publishes telemetry on a
//! fixed cadence and applies parameter pushes to the [`ConfigStore`].
//!
//! The event loop is polled from a plain `while` loop. Every poll result is
//! classified into a [`Transition`] and handled in place, so connection
//! state and backoff never leave this module.

use anyhow::{bail, Context, Result};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    Transport,
};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{jitter, Backoff};
use crate::credential::Credential;
use crate::params::{Config, ConfigStore, SEND_INTERVAL};
use crate::settings::CloudSettings;
use crate::telemetry::TelemetryAggregator;

/// Upper bound on a single poll while connected, so publishing and
/// cancellation are never starved by a quiet link.
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);

/// Outstanding request capacity between client handle and event loop.
const REQUEST_CAPACITY: usize = 16;

/// The broker ignores the user name; the token travels as the password.
const USERNAME: &str = "unused";

// ---------------------------------------------------------------------------
// Topics / identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Topics {
    pub events: String,
    pub config: String,
    /// Subscription filter, `.../commands/#`.
    pub commands: String,
    commands_root: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    Config,
    /// Sub-topic below the commands root, empty for the root itself.
    Command(&'a str),
    Other,
}

impl Topics {
    pub fn for_device(device_id: &str) -> Self {
        let commands_root = format!("/devices/{device_id}/commands");
        Self {
            events: format!("/devices/{device_id}/events"),
            config: format!("/devices/{device_id}/config"),
            commands: format!("{commands_root}/#"),
            commands_root,
        }
    }

    pub fn route<'a>(&self, topic: &'a str) -> Inbound<'a> {
        if topic == self.config {
            return Inbound::Config;
        }
        match topic.strip_prefix(self.commands_root.as_str()) {
            Some("") => Inbound::Command(""),
            Some(rest) => match rest.strip_prefix('/') {
                Some(sub) => Inbound::Command(sub),
                None => Inbound::Other,
            },
            None => Inbound::Other,
        }
    }
}

pub fn client_id(settings: &CloudSettings, device_id: &str) -> String {
    format!(
        "projects/{}/locations/{}/registries/{}/devices/{}",
        settings.project_id, settings.region, settings.registry_id, device_id
    )
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub enum Transition {
    Connected,
    Disconnected(String),
    Message { topic: String, payload: Vec<u8> },
    Idle,
}

pub fn classify(result: &Result<Event, ConnectionError>) -> Transition {
    match result {
        Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
            Transition::Connected
        }
        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
            Transition::Disconnected(format!("connection refused: {:?}", ack.code))
        }
        Ok(Event::Incoming(Packet::Disconnect)) => {
            Transition::Disconnected("broker closed the session".to_string())
        }
        Ok(Event::Incoming(Packet::Publish(p))) => Transition::Message {
            topic: p.topic.clone(),
            payload: p.payload.to_vec(),
        },
        Ok(_) => Transition::Idle,
        Err(e) => Transition::Disconnected(e.to_string()),
    }
}

/// Parse a pushed parameter document and hand it to the store.
/// `Ok(false)` means it matched what we already had.
pub fn apply_config_message(store: &ConfigStore, payload: &[u8]) -> Result<bool> {
    let config = Config::from_json(payload)?;
    store.replace(config)
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl Session {
    fn open(settings: &CloudSettings, client_id: &str, credential: &Credential) -> Result<Self> {
        let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_sec));
        options.set_credentials(USERNAME, credential.token());

        if let Some(path) = &settings.ca_certs {
            let ca = std::fs::read(path)
                .with_context(|| format!("failed to read CA certificates: {}", path.display()))?;
            options.set_transport(Transport::tls(ca, None, None));
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Ok(Self { client, eventloop })
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

pub struct CloudChannel {
    settings: CloudSettings,
    client_id: String,
    topics: Topics,
    telemetry: Arc<TelemetryAggregator>,
    store: Arc<ConfigStore>,
    credential: Credential,
    session: Session,
    backoff: Backoff,
    connected: bool,
    backing_off: bool,
    next_publish: Instant,
}

impl CloudChannel {
    /// Mint the first credential and prepare the session. The broker is
    /// contacted on the first poll inside [`CloudChannel::run`].
    pub fn new(
        settings: CloudSettings,
        device_id: &str,
        telemetry: Arc<TelemetryAggregator>,
        store: Arc<ConfigStore>,
    ) -> Result<Self> {
        let client_id = client_id(&settings, device_id);
        let credential = Credential::mint(&settings, OffsetDateTime::now_utc())
            .context("failed to mint broker credential")?;
        let session = Session::open(&settings, &client_id, &credential)?;
        let interval = store.snapshot().seconds(SEND_INTERVAL)?;

        Ok(Self {
            backoff: Backoff::new(settings.initial_backoff(), settings.max_backoff()),
            topics: Topics::for_device(device_id),
            settings,
            client_id,
            telemetry,
            store,
            credential,
            session,
            connected: false,
            backing_off: false,
            next_publish: Instant::now() + interval,
        })
    }

    /// Run until cancelled. Returns an error when the broker stays
    /// unreachable past the maximum backoff or a credential cannot be
    /// minted; the caller decides what that means for the process.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            client_id = %self.client_id,
            broker = %self.settings.host,
            port = self.settings.port,
            "cloud channel starting"
        );

        while !cancel.is_cancelled() {
            if self.backing_off {
                let Some(delay) = self.backoff.next_delay() else {
                    bail!(
                        "broker unreachable, giving up: next backoff of {}s exceeds the {}s limit",
                        self.backoff.current().as_secs(),
                        self.settings.max_backoff_sec
                    );
                };
                let wait = delay + jitter();
                info!(wait_ms = wait.as_millis() as u64, "waiting before reconnect");
                sleep(wait).await;
                self.backing_off = false;
            }

            self.refresh_credential_if_due(OffsetDateTime::now_utc())?;

            let transition = self.poll(&cancel).await;
            self.handle(transition);
            self.publish_if_due(Instant::now())?;
        }

        if let Err(e) = self.session.client.try_disconnect() {
            debug!(error = %e, "disconnect request not queued");
        }
        info!("cloud channel stopped");
        Ok(())
    }

    /// A connect attempt is never cut short by the poll bound, only by
    /// cancellation.
    async fn poll(&mut self, cancel: &CancellationToken) -> Transition {
        if self.connected {
            match timeout(MAX_POLL_WAIT, self.session.eventloop.poll()).await {
                Ok(result) => classify(&result),
                Err(_) => Transition::Idle,
            }
        } else {
            tokio::select! {
                result = self.session.eventloop.poll() => classify(&result),
                _ = cancel.cancelled() => Transition::Idle,
            }
        }
    }

    fn handle(&mut self, transition: Transition) {
        match transition {
            Transition::Connected => {
                info!("connected to broker");
                self.connected = true;
                self.backing_off = false;
                self.backoff.reset();
                self.subscribe();
            }
            Transition::Disconnected(reason) => {
                warn!(%reason, "broker connection lost");
                self.connected = false;
                self.backing_off = true;
            }
            Transition::Message { topic, payload } => match self.topics.route(&topic) {
                Inbound::Config => match apply_config_message(&self.store, &payload) {
                    Ok(true) => info!("remote parameters applied"),
                    Ok(false) => debug!("remote parameters unchanged"),
                    Err(e) => warn!(error = %format!("{e:#}"), "discarding remote parameters"),
                },
                Inbound::Command(command) => {
                    info!(command, bytes = payload.len(), "command received, no handler");
                }
                Inbound::Other => debug!(%topic, "message on unhandled topic"),
            },
            Transition::Idle => {}
        }
    }

    fn subscribe(&self) {
        let requests = [
            (&self.topics.config, QoS::AtLeastOnce),
            (&self.topics.commands, QoS::AtMostOnce),
        ];
        for (topic, qos) in requests {
            match self.session.client.try_subscribe(topic.as_str(), qos) {
                Ok(()) => info!(%topic, ?qos, "subscribed"),
                Err(e) => warn!(%topic, error = %e, "subscribe failed"),
            }
        }
    }

    fn publish_if_due(&mut self, now: Instant) -> Result<()> {
        if !self.connected || now < self.next_publish {
            return Ok(());
        }
        let interval = self.store.snapshot().seconds(SEND_INTERVAL)?;
        self.next_publish = now + interval;

        let snapshot = self.telemetry.drain();
        let payload = serde_json::to_vec(&snapshot).context("failed to encode telemetry")?;
        match self.session.client.try_publish(
            self.topics.events.as_str(),
            QoS::AtLeastOnce,
            false,
            payload,
        ) {
            Ok(()) => debug!(
                humidity = snapshot.humidity,
                samples = snapshot.samples,
                pump = snapshot.pump_active,
                light = snapshot.light_active,
                "telemetry queued"
            ),
            Err(e) => warn!(error = %e, "telemetry dropped"),
        }
        Ok(())
    }

    /// Tokens are refreshed on age alone, whether or not the link is up.
    fn refresh_credential_if_due(&mut self, now: OffsetDateTime) -> Result<()> {
        if !self
            .credential
            .needs_refresh(now, self.settings.token_refresh())
        {
            return Ok(());
        }

        let age = now - self.credential.issued_at();
        info!(age_sec = age.whole_seconds(), "refreshing broker credential");
        let credential =
            Credential::mint(&self.settings, now).context("failed to refresh broker credential")?;
        let mut session = Session::open(&self.settings, &self.client_id, &credential)?;

        // Queued and unacknowledged requests move to the new session, which
        // sends them first once it connects.
        self.session.eventloop.clean();
        session.eventloop.pending = std::mem::take(&mut self.session.eventloop.pending);
        debug!(
            carried = session.eventloop.pending.len(),
            "requests moved to new session"
        );

        self.session = session;
        self.credential = credential;
        self.connected = false;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::tests::EC_PRIVATE_PEM;
    use crate::params::tests::{config_with, valid_config, MemoryBackend, VALID_JSON};
    use crate::params::Scalar;
    use crate::settings::{tests::minimal, SigningAlgorithm};
    use rumqttc::{ConnAck, Outgoing, Publish, Request};
    use std::path::PathBuf;

    fn key_file(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "greenhouse-cloud-{}-{name}.pem",
            std::process::id()
        ));
        std::fs::write(&path, EC_PRIVATE_PEM).unwrap();
        path
    }

    fn cloud_settings(name: &str) -> CloudSettings {
        let mut settings = minimal().cloud;
        settings.algorithm = SigningAlgorithm::Es256;
        settings.private_key_file = key_file(name);
        settings
    }

    struct Harness {
        channel: CloudChannel,
        telemetry: Arc<TelemetryAggregator>,
        store: Arc<ConfigStore>,
        backend: MemoryBackend,
    }

    fn harness(name: &str) -> Harness {
        let backend = MemoryBackend::with(valid_config());
        let store = Arc::new(ConfigStore::load(backend.clone()).unwrap());
        let telemetry = Arc::new(TelemetryAggregator::new());
        let channel = CloudChannel::new(
            cloud_settings(name),
            "raspi1",
            Arc::clone(&telemetry),
            Arc::clone(&store),
        )
        .unwrap();
        Harness {
            channel,
            telemetry,
            store,
            backend,
        }
    }

    // -- topics -------------------------------------------------------------

    #[test]
    fn topics_are_scoped_to_device() {
        let t = Topics::for_device("raspi1");
        assert_eq!(t.events, "/devices/raspi1/events");
        assert_eq!(t.config, "/devices/raspi1/config");
        assert_eq!(t.commands, "/devices/raspi1/commands/#");
    }

    #[test]
    fn route_config_topic() {
        let t = Topics::for_device("raspi1");
        assert_eq!(t.route("/devices/raspi1/config"), Inbound::Config);
    }

    #[test]
    fn route_command_topics() {
        let t = Topics::for_device("raspi1");
        assert_eq!(t.route("/devices/raspi1/commands"), Inbound::Command(""));
        assert_eq!(
            t.route("/devices/raspi1/commands/reboot"),
            Inbound::Command("reboot")
        );
        assert_eq!(
            t.route("/devices/raspi1/commands/a/b"),
            Inbound::Command("a/b")
        );
    }

    #[test]
    fn route_foreign_topics() {
        let t = Topics::for_device("raspi1");
        assert_eq!(t.route("/devices/raspi2/config"), Inbound::Other);
        assert_eq!(t.route("/devices/raspi1/commandsX"), Inbound::Other);
        assert_eq!(t.route("/devices/raspi1/events"), Inbound::Other);
        assert_eq!(t.route(""), Inbound::Other);
    }

    #[test]
    fn client_id_names_the_full_device_path() {
        let s = minimal().cloud;
        assert_eq!(
            client_id(&s, "raspi1"),
            "projects/greenhouse-test/locations/europe-west1/registries/inventory1/devices/raspi1"
        );
    }

    // -- classify -----------------------------------------------------------

    #[test]
    fn connack_success_is_connected() {
        let ev = Ok(Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))));
        assert_eq!(classify(&ev), Transition::Connected);
    }

    #[test]
    fn connack_refusal_is_disconnected() {
        let ev = Ok(Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::NotAuthorized,
            false,
        ))));
        assert!(matches!(classify(&ev), Transition::Disconnected(_)));
    }

    #[test]
    fn broker_disconnect_is_disconnected() {
        let ev = Ok(Event::Incoming(Packet::Disconnect));
        assert!(matches!(classify(&ev), Transition::Disconnected(_)));
    }

    #[test]
    fn poll_error_is_disconnected() {
        let ev: Result<Event, ConnectionError> = Err(ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        match classify(&ev) {
            Transition::Disconnected(reason) => assert!(reason.contains("refused")),
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }

    #[test]
    fn publish_is_message() {
        let ev = Ok(Event::Incoming(Packet::Publish(Publish::new(
            "/devices/raspi1/config",
            QoS::AtLeastOnce,
            "{}",
        ))));
        assert_eq!(
            classify(&ev),
            Transition::Message {
                topic: "/devices/raspi1/config".into(),
                payload: b"{}".to_vec(),
            }
        );
    }

    #[test]
    fn outgoing_traffic_is_idle() {
        let ev = Ok(Event::Outgoing(Outgoing::PingReq));
        assert_eq!(classify(&ev), Transition::Idle);
    }

    // -- apply_config_message -----------------------------------------------

    #[test]
    fn identical_remote_config_writes_nothing() {
        let backend = MemoryBackend::with(valid_config());
        let store = ConfigStore::load(backend.clone()).unwrap();
        assert!(!apply_config_message(&store, VALID_JSON.as_bytes()).unwrap());
        assert_eq!(backend.save_count(), 0);
    }

    #[test]
    fn changed_remote_config_is_persisted() {
        let backend = MemoryBackend::with(valid_config());
        let store = ConfigStore::load(backend.clone()).unwrap();
        let updated = config_with("watering_threshold", Scalar::Int(55));
        let payload = updated.to_json_pretty().unwrap();

        assert!(apply_config_message(&store, payload.as_bytes()).unwrap());
        assert_eq!(backend.save_count(), 1);
        assert_eq!(store.get("watering_threshold").unwrap(), Scalar::Int(55));
    }

    #[test]
    fn malformed_remote_config_leaves_cache_alone() {
        let backend = MemoryBackend::with(valid_config());
        let store = ConfigStore::load(backend.clone()).unwrap();

        assert!(apply_config_message(&store, b"{not json").is_err());
        assert!(apply_config_message(&store, br#"{"nested": {"a": 1}}"#).is_err());
        assert!(apply_config_message(&store, br#"{"watering_threshold": 50}"#).is_err());

        assert_eq!(backend.save_count(), 0);
        assert_eq!(*store.snapshot(), valid_config());
    }

    // -- channel state ------------------------------------------------------

    #[test]
    fn connect_resets_backoff() {
        let mut h = harness("connect");
        h.channel.handle(Transition::Disconnected("gone".into()));
        assert!(h.channel.backing_off);
        h.channel.backoff.next_delay();
        h.channel.backoff.next_delay();

        h.channel.handle(Transition::Connected);
        assert!(h.channel.connected);
        assert!(!h.channel.backing_off);
        assert_eq!(h.channel.backoff.current(), Duration::from_secs(1));
    }

    #[test]
    fn disconnect_stops_publishing() {
        let mut h = harness("disconnect");
        h.channel.handle(Transition::Connected);
        h.channel.handle(Transition::Disconnected("gone".into()));
        assert!(!h.channel.connected);

        h.telemetry.record(50, false, false);
        h.channel
            .publish_if_due(Instant::now() + Duration::from_secs(3600))
            .unwrap();
        assert_eq!(h.telemetry.pending(), 1, "nothing drained while offline");
    }

    #[test]
    fn publish_drains_only_when_due() {
        let mut h = harness("publish");
        h.channel.handle(Transition::Connected);
        h.telemetry.record(40, true, false);
        h.telemetry.record(60, true, false);

        let start = h.channel.next_publish;
        h.channel
            .publish_if_due(start - Duration::from_millis(1))
            .unwrap();
        assert_eq!(h.telemetry.pending(), 2, "not due yet");

        h.channel.publish_if_due(start).unwrap();
        assert_eq!(h.telemetry.pending(), 0);
        assert_eq!(h.channel.next_publish, start + Duration::from_secs(3));
    }

    #[test]
    fn config_message_updates_store() {
        let mut h = harness("config-msg");
        let updated = config_with("gcp_send_interval", Scalar::Int(10));
        h.channel.handle(Transition::Message {
            topic: "/devices/raspi1/config".into(),
            payload: updated.to_json_pretty().unwrap().into_bytes(),
        });
        assert_eq!(h.store.get("gcp_send_interval").unwrap(), Scalar::Int(10));
        assert_eq!(h.backend.save_count(), 1);
    }

    #[test]
    fn malformed_config_message_is_discarded() {
        let mut h = harness("bad-msg");
        h.channel.handle(Transition::Message {
            topic: "/devices/raspi1/config".into(),
            payload: b"garbage".to_vec(),
        });
        assert_eq!(*h.store.snapshot(), valid_config());
        assert_eq!(h.backend.save_count(), 0);
    }

    #[test]
    fn command_message_changes_nothing() {
        let mut h = harness("command");
        h.channel.handle(Transition::Message {
            topic: "/devices/raspi1/commands/reboot".into(),
            payload: VALID_JSON.as_bytes().to_vec(),
        });
        assert_eq!(h.backend.save_count(), 0);
    }

    #[test]
    fn stale_credential_is_reminted() {
        let mut h = harness("refresh");
        h.channel.handle(Transition::Connected);
        let issued = h.channel.credential.issued_at();

        // Not due yet.
        h.channel
            .refresh_credential_if_due(issued + time::Duration::minutes(5))
            .unwrap();
        assert_eq!(h.channel.credential.issued_at(), issued);
        assert!(h.channel.connected);

        let later = issued + time::Duration::minutes(21);
        h.channel.refresh_credential_if_due(later).unwrap();
        assert_eq!(h.channel.credential.issued_at(), later);
        assert!(!h.channel.connected, "new session must authenticate again");
    }

    #[test]
    fn refresh_keeps_queued_telemetry() {
        let mut h = harness("refresh-queued");
        h.channel.handle(Transition::Connected);
        h.telemetry.record(45, true, false);
        h.channel.publish_if_due(h.channel.next_publish).unwrap();
        assert_eq!(h.telemetry.pending(), 0, "snapshot handed to the client");

        let later = h.channel.credential.issued_at() + time::Duration::minutes(21);
        h.channel.refresh_credential_if_due(later).unwrap();

        let events = h.channel.topics.events.clone();
        let queued = h
            .channel
            .session
            .eventloop
            .pending
            .iter()
            .filter(|r| matches!(r, Request::Publish(p) if p.topic == events))
            .count();
        assert_eq!(queued, 1, "telemetry must survive the session swap");
    }

    #[test]
    fn unreadable_key_is_fatal() {
        let mut settings = minimal().cloud;
        settings.private_key_file = PathBuf::from("/nonexistent/key.pem");
        let store = Arc::new(ConfigStore::load(MemoryBackend::with(valid_config())).unwrap());
        let result = CloudChannel::new(
            settings,
            "raspi1",
            Arc::new(TelemetryAggregator::new()),
            store,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn gives_up_once_backoff_is_exhausted() {
        let mut settings = cloud_settings("give-up");
        settings.host = "127.0.0.1".into();
        settings.port = 1;
        settings.initial_backoff_sec = 1;
        settings.max_backoff_sec = 1;

        let store = Arc::new(ConfigStore::load(MemoryBackend::with(valid_config())).unwrap());
        let channel = CloudChannel::new(
            settings,
            "raspi1",
            Arc::new(TelemetryAggregator::new()),
            store,
        )
        .unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(30),
            channel.run(CancellationToken::new()),
        )
        .await
        .expect("channel should give up on its own")
        .unwrap_err();
        assert!(format!("{err:#}").contains("giving up"));
    }

    #[tokio::test]
    async fn cancelled_channel_returns_ok() {
        let h = harness("cancel");
        let cancel = CancellationToken::new();
        cancel.cancel();
        h.channel.run(cancel).await.unwrap();
    }
}
