use std::{
    future::IntoFuture,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Mutex, Notify},
    time::MissedTickBehavior,
};
use tracing::{info, warn};

use pillbox_common::{
    availability_topic, command_topic, config::WHOLE_DOCUMENT, device::COMMAND_QUEUE_CAPACITY,
    replace_network_section, Board, Device, DeviceConfig, LoadedConfig, NetworkConfig, Now,
    TelemetrySnapshot, AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE, MAX_COMMAND_BYTES,
};

use crate::{
    portal::{self, PortalRequest, PortalState},
    sim::{BrokerLink, LoggedPin, MqttTransport, ProcMemory, SimulatedSensors},
};

const TICK_MS: u64 = 1_000;

type HostBoard = Board<BrokerLink, SimulatedSensors, ProcMemory, MqttTransport, LoggedPin>;

#[derive(Clone)]
pub struct AppStore {
    config_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let boot_ms = monotonic_ms();
    let store = AppStore::new();
    let loaded = store.load_config().await.unwrap_or_else(|err| {
        warn!("failed to load config from store: {err:#}");
        LoadedConfig {
            unreadable: vec![(WHOLE_DOCUMENT, format!("{err:#}"))],
            ..LoadedConfig::default()
        }
    });
    for (section, reason) in &loaded.unreadable {
        warn!("stored `{section}` settings unreadable, defaults in use: {reason}");
    }
    let network_fault = loaded.network_fault();
    let mut config = loaded.config;
    apply_env_overrides(&mut config);
    config.sanitize();
    config
        .validate()
        .context("hardware configuration is unusable")?;

    info!(
        "config loaded: ssid=`{}`, mqtt=`{}:{}`, namespace=`{}`, {} reminder(s)",
        config.network.wifi_ssid,
        config.network.mqtt_host,
        config.network.mqtt_port,
        config.telemetry.namespace,
        config.reminders.times.len(),
    );
    if config.telemetry.auth_token.is_empty() {
        warn!("no command token configured; every inbound command will be rejected");
    }

    let timezone = parse_timezone(&config.timezone);
    let namespace = config.telemetry.namespace.clone();

    let (mqtt, eventloop) = create_mqtt_client(&config);
    let broker_up = Arc::new(AtomicBool::new(false));
    let connect_requests = Arc::new(Notify::new());
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    spawn_mqtt_loop(
        eventloop,
        mqtt.clone(),
        &namespace,
        broker_up.clone(),
        connect_requests.clone(),
        command_tx,
    );

    let board = Board {
        link: BrokerLink::new(mqtt.clone(), broker_up, connect_requests),
        sensors: SimulatedSensors::default(),
        memory: ProcMemory,
        transport: MqttTransport::new(mqtt.clone()),
        buzzer: LoggedPin::new("buzzer"),
        light: LoggedPin::new("light"),
        status_led: LoggedPin::new("status-led"),
    };
    let mut device = Device::new(config, boot_ms);
    if let Some(err) = network_fault {
        device.hold_config_fault(err);
    }

    let (snapshot_tx, snapshot_rx) = watch::channel(None);
    let (request_tx, request_rx) = mpsc::channel(4);
    let control = tokio::spawn(control_loop(
        device,
        board,
        timezone,
        command_rx,
        request_rx,
        snapshot_tx,
    ));

    let app = portal::router(PortalState {
        store,
        snapshots: snapshot_rx,
        requests: request_tx,
    });

    let port = std::env::var("PILLBOX_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind portal at {addr}"))?;
    info!("portal listening on http://{addr}");

    tokio::select! {
        result = axum::serve(listener, app).into_future() => result.context("portal server stopped")?,
        result = control => result.context("control loop panicked")??,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    if let Err(err) = mqtt.try_publish(
        availability_topic(&namespace),
        QoS::AtLeastOnce,
        true,
        AVAILABILITY_OFFLINE,
    ) {
        warn!("failed to announce offline status: {err}");
    }
    Ok(())
}

fn apply_env_overrides(config: &mut DeviceConfig) {
    let var = |name: &str| std::env::var(name).ok();

    if let Some(ssid) = var("WIFI_SSID") {
        config.network.wifi_ssid = ssid;
    }
    if let Some(pass) = var("WIFI_PASS") {
        config.network.wifi_pass = pass;
    }
    if let Some(host) = var("MQTT_HOST") {
        config.network.mqtt_host = host;
    }
    if let Some(port) = var("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.network.mqtt_port = port;
    }
    if let Some(user) = var("MQTT_USER") {
        config.network.mqtt_user = user;
    }
    if let Some(pass) = var("MQTT_PASS") {
        config.network.mqtt_pass = pass;
    }
    if let Some(token) = var("PILLBOX_TOKEN") {
        config.telemetry.auth_token = token;
    }
}

fn create_mqtt_client(config: &DeviceConfig) -> (AsyncClient, EventLoop) {
    let network = &config.network;
    let mut options = MqttOptions::new(
        config.telemetry.client_id.clone(),
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    options.set_last_will(LastWill::new(
        availability_topic(&config.telemetry.namespace),
        AVAILABILITY_OFFLINE.as_bytes().to_vec(),
        QoS::AtLeastOnce,
        true,
    ));
    if !network.mqtt_user.is_empty() {
        options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }

    AsyncClient::new(options, 32)
}

/// Drives one broker session per connect request. A session ends on the first
/// poll error; the loop then waits for the link manager to ask again.
fn spawn_mqtt_loop(
    mut eventloop: EventLoop,
    mqtt: AsyncClient,
    namespace: &str,
    broker_up: Arc<AtomicBool>,
    connect_requests: Arc<Notify>,
    commands: mpsc::Sender<Vec<u8>>,
) {
    let commands_on = command_topic(namespace);
    let presence = availability_topic(namespace);

    tokio::spawn(async move {
        loop {
            connect_requests.notified().await;
            info!("dialing mqtt broker");

            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("mqtt connected");
                        broker_up.store(true, Ordering::Relaxed);

                        // Sessions are not persisted; subscribe again on every connect.
                        if let Err(err) = mqtt.try_subscribe(commands_on.clone(), QoS::AtLeastOnce) {
                            warn!("command subscription failed: {err}");
                        }
                        if let Err(err) = mqtt.try_publish(
                            presence.clone(),
                            QoS::AtLeastOnce,
                            true,
                            AVAILABILITY_ONLINE,
                        ) {
                            warn!("failed to announce online status: {err}");
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        if message.topic != commands_on {
                            continue;
                        }
                        if message.payload.len() > MAX_COMMAND_BYTES {
                            warn!(
                                "dropping oversized command ({} bytes)",
                                message.payload.len()
                            );
                            continue;
                        }
                        if let Err(err) = commands.try_send(message.payload.to_vec()) {
                            warn!("command queue unavailable, dropping command: {err}");
                        }
                    }
                    Ok(Event::Incoming(Incoming::Disconnect)) => {
                        warn!("mqtt disconnected by broker");
                        broker_up.store(false, Ordering::Relaxed);
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        info!("mqtt session closing on request");
                        broker_up.store(false, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("mqtt session ended: {err}");
                        break;
                    }
                }
            }
            broker_up.store(false, Ordering::Relaxed);
        }
    });
}

async fn control_loop(
    mut device: Device,
    mut board: HostBoard,
    timezone: Tz,
    mut commands: mpsc::Receiver<Vec<u8>>,
    mut requests: mpsc::Receiver<PortalRequest>,
    snapshots: watch::Sender<Option<TelemetrySnapshot>>,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(Duration::from_millis(TICK_MS));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let now_ms = monotonic_ms();

        while let Ok(payload) = commands.try_recv() {
            device.enqueue_command(payload);
        }

        let mut restart = false;
        while let Ok(request) = requests.try_recv() {
            match request {
                PortalRequest::Reconfigure(network) => {
                    if let Err(err) = device.reconfigure_network(network, now_ms, &mut board.link) {
                        warn!("portal network update rejected: {err}");
                    }
                }
                PortalRequest::Restart => restart = true,
            }
        }

        let now = Now {
            mono_ms: now_ms,
            local: Some(now_in_timezone(timezone)),
        };
        let report = device.tick(now, &mut board);
        snapshots.send_replace(Some(device.snapshot()));

        if report.reboot_requested || restart {
            info!("restart requested; leaving control loop");
            return Ok(());
        }
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("PILLBOX_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.pillbox"));
        Self::in_dir(&data_dir)
    }

    pub fn in_dir(data_dir: &Path) -> Self {
        Self {
            config_path: Arc::new(data_dir.join("config.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn load_config(&self) -> anyhow::Result<LoadedConfig> {
        let _guard = self.lock.lock().await;
        Ok(match self.read_raw().await? {
            Some(raw) => DeviceConfig::from_stored(&raw),
            None => LoadedConfig::default(),
        })
    }

    /// Replaces the stored network section. Everything else in the file is
    /// kept, and a file that no longer parses is left alone.
    pub async fn save_network(&self, network: &NetworkConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let existing = self.read_raw().await?;
        let payload = replace_network_section(existing.as_deref(), network)?;

        let path = self.config_path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    async fn read_raw(&self) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.config_path.as_ref();
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}

fn parse_timezone(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        warn!("unknown timezone `{name}`; reminders will follow UTC");
        chrono_tz::UTC
    })
}

fn now_in_timezone(tz: Tz) -> DateTime<FixedOffset> {
    let local = Utc::now().with_timezone(&tz);
    local.with_timezone(&local.offset().fix())
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
