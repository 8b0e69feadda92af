use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Datelike, FixedOffset, Utc};
use chrono_tz::Tz;
use dht_sensor::dht22;
use embedded_svc::{
    http::Method,
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, LwtConfiguration, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::Ets,
    gpio::{ADCPin, AnyIOPin, AnyOutputPin, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    sys::EspError,
    wifi::EspWifi,
};
use log::{info, warn};
use serde::Serialize;

use pillbox_common::{
    availability_topic, command_topic, config::WHOLE_DOCUMENT, replace_network_section, Board,
    ConfigError, Device, DeviceConfig, HardwareError, LinkDriver, LinkError, LoadedConfig,
    MemoryProbe, NetworkConfig, Now, OutputPin, SensorBus, TelemetrySnapshot, Transport,
    TransportError, AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE, COMMAND_QUEUE_CAPACITY,
    MAX_COMMAND_BYTES,
};

use crate::provisioning::{
    apply_network_update, broker_restart_required, build_network_config_view,
    NetworkConfigUpdate, NetworkUpdateResponse,
};

const NVS_NAMESPACE: &str = "pillbox";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_CONFIG_CAPACITY: usize = 4096;
const MAX_HTTP_BODY: usize = 4096;
const ACCESS_POINT_SSID: &str = "PillReminder-AP";
const ACCESS_POINT_PASSWORD: &str = "PillboxSetup";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const TICK_MS: u64 = 1_000;
/// DHT22 needs two seconds between conversions.
const DHT_MIN_INTERVAL: Duration = Duration::from_secs(2);
/// SNTP has not run yet while the RTC still reports the build-era epoch.
const CLOCK_VALID_FROM_YEAR: i32 = 2024;

type EspBoard = Board<EspLink, EspSensors, HeapMemory, EspTransport, GpioPin>;
type PowerReader = Box<dyn FnMut() -> Result<u16, EspError> + Send>;

enum PortalRequest {
    Reconfigure(NetworkConfig),
    Restart,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let loaded = nvs_store.load_config().unwrap_or_else(|err| {
        warn!("failed to load config from NVS: {err:#}");
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
    ensure_wifi_defaults(&mut config);
    config.sanitize();
    config
        .validate()
        .context("hardware configuration is unusable")?;

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, namespace=`{}`, {} reminder(s)",
        config.network.wifi_ssid,
        config.network.mqtt_host,
        config.network.mqtt_port,
        config.telemetry.namespace,
        config.reminders.times.len(),
    );
    if config.telemetry.auth_token.is_empty() {
        warn!("no command token configured; every inbound command will be rejected");
    }

    let peripherals = Peripherals::take()?;
    let wifi = EspWifi::new(peripherals.modem, sys_loop, Some(nvs_partition))?;

    let adc = AdcDriver::new(peripherals.adc1)?;
    let pins = peripherals.pins;
    let power = match config.hardware.power_pin {
        32 => power_reader(adc, pins.gpio32),
        33 => power_reader(adc, pins.gpio33),
        34 => power_reader(adc, pins.gpio34),
        35 => power_reader(adc, pins.gpio35),
        36 => power_reader(adc, pins.gpio36),
        37 => power_reader(adc, pins.gpio37),
        38 => power_reader(adc, pins.gpio38),
        39 => power_reader(adc, pins.gpio39),
        other => Err(anyhow!("GPIO{other} is not an ADC1 input")),
    }
    .with_context(|| {
        format!(
            "failed to set up power sense ADC on GPIO{}",
            config.hardware.power_pin
        )
    })?;
    let sensors = EspSensors::new(config.hardware.dht_pin, power)?;

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    let namespace = config.telemetry.namespace.clone();
    let (mqtt, conn) = create_mqtt_client(&config)?;
    let broker_up = Arc::new(AtomicBool::new(false));
    let session_fresh = Arc::new(AtomicBool::new(false));
    let (command_tx, command_rx) = mpsc::sync_channel(COMMAND_QUEUE_CAPACITY);
    spawn_mqtt_receiver(
        conn,
        command_topic(&namespace),
        broker_up.clone(),
        session_fresh.clone(),
        command_tx,
    )?;

    let board = Board {
        link: EspLink::new(wifi),
        sensors,
        memory: HeapMemory,
        transport: EspTransport {
            client: mqtt,
            broker_up,
        },
        buzzer: GpioPin::new(config.hardware.buzzer_pin)?,
        light: GpioPin::new(config.hardware.light_pin)?,
        status_led: GpioPin::new(config.hardware.status_led_pin)?,
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let snapshots = Arc::new(Mutex::new(None));
    let (request_tx, request_rx) = mpsc::sync_channel(4);
    let timezone = parse_timezone(&config.timezone);
    let mut device = Device::new(config, monotonic_ms());
    if let Some(err) = network_fault {
        device.hold_config_fault(err);
    }

    spawn_control_loop(ControlLoop {
        device,
        board,
        timezone,
        namespace,
        session_fresh,
        commands: command_rx,
        requests: request_rx,
        snapshots: snapshots.clone(),
    })?;

    let server = create_http_server(nvs_store, snapshots, request_tx)?;

    // Keep services alive for the program lifetime.
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(config: &mut DeviceConfig) {
    if config.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            config.network.wifi_ssid = ssid.to_string();
        }
    }

    if config.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            config.network.wifi_pass = pass.to_string();
        }
    }
}

/// Station link driven one step per tick; never blocks on association.
struct EspLink {
    wifi: EspWifi<'static>,
    access_point: bool,
}

impl EspLink {
    fn new(wifi: EspWifi<'static>) -> Self {
        Self {
            wifi,
            access_point: false,
        }
    }
}

impl LinkDriver for EspLink {
    fn begin_connect(&mut self, network: &NetworkConfig) -> Result<(), LinkError> {
        let auth_method = if network.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        let client = ClientConfiguration {
            ssid: network
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| ConfigError::InvalidCredentials("wifi ssid too long"))?,
            password: network
                .wifi_pass
                .as_str()
                .try_into()
                .map_err(|_| ConfigError::InvalidCredentials("wifi password too long"))?,
            auth_method,
            ..Default::default()
        };

        if self.access_point {
            let _ = self.wifi.stop();
            self.access_point = false;
        }
        self.wifi
            .set_configuration(&Configuration::Client(client))
            .map_err(esp_transport_error)?;
        if !self.wifi.is_started().map_err(esp_transport_error)? {
            self.wifi.start().map_err(esp_transport_error)?;
        }
        self.wifi.connect().map_err(esp_transport_error)?;
        info!("wifi connecting to `{}`", network.wifi_ssid);
        Ok(())
    }

    fn poll_connected(&mut self) -> Result<bool, TransportError> {
        self.wifi.is_up().map_err(esp_transport_error)
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            warn!("wifi disconnect failed: {err}");
        }
    }

    fn start_access_point(&mut self) -> Result<(), TransportError> {
        let _ = self.wifi.stop();
        self.wifi
            .set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
                ssid: ACCESS_POINT_SSID
                    .try_into()
                    .map_err(|_| TransportError::Rejected("access point ssid too long".into()))?,
                password: ACCESS_POINT_PASSWORD
                    .try_into()
                    .map_err(|_| TransportError::Rejected("access point password too long".into()))?,
                auth_method: AuthMethod::WPA2Personal,
                channel: 1,
                ..Default::default()
            }))
            .map_err(esp_transport_error)?;
        self.wifi.start().map_err(esp_transport_error)?;
        self.access_point = true;
        info!("access point `{ACCESS_POINT_SSID}` started for local setup");
        Ok(())
    }
}

fn esp_transport_error(err: esp_idf_svc::sys::EspError) -> TransportError {
    TransportError::Unreachable(err.to_string())
}

/// One-shot reads from whichever ADC1 pin senses the supply.
fn power_reader<P>(adc: AdcDriver<'static, ADC1>, pin: P) -> anyhow::Result<PowerReader>
where
    P: ADCPin<Adc = ADC1> + Send + 'static,
{
    let mut channel = AdcChannelDriver::new(
        adc,
        pin,
        &AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        },
    )?;
    Ok(Box::new(move || channel.read_raw()))
}

struct EspSensors {
    dht_pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
    last_dht: Option<(Instant, f32, f32)>,
    power: PowerReader,
}

impl EspSensors {
    fn new(dht_pin: i32, power: PowerReader) -> anyhow::Result<Self> {
        let mut pin = unsafe { PinDriver::input_output_od(AnyIOPin::new(dht_pin)) }
            .with_context(|| format!("failed to claim DHT22 data pin GPIO{dht_pin}"))?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;

        Ok(Self {
            dht_pin: pin,
            delay: Ets,
            last_dht: None,
            power,
        })
    }

    /// Temperature and humidity come from one conversion; the second read of a
    /// pair is served from the cache.
    fn dht(&mut self) -> Result<(f32, f32), HardwareError> {
        if let Some((at, celsius, humidity)) = self.last_dht {
            if at.elapsed() < DHT_MIN_INTERVAL {
                return Ok((celsius, humidity));
            }
        }

        let reading = dht22::blocking::read(&mut self.delay, &mut self.dht_pin)
            .map_err(|err| HardwareError::Bus(format!("{err:?}")))?;
        self.last_dht = Some((Instant::now(), reading.temperature, reading.relative_humidity));
        Ok((reading.temperature, reading.relative_humidity))
    }
}

impl SensorBus for EspSensors {
    fn read_temperature_c(&mut self) -> Result<f32, HardwareError> {
        self.dht().map(|(celsius, _)| celsius)
    }

    fn read_humidity_pct(&mut self) -> Result<f32, HardwareError> {
        self.dht().map(|(_, humidity)| humidity)
    }

    fn read_power_raw(&mut self) -> Result<u16, HardwareError> {
        (self.power)().map_err(|err| HardwareError::Bus(err.to_string()))
    }
}

struct HeapMemory;

impl MemoryProbe for HeapMemory {
    fn free_bytes(&self) -> Option<u64> {
        Some(u64::from(unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }))
    }
}

struct GpioPin {
    driver: PinDriver<'static, AnyOutputPin, Output>,
}

impl GpioPin {
    fn new(pin: i32) -> anyhow::Result<Self> {
        let mut driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
            .with_context(|| format!("failed to claim output GPIO{pin}"))?;
        driver.set_low()?;
        Ok(Self { driver })
    }
}

impl OutputPin for GpioPin {
    fn set(&mut self, on: bool) -> Result<(), HardwareError> {
        let result = if on {
            self.driver.set_high()
        } else {
            self.driver.set_low()
        };
        result.map_err(|err| HardwareError::Bus(err.to_string()))
    }
}

struct EspTransport {
    client: EspMqttClient<'static>,
    broker_up: Arc<AtomicBool>,
}

impl EspTransport {
    /// Sessions are not persisted; subscribe again and announce presence.
    fn resume_session(&mut self, namespace: &str) {
        if let Err(err) = self
            .client
            .subscribe(&command_topic(namespace), QoS::AtLeastOnce)
        {
            warn!("command subscription failed: {err}");
        }
        if let Err(err) = self.publish(
            &availability_topic(namespace),
            AVAILABILITY_ONLINE.as_bytes(),
            true,
        ) {
            warn!("failed to announce online status: {err}");
        }
    }
}

impl Transport for EspTransport {
    fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<(), TransportError> {
        if !self.broker_up.load(Ordering::Relaxed) {
            return Err(TransportError::Unreachable("broker session is down".into()));
        }
        self.client
            .enqueue(topic, QoS::AtLeastOnce, retain, payload)
            .map(|_| ())
            .map_err(|err| TransportError::Rejected(err.to_string()))
    }
}

fn create_mqtt_client(
    config: &DeviceConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let network = &config.network;
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);
    let will_topic = availability_topic(&config.telemetry.namespace);

    let conf = MqttClientConfiguration {
        client_id: Some(config.telemetry.client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        keep_alive_interval: Some(Duration::from_secs(30)),
        lwt: Some(LwtConfiguration {
            topic: will_topic.as_str(),
            payload: AVAILABILITY_OFFLINE.as_bytes(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    commands_on: String,
    broker_up: Arc<AtomicBool>,
    session_fresh: Arc<AtomicBool>,
    commands: SyncSender<Vec<u8>>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        broker_up.store(true, Ordering::Relaxed);
                        session_fresh.store(true, Ordering::Relaxed);
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        broker_up.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if topic != commands_on || !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_COMMAND_BYTES {
                            warn!("dropping oversized command ({} bytes)", data.len());
                            continue;
                        }
                        match commands.try_send(data.to_vec()) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                warn!("command queue full; dropping newest command")
                            }
                            Err(TrySendError::Disconnected(_)) => return,
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    broker_up.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

struct ControlLoop {
    device: Device,
    board: EspBoard,
    timezone: Tz,
    namespace: String,
    session_fresh: Arc<AtomicBool>,
    commands: Receiver<Vec<u8>>,
    requests: Receiver<PortalRequest>,
    snapshots: Arc<Mutex<Option<TelemetrySnapshot>>>,
}

fn spawn_control_loop(mut control: ControlLoop) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("control loop is not watched: {err:#}");
            }
            loop {
                let started = Instant::now();
                feed_watchdog();
                if control.step() {
                    restart(&mut control.board.transport, &control.namespace);
                }
                let spent = started.elapsed();
                thread::sleep(Duration::from_millis(TICK_MS).saturating_sub(spent));
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

impl ControlLoop {
    /// One tick. Returns true when the device should restart.
    fn step(&mut self) -> bool {
        let now_ms = monotonic_ms();

        while let Ok(payload) = self.commands.try_recv() {
            self.device.enqueue_command(payload);
        }

        let mut restart = false;
        while let Ok(request) = self.requests.try_recv() {
            match request {
                PortalRequest::Reconfigure(network) => {
                    if let Err(err) =
                        self.device
                            .reconfigure_network(network, now_ms, &mut self.board.link)
                    {
                        warn!("portal network update rejected: {err}");
                    }
                }
                PortalRequest::Restart => restart = true,
            }
        }

        if self.session_fresh.swap(false, Ordering::Relaxed) {
            self.board.transport.resume_session(&self.namespace);
        }

        let now = Now {
            mono_ms: now_ms,
            local: wall_clock(self.timezone),
        };
        let report = self.device.tick(now, &mut self.board);

        match self.snapshots.lock() {
            Ok(mut slot) => *slot = Some(self.device.snapshot()),
            Err(_) => warn!("status snapshot lock poisoned"),
        }

        report.reboot_requested || restart
    }
}

fn restart(transport: &mut EspTransport, namespace: &str) -> ! {
    info!("restarting");
    if let Err(err) = transport.publish(
        &availability_topic(namespace),
        AVAILABILITY_OFFLINE.as_bytes(),
        true,
    ) {
        warn!("failed to announce offline status: {err}");
    }
    thread::sleep(Duration::from_millis(500));
    unsafe { esp_idf_svc::sys::esp_restart() }
}

fn create_http_server(
    nvs_store: NvsStore,
    snapshots: Arc<Mutex<Option<TelemetrySnapshot>>>,
    requests: SyncSender<PortalRequest>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/api/status", Method::Get, move |req| {
        let snapshot = snapshots
            .lock()
            .map_err(|_| anyhow!("status snapshot lock poisoned"))?
            .clone();
        match snapshot {
            Some(snapshot) => write_json(req, 200, &snapshot),
            None => write_error(req, 503, "device is starting"),
        }
    })?;

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/network", Method::Get, move |req| {
            let loaded = nvs_store.load_config().unwrap_or_default();
            write_json(req, 200, &build_network_config_view(&loaded.config.network))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler::<anyhow::Error, _>("/api/network", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: NetworkConfigUpdate =
                serde_json::from_slice(&body).context("invalid network payload")?;

            let previous = match nvs_store.load_config() {
                Ok(loaded) => loaded.config.network,
                Err(err) => {
                    warn!("failed to load existing config for update: {err:#}");
                    NetworkConfig::default()
                }
            };
            let network = apply_network_update(&previous, update);
            if let Err(err) = network.validate() {
                return write_error(req, 400, &err.to_string());
            }

            if let Err(err) = nvs_store.save_network(&network) {
                warn!("failed to persist network config update: {err:#}");
                if matches!(err.downcast_ref::<ConfigError>(), Some(ConfigError::Unreadable(_))) {
                    return write_error(req, 409, &format!("{err:#}"));
                }
                return write_error(req, 500, "Failed to persist network settings");
            }
            if requests
                .try_send(PortalRequest::Reconfigure(network.clone()))
                .is_err()
            {
                warn!("control loop busy; network update saved only");
            }

            let payload = NetworkUpdateResponse {
                restart_required: broker_restart_required(&previous, &network),
                network: build_network_config_view(&network),
            };
            write_json(req, 200, &payload)
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/restart", Method::Post, move |req| {
        info!("restart requested from local portal");
        if requests.try_send(PortalRequest::Restart).is_err() {
            return write_error(req, 503, "control loop is not accepting requests");
        }
        write_json(req, 202, &serde_json::json!({ "restarting": true }))
    })?;

    Ok(server)
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    write_json(req, status_code, &serde_json::json!({ "error": message }))
}

impl NvsStore {
    fn load_config(&self) -> anyhow::Result<LoadedConfig> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_CONFIG_CAPACITY];

        Ok(match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            Some(value) => DeviceConfig::from_stored(value.as_bytes()),
            None => LoadedConfig::default(),
        })
    }

    /// Rewrites only the network section; an unparseable stored blob is kept.
    fn save_network(&self, network: &NetworkConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_CONFIG_CAPACITY];

        let existing = nvs
            .get_str(NVS_CONFIG_KEY, &mut buffer)?
            .map(|value| value.as_bytes().to_vec());
        let payload = replace_network_section(existing.as_deref(), network)?;
        nvs.set_str(NVS_CONFIG_KEY, std::str::from_utf8(&payload)?)?;
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn parse_timezone(name: &str) -> Tz {
    name.parse().unwrap_or_else(|_| {
        warn!("unknown timezone `{name}`; reminders will follow UTC");
        chrono_tz::UTC
    })
}

/// Local time once SNTP has set the clock.
fn wall_clock(timezone: Tz) -> Option<DateTime<FixedOffset>> {
    let now = Utc::now();
    if now.year() < CLOCK_VALID_FROM_YEAR {
        return None;
    }
    Some(now.with_timezone(&timezone).fixed_offset())
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
