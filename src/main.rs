use color_eyre::{eyre::eyre, Result};
use mqttdemo::events::{AppEvent, EventBus};
use mqttdemo::mqtt::mqtt_handler::ConnectionManager;
use mqttdemo::mqtt::service::MessageService;
use mqttdemo::mqtt::transport::RumqttTransport;
use mqttdemo::notification::{AppVisibility, NotificationPolicy, NotificationSlot};
use mqttdemo::persistence::settings_store::{start_reload_task, SettingsStore};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const TRANSPORT_EVENT_CAPACITY: usize = 100;
const SETTINGS_RELOAD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let store = Arc::new(SettingsStore::open_default());
    info!("Loading settings from {}", store.path().display());
    let settings = store.load_or_init().await?;
    let config = settings.connection_config()?;

    let cancel = CancellationToken::new();
    let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_EVENT_CAPACITY);
    // not tied to `cancel`: the transport stops itself after sending DISCONNECT
    let transport = RumqttTransport::new(transport_tx, CancellationToken::new());

    let (notification_tx, notification_rx) = watch::channel(settings.notifications.clone());
    let reload = start_reload_task(
        store.clone(),
        notification_tx,
        SETTINGS_RELOAD_SECS,
        cancel.child_token(),
    );
    // a headless process never has a foreground window
    let visibility = AppVisibility::default();
    let notifier = Arc::new(NotificationSlot::default());
    let policy = NotificationPolicy::new(notification_rx, visibility);

    let bus = EventBus::default();
    let events = bus.subscribe();

    let manager = ConnectionManager::new(config, Box::new(transport), bus, policy, notifier);
    let service = MessageService::create("mqtt", manager, transport_rx, cancel.clone())
        .start()
        .map_err(|e| eyre!("Failed to start message service: {}", e))?;

    info!("Listening for messages, press Ctrl-C to stop");
    tokio::select! {
        _ = render_events(events) => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("Unable to listen for shutdown signal: {}", e);
            }
        }
    }

    let stopped = service.stop().await;
    if let Err(e) = reload.await {
        warn!("Settings reload task failed: {}", e);
    }
    info!("{} stopped", stopped.get_name());
    Ok(())
}

/// Console stand-in for the UI layer.
async fn render_events(mut events: broadcast::Receiver<AppEvent>) {
    loop {
        match events.recv().await {
            Ok(AppEvent::Alert { text }) => info!("[alert] {}", text),
            Ok(AppEvent::ConnectionStatus { connected }) => {
                info!("[status] {}", if connected { "online" } else { "offline" })
            }
            Ok(AppEvent::Message { message }) => {
                info!("[message] {}\n{}", message.timestamp, message.content)
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("UI fell behind, {} events skipped", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
