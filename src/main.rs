use boost_link::domain::codec::{
    BinaryState, BinaryStateCodec, CommandCodec, ScaledFractionCodec,
};
use boost_link::domain::models::{AppEvent, MessageSeverity};
use boost_link::domain::resources::{BatteryLevel, Led, SteeringWheel, SteeringWheelButton};
use boost_link::domain::settings::SettingsService;
use boost_link::infrastructure::bluetooth::backend::BtleplugRadio;
use boost_link::infrastructure::bluetooth::{
    BluetoothCommand, BluetoothService, ConnectionConfig, RadioLink, Resource,
};
use boost_link::infrastructure::logging::init_logger;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _log_guard = init_logger(&settings.log_settings)?;
    info!("Starting Boost Link (device '{}')", settings.device_name);
    info!("Settings file: {}", settings_service.path().display());

    let (link, radio_commands) = RadioLink::channel();
    let (radio_events_tx, radio_events_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    let mut service = BluetoothService::new(
        ConnectionConfig::from(&settings),
        link,
        radio_events_rx,
        command_rx,
        event_tx,
    );

    let led = Resource::<BinaryStateCodec>::of::<Led>();
    let led_state = Arc::new(Mutex::new(BinaryState::Off));
    {
        let led_state = Arc::clone(&led_state);
        led.on_value_changed(move |value| {
            info!("LED is {}", value);
            *led_state.lock().unwrap_or_else(PoisonError::into_inner) = value;
        });
    }

    let steering_wheel = Resource::<CommandCodec<SteeringWheelButton>>::of::<SteeringWheel>();
    {
        let led = led.clone();
        let led_state = Arc::clone(&led_state);
        steering_wheel.on_value_changed(move |button| {
            info!("Steering wheel: {}", button);
            if button == SteeringWheelButton::Set {
                let next = {
                    let mut state = led_state.lock().unwrap_or_else(PoisonError::into_inner);
                    *state = state.flipped();
                    *state
                };
                if let Err(e) = led.send(&next) {
                    warn!("Could not toggle LED: {}", e);
                }
            }
        });
    }

    let battery = Resource::<ScaledFractionCodec>::of::<BatteryLevel>();
    battery.on_value_changed(|level| info!("Battery level: {:.2}", level));

    service.register(led);
    service.register(steering_wheel);
    service.register(battery);

    let radio = BtleplugRadio::start(radio_commands, radio_events_tx).await?;

    if settings.auto_scan {
        command_tx.send(BluetoothCommand::StartScan)?;
    }

    let service_task = tokio::spawn(service.run());

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(AppEvent::ConnectionStatus(status)) => info!("Connection status: {:?}", status),
                Some(AppEvent::LogMessage(msg)) => match msg.severity {
                    MessageSeverity::Error => error!("{}", msg.message),
                    MessageSeverity::Warning => warn!("{}", msg.message),
                    MessageSeverity::Info | MessageSeverity::Success => info!("{}", msg.message),
                },
                None => break,
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    // The service may already be gone if its channels closed
    let _ = command_tx.send(BluetoothCommand::Shutdown);
    let manager = service_task.await?;
    info!("Stopped in state {:?}", manager.state());
    radio.abort();

    Ok(())
}
