use anyhow::bail;
use joycon2_bridge::domain::models::{BridgeEvent, ConnectionStatus, MessageSeverity};
use joycon2_bridge::domain::settings::SettingsService;
use joycon2_bridge::infrastructure::bluetooth::replay::ReplayTransport;
use joycon2_bridge::infrastructure::bluetooth::{BridgeConfig, BridgeService};
use joycon2_bridge::infrastructure::logging::init_logger;
use joycon2_bridge::infrastructure::virtual_pad::TracingPad;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new()?;
    let _guard = init_logger(&settings.get().log_settings)?;
    info!("Starting Joy-Con 2 bridge");
    info!("Settings file: {}", settings.path().display());

    let Some(capture) = std::env::args_os().nth(1).map(PathBuf::from) else {
        bail!("usage: joycon2-bridge <capture.jsonl>");
    };
    let transport = Arc::new(ReplayTransport::open(&capture)?);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let service = Arc::new(BridgeService::new(
        transport,
        Arc::new(TracingPad::new()),
        event_tx,
        BridgeConfig::from_settings(settings.get()),
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received, shutting down"),
                Err(e) => {
                    warn!("Could not listen for Ctrl-C: {}", e);
                    return;
                }
            }
            cancel.cancel();
        });
    }

    // A capture has one session; stop once every half has left.
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    BridgeEvent::LogMessage(msg) => match msg.severity {
                        MessageSeverity::Error => error!("{}", msg.message),
                        MessageSeverity::Warning => warn!("{}", msg.message),
                        MessageSeverity::Info | MessageSeverity::Success => {
                            info!("{}", msg.message)
                        }
                    },
                    BridgeEvent::RolesChanged(roles) => info!("Roles: {:?}", roles),
                    BridgeEvent::DegradedRoles(true) => warn!("Roles degraded"),
                    BridgeEvent::DegradedRoles(false) => info!("Roles settled"),
                    BridgeEvent::ConnectionStatus(ConnectionStatus::Disconnected) => {
                        info!("All halves disconnected");
                        cancel.cancel();
                    }
                    BridgeEvent::ConnectionStatus(status) => info!("Status: {:?}", status),
                    BridgeEvent::Output(_) => {}
                }
            }
        });
    }

    service.run(cancel).await
}
