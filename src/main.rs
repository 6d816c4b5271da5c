//! Application entry point: voice call client.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`AppConfig`] from disk (defaults on first run).
//! 3. Generate this process's peer id.
//! 4. Create the tokio runtime (multi-thread, 2 workers).
//! 5. Build the call components: microphone, speaker, decoder, WebRTC
//!    factory and the authenticated WebSocket connector.
//! 6. Spawn the call controller and ask it to connect.
//! 7. Spawn the mute hotkey listener thread.
//! 8. Run [`eframe::run_native`]; blocks until the window is closed.
//! 9. Hang up and give the controller a moment to close the connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use eframe::egui;
use tokio::sync::mpsc;
use voice_call::{
    app::CallApp,
    audio::{AudioOutputSink, BestEffortDecoder, CaptureSettings, CpalInput, CpalOutput, NullSink},
    call::{new_shared_status, CallCommand, CallComponents, CallController},
    config::{AppConfig, SessionStorage},
    hotkey::{parse_key, HotkeyListener},
    session::RtcPeerFactory,
    signaling::PeerId,
    transport::{TransportConfig, WebSocketConnector},
};

/// How long the controller gets to hang up after the window closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Native options builder
// ---------------------------------------------------------------------------

fn native_options(config: &AppConfig) -> eframe::NativeOptions {
    let mut vp = egui::ViewportBuilder::default()
        .with_decorations(false)
        .with_transparent(true)
        .with_inner_size([320.0, 220.0])
        .with_min_inner_size([280.0, 160.0]);

    if config.ui.always_on_top {
        vp = vp.with_always_on_top();
    }

    if let Some((x, y)) = config.ui.window_position {
        vp = vp.with_position(egui::pos2(x, y));
    }

    eframe::NativeOptions {
        viewport: vp,
        ..Default::default()
    }
}

fn output_sink(config: &AppConfig) -> Arc<dyn AudioOutputSink> {
    match CpalOutput::open(
        config.audio.output_device.clone(),
        config.audio.playback_buffer_secs,
    ) {
        Ok(output) => Arc::new(output),
        Err(e) => {
            log::warn!("Audio output unavailable ({e}); remote audio will not be played");
            Arc::new(NullSink)
        }
    }
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("Voice call client starting up");

    // 2. Configuration
    let config = AppConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });

    // 3. Identity
    let local_peer = PeerId::generate();
    log::info!("Local peer id: {local_peer}");
    let status = new_shared_status(&local_peer);

    // 4. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    // 5. Components
    let peers = RtcPeerFactory::new(config.ice.stun_servers.clone())
        .context("failed to initialise WebRTC")?;
    let connector = WebSocketConnector::new(
        TransportConfig::from_server(&config.server),
        Arc::new(SessionStorage::from_config(&config.server)),
    );
    let components = CallComponents {
        connector: Arc::new(connector),
        peers: Arc::new(peers),
        input: Arc::new(CpalInput::new(config.audio.input_device.clone())),
        capture: CaptureSettings::from(&config.audio),
        decoder: Arc::new(BestEffortDecoder::new(config.audio.wire_sample_rate)),
        sink: output_sink(&config),
    };

    // 6. Call controller
    let (command_tx, command_rx) = mpsc::channel::<CallCommand>(32);
    let controller = CallController::new(local_peer, Arc::clone(&status), components);
    let controller_task = rt.spawn(controller.run(command_rx));
    command_tx
        .try_send(CallCommand::Connect)
        .context("call controller is not accepting commands")?;

    // 7. Mute hotkey
    let hotkey = if config.hotkey.enabled {
        match parse_key(&config.hotkey.mute_key) {
            Some(key) => match HotkeyListener::start(key, command_tx.clone()) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    log::warn!("Hotkey listener unavailable: {e}");
                    None
                }
            },
            None => {
                log::warn!("Unknown mute key {:?}; hotkey disabled", config.hotkey.mute_key);
                None
            }
        }
    } else {
        None
    };

    // 8. UI (blocks until the window is closed)
    let app = CallApp::new(Arc::clone(&status), command_tx.clone(), config.clone());
    let options = native_options(&config);
    let ui_result = eframe::run_native(
        "Voice Call",
        options,
        Box::new(move |_cc| Ok(Box::new(app))),
    );

    // 9. Shutdown: closing every sender ends the controller loop, which
    //    hangs up and closes the transport.
    drop(hotkey);
    drop(command_tx);
    rt.block_on(async {
        if tokio::time::timeout(SHUTDOWN_GRACE, controller_task).await.is_err() {
            log::warn!("Call controller did not stop within {SHUTDOWN_GRACE:?}");
        }
    });
    rt.shutdown_timeout(SHUTDOWN_GRACE);

    ui_result.map_err(|e| anyhow::anyhow!("UI error: {e}"))
}
