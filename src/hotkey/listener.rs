//! Dedicated OS-thread hotkey listener using `rdev::listen`.
//!
//! `rdev::listen` has no graceful shutdown API.  Dropping the
//! [`HotkeyListener`] releases its command sender so the callback ignores
//! further events and the controller's channel can close; the thread itself
//! stays blocked in rdev until the process exits.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::call::CallCommand;

// ---------------------------------------------------------------------------
// KeyLatch
// ---------------------------------------------------------------------------

/// Turns raw key events into one toggle per physical press.
///
/// Holding the key produces repeated `KeyPress` events on most platforms;
/// only the first one counts until the key is released.
#[derive(Debug)]
pub struct KeyLatch {
    key: rdev::Key,
    held: bool,
}

impl KeyLatch {
    pub fn new(key: rdev::Key) -> Self {
        Self { key, held: false }
    }

    /// `true` when `event` should toggle mute.
    pub fn on_event(&mut self, event: &rdev::EventType) -> bool {
        match *event {
            rdev::EventType::KeyPress(k) if k == self.key => !std::mem::replace(&mut self.held, true),
            rdev::EventType::KeyRelease(k) if k == self.key => {
                self.held = false;
                false
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// HotkeyListener
// ---------------------------------------------------------------------------

type SharedSender = Arc<Mutex<Option<mpsc::Sender<CallCommand>>>>;

pub struct HotkeyListener {
    sender: SharedSender,
    _thread: std::thread::JoinHandle<()>,
}

impl HotkeyListener {
    /// Spawn the listener thread.  Each press of `key` sends
    /// [`CallCommand::ToggleMute`] on `tx`.
    pub fn start(key: rdev::Key, tx: mpsc::Sender<CallCommand>) -> std::io::Result<Self> {
        let sender: SharedSender = Arc::new(Mutex::new(Some(tx)));
        let callback_sender = Arc::clone(&sender);

        let thread = std::thread::Builder::new()
            .name("hotkey-listener".into())
            .spawn(move || {
                let mut latch = KeyLatch::new(key);
                let result = rdev::listen(move |event| {
                    if !latch.on_event(&event.event_type) {
                        return;
                    }
                    let tx = match callback_sender.lock() {
                        Ok(guard) => guard.clone(),
                        Err(_) => None,
                    };
                    if let Some(tx) = tx {
                        // blocking_send is fine here: this is not a runtime thread.
                        let _ = tx.blocking_send(CallCommand::ToggleMute);
                    }
                });

                if let Err(e) = result {
                    log::error!("hotkey-listener: rdev::listen exited with error: {:?}", e);
                }
            })?;

        log::info!("hotkey: {key:?} toggles mute");
        Ok(Self {
            sender,
            _thread: thread,
        })
    }
}

impl Drop for HotkeyListener {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
