//! Global mute hotkey, backed by `rdev`.
//!
//! `rdev::listen()` is a blocking OS-level call, so [`HotkeyListener::start`]
//! runs it on a dedicated thread and forwards [`CallCommand::ToggleMute`] to
//! the call controller each time the configured key goes down.
//!
//! ```no_run
//! use tokio::sync::mpsc;
//! use voice_call::hotkey::{parse_key, HotkeyListener};
//!
//! let (tx, _rx) = mpsc::channel(16);
//! let key = parse_key("F8").expect("unknown key");
//! let _listener = HotkeyListener::start(key, tx).expect("hotkey thread");
//! ```
//!
//! [`CallCommand::ToggleMute`]: crate::call::CallCommand::ToggleMute

pub mod listener;

pub use listener::{HotkeyListener, KeyLatch};

use rdev::Key;

// ---------------------------------------------------------------------------
// parse_key
// ---------------------------------------------------------------------------

/// Parse a key name from the config file.
///
/// Accepts F1–F12, a handful of named keys and single ASCII letters in
/// either case.  `None` for anything else.
pub fn parse_key(name: &str) -> Option<Key> {
    const FUNCTION_KEYS: [Key; 12] = [
        Key::F1,
        Key::F2,
        Key::F3,
        Key::F4,
        Key::F5,
        Key::F6,
        Key::F7,
        Key::F8,
        Key::F9,
        Key::F10,
        Key::F11,
        Key::F12,
    ];
    const LETTERS: [Key; 26] = [
        Key::KeyA,
        Key::KeyB,
        Key::KeyC,
        Key::KeyD,
        Key::KeyE,
        Key::KeyF,
        Key::KeyG,
        Key::KeyH,
        Key::KeyI,
        Key::KeyJ,
        Key::KeyK,
        Key::KeyL,
        Key::KeyM,
        Key::KeyN,
        Key::KeyO,
        Key::KeyP,
        Key::KeyQ,
        Key::KeyR,
        Key::KeyS,
        Key::KeyT,
        Key::KeyU,
        Key::KeyV,
        Key::KeyW,
        Key::KeyX,
        Key::KeyY,
        Key::KeyZ,
    ];

    let named = match name {
        "Escape" | "Esc" => Some(Key::Escape),
        "Space" => Some(Key::Space),
        "Pause" => Some(Key::Pause),
        "ScrollLock" => Some(Key::ScrollLock),
        "PrintScreen" => Some(Key::PrintScreen),
        "Insert" => Some(Key::Insert),
        "Home" => Some(Key::Home),
        "End" => Some(Key::End),
        _ => None,
    };
    if named.is_some() {
        return named;
    }

    if let Some(n) = name.strip_prefix('F').and_then(|n| n.parse::<usize>().ok()) {
        return n.checked_sub(1).and_then(|i| FUNCTION_KEYS.get(i)).copied();
    }

    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => {
            let index = (c.to_ascii_uppercase() as u8 - b'A') as usize;
            LETTERS.get(index).copied()
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
