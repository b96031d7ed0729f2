use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::hotkey::{parse_hotkey, Hotkey, HotkeyParseError};
use crate::window::SurfaceEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotkeyRegistration {
    Native(i32),
    Noop(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HotkeyRuntimeError {
    #[error("invalid hotkey: {0}")]
    InvalidHotkey(#[from] HotkeyParseError),
    #[error("hotkey registration failed: {0}")]
    RegistrationFailed(String),
    #[error("hotkey event loop failed: {0}")]
    EventLoopFailed(String),
    #[error("global hotkeys are not supported on this platform")]
    UnsupportedPlatform,
}

pub trait HotkeyRegistrar: Send {
    fn register(&mut self, hotkey: &Hotkey) -> Result<HotkeyRegistration, HotkeyRuntimeError>;
    fn unregister(&mut self, registration: &HotkeyRegistration) -> Result<(), HotkeyRuntimeError>;
}

/// Records registrations in shared state so tests can observe them after the
/// registrar has been handed to a dispatcher.
#[derive(Debug, Clone, Default)]
pub struct MockHotkeyRegistrar {
    active: Arc<Mutex<Vec<String>>>,
    reject: bool,
}

impl MockHotkeyRegistrar {
    pub fn rejecting() -> Self {
        Self {
            active: Arc::default(),
            reject: true,
        }
    }

    pub fn active(&self) -> Vec<String> {
        self.active.lock().clone()
    }
}

impl HotkeyRegistrar for MockHotkeyRegistrar {
    fn register(&mut self, hotkey: &Hotkey) -> Result<HotkeyRegistration, HotkeyRuntimeError> {
        let canonical = hotkey.to_string();
        if self.reject {
            return Err(HotkeyRuntimeError::RegistrationFailed(format!(
                "'{canonical}' is already taken"
            )));
        }
        self.active.lock().push(canonical.clone());
        Ok(HotkeyRegistration::Noop(canonical))
    }

    fn unregister(&mut self, registration: &HotkeyRegistration) -> Result<(), HotkeyRuntimeError> {
        if let HotkeyRegistration::Noop(canonical) = registration {
            self.active.lock().retain(|active| active != canonical);
        }
        Ok(())
    }
}

#[cfg(not(target_os = "windows"))]
#[derive(Debug, Default)]
pub struct NoopHotkeyRegistrar;

#[cfg(not(target_os = "windows"))]
impl HotkeyRegistrar for NoopHotkeyRegistrar {
    fn register(&mut self, hotkey: &Hotkey) -> Result<HotkeyRegistration, HotkeyRuntimeError> {
        tracing::info!(%hotkey, "global hotkeys unavailable on this platform, trigger must be posted manually");
        Ok(HotkeyRegistration::Noop(hotkey.to_string()))
    }

    fn unregister(&mut self, _registration: &HotkeyRegistration) -> Result<(), HotkeyRuntimeError> {
        Ok(())
    }
}

#[cfg(target_os = "windows")]
pub struct WindowsHotkeyRegistrar {
    next_id: i32,
}

#[cfg(target_os = "windows")]
impl Default for WindowsHotkeyRegistrar {
    fn default() -> Self {
        Self { next_id: 1 }
    }
}

#[cfg(target_os = "windows")]
impl HotkeyRegistrar for WindowsHotkeyRegistrar {
    fn register(&mut self, hotkey: &Hotkey) -> Result<HotkeyRegistration, HotkeyRuntimeError> {
        use windows_sys::Win32::UI::Input::KeyboardAndMouse::{
            RegisterHotKey, MOD_ALT, MOD_CONTROL, MOD_NOREPEAT, MOD_SHIFT, MOD_WIN, VK_F1,
            VK_SPACE,
        };

        use crate::hotkey::Modifier;

        let mut modifiers = MOD_NOREPEAT;
        for modifier in &hotkey.modifiers {
            modifiers |= match modifier {
                Modifier::Ctrl => MOD_CONTROL,
                Modifier::Alt => MOD_ALT,
                Modifier::Shift => MOD_SHIFT,
                Modifier::Win => MOD_WIN,
            };
        }

        let vk: u32 = match hotkey.key.as_str() {
            "Space" => VK_SPACE as u32,
            key if key.len() == 1 => key.as_bytes()[0] as u32,
            key => match key.strip_prefix('F').and_then(|n| n.parse::<u32>().ok()) {
                Some(n) => VK_F1 as u32 + n - 1,
                None => {
                    return Err(HotkeyRuntimeError::RegistrationFailed(format!(
                        "no virtual key for '{key}'"
                    )))
                }
            },
        };

        let id = self.next_id;
        self.next_id += 1;

        let ok = unsafe { RegisterHotKey(std::ptr::null_mut(), id, modifiers, vk) };
        if ok == 0 {
            return Err(HotkeyRuntimeError::RegistrationFailed(format!(
                "RegisterHotKey failed for '{hotkey}'"
            )));
        }
        Ok(HotkeyRegistration::Native(id))
    }

    fn unregister(&mut self, registration: &HotkeyRegistration) -> Result<(), HotkeyRuntimeError> {
        use windows_sys::Win32::UI::Input::KeyboardAndMouse::UnregisterHotKey;

        if let HotkeyRegistration::Native(id) = registration {
            let ok = unsafe { UnregisterHotKey(std::ptr::null_mut(), *id) };
            if ok == 0 {
                return Err(HotkeyRuntimeError::RegistrationFailed(format!(
                    "UnregisterHotKey failed for id {id}"
                )));
            }
        }
        Ok(())
    }
}

pub fn default_hotkey_registrar() -> Box<dyn HotkeyRegistrar> {
    #[cfg(target_os = "windows")]
    {
        Box::new(WindowsHotkeyRegistrar::default())
    }

    #[cfg(not(target_os = "windows"))]
    {
        Box::new(NoopHotkeyRegistrar)
    }
}

/// Owns the single global trigger for the process.
///
/// Registration happens in [`HotkeyDispatcher::register`]; dropping the
/// dispatcher unregisters, so every shutdown path releases the chord.
pub struct HotkeyDispatcher {
    hotkey: Hotkey,
    registration: Option<HotkeyRegistration>,
    registrar: Box<dyn HotkeyRegistrar>,
    events: mpsc::UnboundedSender<SurfaceEvent>,
}

impl HotkeyDispatcher {
    pub fn register(
        hotkey: &str,
        mut registrar: Box<dyn HotkeyRegistrar>,
        events: mpsc::UnboundedSender<SurfaceEvent>,
    ) -> Result<Self, HotkeyRuntimeError> {
        let hotkey = parse_hotkey(hotkey)?;
        let registration = registrar.register(&hotkey)?;
        tracing::info!(%hotkey, ?registration, "global hotkey registered");
        Ok(Self {
            hotkey,
            registration: Some(registration),
            registrar,
            events,
        })
    }

    pub fn hotkey(&self) -> &Hotkey {
        &self.hotkey
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// Routes a native activation id; ids that are not ours are ignored.
    pub fn dispatch(&self, id: i32) -> bool {
        match self.registration {
            Some(HotkeyRegistration::Native(ours)) if ours == id => self.trigger(),
            _ => false,
        }
    }

    /// Posts one trigger to the coordinator. False once released or when the
    /// coordinator has gone away.
    pub fn trigger(&self) -> bool {
        if self.registration.is_none() {
            return false;
        }
        self.events.send(SurfaceEvent::Trigger).is_ok()
    }

    pub fn release(&mut self) -> Result<(), HotkeyRuntimeError> {
        let Some(registration) = self.registration.take() else {
            return Ok(());
        };
        self.registrar.unregister(&registration)?;
        tracing::info!(hotkey = %self.hotkey, "global hotkey released");
        Ok(())
    }
}

impl Drop for HotkeyDispatcher {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            tracing::warn!(%error, "failed to release global hotkey");
        }
    }
}

#[cfg(target_os = "windows")]
pub fn run_message_loop<F>(mut on_hotkey: F) -> Result<(), HotkeyRuntimeError>
where
    F: FnMut(i32),
{
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        DispatchMessageW, GetMessageW, TranslateMessage, MSG, WM_HOTKEY,
    };

    let mut msg: MSG = unsafe { std::mem::zeroed() };
    loop {
        let status = unsafe { GetMessageW(&mut msg, std::ptr::null_mut(), 0, 0) };
        if status == -1 {
            return Err(HotkeyRuntimeError::EventLoopFailed(
                "GetMessageW returned -1".to_string(),
            ));
        }

        if status == 0 {
            return Ok(());
        }

        if msg.message == WM_HOTKEY {
            on_hotkey(msg.wParam as i32);
        }

        unsafe {
            TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }
}

#[cfg(not(target_os = "windows"))]
pub fn run_message_loop<F>(_on_hotkey: F) -> Result<(), HotkeyRuntimeError>
where
    F: FnMut(i32),
{
    Err(HotkeyRuntimeError::UnsupportedPlatform)
}
