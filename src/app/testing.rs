//! In-memory device used by unit tests: one shared state behind a scripted
//! transport and a scripted power controller.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::app::adb::command::DeviceCommand;
use crate::app::equipment::PowerController;
use crate::app::error::AppError;
use crate::app::models::DeviceIdentity;
use crate::app::transport::{CmdRequest, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeMode {
    Mos,
    Pos,
    Ros,
    Cos,
    Off,
}

struct FakeState {
    serial: String,
    mode: FakeMode,
    power_on_target: FakeMode,
    boot_completed_delay: u32,
    boot_completed_countdown: u32,
    props: HashMap<String, String>,
    uptime: f64,
    refuse_setprop: bool,
    stubborn: bool,
    fail_start: bool,
    fail_poweron: bool,
    running: bool,
    plugged: bool,
    usb_connected: bool,
    commands: Vec<String>,
    touches: usize,
    breadcrumbs: Vec<String>,
    power_calls: Vec<String>,
    remote_files: HashMap<String, Vec<u8>>,
    starts: usize,
    stops: usize,
    boots: usize,
}

#[derive(Clone)]
pub struct FakeDevice {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDevice {
    pub fn new(serial: &str) -> Self {
        let mut props = HashMap::new();
        props.insert("ro.serialno".to_string(), format!("HW-{serial}"));
        props.insert("ro.product.board".to_string(), "fakeboard".to_string());
        props.insert("ro.build.type".to_string(), "userdebug".to_string());
        props.insert("ro.build.description".to_string(), "fake-userdebug 14 UQ1A".to_string());
        props.insert("ro.product.name".to_string(), "fakephone".to_string());
        props.insert("ril.barcode".to_string(), "490154203237518".to_string());
        props.insert("gsm.version.baseband".to_string(), "bb-1.0".to_string());
        props.insert("ro.build.version.incremental".to_string(), "1042".to_string());
        Self {
            state: Arc::new(Mutex::new(FakeState {
                serial: serial.to_string(),
                mode: FakeMode::Off,
                power_on_target: FakeMode::Mos,
                boot_completed_delay: 0,
                boot_completed_countdown: 0,
                props,
                uptime: 100.0,
                refuse_setprop: false,
                stubborn: false,
                fail_start: false,
                fail_poweron: false,
                running: false,
                plugged: true,
                usb_connected: true,
                commands: Vec::new(),
                touches: 0,
                breadcrumbs: Vec::new(),
                power_calls: Vec::new(),
                remote_files: HashMap::new(),
                starts: 0,
                stops: 0,
                boots: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn transport(&self) -> FakeTransport {
        let serial = self.lock().serial.clone();
        FakeTransport {
            device: self.clone(),
            identity: DeviceIdentity::Usb { serial },
        }
    }

    pub fn power(&self) -> FakePower {
        FakePower {
            device: self.clone(),
        }
    }

    pub fn mode(&self) -> FakeMode {
        self.lock().mode
    }

    pub fn set_mode(&self, mode: FakeMode) {
        self.lock().mode = mode;
    }

    /// Mode the device lands in after a power-on press.
    pub fn set_power_on_target(&self, mode: FakeMode) {
        self.lock().power_on_target = mode;
    }

    /// Number of `sys.boot_completed` reads answering "0" after each boot.
    pub fn set_boot_completed_after(&self, reads: u32) {
        let mut state = self.lock();
        state.boot_completed_delay = reads;
        state.boot_completed_countdown = reads;
    }

    pub fn set_prop(&self, key: &str, value: &str) {
        self.lock().props.insert(key.to_string(), value.to_string());
    }

    pub fn prop(&self, key: &str) -> Option<String> {
        self.lock().props.get(key).cloned()
    }

    pub fn refuse_setprop(&self, refuse: bool) {
        self.lock().refuse_setprop = refuse;
    }

    /// Ignores soft shutdown and power cuts.
    pub fn set_stubborn(&self, stubborn: bool) {
        self.lock().stubborn = stubborn;
    }

    pub fn fail_transport_start(&self, fail: bool) {
        self.lock().fail_start = fail;
    }

    pub fn fail_poweron(&self, fail: bool) {
        self.lock().fail_poweron = fail;
    }

    /// External reboot the session did not ask for.
    pub fn hard_reboot(&self) {
        let mut state = self.lock();
        state.uptime = 0.0;
        state.boots += 1;
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn touches(&self) -> usize {
        self.lock().touches
    }

    pub fn breadcrumbs(&self) -> Vec<String> {
        self.lock().breadcrumbs.clone()
    }

    pub fn power_calls(&self) -> Vec<String> {
        self.lock().power_calls.clone()
    }

    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().remote_files.get(path).cloned()
    }

    pub fn starts(&self) -> usize {
        self.lock().starts
    }

    pub fn stops(&self) -> usize {
        self.lock().stops
    }

    pub fn boots(&self) -> usize {
        self.lock().boots
    }

    pub fn usb_connected(&self) -> bool {
        self.lock().usb_connected
    }
}

fn boot_into(state: &mut FakeState, mode: FakeMode) {
    state.mode = mode;
    state.uptime = 1.0;
    state.boots += 1;
    state.boot_completed_countdown = state.boot_completed_delay;
}

fn shell_available(mode: FakeMode) -> bool {
    matches!(mode, FakeMode::Mos | FakeMode::Cos)
}

pub struct FakeTransport {
    device: FakeDevice,
    identity: DeviceIdentity,
}

impl FakeTransport {
    fn interpret(&self, state: &mut FakeState, command: &DeviceCommand) -> Result<String, String> {
        let args = command.args();
        if command.is_bootloader() {
            let in_bootloader = state.mode == FakeMode::Pos;
            return match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
                ["devices"] if in_bootloader => Ok(format!("{}\tfastboot\n", state.serial)),
                ["devices"] => Ok(String::new()),
                _ if !in_bootloader => Err("< waiting for any device >".to_string()),
                ["reboot"] => {
                    boot_into(state, FakeMode::Mos);
                    Ok("Rebooting".to_string())
                }
                ["reboot-bootloader"] => {
                    boot_into(state, FakeMode::Pos);
                    Ok("Rebooting into bootloader".to_string())
                }
                ["reboot", "recovery"] => {
                    boot_into(state, FakeMode::Ros);
                    Ok("Rebooting into recovery".to_string())
                }
                _ => Ok("OKAY".to_string()),
            };
        }

        match args.first().map(String::as_str) {
            Some("shell") => {
                if !shell_available(state.mode) {
                    return Err(format!("error: device '{}' not found", state.serial));
                }
                let line = args.get(1).map(String::as_str).unwrap_or("");
                Ok(self.shell(state, line))
            }
            Some("get-state") => match state.mode {
                FakeMode::Mos | FakeMode::Cos => Ok("device\n".to_string()),
                FakeMode::Ros => Ok("recovery\n".to_string()),
                FakeMode::Pos | FakeMode::Off => Err("error: no devices/emulators found".to_string()),
            },
            Some("reboot") => {
                if state.mode == FakeMode::Off || state.mode == FakeMode::Pos {
                    return Err("error: no devices/emulators found".to_string());
                }
                let target = match args.get(1).map(String::as_str) {
                    Some("bootloader") => FakeMode::Pos,
                    Some("recovery") => FakeMode::Ros,
                    _ => FakeMode::Mos,
                };
                boot_into(state, target);
                Ok(String::new())
            }
            Some("root") => {
                if shell_available(state.mode) {
                    Ok("restarting adbd as root".to_string())
                } else {
                    Err("error: no devices/emulators found".to_string())
                }
            }
            _ => Ok(String::new()),
        }
    }

    fn shell(&self, state: &mut FakeState, line: &str) -> String {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["echo", "alive"] => "alive\n".to_string(),
            ["getprop"] => {
                let mut keys: Vec<&String> = state.props.keys().collect();
                keys.sort();
                keys.iter()
                    .map(|key| format!("[{key}]: [{}]\n", state.props[*key]))
                    .collect()
            }
            ["getprop", "sys.boot_completed"] => {
                if state.mode != FakeMode::Mos {
                    return "\n".to_string();
                }
                if state.boot_completed_countdown > 0 {
                    state.boot_completed_countdown -= 1;
                    return "0\n".to_string();
                }
                "1\n".to_string()
            }
            ["getprop", "ro.bootmode"] => {
                if state.mode == FakeMode::Cos {
                    "charger\n".to_string()
                } else {
                    "normal\n".to_string()
                }
            }
            ["getprop", key] => format!("{}\n", state.props.get(*key).cloned().unwrap_or_default()),
            ["setprop", key, value] => {
                if !state.refuse_setprop {
                    state
                        .props
                        .insert(key.to_string(), value.trim_matches('\'').to_string());
                }
                String::new()
            }
            ["cat", "/proc/uptime"] => {
                state.uptime += 1.0;
                format!("{:.2} {:.2}\r\n", state.uptime, state.uptime * 3.0)
            }
            ["cat", "/proc/version"] => {
                "Linux version 5.10.0-fake (builder@host) #1 SMP PREEMPT\n".to_string()
            }
            ["log", ..] => {
                state.breadcrumbs.push(line.to_string());
                String::new()
            }
            ["reboot", "-p"] => {
                if !state.stubborn {
                    state.mode = FakeMode::Off;
                }
                String::new()
            }
            ["screencap", "-p", path] => {
                state
                    .remote_files
                    .insert(path.to_string(), b"\x89PNG\r\n\x1a\nfake".to_vec());
                String::new()
            }
            ["rm", "-f", path] => {
                state.remote_files.remove(*path);
                String::new()
            }
            ["am", "start", "-a", action, ..] if action.ends_with("REQUEST_SHUTDOWN") => {
                boot_into(state, FakeMode::Cos);
                String::new()
            }
            ["broken"] => "exec '/system/bin/sh' failed: No such file or directory".to_string(),
            ["echo", rest @ ..] => format!("{}\r\n", rest.join(" ")),
            _ => String::new(),
        }
    }
}

impl Transport for FakeTransport {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn start(&self, _timeout: Duration) -> Result<(), AppError> {
        let mut state = self.device.lock();
        state.starts += 1;
        if state.fail_start {
            return Err(AppError::transport_startup("fake daemon refused to start", "fake"));
        }
        state.running = true;
        Ok(())
    }

    fn stop(&self) -> Result<(), AppError> {
        let mut state = self.device.lock();
        state.stops += 1;
        state.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.device.lock().running
    }

    fn run_cmd(&self, command: &DeviceCommand, request: &CmdRequest<'_>) -> Result<String, AppError> {
        let mut state = self.device.lock();
        state.touches += 1;
        if request.cancel.map(|token| token.is_cancelled()).unwrap_or(false) {
            return Err(AppError::cancelled("fake"));
        }
        if !request.force && !state.running {
            return Err(AppError::transport("transport daemon is not running", "fake"));
        }
        let program = if command.is_bootloader() { "fastboot" } else { "adb" };
        state
            .commands
            .push(format!("{program} {}", command.args().join(" ")));
        let result = self.interpret(&mut state, command);
        match result {
            Ok(output) if request.wait_for_response => Ok(output),
            Ok(_) => Ok(String::new()),
            Err(message) => Err(AppError::transport(message, "fake")),
        }
    }

    fn push(&self, local: &Path, remote: &str, _timeout: Option<Duration>) -> Result<String, AppError> {
        let bytes = fs::read(local)
            .map_err(|err| AppError::transport(format!("cannot stat '{}': {err}", local.display()), "fake"))?;
        let mut state = self.device.lock();
        if !shell_available(state.mode) {
            return Err(AppError::transport("error: no devices/emulators found", "fake"));
        }
        state.remote_files.insert(remote.to_string(), bytes);
        Ok(format!("{local}: 1 file pushed", local = local.display()))
    }

    fn pull(&self, remote: &str, local: &Path, _timeout: Option<Duration>) -> Result<String, AppError> {
        let bytes = {
            let state = self.device.lock();
            if !shell_available(state.mode) {
                return Err(AppError::transport("error: no devices/emulators found", "fake"));
            }
            state.remote_files.get(remote).cloned().ok_or_else(|| {
                AppError::transport(format!("remote object '{remote}' does not exist"), "fake")
            })?
        };
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::system(err.to_string(), "fake"))?;
        }
        fs::write(local, bytes).map_err(|err| AppError::system(err.to_string(), "fake"))?;
        Ok(format!("{remote}: 1 file pulled"))
    }
}

pub struct FakePower {
    device: FakeDevice,
}

impl FakePower {
    fn record(&self, call: &str) -> MutexGuard<'_, FakeState> {
        let mut state = self.device.lock();
        state.power_calls.push(call.to_string());
        state
    }
}

impl PowerController for FakePower {
    fn connect_usb_host_to_dut(&self) -> bool {
        self.record("connect_usb").usb_connected = true;
        true
    }

    fn disconnect_usb_host_to_dut(&self) -> bool {
        self.record("disconnect_usb").usb_connected = false;
        true
    }

    fn plug_device_power(&self) -> bool {
        self.record("plug").plugged = true;
        true
    }

    fn cut_device_power(&self) -> bool {
        let mut state = self.record("cut");
        state.plugged = false;
        if !state.stubborn {
            state.mode = FakeMode::Off;
        }
        true
    }

    fn poweron_device(&self) -> bool {
        let mut state = self.record("poweron");
        if state.fail_poweron {
            return false;
        }
        if state.plugged && state.mode == FakeMode::Off {
            let target = state.power_on_target;
            boot_into(&mut state, target);
        }
        true
    }

    fn poweroff_device(&self) -> bool {
        let mut state = self.record("poweroff");
        if !state.stubborn {
            state.mode = FakeMode::Off;
        }
        true
    }

    fn release(&self) {
        drop(self.record("release"));
    }
}
