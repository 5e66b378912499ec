use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::app::models::ConnectionState;

/// Serials listed by `fastboot devices` (`<serial>\tfastboot`).
pub fn parse_fastboot_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let serial = tokens.next()?;
            let state = tokens.next()?;
            if state == "fastboot" || state == "fastbootd" {
                Some(serial.to_string())
            } else {
                None
            }
        })
        .collect()
}

pub fn parse_getprop_map(output: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with('[') {
            continue;
        }
        let Some((key_part, value_part)) = trimmed.split_once("]: [") else {
            continue;
        };
        let key = key_part.trim_start_matches('[').trim();
        let value = value_part.trim_end_matches(']').trim();
        if !key.is_empty() {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

/// First field of `/proc/uptime`. `None` unless the reading is structurally valid.
pub fn parse_uptime(output: &str) -> Option<f64> {
    let first_line = output.lines().map(str::trim).find(|line| !line.is_empty())?;
    let mut fields = first_line.split_whitespace();
    let uptime = fields.next()?.parse::<f64>().ok()?;
    // The idle counter must be present too, otherwise this is not /proc/uptime.
    fields.next()?.parse::<f64>().ok()?;
    if uptime.is_finite() && uptime >= 0.0 {
        Some(uptime)
    } else {
        None
    }
}

pub fn parse_boot_completed(output: &str) -> bool {
    strip_line_endings(output).trim() == "1"
}

/// Maps `adb get-state` output. `device` is not ALIVE on its own: only a
/// successful shell probe proves that, so a device the daemon lists but whose
/// shell refused is reported OFFLINE by the caller.
pub fn parse_get_state(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('*'))
        .map(|line| line.to_lowercase())
}

pub fn connection_state_from_get_state(state: Option<&str>) -> ConnectionState {
    match state {
        Some("device") | Some("offline") | Some("unauthorized") | Some("recovery")
        | Some("sideload") | Some("bootloader") => ConnectionState::Offline,
        _ => ConnectionState::Unknown,
    }
}

pub fn parse_kernel_version(proc_version: &str) -> Option<String> {
    static KERNEL_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = KERNEL_RE
        .get_or_init(|| Regex::new(r"Linux version (\S+)").ok())
        .as_ref()?;
    re.captures(proc_version).map(|caps| caps[1].to_string())
}

/// `adb connect` prints "connected to" or "already connected to" on success,
/// and still exits 0 on "failed to connect".
pub fn parse_connect_output(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("connected to") && !lower.contains("failed") && !lower.contains("unable")
}

pub fn strip_line_endings(output: &str) -> &str {
    output.trim_end_matches(['\r', '\n'])
}
