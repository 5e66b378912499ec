use std::fs;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use super::{RebootOptions, RunOptions, Session, SessionParts};
use crate::app::adb::runner::CancelToken;
use crate::app::config::DeviceConfig;
use crate::app::error::{
    ERR_BOOT_TIMEOUT, ERR_CONNECT, ERR_POWER, ERR_PROPERTY_MISMATCH, ERR_REBOOT, ERR_SHUTDOWN,
    ERR_VALIDATION,
};
use crate::app::logger::{command_spawner, DeviceLogger};
use crate::app::metrics::{
    CampaignMetrics, CounterMetrics, BOOT_FAILURE_COUNT, UNEXPECTED_REBOOT_COUNT,
    WATCHDOG_DISCONNECT_COUNT,
};
use crate::app::models::{BootMode, ConnectionState, SessionState};
use crate::app::testing::{FakeDevice, FakeMode};
use crate::app::watchdog::WatchdogSettings;

const SERIAL: &str = "R58M12";

struct Bench {
    session: Session,
    device: FakeDevice,
    metrics: Arc<CounterMetrics>,
    dir: TempDir,
}

fn fast_config() -> DeviceConfig {
    DeviceConfig {
        serial_number: SERIAL.to_string(),
        boot_timeout_s: 2,
        settle_down_duration_s: 0,
        soft_shutdown_duration_s: 1,
        hard_shutdown_duration_s: 0,
        soft_shutdown_settle_down_duration_s: 0,
        adb_connect_timeout_s: 1,
        adb_root_timeout_s: 1,
        default_timeout_s: 5,
        boot_poll_interval_ms: 5,
        power_settle_duration_ms: 0,
        boot_mode_retries: 2,
        boot_mode_backoff_ms: 1,
        at_command_priming_delay_ms: 0,
        write_logcat: false,
        ..DeviceConfig::default()
    }
}

fn bench_with(config: DeviceConfig, log_script: &str) -> Bench {
    let device = FakeDevice::new(SERIAL);
    let metrics = Arc::new(CounterMetrics::new());
    let dir = TempDir::new().expect("tmp");
    let logger = DeviceLogger::new(
        command_spawner(
            "sh".to_string(),
            vec!["-c".to_string(), log_script.to_string()],
            "trace-session".to_string(),
        ),
        1024 * 1024,
        2,
        "trace-session",
    );
    let session = Session::with_parts(SessionParts {
        config,
        transport: Arc::new(device.transport()),
        power: Some(Arc::new(device.power())),
        metrics: metrics.clone(),
        connection_lock: Arc::new(Mutex::new(())),
        logger,
        watchdog: WatchdogSettings::new(Duration::from_millis(10), 4, Duration::from_secs(60))
            .with_probe_timeout(Duration::from_millis(200)),
        report_dir: dir.path().to_path_buf(),
        trace_id: "trace-session".to_string(),
    });
    Bench {
        session,
        device,
        metrics,
        dir,
    }
}

fn bench() -> Bench {
    bench_with(fast_config(), "exec sleep 30")
}

fn booted_bench() -> Bench {
    let bench = bench();
    bench
        .session
        .switch_on(None, None, false)
        .expect("switch on");
    bench
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn cold_boot_connects_and_leaves_breadcrumbs() {
    let bench = booted_bench();
    let session = &bench.session;

    assert!(session.is_booted());
    assert!(session.is_connected());
    assert_eq!(session.session_state(), SessionState::Connected);
    assert_eq!(bench.device.mode(), FakeMode::Mos);
    assert!(bench.device.usb_connected());
    assert_eq!(session.get_boot_mode(), BootMode::Mos);
    assert!(session.is_available());

    let props = session.device_properties().expect("properties loaded");
    assert_eq!(props.board_type, "fakeboard");
    assert_eq!(props.serial_number, SERIAL);
    assert_eq!(props.kernel_version, "5.10.0-fake");

    assert!(session.watchdog_running());
    assert!(wait_until(|| bench
        .device
        .breadcrumbs()
        .iter()
        .any(|line| line.contains("ACS_WD") && line.contains("Alive"))));
}

#[test]
fn switch_on_is_a_no_op_for_a_connected_device() {
    let bench = booted_bench();
    let boots = bench.device.boots();
    let message = bench.session.switch_on(None, None, false).expect("switch on");
    assert_eq!(message, "device already booted");
    assert_eq!(bench.device.boots(), boots);
}

#[test]
fn soft_shutdown_takes_the_device_down() {
    let bench = booted_bench();
    let message = bench.session.switch_off().expect("switch off");

    assert_eq!(message, "soft shutdown");
    assert_eq!(bench.device.mode(), FakeMode::Off);
    assert!(!bench.session.is_booted());
    assert_eq!(bench.session.session_state(), SessionState::Down);
    assert!(!bench.session.watchdog_running());
    assert!(bench.session.device_properties().is_none());
    assert!(bench
        .device
        .commands()
        .iter()
        .any(|command| command == "adb shell reboot -p"));
}

#[test]
fn switch_off_is_a_no_op_when_not_booted() {
    let bench = bench();
    assert_eq!(bench.session.switch_off().expect("switch off"), "device already off");
    assert!(bench.device.power_calls().is_empty());
}

#[test]
fn stubborn_device_fails_both_shutdown_paths() {
    let bench = booted_bench();
    bench.device.set_stubborn(true);

    let err = bench.session.switch_off().expect_err("device stays up");
    assert_eq!(err.code, ERR_SHUTDOWN);
    assert_eq!(bench.session.session_state(), SessionState::Unknown);
    let calls = bench.device.power_calls();
    assert!(calls.iter().any(|call| call == "cut"));
}

#[test]
fn stubborn_soft_shutdown_is_checked_once_after_settling() {
    let mut config = fast_config();
    config.soft_shutdown_duration_s = 5;
    let bench = bench_with(config, "exec sleep 30");
    bench.session.switch_on(None, None, false).expect("switch on");
    bench.device.set_stubborn(true);

    let started = Instant::now();
    let err = bench.session.switch_off().expect_err("device stays up");
    assert_eq!(err.code, ERR_SHUTDOWN);
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn failed_transport_start_is_a_connect_error() {
    let mut config = fast_config();
    config.write_logcat = true;
    let bench = bench_with(config, "exec sleep 30");
    bench.device.set_mode(FakeMode::Mos);
    bench.device.fail_transport_start(true);

    let err = bench.session.connect().expect_err("transport refuses");
    assert_eq!(err.code, ERR_CONNECT);
    assert_eq!(bench.device.starts(), 1);
    assert!(!bench.session.is_connected());
    assert!(!bench.session.logger_running());
    assert!(!bench.session.watchdog_running());
    assert!(bench.session.logcat_file().is_none());

    bench.device.fail_transport_start(false);
    assert!(bench.session.connect().expect("connect"));
    assert_eq!(bench.device.starts(), 2);
    assert!(bench.session.logger_running());
}

#[test]
fn repeated_disconnect_is_harmless() {
    let bench = booted_bench();
    bench.session.disconnect();
    bench.session.disconnect();

    assert_eq!(bench.device.stops(), 2);
    assert_eq!(bench.session.session_state(), SessionState::Alive);
    assert!(!bench.session.watchdog_running());
    assert!(!bench.session.run_cmd("shell echo hi", None, RunOptions::default()).ok);

    assert!(bench.session.connect().expect("reconnect"));
    assert!(bench.session.is_connected());
}

#[test]
fn unexpected_reboot_drops_memoized_properties() {
    let mut config = fast_config();
    config.agent_start_command = "am startservice bench.agent/.Agent".to_string();
    let bench = bench_with(config, "exec sleep 30");
    bench.device.set_prop("persist.bench.mode", "old");
    bench.session.switch_on(None, None, false).expect("switch on");
    assert!(bench.session.agent_started());
    assert_eq!(bench.session.get_property("persist.bench.mode").expect("prop"), "old");
    assert!(wait_until(|| !bench.device.breadcrumbs().is_empty()));

    bench.device.set_prop("persist.bench.mode", "new");
    bench.device.hard_reboot();
    assert!(wait_until(|| bench.metrics.get(UNEXPECTED_REBOOT_COUNT) == 1));

    assert_eq!(bench.session.get_property("persist.bench.mode").expect("prop"), "new");
    assert!(!bench.session.agent_started());
}

#[test]
fn watchdog_counts_reboot_once_then_disconnects() {
    let bench = booted_bench();
    assert!(wait_until(|| !bench.device.breadcrumbs().is_empty()));

    bench.device.hard_reboot();
    assert!(wait_until(|| bench.metrics.get(UNEXPECTED_REBOOT_COUNT) == 1));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(bench.metrics.get(UNEXPECTED_REBOOT_COUNT), 1);

    bench.device.set_mode(FakeMode::Off);
    assert!(wait_until(|| bench.metrics.get(WATCHDOG_DISCONNECT_COUNT) == 1));
    assert!(wait_until(|| bench.session.session_state() == SessionState::Unknown));
    assert!(wait_until(|| !bench.session.watchdog_running()));
    assert_eq!(bench.metrics.get(UNEXPECTED_REBOOT_COUNT), 1);
}

#[test]
fn boot_into_bootloader_is_recovered_once() {
    let bench = bench();
    bench.device.set_power_on_target(FakeMode::Pos);

    bench.session.switch_on(None, None, false).expect("switch on");
    assert_eq!(bench.device.mode(), FakeMode::Mos);
    assert!(bench.session.is_connected());
    assert!(bench
        .device
        .commands()
        .iter()
        .any(|command| command.starts_with("fastboot") && command.ends_with("reboot")));
    assert_eq!(bench.metrics.get(BOOT_FAILURE_COUNT), 0);
}

#[test]
fn boot_that_never_comes_up_times_out() {
    let mut config = fast_config();
    config.boot_timeout_s = 1;
    let bench = bench_with(config, "exec sleep 30");
    bench.device.set_stubborn(true);
    bench.device.set_power_on_target(FakeMode::Off);

    let err = bench.session.switch_on(None, None, false).expect_err("no boot");
    assert_eq!(err.code, ERR_BOOT_TIMEOUT);
    assert!(!bench.session.is_booted());
    assert_eq!(bench.session.session_state(), SessionState::Unknown);
    assert_eq!(bench.metrics.get(BOOT_FAILURE_COUNT), 1);
}

#[test]
fn failed_power_step_is_a_power_error() {
    let bench = bench();
    bench.device.fail_poweron(true);
    let err = bench.session.switch_on(None, None, false).expect_err("poweron fails");
    assert_eq!(err.code, ERR_POWER);
    assert_eq!(bench.session.session_state(), SessionState::Unknown);
}

#[test]
fn negative_boot_timeout_is_rejected_when_strict() {
    let mut config = fast_config();
    config.strict_boot_timeout = true;
    let bench = bench_with(config, "exec sleep 30");
    let err = bench
        .session
        .switch_on(Some(-1), None, false)
        .expect_err("strict timeout");
    assert_eq!(err.code, ERR_VALIDATION);
    assert!(bench.device.power_calls().is_empty());
}

#[test]
fn negative_boot_timeout_falls_back_to_default() {
    let bench = bench();
    bench.session.switch_on(Some(-1), Some(-1), false).expect("switch on");
    assert!(bench.session.is_connected());
}

#[test]
fn commands_are_refused_while_disconnected() {
    let bench = bench();
    let touches = bench.device.touches();
    let outcome = bench.session.run_cmd("adb shell echo hi", None, RunOptions::default());
    assert!(!outcome.ok);
    assert_eq!(bench.device.touches(), touches);
}

#[test]
fn commands_run_once_connected() {
    let bench = booted_bench();
    let outcome = bench.session.run_cmd("adb shell echo hi", None, RunOptions::default());
    assert!(outcome.ok);
    assert_eq!(outcome.output, "hi");
    assert!(bench.session.get_uptime().is_some());
}

#[test]
fn shell_failure_sentinel_downgrades_success() {
    let bench = booted_bench();
    let outcome = bench.session.run_cmd("shell broken", None, RunOptions::default());
    assert!(!outcome.ok);
    assert!(outcome.output.contains("/system/bin/sh"));
}

#[test]
fn cancelled_command_returns_empty_failure() {
    let bench = bench();
    let token = CancelToken::new();
    token.cancel();
    let outcome = bench.session.run_cmd(
        "adb shell echo hi",
        None,
        RunOptions::forced().with_cancel(&token),
    );
    assert!(!outcome.ok);
    assert_eq!(outcome.output, "");
}

#[test]
fn properties_are_memoized_until_reboot() {
    let bench = booted_bench();
    let session = &bench.session;
    assert_eq!(session.get_property("ro.product.board").expect("board"), "fakeboard");

    bench.device.set_prop("ro.product.board", "otherboard");
    assert_eq!(session.get_property("ro.product.board").expect("board"), "fakeboard");

    session.set_property("persist.bench.flag", "1").expect("setprop");
    assert_eq!(bench.device.prop("persist.bench.flag").as_deref(), Some("1"));
    assert_eq!(session.get_property("persist.bench.flag").expect("flag"), "1");

    assert_eq!(
        session.get_property("bad key").expect_err("invalid key").code,
        ERR_VALIDATION
    );
}

#[test]
fn refused_setprop_is_a_mismatch() {
    let bench = booted_bench();
    bench.device.refuse_setprop(true);
    let err = bench
        .session
        .set_property("persist.bench.flag", "1")
        .expect_err("readback differs");
    assert_eq!(err.code, ERR_PROPERTY_MISMATCH);
}

#[test]
fn reboot_walks_through_bootloader_and_back() {
    let bench = booted_bench();
    let options = RebootOptions {
        transition_timeout: Some(Duration::from_secs(2)),
        ..RebootOptions::default()
    };

    let ok = bench
        .session
        .reboot(&[BootMode::Pos, BootMode::Mos], options)
        .expect("reboot");
    assert!(ok);
    assert_eq!(bench.device.mode(), FakeMode::Mos);
    assert!(bench.session.is_connected());

    let commands = bench.device.commands();
    let into_bootloader = commands
        .iter()
        .position(|command| command == "adb reboot bootloader")
        .expect("adb reboot bootloader issued");
    let back_to_main = commands
        .iter()
        .position(|command| command == "fastboot reboot")
        .expect("fastboot reboot issued");
    assert!(into_bootloader < back_to_main);
}

#[test]
fn reboot_into_recovery_is_confirmed() {
    let bench = booted_bench();
    let options = RebootOptions {
        transition_timeout: Some(Duration::from_secs(1)),
        ..RebootOptions::default()
    };
    assert!(bench.session.reboot(&[BootMode::Ros], options).expect("reboot"));
    assert_eq!(bench.device.mode(), FakeMode::Ros);
    assert!(!bench.session.is_booted());
    assert!(!bench.session.watchdog_running());
}

#[test]
fn reboot_from_unknown_mode_fails_unless_skipped() {
    let bench = bench();
    let err = bench
        .session
        .reboot(&[BootMode::Mos], RebootOptions::default())
        .expect_err("unknown mode");
    assert_eq!(err.code, ERR_REBOOT);

    let options = RebootOptions {
        skip_failure: true,
        ..RebootOptions::default()
    };
    assert!(!bench.session.reboot(&[BootMode::Mos], options).expect("skipped"));
}

#[test]
fn push_and_pull_round_trip() {
    let bench = booted_bench();
    let local = bench.dir.path().join("payload.bin");
    fs::write(&local, b"payload").expect("write payload");

    bench
        .session
        .push(&local, "/sdcard/payload.bin", None)
        .expect("push");
    assert_eq!(
        bench.device.remote_file("/sdcard/payload.bin").as_deref(),
        Some(&b"payload"[..])
    );

    let back = bench.dir.path().join("pulled").join("payload.bin");
    bench
        .session
        .pull("/sdcard/payload.bin", &back, None)
        .expect("pull");
    assert_eq!(fs::read(&back).expect("read back"), b"payload");
}

#[test]
fn transfers_require_a_connection() {
    let bench = bench();
    let local = bench.dir.path().join("payload.bin");
    fs::write(&local, b"payload").expect("write payload");
    assert!(bench.session.push(&local, "/sdcard/payload.bin", None).is_err());
}

#[test]
fn screenshot_lands_in_report_dir_and_cleans_up() {
    let bench = booted_bench();
    let path = bench.session.screenshot("home").expect("screenshot");

    assert!(path.starts_with(bench.dir.path().join("screenshots")));
    assert!(fs::read(&path).expect("png").starts_with(b"\x89PNG"));
    let removed = bench
        .device
        .commands()
        .iter()
        .any(|command| command.starts_with("adb shell rm -f /sdcard/home_"));
    assert!(removed);
}

#[test]
fn at_command_goes_to_modem_tty() {
    let bench = booted_bench();
    let outcome = bench.session.send_at_command("AT+CFUN?");
    assert!(outcome.ok);
    assert!(bench
        .device
        .commands()
        .iter()
        .any(|command| command.contains("AT+CFUN?") && command.ends_with("> /dev/gsmtty1")));
}

#[test]
fn enable_adb_root_waits_for_the_shell() {
    let bench = booted_bench();
    assert!(bench.session.enable_adb_root().expect("root"));
    assert!(bench.device.commands().iter().any(|command| command == "adb root"));
}

#[test]
fn get_state_tracks_last_connection() {
    let bench = bench();
    assert_eq!(bench.session.get_state(), ConnectionState::Unknown);
    bench.device.set_mode(FakeMode::Mos);
    assert_eq!(bench.session.get_state(), ConnectionState::Alive);
    assert_eq!(bench.session.last_connection_state(), ConnectionState::Alive);
}

#[test]
#[cfg(unix)]
fn connect_starts_logcat_capture_into_report_dir() {
    let mut config = fast_config();
    config.write_logcat = true;
    let bench = bench_with(config, "echo first line; exec sleep 30");
    bench.session.switch_on(None, None, false).expect("switch on");

    assert!(bench.session.logger_running());
    let file = bench.session.logcat_file().expect("logcat file");
    assert!(file.starts_with(bench.dir.path().join("logcat")));
    assert!(wait_until(|| fs::read_to_string(&file)
        .map(|text| text.contains("first line"))
        .unwrap_or(false)));

    bench.session.disconnect();
    assert!(!bench.session.logger_running());
}

#[test]
fn release_is_idempotent() {
    let bench = booted_bench();
    bench.session.release();
    bench.session.release();

    assert_eq!(bench.session.session_state(), SessionState::Down);
    assert!(!bench.session.watchdog_running());
    assert!(!bench.session.logger_running());
}

/// Scripted `adb` for a network device: the shell only answers while an
/// `adb connect` session is open, and `adb disconnect` closes it.
#[cfg(unix)]
const NETWORK_ADB: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
echo "$*" >> "$dir/calls.log"
case "$1" in
  start-server|kill-server) exit 0 ;;
  connect) touch "$dir/connected"; echo "connected to $2"; exit 0 ;;
  disconnect) rm -f "$dir/connected"; echo "disconnected $2"; exit 0 ;;
  -s) shift 2 ;;
esac
if [ ! -f "$dir/connected" ]; then
  echo "error: device not found" >&2
  exit 1
fi
case "$1 $2" in
  "shell echo alive") echo alive ;;
  "shell getprop sys.boot_completed") echo 1 ;;
  "shell cat /proc/uptime") echo "12.00 36.00" ;;
  "get-state "*) echo device ;;
esac
exit 0
"#;

#[cfg(unix)]
struct NetworkBench {
    session: Session,
    dir: TempDir,
    _listener: std::net::TcpListener,
}

#[cfg(unix)]
impl NetworkBench {
    fn adb_calls(&self, verb: &str) -> usize {
        fs::read_to_string(self.dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .filter(|line| line.split_whitespace().next() == Some(verb))
            .count()
    }
}

#[cfg(unix)]
fn network_bench() -> NetworkBench {
    use std::os::unix::fs::PermissionsExt;

    use crate::app::transport::{AdbCli, NetworkTransport};

    let dir = TempDir::new().expect("tmp");
    let script = dir.path().join("adb");
    fs::write(&script, NETWORK_ADB).expect("write adb");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let mut config = fast_config();
    config.boot_timeout_s = 5;
    config.adb_path = script.to_string_lossy().to_string();
    config.fastboot_path = "true".to_string();
    let transport = NetworkTransport::new(
        "127.0.0.1",
        port,
        AdbCli::from_config(&config, "trace-net"),
        1,
        1,
    );
    let session = Session::with_parts(SessionParts {
        config,
        transport: Arc::new(transport),
        power: None,
        metrics: Arc::new(CounterMetrics::new()),
        connection_lock: Arc::new(Mutex::new(())),
        logger: DeviceLogger::new(
            command_spawner("true".to_string(), Vec::new(), "trace-net".to_string()),
            1024,
            1,
            "trace-net",
        ),
        watchdog: WatchdogSettings::new(Duration::from_millis(50), 4, Duration::from_secs(60))
            .with_probe_timeout(Duration::from_secs(2)),
        report_dir: dir.path().to_path_buf(),
        trace_id: "trace-net".to_string(),
    });
    NetworkBench {
        session,
        dir,
        _listener: listener,
    }
}

#[test]
#[cfg(unix)]
fn network_reboot_reopens_the_link() {
    let bench = network_bench();
    assert!(bench.session.connect().expect("connect"));
    assert_eq!(bench.adb_calls("connect"), 1);

    let options = RebootOptions {
        transition_timeout: Some(Duration::from_secs(5)),
        ..RebootOptions::default()
    };
    assert!(bench.session.reboot(&[BootMode::Mos], options).expect("reboot"));
    assert!(bench.session.is_connected());
    assert!(bench.adb_calls("disconnect") >= 1);
    assert!(bench.adb_calls("connect") >= 2);
    bench.session.release();
}

#[test]
#[cfg(unix)]
fn network_wait_for_ready_after_disconnect() {
    let bench = network_bench();
    assert!(bench.session.connect().expect("connect"));
    bench.session.disconnect();
    assert_eq!(bench.session.get_state(), ConnectionState::Unknown);

    bench.session.wait_for_ready(Some(5), Some(0)).expect("ready");
    assert_eq!(bench.session.get_state(), ConnectionState::Alive);
    assert_eq!(bench.adb_calls("connect"), 2);
    bench.session.release();
}
