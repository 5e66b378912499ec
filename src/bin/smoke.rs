use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use devbench_lib::app::config::{load_config, load_config_from_path, DeviceConfig};
use devbench_lib::app::context::BenchContext;
use devbench_lib::app::logging::init_logging_for;
use devbench_lib::app::metrics::{
    CampaignMetrics, BOOT_FAILURE_COUNT, UNEXPECTED_REBOOT_COUNT, WATCHDOG_DISCONNECT_COUNT,
};
use devbench_lib::app::models::BootMode;
use devbench_lib::app::session::{RebootOptions, RunOptions, Session};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Args {
    config: Option<PathBuf>,
    serial: Option<String>,
    out_dir: Option<PathBuf>,
    json: bool,
    simple: bool,
    with_reboot: bool,
    keep_on: bool,
}

#[derive(Serialize)]
struct SmokeSummary {
    tool: &'static str,
    status: &'static str,
    trace_id: String,
    device: Option<String>,
    out_dir: String,
    artifacts: HashMap<String, String>,
    metrics: HashMap<String, u64>,
    checks: Vec<SmokeCheck>,
}

#[derive(Serialize)]
struct SmokeCheck {
    name: &'static str,
    status: &'static str, // pass|fail|skip
    duration_ms: u128,
    artifacts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SmokeCheck {
    fn skipped(name: &'static str) -> Self {
        Self {
            name,
            status: "skip",
            duration_ms: 0,
            artifacts: vec![],
            error_code: None,
            error: None,
        }
    }
}

fn parse_args() -> Result<Args, String> {
    let mut config: Option<PathBuf> = None;
    let mut serial = std::env::var("ANDROID_SERIAL")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let mut out_dir: Option<PathBuf> = None;
    let mut json = false;
    let mut simple = false;
    let mut with_reboot = false;
    let mut keep_on = false;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--config requires a value".to_string())?;
                config = Some(PathBuf::from(value));
            }
            "--serial" => {
                serial = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if serial.is_none() {
                    return Err("--serial requires a value".to_string());
                }
            }
            "--out" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--out requires a value".to_string())?;
                out_dir = Some(PathBuf::from(value));
            }
            "--json" => json = true,
            "--simple" => simple = true,
            "--with-reboot" => with_reboot = true,
            "--keep-on" => keep_on = true,
            "-h" | "--help" => {
                return Err(
                    "Usage: cargo run --bin smoke -- [--config PATH] [--serial SERIAL] [--out DIR] [--json] [--simple] [--with-reboot] [--keep-on]\n"
                        .to_string(),
                );
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    Ok(Args {
        config,
        serial,
        out_dir,
        json,
        simple,
        with_reboot,
        keep_on,
    })
}

fn ensure_dir(path: &Path) -> Result<(), String> {
    fs::create_dir_all(path)
        .map_err(|err| format!("Failed to create dir {}: {err}", path.display()))
}

fn run_check<F>(checks: &mut Vec<SmokeCheck>, name: &'static str, f: F) -> Result<(), ()>
where
    F: FnOnce() -> Result<Vec<String>, (String, String)>,
{
    let start = Instant::now();
    match f() {
        Ok(artifacts) => {
            checks.push(SmokeCheck {
                name,
                status: "pass",
                duration_ms: start.elapsed().as_millis(),
                artifacts,
                error_code: None,
                error: None,
            });
            Ok(())
        }
        Err((code, err)) => {
            checks.push(SmokeCheck {
                name,
                status: "fail",
                duration_ms: start.elapsed().as_millis(),
                artifacts: vec![],
                error_code: Some(code),
                error: Some(err),
            });
            Err(())
        }
    }
}

fn emit(summary: &SmokeSummary, json: bool) -> ! {
    let output = if json {
        serde_json::to_string_pretty(summary).unwrap_or_else(|_| "{}".to_string())
    } else {
        let mut text = format!(
            "status: {}\ntrace_id: {}\nout: {}\n",
            summary.status, summary.trace_id, summary.out_dir
        );
        for check in &summary.checks {
            text.push_str(&format!("  {:<14} {}\n", check.name, check.status));
        }
        text
    };
    println!("{output}");
    std::process::exit(if summary.status == "pass" { 0 } else { 1 });
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let trace_id = Uuid::new_v4().to_string();
    let loaded = match &args.config {
        Some(path) => load_config_from_path(path),
        None => load_config(),
    };
    let (mut config, config_error) = match loaded {
        Ok(cfg) => (cfg, None),
        Err(err) => (DeviceConfig::default(), Some(err)),
    };

    // Reports land under `reportDir` unless --out overrides it.
    let out_dir = args.out_dir.clone().unwrap_or_else(|| {
        PathBuf::from(&config.report_dir).join(format!("smoke_{trace_id}"))
    });
    if let Err(err) = ensure_dir(&out_dir) {
        eprintln!("{err}");
        std::process::exit(1);
    }

    let mut summary = SmokeSummary {
        tool: "devbench_smoke",
        status: "pass",
        trace_id: trace_id.clone(),
        device: None,
        out_dir: out_dir.to_string_lossy().to_string(),
        artifacts: HashMap::new(),
        metrics: HashMap::new(),
        checks: Vec::new(),
    };

    if let Some(err) = config_error {
        summary.checks.push(SmokeCheck {
            name: "load_config",
            status: "fail",
            duration_ms: 0,
            artifacts: vec![],
            error_code: Some(err.code),
            error: Some(err.error),
        });
        summary.status = "fail";
        emit(&summary, args.json);
    }
    if let Some(serial) = &args.serial {
        config.serial_number = serial.clone();
    }
    init_logging_for(&config);

    let context = BenchContext::new(&out_dir, &trace_id);
    let session = match Session::new(config, &context) {
        Ok(session) => session,
        Err(err) => {
            summary.checks.push(SmokeCheck {
                name: "session",
                status: "fail",
                duration_ms: 0,
                artifacts: vec![],
                error_code: Some(err.code),
                error: Some(err.error),
            });
            summary.status = "fail";
            emit(&summary, args.json);
        }
    };
    summary.device = Some(session.identity().to_string());
    let checks = &mut summary.checks;

    let booted = run_check(checks, "switch_on", || {
        session
            .switch_on(None, None, args.simple)
            .map(|_| vec![])
            .map_err(|err| (err.code, err.error))
    });

    if booted.is_ok() {
        let mut failed = false;
        failed |= run_check(checks, "run_cmd", || {
            let outcome = session.run_cmd("adb shell echo smoke", None, RunOptions::default());
            if outcome.ok && outcome.output.trim() == "smoke" {
                Ok(vec![])
            } else {
                Err(("ERR_COMMAND".to_string(), outcome.output))
            }
        })
        .is_err();

        failed |= run_check(checks, "properties", || {
            let props = session
                .device_properties()
                .ok_or_else(|| ("ERR_PROPERTIES".to_string(), "no property snapshot".to_string()))?;
            let path = out_dir.join("properties.json");
            let body = serde_json::to_string_pretty(&props)
                .map_err(|err| ("ERR_IO".to_string(), err.to_string()))?;
            fs::write(&path, body).map_err(|err| ("ERR_IO".to_string(), err.to_string()))?;
            Ok(vec![path.to_string_lossy().to_string()])
        })
        .is_err();

        failed |= run_check(checks, "screenshot", || {
            session
                .screenshot("smoke")
                .map(|path| vec![path.to_string_lossy().to_string()])
                .ok_or_else(|| ("ERR_SCREENSHOT".to_string(), "screenshot failed".to_string()))
        })
        .is_err();

        if args.with_reboot {
            failed |= run_check(checks, "reboot", || {
                session
                    .reboot(&[BootMode::Mos], RebootOptions::default())
                    .map_err(|err| (err.code, err.error))
                    .and_then(|ok| {
                        if ok {
                            Ok(vec![])
                        } else {
                            Err(("ERR_REBOOT".to_string(), "reboot did not complete".to_string()))
                        }
                    })
            })
            .is_err();
        } else {
            checks.push(SmokeCheck::skipped("reboot"));
        }

        if args.keep_on {
            checks.push(SmokeCheck::skipped("switch_off"));
        } else {
            failed |= run_check(checks, "switch_off", || {
                session
                    .switch_off()
                    .map(|_| vec![])
                    .map_err(|err| (err.code, err.error))
            })
            .is_err();
        }
        if failed {
            summary.status = "fail";
        }
    } else {
        summary.status = "fail";
        for name in ["run_cmd", "properties", "screenshot", "reboot", "switch_off"] {
            summary.checks.push(SmokeCheck::skipped(name));
        }
    }

    if let Some(path) = session.logcat_file() {
        summary
            .artifacts
            .insert("logcat".to_string(), path.to_string_lossy().to_string());
    }
    session.release();
    context.equipment.release_all();
    summary.metrics = [UNEXPECTED_REBOOT_COUNT, WATCHDOG_DISCONNECT_COUNT, BOOT_FAILURE_COUNT]
        .iter()
        .map(|name| (name.to_string(), context.metrics.get(name)))
        .collect();
    emit(&summary, args.json);
}
