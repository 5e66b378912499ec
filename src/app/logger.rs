//! Supervised `logcat` consumer writing into a size-rotated local file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::app::error::AppError;

/// Produces a fresh log-streaming child with piped stdout and stderr.
pub type LogSpawner = Arc<dyn Fn() -> Result<Child, AppError> + Send + Sync>;

/// Builds a spawner for `program args...`.
pub fn command_spawner(program: String, args: Vec<String>, trace_id: String) -> LogSpawner {
    Arc::new(move || {
        Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| AppError::system(format!("Failed to start logcat: {err}"), &trace_id))
    })
}

/// Append-only file that rolls over to `name.1 .. name.N` once `max_bytes` is reached.
pub struct RotatingFile {
    path: PathBuf,
    file: File,
    written: u64,
    max_bytes: u64,
    max_files: usize,
}

impl RotatingFile {
    pub fn open(path: &Path, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata().map(|meta| meta.len()).unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written,
            max_bytes,
            max_files,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let needed = line.len() as u64 + 1;
        if self.max_bytes > 0 && self.written > 0 && self.written + needed > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.written += needed;
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        if self.max_files == 0 {
            self.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.written = 0;
            return Ok(());
        }
        for index in (1..self.max_files).rev() {
            let from = rotated_path(&self.path, index);
            if from.exists() {
                fs::rename(&from, rotated_path(&self.path, index + 1))?;
            }
        }
        fs::rename(&self.path, rotated_path(&self.path, 1))?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

pub fn rotated_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

type Sink = Arc<Mutex<Option<RotatingFile>>>;

struct Running {
    child: Child,
    stdout_reader: JoinHandle<u64>,
    stderr_reader: JoinHandle<()>,
}

pub struct DeviceLogger {
    spawner: LogSpawner,
    max_bytes: u64,
    max_files: usize,
    sink: Sink,
    running: Mutex<Option<Running>>,
    trace_id: String,
}

impl DeviceLogger {
    pub fn new(spawner: LogSpawner, max_bytes: u64, max_files: usize, trace_id: &str) -> Self {
        Self {
            spawner,
            max_bytes,
            max_files,
            sink: Arc::new(Mutex::new(None)),
            running: Mutex::new(None),
            trace_id: trace_id.to_string(),
        }
    }

    /// Opens `path` as the sink, replacing any previous one. Lines already
    /// streaming move to the new file.
    pub fn set_output_file(&self, path: &Path) -> Result<(), AppError> {
        let file = RotatingFile::open(path, self.max_bytes, self.max_files).map_err(|err| {
            AppError::system(format!("Failed to open {}: {err}", path.display()), &self.trace_id)
        })?;
        let mut guard = self
            .sink
            .lock()
            .map_err(|_| AppError::system("Logger sink locked", &self.trace_id))?;
        if let Some(previous) = guard.as_mut() {
            let _ = previous.flush();
        }
        *guard = Some(file);
        Ok(())
    }

    pub fn output_file(&self) -> Option<PathBuf> {
        self.sink
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|file| file.path().to_path_buf()))
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|guard| {
                guard
                    .as_ref()
                    .map(|running| !running.stdout_reader.is_finished())
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }

    pub fn start(&self) -> Result<(), AppError> {
        let mut guard = self
            .running
            .lock()
            .map_err(|_| AppError::system("Logger registry locked", &self.trace_id))?;
        if let Some(running) = guard.as_ref() {
            if !running.stdout_reader.is_finished() {
                return Ok(());
            }
        }
        if let Some(stale) = guard.take() {
            reap(stale, &self.trace_id);
        }
        let has_sink = self.sink.lock().map(|sink| sink.is_some()).unwrap_or(false);
        if !has_sink {
            return Err(AppError::validation(
                "Logger output file must be set before start",
                &self.trace_id,
            ));
        }

        let mut child = (self.spawner)()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::system("Failed to capture logcat stdout", &self.trace_id))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::system("Failed to capture logcat stderr", &self.trace_id))?;

        let sink = Arc::clone(&self.sink);
        let trace_stdout = self.trace_id.clone();
        let stdout_reader = thread::Builder::new()
            .name("device-logger".to_string())
            .spawn(move || {
                let mut lines = 0u64;
                let reader = BufReader::new(stdout);
                for line in reader.lines().map_while(Result::ok) {
                    let Ok(mut guard) = sink.lock() else {
                        break;
                    };
                    if let Some(file) = guard.as_mut() {
                        if let Err(err) = file.write_line(&line) {
                            warn!(trace_id = %trace_stdout, error = %err, "failed to write logcat line");
                        }
                    }
                    lines += 1;
                }
                if let Ok(mut guard) = sink.lock() {
                    if let Some(file) = guard.as_mut() {
                        let _ = file.flush();
                    }
                }
                lines
            })
            .map_err(|err| AppError::system(format!("Failed to spawn logger thread: {err}"), &self.trace_id))?;

        let trace_stderr = self.trace_id.clone();
        let stderr_reader = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(Result::ok) {
                debug!(trace_id = %trace_stderr, line = %line, "logcat stderr");
            }
        });

        info!(trace_id = %self.trace_id, "device logger started");
        *guard = Some(Running {
            child,
            stdout_reader,
            stderr_reader,
        });
        Ok(())
    }

    /// Terminates the consumer. Returns once every line it read is in the sink.
    pub fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(running) = running {
            reap(running, &self.trace_id);
            info!(trace_id = %self.trace_id, "device logger stopped");
        }
    }
}

fn reap(mut running: Running, trace_id: &str) {
    let _ = running.child.kill();
    let _ = running.child.wait();
    let lines = running.stdout_reader.join().unwrap_or(0);
    let _ = running.stderr_reader.join();
    debug!(trace_id = %trace_id, lines, "logcat consumer joined");
}

impl Drop for DeviceLogger {
    fn drop(&mut self) {
        self.stop();
    }
}
