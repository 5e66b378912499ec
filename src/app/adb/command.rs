//! Command text parsed once at the session boundary.
//!
//! Callers hand the session strings such as `"shell getprop ro.serialno"`,
//! `"adb reboot bootloader"` or `"fastboot getvar product"`. They are turned into
//! a [`DeviceCommand`] here, and the transport renders that value into an argv
//! with the device identity injected.

use crate::app::models::DeviceIdentity;

pub const SHELL_TRANSPORT: &str = "adb";
pub const BOOTLOADER_TRANSPORT: &str = "fastboot";

/// Verbs the session itself issues; everything else is a generic adb command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownVerb {
    Devices,
    StartServer,
    KillServer,
    Connect,
    Disconnect,
    WaitForDevice,
    GetState,
    GetSerialno,
    Root,
    Remount,
    Reboot,
    Push,
    Pull,
    Install,
    Uninstall,
    ShellAmInstrument,
    ShellAmStart,
    ShellGetprop,
    ShellSetprop,
    ShellLog,
    ShellScreencap,
    ShellNohup,
    ShellInputKeyevent,
    ShellCatUptime,
    ShellCatVersion,
}

impl KnownVerb {
    fn from_adb_verb(verb: &str) -> Option<Self> {
        let verb = match verb {
            "devices" => KnownVerb::Devices,
            "start-server" => KnownVerb::StartServer,
            "kill-server" => KnownVerb::KillServer,
            "connect" => KnownVerb::Connect,
            "disconnect" => KnownVerb::Disconnect,
            "wait-for-device" => KnownVerb::WaitForDevice,
            "get-state" => KnownVerb::GetState,
            "get-serialno" => KnownVerb::GetSerialno,
            "root" => KnownVerb::Root,
            "remount" => KnownVerb::Remount,
            "reboot" => KnownVerb::Reboot,
            "push" => KnownVerb::Push,
            "pull" => KnownVerb::Pull,
            "install" => KnownVerb::Install,
            "uninstall" => KnownVerb::Uninstall,
            _ => return None,
        };
        Some(verb)
    }

    fn from_shell_line(line: &str) -> Option<Self> {
        let words: Vec<&str> = line.split_whitespace().take(2).collect();
        let verb = match words.as_slice() {
            ["am", "instrument", ..] => KnownVerb::ShellAmInstrument,
            ["am", "start", ..] => KnownVerb::ShellAmStart,
            ["getprop", ..] => KnownVerb::ShellGetprop,
            ["setprop", ..] => KnownVerb::ShellSetprop,
            ["log", ..] => KnownVerb::ShellLog,
            ["screencap", ..] => KnownVerb::ShellScreencap,
            ["nohup", ..] => KnownVerb::ShellNohup,
            ["input", "keyevent", ..] => KnownVerb::ShellInputKeyevent,
            ["cat", "/proc/uptime", ..] => KnownVerb::ShellCatUptime,
            ["cat", "/proc/version", ..] => KnownVerb::ShellCatVersion,
            _ => return None,
        };
        Some(verb)
    }

    /// Host-level verbs talk to the daemon, not to a device, so no `-s` is injected.
    pub fn is_host_level(&self) -> bool {
        matches!(
            self,
            KnownVerb::Devices
                | KnownVerb::StartServer
                | KnownVerb::KillServer
                | KnownVerb::Connect
                | KnownVerb::Disconnect
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Arguments for the bootloader transport, without the program name.
    Bootloader(Vec<String>),
    /// Generic shell-transport arguments, without the program name.
    Shell(Vec<String>),
    ShellKnownVerb(KnownVerb, Vec<String>),
}

impl DeviceCommand {
    pub fn parse(text: &str) -> Result<Self, String> {
        let tokens = tokenize(text)?;
        let Some(first) = tokens.first() else {
            return Err("command is empty".to_string());
        };

        if program_name(&first.value) == BOOTLOADER_TRANSPORT {
            let args = tokens[1..].iter().map(|token| token.value.clone()).collect::<Vec<_>>();
            if args.is_empty() {
                return Err("bootloader command has no arguments".to_string());
            }
            return Ok(DeviceCommand::Bootloader(args));
        }

        let rest = if program_name(&first.value) == SHELL_TRANSPORT {
            &tokens[1..]
        } else {
            &tokens[..]
        };
        // A caller-supplied `-s <target>` stays in front of the verb.
        let (target, verbs) = match rest {
            [flag, target, verbs @ ..] if flag.value == "-s" => {
                (vec![flag.value.clone(), target.value.clone()], verbs)
            }
            [flag] if flag.value == "-s" => return Err("-s needs a device target".to_string()),
            _ => (Vec::new(), rest),
        };
        let Some(verb_token) = verbs.first() else {
            return Err("adb command has no arguments".to_string());
        };

        if verb_token.value == "shell" {
            // Keep the remainder verbatim so pipelines and quoting reach the device shell intact.
            let remainder = text[verb_token.end..].trim();
            let mut args = target;
            args.push("shell".to_string());
            if !remainder.is_empty() {
                args.push(remainder.to_string());
            }
            return Ok(match KnownVerb::from_shell_line(remainder) {
                Some(verb) => DeviceCommand::ShellKnownVerb(verb, args),
                None => DeviceCommand::Shell(args),
            });
        }

        let mut args = target;
        args.extend(verbs.iter().map(|token| token.value.clone()));
        Ok(match KnownVerb::from_adb_verb(&verb_token.value) {
            Some(verb) => DeviceCommand::ShellKnownVerb(verb, args),
            None => DeviceCommand::Shell(args),
        })
    }

    /// `shell <line>` without going through the tokenizer.
    pub fn shell(line: &str) -> Self {
        let line = line.trim();
        let args = vec!["shell".to_string(), line.to_string()];
        match KnownVerb::from_shell_line(line) {
            Some(verb) => DeviceCommand::ShellKnownVerb(verb, args),
            None => DeviceCommand::Shell(args),
        }
    }

    /// Shell-transport verb with plain arguments, e.g. `["reboot", "bootloader"]`.
    pub fn adb(args: &[&str]) -> Self {
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        match args.first().and_then(|verb| KnownVerb::from_adb_verb(verb)) {
            Some(verb) => DeviceCommand::ShellKnownVerb(verb, args),
            None => DeviceCommand::Shell(args),
        }
    }

    pub fn bootloader(args: &[&str]) -> Self {
        DeviceCommand::Bootloader(args.iter().map(|arg| arg.to_string()).collect())
    }

    pub fn is_bootloader(&self) -> bool {
        matches!(self, DeviceCommand::Bootloader(_))
    }

    pub fn verb(&self) -> Option<KnownVerb> {
        match self {
            DeviceCommand::ShellKnownVerb(verb, _) => Some(*verb),
            _ => None,
        }
    }

    pub fn args(&self) -> &[String] {
        match self {
            DeviceCommand::Bootloader(args)
            | DeviceCommand::Shell(args)
            | DeviceCommand::ShellKnownVerb(_, args) => args,
        }
    }

    /// Arguments to pass to the transport program with the device identity injected.
    pub fn render(&self, identity: &DeviceIdentity) -> Vec<String> {
        let args = self.args();
        let explicit_target = args.first().map(|arg| arg == "-s").unwrap_or(false);
        let mut argv = Vec::with_capacity(args.len() + 2);
        match self {
            DeviceCommand::Bootloader(_) => {
                let enumerating = args.first().map(|arg| arg == "devices").unwrap_or(false);
                if !enumerating && !explicit_target {
                    match identity {
                        DeviceIdentity::Usb { serial } => {
                            argv.push("-s".to_string());
                            argv.push(serial.clone());
                        }
                        DeviceIdentity::Network { host, .. } => {
                            argv.push("-s".to_string());
                            argv.push(format!("tcp:{host}"));
                        }
                    }
                }
            }
            DeviceCommand::ShellKnownVerb(verb, _) if verb.is_host_level() => {}
            DeviceCommand::Shell(_) | DeviceCommand::ShellKnownVerb(_, _) => {
                if !explicit_target {
                    argv.push("-s".to_string());
                    argv.push(identity.target());
                }
            }
        }
        argv.extend(args.iter().cloned());
        argv
    }
}

/// Single-quotes `value` for the device shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '='))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn program_name(token: &str) -> &str {
    let name = token.rsplit(['/', '\\']).next().unwrap_or(token);
    name.strip_suffix(".exe").unwrap_or(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    value: String,
    end: usize,
}

/// Splits on whitespace with POSIX-style quotes and backslash escapes.
fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = text.char_indices().peekable();

    while let Some((index, c)) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some(_) => match c {
                '"' => quote = None,
                '\\' => {
                    if let Some(&(_, next)) = chars.peek() {
                        if matches!(next, '"' | '\\' | '$' | '`') {
                            current.push(next);
                            chars.next();
                            continue;
                        }
                    }
                    current.push(c);
                }
                _ => current.push(c),
            },
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => {
                    in_token = true;
                    if let Some((_, next)) = chars.next() {
                        current.push(next);
                    }
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(Token {
                            value: std::mem::take(&mut current),
                            end: index,
                        });
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err("unterminated quote in command".to_string());
    }
    if in_token {
        tokens.push(Token {
            value: current,
            end: text.len(),
        });
    }
    Ok(tokens)
}
