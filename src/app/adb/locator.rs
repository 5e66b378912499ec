pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(inner) = trimmed
        .strip_prefix('"')
        .and_then(|candidate| candidate.strip_suffix('"'))
    {
        return inner.trim().to_string();
    }
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|candidate| candidate.strip_suffix('\''))
    {
        return inner.trim().to_string();
    }
    trimmed.to_string()
}

/// Resolves a configured tool path, falling back to the bare program name so
/// `PATH` lookup applies.
pub fn resolve_program(configured: &str, default_program: &str) -> String {
    let normalized = normalize_command_path(configured);
    if normalized.is_empty() {
        default_program.to_string()
    } else {
        normalized
    }
}

pub fn resolve_adb_program(configured: &str) -> String {
    resolve_program(configured, "adb")
}

pub fn resolve_fastboot_program(configured: &str) -> String {
    resolve_program(configured, "fastboot")
}
