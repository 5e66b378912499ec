use std::time::Duration;

/// Transfer timeout proportional to the payload size, never below `minimum`.
pub fn transfer_timeout(size_bytes: u64, rate_kbps: u64, minimum: Duration) -> Duration {
    let rate_bytes_per_s = rate_kbps.max(1).saturating_mul(1024);
    // Round up so a partial second still counts.
    let seconds = size_bytes.div_ceil(rate_bytes_per_s);
    Duration::from_secs(seconds).max(minimum)
}

/// Byte count from `stat -c %s` output, if the file exists.
pub fn parse_remote_size(output: &str) -> Option<u64> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<u64>().ok())
}
