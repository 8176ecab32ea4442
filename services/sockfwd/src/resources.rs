/// Resident memory of this process in bytes, if the platform exposes it.
pub fn resident_memory_bytes() -> Option<u64> {
    get_resident_memory()
}

#[cfg(target_os = "linux")]
fn get_resident_memory() -> Option<u64> {
    if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
        if let Some(rss) = parse_status_rss(&status) {
            return Some(rss);
        }
    }

    max_rss_bytes()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn get_resident_memory() -> Option<u64> {
    max_rss_bytes()
}

#[cfg(not(unix))]
fn get_resident_memory() -> Option<u64> {
    None
}

/// Peak resident set size reported by getrusage.
#[cfg(unix)]
fn max_rss_bytes() -> Option<u64> {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 || usage.ru_maxrss <= 0 {
        return None;
    }

    // macOS reports bytes, everything else kilobytes.
    #[cfg(target_os = "macos")]
    let scale: u64 = 1;
    #[cfg(not(target_os = "macos"))]
    let scale: u64 = 1024;

    Some(usage.ru_maxrss as u64 * scale)
}

#[cfg(target_os = "linux")]
fn parse_status_rss(content: &str) -> Option<u64> {
    const KB_TO_BYTES: u64 = 1024;

    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("VmRSS:") => parts
                .next()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|kb| kb * KB_TO_BYTES),
            _ => None,
        }
    })
}
