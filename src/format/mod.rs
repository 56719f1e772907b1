const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;
const TB: u64 = GB * 1024;

pub fn human_bytes(bytes: u64) -> String {
    if bytes >= TB {
        format!("{:.1} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Megabytes with one decimal, as shown in download progress lines.
pub fn megabytes(bytes: u64) -> String {
    format!("{:.1}", bytes as f64 / MB as f64)
}

/// `round(received / total * 100)`, capped at 100. `None` when no length
/// was advertised.
pub fn percent(received: u64, total: Option<u64>) -> Option<u8> {
    match total {
        Some(0) => Some(100),
        Some(total) => {
            let pct = (received as f64 / total as f64 * 100.0).round();
            Some(pct.min(100.0) as u8)
        }
        None => None,
    }
}
