/// Human readable byte count, "Unlimited" for negative values
pub fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes < 0 {
        return "Unlimited".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Human readable retention window
pub fn format_retention(seconds: i64) -> String {
    match seconds {
        s if s < 0 => "Unlimited".to_string(),
        s if s % 86_400 == 0 && s >= 86_400 => format!("{} days", s / 86_400),
        s if s % 3600 == 0 && s >= 3600 => format!("{} hours", s / 3600),
        s => format!("{} seconds", s),
    }
}
