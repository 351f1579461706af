//! Shared terminal styling for the CLI.

use console::Style;

/// Green checkmark prefix.
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Red cross prefix.
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Yellow warning prefix.
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Connection indicator.
pub fn connected(is_connected: bool) -> String {
    if is_connected {
        format!("{} Connected", Style::new().green().apply_to("●"))
    } else {
        format!("{} Not connected", Style::new().dim().apply_to("○"))
    }
}

/// Label for the side a conflict was resolved in favour of.
pub fn side(name: &str) -> String {
    match name {
        "local" => Style::new().blue().bold().apply_to("local").to_string(),
        "remote" => Style::new().magenta().bold().apply_to("remote").to_string(),
        other => other.to_string(),
    }
}
