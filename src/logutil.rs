//! Logging helpers: single-line sanitizing of untrusted strings (device names, message
//! text), hex previews of raw frames, and `env_logger` setup for host applications.

use crate::config::LoggingConfig;
use std::fmt::Write as _;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Other control characters become `\xNN`. Very long strings are capped with an ellipsis.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// UTF-8 safe truncation for log display. Never slices inside a multi-byte char; when the
/// input exceeds `max_bytes` the escaped prefix is returned with `...` appended.
pub fn truncate_for_log(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return escape_log(input);
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = escape_log(&input[..cut]);
    out.push_str("...");
    out
}

/// Lowercase hex of at most `max` leading bytes.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(max.min(data.len()) * 2);
    for b in data.iter().take(max) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// Initialize the global logger.
///
/// `verbosity` (0, 1, 2+) maps to info/debug/trace and wins over the configured level.
/// When a log file is configured every line is appended there and mirrored to the
/// console only if stdout is a terminal.
pub fn init_logging(config: &LoggingConfig, verbosity: u8) {
    use std::io::Write;

    let mut builder = env_logger::Builder::new();
    let level = match verbosity {
        0 => config
            .level
            .parse::<log::LevelFilter>()
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);

    let file = config.file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("Unable to open log file {}: {}", path, e))
            .ok()
    });

    match file {
        Some(f) => {
            let sink = std::sync::Mutex::new(f);
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let line = format!(
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                );
                if let Ok(mut guard) = sink.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    }

    // A host may already have installed a logger; keep theirs.
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_tabs() {
        let s = "Line1\nLine2\r\tEnd";
        assert_eq!(escape_log(s), "Line1\\nLine2\\r\\tEnd");
    }

    #[test]
    fn escapes_other_control_chars_as_hex() {
        assert_eq!(escape_log("a\u{7}b"), "a\\x07b");
    }

    #[test]
    fn truncate_does_not_split_multibyte_char() {
        // "—" is 3 bytes; max 10 with the 3-byte ellipsis reserve cuts inside it.
        let out = truncate_for_log("12345—7890", 10);
        assert_eq!(out, "12345...");
    }

    #[test]
    fn no_truncation_when_within_limit() {
        assert_eq!(truncate_for_log("T-Beam 3f2a", 32), "T-Beam 3f2a");
    }

    #[test]
    fn hex_snippet_caps_length() {
        assert_eq!(hex_snippet(&[0x94, 0xc3, 0x00, 0x02, 0x18], 3), "94c300");
    }
}
