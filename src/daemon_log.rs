use std::{
    collections::VecDeque,
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Error,
    Warn,
    Info,
    Debug,
    Plain,
}

impl LogSeverity {
    /// aria2 writes free-form text; severity is guessed from markers in the line.
    pub fn classify(line: &str) -> Self {
        if line.contains("ERROR") || line.contains("error") {
            Self::Error
        } else if line.contains("WARN") || line.contains("warning") {
            Self::Warn
        } else if line.contains("INFO") || line.contains("info") {
            Self::Info
        } else if line.contains("DEBUG") || line.contains("debug") {
            Self::Debug
        } else {
            Self::Plain
        }
    }
}

/// Only the end of the log is read; aria2 logs grow without bound.
const TAIL_WINDOW_BYTES: u64 = 1024 * 1024;

/// Last `lines` non-empty lines of the daemon log. Never fails; problems become a
/// single placeholder line for the viewer.
pub fn read_log_tail(path: &Path, lines: usize) -> Vec<String> {
    read_tail_window(path, lines, TAIL_WINDOW_BYTES)
}

fn read_tail_window(path: &Path, lines: usize, window: u64) -> Vec<String> {
    if !path.exists() {
        return vec!["log file does not exist".to_string()];
    }
    let (bytes, offset) = match read_last_bytes(path, window) {
        Ok(read) => read,
        Err(err) => return vec![format!("failed to read log: {err}")],
    };
    let text = String::from_utf8_lossy(&bytes);
    let mut text_lines = text.lines();
    if offset > 0 {
        // starts mid-line
        text_lines.next();
    }
    let mut tail = VecDeque::with_capacity(lines.min(4096));
    for line in text_lines {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        if lines > 0 {
            tail.push_back(line.to_string());
        }
    }
    tail.into()
}

fn read_last_bytes(path: &Path, window: u64) -> io::Result<(Vec<u8>, u64)> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let offset = len.saturating_sub(window);
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = Vec::with_capacity(usize::try_from(len - offset).unwrap_or(0));
    file.read_to_end(&mut bytes)?;
    Ok((bytes, offset))
}
