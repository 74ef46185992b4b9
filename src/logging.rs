use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use std::path::Path;

/// Size at which the script log rolls over.
pub const LOG_FILE_MAX_BYTES: usize = 5 * 1024 * 1024;
/// Rolled files kept next to the live one (`<log>.1`, `<log>.2`).
pub const LOG_FILE_BACKUPS: usize = 2;

pub type RotatingLogFile = FileRotate<AppendCount>;

pub fn rotating_log_file(path: &Path) -> RotatingLogFile {
    rotating_log_file_with(path, LOG_FILE_MAX_BYTES, LOG_FILE_BACKUPS)
}

fn rotating_log_file_with(path: &Path, max_bytes: usize, backups: usize) -> RotatingLogFile {
    FileRotate::new(
        path,
        AppendCount::new(backups),
        ContentLimit::Bytes(max_bytes),
        Compression::None,
        #[cfg(unix)]
        None,
    )
}
