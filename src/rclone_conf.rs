//! Editing `service_account_file` of one remote in rclone.conf.
use crate::error::{Result, RotationError};
use std::fs;
use std::io::Write;
use std::path::Path;

const SA_KEY: &str = "service_account_file";

/// Points remote `section` at `sa_path`. Returns the previous value, if any.
pub fn set_service_account_file(
    config_path: &Path,
    section: &str,
    sa_path: &Path,
) -> Result<Option<String>> {
    let raw = fs::read_to_string(config_path)?;
    let (updated, previous) = rewrite(&raw, section, &sa_path.to_string_lossy()).ok_or_else(|| {
        RotationError::InvalidConfig(format!(
            "section [{}] not found in {:?}",
            section, config_path
        ))
    })?;

    let dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(updated.as_bytes())?;
    tmp.persist(config_path).map_err(|e| e.error)?;
    Ok(previous)
}

fn rewrite(raw: &str, section: &str, value: &str) -> Option<(String, Option<String>)> {
    let header = format!("[{section}]");
    let mut out: Vec<String> = Vec::new();
    let mut in_section = false;
    let mut found_section = false;
    let mut replaced = false;
    let mut previous = None;

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            if in_section && !replaced {
                insert_before_blank_tail(&mut out, value);
                replaced = true;
            }
            in_section = trimmed == header;
            found_section |= in_section;
            out.push(line.to_string());
            continue;
        }
        if in_section && !replaced {
            if let Some((key, old)) = trimmed.split_once('=') {
                if key.trim() == SA_KEY {
                    previous = Some(old.trim().to_string());
                    out.push(format!("{SA_KEY} = {value}"));
                    replaced = true;
                    continue;
                }
            }
        }
        out.push(line.to_string());
    }
    if in_section && !replaced {
        insert_before_blank_tail(&mut out, value);
    }
    if !found_section {
        return None;
    }

    let mut text = out.join("\n");
    if raw.ends_with('\n') {
        text.push('\n');
    }
    Some((text, previous))
}

fn insert_before_blank_tail(out: &mut Vec<String>, value: &str) {
    let mut at = out.len();
    while at > 0 && out[at - 1].trim().is_empty() {
        at -= 1;
    }
    out.insert(at, format!("{SA_KEY} = {value}"));
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONF: &str = "[GoogleDrive]\ntype = drive\nservice_account_file = /sa/old.json\nteam_drive = abc\n\n[Other]\ntype = drive\nservice_account_file = /sa/keep.json\n";

    #[test]
    fn replaces_only_the_named_section() {
        let (out, prev) = rewrite(CONF, "GoogleDrive", "/sa/new.json").unwrap();
        assert_eq!(prev.as_deref(), Some("/sa/old.json"));
        assert!(out.contains("[GoogleDrive]\ntype = drive\nservice_account_file = /sa/new.json\n"));
        assert!(out.contains("service_account_file = /sa/keep.json\n"));
    }

    #[test]
    fn inserts_key_when_section_lacks_it() {
        let conf = "[GoogleDrive]\ntype = drive\n\n[Other]\ntype = local\n";
        let (out, prev) = rewrite(conf, "GoogleDrive", "/sa/new.json").unwrap();
        assert_eq!(prev, None);
        assert_eq!(
            out,
            "[GoogleDrive]\ntype = drive\nservice_account_file = /sa/new.json\n\n[Other]\ntype = local\n"
        );
    }

    #[test]
    fn missing_section_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rclone.conf");
        fs::write(&path, CONF).unwrap();
        let err = set_service_account_file(&path, "Nope", Path::new("/sa/x.json")).unwrap_err();
        assert!(matches!(err, RotationError::InvalidConfig(_)));
    }

    #[test]
    fn writes_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rclone.conf");
        fs::write(&path, CONF).unwrap();
        set_service_account_file(&path, "Other", Path::new("/sa/3.json")).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.ends_with("service_account_file = /sa/3.json\n"));
        assert!(written.contains("/sa/old.json"));
    }
}
