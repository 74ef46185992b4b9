use crate::config::{Config, SwitchWay, SyncAction};
use crate::credentials::Credential;
use std::path::{Path, PathBuf};

/// The rclone invocation one session runs under `sh -c`.
#[derive(Debug, Clone)]
pub struct SyncCommand {
    pub binary: String,
    pub action: SyncAction,
    pub src: String,
    pub dst: String,
    pub rc_addr: String,
    pub log_file: PathBuf,
    pub files_from: Option<PathBuf>,
    pub dry_run: bool,
}

impl SyncCommand {
    pub fn new(config: &Config, action: SyncAction, src: &str, dst: &str) -> Self {
        Self {
            binary: config.rclone_binary.clone(),
            action,
            src: src.to_string(),
            dst: dst.to_string(),
            rc_addr: config.rc_addr.clone(),
            log_file: config.rclone_log_file.clone(),
            files_from: None,
            dry_run: false,
        }
    }

    pub fn with_files_from(mut self, files_from: Option<PathBuf>) -> Self {
        self.files_from = files_from;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Shell line shared by every credential.
    pub fn base(&self) -> String {
        let mut cmd = format!(
            "{} {} {} {} --rc --drive-server-side-across-configs -v --log-file {} --rc-addr {}",
            self.binary,
            self.action.as_arg(),
            quote(&self.src),
            quote(&self.dst),
            quote_path(&self.log_file),
            self.rc_addr,
        );
        if let Some(files_from) = &self.files_from {
            cmd.push_str(&format!(" --files-from {}", quote_path(files_from)));
        }
        if self.action == SyncAction::Move {
            cmd.push_str(" --delete-empty-src-dirs");
        }
        if self.dry_run {
            cmd.push_str(" --dry-run");
        }
        cmd
    }

    pub fn for_credential(&self, credential: &Credential, way: &SwitchWay) -> String {
        match way {
            SwitchWay::Runtime => format!(
                "{} --drive-service-account-file {}",
                self.base(),
                quote_path(credential.path())
            ),
            SwitchWay::Config { .. } => self.base(),
        }
    }

    /// Flag text only our own sessions carry on their command line.
    pub fn session_marker(&self) -> String {
        format!("--rc-addr {}", self.rc_addr)
    }

    /// Process name to look for among the shell's children.
    pub fn binary_name(&self) -> String {
        Path::new(&self.binary)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.binary.clone())
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\"").replace('$', "\\$").replace('`', "\\`"))
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}
