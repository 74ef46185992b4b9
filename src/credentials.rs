use crate::error::{Result, RotationError};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// One service account key file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    path: PathBuf,
}

impl Credential {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stable identifier, persisted as `last_sa`.
    pub fn id(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// Reads `client_email` from the key file. Only used for logging.
    pub fn client_email(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct KeyFile {
            client_email: String,
        }

        let raw = fs::read_to_string(&self.path).map_err(|e| RotationError::Credential {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let key: KeyFile = serde_json::from_str(&raw).map_err(|e| RotationError::Credential {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        Ok(key.client_email)
    }
}

#[derive(Debug, Clone)]
pub struct CredentialPool {
    credentials: Vec<Credential>,
}

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>) -> Result<Self> {
        if credentials.is_empty() {
            return Err(RotationError::NoCredentialsFound(PathBuf::new()));
        }
        let mut unique: Vec<Credential> = Vec::with_capacity(credentials.len());
        for cred in credentials {
            if !unique.contains(&cred) {
                unique.push(cred);
            }
        }
        Ok(Self { credentials: unique })
    }

    /// Lists every `*.json` in `dir`, sorted by file name.
    pub fn discover(dir: &Path) -> Result<Self> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RotationError::NoCredentialsFound(dir.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_json = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("json"))
                .unwrap_or(false);
            if is_json && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        if paths.is_empty() {
            return Err(RotationError::NoCredentialsFound(dir.to_path_buf()));
        }
        Self::new(paths.into_iter().map(Credential::new).collect())
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.credentials.iter().position(|c| c.id() == id)
    }

    /// The credential after `last_id`, wrapping to the head. An unknown or
    /// empty `last_id` starts from the head.
    pub fn next(&self, last_id: &str) -> &Credential {
        let index = match self.position(last_id) {
            Some(i) => (i + 1) % self.credentials.len(),
            None => 0,
        };
        &self.credentials[index]
    }

    /// Rotates the pool so `last_id` becomes the head. Unknown ids leave the order alone.
    pub fn resume_order(mut self, last_id: &str) -> Self {
        if let Some(index) = self.position(last_id) {
            self.credentials.rotate_left(index);
        }
        self
    }
}
