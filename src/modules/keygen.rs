use sha2::{Digest, Sha256};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};
use crate::modules::config::get_data_dir;

const KEY_DIR: &str = ".authorized_key";
const KEY_FILE: &str = ".access.key";

/// Inbound API key derived from a persisted secret
#[derive(Debug, Clone)]
pub struct ApiKey {
    key: String,
    path: PathBuf,
}

impl ApiKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// File holding the secret
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn default_key_file() -> AppResult<PathBuf> {
    Ok(get_data_dir()?.join(KEY_DIR).join(KEY_FILE))
}

/// Read the secret at `path`, or generate and persist a new one, and derive the key.
pub fn load_or_create(path: &Path) -> AppResult<ApiKey> {
    if let Some(dir) = path.parent() {
        create_private_dir(dir)?;
    }

    let secret = match fs::read_to_string(path) {
        Ok(content) => content.trim().to_string(),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let secret = generate_secret();
            write_private(path, &secret)?;
            tracing::info!("Generated new API key secret at {}", path.display());
            secret
        }
        Err(e) => {
            return Err(AppError::Config(format!(
                "Failed to read API key file {}: {}",
                path.display(),
                e
            )))
        }
    };

    if secret.is_empty() {
        return Err(AppError::Config(format!(
            "API key file {} is empty",
            path.display()
        )));
    }

    Ok(ApiKey {
        key: derive_key(&secret),
        path: path.to_path_buf(),
    })
}

fn generate_secret() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn derive_key(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> AppResult<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> AppResult<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

fn write_private(path: &Path, secret: &str) -> AppResult<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(secret.as_bytes())?;
    Ok(())
}
