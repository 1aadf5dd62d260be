use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "certvault";
pub const APP_NAME: &str = "certvault";

pub const STORE_FILE_NAME: &str = "credentials.cvault";
/// Extension of single-entry PKCS#12 export files.
pub const EXPORT_EXTENSION: &str = "p12";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("CERTVAULT_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn default_store_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join(STORE_FILE_NAME))
}

pub fn default_audit_log_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("logs").join("audit.log"))
}

/// `<dir>/<serial>.p12`
pub fn export_path(dir: &std::path::Path, serial: &str) -> PathBuf {
    dir.join(format!("{serial}.{EXPORT_EXTENSION}"))
}
