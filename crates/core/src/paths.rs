use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".webcell"))
            .unwrap_or_else(|| PathBuf::from(".webcell"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base.join("logs")
    }

    /// Platform path for the host-process RPC pipe.
    #[cfg(unix)]
    pub fn pipe_path(name: &str) -> PathBuf {
        PathBuf::from(format!("/tmp/{}.sock", name))
    }

    /// Platform path for the host-process RPC pipe.
    #[cfg(windows)]
    pub fn pipe_path(name: &str) -> PathBuf {
        PathBuf::from(format!(r"\\.\pipe\{}", name))
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
