use std::path::PathBuf;
use std::time::Duration;

/// Name of the bridge directory created inside a workspace.
pub const BRIDGE_DIR_NAME: &str = ".vsc-bridge";

/// Client-side settings for talking to a bridge host.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Explicit bridge directory; when unset the client searches upward from cwd.
    pub bridge_root: Option<PathBuf>,
    pub timeout: Duration,
    pub pickup_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge_root: None,
            timeout: Duration::from_secs(30),
            pickup_timeout: Duration::from_secs(5),
            poll_interval: default_poll_interval(),
        }
    }
}

impl BridgeConfig {
    pub fn new(bridge_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bridge_root: Some(bridge_root.into()),
            timeout,
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let bridge_root = std::env::var("VSC_BRIDGE_ROOT").ok().map(PathBuf::from);

        let timeout = env_millis("VSC_BRIDGE_TIMEOUT_MS").unwrap_or_else(|| Duration::from_secs(30));

        Self {
            bridge_root,
            timeout,
            ..Self::default()
        }
    }
}

/// Host-side settings for the job processor and maintenance loops.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub workspace: PathBuf,
    pub max_concurrent: usize,
    pub heartbeat_interval: Duration,
    pub scan_interval: Duration,
    pub cancel_poll_interval: Duration,
    pub gc_interval: Duration,
    pub max_job_age: Duration,
    pub dap_request_timeout: Duration,
}

impl HostConfig {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            max_concurrent: 10,
            heartbeat_interval: Duration::from_secs(5),
            scan_interval: Duration::from_millis(250),
            cancel_poll_interval: if is_wsl() {
                Duration::from_millis(125)
            } else {
                Duration::from_millis(50)
            },
            gc_interval: Duration::from_secs(30 * 60),
            max_job_age: Duration::from_secs(24 * 60 * 60),
            dap_request_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_env() -> Self {
        let workspace = std::env::var("VSC_BRIDGE_WORKSPACE")
            .map(PathBuf::from)
            .or_else(|_| std::env::current_dir())
            .unwrap_or_else(|_| PathBuf::from("."));

        let mut config = Self::new(workspace);
        if let Some(max) = std::env::var("VSC_BRIDGE_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
        {
            config.max_concurrent = max;
        }
        if let Some(timeout) = env_millis("VSC_BRIDGE_DAP_TIMEOUT_MS") {
            config.dap_request_timeout = timeout;
        }
        config
    }

    pub fn bridge_root(&self) -> PathBuf {
        self.workspace.join(BRIDGE_DIR_NAME)
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn default_poll_interval() -> Duration {
    if is_wsl() {
        Duration::from_millis(150)
    } else {
        Duration::from_millis(50)
    }
}

/// File watching is unreliable on WSL mounts, so polling backs off there.
pub fn is_wsl() -> bool {
    if std::env::var_os("WSL_DISTRO_NAME").is_some() {
        return true;
    }
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|release| {
            let release = release.to_lowercase();
            release.contains("microsoft") || release.contains("wsl")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert!(config.bridge_root.is_none());
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.pickup_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_new_config() {
        let config = BridgeConfig::new("/tmp/ws/.vsc-bridge", Duration::from_secs(10));
        assert_eq!(config.bridge_root, Some(PathBuf::from("/tmp/ws/.vsc-bridge")));
        assert_eq!(config.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("VSC_BRIDGE_ROOT", "/custom/.vsc-bridge");
        std::env::set_var("VSC_BRIDGE_TIMEOUT_MS", "5000");

        let config = BridgeConfig::from_env();
        assert_eq!(config.bridge_root, Some(PathBuf::from("/custom/.vsc-bridge")));
        assert_eq!(config.timeout, Duration::from_millis(5000));

        std::env::remove_var("VSC_BRIDGE_ROOT");
        std::env::remove_var("VSC_BRIDGE_TIMEOUT_MS");

        let config = BridgeConfig::from_env();
        assert!(config.bridge_root.is_none());
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_host_config_defaults() {
        let config = HostConfig::new("/work");
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.max_job_age, Duration::from_secs(86_400));
        assert_eq!(config.bridge_root(), PathBuf::from("/work/.vsc-bridge"));
    }
}
