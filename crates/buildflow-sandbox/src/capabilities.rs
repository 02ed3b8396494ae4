//! Platform isolation capability detection.

/// What the running platform can isolate.
#[derive(Debug, Clone)]
pub struct SandboxCapabilities {
    /// Linux user namespaces (unprivileged namespace creation).
    pub user_namespaces: bool,
    /// Linux network namespaces.
    pub net_namespaces: bool,
    /// Linux pid namespaces.
    pub pid_namespaces: bool,
    /// Current platform name.
    pub platform: String,
}

impl SandboxCapabilities {
    /// Probe the running system.
    #[must_use]
    pub fn detect() -> Self {
        #[cfg(target_os = "linux")]
        {
            let user_namespaces = std::path::Path::new("/proc/self/ns/user").exists()
                && unprivileged_userns_allowed();
            let net_namespaces = std::path::Path::new("/proc/self/ns/net").exists();
            let pid_namespaces = std::path::Path::new("/proc/self/ns/pid").exists();
            Self {
                user_namespaces,
                net_namespaces,
                pid_namespaces,
                platform: "linux".to_string(),
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self {
                user_namespaces: false,
                net_namespaces: false,
                pid_namespaces: false,
                platform: std::env::consts::OS.to_string(),
            }
        }
    }

    /// Whether any namespace-level isolation is available.
    #[must_use]
    pub fn namespaces_available(&self) -> bool {
        self.user_namespaces || self.net_namespaces || self.pid_namespaces
    }
}

#[cfg(target_os = "linux")]
fn unprivileged_userns_allowed() -> bool {
    // Root can always create namespaces; otherwise the sysctl decides.
    // SAFETY: geteuid has no preconditions.
    #[allow(unsafe_code)]
    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        return true;
    }
    std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone")
        .map(|v| v.trim() == "1")
        // The sysctl is absent on kernels where unprivileged userns is
        // unconditionally allowed.
        .unwrap_or(true)
}
