//! Transport selection for the microVM controller.

use serde::{Deserialize, Serialize};

/// How controller subcommands reach the backend that drives the microVMs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Backend binary on this host (possibly via `limactl shell`).
    #[default]
    Local,
    /// Backend binary on a Linux worker reached over SSH.
    Ssh,
    /// Windows Hyper-V specific backend.
    Hyperv,
}

impl Transport {
    /// Parse an explicit override. Unknown values are ignored (`None`).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "ssh" => Some(Self::Ssh),
            "hyperv" => Some(Self::Hyperv),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ssh => "ssh",
            Self::Hyperv => "hyperv",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host operating system family, as far as transport selection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Linux,
    Windows,
    Other,
}

impl Platform {
    #[must_use]
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    #[must_use]
    pub fn from_os(os: &str) -> Self {
        match os {
            "macos" => Self::MacOs,
            "linux" => Self::Linux,
            "windows" => Self::Windows,
            _ => Self::Other,
        }
    }

    /// Default backend command spec for this platform.
    #[must_use]
    pub fn default_backend_spec(self) -> &'static str {
        match self {
            Self::MacOs => "limactl shell crucible-worker -- microvmctl",
            _ => "microvmctl",
        }
    }
}

/// Everything transport selection depends on.
#[derive(Debug, Clone, Copy)]
pub struct TransportInputs<'a> {
    pub explicit: Option<&'a str>,
    pub platform: Platform,
    pub ssh_host_configured: bool,
    pub backend_exists: bool,
    pub hyperv_exists: bool,
}

/// Pick a transport. Pure: identical inputs always yield the same answer.
#[must_use]
pub fn select_transport(inputs: TransportInputs<'_>) -> Transport {
    if let Some(explicit) = inputs.explicit.and_then(Transport::parse) {
        return explicit;
    }

    match inputs.platform {
        Platform::Windows => {
            if inputs.hyperv_exists {
                Transport::Hyperv
            } else if inputs.ssh_host_configured {
                Transport::Ssh
            } else if inputs.backend_exists {
                Transport::Local
            } else {
                Transport::Ssh
            }
        },
        Platform::MacOs | Platform::Linux => {
            if inputs.ssh_host_configured {
                Transport::Ssh
            } else {
                Transport::Local
            }
        },
        Platform::Other => {
            if inputs.ssh_host_configured {
                Transport::Ssh
            } else if inputs.backend_exists {
                Transport::Local
            } else {
                Transport::Ssh
            }
        },
    }
}
