use {
    serde::{Deserialize, Serialize},
    tracing::{info, warn},
};

use crate::{executor::Language, provider::SandboxRuntime};

const INSTALL_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInstallResult {
    pub success: bool,
    /// Combined stdout and stderr of the installer.
    pub output: String,
}

/// Install packages with pip or npm inside the sandbox.
pub async fn install_packages(
    sandbox: &dyn SandboxRuntime,
    packages: &[String],
    language: Language,
) -> PackageInstallResult {
    if packages.is_empty() {
        return PackageInstallResult {
            success: true,
            output: String::new(),
        };
    }

    let joined = packages.join(" ");
    let command = match language {
        Language::Python => format!("pip install {joined} -q"),
        Language::Javascript => format!("npm install {joined} --silent"),
        Language::Bash => {
            return PackageInstallResult {
                success: false,
                output: "Unsupported language for package install".into(),
            };
        },
    };

    match sandbox.run_command(&command, INSTALL_TIMEOUT_MS).await {
        Ok(out) => {
            let success = out.exit_code == 0;
            if success {
                info!(packages = %joined, "packages installed");
            } else {
                warn!(packages = %joined, exit_code = out.exit_code, "package install failed");
            }
            PackageInstallResult {
                success,
                output: format!("{}{}", out.stdout, out.stderr),
            }
        },
        Err(e) => PackageInstallResult {
            success: false,
            output: e.to_string(),
        },
    }
}
