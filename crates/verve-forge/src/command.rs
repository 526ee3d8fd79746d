use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::Command;

use crate::error::ForgeError;

/// A thin wrapper around invoking an external forge CLI (`gh`), in the same
/// owned-argument-vector / decode-then-map-errors shape as this workspace's
/// other CLI wrappers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgeCli {
    pub binary: PathBuf,
}

impl Default for ForgeCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("gh"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgeOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ForgeCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn run<I, S>(&self, args: I) -> Result<ForgeOutput, ForgeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let owned_args: Vec<OsString> = args
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect();

        let mut command = Command::new(&self.binary);
        for arg in &owned_args {
            command.arg(arg);
        }

        let rendered = render_command(&self.binary, &owned_args);
        let output = command.output().map_err(|source| ForgeError::Io {
            command: rendered.clone(),
            source,
        })?;

        let stdout =
            String::from_utf8(output.stdout).map_err(|source| ForgeError::NonUtf8Output {
                command: rendered.clone(),
                stream: "stdout",
                source,
            })?;
        let stderr =
            String::from_utf8(output.stderr).map_err(|source| ForgeError::NonUtf8Output {
                command: rendered.clone(),
                stream: "stderr",
                source,
            })?;

        if !output.status.success() {
            return Err(ForgeError::CommandFailed {
                command: rendered,
                status: output.status.code(),
                stderr,
            });
        }

        Ok(ForgeOutput { stdout, stderr })
    }
}

fn render_command(binary: &std::path::Path, args: &[OsString]) -> String {
    let mut rendered = binary.display().to_string();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_command_joins_binary_and_args() {
        let rendered = render_command(
            std::path::Path::new("gh"),
            &[OsString::from("pr"), OsString::from("view")],
        );
        assert_eq!(rendered, "gh pr view");
    }

    #[test]
    fn missing_binary_surfaces_io_error() {
        let cli = ForgeCli::new("definitely-not-a-real-binary-xyz");
        let err = cli.run(["--version"]).unwrap_err();
        assert!(matches!(err, ForgeError::Io { .. }));
    }
}
