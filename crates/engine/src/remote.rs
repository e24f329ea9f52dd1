use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;
use crate::error::RemoteError;

/// Operations the engine needs from the remote store.
///
/// `mkdir_all`, `chmod` and `chown` must be idempotent: several uploads into
/// the same directory race to prepare it.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Destination prefix understood by the transfer tool (e.g. `user@host`)
    fn host(&self) -> &str;

    /// Names of the entries directly under `path`
    async fn read_dir(&self, path: &Path) -> Result<Vec<String>, RemoteError>;

    async fn mkdir_all(&self, path: &Path) -> Result<(), RemoteError>;

    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), RemoteError>;

    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), RemoteError>;

    /// Run a shell command and return its stdout
    async fn send_command(&self, command: &str) -> Result<String, RemoteError>;
}

/// Quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Transport driving the system `ssh` client, one process per operation
#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh_bin: PathBuf,
    host: String,
}

impl SshTransport {
    /// Verify the host is reachable without prompting, then return the transport
    pub async fn connect(ssh_bin: impl Into<PathBuf>, host: impl Into<String>) -> Result<Self, RemoteError> {
        let transport = SshTransport {
            ssh_bin: ssh_bin.into(),
            host: host.into(),
        };
        transport.send_command("true").await?;
        debug!("Connected to {}", transport.host);
        Ok(transport)
    }

    pub fn ssh_bin(&self) -> &Path {
        &self.ssh_bin
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    fn host(&self) -> &str {
        &self.host
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<String>, RemoteError> {
        let output = self.send_command(&format!("ls -1A -- {}", quote_path(path))).await?;
        Ok(output
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn mkdir_all(&self, path: &Path) -> Result<(), RemoteError> {
        self.send_command(&format!("mkdir -p -- {}", quote_path(path))).await?;
        Ok(())
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), RemoteError> {
        self.send_command(&format!("chmod {:o} -- {}", mode, quote_path(path))).await?;
        Ok(())
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), RemoteError> {
        self.send_command(&format!("chown {}:{} -- {}", uid, gid, quote_path(path)))
            .await?;
        Ok(())
    }

    async fn send_command(&self, command: &str) -> Result<String, RemoteError> {
        debug!("ssh {} {}", self.host, command);
        let output = Command::new(&self.ssh_bin)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.host)
            .arg(command)
            .output()
            .await
            .map_err(|source| RemoteError::Spawn {
                program: self.ssh_bin.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(RemoteError::Command {
                command: command.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    /// In-memory transport recording every mutation
    #[derive(Debug, Default)]
    pub struct FakeTransport {
        pub listings: BTreeMap<PathBuf, Vec<String>>,
        /// Directories whose listing fails like `ls` on a missing path
        pub missing: BTreeSet<PathBuf>,
        pub command_output: String,
        pub fail_chown: bool,
        pub dirs: Mutex<BTreeSet<PathBuf>>,
        pub modes: Mutex<BTreeMap<PathBuf, u32>>,
        pub owners: Mutex<BTreeMap<PathBuf, (u32, u32)>>,
        pub commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteTransport for FakeTransport {
        fn host(&self) -> &str {
            "fake"
        }

        async fn read_dir(&self, path: &Path) -> Result<Vec<String>, RemoteError> {
            if self.missing.contains(path) {
                return Err(RemoteError::Command {
                    command: format!("ls -1A -- {}", path.display()),
                    code: 2,
                    stderr: "No such file or directory".to_string(),
                });
            }
            Ok(self.listings.get(path).cloned().unwrap_or_default())
        }

        async fn mkdir_all(&self, path: &Path) -> Result<(), RemoteError> {
            self.dirs.lock().unwrap().insert(path.to_path_buf());
            Ok(())
        }

        async fn chmod(&self, path: &Path, mode: u32) -> Result<(), RemoteError> {
            self.modes.lock().unwrap().insert(path.to_path_buf(), mode);
            Ok(())
        }

        async fn chown(&self, path: &Path, uid: u32, gid: u32) -> Result<(), RemoteError> {
            if self.fail_chown {
                return Err(RemoteError::Command {
                    command: format!("chown {}:{} {}", uid, gid, path.display()),
                    code: 1,
                    stderr: "Operation not permitted".to_string(),
                });
            }
            self.owners.lock().unwrap().insert(path.to_path_buf(), (uid, gid));
            Ok(())
        }

        async fn send_command(&self, command: &str) -> Result<String, RemoteError> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(self.command_output.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/mnt/tank/TV Shows"), "'/mnt/tank/TV Shows'");
        assert_eq!(shell_quote("Bob's Burgers"), r"'Bob'\''s Burgers'");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_an_error() {
        let err = SshTransport::connect("definitely-not-ssh-xyz", "nowhere").await.unwrap_err();
        assert!(matches!(err, RemoteError::Spawn { .. }));
    }
}
