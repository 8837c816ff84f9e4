use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;

use crate::config::HostConfig;
use crate::error::{OrchestratorError, Result};

/// Password-authenticated SSH session to one host.
pub struct RemoteHost {
    host: String,
    password: String,
    sess: ssh2::Session,
}

impl RemoteHost {
    pub fn connect(config: &HostConfig) -> Result<Self> {
        let tcp = TcpStream::connect(format!("{}:{}", config.host, config.port))?;
        let mut sess = ssh2::Session::new()?;
        sess.set_tcp_stream(tcp);
        sess.handshake()?;

        sess.userauth_password(&config.user, &config.password)?;
        if !sess.authenticated() {
            return Err(anyhow::anyhow!("SSH authentication failed for {}@{}", config.user, config.host).into());
        }

        tracing::info!(host = %config.host, user = %config.user, "SSH session established");
        Ok(Self {
            host: config.host.clone(),
            password: config.password.clone(),
            sess,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Run a command and return its stdout. A non-zero exit status is an
    /// error carrying the command's stderr.
    pub fn exec(&self, cmd: &str) -> Result<String> {
        tracing::debug!(host = %self.host, cmd, "Running remote command");
        let mut channel = self.sess.channel_session()?;
        channel.exec(cmd)?;

        if is_sudo(cmd) {
            channel.write_all(format!("{}\n", self.password).as_bytes())?;
        }
        channel.send_eof()?;

        self.sess.set_blocking(false);
        let read = {
            let mut out = channel.stream(0);
            let mut err = channel.stderr();
            read_interleaved(&mut out, &mut err, || channel.eof())
        };
        self.sess.set_blocking(true);
        let (stdout, stderr) = read?;
        channel.wait_close()?;

        let code = channel.exit_status()?;
        if code != 0 {
            return Err(OrchestratorError::RemoteCommand {
                host: self.host.clone(),
                command: cmd.to_string(),
                code,
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }

    /// Run a command as root.
    pub fn sudo(&self, cmd: &str) -> Result<String> {
        self.exec(&sudo_command(cmd))
    }

    pub fn upload(&self, local: &Path, remote: &str) -> Result<u64> {
        let mut source = std::fs::File::open(local)?;
        let sftp = self.sess.sftp()?;
        let mut remote_file = sftp.create(Path::new(remote))?;
        let bytes = std::io::copy(&mut source, &mut remote_file)?;
        tracing::info!(host = %self.host, remote, bytes, "Uploaded {}", local.display());
        Ok(bytes)
    }

    pub fn download(&self, remote: &str, local: &Path) -> Result<u64> {
        let sftp = self.sess.sftp()?;
        let mut remote_file = sftp.open(Path::new(remote))?;
        let mut dest = std::fs::File::create(local)?;
        let bytes = std::io::copy(&mut remote_file, &mut dest)?;
        tracing::info!(host = %self.host, remote, bytes, "Downloaded to {}", local.display());
        Ok(bytes)
    }
}

/// Drain stdout and stderr together so a chatty stream never stalls the
/// channel while the other is being waited on. `WouldBlock` means no data
/// yet; `finished` reports the remote end closing.
fn read_interleaved<O, E, F>(out: &mut O, err: &mut E, finished: F) -> io::Result<(String, String)>
where
    O: Read,
    E: Read,
    F: Fn() -> bool,
{
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    let (mut out_done, mut err_done) = (false, false);

    while !(out_done && err_done) {
        let mut progressed = false;
        for (reader, sink, done) in [
            (&mut *out as &mut dyn Read, &mut stdout, &mut out_done),
            (&mut *err as &mut dyn Read, &mut stderr, &mut err_done),
        ] {
            if *done {
                continue;
            }
            match reader.read(&mut buf) {
                Ok(0) => *done = true,
                Ok(n) => {
                    sink.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        if !progressed {
            if finished() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    Ok((
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    ))
}

/// `sudo -S` reads the password from stdin; the empty prompt keeps it out
/// of stderr.
pub fn sudo_command(cmd: &str) -> String {
    format!("sudo -S -p '' {}", cmd)
}

fn is_sudo(cmd: &str) -> bool {
    cmd.starts_with("sudo -S")
}

/// Single-quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sudo_command_reads_password_from_stdin() {
        let cmd = sudo_command("server-clone scan --output /tmp/x/inventory.json");
        assert_eq!(cmd, "sudo -S -p '' server-clone scan --output /tmp/x/inventory.json");
        assert!(is_sudo(&cmd));
        assert!(!is_sudo("mkdir -p /tmp/x"));
    }

    /// Hands out its chunks one per read, with a `WouldBlock` before each.
    struct Trickle {
        chunks: Vec<&'static [u8]>,
        ready: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.ready {
                self.ready = true;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.ready = false;
            match self.chunks.first() {
                None => Ok(0),
                Some(chunk) => {
                    let n = chunk.len();
                    buf[..n].copy_from_slice(chunk);
                    self.chunks.remove(0);
                    Ok(n)
                }
            }
        }
    }

    #[test]
    fn test_streams_read_interleaved() -> io::Result<()> {
        let mut out = io::Cursor::new(b"installed\n".to_vec());
        let mut err = Trickle {
            chunks: vec![&b"warning: one\n"[..], &b"warning: two\n"[..]],
            ready: false,
        };
        let (stdout, stderr) = read_interleaved(&mut out, &mut err, || false)?;
        assert_eq!(stdout, "installed\n");
        assert_eq!(stderr, "warning: one\nwarning: two\n");
        Ok(())
    }

    /// Never has data and never reports EOF.
    struct Stalled;

    impl Read for Stalled {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    #[test]
    fn test_read_stops_when_channel_finished() -> io::Result<()> {
        let mut err = io::Cursor::new(b"done\n".to_vec());
        let (stdout, stderr) = read_interleaved(&mut Stalled, &mut err, || true)?;
        assert!(stdout.is_empty());
        assert_eq!(stderr, "done\n");
        Ok(())
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/server-clone-1/bundle.tar.gz"), "/tmp/server-clone-1/bundle.tar.gz");
        assert_eq!(shell_quote("my app"), "'my app'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
