//! `ssh2`-backed transport.

use super::{
    CommandOutput, ConnectionTarget, CopyPlan, Credential, ProgressFn, RemoteSession,
    SessionProfile, Transport,
};
use crate::error::{BackupError, Result};
use ssh2::{MethodType, OpenFlags, OpenType, Session};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

/// Fastest first. libssh2 ignores entries it was not built with.
const CIPHER_PREFS: &str =
    "aes128-gcm@openssh.com,aes256-gcm@openssh.com,aes128-ctr,aes192-ctr,aes256-ctr";
const HOSTKEY_PREFS: &str =
    "ssh-ed25519,ecdsa-sha2-nistp256,ecdsa-sha2-nistp384,rsa-sha2-512,rsa-sha2-256,ssh-rsa";
const MAC_PREFS: &str =
    "hmac-sha2-256-etm@openssh.com,hmac-sha2-512-etm@openssh.com,hmac-sha2-256,hmac-sha2-512,hmac-sha1";

/// OS threads per copy. Chunk concurrency above this is queued on the shared cursor.
const MAX_COPY_WORKERS: usize = 64;

pub struct SshTransport;

impl SshTransport {
    fn open_tcp(target: &ConnectionTarget, profile: &SessionProfile) -> Result<TcpStream> {
        let addr = target
            .address()
            .to_socket_addrs()
            .map_err(|e| {
                BackupError::Connection(format!("failed to resolve host '{}': {}", target.host, e))
            })?
            .next()
            .ok_or_else(|| {
                BackupError::Connection(format!("no addresses found for host '{}'", target.host))
            })?;

        TcpStream::connect_timeout(&addr, profile.connect_timeout).map_err(|e| {
            BackupError::Connection(format!("failed to connect to {}: {}", target.address(), e))
        })
    }

    fn apply_method_prefs(session: &Session) {
        let prefs = [
            ("cipher c2s", MethodType::CryptCs, CIPHER_PREFS),
            ("cipher s2c", MethodType::CryptSc, CIPHER_PREFS),
            ("host key", MethodType::HostKey, HOSTKEY_PREFS),
            ("mac c2s", MethodType::MacCs, MAC_PREFS),
            ("mac s2c", MethodType::MacSc, MAC_PREFS),
            ("compression c2s", MethodType::CompCs, "none"),
            ("compression s2c", MethodType::CompSc, "none"),
        ];
        for (label, method, list) in prefs {
            if let Err(e) = session.method_pref(method, list) {
                warn!("Could not set {} preference, using libssh2 defaults: {}", label, e);
            }
        }
        // archives are already compressed
        session.set_compress(false);
    }

    fn authenticate(session: &Session, target: &ConnectionTarget) -> Result<()> {
        let outcome = match &target.credential {
            Credential::Password { password } => {
                session.userauth_password(&target.username, password)
            }
            Credential::PrivateKey { path, passphrase } => session.userauth_pubkey_file(
                &target.username,
                None,
                path,
                passphrase.as_deref(),
            ),
        };

        if let Err(e) = outcome {
            return Err(BackupError::Connection(format!(
                "SSH authentication failed for {}@{}: {}",
                target.username, target.host, e
            )));
        }
        if !session.authenticated() {
            return Err(BackupError::Connection(format!(
                "SSH authentication failed for {}@{}",
                target.username, target.host
            )));
        }
        Ok(())
    }
}

impl Transport for SshTransport {
    fn connect(
        &self,
        target: &ConnectionTarget,
        profile: &SessionProfile,
    ) -> Result<Box<dyn RemoteSession>> {
        debug!("Opening SSH session to {}", target.address());

        let tcp = Self::open_tcp(target, profile)?;
        let mut session = Session::new()
            .map_err(|e| BackupError::Connection(format!("failed to create SSH session: {}", e)))?;

        Self::apply_method_prefs(&session);
        session.set_tcp_stream(tcp);
        session.set_timeout(profile.connect_timeout.as_millis() as u32);
        session.handshake().map_err(|e| {
            BackupError::Connection(format!("SSH handshake with {} failed: {}", target.host, e))
        })?;

        Self::authenticate(&session, target)?;

        let mut ssh = SshSession { session };
        ssh.tune(profile);
        Ok(Box::new(ssh))
    }
}

pub struct SshSession {
    session: Session,
}

impl RemoteSession for SshSession {
    fn tune(&mut self, profile: &SessionProfile) {
        self.session
            .set_keepalive(true, profile.keepalive_interval.as_secs().max(1) as u32);
        self.session
            .set_timeout(profile.liveness_window().as_millis() as u32);
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        let mut stdout = Vec::new();
        channel.read_to_end(&mut stdout)?;
        let mut stderr = Vec::new();
        channel.stderr().read_to_end(&mut stderr)?;

        channel.wait_close()?;
        let exit_code = channel.exit_status()?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    fn stat_size(&mut self, path: &str) -> Result<u64> {
        let sftp = self.session.sftp()?;
        let stat = sftp
            .stat(Path::new(path))
            .map_err(|e| BackupError::Transfer(format!("cannot stat {}: {}", path, e)))?;
        stat.size
            .ok_or_else(|| BackupError::Transfer(format!("server reported no size for {}", path)))
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>> {
        let sftp = self.session.sftp()?;
        let file = sftp
            .open(Path::new(path))
            .map_err(|e| BackupError::Transfer(format!("cannot open {}: {}", path, e)))?;
        Ok(Box::new(file))
    }

    fn fast_get(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        plan: CopyPlan,
        progress: ProgressFn,
    ) -> Result<u64> {
        let sftp = self.session.sftp()?;
        let total = sftp
            .stat(Path::new(remote_path))
            .map_err(|e| BackupError::Transfer(format!("cannot stat {}: {}", remote_path, e)))?
            .size
            .unwrap_or(0);

        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(local_path)?.set_len(total)?;

        let open = || -> Result<_> {
            let remote = sftp.open(Path::new(remote_path)).map_err(|e| {
                BackupError::Transfer(format!("cannot open {}: {}", remote_path, e))
            })?;
            let local = OpenOptions::new().write(true).open(local_path)?;
            Ok((remote, local))
        };
        ChunkedCopy::new(total, plan).run(open, &self.session, &progress)?;

        Ok(total)
    }

    fn fast_put(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        plan: CopyPlan,
        progress: ProgressFn,
    ) -> Result<u64> {
        let total = std::fs::metadata(local_path)?.len();
        let sftp = self.session.sftp()?;
        // truncate once, workers then write at their own offsets
        drop(sftp.create(Path::new(remote_path)).map_err(|e| {
            BackupError::Transfer(format!("cannot create {}: {}", remote_path, e))
        })?);

        let open = || -> Result<_> {
            let local = std::fs::File::open(local_path)?;
            let remote = sftp
                .open_mode(Path::new(remote_path), OpenFlags::WRITE, 0o644, OpenType::File)
                .map_err(|e| BackupError::Transfer(format!("cannot open {}: {}", remote_path, e)))?;
            Ok((local, remote))
        };
        ChunkedCopy::new(total, plan).run(open, &self.session, &progress)?;

        Ok(total)
    }
}

/// Splits a file into fixed-size chunks and lets a pool of scoped worker
/// threads claim them from a shared cursor. Each worker owns its own pair of
/// handles, so seeks never race.
struct ChunkedCopy {
    total: u64,
    chunk_size: u64,
    chunks: u64,
    workers: usize,
}

impl ChunkedCopy {
    fn new(total: u64, plan: CopyPlan) -> Self {
        let chunk_size = plan.chunk_size.max(1) as u64;
        let chunks = total.div_ceil(chunk_size);
        let workers = plan
            .concurrency
            .min(MAX_COPY_WORKERS)
            .min(chunks.max(1) as usize)
            .max(1);
        Self {
            total,
            chunk_size,
            chunks,
            workers,
        }
    }

    fn run<R, W, F>(&self, open: F, session: &Session, progress: &ProgressFn) -> Result<()>
    where
        R: Read + Seek,
        W: Write + Seek,
        F: Fn() -> Result<(R, W)> + Sync,
    {
        let cursor = AtomicU64::new(0);
        let copied = AtomicU64::new(0);
        let aborted = AtomicBool::new(false);

        let outcome = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.workers)
                .map(|_| {
                    scope.spawn(|| {
                        let result = self.worker(&open, session, &cursor, &copied, &aborted, progress);
                        if result.is_err() {
                            aborted.store(true, Ordering::Relaxed);
                        }
                        result
                    })
                })
                .collect();

            let mut first_error = None;
            for handle in handles {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| Err(BackupError::Transfer("copy worker panicked".to_string())));
                if let Err(e) = result {
                    first_error.get_or_insert(e);
                }
            }
            first_error.map_or(Ok(()), Err)
        });
        outcome?;

        let copied = copied.load(Ordering::Relaxed);
        if copied != self.total {
            return Err(BackupError::Transfer(format!(
                "short copy: {} of {} bytes",
                copied, self.total
            )));
        }
        Ok(())
    }

    fn worker<R, W, F>(
        &self,
        open: &F,
        session: &Session,
        cursor: &AtomicU64,
        copied: &AtomicU64,
        aborted: &AtomicBool,
        progress: &ProgressFn,
    ) -> Result<()>
    where
        R: Read + Seek,
        W: Write + Seek,
        F: Fn() -> Result<(R, W)>,
    {
        let (mut src, mut dst) = open()?;
        let mut buf = vec![0u8; self.chunk_size as usize];

        loop {
            if aborted.load(Ordering::Relaxed) {
                return Ok(());
            }
            let index = cursor.fetch_add(1, Ordering::Relaxed);
            if index >= self.chunks {
                return Ok(());
            }

            let offset = index * self.chunk_size;
            let len = self.chunk_size.min(self.total - offset) as usize;

            src.seek(SeekFrom::Start(offset))?;
            read_full(&mut src, &mut buf[..len])?;
            dst.seek(SeekFrom::Start(offset))?;
            dst.write_all(&buf[..len])?;

            // no-op unless an interval has elapsed
            let _ = session.keepalive_send();

            let done = copied.fetch_add(len as u64, Ordering::Relaxed) + len as u64;
            progress(done, self.total);
        }
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(BackupError::Transfer(format!(
                "unexpected end of file after {} of {} bytes in chunk",
                filled,
                buf.len()
            )));
        }
        filled += n;
    }
    Ok(())
}
