//! Scripted in-memory transport for tests.

use super::{
    CommandOutput, ConnectionTarget, CopyPlan, Credential, ProgressFn, RemoteSession,
    SessionProfile, Transport,
};
use crate::error::{BackupError, Result};
use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub fn target(host: &str) -> ConnectionTarget {
    ConnectionTarget {
        host: host.to_string(),
        port: 22,
        username: "backup".to_string(),
        credential: Credential::Password {
            password: "secret".to_string(),
        },
    }
}

#[derive(Default)]
struct FakeState {
    files: HashMap<String, Vec<u8>>,
    size_overrides: HashMap<String, u64>,
    dirs: HashSet<String>,
    tools: HashSet<String>,
    unreachable: HashSet<String>,
    failing_commands: Vec<String>,
    copy_failures: u32,
    commands: Vec<String>,
    copy_plans: Vec<CopyPlan>,
    profiles: Vec<SessionProfile>,
    connects: u32,
    archive_content: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.state().archive_content = b"PK fake archive contents".to_vec();
        fake
    }

    pub fn into_transport(self) -> Arc<dyn Transport> {
        Arc::new(self)
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_dir(&self, path: &str) {
        self.state().dirs.insert(path.to_string());
    }

    pub fn add_tool(&self, tool: &str) {
        self.state().tools.insert(tool.to_string());
    }

    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.state().files.insert(path.to_string(), content.to_vec());
    }

    /// Reported by `stat_size` instead of the real content length.
    pub fn set_size(&self, path: &str, size: u64) {
        self.state().size_overrides.insert(path.to_string(), size);
    }

    pub fn set_archive_size(&self, size: u64) {
        self.state().size_overrides.insert("*archive*".to_string(), size);
    }

    pub fn mark_unreachable(&self, host: &str) {
        self.state().unreachable.insert(host.to_string());
    }

    pub fn fail_commands_containing(&self, needle: &str) {
        self.state().failing_commands.push(needle.to_string());
    }

    pub fn fail_next_copies(&self, count: u32) {
        self.state().copy_failures = count;
    }

    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn copy_plans(&self) -> Vec<CopyPlan> {
        self.state().copy_plans.clone()
    }

    pub fn profiles(&self) -> Vec<SessionProfile> {
        self.state().profiles.clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.state().connects
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.state().files.contains_key(path)
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().files.get(path).cloned()
    }

    pub fn files_with_suffix(&self, suffix: &str) -> Vec<String> {
        self.state()
            .files
            .keys()
            .filter(|k| k.ends_with(suffix))
            .cloned()
            .collect()
    }
}

impl Transport for FakeTransport {
    fn connect(
        &self,
        target: &ConnectionTarget,
        profile: &SessionProfile,
    ) -> Result<Box<dyn RemoteSession>> {
        let mut state = self.state();
        if state.unreachable.contains(&target.host) {
            return Err(BackupError::Connection(format!(
                "failed to connect to {}: connection refused",
                target.address()
            )));
        }
        state.connects += 1;
        state.profiles.push(profile.clone());
        Ok(Box::new(FakeSession {
            state: self.state.clone(),
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<FakeState>>,
}

fn quoted_args(command: &str) -> Vec<String> {
    command
        .split('\'')
        .enumerate()
        .filter(|(i, _)| i % 2 == 1)
        .map(|(_, s)| s.to_string())
        .collect()
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        stdout: stdout.into(),
        stderr: String::new(),
        exit_code: 0,
    }
}

impl FakeSession {
    fn size_of(state: &FakeState, path: &str) -> Option<u64> {
        if let Some(size) = state.size_overrides.get(path) {
            return Some(*size);
        }
        let is_archive = path.ends_with(".zip") || path.ends_with(".tar.gz");
        if is_archive {
            if let Some(size) = state.size_overrides.get("*archive*") {
                if state.files.contains_key(path) {
                    return Some(*size);
                }
            }
        }
        state.files.get(path).map(|f| f.len() as u64)
    }
}

impl RemoteSession for FakeSession {
    fn tune(&mut self, profile: &SessionProfile) {
        self.state.lock().unwrap().profiles.push(profile.clone());
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_string());

        if state.failing_commands.iter().any(|n| command.contains(n.as_str())) {
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: "simulated failure".to_string(),
                exit_code: 1,
            });
        }

        let args = quoted_args(command);
        if command == "echo ok" {
            return Ok(ok("ok\n"));
        }
        if command.starts_with("if [ -d ") {
            let exists = args.first().map_or(false, |p| state.dirs.contains(p));
            return Ok(ok(if exists { "exists\n" } else { "missing\n" }));
        }
        if let Some(rest) = command.strip_prefix("for t in ") {
            let tools = rest.split("; do").next().unwrap_or_default();
            let lines: Vec<String> = tools
                .split_whitespace()
                .map(|t| {
                    let state_word = if state.tools.contains(t) { "found" } else { "missing" };
                    format!("{}={}", t, state_word)
                })
                .collect();
            return Ok(ok(lines.join("\n")));
        }
        if command.contains("nice -n 19") {
            if let Some(archive) = args
                .iter()
                .find(|a| a.ends_with(".zip") || a.ends_with(".tar.gz"))
            {
                let content = state.archive_content.clone();
                state.files.insert(archive.clone(), content);
            }
            return Ok(ok(""));
        }
        if command.starts_with("rm -f ") {
            if let Some(path) = args.first() {
                state.files.remove(path);
            }
            return Ok(ok(""));
        }
        if command.starts_with("rclone copyto ") {
            if !state.tools.contains("rclone") {
                return Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: "rclone: command not found".to_string(),
                    exit_code: 127,
                });
            }
            return Ok(ok(""));
        }
        if command.starts_with("rclone lsjson ") {
            let name = args
                .get(0)
                .and_then(|a| a.rsplit(':').next())
                .unwrap_or_default()
                .to_string();
            return Ok(ok(format!(
                "[{{\"Path\":\"{0}\",\"Name\":\"{0}\",\"ID\":\"rclone-object-1\"}}]",
                name
            )));
        }
        Ok(ok(""))
    }

    fn stat_size(&mut self, path: &str) -> Result<u64> {
        let state = self.state.lock().unwrap();
        FakeSession::size_of(&state, path)
            .ok_or_else(|| BackupError::Transfer(format!("cannot stat {}: no such file", path)))
    }

    fn open_read(&mut self, path: &str) -> Result<Box<dyn Read + Send>> {
        let state = self.state.lock().unwrap();
        let content = state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| BackupError::Transfer(format!("cannot open {}: no such file", path)))?;
        Ok(Box::new(Cursor::new(content)))
    }

    fn fast_get(
        &mut self,
        remote_path: &str,
        local_path: &Path,
        plan: CopyPlan,
        progress: ProgressFn,
    ) -> Result<u64> {
        let (content, fail) = {
            let mut state = self.state.lock().unwrap();
            state.copy_plans.push(plan);
            let fail = state.copy_failures > 0;
            if fail {
                state.copy_failures -= 1;
            }
            let content = state.files.get(remote_path).cloned().ok_or_else(|| {
                BackupError::Transfer(format!("cannot open {}: no such file", remote_path))
            })?;
            (content, fail)
        };

        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if fail {
            // like the real copy: the destination is pre-sized before any chunk lands
            std::fs::File::create(local_path)?.set_len(content.len() as u64)?;
            return Err(BackupError::Transfer("simulated copy failure".to_string()));
        }
        std::fs::write(local_path, &content)?;
        let len = content.len() as u64;
        progress(len, len);
        Ok(len)
    }

    fn fast_put(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        plan: CopyPlan,
        progress: ProgressFn,
    ) -> Result<u64> {
        let content = std::fs::read(local_path)?;
        let mut state = self.state.lock().unwrap();
        state.copy_plans.push(plan);
        if state.copy_failures > 0 {
            state.copy_failures -= 1;
            return Err(BackupError::Transfer("simulated copy failure".to_string()));
        }
        let len = content.len() as u64;
        state.files.insert(remote_path.to_string(), content);
        drop(state);
        progress(len, len);
        Ok(len)
    }
}
