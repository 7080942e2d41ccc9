use super::{ConnectionTarget, RemoteExecutor};
use crate::config::CompressionKind;
use crate::error::Result;
use crate::naming::shell_quote;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolReport {
    pub available: bool,
    pub missing: Vec<String>,
}

/// Read-only checks against the remote host.
#[derive(Clone)]
pub struct RemoteProbe {
    executor: RemoteExecutor,
}

impl RemoteProbe {
    pub fn new(executor: RemoteExecutor) -> Self {
        Self { executor }
    }

    /// `Ok(false)` for a missing directory; only transport failures error.
    pub async fn directory_exists(&self, target: &ConnectionTarget, path: &str) -> Result<bool> {
        let command = format!(
            "if [ -d {} ]; then echo exists; else echo missing; fi",
            shell_quote(path)
        );
        let output = self.executor.run_unchecked(target, &command).await?;
        Ok(output.stdout.trim() == "exists")
    }

    /// Checks every tool the archive format needs, in a single round trip.
    pub async fn check_required_tools(
        &self,
        target: &ConnectionTarget,
        kind: CompressionKind,
    ) -> Result<ToolReport> {
        let found = self.probe_tools(target, kind.required_tools()).await?;
        let missing: Vec<String> = kind
            .required_tools()
            .iter()
            .zip(found)
            .filter(|(_, present)| !present)
            .map(|(tool, _)| tool.to_string())
            .collect();

        Ok(ToolReport {
            available: missing.is_empty(),
            missing,
        })
    }

    pub async fn has_tool(&self, target: &ConnectionTarget, tool: &str) -> Result<bool> {
        let found = self.probe_tools(target, &[tool]).await?;
        Ok(found.first().copied().unwrap_or(false))
    }

    async fn probe_tools(&self, target: &ConnectionTarget, tools: &[&str]) -> Result<Vec<bool>> {
        let output = self.executor.run_unchecked(target, &tool_probe_command(tools)).await?;
        Ok(parse_tool_probe(tools, &output.stdout))
    }
}

fn tool_probe_command(tools: &[&str]) -> String {
    format!(
        "for t in {}; do if command -v \"$t\" >/dev/null 2>&1; then echo \"$t=found\"; else echo \"$t=missing\"; fi; done",
        tools.join(" ")
    )
}

fn parse_tool_probe(tools: &[&str], stdout: &str) -> Vec<bool> {
    tools
        .iter()
        .map(|tool| {
            stdout
                .lines()
                .filter_map(|line| line.trim().split_once('='))
                .any(|(name, state)| name == *tool && state == "found")
        })
        .collect()
}
