// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker command line templates.

use std::process::Stdio;

use tokio::process::Command;

use super::traits::WorkerSpec;

/// Program plus argument template used to start a worker.
///
/// Arguments may contain `{entry}`, `{dir}`, `{memory_mb}` and `{port}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::parse("node", "--max-old-space-size={memory_mb} {entry}")
    }
}

impl WorkerCommand {
    /// Build from a program and a whitespace separated argument template.
    pub fn parse(program: impl Into<String>, args: &str) -> Self {
        Self {
            program: program.into(),
            args: args.split_whitespace().map(str::to_string).collect(),
        }
    }

    /// Arguments with placeholders substituted.
    pub fn render_args(&self, spec: &WorkerSpec, port: Option<u16>) -> Vec<String> {
        let entry = spec.entry.to_string_lossy();
        let dir = spec.work_dir.to_string_lossy();
        let memory = spec.memory_mb.to_string();
        let port = port.map(|p| p.to_string()).unwrap_or_default();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{entry}", &entry)
                    .replace("{dir}", &dir)
                    .replace("{memory_mb}", &memory)
                    .replace("{port}", &port)
            })
            .collect()
    }

    /// Command for `spec`: runs in the worker directory with exactly the
    /// merged environment, stdout and stderr piped, killed when dropped.
    pub fn command(&self, spec: &WorkerSpec, port: Option<u16>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.render_args(spec, port))
            .current_dir(&spec.work_dir)
            .env_clear()
            .envs(spec.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(port) = port {
            cmd.env("PORT", port.to_string());
        }
        cmd
    }
}
