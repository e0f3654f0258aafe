//! The local tool set. Each tool runs against the policy snapshot that
//! allowed it and returns a JSON payload for the reasoning loop.

use std::path::Path;
use std::path::PathBuf;

use serde_json::Value;
use serde_json::json;
use sha2::Digest;
use sha2::Sha256;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use toolgate_security::Policy;
use toolgate_security::action::ReadFileArgs;
use toolgate_security::action::RepoSummaryArgs;
use toolgate_security::action::ShellExecArgs;
use toolgate_security::action::WriteFileArgs;
use toolgate_security::scope::PathAccess;
use toolgate_security::scope::tokenize;

use crate::error::InvokeError;
use crate::error::Result;
use crate::limits::ExecutionLimits;
use crate::output::Spool;
use crate::output::cap_output;
use crate::process;
use crate::process::ProcessError;

const SUMMARY_EXAMPLES: usize = 10;

/// Everything a tool needs besides its own arguments.
pub struct ToolContext<'a> {
    pub run_id: &'a str,
    pub policy: &'a Policy,
    pub limits: &'a ExecutionLimits,
    pub spool: Option<&'a Spool>,
}

/// What a tool produced.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub content: Value,
    pub truncated: bool,
    pub spool_paths: Vec<PathBuf>,
}

impl ToolContext<'_> {
    fn resolve(&self, requested: &str, access: PathAccess) -> Result<PathBuf> {
        self.policy
            .paths
            .check(requested, access)
            .map(|(path, _)| path)
            .map_err(|hit| InvokeError::tool(hit.reason))
    }

    fn relative<'p>(&self, path: &'p Path) -> &'p Path {
        path.strip_prefix(self.policy.paths.root()).unwrap_or(path)
    }

    fn spool_for<'s>(&'s self, label: &'s str) -> Option<(&'s Spool, &'s str, &'s str)> {
        if self.limits.spool {
            self.spool.map(|spool| (spool, self.run_id, label))
        } else {
            None
        }
    }
}

pub async fn read_file(ctx: &ToolContext<'_>, args: &ReadFileArgs) -> Result<ToolResult> {
    let path = ctx.resolve(&args.path, PathAccess::Read)?;
    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|err| InvokeError::from_io("read_file", &err))?;
    if !meta.is_file() {
        return Err(InvokeError::tool(format!("{} is not a regular file", args.path)));
    }
    let cap = ctx.limits.max_output_bytes;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|err| InvokeError::from_io("read_file", &err))?;
    let mut buf = Vec::with_capacity(cap.min(meta.len() as usize));
    file.take(cap as u64)
        .read_to_end(&mut buf)
        .await
        .map_err(|err| InvokeError::from_io("read_file", &err))?;

    let truncated = meta.len() > cap as u64;
    let mut content = String::from_utf8_lossy(&buf).into_owned();
    let relative = ctx.relative(&path).display().to_string();
    if truncated {
        content.push_str(&format!(
            "\n[truncated: showing {} of {} bytes; full content in {relative}]",
            buf.len(),
            meta.len()
        ));
    }
    Ok(ToolResult {
        content: json!({
            "path": relative,
            "bytes": meta.len(),
            "content": content,
            "truncated": truncated,
        }),
        truncated,
        spool_paths: Vec::new(),
    })
}

pub async fn write_file(ctx: &ToolContext<'_>, args: &WriteFileArgs) -> Result<ToolResult> {
    let path = ctx.resolve(&args.path, PathAccess::Write)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| InvokeError::from_io("write_file", &err))?;
    }
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.custom_flags(libc::O_NOFOLLOW);
    let mut file = options
        .open(&path)
        .await
        .map_err(|err| InvokeError::from_io("write_file", &err))?;
    file.write_all(args.content.as_bytes())
        .await
        .map_err(|err| InvokeError::from_io("write_file", &err))?;
    file.flush()
        .await
        .map_err(|err| InvokeError::from_io("write_file", &err))?;

    Ok(ToolResult {
        content: json!({
            "path": ctx.relative(&path).display().to_string(),
            "bytes_written": args.content.len(),
        }),
        ..Default::default()
    })
}

pub async fn shell_exec(ctx: &ToolContext<'_>, args: &ShellExecArgs) -> Result<ToolResult> {
    let argv = tokenize(&args.command)
        .filter(|argv| !argv.is_empty())
        .ok_or_else(|| InvokeError::tool("command could not be tokenized"))?;
    let cwd = match &args.cwd {
        Some(cwd) => ctx.resolve(cwd, PathAccess::WorkingDir)?,
        None => ctx.policy.paths.root().to_path_buf(),
    };

    let output = process::run(&argv, &cwd, None, ctx.limits)
        .await
        .map_err(|err| match err {
            ProcessError::Timeout { limit } => InvokeError::Timeout { limit },
            ProcessError::Io(io) => InvokeError::from_io("shell_exec", &io),
            spawn @ ProcessError::Spawn { .. } => InvokeError::tool(spawn.to_string()),
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let cap = ctx.limits.max_output_bytes;
    let stdout = cap_output(&stdout, cap, ctx.spool_for("stdout")).await;
    let stderr = cap_output(&stderr, cap, ctx.spool_for("stderr")).await;

    let content = json!({
        "command": args.command,
        "exit_code": output.exit_code,
        "stdout": stdout.text,
        "stderr": stderr.text,
        "duration_ms": output.elapsed.as_millis() as u64,
        "capture_overflowed": output.overflowed,
    });
    if !output.success() {
        let status = output
            .exit_code
            .map_or_else(|| "a signal".to_string(), |code| format!("status {code}"));
        return Err(InvokeError::Tool {
            message: format!("command exited with {status}"),
            transient: false,
            detail: content,
        });
    }
    Ok(ToolResult {
        content,
        truncated: stdout.truncated || stderr.truncated || output.overflowed,
        spool_paths: stdout.spool_path.into_iter().chain(stderr.spool_path).collect(),
    })
}

/// Walk the workspace (without following links), listing files the path
/// rules allow reading.
pub async fn repo_summary(ctx: &ToolContext<'_>, args: &RepoSummaryArgs) -> Result<ToolResult> {
    let scope = ctx.policy.paths.clone();
    let max_files = args.effective_max_files();
    let files = tokio::task::spawn_blocking(move || {
        let root = scope.root().to_path_buf();
        walkdir::WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || entry.file_name() != ".git")
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let relative = entry.path().strip_prefix(&root).ok()?.to_path_buf();
                scope.is_readable(&relative).then_some(relative)
            })
            .take(max_files)
            .map(|path| path.to_string_lossy().replace('\\', "/"))
            .collect::<Vec<_>>()
    })
    .await
    .map_err(|err| InvokeError::tool(format!("repo_summary worker failed: {err}")))?;

    let mut hasher = Sha256::new();
    for file in &files {
        hasher.update(file.as_bytes());
        hasher.update(b"\n");
    }
    let digest = format!("{:x}", hasher.finalize());
    Ok(ToolResult {
        content: json!({
            "root": ctx.policy.paths.root().display().to_string(),
            "files_indexed": files.len(),
            "digest": &digest[..16],
            "examples": files.iter().take(SUMMARY_EXAMPLES).collect::<Vec<_>>(),
        }),
        truncated: files.len() == max_files,
        spool_paths: Vec::new(),
    })
}

pub fn workspace_status(ctx: &ToolContext<'_>, extra: Value) -> ToolResult {
    let mut content = json!({
        "workspace": ctx.policy.paths.root().display().to_string(),
        "policy": ctx.policy.summary(),
        "limits": {
            "timeout_secs": ctx.limits.timeout.as_secs_f64(),
            "max_output_bytes": ctx.limits.max_output_bytes,
        },
    });
    if let (Value::Object(map), Value::Object(extra)) = (&mut content, extra) {
        map.extend(extra);
    }
    ToolResult {
        content,
        ..Default::default()
    }
}
