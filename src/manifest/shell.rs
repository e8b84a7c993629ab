use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::graph::node::{Body, body};
use crate::resource::{Resource, ResourceObject};
use crate::runner::result::Failure;
use crate::runner::status::Status;

/// Stdout prefix a body prints to mark one of its resources dirty.
pub const DIRTY_MARKER: &str = "DTEST_DIRTY:";

/// Runs manifest scripts.
#[derive(Debug, Clone)]
pub struct Shell {
    /// Shell interpreter (default: "/bin/sh").
    pub shell: String,
    /// Directory scripts run in.
    pub working_dir: PathBuf,
}

impl Shell {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell: "/bin/sh".to_owned(),
            working_dir: working_dir.into(),
        }
    }

    /// Run `script` with `args` as `$1..` and extra environment.
    ///
    /// # Errors
    ///
    /// Returns [`Failure::Error`] if the shell could not be started.
    pub fn run(
        &self,
        script: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<ProcessOutput, Failure> {
        let start = Instant::now();
        let mut cmd = Command::new(&self.shell);
        cmd.current_dir(&self.working_dir).arg("-c").arg(script).arg("dtest").args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let output = cmd
            .output()
            .map_err(|e| Failure::error(format!("failed to execute {}: {e}", self.shell)))?;

        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        })
    }
}

/// Raw output from a script execution.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutput {
    fn describe(&self) -> String {
        match self.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => format!("exit status {}: {}", self.exit_code, line.trim()),
            None => format!("exit status {}", self.exit_code),
        }
    }
}

/// Environment variable name for a parameter or option: upper-cased, with
/// anything but ASCII alphanumerics replaced by `_`.
pub fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// A node body running `script`.
///
/// Exit 0 passes, exit 1 fails, anything else is an error. Bound resources
/// are exported as `DTEST_RESOURCE_<PARAM>`; params listed in `dirties`, or
/// printed as `DTEST_DIRTY:<param>`, are marked dirty.
pub fn shell_body(shell: Arc<Shell>, script: String, dirties: Vec<String>) -> Body {
    body(move |ctx| {
        let mut env = vec![("DTEST_NODE".to_owned(), ctx.id.to_owned())];
        for (param, handle) in ctx.resources() {
            let value = handle.read(|v: &String| v.clone())?;
            env.push((format!("DTEST_RESOURCE_{}", env_name(param)), value));
        }

        let output = shell.run(&script, &[], &env)?;
        debug!(node = ctx.id, exit = output.exit_code, "script finished");
        ctx.capture("stdout", output.stdout.as_str());
        ctx.capture("stderr", output.stderr.as_str());

        for line in output.stdout.lines() {
            if let Some(param) = line.trim().strip_prefix(DIRTY_MARKER) {
                ctx.resource(param.trim())?.mark_dirty();
            }
        }
        for param in &dirties {
            ctx.resource(param)?.mark_dirty();
        }

        match output.exit_code {
            0 => Ok(()),
            1 => Err(Failure::assertion(output.describe())),
            _ => Err(Failure::error(output.describe())),
        }
    })
}

/// A resource whose value is the trimmed stdout of a set up script.
pub struct ShellResource {
    pub name: String,
    pub set_up: String,
    pub tear_down: Option<String>,
    pub oneshot: bool,
    pub shell: Arc<Shell>,
}

impl Resource for ShellResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_up(
        &self,
        args: &[String],
        options: &BTreeMap<String, String>,
    ) -> Result<ResourceObject, Failure> {
        let env: Vec<(String, String)> = options
            .iter()
            .map(|(k, v)| (format!("DTEST_OPT_{}", env_name(k)), v.clone()))
            .collect();
        let output = self.shell.run(&self.set_up, args, &env)?;
        if output.exit_code != 0 {
            return Err(Failure::error(output.describe()));
        }
        Ok(Box::new(output.stdout.trim().to_owned()))
    }

    fn tear_down(&self, object: ResourceObject, status: Option<Status>) -> Result<(), Failure> {
        let Some(script) = &self.tear_down else {
            return Ok(());
        };
        let value = object
            .downcast::<String>()
            .map_err(|_| Failure::error(format!("resource {} does not hold a string", self.name)))?;
        let env = vec![
            ("DTEST_RESOURCE".to_owned(), *value),
            ("DTEST_STATUS".to_owned(), status.map(|s| s.to_string()).unwrap_or_default()),
        ];
        let output = self.shell.run(script, &[], &env)?;
        if output.exit_code != 0 {
            return Err(Failure::error(output.describe()));
        }
        Ok(())
    }

    fn oneshot(&self) -> bool {
        self.oneshot
    }
}
