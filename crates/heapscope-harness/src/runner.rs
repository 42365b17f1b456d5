//! Target launcher.
//!
//! Runs a command with a heapscope options string in the environment, so a
//! build of the target that links the engine picks its configuration up at
//! first use. The wrapped program's exit code is passed through.

use std::io;
use std::process::Command;

use heapscope_core::OPTIONS_ENV;

/// What to launch and under which options.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// `KEY=VALUE` tokens, joined into the options string.
    pub options: Vec<String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn option(mut self, token: impl Into<String>) -> Self {
        self.options.push(token.into());
        self
    }

    /// The options string handed to the child.
    pub fn options_string(&self) -> String {
        self.options.join(" ")
    }
}

/// Launches the target and waits for it, returning its exit code. A child
/// killed by a signal maps to the customary 128 + signal number.
pub fn launch(spec: &LaunchSpec) -> io::Result<i32> {
    let status = Command::new(&spec.program)
        .args(&spec.args)
        .env(OPTIONS_ENV, spec.options_string())
        .status()?;
    Ok(status.code().unwrap_or_else(|| {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map_or(1, |s| 128 + s)
        }
        #[cfg(not(unix))]
        {
            1
        }
    }))
}
