use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result};

use crate::config::MigrationConfig;

/// Outcome of a single conversion attempt. Output and diagnostics are
/// mutually exclusive by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionResult {
    Converted { output: String },
    Failed { diagnostics: String },
}

impl ConversionResult {
    pub fn succeeded(&self) -> bool {
        matches!(self, ConversionResult::Converted { .. })
    }
}

/// Seam for the external markup conversion engine. One call performs exactly
/// one conversion attempt; retry policy lives in the orchestrator.
pub trait ConvertEngine {
    fn invoke(&self, source: &str) -> Result<ConversionResult>;
}

/// Production engine: pandoc invoked as a child process, source markup on
/// stdin, converted markup on stdout, parser diagnostics on stderr.
#[derive(Debug, Clone)]
pub struct PandocEngine {
    binary: String,
    args: Vec<String>,
}

impl PandocEngine {
    pub fn new(binary: String, args: Vec<String>) -> Self {
        Self { binary, args }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(config.engine_binary(), config.engine_args())
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

impl ConvertEngine for PandocEngine {
    fn invoke(&self, source: &str) -> Result<ConversionResult> {
        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to launch conversion engine `{}`", self.binary))?;

        let mut stdin = child
            .stdin
            .take()
            .context("conversion engine stdin was not piped")?;

        let output = thread::scope(|scope| {
            let bytes = source.as_bytes();
            scope.spawn(move || {
                // The engine may exit before draining stdin; that surfaces
                // as a nonzero exit status below, not as a write error here.
                let _ = stdin.write_all(bytes);
            });
            child.wait_with_output()
        })
        .with_context(|| format!("failed to collect output from `{}`", self.binary))?;

        if output.status.success() {
            match String::from_utf8(output.stdout) {
                Ok(converted) => Ok(ConversionResult::Converted { output: converted }),
                Err(error) => Ok(ConversionResult::Failed {
                    diagnostics: format!("engine produced invalid UTF-8 on stdout: {error}"),
                }),
            }
        } else {
            match String::from_utf8(output.stderr) {
                Ok(diagnostics) => Ok(ConversionResult::Failed { diagnostics }),
                Err(error) => Ok(ConversionResult::Failed {
                    diagnostics: format!("engine produced invalid UTF-8 on stderr: {error}"),
                }),
            }
        }
    }
}
