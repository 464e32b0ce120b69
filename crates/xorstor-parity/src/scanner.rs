//! Change-event producer.
//!
//! Each node runs an external scanner over its own chunk tree and reads the
//! raw event stream from its standard output.

use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{info, warn};
use xorstor_common::config::ScannerConfig;
use xorstor_common::{Error, Result};

use crate::context::{ArtifactDir, StorageRoot};

/// Which changes to scan for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanMode {
    /// Every chunk currently present
    Complete,
    /// Changes inside a time range
    Partial { from: String, to: String },
}

impl ScanMode {
    /// Parse the command-line mode and range (`FROM:TO`, or `-` for none).
    pub fn parse(mode: &str, range: &str) -> Result<Self> {
        match mode {
            "complete" => Ok(Self::Complete),
            "partial" => {
                let (from, to) = range
                    .split_once(':')
                    .filter(|(from, to)| !from.is_empty() && !to.is_empty())
                    .ok_or_else(|| {
                        Error::config(format!("partial scan needs FROM:TO, got '{range}'"))
                    })?;
                Ok(Self::Partial {
                    from: from.to_string(),
                    to: to.to_string(),
                })
            }
            other => Err(Error::config(format!(
                "scan mode must be 'complete' or 'partial', got '{other}'"
            ))),
        }
    }
}

/// A running scanner process.
pub struct Scanner {
    child: Child,
}

impl Scanner {
    /// Start the configured scanner for `mode` over the chunk tree.
    pub fn spawn(config: &ScannerConfig, mode: &ScanMode, root: &StorageRoot) -> Result<Self> {
        let mut command = match mode {
            ScanMode::Complete => command_line(&config.complete_command)?,
            ScanMode::Partial { from, to } => {
                let mut command = command_line(&config.partial_command)?;
                command.args(["--from", from, "--to", to, "--store"]);
                command
            }
        };
        command
            .arg(root.dir(ArtifactDir::Chunks))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        info!("Starting scanner: {:?}", command);
        let child = command
            .spawn()
            .map_err(|e| Error::Scanner(format!("{:?}: {e}", command.get_program())))?;
        Ok(Self { child })
    }

    /// The raw event stream. Can be taken once.
    pub fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.child
            .stdout
            .take()
            .ok_or_else(|| Error::Scanner("scanner output already taken".to_string()))
    }

    /// Reap the process; a failed scan means some changes were missed.
    pub fn finish(mut self) -> Result<()> {
        let status = self.child.wait()?;
        if status.success() {
            Ok(())
        } else {
            warn!("Scanner exited with {}", status);
            Err(Error::Scanner(format!("scanner exited with {status}")))
        }
    }
}

fn command_line(line: &str) -> Result<Command> {
    let mut words = line.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| Error::config("empty scanner command"))?;
    let mut command = Command::new(program);
    command.args(words);
    Ok(command)
}

/// Whether `path` looks like a storage root this tool can work on.
#[must_use]
pub fn has_chunk_tree(path: &Path) -> bool {
    path.join(ArtifactDir::Chunks.dir_name()).is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_parse_modes() {
        assert_eq!(ScanMode::parse("complete", "-").unwrap(), ScanMode::Complete);
        assert_eq!(
            ScanMode::parse("partial", "1700000000:1700003600").unwrap(),
            ScanMode::Partial {
                from: "1700000000".to_string(),
                to: "1700003600".to_string()
            }
        );
        assert!(ScanMode::parse("partial", "-").is_err());
        assert!(ScanMode::parse("sideways", "-").is_err());
    }

    #[test]
    fn test_spawn_reads_stdout() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("chunks")).unwrap();
        let config = ScannerConfig {
            complete_command: "echo scanned".to_string(),
            partial_command: String::new(),
        };
        let mut scanner =
            Scanner::spawn(&config, &ScanMode::Complete, &StorageRoot::new(dir.path())).unwrap();
        let mut out = String::new();
        scanner.take_stdout().unwrap().read_to_string(&mut out).unwrap();
        scanner.finish().unwrap();
        assert!(out.starts_with("scanned "));
        assert!(has_chunk_tree(dir.path()));
    }

    #[test]
    fn test_failing_scanner() {
        let dir = tempdir().unwrap();
        let config = ScannerConfig {
            complete_command: "false".to_string(),
            partial_command: String::new(),
        };
        let scanner =
            Scanner::spawn(&config, &ScanMode::Complete, &StorageRoot::new(dir.path())).unwrap();
        assert!(matches!(scanner.finish(), Err(Error::Scanner(_))));

        let blank = ScannerConfig {
            complete_command: " ".to_string(),
            partial_command: String::new(),
        };
        let root = StorageRoot::new(dir.path());
        assert!(Scanner::spawn(&blank, &ScanMode::Complete, &root).is_err());
    }
}
