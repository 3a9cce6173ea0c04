//! Shared driver utilities: failure signatures, exit status decoding,
//! executable lookup and the batch script writer.

use crate::error::{Result, ToolError};
use indexmap::IndexMap;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            signal: None,
        }
    }

    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::signal(signal);
            }
        }
        Self {
            code: status.code(),
            signal: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

/// Map an exit outcome to the error it represents, if any.
///
/// Negative codes are treated as signals, which is how wrapper shells
/// commonly report them.
pub fn check_exit(outcome: ExitOutcome) -> std::result::Result<(), ToolError> {
    let signal = match (outcome.signal, outcome.code) {
        (Some(signal), _) => signal,
        (None, Some(code)) if code < 0 => -code,
        (None, Some(0)) | (None, None) => return Ok(()),
        (None, Some(code)) => return Err(ToolError::ExitCode(code)),
    };
    Err(signal_error(signal))
}

#[cfg(unix)]
fn signal_error(signal: i32) -> ToolError {
    match signal {
        libc::SIGSEGV => ToolError::SegmentationFault,
        libc::SIGKILL => ToolError::Killed,
        libc::SIGABRT => ToolError::Aborted,
        libc::SIGFPE => ToolError::FloatingPoint,
        other => ToolError::ExitCode(-other),
    }
}

#[cfg(not(unix))]
fn signal_error(signal: i32) -> ToolError {
    ToolError::ExitCode(-signal)
}

/// Scan program output for known failure signatures and report the first
/// one found.
pub fn scan_for_errors(records: &[String]) -> std::result::Result<(), ToolError> {
    for record in records {
        if record.contains("dyld: Library not loaded") {
            return Err(ToolError::LibraryNotLoaded(record.trim().to_string()));
        }
        if record.contains("command not found") {
            // bash: line 1: xds_par: command not found
            let tokens: Vec<&str> = record.split_whitespace().collect();
            let program = tokens
                .len()
                .checked_sub(4)
                .map(|i| tokens[i].trim_end_matches(':'))
                .unwrap_or("unknown");
            return Err(ToolError::NotAvailable(program.to_string()));
        }
        if record.contains("error while loading shared libraries") {
            let library = record
                .split(':')
                .map(str::trim)
                .find(|token| token.starts_with("lib"))
                .map(str::to_string)
                .unwrap_or_else(|| format!("({})", record.trim()));
            return Err(ToolError::MissingLibrary(library));
        }
        if record.contains("Segmentation fault") {
            return Err(ToolError::SegmentationFault);
        }
        if record.contains("Floating Exception") {
            return Err(ToolError::FloatingPoint);
        }
        if record.contains("Killed") {
            return Err(ToolError::Killed);
        }
        if record.contains("Aborted") || record.contains("Abort trap") {
            return Err(ToolError::Aborted);
        }
    }
    if let Some(message) = python_error(records) {
        return Err(ToolError::Traceback(message));
    }
    Ok(())
}

/// The error message following the first Python traceback, if any.
fn python_error(records: &[String]) -> Option<String> {
    let start = records
        .iter()
        .position(|r| r.contains("Traceback (most recent call last)"))?;
    let mut message = Vec::new();
    for record in &records[start + 1..] {
        let indented = record.starts_with(char::is_whitespace);
        if message.is_empty() && indented {
            continue;
        }
        if record.trim().len() < 5 {
            break;
        }
        let mut line = record.trim_end().to_string();
        if line.len() > 400 {
            line.truncate(400);
            line.push_str("...");
        }
        message.push(line);
    }
    (!message.is_empty()).then(|| message.join("\n"))
}

/// Locate `executable` on `PATH`, or check it directly if absolute.
pub fn find_executable(executable: &str) -> std::result::Result<PathBuf, ToolError> {
    let direct = Path::new(executable);
    if direct.is_absolute() {
        return if direct.is_file() {
            Ok(direct.to_path_buf())
        } else {
            Err(ToolError::NotAvailable(executable.to_string()))
        };
    }
    let path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path)
        .map(|dir| dir.join(executable))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| ToolError::NotAvailable(executable.to_string()))
}

/// Eight random lowercase letters, used to name batch jobs.
pub fn random_name() -> String {
    let mut seed = RandomState::new().build_hasher();
    seed.write_u128(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default(),
    );
    let mut value = seed.finish();
    (0..8)
        .map(|_| {
            let letter = (b'a' + (value % 26) as u8) as char;
            value /= 26;
            letter
        })
        .collect()
}

/// Write `<working_dir>/<script_name>.sh`, a bash script that runs the
/// program with the given environment and standard input, sending output to
/// `<script_name>.xout` and the exit status to `<script_name>.xstatus`.
pub fn script_writer(
    working_dir: &Path,
    script_name: &str,
    executable: &str,
    command_line: &[String],
    environment: &IndexMap<String, Vec<String>>,
    input: &[String],
) -> Result<PathBuf> {
    let path = working_dir.join(format!("{script_name}.sh"));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut script = std::io::BufWriter::new(std::fs::File::create(&path)?);

    writeln!(script, "#!/bin/bash\n")?;
    for (name, values) in environment {
        writeln!(script, "export {name}={}:${name}", values.join(":"))?;
    }
    writeln!(script, "rm -f {script_name}.xstatus")?;
    write!(script, "{executable} ")?;
    for token in command_line {
        write!(script, "'{token}' ")?;
    }
    writeln!(script, "<< eof > {script_name}.xout")?;
    for record in input {
        script.write_all(record.as_bytes())?;
        if !record.ends_with('\n') {
            writeln!(script)?;
        }
    }
    writeln!(script, "eof")?;
    writeln!(script, "echo \"$?\" > {script_name}.xstatus")?;
    script.flush()?;
    drop(script);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(path)
}
