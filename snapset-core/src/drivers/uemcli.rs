//! Unified storage CLI session shared by the unified-block and unified-NAS
//! drivers.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::parse::{nvp_records, Record};
use crate::cmd::{CmdError, CmdOutput, CommandLine, CommandRunner};
use crate::error::{DriverFault, Error, Result};

static ERROR_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Error code:\s*(0x[0-9a-fA-F]+)").expect("static regex"));

const UNREACHABLE: &[&str] = &[
    "Unable to connect",
    "Connection refused",
    "timed out",
    "Service Unavailable",
];

const EXISTS: &[&str] = &["already exists", "already in use"];

const NOT_FOUND: &[&str] = &["does not exist", "not found", "cannot be found"];

pub struct UemCli {
    cli: String,
    address: String,
    user: String,
    password: String,
    runner: Arc<dyn CommandRunner>,
}

impl UemCli {
    pub fn new(
        cli: impl Into<String>,
        address: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            cli: cli.into(),
            address: address.into(),
            user: user.into(),
            password: password.into(),
            runner,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn command(&self, args: &[&str]) -> CommandLine {
        CommandLine::new(&self.cli)
            .args(["-d", self.address.as_str(), "-u", self.user.as_str()])
            .args(["-p", self.password.as_str()])
            .args(["-sslPolicy", "accept"])
            .args(args.iter().copied())
    }

    /// Run one command; `resource` names what the call is about in errors.
    pub async fn run(&self, resource: &str, args: &[&str]) -> Result<String> {
        let cmd = self.command(args);
        debug!(command = %cmd, "Running unified CLI command");
        match self.runner.output(&cmd).await {
            Ok(out) if out.success() && !out.stdout.contains("Operation failed") => Ok(out.stdout),
            Ok(out) => Err(Error::Vendor(classify(resource, &out))),
            Err(CmdError::Timeout { secs, .. }) => Err(Error::vendor_transient(
                resource,
                format!("no answer from {} in {}s", self.address, secs),
            )),
            Err(e) => Err(Error::vendor_fatal(resource, e.to_string())),
        }
    }

    /// `<object> show -detail -output nvp`, parsed.
    pub async fn show(&self, resource: &str, object: &[&str]) -> Result<Vec<Record>> {
        let mut args = object.to_vec();
        args.extend(["show", "-detail", "-output", "nvp"]);
        let out = self.run(resource, &args).await?;
        Ok(nvp_records(&out))
    }
}

fn classify(resource: &str, out: &CmdOutput) -> DriverFault {
    let text = out.combined();
    let message = text.trim().to_string();
    let fault = if UNREACHABLE.iter().any(|s| text.contains(s)) {
        DriverFault::transient(resource, message)
    } else {
        DriverFault::fatal(resource, message)
    };
    match ERROR_CODE.captures(&text).and_then(|c| c.get(1)) {
        Some(code) => fault.with_code(code.as_str().to_ascii_lowercase()),
        None => fault,
    }
}

fn message_has(err: &Error, needles: &[&str]) -> bool {
    match err {
        Error::Vendor(fault) => {
            let message = fault.message.to_ascii_lowercase();
            needles.iter().any(|n| message.contains(n))
        }
        _ => false,
    }
}

/// The object named in the call already exists.
pub(super) fn is_exists(err: &Error) -> bool {
    message_has(err, EXISTS)
}

/// The object named in the call does not exist.
pub(super) fn is_not_found(err: &Error) -> bool {
    message_has(err, NOT_FOUND)
}

/// `107374182400 (100.0G)` or a bare byte count, in MiB.
pub(super) fn bytes_to_mb(value: &str) -> Option<u64> {
    let bytes: u64 = value.split_whitespace().next()?.parse().ok()?;
    Some(bytes.div_ceil(1024 * 1024))
}
