//! Credential lookup.
//!
//! The model only carries opaque password keys; a local decrypter turns
//! `(key, user)` into the password.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;

use crate::cmd::{CommandLine, CommandRunner};
use crate::error::{Error, Result};

#[async_trait]
pub trait Decrypter: Send + Sync {
    async fn password(&self, key: &str, user: &str) -> Result<String>;
}

/// Runs `<program> <key> <user>` and reads the password from stdout.
pub struct CommandDecrypter {
    program: String,
    runner: Arc<dyn CommandRunner>,
}

impl CommandDecrypter {
    pub fn new(program: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            program: program.into(),
            runner,
        }
    }
}

#[async_trait]
impl Decrypter for CommandDecrypter {
    async fn password(&self, key: &str, user: &str) -> Result<String> {
        let cmd = CommandLine::new(&self.program).args([key, user]);
        let out = self
            .runner
            .output_success(&cmd)
            .await
            .map_err(|e| Error::InvalidConfig(format!("no password for key {}: {}", key, e)))?;
        let password = out.stdout.trim_end_matches(['\r', '\n']).to_string();
        if password.is_empty() {
            return Err(Error::InvalidConfig(format!("no password for key {}", key)));
        }
        Ok(password)
    }
}

/// Fixed passwords keyed by `(key, user)`.
#[derive(Debug, Default, Clone)]
pub struct StaticDecrypter {
    passwords: HashMap<(String, String), String>,
}

impl StaticDecrypter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, user: &str, password: &str) -> Self {
        self.passwords
            .insert((key.to_string(), user.to_string()), password.to_string());
        self
    }
}

#[async_trait]
impl Decrypter for StaticDecrypter {
    async fn password(&self, key: &str, user: &str) -> Result<String> {
        self.passwords
            .get(&(key.to_string(), user.to_string()))
            .cloned()
            .ok_or_else(|| Error::InvalidConfig(format!("no password for key {}", key)))
    }
}

/// Base64 form in which passwords are handed to vendor wrappers.
pub fn encode_password(password: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedRunner;
    use crate::cmd::CmdOutput;

    #[tokio::test]
    async fn test_command_decrypter() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("decrypt san_key admin", CmdOutput::ok("s3cret\n"));
        let decrypter = CommandDecrypter::new("decrypt", runner.clone());

        assert_eq!(decrypter.password("san_key", "admin").await.unwrap(), "s3cret");
        assert!(decrypter.password("other", "admin").await.is_err());
    }

    #[tokio::test]
    async fn test_static_decrypter() {
        let decrypter = StaticDecrypter::new().with("k", "u", "p");
        assert_eq!(decrypter.password("k", "u").await.unwrap(), "p");
        assert!(matches!(
            decrypter.password("k", "x").await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_encode_password() {
        assert_eq!(encode_password("password"), "cGFzc3dvcmQ=");
    }
}
