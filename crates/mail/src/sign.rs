//! OpenPGP signing.
//!
//! [`Signer`] is what composition needs: a detached, ASCII-armored signature
//! over exact bytes together with the hash algorithm used, and clearsigned
//! text. [`GpgSigner`] implements it by running GnuPG with a dedicated home
//! directory and signing key.

use std::path::PathBuf;

use async_trait::async_trait;
use mailgen_core::scripting::executor::{ScriptError, ScriptInput, ScriptOutput};
use mailgen_core::scripting::subprocess::run_command;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum SignError {
    #[error("OpenPGP signing failed: {0}")]
    Gpg(#[source] ScriptError),

    #[error("Signing key {0:?} not found in keyring")]
    KeyNotFound(String),

    #[error("GnuPG did not report a created signature")]
    MissingStatus,

    #[error("Unexpected hash algorithm {0:?}")]
    UnknownHashAlgorithm(String),
}

/// Hash algorithms accepted for `multipart/signed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// The `micalg` parameter value (RFC 3156).
    pub fn micalg(self) -> &'static str {
        match self {
            Self::Sha1 => "pgp-sha1",
            Self::Sha256 => "pgp-sha256",
            Self::Sha384 => "pgp-sha384",
            Self::Sha512 => "pgp-sha512",
        }
    }

    /// Map an OpenPGP hash algorithm id (RFC 4880, 9.4).
    pub fn from_openpgp_id(id: &str) -> Result<Self, SignError> {
        match id {
            "2" => Ok(Self::Sha1),
            "8" => Ok(Self::Sha256),
            "9" => Ok(Self::Sha384),
            "10" => Ok(Self::Sha512),
            other => Err(SignError::UnknownHashAlgorithm(other.to_string())),
        }
    }
}

/// A detached signature and the hash algorithm it was made with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedSignature {
    pub armored: String,
    pub hash_algorithm: HashAlgorithm,
}

#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign `data` exactly as given.
    async fn detached_signature(&self, data: &[u8]) -> Result<DetachedSignature, SignError>;

    /// Produce a cleartext-signed version of `text`.
    async fn clearsign(&self, text: &str) -> Result<String, SignError>;
}

// ---------------------------------------------------------------------------
// GnuPG
// ---------------------------------------------------------------------------

fn default_gpg_program() -> String {
    "gpg".to_string()
}

/// The `openpgp` configuration section. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenPgpConfig {
    pub always_sign: bool,
    pub gnupg_home: PathBuf,
    pub signing_key: String,
    #[serde(default = "default_gpg_program")]
    pub gpg_program: String,
}

/// Signs by running `gpg` in batch mode.
#[derive(Debug, Clone)]
pub struct GpgSigner {
    program: String,
    home: PathBuf,
    key: String,
}

impl GpgSigner {
    pub fn new(config: &OpenPgpConfig) -> Self {
        Self {
            program: config.gpg_program.clone(),
            home: config.gnupg_home.clone(),
            key: config.signing_key.clone(),
        }
    }

    fn base_args(&self) -> Vec<String> {
        vec![
            "--batch".to_string(),
            "--no-tty".to_string(),
            "--homedir".to_string(),
            self.home.display().to_string(),
        ]
    }

    fn signing_args(&self, mode: &str) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(
            [
                "--local-user",
                self.key.as_str(),
                "--armor",
                "--status-fd",
                "2",
                mode,
            ]
            .map(str::to_string),
        );
        args
    }

    async fn run(&self, args: Vec<String>, stdin: &[u8]) -> Result<ScriptOutput, SignError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        run_command(&mut cmd, ScriptInput::bytes(stdin).with_args(args))
            .await
            .and_then(ScriptOutput::check_success)
            .map_err(SignError::Gpg)
    }

    /// Check that the signing key's secret part is available.
    pub async fn verify_key(&self) -> Result<(), SignError> {
        let mut args = self.base_args();
        args.extend(["--list-secret-keys".to_string(), self.key.clone()]);
        let mut cmd = tokio::process::Command::new(&self.program);
        let output = run_command(&mut cmd, ScriptInput::default().with_args(args))
            .await
            .map_err(SignError::Gpg)?;
        if output.success() {
            Ok(())
        } else {
            Err(SignError::KeyNotFound(self.key.clone()))
        }
    }
}

/// Find the hash algorithm in a `SIG_CREATED` status line:
/// `[GNUPG:] SIG_CREATED <type> <pubkey-algo> <hash-algo> <class> ...`.
pub fn parse_sig_created(status: &str) -> Result<HashAlgorithm, SignError> {
    let line = status
        .lines()
        .find_map(|l| l.strip_prefix("[GNUPG:] SIG_CREATED "))
        .ok_or(SignError::MissingStatus)?;
    let hash_id = line
        .split_whitespace()
        .nth(2)
        .ok_or(SignError::MissingStatus)?;
    HashAlgorithm::from_openpgp_id(hash_id)
}

#[async_trait]
impl Signer for GpgSigner {
    async fn detached_signature(&self, data: &[u8]) -> Result<DetachedSignature, SignError> {
        let output = self.run(self.signing_args("--detach-sign"), data).await?;
        let hash_algorithm = parse_sig_created(&output.stderr)?;
        tracing::debug!(micalg = hash_algorithm.micalg(), "Created detached signature");
        Ok(DetachedSignature {
            armored: output.stdout,
            hash_algorithm,
        })
    }

    async fn clearsign(&self, text: &str) -> Result<String, SignError> {
        let output = self
            .run(self.signing_args("--clearsign"), text.as_bytes())
            .await?;
        Ok(output.stdout)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
