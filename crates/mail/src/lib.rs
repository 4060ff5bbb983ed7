//! E-mail composition, OpenPGP signing and delivery.
//!
//! - [`compose`] builds MIME messages with lettre. Text is always
//!   quoted-printable, and lines starting with `From ` are written as
//!   `From=20` so that mbox quoting cannot break signatures.
//! - [`sign`] holds the [`sign::Signer`] seam and the GnuPG implementation.
//! - [`transport`] sends composed messages over SMTP, or discards or
//!   prints them for dry runs.

pub mod compose;
pub mod error;
pub mod sign;
pub mod transport;

pub use compose::{compose, domain_from_sender, ComposedMail, MailDraft, TextPart};
pub use error::MailError;
pub use sign::{DetachedSignature, GpgSigner, HashAlgorithm, OpenPgpConfig, SignError, Signer};
pub use transport::{DiscardTransport, MailTransport, PreviewTransport, SmtpConfig, SmtpMailer};
