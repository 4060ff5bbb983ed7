use crate::sign::SignError;

/// Error type for composing and sending mail.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// The recipient or sender address could not be parsed.
    #[error("Email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("Could not extract the domain from the sender ({0:?})")]
    DomainNotFound(String),

    #[error("Invalid content type: {0}")]
    ContentType(#[from] lettre::message::header::ContentTypeErr),

    /// The MIME message could not be assembled.
    #[error("Email build error: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("Cannot encode {0} part")]
    Encoding(&'static str),

    #[error(transparent)]
    Sign(#[from] SignError),

    /// SMTP transport-level failure (authentication, connection, etc.).
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("Cannot write preview: {0}")]
    Preview(#[from] std::io::Error),
}
