//! MIME message composition.
//!
//! A [`MailDraft`] describes the message: sender, recipient, subject, body
//! and any extra text parts. [`compose`] turns it into a [`lettre::Message`],
//! optionally wrapped into an RFC 3156 `multipart/signed` envelope.

use std::time::SystemTime;

use lettre::message::header::{
    ContentTransferEncoding, ContentType, Header, HeaderName, HeaderValue,
};
use lettre::message::{Attachment, Body, Mailbox, MultiPart, SinglePart};
use lettre::Message;
use mailgen_core::types::Timestamp;

use crate::error::MailError;
use crate::sign::Signer;

/// Protocol parameter and content type of detached OpenPGP signatures.
const PGP_SIGNATURE: &str = "application/pgp-signature";

// ---------------------------------------------------------------------------
// Draft
// ---------------------------------------------------------------------------

/// An additional text part: an attachment when it has a file name, an
/// inline part otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPart {
    /// Subtype of `text/*`, e.g. `csv` or `plain`.
    pub subtype: String,
    pub filename: Option<String>,
    pub content: String,
}

impl TextPart {
    pub fn attachment(subtype: &str, filename: &str, content: impl Into<String>) -> Self {
        Self {
            subtype: subtype.to_string(),
            filename: Some(filename.to_string()),
            content: content.into(),
        }
    }

    pub fn inline(subtype: &str, content: impl Into<String>) -> Self {
        Self {
            subtype: subtype.to_string(),
            filename: None,
            content: content.into(),
        }
    }
}

/// Everything needed to build one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailDraft {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub parts: Vec<TextPart>,
    /// Adds the `Auto-Submitted` and `X-ARF` headers of X-ARF reports.
    pub xarf_report: bool,
}

impl MailDraft {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            parts: Vec::new(),
            xarf_report: false,
        }
    }

    pub fn with_part(mut self, part: TextPart) -> Self {
        self.parts.push(part);
        self
    }

    pub fn as_xarf_report(mut self) -> Self {
        self.xarf_report = true;
        self
    }
}

/// A composed message with the values that were put into its headers.
#[derive(Debug, Clone)]
pub struct ComposedMail {
    pub message: Message,
    /// Value of the `Date` header; recorded as the send time.
    pub date: Timestamp,
    pub message_id: String,
}

impl ComposedMail {
    /// The message as it goes over the wire.
    pub fn formatted(&self) -> Vec<u8> {
        self.message.formatted()
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct AutoSubmitted(String);

impl Header for AutoSubmitted {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("Auto-Submitted")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct XArf(String);

impl Header for XArf {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-ARF")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

/// Extract the domain of the address in `sender`, which may carry a display
/// name (`CERT <cert@example.com>`).
pub fn domain_from_sender(sender: &str) -> Result<String, MailError> {
    sender
        .parse::<Mailbox>()
        .map(|mailbox| mailbox.email.domain().to_string())
        .map_err(|_| MailError::DomainNotFound(sender.to_string()))
}

/// Rewrite `From ` at the start of any line to `From=20`. Only valid on
/// quoted-printable data, where `=20` decodes back to a space.
pub fn escape_from_lines(encoded: &[u8]) -> Vec<u8> {
    const FROM: &[u8] = b"From ";
    let mut out = Vec::with_capacity(encoded.len());
    let mut at_line_start = true;
    let mut i = 0;
    while i < encoded.len() {
        if at_line_start && encoded[i..].starts_with(FROM) {
            out.extend_from_slice(b"From=20");
            i += FROM.len();
            at_line_start = false;
            continue;
        }
        at_line_start = encoded[i] == b'\n';
        out.push(encoded[i]);
        i += 1;
    }
    out
}

/// Quoted-printable body with `From ` lines escaped.
fn qp_body(text: &str) -> Result<Body, MailError> {
    let encoded = Body::new_with_encoding(text.to_string(), ContentTransferEncoding::QuotedPrintable)
        .map_err(|_| MailError::Encoding("text"))?;
    Ok(Body::dangerous_pre_encoded(
        escape_from_lines(&encoded.into_vec()),
        ContentTransferEncoding::QuotedPrintable,
    ))
}

fn text_part(part: &TextPart) -> Result<SinglePart, MailError> {
    let content_type = ContentType::parse(&format!("text/{}; charset=utf-8", part.subtype))?;
    let body = qp_body(&part.content)?;
    Ok(match &part.filename {
        Some(filename) => Attachment::new(filename.clone()).body(body, content_type),
        None => SinglePart::builder().header(content_type).body(body),
    })
}

/// The content that gets signed: a single text part, or the body plus all
/// extra parts as `multipart/mixed`.
enum Content {
    Single(SinglePart),
    Mixed(MultiPart),
}

impl Content {
    fn build(draft: &MailDraft) -> Result<Self, MailError> {
        let body = text_part(&TextPart::inline("plain", draft.body.clone()))?;
        if draft.parts.is_empty() {
            return Ok(Self::Single(body));
        }
        let mut mixed = MultiPart::mixed().singlepart(body);
        for part in &draft.parts {
            mixed = mixed.singlepart(text_part(part)?);
        }
        Ok(Self::Mixed(mixed))
    }

    /// Bytes covered by a detached signature: the part with its headers, up
    /// to but excluding the CRLF that belongs to the following boundary.
    fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = match self {
            Self::Single(part) => part.formatted(),
            Self::Mixed(part) => part.formatted(),
        };
        if bytes.ends_with(b"\r\n") {
            bytes.truncate(bytes.len() - 2);
        }
        bytes
    }
}

/// Build the message for `draft`. With a signer the content is wrapped in
/// `multipart/signed` with a detached, ASCII-armored signature.
pub async fn compose(
    draft: &MailDraft,
    signer: Option<&dyn Signer>,
    now: Timestamp,
) -> Result<ComposedMail, MailError> {
    let domain = domain_from_sender(&draft.sender)?;
    let message_id = format!("<{}@{domain}>", uuid::Uuid::new_v4());

    let mut builder = Message::builder()
        .from(draft.sender.parse()?)
        .to(draft.recipient.parse()?)
        .subject(draft.subject.clone())
        .date(SystemTime::from(now))
        .message_id(Some(message_id.clone()));
    if draft.xarf_report {
        builder = builder
            .header(AutoSubmitted("auto-generated".to_string()))
            .header(XArf("PLAIN".to_string()));
    }

    let content = Content::build(draft)?;
    let message = match signer {
        None => match content {
            Content::Single(part) => builder.singlepart(part)?,
            Content::Mixed(part) => builder.multipart(part)?,
        },
        Some(signer) => {
            let signature = signer.detached_signature(&content.signed_bytes()).await?;
            let signature_part = SinglePart::builder()
                .header(ContentType::parse(PGP_SIGNATURE)?)
                .body(
                    Body::new_with_encoding(signature.armored, ContentTransferEncoding::SevenBit)
                        .map_err(|_| MailError::Encoding("signature"))?,
                );
            let signed = MultiPart::signed(
                PGP_SIGNATURE.to_string(),
                signature.hash_algorithm.micalg().to_string(),
            );
            let signed = match content {
                Content::Single(part) => signed.singlepart(part),
                Content::Mixed(part) => signed.multipart(part),
            };
            builder.multipart(signed.singlepart(signature_part))?
        }
    };

    tracing::debug!(%message_id, signed = signer.is_some(), "Composed mail");
    Ok(ComposedMail {
        message,
        date: now,
        message_id,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
