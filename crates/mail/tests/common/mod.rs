//! Shared helpers for mail integration tests.

use std::sync::Mutex;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use mailgen_mail::{DetachedSignature, HashAlgorithm, SignError, Signer};
use sha2::Sha256;

const KEY: &[u8] = b"mailgen test key";
const BEGIN: &str = "-----BEGIN PGP SIGNATURE-----";
const END: &str = "-----END PGP SIGNATURE-----";

/// Signs with HMAC-SHA256 and remembers what it was asked to sign. The MAC
/// is hex-encoded inside PGP armor lines so it looks like a signature part.
#[derive(Default)]
pub struct HmacSigner {
    pub signed: Mutex<Vec<Vec<u8>>>,
}

fn mac_hex(data: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(KEY).unwrap();
    mac.update(data);
    mac.finalize()
        .into_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Check an armored HMAC signature against `data`.
pub fn verify(data: &[u8], armored: &str) -> bool {
    let inner = armored
        .trim()
        .strip_prefix(BEGIN)
        .and_then(|s| s.strip_suffix(END))
        .map(str::trim);
    inner == Some(mac_hex(data).as_str())
}

#[async_trait]
impl Signer for HmacSigner {
    async fn detached_signature(&self, data: &[u8]) -> Result<DetachedSignature, SignError> {
        self.signed.lock().unwrap().push(data.to_vec());
        Ok(DetachedSignature {
            armored: format!("{BEGIN}\n\n{}\n{END}\n", mac_hex(data)),
            hash_algorithm: HashAlgorithm::Sha256,
        })
    }

    async fn clearsign(&self, text: &str) -> Result<String, SignError> {
        Ok(format!(
            "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA256\n\n{text}\n{BEGIN}\n\n{}\n{END}\n",
            mac_hex(text.as_bytes())
        ))
    }
}

/// Split a `multipart/signed` message into the exact signed bytes and the
/// armored signature.
pub fn signed_region(raw: &[u8], boundary: &str) -> (Vec<u8>, String) {
    let open = format!("--{boundary}\r\n").into_bytes();
    let close = format!("\r\n--{boundary}").into_bytes();
    let start = find(raw, &open, 0).expect("first boundary") + open.len();
    let end = find(raw, &close, start).expect("second boundary");
    let signed = raw[start..end].to_vec();

    let sig_start = end + close.len();
    let rest = String::from_utf8_lossy(&raw[sig_start..]).into_owned();
    let b = rest.find(BEGIN).expect("signature begin");
    let e = rest.find(END).expect("signature end") + END.len();
    (signed, rest[b..e].to_string())
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}
