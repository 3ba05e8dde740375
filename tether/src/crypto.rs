//! Hybrid encryption for kernel-launcher connection payloads.
//!
//! The host process owns a single RSA keypair. Its public key is handed to
//! every kernel launcher (base64 DER, via argv substitution). The launcher
//! generates a random 16-byte AES key, encrypts the JSON connection
//! information with AES-128-CBC/PKCS7 (random IV prepended to the
//! ciphertext), wraps the AES key with RSA PKCS#1 v1.5, and sends back:
//!
//! ```text
//! base64( JSON({ "version": 1,
//!                "key": base64( RSA(aes_key) ),
//!                "conn_info": base64( iv || AES_CBC(json) ) }) )
//! ```
//!
//! PKCS#1 v1.5 is deliberate: launchers exist in several languages and v1.5
//! is the padding they all share.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use rsa::{
    Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey,
    pkcs8::{DecodePublicKey, EncodePublicKey},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};

/// Payload format version understood by this engine.
pub const PAYLOAD_VERSION: u32 = 1;

const RSA_KEY_BITS: usize = 2048;
const AES_KEY_LEN: usize = 16;
const AES_BLOCK_LEN: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// The outer, unencrypted framing of a response payload.
#[derive(Debug, Deserialize, Serialize)]
struct Envelope {
    version: u32,
    key: String,
    conn_info: String,
}

/// The host-process RSA keypair used to unwrap launcher AES keys.
///
/// Created once per host process; the private key never leaves it.
pub struct Keypair {
    private_key: RsaPrivateKey,
    public_key_b64: String,
}

impl Keypair {
    /// Generates a fresh 2048-bit keypair.
    pub fn generate() -> Result<Self, Error> {
        let private_key =
            RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS).context(GenerateKeypairSnafu)?;
        let public_der =
            private_key.to_public_key().to_public_key_der().context(EncodePublicKeySnafu)?;
        let public_key_b64 = BASE64.encode(public_der.as_bytes());
        Ok(Self { private_key, public_key_b64 })
    }

    /// The public key as transport-safe base64 DER, suitable for argv
    /// substitution into a launcher command line.
    #[must_use]
    pub fn public_key(&self) -> &str { &self.public_key_b64 }

    /// Decrypts one response payload, returning the plaintext connection
    /// information JSON.
    pub fn decrypt_payload(&self, blob: &str) -> Result<Vec<u8>, Error> {
        let envelope_json =
            BASE64.decode(blob.trim().as_bytes()).context(DecodePayloadSnafu)?;
        let envelope: Envelope =
            serde_json::from_slice(&envelope_json).context(ParseEnvelopeSnafu)?;

        ensure!(
            envelope.version == PAYLOAD_VERSION,
            VersionMismatchSnafu { version: envelope.version }
        );

        let wrapped_key = BASE64.decode(envelope.key.as_bytes()).context(DecodePayloadSnafu)?;
        let aes_key =
            self.private_key.decrypt(Pkcs1v15Encrypt, &wrapped_key).context(UnwrapAesKeySnafu)?;
        ensure!(aes_key.len() == AES_KEY_LEN, InvalidAesKeyLengthSnafu { length: aes_key.len() });

        let conn_info =
            BASE64.decode(envelope.conn_info.as_bytes()).context(DecodePayloadSnafu)?;
        ensure!(conn_info.len() > AES_BLOCK_LEN, TruncatedConnectionInfoSnafu);
        let (iv, ciphertext) = conn_info.split_at(AES_BLOCK_LEN);

        let mut key_bytes = [0u8; AES_KEY_LEN];
        key_bytes.copy_from_slice(&aes_key);
        let mut iv_bytes = [0u8; AES_BLOCK_LEN];
        iv_bytes.copy_from_slice(iv);

        Aes128CbcDec::new(&key_bytes.into(), &iv_bytes.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::DecryptConnectionInfo)
    }
}

/// Encrypts connection information the way a kernel launcher does.
///
/// Lives here so the wire contract has a single authoritative definition;
/// production launchers reimplement it in their own language.
pub fn encrypt_payload(plaintext: &[u8], public_key_b64: &str) -> Result<String, Error> {
    let public_der = BASE64.decode(public_key_b64.as_bytes()).context(DecodePayloadSnafu)?;
    let public_key = RsaPublicKey::from_public_key_der(&public_der).context(ParsePublicKeySnafu)?;

    let mut rng = rand::thread_rng();
    let mut aes_key = [0u8; AES_KEY_LEN];
    rng.fill_bytes(&mut aes_key);
    let mut iv = [0u8; AES_BLOCK_LEN];
    rng.fill_bytes(&mut iv);

    let mut conn_info = iv.to_vec();
    conn_info.extend(
        Aes128CbcEnc::new(&aes_key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext),
    );

    let wrapped_key =
        public_key.encrypt(&mut rng, Pkcs1v15Encrypt, &aes_key).context(WrapAesKeySnafu)?;

    let envelope = Envelope {
        version: PAYLOAD_VERSION,
        key: BASE64.encode(wrapped_key),
        conn_info: BASE64.encode(conn_info),
    };
    let envelope_json = serde_json::to_vec(&envelope).context(ParseEnvelopeSnafu)?;
    Ok(BASE64.encode(envelope_json))
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to generate RSA keypair, error: {source}"))]
    GenerateKeypair { source: rsa::Error },

    #[snafu(display("Failed to encode RSA public key, error: {source}"))]
    EncodePublicKey { source: rsa::pkcs8::spki::Error },

    #[snafu(display("Failed to parse RSA public key, error: {source}"))]
    ParsePublicKey { source: rsa::pkcs8::spki::Error },

    #[snafu(display("Payload is not valid base64, error: {source}"))]
    DecodePayload { source: base64::DecodeError },

    #[snafu(display("Payload envelope is not valid JSON, error: {source}"))]
    ParseEnvelope { source: serde_json::Error },

    #[snafu(display("Unexpected payload version indicator: {version}"))]
    VersionMismatch { version: u32 },

    #[snafu(display("Failed to unwrap AES key with the process private key, error: {source}"))]
    UnwrapAesKey { source: rsa::Error },

    #[snafu(display("Failed to wrap AES key under the launcher public key, error: {source}"))]
    WrapAesKey { source: rsa::Error },

    #[snafu(display("Unwrapped AES key has unexpected length {length}"))]
    InvalidAesKeyLength { length: usize },

    #[snafu(display("Encrypted connection information is shorter than one AES block"))]
    TruncatedConnectionInfo,

    #[snafu(display("Failed to decrypt connection information"))]
    DecryptConnectionInfo,
}
