//! Nostr event model.

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Common examples include:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
/// - `d` – unique identifier for replaceable events
/// - `r` – relay URL in a relay list
///
/// Each tag is kept verbatim so uncommon or custom tags survive a round trip
/// through the cache. For example, `["t", "news"]` is represented as
/// `Tag(vec!["t".into(), "news".into()])`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag type, the first element.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First data element following the tag type.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Signed record received from a relay.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "npub...",
///   "kind": 30023,
///   "created_at": 1700000000,
///   "tags": [["d", "slug"]],
///   "content": "hello",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `1` or `30023`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags such as `d` (identifier) or `t` (topic).
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

/// Reasons an event fails id or signature verification.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("id mismatch: expected {expected}, computed {computed}")]
    IdMismatch { expected: String, computed: String },
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid key or signature: {0}")]
    Secp(#[from] secp256k1::Error),
    #[error("serializing event: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Event {
    /// Values of every tag named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// Recompute the NIP-01 event hash from its fields.
    pub fn hash(&self) -> Result<[u8; 32], serde_json::Error> {
        let arr = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        let data = serde_json::to_vec(&arr)?;
        Ok(Sha256::digest(&data).into())
    }

    /// Verify the event id and Schnorr signature.
    pub fn verify(&self) -> Result<(), VerifyError> {
        let hash = self.hash()?;
        let computed = hex::encode(hash);
        if computed != self.id {
            return Err(VerifyError::IdMismatch {
                expected: self.id.clone(),
                computed,
            });
        }
        let sig = Signature::from_slice(&hex::decode(&self.sig)?)?;
        let pk = XOnlyPublicKey::from_slice(&hex::decode(&self.pubkey)?)?;
        let secp = Secp256k1::verification_only();
        let msg = Message::from_digest(hash);
        secp.verify_schnorr(&sig, &msg, &pk)?;
        Ok(())
    }
}
