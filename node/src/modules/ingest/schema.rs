//! Advertisement and entry-chunk records.
//!
//! Nodes are DAG-CBOR with field names fixed by the wire protocol; links are
//! real IPLD links (CBOR tag 42) so chains interoperate with other
//! implementations. The provider signature covers a canonical concatenation
//! of the advertisement fields, in the fixed order implemented by
//! [`Advertisement::signing_bytes`].

use crate::modules::ingest::error::IngestError;
use cid::Cid;
use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use multihash::Multihash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA2-256 multihash code
pub const SHA2_256_CODE: u64 = 0x12;

/// DAG-CBOR codec identifier (0x71)
pub const DAG_CBOR_CODEC: u64 = 0x71;

/// Compute SHA2-256 multihash from data
pub fn sha256_multihash(data: &[u8]) -> Multihash<64> {
    let digest = Sha256::digest(data);
    Multihash::wrap(SHA2_256_CODE, &digest).expect("SHA256 digest is always 32 bytes")
}

/// CID of a DAG-CBOR node with the given encoded bytes.
pub fn dag_cbor_cid(data: &[u8]) -> Cid {
    Cid::new_v1(DAG_CBOR_CODEC, sha256_multihash(data))
}

/// Verify that `data` hashes to `cid`.
///
/// Only SHA2-256 CIDs are accepted; anything else fails closed.
pub fn verify_block(cid: &Cid, data: &[u8]) -> bool {
    if cid.hash().code() != SHA2_256_CODE {
        return false;
    }
    cid.hash().digest() == sha256_multihash(data).digest()
}

/// A provider-signed record describing one add or remove of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Back-pointer to the previous advertisement in the chain; absent for
    /// the first advertisement.
    #[serde(rename = "PreviousID", default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<Cid>,

    /// Base-encoded peer identity of the content provider.
    #[serde(rename = "Provider")]
    pub provider: String,

    /// Network addresses the provider serves content on.
    #[serde(rename = "Addresses")]
    pub addresses: Vec<String>,

    /// Signature over [`Advertisement::signing_bytes`].
    #[serde(rename = "Signature", with = "serde_bytes")]
    pub signature: Vec<u8>,

    /// Link to the first entry chunk.
    #[serde(rename = "Entries")]
    pub entries: Cid,

    /// Provider-chosen grouping key for this batch of content.
    #[serde(rename = "ContextID", with = "serde_bytes")]
    pub context_id: Vec<u8>,

    /// Opaque retrieval metadata.
    #[serde(rename = "Metadata", with = "serde_bytes")]
    pub metadata: Vec<u8>,

    /// Whether this advertisement removes previously-put content.
    #[serde(rename = "IsRm")]
    pub is_rm: bool,
}

/// A node in the linked list of multihash batches belonging to one
/// advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryChunk {
    /// Multihashes, raw bytes each.
    #[serde(rename = "Entries")]
    pub entries: Vec<serde_bytes::ByteBuf>,

    /// Link to the next chunk, absent on the last one.
    #[serde(rename = "Next", default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Cid>,
}

impl Advertisement {
    /// Decode an advertisement node, checking the bytes against `cid`.
    pub fn decode(cid: &Cid, data: &[u8]) -> Result<Self, IngestError> {
        if !verify_block(cid, data) {
            return Err(IngestError::Decode {
                cid: *cid,
                reason: "block bytes do not hash to CID".to_string(),
            });
        }
        serde_ipld_dagcbor::from_slice(data).map_err(|e| IngestError::Decode {
            cid: *cid,
            reason: e.to_string(),
        })
    }

    /// Encode to DAG-CBOR, returning the node's CID and bytes.
    pub fn encode(&self) -> Result<(Cid, Vec<u8>), IngestError> {
        let data = serde_ipld_dagcbor::to_vec(self).map_err(|e| IngestError::BadArgument(
            format!("advertisement does not encode: {}", e),
        ))?;
        Ok((dag_cbor_cid(&data), data))
    }

    /// The provider identity named inside the advertisement.
    pub fn provider_id(&self) -> Result<PeerId, IngestError> {
        self.provider
            .parse()
            .map_err(|e| IngestError::BadArgument(format!("invalid provider identity: {}", e)))
    }

    /// Canonical byte string the signature is computed over:
    /// `bytes(PreviousID) ‖ bytes(Entries) ‖ addr₀ ‖ … ‖ Metadata ‖
    /// (IsRm ? 0x01 : 0x00) ‖ ContextID`.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        if let Some(prev) = &self.previous_id {
            buf.extend_from_slice(&prev.to_bytes());
        }
        buf.extend_from_slice(&self.entries.to_bytes());
        for addr in &self.addresses {
            buf.extend_from_slice(addr.as_bytes());
        }
        buf.extend_from_slice(&self.metadata);
        buf.push(if self.is_rm { 0x01 } else { 0x00 });
        buf.extend_from_slice(&self.context_id);
        buf
    }

    /// Sign with the provider's keypair, replacing any existing signature.
    pub fn sign(&mut self, keypair: &Keypair) -> Result<(), IngestError> {
        self.signature = keypair
            .sign(&self.signing_bytes())
            .map_err(|e| IngestError::BadArgument(format!("signing failed: {}", e)))?;
        Ok(())
    }

    /// Verify the signature against the provider identity.
    ///
    /// `ad_cid` is only used for error reporting.
    pub fn verify_signature(&self, ad_cid: &Cid) -> Result<(), IngestError> {
        let provider = self
            .provider_id()
            .map_err(|e| IngestError::BadSignature {
                ad: *ad_cid,
                reason: e.to_string(),
            })?;

        let key = peer_public_key(&provider).ok_or_else(|| IngestError::BadSignature {
            ad: *ad_cid,
            reason: "provider identity does not embed a public key".to_string(),
        })?;

        if !key.verify(&self.signing_bytes(), &self.signature) {
            return Err(IngestError::BadSignature {
                ad: *ad_cid,
                reason: "signature does not verify".to_string(),
            });
        }
        Ok(())
    }
}

impl EntryChunk {
    /// Decode an entry-chunk node, checking the bytes against `cid`.
    pub fn decode(cid: &Cid, data: &[u8]) -> Result<Self, IngestError> {
        if !verify_block(cid, data) {
            return Err(IngestError::Decode {
                cid: *cid,
                reason: "block bytes do not hash to CID".to_string(),
            });
        }
        serde_ipld_dagcbor::from_slice(data).map_err(|e| IngestError::Decode {
            cid: *cid,
            reason: e.to_string(),
        })
    }

    /// Encode to DAG-CBOR, returning the node's CID and bytes.
    pub fn encode(&self) -> Result<(Cid, Vec<u8>), IngestError> {
        let data = serde_ipld_dagcbor::to_vec(self).map_err(|e| IngestError::BadArgument(
            format!("entry chunk does not encode: {}", e),
        ))?;
        Ok((dag_cbor_cid(&data), data))
    }

    /// Parse the chunk's entries as multihashes.
    pub fn multihashes(&self, cid: &Cid) -> Result<Vec<Multihash<64>>, IngestError> {
        self.entries
            .iter()
            .map(|raw| {
                Multihash::from_bytes(raw).map_err(|e| IngestError::Decode {
                    cid: *cid,
                    reason: format!("invalid multihash entry: {}", e),
                })
            })
            .collect()
    }
}

/// Recover the public key embedded in a peer identity.
///
/// Works for identities whose multihash is the identity hash (ed25519 keys
/// always inline); digest-style identities yield `None`.
pub fn peer_public_key(peer: &PeerId) -> Option<PublicKey> {
    const IDENTITY_CODE: u64 = 0x00;

    let mh = Multihash::<64>::from_bytes(&peer.to_bytes()).ok()?;
    if mh.code() != IDENTITY_CODE {
        return None;
    }
    PublicKey::try_decode_protobuf(mh.digest()).ok()
}
