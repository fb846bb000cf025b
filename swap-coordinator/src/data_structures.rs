use serde::{Deserialize, Serialize};
use std::fmt;

// 32-byte swap identifier, derived once at creation and never reassigned
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwapId(pub [u8; 32]);

impl SwapId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

// Short form for logs, full form through to_hex()
impl fmt::Display for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for SwapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapId({})", self)
    }
}

// Which of the two ledgers an instruction or observation belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerId {
    Base,   // account/contract ledger, near-instant finality
    Target, // privacy ledger, confirmation-depth finality
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerId::Base => write!(f, "base"),
            LedgerId::Target => write!(f, "target"),
        }
    }
}

// Which leg gets locked first
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    BaseToTarget,
    TargetToBase,
}

// A participant: an account on the base ledger plus a public key on the target ledger
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Party {
    pub base_account: String,
    pub target_key: [u8; 32], // compressed Ed25519 point
}

// Ledger transaction reference returned by executors
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxRef(pub String);

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TxRef {
    fn from(s: &str) -> Self {
        TxRef(s.to_string())
    }
}

// A specific output on the target ledger
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub tx_id: String,
    pub index: u32,
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.index)
    }
}

// SHA-256 binding of the swap secret
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment(pub [u8; 32]);

impl Commitment {
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

// Compressed point T = t·G the completed signature must link to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdaptorPoint(pub [u8; 32]);

// The swap secret scalar t (canonical little-endian encoding).
// Public once revealed, so no redaction on Debug.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Secret(pub [u8; 32]);

// One-time destination on the target ledger, stealth-address style
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub spend_key: [u8; 32],
    pub view_key: [u8; 32],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_id_display_is_short_hex() {
        let id = SwapId([0xab; 32]);
        assert_eq!(id.to_string(), "abababababababab");
        assert_eq!(id.to_hex().len(), 64);
        assert_eq!(format!("{:?}", id), "SwapId(abababababababab)");
    }

    #[test]
    fn output_ref_display() {
        let r = OutputRef { tx_id: "deadbeef".to_string(), index: 3 };
        assert_eq!(r.to_string(), "deadbeef:3");
    }

    #[test]
    fn zero_commitment_detected() {
        assert!(Commitment([0u8; 32]).is_zero());
        assert!(!Commitment([1u8; 32]).is_zero());
    }
}
