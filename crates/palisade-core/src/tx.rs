use alloy_consensus::transaction::SignerRecoverable;
use alloy_consensus::{Transaction, TxEnvelope};
use alloy_eips::eip2718::Decodable2718;
use alloy_eips::Typed2718;
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use serde_json::Value;

/// Fields of an externally signed transaction the gateway acts on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedTx {
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub value: U256,
    pub gas_limit: u64,
    pub input: Bytes,
    pub hash: B256,
    /// The submitted payload, `0x`-prefixed.
    pub raw: String,
}

/// A network-internal transaction that carries no Ethereum signature.
#[derive(Clone, Debug, PartialEq)]
pub struct InternalTx {
    pub payload: Value,
    pub hash: B256,
}

impl InternalTx {
    /// Accepts only objects flagged `isInternalTx: true`.
    pub fn from_payload(payload: Value) -> Result<Self, TxDecodeError> {
        let flagged = payload
            .get("isInternalTx")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !flagged {
            return Err(TxDecodeError::NotInternal);
        }
        let bytes = serde_json::to_vec(&payload).map_err(|_| TxDecodeError::NotInternal)?;
        Ok(Self {
            hash: keccak256(bytes),
            payload,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum GatewayTx {
    Legacy(DecodedTx),
    AccessList(DecodedTx),
    FeeMarket(DecodedTx),
    Internal(InternalTx),
}

impl GatewayTx {
    pub fn hash(&self) -> B256 {
        match self {
            GatewayTx::Legacy(tx) | GatewayTx::AccessList(tx) | GatewayTx::FeeMarket(tx) => tx.hash,
            GatewayTx::Internal(tx) => tx.hash,
        }
    }

    pub fn signed(&self) -> Option<&DecodedTx> {
        match self {
            GatewayTx::Legacy(tx) | GatewayTx::AccessList(tx) | GatewayTx::FeeMarket(tx) => Some(tx),
            GatewayTx::Internal(_) => None,
        }
    }

    pub fn into_signed(self) -> Option<DecodedTx> {
        match self {
            GatewayTx::Legacy(tx) | GatewayTx::AccessList(tx) | GatewayTx::FeeMarket(tx) => Some(tx),
            GatewayTx::Internal(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxDecodeError {
    Empty,
    InvalidHex(String),
    Malformed(String),
    Unsupported { tx_type: u8 },
    InvalidSignature(String),
    NotInternal,
}

impl std::fmt::Display for TxDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxDecodeError::Empty => write!(f, "empty transaction payload"),
            TxDecodeError::InvalidHex(e) => write!(f, "transaction is not valid hex: {}", e),
            TxDecodeError::Malformed(e) => write!(f, "failed to decode transaction: {}", e),
            TxDecodeError::Unsupported { tx_type } => {
                write!(f, "unsupported transaction type 0x{:02x}", tx_type)
            }
            TxDecodeError::InvalidSignature(e) => {
                write!(f, "cannot recover transaction signer: {}", e)
            }
            TxDecodeError::NotInternal => {
                write!(f, "only internal transactions (isInternalTx: true) are accepted")
            }
        }
    }
}

impl std::error::Error for TxDecodeError {}

/// Decode an EIP-2718 envelope (legacy RLP or typed) and recover its sender.
pub fn decode_raw_transaction(raw: &str) -> Result<GatewayTx, TxDecodeError> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if digits.is_empty() {
        return Err(TxDecodeError::Empty);
    }
    let bytes = hex::decode(digits).map_err(|e| TxDecodeError::InvalidHex(e.to_string()))?;

    let envelope = TxEnvelope::decode_2718(&mut bytes.as_slice())
        .map_err(|e| TxDecodeError::Malformed(e.to_string()))?;

    if matches!(envelope, TxEnvelope::Eip4844(_) | TxEnvelope::Eip7702(_)) {
        return Err(TxDecodeError::Unsupported {
            tx_type: envelope.ty(),
        });
    }

    let from = envelope
        .recover_signer()
        .map_err(|e| TxDecodeError::InvalidSignature(e.to_string()))?;

    let decoded = DecodedTx {
        from,
        to: envelope.to(),
        nonce: envelope.nonce(),
        value: envelope.value(),
        gas_limit: envelope.gas_limit(),
        input: envelope.input().clone(),
        hash: *envelope.tx_hash(),
        raw: format!("0x{}", digits.to_lowercase()),
    };

    Ok(match envelope {
        TxEnvelope::Legacy(_) => GatewayTx::Legacy(decoded),
        TxEnvelope::Eip2930(_) => GatewayTx::AccessList(decoded),
        _ => GatewayTx::FeeMarket(decoded),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};

    // Rinkeby legacy transfer, nonce 2.
    const LEGACY_TX: &str = "0xf86b02843b9aca00830186a094d3e8763675e4c425df46cc3b5c0f6cbdac39604687038d7ea4c68000802ba00eb96ca19e8a77102767a41fc85a36afd5c61ccb09911cec5d3e86e193d9c5aea03a456401896b1b6055311536bf00a718568c744d8c1f9df59879e8350220ca18";

    // Mainnet EIP-1559 transfer.
    const FEE_MARKET_TX: &str = "02f871018302a90f808504890aef60826b6c94ddf4c5025d1a5742cf12f74eec246d4432c295e487e09c3bbcc12b2b80c080a0f21a4eacd0bf8fea9c5105c543be5a1d8c796516875710fafafdf16d16d8ee23a001280915021bb446d1973501a67f93d2b38894a514b976e7b46dc2fe54598d76";

    #[test]
    fn decodes_legacy_transaction() {
        let tx = decode_raw_transaction(LEGACY_TX).expect("legacy tx decodes");
        let GatewayTx::Legacy(decoded) = &tx else {
            panic!("expected legacy variant, got {:?}", tx);
        };
        assert_eq!(decoded.nonce, 2);
        assert_eq!(decoded.gas_limit, 100_000);
        assert_eq!(
            decoded.to,
            Some(address!("d3e8763675e4c425df46cc3b5c0f6cbdac396046"))
        );
        assert_eq!(decoded.value, U256::from(1_000_000_000_000_000u64));
        assert_eq!(
            tx.hash(),
            b256!("a517b206d2223278f860ea017d3626cacad4f52ff51030dc9a96b432f17f8d34")
        );
        assert_ne!(decoded.from, Address::ZERO);
    }

    #[test]
    fn decodes_fee_market_transaction_without_prefix() {
        let tx = decode_raw_transaction(FEE_MARKET_TX).expect("1559 tx decodes");
        let decoded = match &tx {
            GatewayTx::FeeMarket(decoded) => decoded,
            other => panic!("expected fee-market variant, got {:?}", other),
        };
        assert_eq!(decoded.nonce, 0x02a90f);
        assert_eq!(
            decoded.to,
            Some(address!("ddf4c5025d1a5742cf12f74eec246d4432c295e4"))
        );
        assert!(decoded.raw.starts_with("0x02f871"));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(decode_raw_transaction("0x"), Err(TxDecodeError::Empty));
        assert!(matches!(
            decode_raw_transaction("0xzz"),
            Err(TxDecodeError::InvalidHex(_))
        ));
        assert!(matches!(
            decode_raw_transaction("0xdeadbeef"),
            Err(TxDecodeError::Malformed(_))
        ));
    }

    #[test]
    fn internal_hash_is_keccak_of_json() {
        let payload = serde_json::json!({"isInternalTx": true, "internalTXType": 1});
        let tx = InternalTx::from_payload(payload.clone()).expect("internal tx");
        let expected = keccak256(serde_json::to_vec(&payload).unwrap());
        assert_eq!(tx.hash, expected);
        assert_eq!(GatewayTx::Internal(tx).signed(), None);
    }

    #[test]
    fn unflagged_objects_are_not_internal() {
        let payload = serde_json::json!({"from": "0x01"});
        assert_eq!(
            InternalTx::from_payload(payload),
            Err(TxDecodeError::NotInternal)
        );
    }
}
