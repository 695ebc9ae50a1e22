//! Shielded addresses and the spending keys exported for them.
use bech32::Variant;
use regtestconfig::ChainType;
use secrecy::{ExposeSecret, SecretString};
use zcash_address::{ConversionError, Network, TryFromAddress, ZcashAddress};

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("{address:?} is not a zcash address: {reason}")]
    Unparseable { address: String, reason: String },
    #[error("{address:?} is not a sapling address: {reason}")]
    NotSapling { address: String, reason: String },
    #[error("{address:?} belongs to {found:?}, expected {expected:?}")]
    WrongNetwork {
        address: String,
        found: Network,
        expected: Network,
    },
    #[error("exported key is empty")]
    EmptyKey,
    #[error("exported key is not bech32")]
    KeyEncoding,
    #[error("exported key has prefix {found:?}, expected {expected:?}")]
    KeyPrefix { found: String, expected: String },
}

struct SaplingReceiver {
    network: Network,
}

impl TryFromAddress for SaplingReceiver {
    type Error = std::convert::Infallible;

    fn try_from_sapling(
        network: Network,
        _data: [u8; 43],
    ) -> Result<Self, ConversionError<Self::Error>> {
        Ok(Self { network })
    }
}

/// Accept `address` only if it encodes a sapling receiver for `chain`.
pub fn validate_sapling_address(address: &str, chain: ChainType) -> Result<(), KeyError> {
    let parsed = ZcashAddress::try_from_encoded(address).map_err(|e| KeyError::Unparseable {
        address: address.to_string(),
        reason: e.to_string(),
    })?;
    let receiver = parsed
        .convert::<SaplingReceiver>()
        .map_err(|e| KeyError::NotSapling {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
    let expected = chain.to_zcash_address_network();
    if receiver.network != expected {
        return Err(KeyError::WrongNetwork {
            address: address.to_string(),
            found: receiver.network,
            expected,
        });
    }
    Ok(())
}

/// Check the shape of an exported sapling spending key without ever
/// putting any part of it beyond the human readable prefix into an error.
pub fn validate_spending_key(key: &SecretString, chain: ChainType) -> Result<(), KeyError> {
    let encoded = key.expose_secret();
    if encoded.is_empty() {
        return Err(KeyError::EmptyKey);
    }
    let (hrp, _data, variant) = bech32::decode(encoded).map_err(|_| KeyError::KeyEncoding)?;
    if variant != Variant::Bech32 {
        return Err(KeyError::KeyEncoding);
    }
    let expected = chain.hrp_sapling_extended_spending_key();
    if hrp != expected {
        return Err(KeyError::KeyPrefix {
            found: hrp,
            expected: expected.to_string(),
        });
    }
    Ok(())
}

/// An address together with the secret exported for it.
#[derive(Debug)]
pub struct KeyMaterial {
    pub address: String,
    pub private_key: SecretString,
}

impl KeyMaterial {
    pub fn new(address: String, private_key: SecretString) -> Self {
        Self {
            address,
            private_key,
        }
    }

    pub fn same_key_as(&self, other: &SecretString) -> bool {
        self.private_key.expose_secret() == other.expose_secret()
    }
}
