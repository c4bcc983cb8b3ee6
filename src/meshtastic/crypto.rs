//! Channel keys and packet decryption.
//!
//! Meshtastic encrypts `Data` with AES-CTR (128 or 256 bit) under the channel's
//! pre-shared key. The 16 byte counter block is derived from packet metadata:
//!
//! ```text
//! [0..8]   packet id as u64, little endian
//! [8..12]  sender node number, little endian
//! [12..16] block counter, big endian, starting at 0
//! ```
//!
//! There is no MAC. [`KeyRing::decrypt`] tries candidate keys in priority order and
//! accepts the first plaintext that passes the payload schema check in
//! [`codec::decode_data`](super::codec::decode_data); a wrong key producing
//! schema-valid garbage is possible in principle and is a property of the protocol.

use aes::{Aes128, Aes256};
use ctr::cipher::{generic_array::GenericArray, KeyIvInit, StreamCipher};
use base64::Engine;
use log::trace;

use crate::error::GatewayError;
use crate::meshtastic::codec::{decode_data, Payload};
use crate::protobuf::Data;

/// The well-known key behind PSK `AQ==` (index 1).
pub const DEFAULT_KEY: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69, 0x01,
];

/// Name used when hashing a primary channel that has no name.
pub const DEFAULT_CHANNEL_NAME: &str = "LongFast";

#[derive(Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

impl KeyMaterial {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            KeyMaterial::Aes128(k) => k,
            KeyMaterial::Aes256(k) => k,
        }
    }
}

impl std::fmt::Debug for KeyMaterial {
    // never print key bytes
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMaterial::Aes128(_) => f.write_str("Aes128(..)"),
            KeyMaterial::Aes256(_) => f.write_str("Aes256(..)"),
        }
    }
}

/// Expand a channel PSK into key material. `Ok(None)` means the channel is unencrypted.
pub fn expand_psk(psk: &[u8]) -> Result<Option<KeyMaterial>, GatewayError> {
    match psk.len() {
        0 => Ok(None),
        1 => {
            let index = psk[0];
            if index == 0 {
                return Ok(None);
            }
            let mut key = DEFAULT_KEY;
            key[15] = key[15].wrapping_add(index - 1);
            Ok(Some(KeyMaterial::Aes128(key)))
        }
        2..=16 => {
            let mut key = [0u8; 16];
            key[..psk.len()].copy_from_slice(psk);
            Ok(Some(KeyMaterial::Aes128(key)))
        }
        17..=32 => {
            let mut key = [0u8; 32];
            key[..psk.len()].copy_from_slice(psk);
            Ok(Some(KeyMaterial::Aes256(key)))
        }
        n => Err(GatewayError::InvalidArgument(format!(
            "PSK of {} bytes is longer than 32",
            n
        ))),
    }
}

/// Decode a base64 PSK as written in config files and channel URLs.
pub fn decode_psk_base64(s: &str) -> Result<Vec<u8>, GatewayError> {
    let s = s.trim();
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(s))
        .map_err(|e| GatewayError::InvalidArgument(format!("bad base64 PSK: {}", e)))
}

fn xor_hash(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// One-byte channel hash carried in `MeshPacket.channel` for encrypted packets.
pub fn channel_hash(name: &str, key: &KeyMaterial) -> u8 {
    let name = if name.is_empty() {
        DEFAULT_CHANNEL_NAME
    } else {
        name
    };
    xor_hash(name.as_bytes()) ^ xor_hash(key.as_bytes())
}

type Aes128Ctr = ctr::Ctr32BE<Aes128>;
type Aes256Ctr = ctr::Ctr32BE<Aes256>;

fn initial_counter(packet_id: u32, sender: u32) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..8].copy_from_slice(&(packet_id as u64).to_le_bytes());
    block[8..12].copy_from_slice(&sender.to_le_bytes());
    block
}

fn keystream_xor<C: KeyIvInit + StreamCipher>(key: &[u8], packet_id: u32, sender: u32, data: &[u8]) -> Vec<u8> {
    let iv = initial_counter(packet_id, sender);
    let mut cipher = C::new(GenericArray::from_slice(key), GenericArray::from_slice(&iv));
    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    out
}

/// AES-CTR transform. Encryption and decryption are the same operation.
pub fn ctr_apply(key: &KeyMaterial, packet_id: u32, sender: u32, data: &[u8]) -> Vec<u8> {
    match key {
        KeyMaterial::Aes128(k) => keystream_xor::<Aes128Ctr>(k, packet_id, sender, data),
        KeyMaterial::Aes256(k) => keystream_xor::<Aes256Ctr>(k, packet_id, sender, data),
    }
}

/// A named channel key in the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelKey {
    pub name: String,
    pub key: KeyMaterial,
    pub hash: u8,
}

impl ChannelKey {
    pub fn new(name: impl Into<String>, key: KeyMaterial) -> Self {
        let name = name.into();
        let hash = channel_hash(&name, &key);
        Self { name, key, hash }
    }

    /// Build from a raw PSK; `Ok(None)` for unencrypted channels.
    pub fn from_psk(name: impl Into<String>, psk: &[u8]) -> Result<Option<Self>, GatewayError> {
        Ok(expand_psk(psk)?.map(|key| Self::new(name, key)))
    }

    pub fn from_base64(name: impl Into<String>, psk: &str) -> Result<Option<Self>, GatewayError> {
        Self::from_psk(name, &decode_psk_base64(psk)?)
    }

    /// `LongFast` with the well-known key.
    pub fn fallback() -> Self {
        Self::new(DEFAULT_CHANNEL_NAME, KeyMaterial::Aes128(DEFAULT_KEY))
    }
}

/// Successful decryption: the validated `Data`, its typed payload and the key that fit.
#[derive(Debug, Clone, PartialEq)]
pub struct Decrypted {
    pub data: Data,
    pub payload: Payload,
    pub channel: String,
}

/// Ordered candidate keys plus the fallback key, tried last.
#[derive(Debug, Clone)]
pub struct KeyRing {
    keys: Vec<ChannelKey>,
    fallback: ChannelKey,
}

impl Default for KeyRing {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRing {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            fallback: ChannelKey::fallback(),
        }
    }

    pub fn with_keys(keys: impl IntoIterator<Item = ChannelKey>) -> Self {
        let mut ring = Self::new();
        for k in keys {
            ring.add(k);
        }
        ring
    }

    /// Append a key unless the same (name, key) pair is already present.
    /// Returns whether the ring changed.
    pub fn add(&mut self, key: ChannelKey) -> bool {
        if self.keys.iter().any(|k| k == &key) {
            return false;
        }
        self.keys.push(key);
        true
    }

    pub fn keys(&self) -> &[ChannelKey] {
        &self.keys
    }

    pub fn fallback(&self) -> &ChannelKey {
        &self.fallback
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key to encrypt with when publishing on `channel`.
    pub fn key_for_channel(&self, channel: &str) -> &ChannelKey {
        self.keys
            .iter()
            .find(|k| k.name == channel)
            .unwrap_or(&self.fallback)
    }

    /// Candidate keys in priority order: name match, hash match, the rest in
    /// configuration order, then the fallback. Identical key material is tried once.
    pub fn candidates(&self, channel_name: Option<&str>, hash: Option<u8>) -> Vec<&ChannelKey> {
        let by_name = self
            .keys
            .iter()
            .filter(|k| channel_name.is_some_and(|n| k.name == n));
        let by_hash = self
            .keys
            .iter()
            .filter(|k| hash.is_some_and(|h| k.hash == h));
        let ordered = by_name
            .chain(by_hash)
            .chain(self.keys.iter())
            .chain(std::iter::once(&self.fallback));

        let mut out: Vec<&ChannelKey> = Vec::new();
        for k in ordered {
            if !out.iter().any(|seen| seen.key == k.key) {
                out.push(k);
            }
        }
        out
    }

    /// Try every candidate key on `ciphertext`.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        packet_id: u32,
        sender: u32,
        channel_name: Option<&str>,
        hash: Option<u8>,
    ) -> Result<Decrypted, GatewayError> {
        if ciphertext.is_empty() {
            return Err(GatewayError::Undecryptable);
        }
        for candidate in self.candidates(channel_name, hash) {
            let plain = ctr_apply(&candidate.key, packet_id, sender, ciphertext);
            match decode_data(&plain) {
                Ok((data, payload)) => {
                    trace!(
                        "packet {:08x} from {:08x} decrypted with channel key '{}'",
                        packet_id,
                        sender,
                        candidate.name
                    );
                    return Ok(Decrypted {
                        data,
                        payload,
                        channel: candidate.name.clone(),
                    });
                }
                Err(e) => {
                    trace!("key '{}' rejected: {}", candidate.name, e);
                }
            }
        }
        Err(GatewayError::Undecryptable)
    }
}

/// Encrypt a `Data` message for transmission under `key`.
pub fn encrypt_data(data: &Data, packet_id: u32, sender: u32, key: &KeyMaterial) -> Vec<u8> {
    use prost::Message;
    ctr_apply(key, packet_id, sender, &data.encode_to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_data(s: &str) -> Data {
        Payload::Text(s.to_string()).into_data()
    }

    #[test]
    fn psk_expansion_rules() {
        assert_eq!(expand_psk(&[]).unwrap(), None);
        assert_eq!(expand_psk(&[0]).unwrap(), None);
        assert_eq!(
            expand_psk(&[1]).unwrap(),
            Some(KeyMaterial::Aes128(DEFAULT_KEY))
        );
        let mut k2 = DEFAULT_KEY;
        k2[15] += 1;
        assert_eq!(expand_psk(&[2]).unwrap(), Some(KeyMaterial::Aes128(k2)));
        assert!(matches!(
            expand_psk(&[7u8; 20]).unwrap(),
            Some(KeyMaterial::Aes256(_))
        ));
        assert!(expand_psk(&[7u8; 33]).is_err());
        assert_eq!(decode_psk_base64("AQ==").unwrap(), vec![1]);
    }

    #[test]
    fn default_channel_hash() {
        // LongFast with the default key is channel hash 8 on the air
        assert_eq!(ChannelKey::fallback().hash, 8);
    }

    #[test]
    fn ctr_is_symmetric_and_spans_blocks() {
        let key = KeyMaterial::Aes256([9u8; 32]);
        let msg: Vec<u8> = (0..40u8).collect();
        let ct = ctr_apply(&key, 0x1234, 0xaabbccdd, &msg);
        assert_ne!(ct, msg);
        assert_eq!(ctr_apply(&key, 0x1234, 0xaabbccdd, &ct), msg);
        // nonce depends on sender
        assert_ne!(ctr_apply(&key, 0x1234, 0xaabbccde, &msg), ct);
    }

    #[test]
    fn keystream_matches_reference_vectors() {
        let msg = b"meshgate keystream spans three blocks ok";
        let ct = ctr_apply(&KeyMaterial::Aes128(DEFAULT_KEY), 0x1234, 0xaabbccdd, msg);
        assert_eq!(
            hex::encode(&ct),
            "05902b8c5134e116ad8f76aaff1a7b67df8d762b5403b3fff6304a49ccdef10f76c8942f66fabfd9"
        );
        let mut wide = [0u8; 32];
        for (i, b) in wide.iter_mut().enumerate() {
            *b = i as u8;
        }
        let ct = ctr_apply(&KeyMaterial::Aes256(wide), 0x1234, 0xaabbccdd, msg);
        assert_eq!(
            hex::encode(&ct),
            "397d7ab1bd5772adcb4ceec17c168dd396a075dc3d470226956e7762e71dbfae52be412c48c2240f"
        );
    }

    #[test]
    fn candidates_are_ordered_and_deduplicated() {
        let a = ChannelKey::from_base64("alpha", "AAECAwQFBgcICQoLDA0ODw==")
            .unwrap()
            .unwrap();
        let b = ChannelKey::new("bravo", KeyMaterial::Aes128([5u8; 16]));
        let dup_default = ChannelKey::from_psk("LongFast", &[1]).unwrap().unwrap();
        let ring = KeyRing::with_keys([a.clone(), b.clone(), dup_default]);
        let names: Vec<_> = ring
            .candidates(Some("bravo"), None)
            .into_iter()
            .map(|k| k.name.clone())
            .collect();
        assert_eq!(names, vec!["bravo", "alpha", "LongFast"]);

        let by_hash: Vec<_> = ring
            .candidates(None, Some(a.hash))
            .into_iter()
            .map(|k| k.name.clone())
            .collect();
        assert_eq!(by_hash[0], "alpha");
    }

    #[test]
    fn decrypts_with_fallback_key() {
        let data = text_data("hello mesh");
        let ct = encrypt_data(&data, 77, 0xaabbccdd, &KeyMaterial::Aes128(DEFAULT_KEY));
        let out = KeyRing::new()
            .decrypt(&ct, 77, 0xaabbccdd, Some("LongFast"), Some(8))
            .unwrap();
        assert_eq!(out.data, data);
        assert_eq!(out.payload, Payload::Text("hello mesh".into()));
        assert_eq!(out.channel, "LongFast");
    }

    #[test]
    fn absent_key_is_undecryptable() {
        let data = text_data("secret");
        let k2 = KeyMaterial::Aes128([0x42; 16]);
        let ct = encrypt_data(&data, 5, 0x01020304, &k2);
        let ring = KeyRing::with_keys([ChannelKey::new("k1", KeyMaterial::Aes128([0x11; 16]))]);
        assert!(matches!(
            ring.decrypt(&ct, 5, 0x01020304, None, None),
            Err(GatewayError::Undecryptable)
        ));
        let mut ring = ring;
        ring.add(ChannelKey::new("k2", k2));
        assert_eq!(
            ring.decrypt(&ct, 5, 0x01020304, None, None).unwrap().channel,
            "k2"
        );
    }
}
