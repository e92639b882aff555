//! Vendor webhook crypto.
//!
//! WeCom and DingTalk share the "msg crypt" construction: SHA-1 over the sorted
//! `(token, timestamp, nonce, payload)` quadruple, and AES-256-CBC with the IV
//! taken from the first 16 key bytes. The plaintext frame is
//! `random(16) | len(4, big-endian) | msg | owner_id`, padded to 32-byte blocks
//! with a PKCS7 look-alike that is stripped by hand. Feishu, OneBot and the QQ
//! official bot use their own primitives, collected here so every byte-level
//! contract lives in one place.

use crate::channels::error::{ChannelError, Result};
use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

const PAD_BLOCK: usize = 32;
const AES_BLOCK: usize = 16;
const RANDOM_LEN: usize = 16;
const HEADER_LEN: usize = RANDOM_LEN + 4;

// Vendor keys are 43 base64 chars without padding and may carry non-zero trailing bits.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub fn compute_signature(token: &str, timestamp: &str, nonce: &str, payload: &str) -> String {
    let mut parts = [token, timestamp, nonce, payload];
    parts.sort_unstable();
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn verify_signature(
    token: &str,
    timestamp: &str,
    nonce: &str,
    payload: &str,
    signature: &str,
) -> bool {
    let expected = compute_signature(token, timestamp, nonce, payload);
    constant_time_eq(&expected, &signature.trim().to_ascii_lowercase())
}

pub fn constant_time_eq(left: &str, right: &str) -> bool {
    left.as_bytes().ct_eq(right.as_bytes()).into()
}

pub fn decode_aes_key(raw: &str) -> Result<[u8; 32]> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ChannelError::Key("aes key missing".to_string()));
    }
    let bytes = KEY_ENGINE
        .decode(raw)
        .map_err(|_| ChannelError::Key("aes key is not valid base64".to_string()))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        ChannelError::Key(format!("aes key is {} bytes, expected 32", bytes.len()))
    })
}

/// AES half of the WeCom/DingTalk message crypt.
#[derive(Clone)]
pub struct MessageCipher {
    key: [u8; 32],
}

impl MessageCipher {
    pub fn new(encoding_aes_key: &str) -> Result<Self> {
        Ok(Self {
            key: decode_aes_key(encoding_aes_key)?,
        })
    }

    pub fn decrypt(&self, ciphertext: &str, owner_id: &str) -> Result<String> {
        let mut buffer = STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| ChannelError::Decode("ciphertext is not valid base64".to_string()))?;
        if buffer.is_empty() || buffer.len() % AES_BLOCK != 0 {
            return Err(ChannelError::Decrypt(
                "ciphertext is not aligned to the cipher block".to_string(),
            ));
        }
        let iv = &self.key[..AES_BLOCK];
        let plain = Aes256CbcDec::new(self.key.as_slice().into(), iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buffer)
            .map_err(|_| ChannelError::Decrypt("cipher rejected ciphertext".to_string()))?;
        let plain = strip_padding(plain);
        if plain.len() < HEADER_LEN {
            return Err(ChannelError::Integrity("decrypted frame too short".to_string()));
        }
        let msg_len = u32::from_be_bytes([plain[16], plain[17], plain[18], plain[19]]) as usize;
        let msg_end = HEADER_LEN
            .checked_add(msg_len)
            .filter(|end| *end <= plain.len())
            .ok_or_else(|| ChannelError::Integrity("length prefix out of range".to_string()))?;
        let trailing_owner = &plain[msg_end..];
        if !bool::from(trailing_owner.ct_eq(owner_id.as_bytes())) {
            return Err(ChannelError::Integrity(
                "payload addressed to a different tenant".to_string(),
            ));
        }
        String::from_utf8(plain[HEADER_LEN..msg_end].to_vec())
            .map_err(|_| ChannelError::Integrity("decrypted message is not utf-8".to_string()))
    }

    pub fn encrypt(&self, plaintext: &str, owner_id: &str) -> Result<String> {
        let msg_len = u32::try_from(plaintext.len())
            .map_err(|_| ChannelError::invalid_payload("plaintext too large to frame"))?;
        let random: [u8; RANDOM_LEN] = rand::random();
        let mut buffer = Vec::with_capacity(HEADER_LEN + plaintext.len() + owner_id.len() + PAD_BLOCK);
        buffer.extend_from_slice(&random);
        buffer.extend_from_slice(&msg_len.to_be_bytes());
        buffer.extend_from_slice(plaintext.as_bytes());
        buffer.extend_from_slice(owner_id.as_bytes());
        pad_to_block(&mut buffer);
        let len = buffer.len();
        let iv = &self.key[..AES_BLOCK];
        let cipher = Aes256CbcEnc::new(self.key.as_slice().into(), iv.into())
            .encrypt_padded_mut::<NoPadding>(&mut buffer, len)
            .map_err(|_| ChannelError::Decrypt("cipher rejected plaintext frame".to_string()))?;
        Ok(STANDARD.encode(cipher))
    }
}

pub fn decrypt_message(aes_key: &str, ciphertext: &str, owner_id: &str) -> Result<String> {
    MessageCipher::new(aes_key)?.decrypt(ciphertext, owner_id)
}

pub fn encrypt_message(aes_key: &str, plaintext: &str, owner_id: &str) -> Result<String> {
    MessageCipher::new(aes_key)?.encrypt(plaintext, owner_id)
}

fn pad_to_block(buffer: &mut Vec<u8>) {
    let amount = PAD_BLOCK - buffer.len() % PAD_BLOCK;
    buffer.resize(buffer.len() + amount, amount as u8);
}

// Out-of-range pad bytes mean the frame was never padded.
fn strip_padding(buffer: &[u8]) -> &[u8] {
    let Some(&last) = buffer.last() else {
        return buffer;
    };
    let amount = last as usize;
    if !(1..=PAD_BLOCK).contains(&amount) || amount > buffer.len() {
        return buffer;
    }
    &buffer[..buffer.len() - amount]
}

pub fn feishu_signature(timestamp: &str, nonce: &str, encrypt_key: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(encrypt_key.as_bytes());
    hasher.update(body);
    hex::encode(hasher.finalize())
}

pub fn feishu_decrypt(encrypt_key: &str, ciphertext: &str) -> Result<String> {
    let key = Sha256::digest(encrypt_key.as_bytes());
    let buffer = STANDARD
        .decode(ciphertext.trim())
        .map_err(|_| ChannelError::Decode("encrypt field is not valid base64".to_string()))?;
    if buffer.len() < 2 * AES_BLOCK || buffer.len() % AES_BLOCK != 0 {
        return Err(ChannelError::Decrypt(
            "encrypt field is not aligned to the cipher block".to_string(),
        ));
    }
    let (iv, body) = buffer.split_at(AES_BLOCK);
    let mut body = body.to_vec();
    let plain = Aes256CbcDec::new(key.as_slice().into(), iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut body)
        .map_err(|_| ChannelError::Decrypt("bad padding after decrypt".to_string()))?;
    String::from_utf8(plain.to_vec())
        .map_err(|_| ChannelError::Integrity("decrypted event is not utf-8".to_string()))
}

pub fn feishu_encrypt(encrypt_key: &str, plaintext: &str) -> Result<String> {
    let key = Sha256::digest(encrypt_key.as_bytes());
    let iv: [u8; AES_BLOCK] = rand::random();
    let msg = plaintext.as_bytes();
    let mut buffer = vec![0u8; msg.len() + AES_BLOCK];
    buffer[..msg.len()].copy_from_slice(msg);
    let cipher = Aes256CbcEnc::new(key.as_slice().into(), iv.as_slice().into())
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, msg.len())
        .map_err(|_| ChannelError::Decrypt("cipher rejected plaintext".to_string()))?;
    let mut output = iv.to_vec();
    output.extend_from_slice(cipher);
    Ok(STANDARD.encode(output))
}

pub fn hmac_sha256_hex(secret: &str, message: &[u8]) -> String {
    hex::encode(hmac_sha256(secret, message))
}

fn hmac_sha256(secret: &str, message: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(value) => value,
        Err(_) => return Vec::new(),
    };
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

pub fn hmac_sha1_hex(secret: &str, message: &[u8]) -> String {
    let mut mac = match HmacSha1::new_from_slice(secret.as_bytes()) {
        Ok(value) => value,
        Err(_) => return String::new(),
    };
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// `base64(HMAC-SHA256(secret, timestamp + "\n" + secret))`, the DingTalk robot `sign` header.
pub fn dingtalk_robot_sign(app_secret: &str, timestamp: &str) -> String {
    let message = format!("{timestamp}\n{app_secret}");
    STANDARD.encode(hmac_sha256(app_secret, message.as_bytes()))
}

/// QQ derives the bot's Ed25519 seed by repeating the client secret to 32 bytes.
pub fn qqbot_signing_key(secret: &str) -> Result<SigningKey> {
    if secret.is_empty() {
        return Err(ChannelError::Key("qqbot client secret missing".to_string()));
    }
    let seed: Vec<u8> = secret.as_bytes().iter().copied().cycle().take(32).collect();
    let seed: [u8; 32] = seed
        .try_into()
        .map_err(|_| ChannelError::Key("qqbot seed derivation failed".to_string()))?;
    Ok(SigningKey::from_bytes(&seed))
}

pub fn qqbot_sign(secret: &str, message: &[u8]) -> Result<String> {
    let key = qqbot_signing_key(secret)?;
    Ok(hex::encode(key.sign(message).to_bytes()))
}

pub fn qqbot_verify(secret: &str, timestamp: &str, body: &[u8], signature: &str) -> Result<()> {
    let key = qqbot_signing_key(secret)?;
    let raw = hex::decode(signature.trim())
        .map_err(|_| ChannelError::signature("ed25519 signature is not hex"))?;
    let signature = Signature::from_slice(&raw)
        .map_err(|_| ChannelError::signature("ed25519 signature has wrong length"))?;
    let mut message = Vec::with_capacity(timestamp.len() + body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(body);
    key.verifying_key()
        .verify(&message, &signature)
        .map_err(|_| ChannelError::signature("ed25519 signature mismatch"))
}
