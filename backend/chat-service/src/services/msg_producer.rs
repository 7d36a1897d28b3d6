//! Producer of outgoing chat messages for the anti-fraud bus.
//!
//! One JSON object per record, keyed by chat id. With an encryption key
//! configured the value is AEAD-sealed: a fresh random nonce is prepended to
//! the ciphertext (`nonce || ciphertext_with_tag`), nonce size 12.

use crate::config::ProducerConfig;
use crate::error::{AppError, AppResult};
use crate::types::{ChatId, MessageId};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use rand::RngCore;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use serde::Serialize;
use std::time::Duration;

type Aes192Gcm = AesGcm<Aes192, U12>;

const NONCE_SIZE: usize = 12;
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub body: String,
    pub from_client: bool,
}

/// AES-GCM sealer over the three key sizes the hex key may decode to.
pub(crate) enum Sealer {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl Sealer {
    pub(crate) fn from_hex_key(hex_key: &str) -> AppResult<Self> {
        let key = hex::decode(hex_key)
            .map_err(|e| AppError::Crypto(format!("encrypt key is not hex: {e}")))?;

        match key.len() {
            16 => Ok(Sealer::Aes128(Box::new(Aes128Gcm::new(
                GenericArray::from_slice(&key),
            )))),
            24 => Ok(Sealer::Aes192(Box::new(Aes192Gcm::new(
                GenericArray::from_slice(&key),
            )))),
            32 => Ok(Sealer::Aes256(Box::new(Aes256Gcm::new(
                GenericArray::from_slice(&key),
            )))),
            n => Err(AppError::Crypto(format!(
                "encrypt key must be 16/24/32 bytes, got {n}"
            ))),
        }
    }

    pub(crate) fn seal(&self, plaintext: &[u8]) -> AppResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = match self {
            Sealer::Aes128(cipher) => cipher.encrypt(GenericArray::from_slice(&nonce), plaintext),
            Sealer::Aes192(cipher) => cipher.encrypt(GenericArray::from_slice(&nonce), plaintext),
            Sealer::Aes256(cipher) => cipher.encrypt(GenericArray::from_slice(&nonce), plaintext),
        }
        .map_err(|_| AppError::Crypto("aead seal failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);

        Ok(sealed)
    }

    #[cfg(test)]
    pub(crate) fn open(&self, sealed: &[u8]) -> AppResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(AppError::Crypto("sealed value too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        match self {
            Sealer::Aes128(cipher) => cipher.decrypt(GenericArray::from_slice(nonce), ciphertext),
            Sealer::Aes192(cipher) => cipher.decrypt(GenericArray::from_slice(nonce), ciphertext),
            Sealer::Aes256(cipher) => cipher.decrypt(GenericArray::from_slice(nonce), ciphertext),
        }
        .map_err(|_| AppError::Crypto("aead open failed".into()))
    }
}

pub struct MessageProducer {
    producer: FutureProducer,
    topic: String,
    sealer: Option<Sealer>,
}

impl MessageProducer {
    pub fn new(cfg: &ProducerConfig) -> AppResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", cfg.brokers.join(","))
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .create()
            .map_err(|e| AppError::Kafka(format!("create producer: {e}")))?;

        let sealer = if cfg.encrypt_key.is_empty() {
            tracing::info!("message producer encryption disabled");
            None
        } else {
            Some(Sealer::from_hex_key(&cfg.encrypt_key)?)
        };

        Ok(Self {
            producer,
            topic: cfg.topic.clone(),
            sealer,
        })
    }

    pub async fn produce(&self, msg: BusMessage) -> AppResult<()> {
        let data = serde_json::to_vec(&msg)
            .map_err(|e| AppError::Internal(format!("marshal bus message: {e}")))?;

        let value = match &self.sealer {
            Some(sealer) => sealer.seal(&data)?,
            None => data,
        };

        let key = msg.chat_id.to_string();
        let record = FutureRecord::to(&self.topic).key(&key).payload(&value);

        self.producer
            .send(record, DELIVERY_TIMEOUT)
            .await
            .map_err(|(e, _)| AppError::Kafka(format!("produce message: {e}")))?;

        tracing::debug!(message_id = %msg.id, chat_id = %msg.chat_id, "message produced to bus");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_128: &str = "00112233445566778899aabbccddeeff";
    const KEY_256: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

    #[test]
    fn bus_message_wire_shape() {
        let msg = BusMessage {
            id: MessageId::new(),
            chat_id: ChatId::new(),
            body: "hello".into(),
            from_client: true,
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["id"], msg.id.to_string());
        assert_eq!(value["chatId"], msg.chat_id.to_string());
        assert_eq!(value["body"], "hello");
        assert_eq!(value["fromClient"], true);
    }

    #[test]
    fn seal_open_round_trips() {
        for key in [KEY_128, KEY_256] {
            let sealer = Sealer::from_hex_key(key).unwrap();
            let sealed = sealer.seal(b"attack at dawn").unwrap();
            assert_eq!(sealer.open(&sealed).unwrap(), b"attack at dawn");
        }
    }

    #[test]
    fn sealed_value_is_nonce_then_ciphertext_with_tag() {
        let sealer = Sealer::from_hex_key(KEY_128).unwrap();
        let sealed = sealer.seal(b"x").unwrap();
        // 12-byte nonce + 1 byte of ciphertext + 16-byte tag
        assert_eq!(sealed.len(), NONCE_SIZE + 1 + 16);
    }

    #[test]
    fn fresh_nonce_per_seal() {
        let sealer = Sealer::from_hex_key(KEY_256).unwrap();
        let a = sealer.seal(b"same").unwrap();
        let b = sealer.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let sealer = Sealer::from_hex_key(KEY_128).unwrap();
        let other = Sealer::from_hex_key("ffeeddccbbaa99887766554433221100").unwrap();

        let sealed = sealer.seal(b"secret").unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let sealer = Sealer::from_hex_key(KEY_256).unwrap();
        let mut sealed = sealer.seal(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(sealer.open(&sealed).is_err());
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(Sealer::from_hex_key("not-hex").is_err());
        assert!(Sealer::from_hex_key("aabb").is_err());
    }
}
