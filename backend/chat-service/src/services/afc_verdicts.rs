//! Consumer of the anti-fraud verdict stream.
//!
//! Each verdict flips one message's lifecycle flags inside a transaction and
//! enqueues the matching notification job. Commits are per-batch and manual,
//! so a crash between processing and commit replays the batch; the monotone
//! visibility/block flags make that replay harmless.

use crate::config::AfcConfig;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::outbox::jobs::{client_message_blocked, client_message_sent};
use crate::outbox::OutboxService;
use crate::repositories::messages;
use crate::store::Store;
use crate::types::{ChatId, MessageId};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::PgConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const HEADER_LAST_ERROR: &str = "LAST_ERROR";
const HEADER_ORIGINAL_PARTITION: &str = "ORIGINAL_PARTITION";

const DLQ_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Verdict {
    #[allow(dead_code)]
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerdictStatus {
    Ok,
    Suspicious,
}

pub(crate) fn parse_status(status: &str) -> Option<VerdictStatus> {
    match status {
        "ok" => Some(VerdictStatus::Ok),
        "suspicious" => Some(VerdictStatus::Suspicious),
        _ => None,
    }
}

pub struct AfcVerdictProcessor {
    cfg: AfcConfig,
    store: Store,
    outbox: Arc<OutboxService>,
    public_key: Option<RsaPublicKey>,
    dlq: FutureProducer,
}

impl AfcVerdictProcessor {
    pub fn new(cfg: AfcConfig, store: Store, outbox: Arc<OutboxService>) -> AppResult<Self> {
        let public_key = if cfg.verdicts_sign_key.is_empty() {
            tracing::info!("verdict signature verification disabled");
            None
        } else {
            Some(parse_sign_key(&cfg.verdicts_sign_key)?)
        };

        let dlq: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", cfg.brokers.join(","))
            .set("acks", "1")
            .create()
            .map_err(|e| AppError::Kafka(format!("create dlq producer: {e}")))?;

        Ok(Self {
            cfg,
            store,
            outbox,
            public_key,
            dlq,
        })
    }

    /// Spawns one consumer per configured slot; all share the consumer
    /// group, partition assignment is the broker's business. Returns when
    /// every consumer has observed the cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> AppResult<()> {
        let consumers: Vec<StreamConsumer> = (0..self.cfg.consumers)
            .map(|_| self.create_consumer())
            .collect::<AppResult<_>>()?;

        let mut tasks = Vec::with_capacity(consumers.len());
        for (slot, consumer) in consumers.into_iter().enumerate() {
            let svc = Arc::clone(&self);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                svc.consume_loop(slot + 1, consumer, cancel).await;
            }));
        }

        for task in tasks {
            let _ = task.await;
        }

        Ok(())
    }

    fn create_consumer(&self) -> AppResult<StreamConsumer> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", self.cfg.brokers.join(","))
            .set("group.id", &self.cfg.consumer_group)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", "30000")
            .create()
            .map_err(|e| AppError::Kafka(format!("create consumer: {e}")))?;

        consumer
            .subscribe(&[self.cfg.verdicts_topic.as_str()])
            .map_err(|e| AppError::Kafka(format!("subscribe {}: {e}", self.cfg.verdicts_topic)))?;

        Ok(consumer)
    }

    async fn consume_loop(&self, slot: usize, consumer: StreamConsumer, cancel: CancellationToken) {
        tracing::info!(slot, topic = %self.cfg.verdicts_topic, "afc consumer started");

        loop {
            let mut batch: Vec<OwnedMessage> = Vec::with_capacity(self.cfg.process_batch_size);

            let deadline = tokio::time::sleep(self.cfg.process_batch_max_timeout());
            tokio::pin!(deadline);

            while batch.len() < self.cfg.process_batch_size {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(slot, "afc consumer stopped");
                        return;
                    }
                    _ = &mut deadline => break,
                    msg = consumer.recv() => match msg {
                        Ok(m) => batch.push(m.detach()),
                        Err(e) => {
                            tracing::warn!(slot, error = %e, "fetch verdict");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            break;
                        }
                    }
                }
            }

            if batch.is_empty() {
                continue;
            }

            self.process_batch(&batch).await;

            if let Err(e) = consumer.commit_consumer_state(CommitMode::Async) {
                tracing::warn!(slot, error = %e, "commit verdict batch");
            }
        }
    }

    /// Broker order within a partition is preserved: records are handled
    /// strictly in batch order.
    async fn process_batch(&self, batch: &[OwnedMessage]) {
        for msg in batch {
            let error = match self.decode(msg) {
                Ok(verdict) => self.process_with_retries(&verdict).await.err(),
                Err(e) => Some(e),
            };

            if let Some(e) = error {
                self.send_to_dlq(msg, &e).await;
            } else {
                metrics::AFC_VERDICTS_PROCESSED.inc();
            }
        }
    }

    fn decode(&self, msg: &OwnedMessage) -> AppResult<Verdict> {
        let raw = msg
            .payload()
            .ok_or_else(|| AppError::Payload("empty verdict record".into()))?;

        let data = match &self.public_key {
            Some(key) => unwrap_jws(raw, key)?,
            None => raw.to_vec(),
        };

        serde_json::from_slice(&data)
            .map_err(|e| AppError::Payload(format!("unmarshal verdict: {e}")))
    }

    /// Transient failures are retried with exponential backoff; a verdict
    /// with an unknown status is poison and goes straight to the DLQ.
    async fn process_with_retries(&self, verdict: &Verdict) -> AppResult<()> {
        let mut backoff = self.cfg.backoff_initial_interval();
        let mut last_err = None;

        for attempt in 0..self.cfg.retries {
            match self.process_verdict(verdict).await {
                Ok(()) => return Ok(()),
                Err(e @ AppError::UnknownVerdictStatus) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        message_id = %verdict.message_id,
                        attempt,
                        error = %e,
                        "process verdict"
                    );
                    last_err = Some(e);
                }
            }

            if attempt + 1 < self.cfg.retries {
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff, self.cfg.backoff_factor, self.cfg.backoff_max_elapsed());
            }
        }

        Err(last_err.unwrap_or_else(|| AppError::Internal("retries exhausted".into())))
    }

    async fn process_verdict(&self, verdict: &Verdict) -> AppResult<()> {
        let status = parse_status(&verdict.status).ok_or(AppError::UnknownVerdictStatus)?;
        let message_id = verdict.message_id;
        let outbox = Arc::clone(&self.outbox);

        match status {
            VerdictStatus::Ok => {
                self.store
                    .run_in_tx(move |conn: &mut PgConnection| {
                        let outbox = Arc::clone(&outbox);
                        Box::pin(async move {
                            messages::mark_as_visible_for_manager(conn, message_id).await?;
                            let payload = client_message_sent::marshal_payload(message_id)?;
                            outbox
                                .put(conn, client_message_sent::NAME, &payload, Utc::now())
                                .await?;
                            Ok(())
                        })
                    })
                    .await
            }
            VerdictStatus::Suspicious => {
                self.store
                    .run_in_tx(move |conn: &mut PgConnection| {
                        let outbox = Arc::clone(&outbox);
                        Box::pin(async move {
                            messages::block_message(conn, message_id).await?;
                            let payload = client_message_blocked::marshal_payload(message_id)?;
                            outbox
                                .put(conn, client_message_blocked::NAME, &payload, Utc::now())
                                .await?;
                            Ok(())
                        })
                    })
                    .await
            }
        }
    }

    /// Preserves the original record bytes and key; adds the failure context
    /// as headers.
    async fn send_to_dlq(&self, msg: &OwnedMessage, error: &AppError) {
        let mut headers = OwnedHeaders::new();
        if let Some(original) = msg.headers() {
            for header in original.iter() {
                headers = headers.insert(Header {
                    key: header.key,
                    value: header.value,
                });
            }
        }

        let last_error = error.to_string();
        let original_partition = msg.partition().to_string();
        headers = headers
            .insert(Header {
                key: HEADER_LAST_ERROR,
                value: Some(last_error.as_bytes()),
            })
            .insert(Header {
                key: HEADER_ORIGINAL_PARTITION,
                value: Some(original_partition.as_bytes()),
            });

        let payload = msg.payload().unwrap_or_default();
        let mut record = FutureRecord::<[u8], [u8]>::to(&self.cfg.verdicts_dlq_topic)
            .payload(payload)
            .headers(headers);
        if let Some(key) = msg.key() {
            record = record.key(key);
        }

        match self.dlq.send(record, DLQ_DELIVERY_TIMEOUT).await {
            Ok(_) => {
                metrics::AFC_VERDICTS_DLQ.inc();
                tracing::warn!(error = %last_error, "verdict routed to dlq");
            }
            Err((e, _)) => {
                tracing::error!(error = %e, "produce to dlq");
            }
        }
    }
}

fn next_backoff(current: Duration, factor: f64, max: Duration) -> Duration {
    let next = current.mul_f64(factor);
    next.min(max)
}

pub(crate) fn parse_sign_key(pem: &str) -> AppResult<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| AppError::Config(format!("invalid verdicts sign key: {e}")))
}

/// Unwraps a compact JWS (`HEADER.PAYLOAD.SIGNATURE`, RS256): returns the
/// decoded payload after the signature over `HEADER.PAYLOAD` checks out.
pub(crate) fn unwrap_jws(raw: &[u8], key: &RsaPublicKey) -> AppResult<Vec<u8>> {
    let token = std::str::from_utf8(raw)
        .map_err(|_| AppError::Payload("jws is not utf-8".into()))?;

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(AppError::Payload(format!("jws has {} parts", parts.len())));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|e| AppError::Payload(format!("decode jws payload: {e}")))?;
    let signature = URL_SAFE_NO_PAD
        .decode(parts[2])
        .map_err(|e| AppError::Payload(format!("decode jws signature: {e}")))?;

    let signing_input = format!("{}.{}", parts[0], parts[1]);
    let digest = Sha256::digest(signing_input.as_bytes());

    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
        .map_err(|e| AppError::Payload(format!("verify jws signature: {e}")))?;

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;

    fn decode_plain(raw: &[u8]) -> AppResult<Verdict> {
        serde_json::from_slice(raw).map_err(|e| AppError::Payload(format!("unmarshal verdict: {e}")))
    }

    #[test]
    fn parses_known_statuses() {
        assert_eq!(parse_status("ok"), Some(VerdictStatus::Ok));
        assert_eq!(parse_status("suspicious"), Some(VerdictStatus::Suspicious));
        assert_eq!(parse_status("confused"), None);
        assert_eq!(parse_status(""), None);
        assert_eq!(parse_status("OK"), None);
    }

    #[test]
    fn decodes_plain_verdict() {
        let chat_id = ChatId::new();
        let message_id = MessageId::new();
        let raw = format!(
            r#"{{"chatId":"{chat_id}","messageId":"{message_id}","status":"ok"}}"#
        );

        let verdict = decode_plain(raw.as_bytes()).unwrap();
        assert_eq!(verdict.message_id, message_id);
        assert_eq!(verdict.status, "ok");
    }

    #[test]
    fn rejects_malformed_verdicts() {
        assert!(decode_plain(b"not json").is_err());
        assert!(decode_plain(br#"{"chatId":"x","messageId":"y","status":"ok"}"#).is_err());
        assert!(decode_plain(br#"{"status":"ok"}"#).is_err());
    }

    // Key generation dominates debug-build test time, so one shared pair.
    static KEYS: once_cell::sync::Lazy<(RsaPrivateKey, RsaPublicKey)> =
        once_cell::sync::Lazy::new(|| {
            let mut rng = rand::thread_rng();
            let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
            let public = private.to_public_key();
            (private, public)
        });

    fn keypair() -> (&'static RsaPrivateKey, &'static RsaPublicKey) {
        (&KEYS.0, &KEYS.1)
    }

    static OTHER_KEY: once_cell::sync::Lazy<RsaPublicKey> = once_cell::sync::Lazy::new(|| {
        let mut rng = rand::thread_rng();
        RsaPrivateKey::new(&mut rng, 1024).unwrap().to_public_key()
    });

    fn sign_jws(private: &RsaPrivateKey, payload: &[u8]) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload);
        let signing_input = format!("{header}.{body}");
        let digest = Sha256::digest(signing_input.as_bytes());
        let signature = private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .unwrap();
        format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature))
    }

    #[test]
    fn jws_round_trip_verifies() {
        let (private, public) = keypair();
        let payload = br#"{"chatId":"a","messageId":"b","status":"ok"}"#;

        let token = sign_jws(private, payload);
        let unwrapped = unwrap_jws(token.as_bytes(), public).unwrap();
        assert_eq!(unwrapped, payload);
    }

    #[test]
    fn jws_with_tampered_payload_fails() {
        let (private, public) = keypair();
        let token = sign_jws(private, br#"{"status":"ok"}"#);

        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        parts[1] = URL_SAFE_NO_PAD.encode(br#"{"status":"suspicious"}"#);
        let tampered = parts.join(".");

        assert!(unwrap_jws(tampered.as_bytes(), public).is_err());
    }

    #[test]
    fn jws_signed_by_another_key_fails() {
        let (private, _) = keypair();

        let token = sign_jws(private, br#"{"status":"ok"}"#);
        assert!(unwrap_jws(token.as_bytes(), &OTHER_KEY).is_err());
    }

    #[test]
    fn jws_must_have_three_parts() {
        let (_, public) = keypair();
        assert!(unwrap_jws(b"one.two", public).is_err());
        assert!(unwrap_jws(b"plainjson", public).is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let max = Duration::from_secs(5);
        let first = next_backoff(Duration::from_millis(100), 5.0, max);
        assert_eq!(first, Duration::from_millis(500));
        let capped = next_backoff(Duration::from_secs(4), 5.0, max);
        assert_eq!(capped, max);
    }
}
