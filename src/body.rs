//! Bounded, timeout-guarded body reader: a cap that does not trust
//! `Content-Length` (it is enforced against bytes actually read) plus a
//! wall-clock deadline on the whole read.

use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use http_body_util::BodyExt;

use crate::error::{AppError, AppResult};

/// Read the full body, erroring with `PayloadTooLarge` the instant the
/// accumulated byte count would exceed `max_bytes`, and `BodyTimeout` if the
/// whole read does not finish within `read_timeout`.
pub async fn read_bounded_body(
    body: Body,
    max_bytes: usize,
    read_timeout: Duration,
) -> AppResult<Bytes> {
    match tokio::time::timeout(read_timeout, read_all_capped(body, max_bytes)).await {
        Ok(result) => result,
        Err(_) => Err(AppError::BodyTimeout),
    }
}

async fn read_all_capped(mut body: Body, max_bytes: usize) -> AppResult<Bytes> {
    let mut collected: Vec<u8> = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|err| AppError::Internal(anyhow::anyhow!(err)))?;
        if let Some(data) = frame.data_ref() {
            if collected.len() + data.len() > max_bytes {
                return Err(AppError::PayloadTooLarge);
            }
            collected.extend_from_slice(data);
        }
    }
    Ok(Bytes::from(collected))
}

/// Read the body under the same cap/timeout and parse it as JSON.
/// Malformed JSON surfaces as `BadRequest`.
pub async fn read_json_body<T: serde::de::DeserializeOwned>(
    body: Body,
    max_bytes: usize,
    read_timeout: Duration,
) -> AppResult<T> {
    let bytes = read_bounded_body(body, max_bytes, read_timeout).await?;
    serde_json::from_slice(&bytes)
        .map_err(|err| AppError::BadRequest(format!("invalid JSON body: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[tokio::test]
    async fn reads_body_under_the_cap() {
        let body = Body::from(b"hello".to_vec());
        let bytes = read_bounded_body(body, 1024, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn rejects_body_over_the_cap() {
        let body = Body::from(vec![0u8; 100]);
        let err = read_bounded_body(body, 10, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge));
    }

    #[tokio::test]
    async fn parses_well_formed_json() {
        #[derive(Deserialize)]
        struct Payload {
            text: String,
        }
        let body = Body::from(br#"{"text":"hi"}"#.to_vec());
        let parsed: Payload = read_json_body(body, 1024, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(parsed.text, "hi");
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let body = Body::from(b"{not json".to_vec());
        let err = read_json_body::<serde_json::Value>(body, 1024, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
