//! Dialogue service boundary
//!
//! The agent is reached through `DialogueClient`: one clip in, one reply
//! clip out. Clients never retry; a failed turn is dropped and the turn
//! state machine goes back to listening.

use crate::audio::AudioClip;
use crate::session::Session;
use crate::{ParleyError, Result};
use reqwest::blocking::multipart::{Form, Part};
use std::time::Duration;
use tracing::{debug, info};

pub trait DialogueClient: Send + Sync {
    /// Send the user's clip and wait for the agent's reply
    fn exchange(&self, session: &Session, clip: &AudioClip) -> Result<AudioClip>;
}

/// Posts each turn as a multipart upload to `{endpoint}/convo`
pub struct HttpDialogueClient {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpDialogueClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ParleyError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self) -> String {
        format!("{}/convo", self.endpoint.trim_end_matches('/'))
    }
}

impl DialogueClient for HttpDialogueClient {
    fn exchange(&self, session: &Session, clip: &AudioClip) -> Result<AudioClip> {
        let part = Part::bytes(clip.bytes().to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| ParleyError::DialogueTransport(e.to_string()))?;
        let form = Form::new().part("file", part);

        debug!("Sending {:?} clip for session {}", clip.duration(), session);

        let res = self
            .client
            .post(self.url())
            .query(&[("to_id", session.to_id), ("from_id", session.from_id)])
            .multipart(form)
            .send()
            .map_err(|e| ParleyError::DialogueTransport(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(ParleyError::DialogueTransport(format!(
                "Dialogue service error {}: {}",
                status, body
            )));
        }

        let bytes = res
            .bytes()
            .map_err(|e| ParleyError::DialogueTransport(e.to_string()))?;

        let reply = AudioClip::from_bytes(bytes.to_vec());
        info!("Received {} byte reply ({:?})", reply.len(), reply.duration());
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_endpoint() {
        let client = HttpDialogueClient::new("http://localhost:3000/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.url(), "http://localhost:3000/convo");
        assert_eq!(client.endpoint(), "http://localhost:3000/");
    }

    #[test]
    fn test_unreachable_service_is_transport_error() {
        let client = HttpDialogueClient::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let clip = AudioClip::encode_wav(&[0.1; 160], 16000, 1).unwrap();

        let result = client.exchange(&Session::default(), &clip);
        assert!(matches!(result, Err(ParleyError::DialogueTransport(_))));
    }
}
