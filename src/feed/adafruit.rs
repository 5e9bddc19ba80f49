use crate::feed::{FeedClient, FeedError};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://io.adafruit.com";
pub const USERNAME_VAR: &str = "AIO_USERNAME";
pub const KEY_VAR: &str = "AIO_KEY";

#[derive(Clone, PartialEq, Eq)]
pub struct AioCredentials {
    pub username: String,
    pub key: String,
}

impl AioCredentials {
    /// Read credentials through `lookup`; a missing or blank value is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, FeedError> {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| FeedError::MissingCredentials(name.to_string()))
        };
        Ok(Self {
            username: read(USERNAME_VAR)?,
            key: read(KEY_VAR)?,
        })
    }

    pub fn from_env() -> Result<Self, FeedError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }
}

impl fmt::Debug for AioCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AioCredentials")
            .field("username", &self.username)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Adafruit IO REST client.
pub struct AdafruitIoClient {
    client: reqwest::blocking::Client,
    base_url: String,
    credentials: AioCredentials,
}

impl AdafruitIoClient {
    pub fn new(
        base_url: &str,
        credentials: AioCredentials,
        timeout: Duration,
    ) -> Result<Self, FeedError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| FeedError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn data_url(&self, feed_key: &str) -> String {
        format!(
            "{}/api/v2/{}/feeds/{}/data",
            self.base_url, self.credentials.username, feed_key
        )
    }
}

impl fmt::Debug for AdafruitIoClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdafruitIoClient")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl FeedClient for AdafruitIoClient {
    fn send_data(&self, feed_key: &str, value: u16) -> Result<(), FeedError> {
        let response = self
            .client
            .post(self.data_url(feed_key))
            .header("X-AIO-Key", &self.credentials.key)
            .json(&serde_json::json!({ "value": value }))
            .send()
            .map_err(|err| FeedError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Http(status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> AioCredentials {
        AioCredentials {
            username: "bridge".to_string(),
            key: "aio_secret".to_string(),
        }
    }

    #[test]
    fn credentials_come_from_lookup() -> Result<(), FeedError> {
        let creds = AioCredentials::from_lookup(|name| match name {
            USERNAME_VAR => Some("bridge".to_string()),
            KEY_VAR => Some(" aio_secret ".to_string()),
            _ => None,
        })?;

        assert_eq!(creds, credentials());
        Ok(())
    }

    #[test]
    fn blank_key_is_missing() {
        let result = AioCredentials::from_lookup(|name| match name {
            USERNAME_VAR => Some("bridge".to_string()),
            _ => Some("  ".to_string()),
        });

        assert!(matches!(result, Err(FeedError::MissingCredentials(name)) if name == KEY_VAR));
    }

    #[test]
    fn debug_output_hides_key() {
        let rendered = format!("{:?}", credentials());

        assert!(rendered.contains("bridge"));
        assert!(!rendered.contains("aio_secret"));
    }

    #[test]
    fn data_url_includes_user_and_feed() -> Result<(), FeedError> {
        let client = AdafruitIoClient::new(
            "https://io.adafruit.com/",
            credentials(),
            Duration::from_secs(5),
        )?;

        assert_eq!(
            client.data_url("lobby-occupancy"),
            "https://io.adafruit.com/api/v2/bridge/feeds/lobby-occupancy/data"
        );
        Ok(())
    }

    #[test]
    fn unreachable_service_is_a_transport_error() -> Result<(), FeedError> {
        let client =
            AdafruitIoClient::new("http://127.0.0.1:9", credentials(), Duration::from_secs(2))?;

        let result = client.send_data("lobby", 3);

        assert!(matches!(result, Err(FeedError::Transport(_))));
        Ok(())
    }
}
