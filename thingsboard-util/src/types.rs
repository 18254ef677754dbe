use std::fmt::Display;
use std::ops::Deref;
use std::str::FromStr;
use thiserror::Error;

/// Device access token issued by the platform.
///
/// It is used verbatim as the MQTT username and as a (percent-encoded)
/// path segment of every authenticated HTTP endpoint. Any non-empty text
/// without control characters is accepted.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AccessToken(String);

#[derive(Debug, Error)]
pub enum InvalidTokenError {
    #[error("access token cannot be empty")]
    Empty,

    #[error("access token contains invalid character {0:?}")]
    InvalidChar(char),
}

impl AccessToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for AccessToken {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// Tokens are credentials, keep them out of debug logs
impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

impl TryFrom<String> for AccessToken {
    type Error = InvalidTokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(InvalidTokenError::Empty);
        }
        if let Some(c) = value.chars().find(|c| c.is_control()) {
            return Err(InvalidTokenError::InvalidChar(c));
        }
        Ok(Self(value))
    }
}

impl FromStr for AccessToken {
    type Err = InvalidTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.to_owned().try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_accepts_platform_tokens() {
        let token: AccessToken = "AvZTC8mOGSmKGdCF05Gx".parse().unwrap();
        assert_eq!(token.as_str(), "AvZTC8mOGSmKGdCF05Gx");
    }

    #[test]
    fn it_accepts_tokens_that_are_not_url_safe() {
        for raw in ["abc/def", "dev 01", "jeton-é?#"] {
            let token: AccessToken = raw.parse().unwrap();
            assert_eq!(token.as_str(), raw);
        }
    }

    #[test]
    fn it_rejects_empty_tokens_and_control_characters() {
        assert!(matches!(
            "".parse::<AccessToken>(),
            Err(InvalidTokenError::Empty)
        ));
        assert!(matches!(
            "abc\ndef".parse::<AccessToken>(),
            Err(InvalidTokenError::InvalidChar('\n'))
        ));
    }

    #[test]
    fn it_does_not_leak_the_token_in_debug_output() {
        let token: AccessToken = "secret".parse().unwrap();
        assert_eq!(format!("{token:?}"), "AccessToken(***)");
    }
}
