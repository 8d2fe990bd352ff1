use std::fmt;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

/// The intake api key.
///
/// Wrapped so the value can’t leak through `Debug`/`Display` formatting;
/// only [`ApiKey::expose`] hands out the actual secret.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("api key file {path} does not exist")]
    Missing { path: Utf8PathBuf },
    #[error("failed to read api key file {path}")]
    Unreadable {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("api key file {path} is empty or not valid UTF-8")]
    Invalid { path: Utf8PathBuf },
}

/// Reads the intake api key.
///
/// `API_KEY_OVERRIDE` takes precedence when non-empty (and is warned
/// about, since it bypasses the protected key file). Otherwise the key
/// file content is used verbatim after trimming surrounding whitespace.
/// A missing or undecodable key is fatal at startup; the caller exits.
pub fn read_api_key(api_key_file: &Utf8Path, env_override: Option<String>) -> Result<ApiKey, SecretError> {
    if let Some(key_override) = env_override.filter(|value| !value.trim().is_empty()) {
        warn!("API_KEY_OVERRIDE is set; ignoring the api key file");
        return Ok(ApiKey(key_override.trim().to_owned()));
    }

    if !api_key_file.exists() {
        return Err(SecretError::Missing {
            path: api_key_file.to_owned(),
        });
    }

    let bytes = fs::read(api_key_file).map_err(|source| SecretError::Unreadable {
        path: api_key_file.to_owned(),
        source,
    })?;

    let key = String::from_utf8(bytes)
        .ok()
        .map(|contents| contents.trim().to_owned())
        .filter(|key| !key.is_empty())
        .ok_or_else(|| SecretError::Invalid {
            path: api_key_file.to_owned(),
        })?;

    Ok(ApiKey(key))
}

#[cfg(test)]
pub(crate) fn test_key(value: &str) -> ApiKey {
    ApiKey(value.to_owned())
}
