use anyhow::Context;
use std::path::Path;

#[derive(Clone)]
pub struct AwsCredentials {
    pub key_id: String,
    pub key_secret: String,
}

impl AwsCredentials {
    /// Read credentials from a key file containing `ACCESS_KEY_ID=...`
    /// and `ACCESS_KEY_SECRET=...` lines. Blank lines and `#` comments
    /// are ignored.
    pub fn from_keyfile(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading AWS keys from {}", path.display()))?;

        let mut key_id = None;
        let mut key_secret = None;
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(v) = line.strip_prefix("ACCESS_KEY_ID=") {
                key_id = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("ACCESS_KEY_SECRET=") {
                key_secret = Some(v.trim().to_string());
            }
        }

        Ok(Self {
            key_id: key_id
                .with_context(|| format!("{} has no ACCESS_KEY_ID", path.display()))?,
            key_secret: key_secret
                .with_context(|| format!("{} has no ACCESS_KEY_SECRET", path.display()))?,
        })
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // Never let the secret reach a log line.
        f.debug_struct("AwsCredentials")
            .field("key_id", &self.key_id)
            .field("key_secret", &"<redacted>")
            .finish()
    }
}
