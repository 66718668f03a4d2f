//! Fetches a VKP patch by its numeric ID from the public patch archive.

use crate::error::{Error, Result};

const PATCH_URL_BASE: &str = "https://patches.kibab.com/patches/dn.php5";

/// Fetches patch `id`'s VKP text over HTTPS.
pub async fn fetch_patch(id: u64) -> Result<String> {
    let client = reqwest::Client::new();
    let response = client
        .get(PATCH_URL_BASE)
        .query(&[("id", id.to_string())])
        .send()
        .await
        .map_err(|e| Error::ProtocolError(format!("failed to fetch patch {id}: {e}")))?;

    response
        .text()
        .await
        .map_err(|e| Error::ProtocolError(format!("failed to read patch {id} body: {e}")))
}

/// If `arg` parses as a plain decimal integer, it is treated as a numeric
/// patch ID to fetch remotely rather than a local file path.
pub fn parse_numeric_id(arg: &str) -> Option<u64> {
    arg.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_arg_parses_as_id() {
        assert_eq!(parse_numeric_id("1234"), Some(1234));
    }

    #[test]
    fn path_like_arg_is_not_an_id() {
        assert_eq!(parse_numeric_id("./patch.vkp"), None);
        assert_eq!(parse_numeric_id("/tmp/patch.vkp"), None);
    }
}
