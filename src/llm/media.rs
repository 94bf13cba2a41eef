use std::time::Duration;

use reqwest::StatusCode;
use tracing::warn;

const DOWNLOAD_MAX_ATTEMPTS: usize = 3;
const DOWNLOAD_BASE_DELAY_MS: u64 = 400;

pub fn detect_mime_type(data: &[u8]) -> Option<String> {
    infer::get(data).map(|kind| kind.mime_type().to_string())
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Best-effort image download with bounded retries and a per-call timeout.
/// Returns None on any terminal failure; callers drop the image and carry on.
pub async fn download_image(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Option<Vec<u8>> {
    for attempt in 0..DOWNLOAD_MAX_ATTEMPTS {
        let response = match client.get(url).timeout(timeout).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(
                    "Failed to fetch image {url}: {err} (timeout={}, connect={}, attempt={}/{})",
                    err.is_timeout(),
                    err.is_connect(),
                    attempt + 1,
                    DOWNLOAD_MAX_ATTEMPTS
                );
                if !should_retry_error(&err) || attempt + 1 == DOWNLOAD_MAX_ATTEMPTS {
                    return None;
                }
                let delay = Duration::from_millis(DOWNLOAD_BASE_DELAY_MS << attempt);
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            warn!("Image download failed for {url} with status {status}");
            if !should_retry_status(status) || attempt + 1 == DOWNLOAD_MAX_ATTEMPTS {
                return None;
            }
            let delay = Duration::from_millis(DOWNLOAD_BASE_DELAY_MS << attempt);
            tokio::time::sleep(delay).await;
            continue;
        }

        match response.bytes().await {
            Ok(bytes) => return Some(bytes.to_vec()),
            Err(err) => {
                warn!(
                    "Failed to read image bytes from {url}: {err} (attempt={}/{})",
                    attempt + 1,
                    DOWNLOAD_MAX_ATTEMPTS
                );
                if attempt + 1 == DOWNLOAD_MAX_ATTEMPTS {
                    return None;
                }
                let delay = Duration::from_millis(DOWNLOAD_BASE_DELAY_MS << attempt);
                tokio::time::sleep(delay).await;
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_png_and_jpeg_magic_bytes() {
        let png = [0x89u8, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 0];
        assert_eq!(detect_mime_type(&png).as_deref(), Some("image/png"));

        let jpeg = [0xffu8, 0xd8, 0xff, 0xe0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(detect_mime_type(&jpeg).as_deref(), Some("image/jpeg"));
    }

    #[test]
    fn unknown_bytes_have_no_mime() {
        assert_eq!(detect_mime_type(&[0u8; 16]), None);
    }
}
