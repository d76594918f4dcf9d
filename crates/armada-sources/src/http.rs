use armada_core::{Error, Result};

/// Turn a non-2xx response into a structured code-host error, keeping the
/// body for the failure message.
pub(crate) async fn expect_success(res: reqwest::Response) -> Result<reqwest::Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let message = res.text().await.unwrap_or_default();
    Err(Error::CodeHostStatus {
        status: status.as_u16(),
        message,
    })
}
