//! Bearer token header used by the census data service.

use anyhow::{Context, Result};
use reqwest::header::HeaderValue;

pub(crate) fn bearer_header(token: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
        .context("failed to build Authorization header")?;
    value.set_sensitive(true);
    Ok(value)
}
