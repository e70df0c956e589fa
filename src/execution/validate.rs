//! Submission validation: raw request in, immutable [`ExecutionRequest`] out.

use serde::{Deserialize, Serialize};

use super::model::{Browser, BrowserOptions, ExecutionRequest, Framework, Language, Viewport};
use super::ValidationError;

/// A submission as received from a caller, before validation.
///
/// Numeric overrides are signed so that negative values coming over the wire
/// are reported as validation errors rather than deserialization failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub test_id: String,
    pub source: String,
    pub framework: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub viewport_width: Option<i64>,
    #[serde(default)]
    pub viewport_height: Option<i64>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<i64>,
    #[serde(default)]
    pub max_attempts: Option<i64>,
    #[serde(default)]
    pub capture_screenshot: Option<bool>,
}

/// Defaults and ceilings applied to every submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitLimits {
    pub default_max_attempts: u32,
    pub default_attempt_timeout_ms: u64,
    pub max_attempts_limit: u32,
    pub max_attempt_timeout_ms: u64,
    pub default_capture_screenshot: bool,
    pub max_source_bytes: usize,
    /// Browser, viewport and user agent used when a submission names none.
    pub default_browser: BrowserOptions,
}

pub const MIN_VIEWPORT_SIDE: u32 = 100;
pub const MAX_VIEWPORT_SIDE: u32 = 7680;
pub const MAX_USER_AGENT_BYTES: usize = 512;

impl Default for SubmitLimits {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            default_attempt_timeout_ms: 30_000,
            max_attempts_limit: 10,
            max_attempt_timeout_ms: 600_000,
            default_capture_screenshot: true,
            max_source_bytes: 1024 * 1024,
            default_browser: BrowserOptions::default(),
        }
    }
}

/// Validate a raw submission.
///
/// `supports` reports whether the configured browser runner can execute the
/// given framework/language pair in the given browser.
pub fn validate<F>(
    raw: SubmitRequest,
    limits: &SubmitLimits,
    supports: F,
) -> Result<ExecutionRequest, ValidationError>
where
    F: Fn(Framework, Language, Browser) -> bool,
{
    let test_id = raw.test_id.trim().to_string();
    if test_id.is_empty() {
        return Err(ValidationError::EmptyTestId);
    }

    if raw.source.trim().is_empty() {
        return Err(ValidationError::EmptySource);
    }
    if raw.source.len() > limits.max_source_bytes {
        return Err(ValidationError::SourceTooLarge {
            size: raw.source.len(),
            max: limits.max_source_bytes,
        });
    }

    let framework: Framework = raw
        .framework
        .parse()
        .map_err(|_| ValidationError::UnknownFramework(raw.framework.clone()))?;

    let language: Language = match raw.language.as_deref() {
        None => Language::Javascript,
        Some(l) if l.trim().is_empty() => Language::Javascript,
        Some(l) => l
            .parse()
            .map_err(|_| ValidationError::UnknownLanguage(l.to_string()))?,
    };

    let browser = browser_options(&raw, &limits.default_browser)?;

    if !supports(framework, language, browser.browser) {
        return Err(ValidationError::UnsupportedCombination {
            framework,
            language,
            browser: browser.browser,
        });
    }

    let base_url = match raw.base_url.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(url) => {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| ValidationError::InvalidBaseUrl(format!("{}: {}", url, e)))?;
            if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
                return Err(ValidationError::InvalidBaseUrl(format!(
                    "{}: expected an http(s) URL with a host",
                    url
                )));
            }
            Some(url.to_string())
        }
    };

    let max_attempts = match raw.max_attempts {
        None => limits.default_max_attempts,
        Some(n) if n < 0 => {
            return Err(ValidationError::NegativeOverride {
                field: "max_attempts",
                value: n,
            })
        }
        Some(0) => {
            return Err(ValidationError::ZeroOverride {
                field: "max_attempts",
            })
        }
        Some(n) if n as u64 > limits.max_attempts_limit as u64 => {
            return Err(ValidationError::OverrideTooLarge {
                field: "max_attempts",
                value: n as u64,
                max: limits.max_attempts_limit as u64,
            })
        }
        Some(n) => n as u32,
    };

    let attempt_timeout_ms = match raw.timeout_ms {
        None => limits.default_attempt_timeout_ms,
        Some(t) if t < 0 => {
            return Err(ValidationError::NegativeOverride {
                field: "timeout_ms",
                value: t,
            })
        }
        Some(0) => {
            return Err(ValidationError::ZeroOverride {
                field: "timeout_ms",
            })
        }
        Some(t) if t as u64 > limits.max_attempt_timeout_ms => {
            return Err(ValidationError::OverrideTooLarge {
                field: "timeout_ms",
                value: t as u64,
                max: limits.max_attempt_timeout_ms,
            })
        }
        Some(t) => t as u64,
    };

    Ok(ExecutionRequest {
        test_id,
        source: raw.source,
        framework,
        language,
        base_url,
        browser,
        max_attempts,
        attempt_timeout_ms,
        capture_screenshot: raw
            .capture_screenshot
            .unwrap_or(limits.default_capture_screenshot),
    })
}

fn browser_options(
    raw: &SubmitRequest,
    defaults: &BrowserOptions,
) -> Result<BrowserOptions, ValidationError> {
    let browser = match raw.browser.as_deref().map(str::trim) {
        None | Some("") => defaults.browser,
        Some(b) => b
            .parse()
            .map_err(|_| ValidationError::UnknownBrowser(b.to_string()))?,
    };

    let width = raw
        .viewport_width
        .unwrap_or(defaults.viewport.width as i64);
    let height = raw
        .viewport_height
        .unwrap_or(defaults.viewport.height as i64);
    let side = (MIN_VIEWPORT_SIDE as i64)..=(MAX_VIEWPORT_SIDE as i64);
    if !side.contains(&width) || !side.contains(&height) {
        return Err(ValidationError::InvalidViewport {
            width,
            height,
            min: MIN_VIEWPORT_SIDE,
            max: MAX_VIEWPORT_SIDE,
        });
    }

    let user_agent = match raw.user_agent.as_deref() {
        None => defaults.user_agent.clone(),
        Some(ua) => {
            let ua = ua.trim();
            if ua.is_empty() || ua.len() > MAX_USER_AGENT_BYTES || ua.chars().any(char::is_control)
            {
                return Err(ValidationError::InvalidUserAgent {
                    max: MAX_USER_AGENT_BYTES,
                });
            }
            Some(ua.to_string())
        }
    };

    Ok(BrowserOptions {
        browser,
        viewport: Viewport {
            width: width as u32,
            height: height as u32,
        },
        user_agent,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
