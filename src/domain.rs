//! Domain resolution and target URL parsing
//!
//! Maps an input URL to a site configuration (API base, supported services)
//! against a fixed table of known aggregator domains, and parses the URL
//! path into a creator or post target.

use crate::error::{Error, Result};
use url::Url;

/// Site configuration for a supported aggregator domain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainConfig {
    /// Hostname, e.g. `kemono.cr`
    pub domain: &'static str,
    /// Upstream service identifiers mirrored by this aggregator
    pub services: &'static [&'static str],
}

impl DomainConfig {
    /// API base URL: `https://{domain}/api/v1`, no trailing slash
    pub fn api_base(&self) -> String {
        format!("https://{}/api/v1", self.domain)
    }

    /// Site base URL used to resolve relative file paths
    pub fn base_url(&self) -> String {
        format!("https://{}", self.domain)
    }

    /// Referer header value for outbound requests
    pub fn referer(&self) -> String {
        format!("https://{}/", self.domain)
    }
}

/// Fixed table of supported aggregator domains
const DOMAINS: &[DomainConfig] = &[
    DomainConfig {
        domain: "kemono.cr",
        services: &[
            "fanbox",
            "patreon",
            "fantia",
            "gumroad",
            "subscribestar",
            "dlsite",
            "discord",
            "boosty",
        ],
    },
    DomainConfig {
        domain: "coomer.st",
        services: &["onlyfans", "fansly", "candfans"],
    },
];

/// The user-supplied work item, parsed once from the input URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// A whole creator profile
    Creator {
        /// Upstream service identifier
        service: String,
        /// Creator identifier on that service
        creator_id: String,
    },
    /// One specific post
    Post {
        /// Upstream service identifier
        service: String,
        /// Creator identifier on that service
        creator_id: String,
        /// Post identifier
        post_id: String,
    },
}

impl Target {
    /// The (service, creator_id) pair common to both target kinds
    pub fn creator(&self) -> (&str, &str) {
        match self {
            Target::Creator {
                service,
                creator_id,
            }
            | Target::Post {
                service,
                creator_id,
                ..
            } => (service, creator_id),
        }
    }
}

/// Resolve an input URL against the fixed domain table
///
/// # Errors
///
/// Returns [`Error::UnsupportedDomain`] for unknown hostnames. This is a
/// hard pre-flight error; no retry.
pub fn resolve(url: &str) -> Result<&'static DomainConfig> {
    let parsed =
        Url::parse(url).map_err(|e| Error::InvalidTarget(format!("{url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::InvalidTarget(format!("{url}: no hostname")))?;

    DOMAINS
        .iter()
        .find(|d| d.domain.eq_ignore_ascii_case(host))
        .ok_or_else(|| Error::UnsupportedDomain(host.to_string()))
}

/// Parse the URL path into a [`Target`]
///
/// Recognized shapes:
/// - `/{service}/user/{creator_id}` → creator target
/// - `/{service}/user/{creator_id}/post/{post_id}` → post target
///
/// Query strings (e.g. pagination offsets from a browser address bar) are
/// ignored.
///
/// # Errors
///
/// Returns [`Error::InvalidTarget`] when the path has another shape or the
/// service is not supported by the resolved domain.
pub fn parse_target(url: &str, config: &DomainConfig) -> Result<Target> {
    let parsed =
        Url::parse(url).map_err(|e| Error::InvalidTarget(format!("{url}: {e}")))?;
    let segments: Vec<&str> = parsed
        .path()
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let target = match segments.as_slice() {
        [service, "user", creator_id] => Target::Creator {
            service: (*service).to_string(),
            creator_id: (*creator_id).to_string(),
        },
        [service, "user", creator_id, "post", post_id] => Target::Post {
            service: (*service).to_string(),
            creator_id: (*creator_id).to_string(),
            post_id: (*post_id).to_string(),
        },
        _ => {
            return Err(Error::InvalidTarget(format!(
                "{url}: expected /{{service}}/user/{{creator}}[/post/{{post}}]"
            )));
        }
    };

    let (service, _) = target.creator();
    if !config.services.contains(&service) {
        return Err(Error::InvalidTarget(format!(
            "service '{service}' is not supported on {}",
            config.domain
        )));
    }

    Ok(target)
}
