use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Filter criteria applied to stored packets, implicit AND.
///
/// Empty strings and zero values mean "don't care". Time bounds are
/// inclusive; an absent bound is unbounded on that side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacketFilter {
    #[serde(default)]
    pub protocol: String,

    #[serde(default)]
    pub src_ip: String,

    #[serde(default)]
    pub dst_ip: String,

    /// Matches either source or destination port
    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub http_method: String,

    /// Case-insensitive substring over the user-visible fields
    #[serde(default)]
    pub search_text: String,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub domain: String,

    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub user_agent: String,

    #[serde(default)]
    pub content_type: String,

    #[serde(default)]
    pub referer: String,

    #[serde(default)]
    pub server: String,
}
