use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaInfo {
    pub total: String,
    pub used: String,
    pub percent: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Finds the usage line of `quota` output, e.g.
/// `总空间: 100.00GB, 已用空间: 25.00GB, 比率: 25.00%`.
pub fn parse_quota(text: &str) -> Option<QuotaInfo> {
    static QUOTA: OnceLock<Regex> = OnceLock::new();
    let re = QUOTA.get_or_init(|| {
        Regex::new(
            r"总空间[:：]\s*([\d.]+)\s*([KMGTP]?B),\s*已用空间[:：]\s*([\d.]+)\s*([KMGTP]?B),\s*比率[:：]\s*([\d.]+)%",
        )
        .expect("valid regex")
    });

    text.lines()
        .filter(|line| line.contains("总空间") && line.contains("已用空间"))
        .find_map(|line| re.captures(line))
        .map(|caps| QuotaInfo {
            total: format!("{}{}", &caps[1], &caps[2]),
            used: format!("{}{}", &caps[3], &caps[4]),
            percent: caps[5].to_string(),
        })
}

pub fn parse_identity(text: &str) -> Identity {
    static USERNAME: OnceLock<Regex> = OnceLock::new();
    static UID: OnceLock<Regex> = OnceLock::new();
    let username = USERNAME.get_or_init(|| Regex::new(r"用户名:\s*([^,]+)").expect("valid regex"));
    let uid = UID.get_or_init(|| Regex::new(r"uid:\s*(\d+)").expect("valid regex"));

    let mut identity = Identity::default();
    for line in text.lines() {
        if let Some(caps) = username.captures(line) {
            identity.username = Some(caps[1].trim().to_string());
        }
        if let Some(caps) = uid.captures(line) {
            identity.uid = Some(caps[1].to_string());
        }
    }
    identity
}
