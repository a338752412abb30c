//! 主机白名单

use reqwest::Url;

/// 允许捕获流量的主机集合（小写，保持配置顺序）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAllowlist {
    hosts: Vec<String>,
}

impl HostAllowlist {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for host in hosts {
            let host = normalize(host.as_ref());
            if !host.is_empty() && !out.contains(&host) {
                out.push(host);
            }
        }
        Self { hosts: out }
    }

    /// URL 主机是否在白名单内（大小写不敏感）
    pub fn allows(&self, url: &Url) -> bool {
        url.host_str()
            .map(|host| self.allows_host(host))
            .unwrap_or(false)
    }

    pub fn allows_host(&self, host: &str) -> bool {
        let host = normalize(host);
        self.hosts.iter().any(|allowed| *allowed == host)
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }
}

fn normalize(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_match() {
        let list = HostAllowlist::new(["API.OpenAI.com", "api.anthropic.com"]);
        assert!(list.allows(&Url::parse("https://api.openai.com/v1/chat/completions").unwrap()));
        assert!(list.allows(&Url::parse("https://API.ANTHROPIC.COM./v1/messages").unwrap()));
        assert!(!list.allows(&Url::parse("https://example.com/").unwrap()));
    }

    #[test]
    fn test_port_and_ip_hosts() {
        let list = HostAllowlist::new(["127.0.0.1"]);
        assert!(list.allows(&Url::parse("http://127.0.0.1:8080/x").unwrap()));
        assert!(!list.allows(&Url::parse("http://localhost:8080/x").unwrap()));
    }

    #[test]
    fn test_subdomains_do_not_match() {
        let list = HostAllowlist::new(["openai.com"]);
        assert!(!list.allows_host("api.openai.com"));
        assert!(list.allows_host("openai.com"));
    }

    #[test]
    fn test_duplicates_and_blanks_removed() {
        let list = HostAllowlist::new(["a.com", " A.com ", ""]);
        assert_eq!(list.hosts(), &["a.com".to_string()]);
    }
}
