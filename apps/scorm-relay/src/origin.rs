use url::Url;

const LOOPBACK_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

/// Origins allowed to drive the host session. Order is preserved from
/// configuration, duplicates are dropped, and the list never changes after
/// construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginAllowList {
    origins: Vec<String>,
}

impl OriginAllowList {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list: Vec<String> = Vec::new();
        for origin in origins {
            let origin = origin.as_ref().trim().trim_end_matches('/');
            if origin.is_empty() || list.iter().any(|known| known == origin) {
                continue;
            }
            list.push(origin.to_owned());
        }
        Self { origins: list }
    }

    /// Parses a comma separated list, e.g. from an environment variable.
    pub fn parse_list(raw: &str) -> Self {
        Self::new(raw.split(','))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.origins.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    /// Exact match, or for loopback entries a match on scheme and host with
    /// the port ignored (dev servers move ports around).
    pub fn is_allowed(&self, origin: &str) -> bool {
        self.origins
            .iter()
            .any(|allowed| allowed == origin || loopback_equivalent(allowed, origin))
    }
}

fn loopback_equivalent(allowed: &str, origin: &str) -> bool {
    let Ok(allowed) = Url::parse(allowed) else {
        return false;
    };
    let Some(host) = allowed.host_str() else {
        return false;
    };
    if !LOOPBACK_HOSTS.contains(&host) {
        return false;
    }
    match Url::parse(origin) {
        Ok(candidate) => candidate.scheme() == allowed.scheme() && candidate.host_str() == Some(host),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> OriginAllowList {
        OriginAllowList::new([
            "https://content.example.org",
            "http://localhost:5500",
            "http://127.0.0.1:5500",
        ])
    }

    #[test]
    fn exact_origins_match() {
        let list = list();
        assert!(list.is_allowed("https://content.example.org"));
        assert!(list.is_allowed("http://localhost:5500"));
    }

    #[test]
    fn remote_origins_are_port_and_scheme_sensitive() {
        let list = list();
        assert!(!list.is_allowed("https://content.example.org:8443"));
        assert!(!list.is_allowed("http://content.example.org"));
        assert!(!list.is_allowed("https://evil.example.org"));
        assert!(!list.is_allowed("https://content.example.org.evil.net"));
    }

    #[test]
    fn loopback_ignores_port_only() {
        let list = list();
        assert!(list.is_allowed("http://localhost:3000"));
        assert!(list.is_allowed("http://localhost"));
        assert!(list.is_allowed("http://127.0.0.1:8080"));
        assert!(!list.is_allowed("https://localhost:5500"));
        assert!(!list.is_allowed("http://localhost.evil.net:5500"));

        let only_localhost = OriginAllowList::new(["http://localhost:5500"]);
        assert!(!only_localhost.is_allowed("http://127.0.0.1:5500"));
    }

    #[test]
    fn opaque_origins_are_rejected() {
        let list = list();
        assert!(!list.is_allowed("null"));
        assert!(!list.is_allowed(""));
        assert!(OriginAllowList::new(["null"]).is_allowed("null"));
    }

    #[test]
    fn parse_list_trims_and_dedups() {
        let list = OriginAllowList::parse_list(
            " http://localhost:5500/ , https://a.example,,https://a.example ",
        );
        assert_eq!(
            list.iter().collect::<Vec<_>>(),
            vec!["http://localhost:5500", "https://a.example"]
        );
        assert_eq!(list.len(), 2);
        assert!(OriginAllowList::parse_list("").is_empty());
    }
}
