/// A normalized probe request. Path mode appends a suffix to the base URL;
/// host mode keeps the base URL and overrides the Host header.
#[derive(Debug, Clone)]
pub struct SprayRequest {
    pub url: String,
    pub vhost: Option<String>,
    /// the probe fragment this request was built from
    pub path: String,
}

pub fn build_path_request(base: &str, path: &str) -> SprayRequest {
    let url = join_url(base, path);
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    SprayRequest {
        url,
        vhost: None,
        path,
    }
}

pub fn build_host_request(base: &str, vhost: &str) -> SprayRequest {
    SprayRequest {
        url: base.to_string(),
        vhost: Some(vhost.to_string()),
        path: vhost.to_string(),
    }
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_request_joins_base_and_suffix() {
        let r = build_path_request("http://a.com/", "admin");
        assert_eq!(r.url, "http://a.com/admin");
        assert_eq!(r.path, "/admin");
        assert!(r.vhost.is_none());
    }

    #[test]
    fn host_request_keeps_base_url() {
        let r = build_host_request("http://1.2.3.4", "dev.example.com");
        assert_eq!(r.url, "http://1.2.3.4");
        assert_eq!(r.vhost.as_deref(), Some("dev.example.com"));
    }
}
