use regex::Regex;
use scraper::{Html, Selector};
use std::sync::OnceLock;

const LINK_SELECTORS: &[&str] = &[
    "a[href]",
    "script[src]",
    "link[href]",
    "img[src]",
    "iframe[src]",
    "form[action]",
];

const LINK_ATTRS: &[&str] = &["href", "src", "action"];

fn css_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).expect("static regex"))
}

fn abs_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"https?://[A-Za-z0-9.-]+(?::\d+)?(?:/[^\s'"<>()]*)?"#).expect("static regex")
    })
}

/// Pulls candidate URLs out of an HTML/CSS body: element attributes plus
/// `url(...)` references and bare absolute URLs in script/style text.
pub fn collect_urls(body: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |raw: &str| {
        let raw = raw.trim();
        if raw.is_empty()
            || raw.starts_with('#')
            || raw.starts_with("javascript:")
            || raw.starts_with("mailto:")
            || raw.starts_with("data:")
        {
            return;
        }
        let s = raw.to_string();
        if !out.contains(&s) {
            out.push(s);
        }
    };

    let document = Html::parse_document(body);
    for sel in LINK_SELECTORS {
        if let Ok(selector) = Selector::parse(sel) {
            for el in document.select(&selector) {
                for attr in LINK_ATTRS {
                    if let Some(v) = el.value().attr(attr) {
                        push(v);
                    }
                }
            }
        }
    }

    for cap in css_url_re().captures_iter(body) {
        if let Some(m) = cap.get(1) {
            push(m.as_str());
        }
    }
    for m in abs_url_re().find_iter(body) {
        push(m.as_str());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_attribute_links() {
        let html = r##"
        <html><head><link href="/style.css"><script src="/app.js"></script></head>
        <body>
            <a href="/a.html">A</a>
            <a href="http://other.example/foo">B</a>
            <img src="/logo.png">
            <form action="/submit"></form>
            <a href="javascript:void(0)">skip</a>
            <a href="#frag">skip</a>
        </body></html>
        "##;
        let urls = collect_urls(html);
        assert!(urls.contains(&"/a.html".to_string()));
        assert!(urls.contains(&"/style.css".to_string()));
        assert!(urls.contains(&"/app.js".to_string()));
        assert!(urls.contains(&"/logo.png".to_string()));
        assert!(urls.contains(&"/submit".to_string()));
        assert!(urls.contains(&"http://other.example/foo".to_string()));
        assert!(!urls.iter().any(|u| u.starts_with("javascript:") || u.starts_with('#')));
    }

    #[test]
    fn collects_css_and_inline_urls() {
        let body = r#"body { background: url('/img/bg.png'); }
        var api = "https://api.example.com/v1/users";"#;
        let urls = collect_urls(body);
        assert!(urls.contains(&"/img/bg.png".to_string()));
        assert!(urls.contains(&"https://api.example.com/v1/users".to_string()));
    }

    #[test]
    fn dedups_repeated_links() {
        let html = r#"<a href="/x">1</a><a href="/x">2</a>"#;
        assert_eq!(collect_urls(html), vec!["/x".to_string()]);
    }
}
