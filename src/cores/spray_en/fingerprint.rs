use regex::Regex;
use serde::{Deserialize, Serialize};

/// MD5 hex digest over a body slice.
pub fn md5_hash(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// 32-bit MurmurHash3, rendered as the signed decimal string convention
/// used by favicon/shodan style fingerprints.
pub fn mmh3_hash32(data: &[u8]) -> String {
    (murmur3_32(data, 0) as i32).to_string()
}

fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut h1 = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13).wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let mut k1: u32 = 0;
    if tail.len() >= 3 {
        k1 ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        k1 ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        k1 ^= tail[0] as u32;
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85ebca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2ae35);
    h1 ^= h1 >> 16;
    h1
}

/// 64-bit simhash over the body token stream. Tokens are normalized to
/// lowercase alphanumerics so markup noise does not dominate the weights.
pub fn simhash64(raw: &[u8]) -> u64 {
    let text = normalize_text(&String::from_utf8_lossy(raw));
    let mut weights = [0i32; 64];
    for tok in text.split_whitespace() {
        if tok.len() < 2 {
            continue;
        }
        let h = fnv_hash64(tok.as_bytes());
        for (i, w) in weights.iter_mut().enumerate() {
            if (h >> i) & 1 == 1 {
                *w += 1;
            } else {
                *w -= 1;
            }
        }
    }
    let mut out = 0u64;
    for (i, w) in weights.iter().enumerate() {
        if *w > 0 {
            out |= 1u64 << i;
        }
    }
    out
}

pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

fn fnv_hash64(input: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in input {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

fn normalize_text(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect()
}

/// A framework match attached to a baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Framework {
    pub name: String,
}

impl Framework {
    pub fn to_tag(&self) -> String {
        format!("[{}]", self.name)
    }
}

/// One fingerprint entry: a token looked for in the header dump or body.
#[derive(Debug, Clone)]
pub struct Finger {
    pub name: &'static str,
    pub header_token: Option<&'static str>,
    pub body_token: Option<&'static str>,
}

pub fn builtin_fingers() -> Vec<Finger> {
    vec![
        Finger { name: "nginx", header_token: Some("nginx"), body_token: None },
        Finger { name: "apache", header_token: Some("apache"), body_token: None },
        Finger { name: "iis", header_token: Some("microsoft-iis"), body_token: None },
        Finger { name: "php", header_token: Some("php"), body_token: None },
        Finger { name: "express", header_token: Some("express"), body_token: None },
        Finger { name: "cloudflare", header_token: Some("cloudflare"), body_token: None },
        Finger { name: "tomcat", header_token: None, body_token: Some("apache tomcat") },
        Finger { name: "spring", header_token: None, body_token: Some("whitelabel error page") },
        Finger { name: "wordpress", header_token: None, body_token: Some("wp-content") },
        Finger { name: "shiro", header_token: Some("rememberme=deleteme"), body_token: None },
    ]
}

pub fn finger_detect(header: &str, body: &str, fingers: &[Finger]) -> Vec<Framework> {
    let header = header.to_ascii_lowercase();
    let body = body.to_ascii_lowercase();
    let mut out = Vec::new();
    for f in fingers {
        let header_hit = f.header_token.map(|t| header.contains(t)).unwrap_or(false);
        let body_hit = f.body_token.map(|t| body.contains(t)).unwrap_or(false);
        if header_hit || body_hit {
            out.push(Framework { name: f.name.to_string() });
        }
    }
    out
}

/// One data extractor run over response bodies.
#[derive(Debug, Clone)]
pub struct Extractor {
    pub name: &'static str,
    pub pattern: Regex,
}

pub fn builtin_extractors() -> Vec<Extractor> {
    [
        ("email", r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}"),
        ("ipv4", r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
        ("aws-key", r"AKIA[0-9A-Z]{16}"),
    ]
    .into_iter()
    .filter_map(|(name, pat)| Regex::new(pat).ok().map(|pattern| Extractor { name, pattern }))
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extracted {
    pub name: String,
    pub matches: Vec<String>,
}

const MAX_EXTRACT_MATCHES: usize = 5;

pub fn extract(body: &str, extractors: &[Extractor]) -> Vec<Extracted> {
    let mut out = Vec::new();
    for e in extractors {
        let mut matches: Vec<String> = Vec::new();
        for m in e.pattern.find_iter(body) {
            let s = m.as_str().to_string();
            if !matches.contains(&s) {
                matches.push(s);
            }
            if matches.len() >= MAX_EXTRACT_MATCHES {
                break;
            }
        }
        if !matches.is_empty() {
            out.push(Extracted { name: e.name.to_string(), matches });
        }
    }
    out
}
