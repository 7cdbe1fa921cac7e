//! Encoding Repair (C1): charset detection and mojibake recovery for
//! legacy non-UTF-8 pages.
//!
//! Grounded on `encoding_utils.py`'s `detect_charset_from_content_type`,
//! `detect_charset_from_html`, `normalize_charset`, and
//! `decode_html_content` / `_has_decoding_errors`.

use regex::Regex;
use std::sync::OnceLock;

const MOJIBAKE_THRESHOLD: f64 = 0.05;
const MOJIBAKE_SAMPLE_CHARS: usize = 10_000;
const META_SCAN_BYTES: usize = 4096;

/// Bare-token + multi-character garbled bigrams checked by the mojibake
/// heuristic. The distilled contract lists six multi-character patterns;
/// the original source also flags the bare CJK replacement artifact
/// `"锟"` on its own (see SPEC_FULL.md §4.1) — both are included here.
const GARBLED_PATTERNS: &[&str] = &["锟斤拷", "锟", "ï¿½", "â€", "Ã©", "Ã¨", "Ã¯"];

fn charset_from_ct_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)charset\s*=\s*([^\s;"']+)"#).unwrap())
}

fn html5_meta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<meta\s+charset\s*=\s*["']?([^"'\s/>]+)"#).unwrap()
    })
}

fn html4_meta_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)<meta[^>]+http-equiv\s*=\s*["']?content-type["']?[^>]*content\s*=\s*["'][^"']*charset=([^"'\s;]+)"#,
        )
        .unwrap()
    })
}

fn xml_decl_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)<\?xml[^>]+encoding\s*=\s*["']([^"']+)"#).unwrap())
}

/// Normalize an arbitrary charset label to the name `encoding_rs`-style
/// decoders expect. Unknown labels pass through unchanged.
pub fn normalize_charset(charset: &str) -> String {
    let c = charset.trim().trim_matches(['"', '\'']).to_ascii_lowercase();
    match c.as_str() {
        "gb2312" | "gbk" | "gb_2312" | "gb-2312" | "chinese" | "cp936" | "ms936"
        | "windows-936" | "euc-cn" => "gb18030".to_string(),
        "utf8" | "utf-8" => "utf-8".to_string(),
        "iso-8859-1" | "latin1" | "latin-1" => "latin-1".to_string(),
        "ascii" | "us-ascii" => "ascii".to_string(),
        other => other.to_string(),
    }
}

pub fn detect_charset_from_content_type(content_type: Option<&str>) -> Option<String> {
    let ct = content_type?;
    let caps = charset_from_ct_re().captures(ct)?;
    Some(normalize_charset(&caps[1]))
}

pub fn detect_charset_from_html(html_bytes: &[u8]) -> Option<String> {
    let sample_len = html_bytes.len().min(META_SCAN_BYTES);
    // The original samples via latin-1 decoding of the raw head bytes,
    // which never fails (every byte maps to a scalar value).
    let sample: String = html_bytes[..sample_len].iter().map(|&b| b as char).collect();

    if let Some(c) = html5_meta_re().captures(&sample) {
        return Some(normalize_charset(&c[1]));
    }
    if let Some(c) = html4_meta_re().captures(&sample) {
        return Some(normalize_charset(&c[1]));
    }
    if let Some(c) = xml_decl_re().captures(&sample) {
        return Some(normalize_charset(&c[1]));
    }
    None
}

fn decode_with(bytes: &[u8], encoding_label: &str) -> Option<String> {
    let encoding = encoding_rs::Encoding::for_label(encoding_label.as_bytes())?;
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        None
    } else {
        Some(text.into_owned())
    }
}

/// Ratio of U+FFFD plus known garbled bigrams in the first
/// `MOJIBAKE_SAMPLE_CHARS` characters.
pub fn mojibake_ratio(text: &str) -> f64 {
    let sample: Vec<char> = text.chars().take(MOJIBAKE_SAMPLE_CHARS).collect();
    let sample_len = sample.len().max(1);
    let sample_str: String = sample.into_iter().collect();

    let replacement_count = sample_str.matches('\u{FFFD}').count();
    let garbled_count: usize = GARBLED_PATTERNS
        .iter()
        .map(|p| sample_str.matches(p).count())
        .sum();

    (replacement_count + garbled_count) as f64 / sample_len as f64
}

pub fn has_decoding_errors(text: &str) -> bool {
    mojibake_ratio(text) > MOJIBAKE_THRESHOLD
}

const FALLBACK_ENCODINGS: &[&str] = &["gb18030", "gbk", "gb2312", "big5", "utf-8"];

/// Decode HTML bytes, returning the decoded text and the encoding label
/// that produced it. Order: Content-Type header → `<meta>`/XML
/// declaration → fallback list → UTF-8 with replacement.
pub fn decode_html(bytes: &[u8], content_type: Option<&str>) -> (String, String) {
    let mut detected = detect_charset_from_content_type(content_type);
    if detected.is_none() {
        detected = detect_charset_from_html(bytes);
    }

    if let Some(enc) = &detected {
        if let Some(text) = decode_with(bytes, enc) {
            if !has_decoding_errors(&text) {
                return (text, enc.clone());
            }
        }
    }

    for enc in FALLBACK_ENCODINGS {
        if let Some(text) = decode_with(bytes, enc) {
            if !has_decoding_errors(&text) {
                return (text, enc.to_string());
            }
        }
    }

    let (text, _, _) = encoding_rs::UTF_8.decode(bytes);
    (text.into_owned(), "utf-8".to_string())
}

/// Attempt to repair already-decoded HTML that looks garbled, optionally
/// re-decoding from the original bytes if available.
pub fn fix_garbled_html(html: &str, original_bytes: Option<&[u8]>) -> String {
    if !has_decoding_errors(html) {
        return html.to_string();
    }
    if let Some(bytes) = original_bytes {
        let (text, _) = decode_html(bytes, None);
        if !has_decoding_errors(&text) {
            return text;
        }
    }
    // Mojibake fix trick: the text was almost certainly originally GB18030
    // bytes misread as Latin-1; re-encode as Latin-1 then decode as
    // GB18030 to recover it.
    let latin1_bytes: Vec<u8> = html.chars().map(|c| c as u32 as u8).collect();
    decode_with(&latin1_bytes, "gb18030").unwrap_or_else(|| html.to_string())
}
