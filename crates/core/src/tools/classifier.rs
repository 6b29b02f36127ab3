//! # Input Classifier
//!
//! Pure, versioned classification of a free-form request into an
//! [`InputDescriptor`]. Classification never fails: a request with no
//! recognizable source reference yields all-false signals (plus the
//! free-text flag when any domain words remain).
//!
//! Token rules, applied per whitespace-separated token, first match wins:
//!
//! | Token shape | Signal |
//! |---|---|
//! | file name matches a work-order glob (`*.prompt.md`, ...) | existing prompt file |
//! | starts with `./`, `../`, `~/` or `/` | local path |
//! | `http(s)://host/owner/repo`, `*.git`, `git@...`, `ssh://...` | remote URL |
//! | `--web-only`, `--repo-only`, `--hybrid`, `mode: <route>` | explicit mode override |

use glob::Pattern;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::models::{InputDescriptor, Route, SourceSignals};
use crate::tools::dedup::MAX_NAME_LEN;

/// Bumped whenever the classification rules change
pub const CLASSIFIER_VERSION: u32 = 1;

/// Used when nothing in the request names the target
const FALLBACK_TARGET: &str = "unnamed-resource";

/// Leading request words that carry no domain meaning
const FILLER_WORDS: &[&str] = &[
    "please", "create", "build", "make", "generate", "write", "new", "a", "an", "the", "agent",
    "skill", "expert", "me",
];

/// Classifier configured with the work-order file patterns
#[derive(Debug, Clone)]
pub struct Classifier {
    work_order_patterns: Vec<Pattern>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(&[
            "*.prompt.md".to_string(),
            "*-prompt.md".to_string(),
            "*.workorder.md".to_string(),
        ])
    }
}

impl Classifier {
    /// Invalid glob patterns are skipped with a warning
    pub fn new(patterns: &[String]) -> Self {
        let work_order_patterns = patterns
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!("Ignoring invalid work-order pattern '{}': {}", p, e);
                    None
                }
            })
            .collect();
        Self {
            work_order_patterns,
        }
    }

    /// Classify a raw request
    pub fn classify(&self, raw_request: &str) -> InputDescriptor {
        let mut signals = SourceSignals::default();
        let mut local_path = None;
        let mut remote_url = None;
        let mut prompt_file = None;

        let (without_mode, mode) = extract_mode_override(raw_request);
        signals.explicit_mode_override = mode;

        let mut remaining = Vec::new();
        for raw_token in without_mode.split_whitespace() {
            let token = trim_token(raw_token);

            if self.is_work_order_file(token) {
                if prompt_file.is_none() {
                    prompt_file = Some(expand_home(token));
                    signals.has_existing_prompt_file = true;
                }
            } else if is_local_path(token) {
                if local_path.is_none() {
                    local_path = Some(expand_home(token));
                    signals.has_local_path = true;
                }
            } else if is_remote_repo_url(token) {
                if remote_url.is_none() {
                    remote_url = Some(token.to_string());
                    signals.has_remote_url = true;
                }
            } else {
                remaining.push(raw_token);
            }
        }

        let domain_text = strip_filler(&remaining.join(" "));
        signals.has_free_text_domain = !domain_text.is_empty();

        let target_name = extract_target_name(
            &domain_text,
            remote_url.as_deref(),
            local_path.as_deref(),
            prompt_file.as_deref(),
        );
        let target_purpose = match purpose_phrase(&domain_text) {
            "" => target_name.replace('-', " "),
            phrase => phrase.to_string(),
        };

        tracing::debug!(
            target = %target_name,
            local = signals.has_local_path,
            remote = signals.has_remote_url,
            prompt = signals.has_existing_prompt_file,
            "Request classified"
        );

        InputDescriptor {
            raw_request: raw_request.to_string(),
            target_name,
            target_purpose,
            source_signals: signals,
            local_path,
            remote_url,
            prompt_file,
            domain_text,
            classifier_version: CLASSIFIER_VERSION,
        }
    }

    fn is_work_order_file(&self, token: &str) -> bool {
        let file_name = match Path::new(token).file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return false,
        };
        if token.contains("://") {
            return false;
        }
        self.work_order_patterns
            .iter()
            .any(|p| p.matches(&file_name.to_ascii_lowercase()))
    }
}

/// Classify with the default work-order patterns
pub fn classify(raw_request: &str) -> InputDescriptor {
    Classifier::default().classify(raw_request)
}

/// Lowercase, hyphenate, collapse separators and cap the length
pub fn normalize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let mut name: String = out.trim_matches('-').chars().take(MAX_NAME_LEN).collect();
    while name.ends_with('-') {
        name.pop();
    }
    name
}

fn trim_token(token: &str) -> &str {
    let token = token.trim_start_matches(['"', '\'', '`', '(', '<']);
    let token = token.trim_end_matches(['"', '\'', '`', ')', '>', ',', ';', ':', '!', '?']);
    if token.len() > 1 && token.ends_with('.') && !token.ends_with("..") {
        &token[..token.len() - 1]
    } else {
        token
    }
}

fn is_local_path(token: &str) -> bool {
    if token.contains("://") {
        return false;
    }
    ["./", "../", "~/", "/"]
        .iter()
        .any(|prefix| token.starts_with(prefix) && token.len() > prefix.len())
}

fn is_remote_repo_url(token: &str) -> bool {
    if token.starts_with("git@") || token.starts_with("ssh://") {
        return true;
    }
    let rest = match token
        .strip_prefix("https://")
        .or_else(|| token.strip_prefix("http://"))
    {
        Some(rest) => rest,
        None => return false,
    };
    if token.ends_with(".git") {
        return true;
    }
    // host plus at least owner/repo
    rest.split('/').filter(|s| !s.is_empty()).count() >= 3
}

fn expand_home(token: &str) -> PathBuf {
    if let Some(rest) = token.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(token)
}

fn parse_route(word: &str) -> Option<Route> {
    let word = word.to_ascii_lowercase().replace(['-', '_', ' '], "");
    match word.as_str() {
        "web" | "webresearch" | "webonly" => Some(Route::WebResearch),
        "repo" | "internal" | "internalrepo" | "repoonly" => Some(Route::InternalRepo),
        "hybrid" => Some(Route::Hybrid),
        _ => None,
    }
}

/// Compiled once per process; a pattern that fails to compile is skipped
fn compiled(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn mode_flag_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(&RE, r"(?i)--(web-only|web|repo-only|repo|hybrid)\b")
}

fn mode_word_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    compiled(
        &RE,
        r"(?i)\bmode\s*[:=]?\s*(web[-_ ]?research|web|internal[-_ ]?repo|internal|repo|hybrid)\b",
    )
}

/// Explicit naming forms, most specific first
fn target_name_res() -> [Option<&'static Regex>; 3] {
    static NAMED: OnceLock<Option<Regex>> = OnceLock::new();
    static LEADING_FOR: OnceLock<Option<Regex>> = OnceLock::new();
    static ANY_FOR: OnceLock<Option<Regex>> = OnceLock::new();
    [
        compiled(
            &NAMED,
            r#"(?i)\b(?:named|called)\s+["'`]?([A-Za-z0-9][A-Za-z0-9_-]*)"#,
        ),
        compiled(
            &LEADING_FOR,
            r"(?i)^for\s+(?:an?\s+|the\s+)?([A-Za-z0-9][A-Za-z0-9_-]*)",
        ),
        compiled(
            &ANY_FOR,
            r"(?i)\bfor\s+(?:an?\s+|the\s+)?([A-Za-z0-9][A-Za-z0-9_-]*)",
        ),
    ]
}

/// Remove mode directives from the request, returning the last one found
fn extract_mode_override(raw: &str) -> (String, Option<Route>) {
    let mut mode = None;
    let mut text = raw.to_string();

    if let Some(re) = mode_flag_re() {
        for cap in re.captures_iter(raw) {
            mode = parse_route(&cap[1]).or(mode);
        }
        text = re.replace_all(&text, " ").into_owned();
    }

    if let Some(re) = mode_word_re() {
        for cap in re.captures_iter(&text) {
            mode = parse_route(&cap[1]).or(mode);
        }
        text = re.replace_all(&text, " ").into_owned();
    }

    (text, mode)
}

/// Drop leading filler words and squeeze whitespace
fn strip_filler(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let start = words
        .iter()
        .position(|w| {
            let lower = w.to_ascii_lowercase();
            !FILLER_WORDS.contains(&lower.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        })
        .unwrap_or(words.len());
    words[start..].join(" ").trim().to_string()
}

/// Domain text without a leading preposition ("for kubernetes" → "kubernetes")
fn purpose_phrase(domain_text: &str) -> &str {
    let mut words = domain_text.splitn(2, char::is_whitespace);
    let first = words.next().unwrap_or("");
    if ["for", "about", "on", "from", "covering"]
        .iter()
        .any(|p| first.eq_ignore_ascii_case(p))
    {
        return words.next().unwrap_or("").trim();
    }
    domain_text
}

fn extract_target_name(
    domain_text: &str,
    remote_url: Option<&str>,
    local_path: Option<&Path>,
    prompt_file: Option<&Path>,
) -> String {
    for re in target_name_res().into_iter().flatten() {
        if let Some(cap) = re.captures(domain_text) {
            let name = normalize_name(&cap[1]);
            if name.len() >= 3 {
                return name;
            }
        }
    }

    let from_source = remote_url
        .map(|url| {
            url.trim_end_matches('/')
                .rsplit(['/', ':'])
                .next()
                .unwrap_or("")
                .trim_end_matches(".git")
                .to_string()
        })
        .or_else(|| {
            local_path
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
        })
        .or_else(|| {
            prompt_file
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .map(|n| {
                    let n = n.to_ascii_lowercase();
                    n.split('.')
                        .next()
                        .unwrap_or("")
                        .trim_end_matches("-prompt")
                        .to_string()
                })
        })
        .map(|n| normalize_name(&n));
    if let Some(name) = from_source.filter(|n| n.len() >= 3) {
        return name;
    }

    let words: Vec<String> = domain_text
        .split_whitespace()
        .map(|w| w.to_ascii_lowercase())
        .filter(|w| !FILLER_WORDS.contains(&w.as_str()) && w != "for" && w != "of")
        .take(3)
        .collect();
    let name = normalize_name(&words.join(" "));
    if name.len() >= 3 {
        name
    } else {
        FALLBACK_TARGET.to_string()
    }
}
