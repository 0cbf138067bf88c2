use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Metadata derived from a raw Markdown body. `stripped` is the plain text
/// that feeds the search vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocMetadata {
    pub frontmatter: Option<Value>,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub stripped: String,
}

static FENCED_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("valid regex"));
static INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`\n]*)`").expect("valid regex"));
static IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]*\)").expect("valid regex"));
static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("valid regex"));
static REF_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\[[^\]]*\]").expect("valid regex"));
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}[ \t]+").expect("valid regex"));
static FIRST_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#[ \t]+(.+)$").expect("valid regex"));
static BOLD_ITALIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\*\*\*(.*?)\*\*\*|___(.*?)___").expect("valid regex"));
static BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\*\*(.*?)\*\*|__(.*?)__").expect("valid regex"));
static ITALIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*\n]+)\*|_([^_\n]+)_").expect("valid regex"));
static STRIKETHROUGH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)~~(.*?)~~").expect("valid regex"));
static HORIZONTAL_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(?:[-*_][ \t]*){3,}$").expect("valid regex"));
static BLOCKQUOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*>[ \t]?").expect("valid regex"));
static LIST_BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*[-*+][ \t]+").expect("valid regex"));
static LIST_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*\d+[.)][ \t]+").expect("valid regex"));
static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?[A-Za-z][^>\n]*>").expect("valid regex"));
static EXCESS_NEWLINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
static INLINE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)#([A-Za-z][A-Za-z0-9_-]*)").expect("valid regex"));

pub fn extract(content: &str) -> DocMetadata {
    let (frontmatter, body) = split_frontmatter(content);

    let title = frontmatter
        .as_ref()
        .and_then(|fm| fm.get("title"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .or_else(|| {
            FIRST_HEADING
                .captures(body)
                .map(|caps| caps[1].trim().to_owned())
                .filter(|t| !t.is_empty())
        });

    let mut tags: Vec<String> = Vec::new();
    if let Some(list) = frontmatter
        .as_ref()
        .and_then(|fm| fm.get("tags"))
        .and_then(Value::as_array)
    {
        for entry in list {
            if let Some(tag) = entry.as_str() {
                push_tag(&mut tags, tag);
            }
        }
    }
    // Inline #tags are matched on the body with code removed so fenced
    // blocks cannot contribute false positives.
    let fenced_stripped = FENCED_CODE.replace_all(body, "");
    let without_code = INLINE_CODE.replace_all(&fenced_stripped, "");
    for caps in INLINE_TAG.captures_iter(&without_code) {
        push_tag(&mut tags, &caps[1]);
    }
    tags.sort();
    tags.dedup();

    DocMetadata {
        frontmatter,
        title,
        tags,
        stripped: strip_markdown(body),
    }
}

fn push_tag(tags: &mut Vec<String>, raw: &str) {
    let tag = raw.trim().to_lowercase();
    if !tag.is_empty() {
        tags.push(tag);
    }
}

/// If the body opens with a `---` fenced YAML block, parse it and return the
/// remaining content. Malformed YAML (or a non-mapping document) degrades to
/// "no frontmatter, whole body is content".
fn split_frontmatter(content: &str) -> (Option<Value>, &str) {
    let rest = match content.strip_prefix("---\n").or_else(|| {
        content.strip_prefix("---\r\n")
    }) {
        Some(rest) => rest,
        None => return (None, content),
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if matches!(line.trim_end_matches(['\r', '\n']), "---") {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return match serde_yaml::from_str::<serde_yaml::Value>(yaml) {
                Ok(parsed) if parsed.is_mapping() => (Some(yaml_to_json(parsed)), body),
                _ => (None, content),
            };
        }
        offset += line.len();
    }

    (None, content)
}

fn yaml_to_json(value: serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            } else {
                Value::Null
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(seq) => {
            Value::Array(seq.into_iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let mut object = Map::new();
            for (key, val) in map {
                let key = match key {
                    serde_yaml::Value::String(s) => s,
                    other => serde_yaml::to_string(&other)
                        .map(|s| s.trim_end().to_owned())
                        .unwrap_or_default(),
                };
                object.insert(key, yaml_to_json(val));
            }
            Value::Object(object)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

/// Reduce Markdown to searchable plain text: code fences dropped, inline
/// code and emphasis unwrapped, link/image labels kept, structural markers
/// removed, blank runs collapsed.
fn strip_markdown(body: &str) -> String {
    let text = FENCED_CODE.replace_all(body, "");
    let text = INLINE_CODE.replace_all(&text, "$1");
    let text = IMAGE.replace_all(&text, "$1");
    let text = REF_LINK.replace_all(&text, "$1");
    let text = LINK.replace_all(&text, "$1");
    let text = HORIZONTAL_RULE.replace_all(&text, "");
    let text = HEADING.replace_all(&text, "");
    let text = BOLD_ITALIC.replace_all(&text, "$1$2");
    let text = BOLD.replace_all(&text, "$1$2");
    let text = ITALIC.replace_all(&text, "$1$2");
    let text = STRIKETHROUGH.replace_all(&text, "$1");
    let text = BLOCKQUOTE.replace_all(&text, "");
    let text = LIST_BULLET.replace_all(&text, "");
    let text = LIST_NUMBER.replace_all(&text, "");
    let text = HTML_TAG.replace_all(&text, "");
    let text = EXCESS_NEWLINES.replace_all(&text, "\n\n");
    text.trim().to_owned()
}
