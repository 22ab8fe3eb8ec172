//! Micro-template rendering for prompts and edge transforms.
//!
//! Supports `{{ path.to.value }}` placeholders with dotted lookups into a
//! JSON context. Missing paths render empty; non-string values render as
//! compact JSON. Parsed templates are cached in a bounded LRU keyed by the
//! template source.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use serde_json::Value;

/// A parsed template segment.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Var(String),
}

fn parse(template: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        if !rest[..open].is_empty() {
            segments.push(Segment::Literal(rest[..open].to_string()));
        }
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                segments.push(Segment::Var(after[..close].trim().to_string()));
                rest = &after[close + 2..];
            }
            None => {
                // Unterminated placeholder renders literally.
                segments.push(Segment::Literal(rest[open..].to_string()));
                rest = "";
            }
        }
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }
    segments
}

/// Look up a dotted path in a JSON value.
pub fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn render_segments(segments: &[Segment], context: &Value) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal(s) => out.push_str(s),
            Segment::Var(path) => match lookup(context, path) {
                Some(Value::String(s)) => out.push_str(s),
                Some(Value::Null) | None => {}
                Some(other) => out.push_str(&other.to_string()),
            },
        }
    }
    out
}

/// Render a template without caching.
pub fn render(template: &str, context: &Value) -> String {
    render_segments(&parse(template), context)
}

/// Bounded cache of parsed templates.
pub struct TemplateCache {
    parsed: Mutex<LruCache<String, Arc<Vec<Segment>>>>,
}

impl std::fmt::Debug for TemplateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateCache").finish_non_exhaustive()
    }
}

impl TemplateCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            parsed: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn render(&self, template: &str, context: &Value) -> String {
        let segments = {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let mut cache = self.parsed.lock().unwrap();
            match cache.get(template) {
                Some(parsed) => Arc::clone(parsed),
                None => {
                    let parsed = Arc::new(parse(template));
                    cache.put(template.to_string(), Arc::clone(&parsed));
                    parsed
                }
            }
        };
        render_segments(&segments, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_dotted_paths() {
        let context = json!({"user": {"name": "ada"}, "n": 3});
        assert_eq!(
            render("hi {{ user.name }}, n={{ n }}", &context),
            "hi ada, n=3"
        );
    }

    #[test]
    fn missing_paths_render_empty() {
        assert_eq!(render("[{{ nope.x }}]", &json!({})), "[]");
    }

    #[test]
    fn objects_render_as_json() {
        let context = json!({"o": {"a": 1}});
        assert_eq!(render("{{ o }}", &context), "{\"a\":1}");
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(render("a {{ b", &json!({})), "a {{ b");
    }

    #[test]
    fn array_indexing() {
        let context = json!({"xs": [10, 20]});
        assert_eq!(render("{{ xs.1 }}", &context), "20");
    }

    #[test]
    fn cache_round_trip() {
        let cache = TemplateCache::new(2);
        let context = json!({"x": "v"});
        assert_eq!(cache.render("{{ x }}", &context), "v");
        assert_eq!(cache.render("{{ x }}", &context), "v");
    }
}
