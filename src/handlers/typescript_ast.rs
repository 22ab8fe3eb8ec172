//! TypeScript AST node - lexical declaration scan over source text.
//!
//! Extracts top-level `interface`, `type`, `enum`, and `class` declarations
//! (with an optional `export` prefix) into an object keyed by kind. This is
//! a declaration indexer, not a parser: bodies are captured by brace
//! balancing and type aliases end at the first top-level semicolon.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{ExecutableNode, NodeKind, NodeType};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::Envelope;
use crate::types::{Error, Result};

use super::{NodeHandler, NodeOutput};

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
struct Declaration {
    name: String,
    text: String,
    exported: bool,
}

fn scan(source: &str, kind: &str) -> Vec<Declaration> {
    let mut found = Vec::new();
    let mut search_from = 0;

    while let Some(rel) = source[search_from..].find(kind) {
        let at = search_from + rel;
        search_from = at + kind.len();

        // Word boundaries around the keyword.
        let before_ok = at == 0
            || source[..at]
                .chars()
                .next_back()
                .map(|c| !c.is_alphanumeric() && c != '_')
                .unwrap_or(true);
        let after = &source[at + kind.len()..];
        if !before_ok || !after.starts_with(char::is_whitespace) {
            continue;
        }

        let name: String = after
            .trim_start()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if name.is_empty() {
            continue;
        }

        let line_start = source[..at].rfind('\n').map(|i| i + 1).unwrap_or(0);
        let prefix = &source[line_start..at];
        let exported = prefix.contains("export");

        let end = if kind == "type" {
            // Alias: first semicolon outside braces/angles.
            let mut depth = 0i32;
            after
                .char_indices()
                .find(|(_, c)| match c {
                    '{' | '<' | '(' | '[' => {
                        depth += 1;
                        false
                    }
                    '}' | '>' | ')' | ']' => {
                        depth -= 1;
                        false
                    }
                    ';' => depth <= 0,
                    _ => false,
                })
                .map(|(i, _)| at + kind.len() + i + 1)
        } else {
            // Block declaration: balanced braces.
            let mut depth = 0i32;
            let mut started = false;
            after
                .char_indices()
                .find(|(_, c)| match c {
                    '{' => {
                        depth += 1;
                        started = true;
                        false
                    }
                    '}' => {
                        depth -= 1;
                        started && depth == 0
                    }
                    _ => false,
                })
                .map(|(i, _)| at + kind.len() + i + 1)
        };

        let Some(end) = end else { continue };
        found.push(Declaration {
            name,
            text: source[line_start..end].trim().to_string(),
            exported,
        });
        search_from = end;
    }

    found
}

#[derive(Debug, Default)]
pub struct TypescriptAstHandler;

#[async_trait]
impl NodeHandler for TypescriptAstHandler {
    fn node_type(&self) -> NodeType {
        NodeType::TypescriptAst
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        _task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::TypescriptAst(config) = &node.kind else {
            return Err(Error::execution("typescript_ast handler on wrong node"));
        };

        let source = inputs
            .get("default")
            .and_then(|e| e.as_text().map(str::to_string))
            .unwrap_or_default();

        let mut body = serde_json::Map::new();
        for kind in &config.extract {
            let declarations = scan(&source, kind);
            body.insert(
                format!("{kind}s"),
                serde_json::to_value(declarations)?,
            );
        }

        Ok(NodeOutput::single(Envelope::from_json(
            Value::Object(body),
            node.id().clone(),
            ctx.execution_id.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = r#"
export interface User {
  id: string;
  profile: { name: string };
}

type Alias = Record<string, number>;

enum Color { Red, Green }

const interfaceLike = 1;
"#;

    #[test]
    fn extracts_interfaces_with_nested_braces() {
        let decls = scan(SOURCE, "interface");
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, "User");
        assert!(decls[0].exported);
        assert!(decls[0].text.ends_with('}'));
    }

    #[test]
    fn extracts_type_aliases_to_semicolon() {
        let decls = scan(SOURCE, "type");
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, "Alias");
        assert!(decls[0].text.ends_with(';'));
        assert!(!decls[0].exported);
    }

    #[test]
    fn extracts_enums() {
        let decls = scan(SOURCE, "enum");
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, "Color");
    }

    #[test]
    fn keyword_needs_word_boundary() {
        // `interfaceLike` must not match.
        let decls = scan("const interfaceLike = {};", "interface");
        assert!(decls.is_empty());
    }
}
