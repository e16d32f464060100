//! Static `(category, op) -> (upstream, tool, cacheable)` table (spec.md 4.3).
//!
//! The table is the sole source of truth for routing and cache eligibility
//! and never changes after the process starts. Several `code_operations`
//! entries intentionally route distinct operation names to the same
//! upstream tool (spec.md 9); that's source behavior, preserved as-is.

use std::collections::HashMap;
use std::sync::OnceLock;

/// One of the upstream identifiers the gateway knows how to launch. Closed
/// set, matching spec.md 3 ("`name` is drawn from a closed set").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamName {
    Serena,
    Context7,
    Playwright,
    Tavily,
    MagicUi,
}

impl UpstreamName {
    pub fn as_str(self) -> &'static str {
        match self {
            UpstreamName::Serena => "serena",
            UpstreamName::Context7 => "context7",
            UpstreamName::Playwright => "playwright",
            UpstreamName::Tavily => "tavily",
            UpstreamName::MagicUi => "magicui",
        }
    }

    pub fn all() -> [UpstreamName; 5] {
        [
            UpstreamName::Serena,
            UpstreamName::Context7,
            UpstreamName::Playwright,
            UpstreamName::Tavily,
            UpstreamName::MagicUi,
        ]
    }
}

/// The category a meta-tool advertises to the agent. `Batch` is synthetic:
/// it maps to the batch executor rather than any single upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    CodeOperations,
    DocumentationLookup,
    BrowserTesting,
    WebResearch,
    UiComponents,
    Batch,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::CodeOperations => "code_operations",
            Category::DocumentationLookup => "documentation_lookup",
            Category::BrowserTesting => "browser_testing",
            Category::WebResearch => "web_research",
            Category::UiComponents => "ui_components",
            Category::Batch => "batch",
        }
    }

    pub fn meta_tool_categories() -> [Category; 5] {
        [
            Category::CodeOperations,
            Category::DocumentationLookup,
            Category::BrowserTesting,
            Category::WebResearch,
            Category::UiComponents,
        ]
    }

    pub fn upstream(self) -> Option<UpstreamName> {
        match self {
            Category::CodeOperations => Some(UpstreamName::Serena),
            Category::DocumentationLookup => Some(UpstreamName::Context7),
            Category::BrowserTesting => Some(UpstreamName::Playwright),
            Category::WebResearch => Some(UpstreamName::Tavily),
            Category::UiComponents => Some(UpstreamName::MagicUi),
            Category::Batch => None,
        }
    }
}

/// `{ category, opName } -> { upstreamName, upstreamTool, cacheable, description }` (spec.md 3).
#[derive(Debug, Clone, Copy)]
pub struct OperationMapping {
    pub category: Category,
    pub op: &'static str,
    pub upstream: UpstreamName,
    pub tool: &'static str,
    pub cacheable: bool,
    pub description: &'static str,
}

const ENTRIES: &[OperationMapping] = &[
    // code_operations (serena)
    OperationMapping {
        category: Category::CodeOperations,
        op: "findSymbol",
        upstream: UpstreamName::Serena,
        tool: "find_symbol",
        cacheable: true,
        description: "Find a symbol definition by name path",
    },
    OperationMapping {
        category: Category::CodeOperations,
        op: "findReferences",
        upstream: UpstreamName::Serena,
        tool: "find_referencing_symbols",
        cacheable: true,
        description: "Find references to a symbol",
    },
    OperationMapping {
        category: Category::CodeOperations,
        op: "getSymbolsOverview",
        upstream: UpstreamName::Serena,
        tool: "get_symbols_overview",
        cacheable: true,
        description: "List top-level symbols in a file",
    },
    OperationMapping {
        category: Category::CodeOperations,
        op: "searchPattern",
        upstream: UpstreamName::Serena,
        tool: "search_for_pattern",
        cacheable: true,
        description: "Search the project for a regex pattern",
    },
    OperationMapping {
        category: Category::CodeOperations,
        op: "renameFile",
        upstream: UpstreamName::Serena,
        tool: "replace_lines",
        cacheable: false,
        description: "Rename a file (routes through the line-replace tool)",
    },
    OperationMapping {
        category: Category::CodeOperations,
        op: "moveFile",
        upstream: UpstreamName::Serena,
        tool: "replace_lines",
        cacheable: false,
        description: "Move a file (routes through the line-replace tool)",
    },
    OperationMapping {
        category: Category::CodeOperations,
        op: "editFile",
        upstream: UpstreamName::Serena,
        tool: "replace_lines",
        cacheable: false,
        description: "Edit a range of lines in a file",
    },
    // documentation_lookup (context7)
    OperationMapping {
        category: Category::DocumentationLookup,
        op: "resolveLibraryId",
        upstream: UpstreamName::Context7,
        tool: "resolve-library-id",
        cacheable: true,
        description: "Resolve a package name to a documentation library id",
    },
    OperationMapping {
        category: Category::DocumentationLookup,
        op: "getLibraryDocs",
        upstream: UpstreamName::Context7,
        tool: "get-library-docs",
        cacheable: true,
        description: "Fetch documentation for a resolved library id",
    },
    // browser_testing (playwright)
    OperationMapping {
        category: Category::BrowserTesting,
        op: "navigate",
        upstream: UpstreamName::Playwright,
        tool: "browser_navigate",
        cacheable: false,
        description: "Navigate the browser to a URL",
    },
    OperationMapping {
        category: Category::BrowserTesting,
        op: "click",
        upstream: UpstreamName::Playwright,
        tool: "browser_click",
        cacheable: false,
        description: "Click an element",
    },
    OperationMapping {
        category: Category::BrowserTesting,
        op: "snapshot",
        upstream: UpstreamName::Playwright,
        tool: "browser_snapshot",
        cacheable: false,
        description: "Capture an accessibility snapshot of the page",
    },
    OperationMapping {
        category: Category::BrowserTesting,
        op: "screenshot",
        upstream: UpstreamName::Playwright,
        tool: "browser_take_screenshot",
        cacheable: false,
        description: "Take a screenshot of the page",
    },
    // web_research (tavily)
    OperationMapping {
        category: Category::WebResearch,
        op: "search",
        upstream: UpstreamName::Tavily,
        tool: "tavily-search",
        cacheable: true,
        description: "Run a web search",
    },
    OperationMapping {
        category: Category::WebResearch,
        op: "extract",
        upstream: UpstreamName::Tavily,
        tool: "tavily-extract",
        cacheable: true,
        description: "Extract content from a URL",
    },
    // ui_components (magicui)
    OperationMapping {
        category: Category::UiComponents,
        op: "listComponents",
        upstream: UpstreamName::MagicUi,
        tool: "list_components",
        cacheable: true,
        description: "List available UI component templates",
    },
    OperationMapping {
        category: Category::UiComponents,
        op: "getComponent",
        upstream: UpstreamName::MagicUi,
        tool: "get_component",
        cacheable: true,
        description: "Fetch the source for a UI component template",
    },
];

fn index() -> &'static HashMap<(Category, &'static str), OperationMapping> {
    static INDEX: OnceLock<HashMap<(Category, &'static str), OperationMapping>> = OnceLock::new();
    INDEX.get_or_init(|| {
        ENTRIES
            .iter()
            .map(|entry| ((entry.category, entry.op), *entry))
            .collect()
    })
}

/// `resolve(category, op) -> mapping | none` (spec.md 4.3).
pub fn resolve(category: Category, op: &str) -> Option<OperationMapping> {
    index().get(&(category, op)).copied()
}

/// `listOperations(category) -> [op...]`, used for meta-tool enum schemas.
pub fn list_operations(category: Category) -> Vec<&'static str> {
    let mut ops: Vec<&'static str> = ENTRIES
        .iter()
        .filter(|entry| entry.category == category)
        .map(|entry| entry.op)
        .collect();
    ops.sort_unstable();
    ops
}

/// `cacheableFor(upstream) -> [op...]`, used for cache invalidation.
pub fn cacheable_for(upstream: UpstreamName) -> Vec<&'static str> {
    ENTRIES
        .iter()
        .filter(|entry| entry.upstream == upstream && entry.cacheable)
        .map(|entry| entry.op)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_known_operation() {
        let mapping = resolve(Category::CodeOperations, "findSymbol").expect("mapping");
        assert_eq!(mapping.upstream, UpstreamName::Serena);
        assert_eq!(mapping.tool, "find_symbol");
        assert!(mapping.cacheable);
    }

    #[test]
    fn resolve_unknown_operation_is_none() {
        assert!(resolve(Category::CodeOperations, "doesNotExist").is_none());
    }

    #[test]
    fn ambiguous_entries_route_to_the_same_tool_as_written() {
        for op in ["renameFile", "moveFile", "editFile"] {
            let mapping = resolve(Category::CodeOperations, op).expect("mapping");
            assert_eq!(mapping.tool, "replace_lines");
        }
    }

    #[test]
    fn list_operations_is_sorted_and_scoped_to_category() {
        let ops = list_operations(Category::WebResearch);
        assert_eq!(ops, vec!["extract", "search"]);
    }

    #[test]
    fn cacheable_for_excludes_non_cacheable_mappings() {
        let ops = cacheable_for(UpstreamName::Serena);
        assert!(ops.contains(&"findSymbol"));
        assert!(!ops.contains(&"renameFile"));
    }
}
