//! Plain-text body recovery from MIME trees.
//!
//! The search runs twice: first preferring `text/plain`, then `text/html` with the
//! markup stripped. Traversal uses an explicit stack so hostile nesting cannot
//! overflow the call stack.

use std::sync::LazyLock;

use regex::Regex;

/// One node of a MIME tree with its body already transfer-decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub content_type: Option<String>,
    pub body_data: Option<Vec<u8>>,
    pub children: Vec<RawMessage>,
}

impl RawMessage {
    /// Leaf node helper.
    pub fn leaf(content_type: Option<&str>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.map(str::to_string),
            body_data: Some(data.into()),
            children: Vec::new(),
        }
    }

    /// Container node helper.
    pub fn container(content_type: &str, children: Vec<RawMessage>) -> Self {
        Self {
            content_type: Some(content_type.to_string()),
            body_data: None,
            children,
        }
    }

    fn data(&self) -> Option<&[u8]> {
        self.body_data.as_deref().filter(|data| !data.is_empty())
    }

    fn is_type(&self, mime: &str) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.eq_ignore_ascii_case(mime))
    }

    fn is_multipart(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("multipart/"))
    }
}

static STYLE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style\s*>").expect("valid regex"));
static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script\s*>").expect("valid regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static NBSP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)&nbsp;|&#160;").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Recovers the best available plain-text body from a [`RawMessage`] tree.
#[derive(Debug, Clone, Copy)]
pub struct MessageBodyExtractor {
    max_depth: usize,
    max_nodes: usize,
}

impl Default for MessageBodyExtractor {
    fn default() -> Self {
        Self {
            max_depth: 32,
            max_nodes: 1024,
        }
    }
}

impl MessageBodyExtractor {
    pub fn with_limits(max_depth: usize, max_nodes: usize) -> Self {
        Self {
            max_depth,
            max_nodes,
        }
    }

    /// Returns the body text, or an empty string when the tree has no textual leaf.
    pub fn extract(&self, root: &RawMessage) -> String {
        if let Some(plain) = self.find_text(root, "text/plain") {
            return plain;
        }

        match self.find_text(root, "text/html") {
            Some(html) => strip_html(&html),
            None => String::new(),
        }
    }

    /// Pre-order search for the first node yielding non-empty text of `preferred` type.
    fn find_text(&self, root: &RawMessage, preferred: &str) -> Option<String> {
        let mut stack: Vec<(&RawMessage, usize)> = vec![(root, 0)];
        let mut visited = 0usize;

        while let Some((node, depth)) = stack.pop() {
            visited += 1;
            if visited > self.max_nodes {
                tracing::warn!(
                    max_nodes = self.max_nodes,
                    "MIME tree exceeds node budget, giving up"
                );
                return None;
            }

            if let Some(data) = node.data() {
                if node.is_type(preferred) || (node.content_type.is_none() && node.children.is_empty())
                {
                    match decode_text(data) {
                        Some(text) => return Some(text),
                        None => continue,
                    }
                }
            }

            if node.children.is_empty() {
                continue;
            }

            // The first child of the preferred type settles this subtree.
            if let Some(child) = node.children.iter().find(|c| c.is_type(preferred))
                && let Some(data) = child.data()
            {
                match decode_text(data) {
                    Some(text) => return Some(text),
                    None => continue,
                }
            }

            if depth + 1 > self.max_depth {
                continue;
            }

            for child in node
                .children
                .iter()
                .rev()
                .filter(|c| c.is_multipart() || !c.children.is_empty())
            {
                stack.push((child, depth + 1));
            }
        }

        None
    }
}

fn decode_text(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data).into_owned();
    (!text.is_empty()).then_some(text)
}

/// Reduce an HTML document to whitespace-normalised text. The output never contains `<`.
pub fn strip_html(html: &str) -> String {
    let text = STYLE_BLOCK.replace_all(html, "");
    let text = SCRIPT_BLOCK.replace_all(&text, "");
    let text = TAG.replace_all(&text, " ");
    let text = NBSP.replace_all(&text, " ");
    let text = text.replace('<', " ");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}
