// mitm_injector::dom
//
// Thin typed layer over the kuchikiki tree.  Everything the CSP rewriter
// and the injector need from the document goes through here: parse,
// serialize, selector lookup, predicate search, body/root resolution and
// fragment parsing.

use kuchikiki::traits::*;
use kuchikiki::{parse_fragment, parse_html, ElementData, NodeDataRef, NodeRef, Selectors};

use crate::error::{Error, Result};

/// An element handle inside a [`Document`].
pub type Element = NodeDataRef<ElementData>;

/// A parsed HTML document, owned by one pipeline invocation.
pub struct Document {
    root: NodeRef,
}

impl Document {
    pub fn parse(html: &str) -> Self {
        Document {
            root: parse_html().one(html),
        }
    }

    pub fn serialize(&self) -> Result<String> {
        let mut buf = Vec::new();
        self.root
            .serialize(&mut buf)
            .map_err(|e| Error::SerializeFailure(e.to_string()))?;

        String::from_utf8(buf).map_err(|e| Error::SerializeFailure(e.to_string()))
    }

    /// First element matching a CSS selector.  `Ok(None)` on a miss, an
    /// error only when the selector itself does not compile.
    pub fn query_selector(&self, selector: &str) -> Result<Option<Element>> {
        let selectors = Selectors::compile(selector)
            .map_err(|()| Error::InjectionFailure(format!("invalid selector `{}`", selector)))?;
        Ok(selectors
            .filter(self.root.inclusive_descendants().elements())
            .next())
    }

    pub fn find_first<P>(&self, predicate: P) -> Option<Element>
    where
        P: Fn(&ElementData) -> bool,
    {
        self.root
            .inclusive_descendants()
            .elements()
            .find(|el| predicate(&**el))
    }

    /// All matching elements, collected up front so callers may detach
    /// them while iterating.
    pub fn find_all<P>(&self, predicate: P) -> Vec<Element>
    where
        P: Fn(&ElementData) -> bool,
    {
        self.root
            .inclusive_descendants()
            .elements()
            .filter(|el| predicate(&**el))
            .collect()
    }

    pub fn body(&self) -> Option<Element> {
        self.find_first(|el| is_tag(el, "body"))
    }

    /// The `<html>` element, or the document node when there is none.
    pub fn root(&self) -> NodeRef {
        match self.find_first(|el| is_tag(el, "html")) {
            Some(html) => html.as_node().clone(),
            None => self.root.clone(),
        }
    }

    /// Body if present, otherwise the root.
    pub fn body_or_root(&self) -> NodeRef {
        match self.body() {
            Some(body) => body.as_node().clone(),
            None => self.root(),
        }
    }
}

pub fn is_tag(el: &ElementData, tag: &str) -> bool {
    (&*el.name.local).eq_ignore_ascii_case(tag)
}

pub fn attr(el: &ElementData, name: &str) -> Option<String> {
    el.attributes.borrow().get(name).map(str::to_string)
}

pub fn set_attr(el: &ElementData, name: &str, value: impl Into<String>) {
    el.attributes.borrow_mut().insert(name, value.into());
}

/// `<meta http-equiv="...">` with the given value, compared
/// case-insensitively.
pub fn is_meta_http_equiv(el: &ElementData, equiv: &str) -> bool {
    is_tag(el, "meta")
        && el
            .attributes
            .borrow()
            .get("http-equiv")
            .map(|v| v.trim().eq_ignore_ascii_case(equiv))
            .unwrap_or(false)
}

pub fn has_attr(el: &ElementData, name: &str, value: &str) -> bool {
    el.attributes
        .borrow()
        .get(name)
        .map(|v| v == value)
        .unwrap_or(false)
}

/// Create a detached HTML element with the given attributes.
///
/// The element is cut out of a throwaway parse so its qualified name comes
/// from the same parser that built the page.
pub fn new_element(tag: &str, attrs: &[(&str, &str)]) -> Option<NodeRef> {
    let scratch = parse_html().one(format!("<{0}></{0}>", tag));
    let el = scratch
        .descendants()
        .elements()
        .find(|el| is_tag(el, tag))?;
    let node = el.as_node().clone();
    node.detach();
    for (name, value) in attrs {
        set_attr(&el, name, *value);
    }
    Some(node)
}

/// Parse a markup fragment in a `<body>` context and return its top-level
/// nodes, detached from any document.
pub fn parse_fragment_nodes(html: &str) -> Vec<NodeRef> {
    let scratch = parse_html().one("");
    let context = match scratch.descendants().elements().find(|el| is_tag(el, "body")) {
        Some(body) => body.name.clone(),
        None => return Vec::new(),
    };
    let doc = parse_fragment(context, Vec::new()).one(html);

    // The fragment parser wraps its output in an <html> element.
    let wrapper = doc
        .children()
        .elements()
        .find(|el| is_tag(el, "html"))
        .map(|el| el.as_node().clone());
    let container = match wrapper {
        Some(html) => html,
        None => doc,
    };

    let nodes: Vec<NodeRef> = container.children().collect();
    for node in &nodes {
        node.detach();
    }
    nodes
}
