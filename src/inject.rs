// mitm_injector::inject
//
// Content injector.  Appends the configured markup at the insertion point
// and a nonce-bearing <script> at the end of <body>.  Always appends after
// existing children; never inserts before them.

use kuchikiki::NodeRef;

use crate::config::Config;
use crate::dom::{self, Document};
use crate::error::Error;
use crate::nonce::Nonce;

/// Attribute placed on the injected script when marking is enabled.
pub const MARKER_ATTR: &str = "data-injected";
pub const MARKER_VALUE: &str = "mitm-injector";

/// What gets injected into each eligible document.
#[derive(Debug, Clone, Copy)]
pub struct Payload<'a> {
    pub html: &'a str,
    pub script: &'a str,
    pub selector: &'a str,
    pub mark: bool,
}

impl<'a> Payload<'a> {
    pub fn from_config(config: &'a Config) -> Self {
        Payload {
            html: &config.inject_html,
            script: &config.inject_script,
            selector: &config.insertion_selector,
            mark: config.mark_injected,
        }
    }
}

/// Where the markup ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Selector,
    Body,
    Root,
}

#[derive(Debug, Default)]
pub struct InjectReport {
    pub anchor: Option<Anchor>,
    pub nodes_inserted: usize,
    pub script_inserted: bool,
    pub anomalies: Vec<Error>,
}

/// Whether a previous pass already injected into this document.
pub fn already_injected(doc: &Document) -> bool {
    doc.find_first(|el| dom::has_attr(el, MARKER_ATTR, MARKER_VALUE))
        .is_some()
}

/// Inject markup and script.  Each half is skipped when blank.  A selector
/// that misses, or does not compile, falls back to body and then root.
pub fn inject(doc: &Document, payload: &Payload<'_>, nonce: &Nonce) -> InjectReport {
    let mut report = InjectReport::default();

    if !payload.html.trim().is_empty() {
        let (anchor, node) = resolve_anchor(doc, payload.selector, &mut report.anomalies);
        for child in dom::parse_fragment_nodes(payload.html) {
            node.append(child);
            report.nodes_inserted += 1;
        }
        report.anchor = Some(anchor);
    }

    if !payload.script.trim().is_empty() {
        let mut attrs = vec![("nonce", nonce.as_str())];
        if payload.mark {
            attrs.push((MARKER_ATTR, MARKER_VALUE));
        }
        match dom::new_element("script", &attrs) {
            Some(script) => {
                script.append(NodeRef::new_text(payload.script));
                doc.body_or_root().append(script);
                report.script_inserted = true;
            }
            None => report
                .anomalies
                .push(Error::InjectionFailure("could not build script element".into())),
        }
    }

    report
}

fn resolve_anchor(doc: &Document, selector: &str, anomalies: &mut Vec<Error>) -> (Anchor, NodeRef) {
    match doc.query_selector(selector) {
        Ok(Some(el)) => return (Anchor::Selector, el.as_node().clone()),
        Ok(None) => {}
        Err(err) => anomalies.push(err),
    }
    match doc.body() {
        Some(body) => (Anchor::Body, body.as_node().clone()),
        None => (Anchor::Root, doc.root()),
    }
}
