// mitm_injector::csp
//
// Content-Security-Policy rewriter.
//
// Two modes.  Strip mode deletes every enforcing and report-only policy
// (headers and `<meta http-equiv>` tags).  Nonce mode threads a per-response
// nonce into the `script-src` directive of every CSP header value and every
// CSP meta tag, so the injected script survives the page's own policy.

use http::header::{CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY_REPORT_ONLY};
use http::{HeaderMap, HeaderValue};

use crate::dom::{self, Document};
use crate::error::{Error, Result};
use crate::nonce::Nonce;

const META_EQUIV: &str = "content-security-policy";
const SCRIPT_SRC: &str = "script-src";

/// What a CSP pass touched.  Anomalies are recovered locally and returned
/// so the caller can log them.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CspReport {
    pub headers_rewritten: usize,
    pub metas_rewritten: usize,
    pub headers_removed: usize,
    pub metas_removed: usize,
    pub anomalies: Vec<Error>,
}

/// A rewritten policy value plus the malformed directives kept verbatim.
#[derive(Debug, PartialEq, Eq)]
pub struct Rewritten {
    pub value: String,
    pub anomalies: Vec<Error>,
}

/// Rewrite the CSP carried by the response headers and by the document.
pub fn rewrite_csp(
    headers: &mut HeaderMap,
    doc: &Document,
    nonce: &Nonce,
    strip_csp: bool,
) -> Result<CspReport> {
    if strip_csp {
        return Ok(strip(headers, doc));
    }

    let mut report = CspReport::default();
    // A header that cannot be rewritten is left as it was; the meta pass
    // still runs.
    match thread_nonce_into_headers(headers, nonce, &mut report.anomalies) {
        Ok(count) => report.headers_rewritten = count,
        Err(err) => report.anomalies.push(err),
    }

    for meta in doc.find_all(|el| dom::is_meta_http_equiv(el, META_EQUIV)) {
        let content = dom::attr(&meta, "content");
        let rewritten = thread_nonce(content.as_deref(), nonce);
        report.anomalies.extend(rewritten.anomalies);
        dom::set_attr(&meta, "content", rewritten.value);
        report.metas_rewritten += 1;
    }

    Ok(report)
}

/// Insert a freshly synthesized `Content-Security-Policy` header when the
/// response carries none.  Returns whether a header was added.
pub fn synthesize_header(headers: &mut HeaderMap, nonce: &Nonce) -> Result<bool> {
    if headers.contains_key(CONTENT_SECURITY_POLICY) {
        return Ok(false);
    }
    let value = HeaderValue::from_str(&default_policy(nonce))
        .map_err(|e| Error::CspParseAnomaly(format!("synthesized policy rejected: {}", e)))?;
    headers.insert(CONTENT_SECURITY_POLICY, value);
    Ok(true)
}

/// Remove every CSP header and CSP meta tag.
fn strip(headers: &mut HeaderMap, doc: &Document) -> CspReport {
    let mut report = CspReport::default();

    for name in [CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY_REPORT_ONLY] {
        if let http::header::Entry::Occupied(entry) = headers.entry(name) {
            let (_, values) = entry.remove_entry_mult();
            report.headers_removed += values.count();
        }
    }

    for meta in doc.find_all(|el| dom::is_meta_http_equiv(el, META_EQUIV)) {
        meta.as_node().detach();
        report.metas_removed += 1;
    }

    report
}

/// Rewrite all `Content-Security-Policy` values in place.  The map is only
/// touched once every value has been rewritten successfully.
fn thread_nonce_into_headers(
    headers: &mut HeaderMap,
    nonce: &Nonce,
    anomalies: &mut Vec<Error>,
) -> Result<usize> {
    let mut replacements = Vec::new();
    for value in headers.get_all(CONTENT_SECURITY_POLICY) {
        let original = String::from_utf8_lossy(value.as_bytes());
        let rewritten = thread_nonce(Some(original.as_ref()), nonce);
        let header = HeaderValue::from_str(&rewritten.value)
            .map_err(|e| Error::CspParseAnomaly(format!("rewritten header rejected: {}", e)))?;
        anomalies.extend(rewritten.anomalies);
        replacements.push(header);
    }

    if replacements.is_empty() {
        return Ok(0);
    }

    let count = replacements.len();
    headers.remove(CONTENT_SECURITY_POLICY);
    for value in replacements {
        headers.append(CONTENT_SECURITY_POLICY, value);
    }
    Ok(count)
}

/// The policy used when there is nothing to extend.
pub fn default_policy(nonce: &Nonce) -> String {
    format!(
        "{} 'self' {}; object-src 'none'; base-uri 'self'",
        SCRIPT_SRC,
        nonce.source_expression()
    )
}

/// Add a nonce grant to a policy value.
///
/// * empty/absent policy: synthesize [`default_policy`]
/// * first `script-src` already holds a nonce: left alone
/// * first `script-src` without a nonce: nonce appended
/// * no `script-src`: `script-src 'self' 'nonce-…'` prepended
///
/// `'unsafe-inline'` gets no special treatment; the nonce is still added.
pub fn thread_nonce(csp: Option<&str>, nonce: &Nonce) -> Rewritten {
    let csp = csp.map(str::trim).unwrap_or("");
    if csp.is_empty() {
        return Rewritten {
            value: default_policy(nonce),
            anomalies: Vec::new(),
        };
    }

    let mut directives: Vec<String> = Vec::new();
    let mut anomalies = Vec::new();
    let mut script_src_seen = false;

    for directive in csp.split(';') {
        let directive = directive.trim();
        if directive.is_empty() {
            continue;
        }

        let name = directive.split_whitespace().next().unwrap_or("");
        if !is_directive_name(name) {
            anomalies.push(Error::CspParseAnomaly(directive.to_string()));
            directives.push(directive.to_string());
            continue;
        }

        if !script_src_seen && name.eq_ignore_ascii_case(SCRIPT_SRC) {
            script_src_seen = true;
            if directive.split_whitespace().skip(1).any(is_nonce_source) {
                directives.push(directive.to_string());
            } else {
                directives.push(format!("{} {}", directive, nonce.source_expression()));
            }
            continue;
        }

        directives.push(directive.to_string());
    }

    if !script_src_seen {
        directives.insert(0, format!("{} 'self' {}", SCRIPT_SRC, nonce.source_expression()));
    }

    Rewritten {
        value: directives.join("; "),
        anomalies,
    }
}

/// Convenience wrapper returning only the rewritten value.
pub fn add_nonce_to_csp(csp: Option<&str>, nonce: &Nonce) -> String {
    thread_nonce(csp, nonce).value
}

fn is_directive_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn is_nonce_source(token: &str) -> bool {
    token
        .trim_matches('\'')
        .get(..6)
        .map(|prefix| prefix.eq_ignore_ascii_case("nonce-"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderName;

    fn nonce() -> Nonce {
        Nonce::from_value("abc")
    }

    #[test]
    fn prepends_script_src() {
        assert_eq!(
            add_nonce_to_csp(Some("default-src 'self'"), &nonce()),
            "script-src 'self' 'nonce-abc'; default-src 'self'"
        );
    }

    #[test]
    fn empty_policy_is_synthesized() {
        let expected = "script-src 'self' 'nonce-abc'; object-src 'none'; base-uri 'self'";
        assert_eq!(add_nonce_to_csp(None, &nonce()), expected);
        assert_eq!(add_nonce_to_csp(Some(""), &nonce()), expected);
        assert_eq!(add_nonce_to_csp(Some("   "), &nonce()), expected);
    }

    #[test]
    fn appends_to_existing_script_src() {
        assert_eq!(
            add_nonce_to_csp(Some("default-src 'none';  script-src 'self' https://cdn.test ;"), &nonce()),
            "default-src 'none'; script-src 'self' https://cdn.test 'nonce-abc'"
        );
    }

    #[test]
    fn existing_nonce_is_kept() {
        let policy = "script-src 'self' 'nonce-original'; img-src *";
        let once = add_nonce_to_csp(Some(policy), &Nonce::from_value("first"));
        let twice = add_nonce_to_csp(Some(once.as_str()), &Nonce::from_value("second"));
        assert_eq!(once, policy);
        assert_eq!(twice, policy);
    }

    #[test]
    fn only_first_script_src_is_touched() {
        assert_eq!(
            add_nonce_to_csp(Some("script-src 'self'; script-src 'none'"), &nonce()),
            "script-src 'self' 'nonce-abc'; script-src 'none'"
        );
    }

    #[test]
    fn script_src_elem_is_not_script_src() {
        assert_eq!(
            add_nonce_to_csp(Some("script-src-elem 'self'"), &nonce()),
            "script-src 'self' 'nonce-abc'; script-src-elem 'self'"
        );
    }

    #[test]
    fn unsafe_inline_still_gets_nonce() {
        assert_eq!(
            add_nonce_to_csp(Some("script-src 'unsafe-inline'"), &nonce()),
            "script-src 'unsafe-inline' 'nonce-abc'"
        );
    }

    #[test]
    fn malformed_directive_kept_verbatim() {
        let rewritten = thread_nonce(Some("default-src 'self'; <bogus> stuff"), &nonce());
        assert_eq!(
            rewritten.value,
            "script-src 'self' 'nonce-abc'; default-src 'self'; <bogus> stuff"
        );
        assert_eq!(
            rewritten.anomalies,
            vec![Error::CspParseAnomaly("<bogus> stuff".to_string())]
        );
    }

    #[test]
    fn header_and_meta_share_nonce() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_SECURITY_POLICY, HeaderValue::from_static("default-src 'self'"));
        let doc = Document::parse(
            r#"<html><head><meta http-equiv="Content-Security-Policy" content="img-src *"></head><body></body></html>"#,
        );

        let report = rewrite_csp(&mut headers, &doc, &nonce(), false).unwrap();
        assert_eq!(report.headers_rewritten, 1);
        assert_eq!(report.metas_rewritten, 1);

        assert_eq!(
            headers.get(CONTENT_SECURITY_POLICY).unwrap(),
            "script-src 'self' 'nonce-abc'; default-src 'self'"
        );
        let out = doc.serialize().unwrap();
        assert!(out.contains("script-src 'self' 'nonce-abc'; img-src *"));
    }

    #[test]
    fn rejected_header_does_not_stop_meta() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_SECURITY_POLICY, HeaderValue::from_static("default-src 'self'"));
        let doc = Document::parse(
            r#"<html><head><meta http-equiv="Content-Security-Policy" content="img-src *"></head><body></body></html>"#,
        );
        // A line break cannot travel in a header value.
        let nonce = Nonce::from_value("a\nb");

        let report = rewrite_csp(&mut headers, &doc, &nonce, false).unwrap();
        assert_eq!(report.headers_rewritten, 0);
        assert_eq!(report.metas_rewritten, 1);
        assert_eq!(report.anomalies.len(), 1);
        assert!(matches!(report.anomalies[0], Error::CspParseAnomaly(_)));
        assert_eq!(headers.get(CONTENT_SECURITY_POLICY).unwrap(), "default-src 'self'");
        assert!(doc.serialize().unwrap().contains("'nonce-a\nb'; img-src *"));
    }

    #[test]
    fn only_meta_present() {
        let mut headers = HeaderMap::new();
        let doc = Document::parse(
            r#"<html><head><meta http-equiv="content-security-policy" content="script-src 'self'"></head></html>"#,
        );
        let report = rewrite_csp(&mut headers, &doc, &nonce(), false).unwrap();
        assert_eq!(report.headers_rewritten, 0);
        assert_eq!(report.metas_rewritten, 1);
        assert!(headers.is_empty());
    }

    #[test]
    fn report_only_untouched_in_nonce_mode() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_SECURITY_POLICY_REPORT_ONLY,
            HeaderValue::from_static("script-src 'none'"),
        );
        let doc = Document::parse("<html><body></body></html>");
        rewrite_csp(&mut headers, &doc, &nonce(), false).unwrap();
        assert_eq!(
            headers.get(CONTENT_SECURITY_POLICY_REPORT_ONLY).unwrap(),
            "script-src 'none'"
        );
        assert!(!headers.contains_key(CONTENT_SECURITY_POLICY));
    }

    #[test]
    fn every_header_value_rewritten() {
        let mut headers = HeaderMap::new();
        headers.append(CONTENT_SECURITY_POLICY, HeaderValue::from_static("default-src 'self'"));
        headers.append(CONTENT_SECURITY_POLICY, HeaderValue::from_static("script-src 'self'"));
        let doc = Document::parse("<html><body></body></html>");
        let report = rewrite_csp(&mut headers, &doc, &nonce(), false).unwrap();
        assert_eq!(report.headers_rewritten, 2);
        assert!(headers
            .get_all(CONTENT_SECURITY_POLICY)
            .iter()
            .all(|v| v.to_str().unwrap().contains("'nonce-abc'")));
    }

    #[test]
    fn strip_removes_everything() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_bytes(b"Content-Security-Policy").unwrap(),
            HeaderValue::from_static("default-src 'none'"),
        );
        headers.insert(
            HeaderName::from_bytes(b"CONTENT-SECURITY-POLICY-REPORT-ONLY").unwrap(),
            HeaderValue::from_static("script-src 'none'; report-uri /r"),
        );
        let doc = Document::parse(
            r#"<html><head>
                <meta http-equiv="CONTENT-SECURITY-POLICY" content="default-src 'none'">
                <meta http-equiv="Content-Security-Policy" content="script-src 'none'">
                <meta charset="utf-8">
            </head><body></body></html>"#,
        );

        let report = rewrite_csp(&mut headers, &doc, &nonce(), true).unwrap();
        assert_eq!(report.headers_removed, 2);
        assert_eq!(report.metas_removed, 2);
        assert!(headers.is_empty());

        let out = doc.serialize().unwrap().to_ascii_lowercase();
        assert!(!out.contains("content-security-policy"));
        assert!(out.contains("charset"));
        assert!(!out.contains("nonce"));
    }

    #[test]
    fn strip_without_csp_is_noop() {
        let mut headers = HeaderMap::new();
        let doc = Document::parse("<html><body></body></html>");
        let report = rewrite_csp(&mut headers, &doc, &nonce(), true).unwrap();
        assert_eq!(report, CspReport::default());
    }

    #[test]
    fn synthesize_only_when_missing() {
        let mut headers = HeaderMap::new();
        assert!(synthesize_header(&mut headers, &nonce()).unwrap());
        assert_eq!(
            headers.get(CONTENT_SECURITY_POLICY).unwrap(),
            "script-src 'self' 'nonce-abc'; object-src 'none'; base-uri 'self'"
        );
        assert!(!synthesize_header(&mut headers, &nonce()).unwrap());
    }
}
