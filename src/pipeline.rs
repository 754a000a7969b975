// mitm_injector::pipeline
//
// Response mutation pipeline.  One invocation per intercepted response:
//
//   Received -> Filtered -> Parsed -> CspRewritten -> Injected
//            -> Serialized -> Delivered
//
// with Aborted reachable from any state.  CSP rewriting and injection are
// best-effort; decode and serialize failures are fatal for the response.
// The response is only written to once, after the new body has been fully
// encoded, so any abort (including a panic) leaves the original bytes and
// headers in place.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::body;
use crate::config::Config;
use crate::csp;
use crate::dom::Document;
use crate::error::{Error, Result};
use crate::filter;
use crate::inject::{self, Payload};
use crate::nonce::Nonce;
use crate::response::Response;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Filtered,
    Parsed,
    CspRewritten,
    Injected,
    Serialized,
    Delivered,
}

/// Expected reasons to leave a response alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    EmptyBody,
    Ineligible,
    AlreadyInjected,
}

#[derive(Debug)]
pub enum Outcome {
    /// The response was rewritten.  `recovered` lists best-effort failures
    /// that did not stop the pipeline.
    Mutated { nonce: Nonce, recovered: Vec<Error> },
    Skipped(Skip),
    /// Mutation gave up in `stage`; the response is unmodified.
    Aborted { stage: Stage, error: Error },
}

impl Outcome {
    pub fn is_mutated(&self) -> bool {
        matches!(self, Outcome::Mutated { .. })
    }
}

/// Hook the proxy engine calls once per completed response.
pub trait ResponseHook: Send + Sync {
    fn on_response(&self, response: &mut Response) -> Outcome;
}

/// A configured mutator.  Cheap to clone; the configuration is shared and
/// read-only.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: Arc<Config>,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self::with_shared(Arc::new(config))
    }

    pub fn with_shared(config: Arc<Config>) -> Self {
        Pipeline { config }
    }

    /// Run the pipeline over one response.  Never panics; never leaves a
    /// partially written response behind.
    pub fn process(&self, response: &mut Response) -> Outcome {
        let host = response.host.clone();
        let path = response.path.clone();
        let mut stage = Stage::Received;

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.run(response, &mut stage))) {
            Ok(outcome) => outcome,
            Err(payload) => Outcome::Aborted {
                stage,
                error: Error::Panic(panic_message(payload.as_ref())),
            },
        };

        log_outcome(&host, &path, &outcome);
        outcome
    }

    fn run(&self, response: &mut Response, stage: &mut Stage) -> Outcome {
        if response.body.is_empty() {
            return Outcome::Skipped(Skip::EmptyBody);
        }
        let host = response.host.to_ascii_lowercase();
        if !filter::should_mutate(&self.config, &host, response.content_type()) {
            return Outcome::Skipped(Skip::Ineligible);
        }
        *stage = Stage::Filtered;

        let decoded = match body::decode(&response.headers, &response.body) {
            Ok(decoded) => decoded,
            Err(error) => {
                return Outcome::Aborted {
                    stage: Stage::Parsed,
                    error,
                }
            }
        };
        let doc = Document::parse(&decoded.text);
        *stage = Stage::Parsed;

        if self.config.skip_injected && inject::already_injected(&doc) {
            return Outcome::Skipped(Skip::AlreadyInjected);
        }

        let nonce = Nonce::generate();
        let mut headers = response.headers.clone();
        let mut recovered = Vec::new();

        let csp_pass = guarded(Error::CspParseAnomaly, || {
            let report = csp::rewrite_csp(&mut headers, &doc, &nonce, self.config.strip_csp)?;
            if !self.config.strip_csp && self.config.synthesize_csp {
                csp::synthesize_header(&mut headers, &nonce)?;
            }
            Ok(report)
        });
        match csp_pass {
            Ok(report) => recovered.extend(report.anomalies),
            Err(error) => recovered.push(error),
        }
        *stage = Stage::CspRewritten;

        let payload = Payload::from_config(&self.config);
        match guarded(Error::InjectionFailure, || Ok(inject::inject(&doc, &payload, &nonce))) {
            Ok(report) => recovered.extend(report.anomalies),
            Err(error) => recovered.push(error),
        }
        *stage = Stage::Injected;

        let new_body = match doc
            .serialize()
            .and_then(|text| body::encode(&mut headers, &text, decoded.encoding))
        {
            Ok(bytes) => bytes,
            Err(error) => {
                return Outcome::Aborted {
                    stage: Stage::Serialized,
                    error,
                }
            }
        };
        *stage = Stage::Serialized;

        response.headers = headers;
        response.body = new_body;
        *stage = Stage::Delivered;

        Outcome::Mutated { nonce, recovered }
    }
}

impl ResponseHook for Pipeline {
    fn on_response(&self, response: &mut Response) -> Outcome {
        self.process(response)
    }
}

/// Run a best-effort step, turning a panic into the step's error kind.
fn guarded<T, F>(kind: fn(String) -> Error, step: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(result) => result,
        Err(payload) => Err(kind(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_outcome(host: &str, path: &str, outcome: &Outcome) {
    match outcome {
        Outcome::Mutated { recovered, .. } => {
            for error in recovered {
                log::warn!(host = host, path = path; "recovered: {}", error);
            }
            log::info!(host = host, path = path; "injected content");
        }
        Outcome::Skipped(reason) => {
            log::debug!(host = host, path = path; "skipped: {:?}", reason);
        }
        Outcome::Aborted { stage, error } => match error {
            Error::DecodeFailure(_) => {
                log::warn!(host = host, path = path; "left unmodified at {:?}: {}", stage, error);
            }
            _ => {
                log::error!(host = host, path = path; "left unmodified at {:?}: {}", stage, error);
            }
        },
    }
}
