use anyhow::Result;

use crate::engine::{ConversionResult, ConvertEngine};
use crate::links;
use crate::repair;

/// Retries granted to the repaired document after its first attempt fails.
/// Together with the original attempt and the first repaired attempt this
/// bounds one document at seven engine invocations.
pub const MAX_BLIND_RETRIES: usize = 5;

/// What the bounded-effort conversion of one document came to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOutcome {
    pub result: ConversionResult,
    /// Engine invocations spent, counting the original attempt.
    pub attempts: usize,
    /// Set when the repair pass ran, regardless of whether it helped.
    pub repaired: bool,
    /// The repaired markup, kept for diffing against the original.
    pub repaired_source: Option<String>,
}

impl ConversionOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.succeeded()
    }
}

/// Convert one source document with repair and bounded retries.
///
/// The first failure triggers a single repair pass; the repaired document is
/// then retried as-is, since residual failures are assumed transient. Link
/// rewriting is applied to successful output before it is returned. Only a
/// failure to launch the engine escapes as `Err`; an exhausted retry budget
/// is an ordinary `Failed` result for the caller to log and skip.
pub fn convert_document<E: ConvertEngine>(engine: &E, source: &str) -> Result<ConversionOutcome> {
    let diagnostics = match engine.invoke(source)? {
        ConversionResult::Converted { output } => {
            return Ok(ConversionOutcome {
                result: ConversionResult::Converted {
                    output: links::rewrite_links(&output),
                },
                attempts: 1,
                repaired: false,
                repaired_source: None,
            });
        }
        ConversionResult::Failed { diagnostics } => diagnostics,
    };

    let patched = repair::repair(source, &diagnostics);
    let mut last_diagnostics = diagnostics;
    for attempt in 0..=MAX_BLIND_RETRIES {
        match engine.invoke(&patched)? {
            ConversionResult::Converted { output } => {
                return Ok(ConversionOutcome {
                    result: ConversionResult::Converted {
                        output: links::rewrite_links(&output),
                    },
                    attempts: attempt + 2,
                    repaired: true,
                    repaired_source: Some(patched),
                });
            }
            ConversionResult::Failed { diagnostics } => last_diagnostics = diagnostics,
        }
    }

    Ok(ConversionOutcome {
        result: ConversionResult::Failed {
            diagnostics: last_diagnostics,
        },
        attempts: MAX_BLIND_RETRIES + 2,
        repaired: true,
        repaired_source: Some(patched),
    })
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use anyhow::bail;

    use super::*;

    /// Engine double fed from a queue of canned results. Records every
    /// source it was invoked with.
    struct ScriptedEngine {
        responses: RefCell<VecDeque<Result<ConversionResult>>>,
        invocations: RefCell<Vec<String>>,
    }

    impl ScriptedEngine {
        fn new(responses: Vec<Result<ConversionResult>>) -> Self {
            Self {
                responses: RefCell::new(responses.into()),
                invocations: RefCell::new(Vec::new()),
            }
        }

        fn invocation_count(&self) -> usize {
            self.invocations.borrow().len()
        }
    }

    impl ConvertEngine for ScriptedEngine {
        fn invoke(&self, source: &str) -> Result<ConversionResult> {
            self.invocations.borrow_mut().push(source.to_string());
            match self.responses.borrow_mut().pop_front() {
                Some(response) => response,
                None => bail!("scripted engine ran out of responses"),
            }
        }
    }

    fn converted(output: &str) -> Result<ConversionResult> {
        Ok(ConversionResult::Converted {
            output: output.to_string(),
        })
    }

    fn failed(diagnostics: &str) -> Result<ConversionResult> {
        Ok(ConversionResult::Failed {
            diagnostics: diagnostics.to_string(),
        })
    }

    #[test]
    fn first_attempt_success_skips_repair() {
        let engine = ScriptedEngine::new(vec![converted("# Title\nbody\n")]);
        let outcome = convert_document(&engine, "== Title ==\nbody\n").expect("convert");
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.repaired);
        assert_eq!(outcome.repaired_source, None);
        assert_eq!(engine.invocation_count(), 1);
    }

    #[test]
    fn successful_output_has_links_rewritten() {
        let engine = ScriptedEngine::new(vec![converted(
            "see [Seite](Customers:DA \"wikilink\") here\n",
        )]);
        let outcome = convert_document(&engine, "irrelevant").expect("convert");
        match outcome.result {
            ConversionResult::Converted { output } => {
                assert_eq!(output, "see [Seite](/Customers/DA \"Seite\") here\n");
            }
            ConversionResult::Failed { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn failure_is_repaired_then_retried_with_the_patched_source() {
        let engine = ScriptedEngine::new(vec![
            failed("Error at (line 1, column 1): unexpected \"=\""),
            converted("recovered\n"),
        ]);
        let source = "= bad heading line\ngood line";
        let outcome = convert_document(&engine, source).expect("convert");
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.repaired);
        assert_eq!(outcome.repaired_source.as_deref(), Some("good line"));

        let invocations = engine.invocations.borrow();
        assert_eq!(invocations[0], source);
        assert_eq!(invocations[1], "good line");
    }

    #[test]
    fn blind_retries_reuse_the_same_patched_document() {
        let engine = ScriptedEngine::new(vec![
            failed("unclassifiable noise"),
            failed("transient"),
            failed("transient"),
            converted("finally\n"),
        ]);
        let outcome = convert_document(&engine, "stable source").expect("convert");
        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 4);

        let invocations = engine.invocations.borrow();
        assert!(invocations[1..].iter().all(|input| input == &invocations[1]));
    }

    #[test]
    fn exhausted_retries_return_the_last_failure() {
        let mut responses = vec![failed("first failure")];
        for _ in 0..=MAX_BLIND_RETRIES {
            responses.push(failed("still failing"));
        }
        let engine = ScriptedEngine::new(responses);
        let outcome = convert_document(&engine, "hopeless").expect("convert");
        assert!(!outcome.succeeded());
        assert_eq!(outcome.attempts, MAX_BLIND_RETRIES + 2);
        assert_eq!(engine.invocation_count(), MAX_BLIND_RETRIES + 2);
        match outcome.result {
            ConversionResult::Failed { diagnostics } => assert_eq!(diagnostics, "still failing"),
            ConversionResult::Converted { .. } => panic!("expected failure"),
        }
    }

    #[test]
    fn launch_failure_escapes_as_an_error() {
        let engine = ScriptedEngine::new(vec![Err(anyhow::anyhow!("no such binary"))]);
        let error = convert_document(&engine, "anything").expect_err("must propagate");
        assert!(error.to_string().contains("no such binary"));
    }

    #[test]
    fn launch_failure_during_retries_escapes_too() {
        let engine = ScriptedEngine::new(vec![
            failed("unexpected \"}\""),
            Err(anyhow::anyhow!("engine vanished")),
        ]);
        let error = convert_document(&engine, "anything").expect_err("must propagate");
        assert!(error.to_string().contains("engine vanished"));
    }
}
