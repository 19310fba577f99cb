//! Observed versus expected outcomes.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::form::FormEvent;

/// What the parser reported during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedOutcome {
    /// Number of `File` events.
    pub files_parsed: usize,
    /// Number of `Field` events.
    pub fields_parsed: usize,
    /// Whether `Aborted` was reported.
    pub got_aborted: bool,
    /// Whether `End` was reported.
    pub ended: bool,
    /// Total `Aborted` and `End` events; more than one is a parser bug.
    pub terminal_events: usize,
    /// Logged parser errors, in order.
    pub errors: Vec<String>,
}

impl ObservedOutcome {
    /// Fold one event into the outcome.
    pub fn record(&mut self, event: &FormEvent) {
        match event {
            FormEvent::File(_) => self.files_parsed += 1,
            FormEvent::Field { .. } => self.fields_parsed += 1,
            FormEvent::Aborted => {
                self.got_aborted = true;
                self.terminal_events += 1;
            }
            FormEvent::End => {
                self.ended = true;
                self.terminal_events += 1;
            }
            FormEvent::Error(err) => self.errors.push(err.to_string()),
        }
    }
}

/// The scenario oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedOutcome {
    /// Exact number of fully parsed files.
    pub files_parsed: usize,
    /// Whether the request must be reported as aborted.
    pub aborted: bool,
}

/// An observed outcome did not match the oracle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssertionFailure {
    /// Wrong number of files.
    #[error("expected {expected} parsed files, observed {observed}")]
    FilesParsed {
        /// Oracle value.
        expected: usize,
        /// Observed value.
        observed: usize,
    },

    /// Abort flag mismatch.
    #[error("expected aborted = {expected}, observed {observed}")]
    Aborted {
        /// Oracle value.
        expected: bool,
        /// Observed value.
        observed: bool,
    },

    /// `Aborted` and `End` were both reported, or one of them twice.
    #[error("{0} terminal events reported for one request")]
    ConflictingTerminal(usize),
}

impl ExpectedOutcome {
    /// Check `observed` against the oracle.
    ///
    /// # Errors
    ///
    /// The first mismatch found.
    pub fn check(&self, observed: &ObservedOutcome) -> Result<(), AssertionFailure> {
        if observed.terminal_events > 1 {
            return Err(AssertionFailure::ConflictingTerminal(observed.terminal_events));
        }
        if observed.files_parsed != self.files_parsed {
            return Err(AssertionFailure::FilesParsed {
                expected: self.files_parsed,
                observed: observed.files_parsed,
            });
        }
        if observed.got_aborted != self.aborted {
            return Err(AssertionFailure::Aborted {
                expected: self.aborted,
                observed: observed.got_aborted,
            });
        }
        Ok(())
    }
}

/// Receives parser events on the harness side and accumulates them.
#[derive(Debug)]
pub struct EventHarness {
    events: mpsc::UnboundedReceiver<FormEvent>,
    observed: ObservedOutcome,
}

impl EventHarness {
    /// Wrap the receiving end of a form event channel.
    #[must_use]
    pub fn new(events: mpsc::UnboundedReceiver<FormEvent>) -> Self {
        Self {
            events,
            observed: ObservedOutcome::default(),
        }
    }

    /// Outcome accumulated so far.
    #[must_use]
    pub fn observed(&self) -> &ObservedOutcome {
        &self.observed
    }

    /// Record events until a terminal one arrives, the senders are gone, or
    /// `grace` passes without any event.
    ///
    /// Events already queued behind the terminal event are recorded too.
    pub async fn settle(&mut self, grace: Duration) -> ObservedOutcome {
        loop {
            match tokio::time::timeout(grace, self.events.recv()).await {
                Ok(Some(event)) => {
                    let terminal = event.is_terminal();
                    self.observed.record(&event);
                    if terminal {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(?grace, "no terminal form event before the grace period");
                    break;
                }
            }
        }

        while let Ok(event) = self.events.try_recv() {
            self.observed.record(&event);
        }

        self.observed.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use rstest::rstest;
    use tokio::sync::mpsc;

    use super::{AssertionFailure, EventHarness, ExpectedOutcome, ObservedOutcome};
    use crate::form::{FormError, FormEvent, UploadedFile};

    fn upload() -> UploadedFile {
        UploadedFile {
            field: "my_file1001".into(),
            original_name: "my_file1001".into(),
            content_type: Some("text/plain".into()),
            path: "upload_0".into(),
            size: 1,
            hash: None,
        }
    }

    fn outcome(files: usize, aborted: bool) -> ObservedOutcome {
        ObservedOutcome {
            files_parsed: files,
            got_aborted: aborted,
            terminal_events: 1,
            ..ObservedOutcome::default()
        }
    }

    #[rstest]
    #[case(outcome(143, true), Ok(()))]
    #[case(
        outcome(142, true),
        Err(AssertionFailure::FilesParsed { expected: 143, observed: 142 })
    )]
    #[case(
        outcome(143, false),
        Err(AssertionFailure::Aborted { expected: true, observed: false })
    )]
    #[case(
        ObservedOutcome { terminal_events: 2, ..outcome(143, true) },
        Err(AssertionFailure::ConflictingTerminal(2))
    )]
    fn checks_against_oracle(
        #[case] observed: ObservedOutcome,
        #[case] expected: Result<(), AssertionFailure>,
    ) {
        let oracle = ExpectedOutcome {
            files_parsed: 143,
            aborted: true,
        };
        assert_eq!(oracle.check(&observed), expected);
    }

    #[tokio::test]
    async fn settles_on_terminal_event() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut harness = EventHarness::new(rx);

        tx.send(FormEvent::File(upload())).unwrap();
        tx.send(FormEvent::Error(FormError::Persist {
            path: "upload_x".into(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        }))
        .unwrap();
        tx.send(FormEvent::Aborted).unwrap();

        let outcome = harness.settle(Duration::from_secs(5)).await;
        assert_eq!(outcome.files_parsed, 1);
        assert!(outcome.got_aborted);
        assert!(!outcome.ended);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(harness.observed(), &outcome);
    }

    #[tokio::test]
    async fn settles_after_grace_period() {
        let (tx, rx) = mpsc::unbounded_channel::<FormEvent>();
        let mut harness = EventHarness::new(rx);

        let outcome = harness.settle(Duration::from_millis(20)).await;
        assert_eq!(outcome, ObservedOutcome::default());
        drop(tx);
    }
}
