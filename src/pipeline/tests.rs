//! Runner ordering and cleanup behaviour.

use std::sync::{Arc, Mutex};

use rstest::rstest;

use super::*;
use crate::cluster::ClusterError;
use crate::test_support::RecordingUi;

type Journal = Arc<Mutex<Vec<String>>>;

struct ScriptedStep {
    name: &'static str,
    action: StepAction,
    fail_cleanup: bool,
    journal: Journal,
}

impl ScriptedStep {
    fn boxed(name: &'static str, action: StepAction, journal: &Journal) -> Box<dyn Step> {
        Box::new(Self {
            name,
            action,
            fail_cleanup: false,
            journal: Arc::clone(journal),
        })
    }

    fn log(&self, entry: String) {
        self.journal.lock().expect("journal lock").push(entry);
    }
}

impl Step for ScriptedStep {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            self.log(format!("run {}", self.name));
            if self.action == StepAction::Halt {
                ctx.record_error(BuildError::cluster(
                    format!("run {}", self.name),
                    ClusterError::Transport {
                        message: String::from("boom"),
                    },
                ));
            }
            self.action
        })
    }

    fn cleanup<'a>(
        &'a mut self,
        _ctx: &'a mut BuildContext,
    ) -> StepFuture<'a, Result<(), BuildError>> {
        Box::pin(async move {
            self.log(format!("cleanup {}", self.name));
            if self.fail_cleanup {
                return Err(BuildError::Halted {
                    step: String::from("cleanup"),
                });
            }
            Ok(())
        })
    }
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().expect("journal lock").clone()
}

#[rstest]
#[tokio::test]
async fn successful_run_cleans_up_every_step_in_reverse() {
    let journal = Journal::default();
    let ui = Arc::new(RecordingUi::default());
    let mut ctx = BuildContext::new(ui);
    let mut runner = Runner::new(vec![
        ScriptedStep::boxed("a", StepAction::Continue, &journal),
        ScriptedStep::boxed("b", StepAction::Continue, &journal),
        ScriptedStep::boxed("c", StepAction::Continue, &journal),
    ]);

    let report = runner.run(&mut ctx).await;

    assert!(!report.halted);
    assert_eq!(report.executed, ["a", "b", "c"]);
    assert_eq!(
        entries(&journal),
        ["run a", "run b", "run c", "cleanup c", "cleanup b", "cleanup a"]
    );
    assert!(ctx.error().is_none());
}

#[rstest]
#[case::first(0)]
#[case::second(1)]
#[case::third(2)]
#[case::last(3)]
#[tokio::test]
async fn halt_cleans_up_only_the_executed_prefix(#[case] halting: usize) {
    let journal = Journal::default();
    let names = ["a", "b", "c", "d"];
    let steps = names
        .iter()
        .copied()
        .enumerate()
        .map(|(index, name)| {
            let action = if index == halting {
                StepAction::Halt
            } else {
                StepAction::Continue
            };
            ScriptedStep::boxed(name, action, &journal)
        })
        .collect();
    let mut ctx = BuildContext::new(Arc::new(RecordingUi::default()));

    let report = Runner::new(steps).run(&mut ctx).await;

    let ran: Vec<&str> = names.iter().take(halting + 1).copied().collect();
    assert!(report.halted);
    assert_eq!(report.executed, ran);

    let mut expected: Vec<String> = ran.iter().map(|name| format!("run {name}")).collect();
    expected.extend(ran.iter().rev().map(|name| format!("cleanup {name}")));
    assert_eq!(entries(&journal), expected);
    assert!(ctx.error().is_some());
}

#[rstest]
#[tokio::test]
async fn cleanup_failures_are_reported_but_not_recorded() {
    let journal = Journal::default();
    let ui = Arc::new(RecordingUi::default());
    let mut ctx = BuildContext::new(ui.clone());
    let failing: Box<dyn Step> = Box::new(ScriptedStep {
        name: "a",
        action: StepAction::Continue,
        fail_cleanup: true,
        journal: Arc::clone(&journal),
    });
    let mut runner = Runner::new(vec![
        failing,
        ScriptedStep::boxed("b", StepAction::Halt, &journal),
    ]);

    let report = runner.run(&mut ctx).await;

    assert!(report.halted);
    assert_eq!(entries(&journal), ["run a", "run b", "cleanup b", "cleanup a"]);
    assert!(matches!(ctx.error(), Some(BuildError::Cluster { operation, .. }) if operation == "run b"));
    assert!(
        ui.errors().iter().any(|line| line.contains("cleanup of a failed")),
        "{:?}",
        ui.errors()
    );
}

#[rstest]
#[tokio::test]
async fn halt_without_recorded_error_names_the_step() {
    struct SilentHalt;

    impl Step for SilentHalt {
        fn name(&self) -> &'static str {
            "silent"
        }

        fn run<'a>(&'a mut self, _ctx: &'a mut BuildContext) -> StepFuture<'a, StepAction> {
            Box::pin(async { StepAction::Halt })
        }

        fn cleanup<'a>(
            &'a mut self,
            _ctx: &'a mut BuildContext,
        ) -> StepFuture<'a, Result<(), BuildError>> {
            Box::pin(async { Ok(()) })
        }
    }

    let mut ctx = BuildContext::new(Arc::new(RecordingUi::default()));
    let steps: Vec<Box<dyn Step>> = vec![Box::new(SilentHalt)];
    Runner::new(steps).run(&mut ctx).await;
    assert!(matches!(ctx.error(), Some(BuildError::Halted { step }) if step == "silent"));
}
