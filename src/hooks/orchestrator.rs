//! Hook orchestration
//!
//! Runs hook tiers in strict nesting order. Session, assembly and class
//! Before tiers run once, on behalf of the first test that reaches them;
//! their outcome is cached so every later test of the same scope observes
//! the same failure. After tiers of a scope run when its last test finishes
//! and discovery can no longer add tests to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{HookDescriptor, HookDirection, HookScope, HookTable};
use crate::context::{HookContext, TestContext};
use crate::error::EngineError;
use crate::models::{Diagnostic, DiagnosticKind, Failure, TestUnit};

type TierCell = Arc<OnceCell<Result<(), Failure>>>;

#[derive(Default)]
struct ClassScope {
    before: TierCell,
    registered: usize,
    completed: usize,
    closed: bool,
}

#[derive(Default)]
struct AssemblyScope {
    before: TierCell,
    open_classes: usize,
    closed: bool,
}

#[derive(Default)]
struct ScopeTracker {
    classes: HashMap<(String, String), ClassScope>,
    assemblies: HashMap<String, AssemblyScope>,
    sealed: bool,
}

/// Runs hooks for one session
pub struct HookOrchestrator {
    table: HookTable,
    session: TierCell,
    tracker: Mutex<ScopeTracker>,
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl HookOrchestrator {
    pub fn new(table: HookTable) -> Self {
        Self {
            table,
            session: Arc::new(OnceCell::new()),
            tracker: Mutex::new(ScopeTracker::default()),
            diagnostics: Mutex::new(Vec::new()),
        }
    }

    fn tracker(&self) -> MutexGuard<'_, ScopeTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a test toward its class and assembly before it can complete
    pub fn register(&self, unit: &TestUnit) {
        let mut tracker = self.tracker();
        let key = (unit.assembly.clone(), unit.class_name.clone());
        let new_class = !tracker.classes.contains_key(&key);
        tracker.classes.entry(key).or_default().registered += 1;
        if new_class {
            tracker
                .assemblies
                .entry(unit.assembly.clone())
                .or_default()
                .open_classes += 1;
        }
    }

    /// Run the session, assembly and class Before tiers the test needs
    pub async fn run_before_scopes(&self, unit: &TestUnit) -> Result<(), Failure> {
        let session = self.session.clone();
        session
            .get_or_init(|| self.run_scope(HookScope::Session, HookDirection::Before, None, None))
            .await
            .clone()?;

        let (assembly_cell, class_cell) = {
            let mut tracker = self.tracker();
            let assembly = tracker
                .assemblies
                .entry(unit.assembly.clone())
                .or_default()
                .before
                .clone();
            let class = tracker
                .classes
                .entry((unit.assembly.clone(), unit.class_name.clone()))
                .or_default()
                .before
                .clone();
            (assembly, class)
        };

        assembly_cell
            .get_or_init(|| {
                self.run_scope(
                    HookScope::Assembly,
                    HookDirection::Before,
                    Some(unit.assembly.as_str()),
                    None,
                )
            })
            .await
            .clone()?;

        class_cell
            .get_or_init(|| {
                self.run_scope(
                    HookScope::Class,
                    HookDirection::Before,
                    Some(unit.assembly.as_str()),
                    Some(unit.class_name.as_str()),
                )
            })
            .await
            .clone()
    }

    /// Run the test-level Before tiers for one attempt
    pub async fn run_before_test(&self, ctx: &TestContext) -> Result<(), Failure> {
        let hook_ctx = HookContext::test(ctx);
        for every in [true, false] {
            let tier = self.table.tier(
                HookScope::Test,
                HookDirection::Before,
                every,
                Some(ctx.assembly()),
                Some(ctx.class_name()),
            );
            for hook in tier {
                self.invoke(&hook, hook_ctx.clone()).await?;
            }
        }
        Ok(())
    }

    /// Run the test-level After tiers; every hook runs, the first failure wins
    pub async fn run_after_test(&self, ctx: &TestContext) -> Result<(), Failure> {
        let hook_ctx = HookContext::test(ctx);
        let mut first_failure = None;
        for every in [false, true] {
            let tier = self.table.tier(
                HookScope::Test,
                HookDirection::After,
                every,
                Some(ctx.assembly()),
                Some(ctx.class_name()),
            );
            for hook in tier {
                if let Err(failure) = self.invoke(&hook, hook_ctx.clone()).await {
                    first_failure.get_or_insert(failure);
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Mark a registered test complete, closing its class and assembly when due
    ///
    /// A failing After tier is charged to the test whose completion closed it.
    pub async fn finish_test(&self, unit: &TestUnit) -> Result<(), Failure> {
        let key = (unit.assembly.clone(), unit.class_name.clone());
        let closing = {
            let mut tracker = self.tracker();
            let sealed = tracker.sealed;
            match tracker.classes.get_mut(&key) {
                Some(class) => {
                    class.completed += 1;
                    Self::try_close_class(class, sealed)
                }
                None => None,
            }
        };

        match closing {
            Some(started) => self.close_class(&key.0, &key.1, started).await,
            None => Ok(()),
        }
    }

    fn try_close_class(class: &mut ClassScope, sealed: bool) -> Option<bool> {
        if sealed && !class.closed && class.completed >= class.registered {
            class.closed = true;
            Some(class.before.initialized())
        } else {
            None
        }
    }

    async fn close_class(&self, assembly: &str, class_name: &str, started: bool) -> Result<(), Failure> {
        let mut result = Ok(());
        if started {
            result = self
                .run_scope(HookScope::Class, HookDirection::After, Some(assembly), Some(class_name))
                .await;
        }
        debug!("Closed class scope {}::{}", assembly, class_name);

        let closing = {
            let mut tracker = self.tracker();
            let sealed = tracker.sealed;
            tracker.assemblies.get_mut(assembly).and_then(|a| {
                a.open_classes = a.open_classes.saturating_sub(1);
                Self::try_close_assembly(a, sealed)
            })
        };
        if let Some(started) = closing {
            let assembly_result = self.close_assembly(assembly, started).await;
            if result.is_ok() {
                result = assembly_result;
            }
        }
        result
    }

    fn try_close_assembly(assembly: &mut AssemblyScope, sealed: bool) -> Option<bool> {
        if sealed && !assembly.closed && assembly.open_classes == 0 {
            assembly.closed = true;
            Some(assembly.before.initialized())
        } else {
            None
        }
    }

    async fn close_assembly(&self, assembly: &str, started: bool) -> Result<(), Failure> {
        debug!("Closing assembly scope {}", assembly);
        if started {
            self.run_scope(HookScope::Assembly, HookDirection::After, Some(assembly), None)
                .await
        } else {
            Ok(())
        }
    }

    /// Discovery is complete; close every scope whose tests are all done
    pub async fn seal(&self) {
        let classes: Vec<((String, String), bool)> = {
            let mut tracker = self.tracker();
            tracker.sealed = true;
            let mut due: Vec<((String, String), bool)> = tracker
                .classes
                .iter_mut()
                .filter_map(|(key, class)| {
                    Self::try_close_class(class, true).map(|started| (key.clone(), started))
                })
                .collect();
            due.sort_by(|a, b| a.0.cmp(&b.0));
            due
        };
        for ((assembly, class_name), started) in classes {
            if let Err(failure) = self.close_class(&assembly, &class_name, started).await {
                self.record(format!("{assembly}::{class_name}"), &failure);
            }
        }

        // Assemblies that never saw a class
        let assemblies: Vec<(String, bool)> = {
            let mut tracker = self.tracker();
            tracker
                .assemblies
                .iter_mut()
                .filter_map(|(name, a)| Self::try_close_assembly(a, true).map(|s| (name.clone(), s)))
                .collect()
        };
        for (assembly, started) in assemblies {
            if let Err(failure) = self.close_assembly(&assembly, started).await {
                self.record(assembly, &failure);
            }
        }
    }

    /// End of session: force-close what is still open, then run the session After tier
    pub async fn run_after_session(&self) {
        let classes: Vec<((String, String), bool)> = {
            let mut tracker = self.tracker();
            tracker.sealed = true;
            let mut open: Vec<((String, String), bool)> = tracker
                .classes
                .iter_mut()
                .filter(|(_, c)| !c.closed)
                .map(|(key, class)| {
                    class.closed = true;
                    (key.clone(), class.before.initialized())
                })
                .collect();
            open.sort_by(|a, b| a.0.cmp(&b.0));
            open
        };
        for ((assembly, class_name), started) in classes {
            if let Err(failure) = self.close_class(&assembly, &class_name, started).await {
                self.record(format!("{assembly}::{class_name}"), &failure);
            }
        }

        if self.session.initialized() {
            if let Err(failure) = self
                .run_scope(HookScope::Session, HookDirection::After, None, None)
                .await
            {
                self.record("session".to_string(), &failure);
            }
        }
    }

    /// Hook failures that could not be charged to any test
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn record(&self, subject: String, failure: &Failure) {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Diagnostic::new(DiagnosticKind::Hook, subject, failure.message.clone()));
    }

    /// Run the every and declared tiers of one scope instance
    async fn run_scope(
        &self,
        scope: HookScope,
        direction: HookDirection,
        assembly: Option<&str>,
        class_name: Option<&str>,
    ) -> Result<(), Failure> {
        let ctx = match scope {
            HookScope::Session => HookContext::session(),
            HookScope::Assembly => HookContext::assembly(assembly.unwrap_or_default()),
            _ => HookContext::class(assembly.unwrap_or_default(), class_name.unwrap_or_default()),
        };
        let order = match direction {
            HookDirection::Before => [true, false],
            HookDirection::After => [false, true],
        };

        let mut first_failure = None;
        for every in order {
            for hook in self.table.tier(scope, direction, every, assembly, class_name) {
                if let Err(failure) = self.invoke(&hook, ctx.clone()).await {
                    // Before tiers stop at the first failure; After tiers always finish
                    if direction == HookDirection::Before {
                        return Err(failure);
                    }
                    first_failure.get_or_insert(failure);
                }
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    async fn invoke(&self, hook: &HookDescriptor, ctx: HookContext) -> Result<(), Failure> {
        debug!("Running {} {} hook '{}'", hook.direction, hook.scope, hook.name);
        let outcome = match tokio::spawn((hook.callback)(ctx)).await {
            Ok(result) => result,
            Err(e) => Err(format!("hook panicked: {e}")),
        };
        outcome.map_err(|message| {
            let error = EngineError::HookFailure {
                hook: hook.name.clone(),
                scope: hook.scope,
                direction: hook.direction,
                message,
            };
            warn!("{}", error);
            Failure::from(error)
        })?;
        if hook.scope != HookScope::Test {
            info!("{} {} hook '{}' completed", hook.direction, hook.scope, hook.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextSeed;
    use crate::models::FailureKind;

    type Journal = Arc<Mutex<Vec<String>>>;

    fn journaled(
        journal: &Journal,
        name: &str,
        scope: HookScope,
        direction: HookDirection,
    ) -> HookDescriptor {
        let journal = journal.clone();
        let label = name.to_string();
        HookDescriptor::new(name, scope, direction, move |_| {
            let journal = journal.clone();
            let label = label.clone();
            async move {
                journal.lock().unwrap().push(label);
                Ok(())
            }
        })
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_before_tiers_run_outermost_first_and_once() {
        let journal = Journal::default();
        let table = HookTable::new(vec![
            journaled(&journal, "class-declared", HookScope::Class, HookDirection::Before)
                .in_class("default", "K"),
            journaled(&journal, "class-every", HookScope::Class, HookDirection::Before),
            journaled(&journal, "assembly-every", HookScope::Assembly, HookDirection::Before),
            journaled(&journal, "session-every", HookScope::Session, HookDirection::Before),
        ]);
        let hooks = HookOrchestrator::new(table);
        let a = TestUnit::new("a").in_class("K");
        let b = TestUnit::new("b").in_class("K");

        hooks.run_before_scopes(&a).await.unwrap();
        hooks.run_before_scopes(&b).await.unwrap();

        assert_eq!(
            entries(&journal),
            vec!["session-every", "assembly-every", "class-every", "class-declared"]
        );
    }

    #[tokio::test]
    async fn test_class_hook_failure_scoped_to_its_class() {
        let failing = HookDescriptor::before("connect", HookScope::Class, |_| async {
            Err("no database".to_string())
        })
        .in_class("default", "Broken");
        let hooks = HookOrchestrator::new(HookTable::new(vec![failing]));

        let broken_a = TestUnit::new("a").in_class("Broken");
        let broken_b = TestUnit::new("b").in_class("Broken");
        let healthy = TestUnit::new("c").in_class("Healthy");

        let failure = hooks.run_before_scopes(&broken_a).await.unwrap_err();
        assert_eq!(
            failure.kind,
            FailureKind::Hook {
                scope: HookScope::Class,
                direction: HookDirection::Before
            }
        );
        assert!(hooks.run_before_scopes(&broken_b).await.is_err());
        assert!(hooks.run_before_scopes(&healthy).await.is_ok());
    }

    #[tokio::test]
    async fn test_after_class_runs_when_last_test_finishes() {
        let journal = Journal::default();
        let table = HookTable::new(vec![
            journaled(&journal, "before-class", HookScope::Class, HookDirection::Before),
            journaled(&journal, "after-class", HookScope::Class, HookDirection::After),
            journaled(&journal, "after-assembly", HookScope::Assembly, HookDirection::After),
            journaled(&journal, "after-session", HookScope::Session, HookDirection::After),
        ]);
        let hooks = HookOrchestrator::new(table);
        let a = TestUnit::new("a").in_class("K");
        let b = TestUnit::new("b").in_class("K");
        hooks.register(&a);
        hooks.register(&b);

        hooks.run_before_scopes(&a).await.unwrap();
        hooks.finish_test(&a).await.unwrap();
        hooks.seal().await;
        assert_eq!(entries(&journal), vec!["before-class"]);

        hooks.run_before_scopes(&b).await.unwrap();
        hooks.finish_test(&b).await.unwrap();
        hooks.run_after_session().await;
        assert_eq!(
            entries(&journal),
            vec!["before-class", "after-class", "after-assembly", "after-session"]
        );
    }

    #[tokio::test]
    async fn test_after_test_hooks_all_run() {
        let journal = Journal::default();
        let failing = HookDescriptor::after("explode", HookScope::Test, |_| async {
            Err("teardown failed".to_string())
        })
        .order(10);
        let table = HookTable::new(vec![
            journaled(&journal, "cleanup", HookScope::Test, HookDirection::After),
            failing,
        ]);
        let hooks = HookOrchestrator::new(table);
        let unit = TestUnit::new("a");
        let ctx = ContextSeed::default().attempt(&unit, 1);

        let failure = hooks.run_after_test(&ctx).await.unwrap_err();
        assert!(failure.message.contains("teardown failed"));
        assert_eq!(entries(&journal), vec!["cleanup"]);
    }

    #[tokio::test]
    async fn test_unclaimed_after_failure_becomes_diagnostic() {
        let failing = HookDescriptor::after("flush", HookScope::Session, |_| async {
            Err("disk full".to_string())
        });
        let hooks = HookOrchestrator::new(HookTable::new(vec![failing]));
        let unit = TestUnit::new("a");
        hooks.register(&unit);
        hooks.run_before_scopes(&unit).await.unwrap();
        hooks.finish_test(&unit).await.unwrap();
        hooks.run_after_session().await;

        let diagnostics = hooks.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::Hook);
        assert!(diagnostics[0].message.contains("disk full"));
    }
}
