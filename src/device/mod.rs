//! Device modules and their life-cycle hooks
//!
//! A device module drives one instrument. Modules are registered by name in
//! the global [`DeviceCatalog`] before anything runs; a [`DeviceSet`] holds
//! the modules a script uses, in the order they were requested, and runs
//! their hooks with the ordering rules the experiment life cycle needs:
//! setup hooks in request order, cleanup hooks in strict reverse order for
//! every module whose setup hook succeeded, and every cleanup attempted even
//! after a failure.

pub mod simulated;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{DeviceError, DeviceResult};
use crate::interpreter::{RunMode, Value};

/// One instrument driver.
///
/// All hooks are optional; the defaults do nothing.
pub trait Device: Send {
    /// Module name as registered in the catalog.
    fn name(&self) -> &str;

    /// EDL functions this module provides.
    fn functions(&self) -> &[&'static str] {
        &[]
    }

    /// Call one of the functions listed by [`Device::functions`].
    fn call(&mut self, function: &str, args: &[Value], mode: RunMode) -> DeviceResult<Value> {
        let _ = (args, mode);
        Err(DeviceError::Call {
            module: self.name().to_string(),
            message: format!("no function '{function}'"),
        })
    }

    /// Before the test run.
    fn test_hook(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    /// After the test run.
    fn end_of_test_hook(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    /// Before the real run, in the supervising process.
    fn exp_hook(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    /// After the real run, in the supervising process.
    fn end_of_exp_hook(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    /// When the module is unloaded.
    fn exit_hook(&mut self) -> DeviceResult<()> {
        Ok(())
    }

    /// In the worker process, just before it reports that it has finished.
    fn child_exit_hook(&mut self) -> DeviceResult<()> {
        Ok(())
    }
}

/// Factory that creates a fresh module instance.
pub type DeviceFactory = Arc<dyn Fn() -> Box<dyn Device> + Send + Sync>;

/// Global catalog of device module factories.
pub struct DeviceCatalog {
    factories: RwLock<HashMap<String, DeviceFactory>>,
}

static CATALOG: Lazy<DeviceCatalog> = Lazy::new(|| {
    let catalog = DeviceCatalog::new();
    simulated::register(&catalog);
    catalog
});

impl DeviceCatalog {
    fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Access the global catalog singleton.
    pub fn global() -> &'static Self {
        &CATALOG
    }

    /// Register a module under `name`, replacing any earlier registration.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Device> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(name.to_string(), Arc::new(factory));
    }

    /// Register a module type that implements `Default`.
    pub fn register_default<T>(&self, name: &str)
    where
        T: Device + Default + 'static,
    {
        self.register(name, || Box::new(T::default()));
    }

    /// Instantiate the module registered under `name`.
    pub fn create(&self, name: &str) -> DeviceResult<Box<dyn Device>> {
        let factory = self
            .factories
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownModule(name.to_string()))?;
        Ok(factory())
    }

    /// Whether a module is registered under `name`.
    pub fn has_module(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// Names of all registered modules, sorted.
    pub fn list_modules(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum HookSet {
    Test,
    EndOfTest,
    Exp,
    EndOfExp,
    Exit,
    ChildExit,
}

impl HookSet {
    fn name(self) -> &'static str {
        match self {
            HookSet::Test => "test_hook",
            HookSet::EndOfTest => "end_of_test_hook",
            HookSet::Exp => "exp_hook",
            HookSet::EndOfExp => "end_of_exp_hook",
            HookSet::Exit => "exit_hook",
            HookSet::ChildExit => "child_exit_hook",
        }
    }

    fn invoke(self, device: &mut dyn Device) -> DeviceResult<()> {
        match self {
            HookSet::Test => device.test_hook(),
            HookSet::EndOfTest => device.end_of_test_hook(),
            HookSet::Exp => device.exp_hook(),
            HookSet::EndOfExp => device.end_of_exp_hook(),
            HookSet::Exit => device.exit_hook(),
            HookSet::ChildExit => device.child_exit_hook(),
        }
    }
}

struct Slot {
    device: Box<dyn Device>,
    test_ran: bool,
    exp_ran: bool,
}

/// The modules used by one script, in request order.
#[derive(Default)]
pub struct DeviceSet {
    slots: Vec<Slot>,
}

impl std::fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl DeviceSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiate the named modules from the global catalog.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> DeviceResult<Self> {
        let catalog = DeviceCatalog::global();
        let mut set = Self::new();
        for name in names {
            set.push(catalog.create(name.as_ref())?);
        }
        Ok(set)
    }

    /// Append a module.
    pub fn push(&mut self, device: Box<dyn Device>) {
        self.slots.push(Slot {
            device,
            test_ran: false,
            exp_ran: false,
        });
    }

    /// Module names in request order.
    pub fn names(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|slot| slot.device.name().to_string())
            .collect()
    }

    /// Number of modules.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the set holds no modules.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Whether any module provides `function`.
    pub fn has_function(&self, function: &str) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.device.functions().contains(&function))
    }

    /// Call `function` on the first module providing it. Returns `None` if
    /// no module does.
    pub fn call(
        &mut self,
        function: &str,
        args: &[Value],
        mode: RunMode,
    ) -> Option<DeviceResult<Value>> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.device.functions().contains(&function))?;
        Some(slot.device.call(function, args, mode))
    }

    /// Run setup hooks in request order, stopping at the first failure.
    fn run_setup(&mut self, hooks: HookSet) -> DeviceResult<()> {
        for slot in &mut self.slots {
            run_hook(hooks, slot.device.as_mut())?;
            match hooks {
                HookSet::Test => slot.test_ran = true,
                HookSet::Exp => slot.exp_ran = true,
                _ => {}
            }
        }
        Ok(())
    }

    /// Run cleanup hooks in reverse request order on every module selected
    /// by `eligible`, collecting failures.
    fn run_cleanup(&mut self, hooks: HookSet, eligible: fn(&mut Slot) -> bool) -> DeviceResult<()> {
        let mut failures = Vec::new();
        for slot in self.slots.iter_mut().rev() {
            if !eligible(slot) {
                debug!(module = slot.device.name(), hook = hooks.name(), "skipped");
                continue;
            }
            if let Err(err) = run_hook(hooks, slot.device.as_mut()) {
                warn!(error = %err, "cleanup hook failed");
                failures.push(err);
            }
        }
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(DeviceError::Aggregate(failures)),
        }
    }

    /// Run every module's `test_hook`.
    pub fn run_test_hooks(&mut self) -> DeviceResult<()> {
        self.run_setup(HookSet::Test)
    }

    /// Run `end_of_test_hook` for every module whose `test_hook` succeeded.
    pub fn run_end_of_test_hooks(&mut self) -> DeviceResult<()> {
        self.run_cleanup(HookSet::EndOfTest, |slot| std::mem::take(&mut slot.test_ran))
    }

    /// Run every module's `exp_hook`.
    pub fn run_exp_hooks(&mut self) -> DeviceResult<()> {
        self.run_setup(HookSet::Exp)
    }

    /// Run `end_of_exp_hook` for every module whose `exp_hook` succeeded.
    pub fn run_end_of_exp_hooks(&mut self) -> DeviceResult<()> {
        self.run_cleanup(HookSet::EndOfExp, |slot| std::mem::take(&mut slot.exp_ran))
    }

    /// Run every module's `child_exit_hook` (worker process only).
    pub fn run_child_exit_hooks(&mut self) -> DeviceResult<()> {
        self.run_cleanup(HookSet::ChildExit, |_| true)
    }

    /// Run every module's `exit_hook`.
    pub fn shutdown(&mut self) -> DeviceResult<()> {
        self.run_cleanup(HookSet::Exit, |_| true)
    }
}

fn run_hook(hooks: HookSet, device: &mut dyn Device) -> DeviceResult<()> {
    debug!(module = device.name(), hook = hooks.name(), "running hook");
    hooks.invoke(device).map_err(|err| match err {
        err @ DeviceError::Hook { .. } => err,
        other => DeviceError::Hook {
            module: device.name().to_string(),
            hook: hooks.name(),
            message: other.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        journal: Journal,
        fail_exp: bool,
        fail_end_of_exp: bool,
    }

    impl Recorder {
        fn boxed(name: &'static str, journal: &Journal) -> Box<dyn Device> {
            Box::new(Self {
                name,
                journal: journal.clone(),
                fail_exp: false,
                fail_end_of_exp: false,
            })
        }

        fn log(&self, hook: &str) {
            self.journal.lock().push(format!("{}:{hook}", self.name));
        }
    }

    impl Device for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn exp_hook(&mut self) -> DeviceResult<()> {
            self.log("exp");
            if self.fail_exp {
                return Err(DeviceError::Call {
                    module: self.name.to_string(),
                    message: "no power".into(),
                });
            }
            Ok(())
        }

        fn end_of_exp_hook(&mut self) -> DeviceResult<()> {
            self.log("end_of_exp");
            if self.fail_end_of_exp {
                return Err(DeviceError::Call {
                    module: self.name.to_string(),
                    message: "stuck".into(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_cleanup_runs_in_reverse_and_skips_failed_setup() {
        let journal = Journal::default();
        let mut set = DeviceSet::new();
        set.push(Recorder::boxed("a", &journal));
        set.push(Recorder::boxed("b", &journal));
        set.push(Box::new(Recorder {
            name: "c",
            journal: journal.clone(),
            fail_exp: true,
            fail_end_of_exp: false,
        }));
        set.push(Recorder::boxed("d", &journal));

        let err = set.run_exp_hooks().unwrap_err();
        assert!(matches!(err, DeviceError::Hook { hook: "exp_hook", .. }));
        set.run_end_of_exp_hooks().unwrap();

        assert_eq!(
            *journal.lock(),
            vec!["a:exp", "b:exp", "c:exp", "b:end_of_exp", "a:end_of_exp"]
        );
    }

    #[test]
    fn test_every_cleanup_runs_after_failures() {
        let journal = Journal::default();
        let mut set = DeviceSet::new();
        for name in ["a", "b", "c"] {
            set.push(Box::new(Recorder {
                name,
                journal: journal.clone(),
                fail_exp: false,
                fail_end_of_exp: name != "b",
            }));
        }
        set.run_exp_hooks().unwrap();
        match set.run_end_of_exp_hooks() {
            Err(DeviceError::Aggregate(failures)) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(journal.lock().len(), 6);
        // a second call has nothing left to clean up
        set.run_end_of_exp_hooks().unwrap();
        assert_eq!(journal.lock().len(), 6);
    }

    #[test]
    fn test_catalog_lookup() {
        let catalog = DeviceCatalog::global();
        assert!(catalog.has_module("sim_meter"));
        assert!(matches!(
            DeviceSet::from_names(&["no_such_module"]),
            Err(DeviceError::UnknownModule(_))
        ));
        let set = DeviceSet::from_names(&["sim_meter"]).unwrap();
        assert!(set.has_function("sim_meter_read"));
        assert!(!set.has_function("print"));
    }
}
