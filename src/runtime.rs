//! Runtime state: the phase machine, allocator table, tracking lists, small-int
//! cache, exit callbacks and audit hooks of one runtime instance.
//!
//! Phases advance strictly in order:
//!
//! ```text
//! Uninitialized -> PreInitializing -> PreInitialized -> CoreInitialized -> Initialized
//!       ^                                                                      |
//!       +--------------------------- finalize() -------------------------------+
//! ```
//!
//! Finalization clears every phase flag except `has_run_before`. Audit hooks,
//! the allocator table, the small-int cache and the unicode index counter
//! survive it; the interpreter id counter restarts on the next core
//! initialization.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_utils::atomic::AtomicCell;
use modular_bitfield::prelude::*;
use parking_lot::Mutex;

use crate::allocator::Allocators;
use crate::config::{AllocatorName, PreConfig};
use crate::error::RuntimeError;
use crate::exec_lock::{ContextId, ExecutionLock};
use crate::gc::GcState;
use crate::gcref::ObjRef;
use crate::globals::NEXITFUNCS;
use crate::small_ints::SmallIntCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    PreInitializing,
    PreInitialized,
    CoreInitialized,
    Initialized,
    Finalizing,
}

#[bitfield(bits = 8)]
#[derive(Clone, Copy)]
pub struct PhaseFlags {
    pub preinitializing: bool,
    pub preinitialized: bool,
    pub core_initialized: bool,
    pub initialized: bool,
    pub finalizing: bool,
    pub has_run_before: bool,
    #[skip]
    __: B2,
}

impl PhaseFlags {
    pub fn phase(&self) -> Phase {
        if self.finalizing() {
            Phase::Finalizing
        } else if self.initialized() {
            Phase::Initialized
        } else if self.core_initialized() {
            Phase::CoreInitialized
        } else if self.preinitialized() {
            Phase::PreInitialized
        } else if self.preinitializing() {
            Phase::PreInitializing
        } else {
            Phase::Uninitialized
        }
    }
}

pub type ExitFunc = Box<dyn FnOnce() + Send>;
/// Called with an event name and its arguments; an `Err` vetoes the event.
pub type AuditHook = Arc<dyn Fn(&str, &[&str]) -> Result<(), String> + Send + Sync>;

/// Fixed-capacity stack of exit callbacks.
struct ExitFuncs {
    slots: [Option<ExitFunc>; NEXITFUNCS],
    len: usize,
}

impl ExitFuncs {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            len: 0,
        }
    }

    fn push(&mut self, func: ExitFunc) -> Result<(), RuntimeError> {
        if self.len == NEXITFUNCS {
            return Err(RuntimeError::ExitFuncsFull {
                capacity: NEXITFUNCS,
            });
        }
        self.slots[self.len] = Some(func);
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<ExitFunc> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        self.slots[self.len].take()
    }
}

pub struct RuntimeState {
    phases: Mutex<PhaseFlags>,
    /// Context running `finalize`, readable without the phase lock.
    finalizing: AtomicCell<Option<ContextId>>,
    config: Mutex<PreConfig>,
    allocators: Allocators,
    gc: Mutex<GcState>,
    small_ints: OnceLock<SmallIntCache>,
    exit_funcs: Mutex<ExitFuncs>,
    audit_hooks: Mutex<Vec<AuditHook>>,
    exec_lock: ExecutionLock,
    next_unicode_index: AtomicUsize,
    next_interpreter_id: AtomicI64,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self::with_allocators(Allocators::new())
    }

    pub fn with_allocators(allocators: Allocators) -> Self {
        Self {
            phases: Mutex::new(PhaseFlags::new()),
            finalizing: AtomicCell::new(None),
            config: Mutex::new(PreConfig::default()),
            allocators,
            gc: Mutex::new(GcState::new()),
            small_ints: OnceLock::new(),
            exit_funcs: Mutex::new(ExitFuncs::new()),
            audit_hooks: Mutex::new(Vec::new()),
            exec_lock: ExecutionLock::new(),
            next_unicode_index: AtomicUsize::new(0),
            next_interpreter_id: AtomicI64::new(0),
        }
    }

    /// The process-wide instance.
    pub fn global() -> &'static RuntimeState {
        crate::global::runtime()
    }

    pub fn phase(&self) -> Phase {
        self.phases.lock().phase()
    }

    pub fn has_run_before(&self) -> bool {
        self.phases.lock().has_run_before()
    }

    pub fn allocators(&self) -> &Allocators {
        &self.allocators
    }

    pub fn gc(&self) -> &Mutex<GcState> {
        &self.gc
    }

    pub fn exec_lock(&self) -> &ExecutionLock {
        &self.exec_lock
    }

    pub fn config(&self) -> PreConfig {
        self.config.lock().clone()
    }

    /// Context that started finalization, if it has begun.
    pub fn finalizing(&self) -> Option<ContextId> {
        self.finalizing.load()
    }

    pub fn is_finalizing(&self) -> bool {
        self.finalizing().is_some()
    }

    fn log_phase(&self, what: &str) {
        let level = if self.config.lock().verbose {
            log::Level::Info
        } else {
            log::Level::Debug
        };
        log::log!(level, "runtime {}", what);
    }

    fn expect_phase(flags: &PhaseFlags, expected: Phase) -> Result<(), RuntimeError> {
        let found = flags.phase();
        if found != expected {
            return Err(RuntimeError::InvalidPhase { expected, found });
        }
        Ok(())
    }

    /// Apply `config` and install its allocator configuration.
    pub fn pre_initialize(&self, config: PreConfig) -> Result<(), RuntimeError> {
        let mut phases = self.phases.lock();
        Self::expect_phase(&phases, Phase::Uninitialized)?;
        phases.set_preinitializing(true);
        self.finalizing.store(None);

        let name = config.effective_allocator();
        let installed = self.allocators.current_name() == Some(name.as_str());
        if name != AllocatorName::NotSet && !installed {
            if let Err(err) = self.allocators.setup(name) {
                phases.set_preinitializing(false);
                log::warn!("pre-initialization failed: {}", err);
                return Err(err.into());
            }
        }
        *self.config.lock() = config;
        phases.set_preinitializing(false);
        phases.set_preinitialized(true);
        drop(phases);
        self.log_phase("pre-initialized");
        Ok(())
    }

    /// Build the small-int cache and reset per-start counters.
    pub fn initialize_core(&self) -> Result<(), RuntimeError> {
        let mut phases = self.phases.lock();
        Self::expect_phase(&phases, Phase::PreInitialized)?;
        self.next_interpreter_id.store(0, Ordering::Relaxed);
        self.small_ints.get_or_init(SmallIntCache::new);
        phases.set_core_initialized(true);
        drop(phases);
        self.log_phase("core initialized");
        Ok(())
    }

    pub fn initialize(&self) -> Result<(), RuntimeError> {
        let mut phases = self.phases.lock();
        Self::expect_phase(&phases, Phase::CoreInitialized)?;
        phases.set_initialized(true);
        drop(phases);
        self.log_phase("initialized");
        Ok(())
    }

    /// All three phases in order.
    pub fn start(&self, config: PreConfig) -> Result<(), RuntimeError> {
        self.pre_initialize(config)?;
        self.initialize_core()?;
        self.initialize()
    }

    /// Tear the runtime down. Does nothing unless the runtime is initialized
    /// and not already finalizing, so it is safe to call repeatedly or without
    /// a prior start.
    pub fn finalize(&self) -> Result<(), RuntimeError> {
        {
            let mut phases = self.phases.lock();
            if !phases.initialized() || phases.finalizing() {
                log::debug!("runtime finalize skipped in phase {:?}", phases.phase());
                return Ok(());
            }
            phases.set_finalizing(true);
        }
        self.finalizing.store(Some(ContextId::current()));
        self.log_phase("finalizing");

        let mut ran = 0usize;
        loop {
            // callbacks may register further callbacks
            let next = self.exit_funcs.lock().pop();
            match next {
                Some(func) => {
                    func();
                    ran += 1;
                }
                None => break,
            }
        }
        log::debug!("ran {} exit callbacks", ran);
        if cfg!(not(feature = "unchecked-contracts")) {
            log::debug!("[{} refs]", crate::header::total_refs());
        }

        *self.phases.lock() = PhaseFlags::new().with_has_run_before(true);
        self.log_phase("finalized");
        Ok(())
    }

    /// Push a callback run by [`RuntimeState::finalize`], most recent first.
    pub fn register_exit_func(
        &self,
        func: impl FnOnce() + Send + 'static,
    ) -> Result<(), RuntimeError> {
        let result = self.exit_funcs.lock().push(Box::new(func));
        if let Err(err) = &result {
            log::warn!("exit callback rejected: {}", err);
        }
        result
    }

    pub fn exit_funcs_len(&self) -> usize {
        self.exit_funcs.lock().len
    }

    /// Install an audit hook. Existing hooks see a `sys.addaudithook` event
    /// first and may veto the addition.
    pub fn add_audit_hook(
        &self,
        hook: impl Fn(&str, &[&str]) -> Result<(), String> + Send + Sync + 'static,
    ) -> Result<(), RuntimeError> {
        if let Err(err) = self.audit("sys.addaudithook", &[]) {
            log::warn!("audit hook not added: {}", err);
            return Err(err);
        }
        self.audit_hooks.lock().push(Arc::new(hook));
        Ok(())
    }

    /// Raise `event` to every hook in installation order, stopping at the first
    /// rejection.
    pub fn audit(&self, event: &str, args: &[&str]) -> Result<(), RuntimeError> {
        let hooks = self.audit_hooks.lock().clone();
        for hook in hooks.iter() {
            hook(event, args).map_err(|reason| RuntimeError::AuditRejected {
                event: event.to_owned(),
                reason,
            })?;
        }
        Ok(())
    }

    pub fn audit_hook_count(&self) -> usize {
        self.audit_hooks.lock().len()
    }

    /// Cached immortal int for `value`, `None` when `value` is outside the
    /// cached range.
    pub fn small_int(&self, value: i64) -> Result<Option<ObjRef>, RuntimeError> {
        if !self.phases.lock().core_initialized() {
            return Err(RuntimeError::NotInitialized);
        }
        let cache = self.small_ints.get().ok_or(RuntimeError::NotInitialized)?;
        Ok(cache.get(value))
    }

    /// Next index for interned unicode runtime data. Keeps counting across
    /// restarts.
    pub fn next_unicode_index(&self) -> usize {
        self.next_unicode_index.fetch_add(1, Ordering::Relaxed)
    }

    pub fn new_interpreter_id(&self) -> Result<i64, RuntimeError> {
        if !self.phases.lock().core_initialized() {
            return Err(RuntimeError::NotInitialized);
        }
        Ok(self.next_interpreter_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::MALLOC;
    use crate::error::{AllocatorError, ConfigError};
    use std::sync::atomic::AtomicBool;

    fn started() -> RuntimeState {
        let rt = RuntimeState::with_allocators(Allocators::with(&MALLOC, &MALLOC));
        rt.start(PreConfig::default()).unwrap();
        rt
    }

    #[test]
    fn phases_advance_in_order() {
        let rt = RuntimeState::new();
        assert_eq!(rt.phase(), Phase::Uninitialized);
        assert_eq!(
            rt.initialize(),
            Err(RuntimeError::InvalidPhase {
                expected: Phase::CoreInitialized,
                found: Phase::Uninitialized
            })
        );
        rt.pre_initialize(PreConfig::default()).unwrap();
        assert_eq!(rt.phase(), Phase::PreInitialized);
        assert!(rt.pre_initialize(PreConfig::default()).is_err());
        rt.initialize_core().unwrap();
        assert_eq!(rt.phase(), Phase::CoreInitialized);
        rt.initialize().unwrap();
        assert_eq!(rt.phase(), Phase::Initialized);
        assert!(!rt.is_finalizing());
    }

    #[test]
    fn finalize_without_start_is_a_noop() {
        let rt = RuntimeState::new();
        rt.finalize().unwrap();
        rt.finalize().unwrap();
        assert_eq!(rt.phase(), Phase::Uninitialized);
        assert!(!rt.has_run_before());
    }

    #[test]
    fn finalize_runs_exit_funcs_lifo_and_remembers() {
        let rt = started();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            rt.register_exit_func(move || order.lock().push(i)).unwrap();
        }
        rt.finalize().unwrap();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert_eq!(rt.phase(), Phase::Uninitialized);
        assert!(rt.has_run_before());
        assert_eq!(rt.finalizing(), Some(ContextId::current()));
        rt.finalize().unwrap();
        assert_eq!(order.lock().len(), 3);
    }

    #[test]
    fn exit_func_capacity_is_enforced() {
        let rt = RuntimeState::new();
        let fired = Arc::new(AtomicBool::new(false));
        for _ in 0..NEXITFUNCS {
            let fired = Arc::clone(&fired);
            rt.register_exit_func(move || fired.store(true, Ordering::Relaxed))
                .unwrap();
        }
        assert_eq!(
            rt.register_exit_func(|| {}),
            Err(RuntimeError::ExitFuncsFull {
                capacity: NEXITFUNCS
            })
        );
        assert_eq!(rt.exit_funcs_len(), NEXITFUNCS);
    }

    #[test]
    fn restart_keeps_unicode_ids_and_resets_interpreter_ids() {
        let rt = started();
        assert_eq!(rt.new_interpreter_id(), Ok(0));
        assert_eq!(rt.new_interpreter_id(), Ok(1));
        let first = rt.next_unicode_index();
        rt.finalize().unwrap();
        assert_eq!(rt.new_interpreter_id(), Err(RuntimeError::NotInitialized));
        rt.start(PreConfig::default()).unwrap();
        assert_eq!(rt.new_interpreter_id(), Ok(0));
        assert!(rt.next_unicode_index() > first);
        assert!(!rt.is_finalizing());
    }

    #[test]
    fn small_ints_need_core_initialization() {
        let rt = RuntimeState::new();
        assert_eq!(rt.small_int(1).err(), Some(RuntimeError::NotInitialized));
        rt.pre_initialize(PreConfig::default()).unwrap();
        rt.initialize_core().unwrap();
        let minus_five = rt.small_int(-5).unwrap().unwrap();
        assert!(minus_five.is_immortal());
        assert!(rt.small_int(-6).unwrap().is_none());
        assert!(rt.small_int(257).unwrap().is_none());
        assert_eq!(
            rt.small_int(256).unwrap().unwrap(),
            rt.small_int(256).unwrap().unwrap()
        );
    }

    #[test]
    fn small_ints_are_unavailable_after_finalize() {
        let rt = started();
        let seven = rt.small_int(7).unwrap().unwrap();
        rt.finalize().unwrap();
        assert_eq!(rt.small_int(7).err(), Some(RuntimeError::NotInitialized));
        rt.start(PreConfig::default()).unwrap();
        assert_eq!(rt.small_int(7).unwrap().unwrap(), seven);
    }

    #[test]
    fn audit_hooks_can_veto_new_hooks() {
        let rt = RuntimeState::new();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let log = Arc::clone(&seen);
        rt.add_audit_hook(move |event, _| {
            log.lock().push(event.to_owned());
            if event == "sys.addaudithook" {
                Err("locked down".to_owned())
            } else {
                Ok(())
            }
        })
        .unwrap();
        rt.audit("open", &["/etc/passwd"]).unwrap();
        assert_eq!(
            rt.add_audit_hook(|_, _| Ok(())),
            Err(RuntimeError::AuditRejected {
                event: "sys.addaudithook".into(),
                reason: "locked down".into()
            })
        );
        assert_eq!(rt.audit_hook_count(), 1);
        assert_eq!(*seen.lock(), vec!["open", "sys.addaudithook"]);
    }

    #[test]
    fn audit_hooks_survive_restart() {
        let rt = started();
        rt.add_audit_hook(|_, _| Ok(())).unwrap();
        rt.finalize().unwrap();
        rt.start(PreConfig::default()).unwrap();
        assert_eq!(rt.audit_hook_count(), 1);
    }

    #[test]
    fn pre_initialize_installs_named_allocators() {
        let rt = RuntimeState::with_allocators(Allocators::with(&MALLOC, &MALLOC));
        rt.pre_initialize(PreConfig::default().with_allocator(AllocatorName::MallocDebug))
            .unwrap();
        assert_eq!(rt.allocators().current_name(), Some("malloc_debug"));
        assert_eq!(rt.config().allocator, AllocatorName::MallocDebug);

        let used = RuntimeState::with_allocators(Allocators::with(&MALLOC, &MALLOC));
        let block = used
            .allocators()
            .malloc(crate::allocator::Domain::Raw, 8)
            .unwrap();
        let err = used
            .pre_initialize(PreConfig::default().with_dev_mode(true))
            .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Config(ConfigError::Allocator(AllocatorError::DomainInUse(
                crate::allocator::Domain::Raw
            )))
        );
        assert_eq!(used.phase(), Phase::Uninitialized);
        unsafe {
            used.allocators()
                .free(crate::allocator::Domain::Raw, block.as_ptr())
        };
    }
}
