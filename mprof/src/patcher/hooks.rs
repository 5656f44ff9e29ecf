//! Hook ABI between generated trampolines and the tracing backend.
//!
//! Trampolines call plain `extern "C"` functions with an opaque interceptor
//! pointer. [`Hooks::of`] produces adaptor functions that cast that pointer
//! back to a concrete [`Interceptor`], so backends implement a safe trait
//! and never see the raw calling convention.

#![allow(unsafe_code)] // the adaptors dereference the interceptor pointer

use std::any::Any;
use std::ffi::c_void;
use std::sync::Arc;

/// Called on entry with the address of the slot holding the return address,
/// the entry timestamp, and the patched function's identity.
pub type OnEnterFn = unsafe extern "C" fn(
    interceptor: *mut c_void,
    stack_ptr: *const *const c_void,
    timestamp: u64,
    callee: *const c_void,
);

/// Called on exit with the same stack slot address as the matching entry.
/// Returns the address the trampoline must return to.
pub type OnExitFn =
    unsafe extern "C" fn(interceptor: *mut c_void, stack_ptr: *const *const c_void, timestamp: u64) -> *const c_void;

/// Receiver of entry/exit events from patched functions.
///
/// Both methods run on the instrumented thread in the middle of the patched
/// call, so they must not panic and should return quickly.
pub trait Interceptor: Send + Sync + 'static {
    /// `stack_ptr` points at the caller's return address, which is still
    /// in place when this runs.
    fn on_enter(&self, stack_ptr: *const *const c_void, timestamp: u64, callee: *const c_void);

    /// `stack_ptr` is the slot the return address was in on entry; it may
    /// have been overwritten since. The return value is where control
    /// resumes.
    fn on_exit(&self, stack_ptr: *const *const c_void, timestamp: u64) -> *const c_void;
}

/// Pair of hook functions a trampoline is generated against.
#[derive(Clone, Copy)]
pub struct Hooks {
    pub on_enter: OnEnterFn,
    pub on_exit: OnExitFn,
}

impl Hooks {
    /// Adaptors dispatching to `I`.
    #[must_use]
    pub fn of<I: Interceptor>() -> Self {
        Self { on_enter: enter_adaptor::<I>, on_exit: exit_adaptor::<I> }
    }
}

unsafe extern "C" fn enter_adaptor<I: Interceptor>(
    interceptor: *mut c_void,
    stack_ptr: *const *const c_void,
    timestamp: u64,
    callee: *const c_void,
) {
    // SAFETY: trampolines are only generated with a pointer obtained from
    // an InterceptorHandle for the same I, which keeps it alive
    let interceptor = unsafe { &*interceptor.cast::<I>() };
    interceptor.on_enter(stack_ptr, timestamp, callee);
}

unsafe extern "C" fn exit_adaptor<I: Interceptor>(
    interceptor: *mut c_void,
    stack_ptr: *const *const c_void,
    timestamp: u64,
) -> *const c_void {
    // SAFETY: see enter_adaptor
    let interceptor = unsafe { &*interceptor.cast::<I>() };
    interceptor.on_exit(stack_ptr, timestamp)
}

/// Shared reference to an interceptor together with its hooks.
///
/// Every patch holds a clone, which keeps the interceptor alive for as long
/// as any trampoline may still call into it.
#[derive(Clone)]
pub struct InterceptorHandle {
    instance: *mut c_void,
    hooks: Hooks,
    _owner: Arc<dyn Any + Send + Sync>,
}

// SAFETY: instance points into the Arc held by _owner, whose pointee is
// Send + Sync
unsafe impl Send for InterceptorHandle {}
// SAFETY: see above
unsafe impl Sync for InterceptorHandle {}

impl InterceptorHandle {
    #[must_use]
    pub fn new<I: Interceptor>(interceptor: Arc<I>) -> Self {
        let instance = Arc::as_ptr(&interceptor).cast_mut().cast::<c_void>();
        Self { instance, hooks: Hooks::of::<I>(), _owner: interceptor }
    }

    /// Opaque pointer passed as the first hook argument
    #[must_use]
    pub fn instance(&self) -> *mut c_void {
        self.instance
    }

    #[must_use]
    pub fn hooks(&self) -> Hooks {
        self.hooks
    }
}

impl std::fmt::Debug for InterceptorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorHandle").field("instance", &self.instance).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(usize, u64, usize)>>,
    }

    impl Interceptor for Recorder {
        fn on_enter(&self, stack_ptr: *const *const c_void, timestamp: u64, callee: *const c_void) {
            self.events.lock().unwrap().push((stack_ptr as usize, timestamp, callee as usize));
        }

        fn on_exit(&self, stack_ptr: *const *const c_void, timestamp: u64) -> *const c_void {
            self.events.lock().unwrap().push((stack_ptr as usize, timestamp, 0));
            0x7777 as *const c_void
        }
    }

    #[test]
    fn test_adaptors_dispatch_to_interceptor() {
        let recorder = Arc::new(Recorder::default());
        let handle = InterceptorHandle::new(Arc::clone(&recorder));
        let hooks = handle.hooks();

        // SAFETY: the handle keeps the recorder alive and matches the hooks
        let returned = unsafe {
            (hooks.on_enter)(handle.instance(), 0x100 as *const *const c_void, 10, 0x4000 as *const c_void);
            (hooks.on_exit)(handle.instance(), 0x100 as *const *const c_void, 25)
        };

        assert_eq!(returned as usize, 0x7777);
        assert_eq!(*recorder.events.lock().unwrap(), vec![(0x100, 10, 0x4000), (0x100, 25, 0)]);
    }

    #[test]
    fn test_handle_keeps_interceptor_alive() {
        let recorder = Arc::new(Recorder::default());
        let handle = InterceptorHandle::new(Arc::clone(&recorder));

        assert_eq!(Arc::strong_count(&recorder), 2);
        drop(handle);
        assert_eq!(Arc::strong_count(&recorder), 1);
    }
}
