//! Ad-hoc scope guards.
//!
//! [`scope_exit!`] runs code unconditionally at the end of a scope.
//! [`ScopeGuard`] does the same, but can be dismissed beforehand,
//! which is handy for rollback code that must only run on failure.

#![warn(missing_docs)]

use std::mem::ManuallyDrop;

/// Guard that calls a function when dropped, unless dismissed.
///
/// # Examples
///
/// ```
/// # use scope_exit::ScopeGuard;
/// use std::cell::Cell;
/// let rolled_back = Cell::new(false);
/// {
///     let guard = ScopeGuard::new(|| rolled_back.set(true));
///     guard.dismiss();
/// }
/// assert!(!rolled_back.get());
/// ```
#[must_use = "the guard runs immediately if it is not bound"]
pub struct ScopeGuard<F>
    where F: FnOnce()
{
    f: ManuallyDrop<F>,
    armed: bool,
}

impl<F> ScopeGuard<F>
    where F: FnOnce()
{
    /// Create a guard that calls `f` when it is dropped.
    pub fn new(f: F) -> Self
    {
        Self{f: ManuallyDrop::new(f), armed: true}
    }

    /// Drop the guard without calling the function.
    pub fn dismiss(mut self)
    {
        self.armed = false;
        // SAFETY: self.f will not be used anymore;
        // drop below does not touch it because armed is false.
        unsafe { ManuallyDrop::drop(&mut self.f); }
    }
}

impl<F> Drop for ScopeGuard<F>
    where F: FnOnce()
{
    fn drop(&mut self)
    {
        if self.armed {
            // SAFETY: self.f will not be used anymore.
            let f = unsafe { ManuallyDrop::take(&mut self.f) };
            f();
        }
    }
}

/// Define an ad-hoc scope guard.
///
/// The code passed to this macro is performed at the end of the scope.
/// It is performed when the scope ends or when a panic passes through.
///
/// # Examples
///
/// ```
/// # use scope_exit::scope_exit;
/// use std::cell::Cell;
/// let x = Cell::new(0);
/// {
///     scope_exit! { x.set(1); }
///     x.set(2);
/// }
/// assert_eq!(x.get(), 1);
/// ```
#[macro_export]
macro_rules! scope_exit
{
    { $($tt:tt)* } => {
        let __scope_exit = $crate::ScopeGuard::new(|| { $($tt)* });
    };
}
