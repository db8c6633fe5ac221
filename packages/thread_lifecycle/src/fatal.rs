use std::sync::{PoisonError, RwLock};

use derive_more::Display;
use thiserror::Error;

/// Identifies which contract a [`FatalReport`] is about.
///
/// The display form is stable and suitable for matching in log processing.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum FatalCode {
    /// The host allocator could not provide memory for a new allocator page.
    #[display("allocation-failed")]
    AllocationFailed,

    /// A [`PoolAllocator`][crate::PoolAllocator] was reset while objects were still live.
    #[display("allocator-reset-while-in-use")]
    AllocatorResetWhileInUse,

    /// The page scale of a [`PoolAllocator`][crate::PoolAllocator] was changed while objects
    /// were still live.
    #[display("allocator-reconfigured-in-use")]
    AllocatorReconfiguredInUse,

    /// A page scale of zero, or one that overflows the page size, was requested.
    #[display("invalid-page-scale")]
    InvalidPageScale,

    /// A [`PoolAllocator`][crate::PoolAllocator] was asked to deallocate more slots than it
    /// has handed out.
    #[display("double-free")]
    DoubleFree,

    /// The current thread's allocator for a type was requested while it was already in use
    /// further up the same call stack.
    #[display("allocator-reentered")]
    AllocatorReentered,

    /// More workers arrived at a [`Barrier`][crate::Barrier] in one cycle than it expects.
    #[display("barrier-overfilled")]
    BarrierOverfilled,

    /// A [`Barrier`][crate::Barrier] was released before all expected workers arrived.
    #[display("barrier-released-early")]
    BarrierReleasedEarly,

    /// The expected worker count of a [`Barrier`][crate::Barrier] was changed mid-cycle.
    #[display("barrier-reconfigured-mid-cycle")]
    BarrierReconfiguredMidCycle,

    /// A second workspace of the same type was created on one thread.
    #[display("workspace-already-exists")]
    WorkspaceAlreadyExists,

    /// A workspace was recycled on a thread that does not own it.
    #[display("workspace-not-owned")]
    WorkspaceNotOwned,

    /// An object was registered for exit-time destruction after the thread's storage was
    /// already being torn down.
    #[display("registry-torn-down")]
    RegistryTornDown,

    /// A thread was assigned a role when it already had one.
    #[display("role-already-assigned")]
    RoleAlreadyAssigned,
}

/// Describes a detected contract violation.
///
/// Every report is passed to the installed [`FatalReporter`] before the operation that
/// detected the violation is aborted.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("{component} [{code}]: {message}")]
pub struct FatalReport {
    component: &'static str,
    code: FatalCode,
    message: String,
}

impl FatalReport {
    /// Name of the component that detected the violation, e.g. `"Barrier"`.
    #[must_use]
    pub fn component(&self) -> &'static str {
        self.component
    }

    /// The violated contract.
    #[must_use]
    pub fn code(&self) -> FatalCode {
        self.code
    }

    /// Human-readable details, including the offending values where known.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Receives every [`FatalReport`] before the failing operation is aborted.
///
/// The reporter cannot prevent the abort. It exists to route the report to whatever
/// diagnostics destination the runtime uses.
pub type FatalReporter = fn(&FatalReport);

static REPORTER: RwLock<FatalReporter> = RwLock::new(log_fatal_report);

/// Installs the process-wide fatal error reporter, returning the previous one.
///
/// The default reporter is [`log_fatal_report()`].
///
/// # Example
///
/// ```
/// use thread_lifecycle::{FatalReport, log_fatal_report, set_fatal_reporter};
///
/// fn to_stderr(report: &FatalReport) {
///     eprintln!("fatal: {report}");
/// }
///
/// let previous = set_fatal_reporter(to_stderr);
/// # set_fatal_reporter(previous);
/// ```
pub fn set_fatal_reporter(reporter: FatalReporter) -> FatalReporter {
    let mut current = REPORTER.write().unwrap_or_else(PoisonError::into_inner);
    std::mem::replace(&mut *current, reporter)
}

/// The default [`FatalReporter`], emitting the report as a `tracing` error event.
pub fn log_fatal_report(report: &FatalReport) {
    tracing::error!(
        component = report.component,
        code = %report.code,
        "{}",
        report.message
    );
}

/// Hands a report to the installed reporter without aborting anything.
///
/// For callers that have their own way of terminating, e.g. the allocation failure handler.
#[cold]
pub(crate) fn report(
    component: &'static str,
    code: FatalCode,
    message: impl Into<String>,
) -> FatalReport {
    let report = FatalReport {
        component,
        code,
        message: message.into(),
    };

    // Copy the fn pointer out so a reporter that panics cannot poison the lock.
    let reporter = *REPORTER.read().unwrap_or_else(PoisonError::into_inner);
    reporter(&report);

    report
}

/// Reports a contract violation and aborts the current operation.
#[cold]
#[track_caller]
pub(crate) fn fatal(component: &'static str, code: FatalCode, message: impl Into<String>) -> ! {
    let report = report(component, code, message);
    panic!("{report}");
}
